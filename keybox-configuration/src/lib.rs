#![doc = include_str!("../README.md")]

mod compression;
mod error;
mod settings;

pub use compression::Compression;
pub use error::ConfigError;
pub use settings::{ConnectionPool, RateLimiting, Retry, Settings};
