#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

mod connector;
mod database;
pub mod error;
mod server;

#[doc(inline)]
pub use crate::connector::{RedisConnector, RedisConnectorBuilder};
#[doc(inline)]
pub use crate::database::RedisDatabase;
#[doc(inline)]
pub use crate::server::RedisServer;
