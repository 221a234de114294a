#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

mod builder;
mod connector;
mod glob;
pub mod metrics;
mod pubsub;
mod server;
mod store;

pub use builder::MemoryConnectorBuilder;
pub use connector::MemoryConnector;
pub use moka::policy::EvictionPolicy;
pub use pubsub::{MemoryMessage, MemorySubscriber};
pub use server::MemoryServer;
pub use store::MemoryStore;
