#![doc = include_str!("../README.md")]

pub mod faulty;
pub mod tracing;

pub use faulty::{Fault, FaultCounters, FaultyConnector, FaultyStore};
