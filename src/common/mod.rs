//! Common utilities and types shared across reefkv

pub mod config;
pub mod error;

pub use config::{CoreConfig, StaleShardPolicy};
pub use error::{CancellationReason, Error, Result};
