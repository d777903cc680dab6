pub mod clock;
pub mod common;
pub mod config;
pub mod drlink;
pub mod dtx;
pub mod error;
pub mod health;
pub mod latency;
pub mod log;
pub mod message;
pub mod queue;
pub mod recovery;
pub mod service;
pub mod transport;
pub mod tx_desc;

pub use error::{Error, Result};
