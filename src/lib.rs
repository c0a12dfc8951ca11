pub mod config;
pub mod control;
pub mod error;
pub mod master;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;
pub mod transport;
pub mod worker;

pub use error::{GolemError, Result};
