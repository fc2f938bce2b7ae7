//! Platform-independent building blocks for the powpeg test harness.
//!
//! This crate provides the error taxonomy, the retry/polling combinator,
//! port allocation and readiness probing, the HSM JSON-TCP client and the
//! process traits implemented by platform-specific crates.

mod config;
mod error;
mod hsm;
mod output;
mod ports;
mod probe;
mod process;
mod retry;

pub use config::*;
pub use error::*;
pub use hsm::*;
pub use output::*;
pub use ports::*;
pub use probe::*;
pub use process::*;
pub use retry::*;
