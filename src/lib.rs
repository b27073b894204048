//! Hookline service wiring.
//!
//! Loads configuration, provides the built-in audit handler and reads
//! newline-delimited webhook requests into a running engine. The binary in
//! `main.rs` ties these together.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod config;
pub mod intake;

pub use audit::AuditHandler;
pub use config::Config;
pub use intake::{InboundEvent, IntakeSummary};
