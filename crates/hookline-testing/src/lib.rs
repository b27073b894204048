//! Test infrastructure for deterministic engine testing.
//!
//! Provides event builders with realistic payloads, scripted handlers that
//! fail in every way a real handler can, a store with injectable write
//! failures, and a [`TestEnv`] that wires a running engine to a
//! controllable clock.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod env;
pub mod fixtures;
pub mod handlers;
pub mod store;

pub use env::TestEnv;
pub use fixtures::{sample_payload, EventBuilder, TEST_SHOP};
pub use handlers::{Outcome, ScriptedHandler};
pub use hookline_core::{Clock, TestClock};
pub use store::FaultyStore;
