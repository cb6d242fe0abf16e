//! Core types shared across the engine.
//!
//! - [`id`]: type-safe identifiers for calls, facades, and endpoints
//! - [`time`]: logical time and clock sources

pub mod id;
pub mod time;

pub use id::{CallId, Endpoint, FacadeId};
pub use time::{ManualClock, SystemClock, Time, TimeSource};
