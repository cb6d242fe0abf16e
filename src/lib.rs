//! Specular: a speculative-RPC coordination engine.
//!
//! # Overview
//!
//! A client issues an RPC and immediately resumes execution against a guessed
//! reply. Dependent local work, and further RPCs derived from it, proceed in
//! parallel with the network round trip. When the real reply arrives it is
//! reconciled against the guess: a match retroactively validates the
//! speculative work; a mismatch invalidates the speculative computation and
//! everything causally derived from it, then re-runs the continuation chain
//! once with the authoritative value.
//!
//! # Core Guarantees
//!
//! - **No observable misspeculation**: the application's final result is a
//!   committed value or a failure, never a guess
//! - **Cascading rollback**: aborting a call atomically aborts every
//!   still-pending descendant; discarded side effects are tracked per call
//! - **Indistinguishable runs**: a continuation cannot tell a speculative run
//!   from a replacement run
//! - **Bounded re-execution**: retry depth is configured; exhaustion surfaces
//!   as an error, not a loop
//! - **Deterministic testing**: manual clocks, capturing transports, and a
//!   `BTreeMap` ledger keep every interleaving replayable
//!
//! # Module Structure
//!
//! - [`types`]: Core types (identifiers, logical time)
//! - [`record`]: Call records and the call state machine
//! - [`ledger`]: Per-tree speculation ledger, abort cascade, commit cascade
//! - [`continuation`]: The continuation contract and provided adapters
//! - [`transport`]: The transport seam and its test doubles
//! - [`facade`]: The speculative facade: dispatch, reconciliation, delivery
//! - [`retry`]: Retry admission for aborted chains
//! - [`config`]: Engine configuration
//! - [`stats`]: Prediction statistics
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```
//! use specular::{EngineConfig, FnTransport, IdentityContinuation, SpecFacade};
//! use specular::types::Endpoint;
//! use std::sync::Arc;
//!
//! // A transport that doubles the request.
//! let transport = Arc::new(FnTransport::new(|_: &Endpoint, req: &u32| Ok(req * 2)));
//! let facade: SpecFacade<u32, u32> = SpecFacade::new(transport, EngineConfig::new());
//!
//! // Guess correctly and the speculative run is the only run.
//! let handle = facade
//!     .invoke("doubler", 21, Box::new(IdentityContinuation::new()), |req| req * 2)
//!     .unwrap();
//! assert_eq!(handle.try_result(), Some(Ok(42)));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]

pub mod config;
pub mod continuation;
pub mod error;
pub mod facade;
pub mod ledger;
pub mod record;
pub mod retry;
pub mod stats;
pub mod test_utils;
pub mod transport;
pub mod types;

// Re-exports for convenient access to core types
pub use config::{EngineConfig, Matcher, DEFAULT_MAX_RETRY_DEPTH};
pub use continuation::{Binding, Continuation, FnContinuation, IdentityContinuation};
pub use error::{Error, ErrorKind, Recoverability, Result, TransportError};
pub use facade::{RootHandle, SpecContext, SpecFacade};
pub use ledger::{LedgerStats, SpecLedger};
pub use record::{AbortReason, CallRecord, CallState, SideEffect};
pub use retry::{RetryCoordinator, RetryVerdict};
pub use stats::{SpecStats, StatsSnapshot};
pub use transport::{FnTransport, LabTransport, ReplySink, Transport};
pub use types::{CallId, Endpoint, FacadeId, ManualClock, SystemClock, Time, TimeSource};
