//! Concurrency coordination core for the Keel backend toolkit.
//!
//! This crate provides the in-process, single-node coordination primitives
//! the rest of the toolkit builds on:
//!
//! - **Cancellation**: [`CancellationToken`] read-only handles with a
//!   listener registry, owned by [`ManualCancellationSource`] or
//!   [`TimeoutCancellationSource`], composable with
//!   [`CancellationToken::aggregate`].
//! - **Execution contexts**: [`ExecutionContext`], an immutable chain of
//!   nodes threading cancellation and structured-logging labels through
//!   call graphs without global state.
//! - **Admission control**: [`AdmissionController`], a weighted
//!   rate/concurrency limiter that grants, queues and settles two-phase
//!   capacity reservations under timeout and cancellation.
//!
//! # Example
//!
//! ```no_run
//! use keel_coordination::{limiter, AdmissionController, AccrueOptions, ManualCancellationSource};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let controller = AdmissionController::new(&limiter::Config {
//!     parallel: std::num::NonZeroUsize::new(4),
//!     ..Default::default()
//! })
//! .unwrap();
//!
//! let source = ManualCancellationSource::new();
//! let token = controller
//!     .accrue_token_lazy(AccrueOptions {
//!         timeout: Some(std::time::Duration::from_millis(250)),
//!         cancellation_token: source.token(),
//!         ..Default::default()
//!     })
//!     .await
//!     .unwrap();
//!
//! // ... do the admitted work ...
//!
//! token.commit();
//! # });
//! ```

pub mod cancellation;
pub mod error;
pub mod execution_context;
pub mod lifecycle;
pub mod limiter;

use std::sync::{Arc, Mutex};
use trace_err::*;
use tracing::warn;

// Re-export for consistency
pub use async_trait::async_trait;

pub use cancellation::{CancellationToken, ManualCancellationSource, TimeoutCancellationSource};
pub use error::{AggregateError, BoxError, Error, Result};
pub use execution_context::ExecutionContext;
pub use lifecycle::Disposable;
pub use limiter::{AccrueOptions, AdmissionController, Token};
