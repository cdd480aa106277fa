//! Cooperative cancellation primitives.
//!
//! A [`CancellationToken`] is a cheap, cloneable, read-only view onto a
//! cancellation flag owned by a source ([`ManualCancellationSource`] or
//! [`TimeoutCancellationSource`]). The flag is monotonic: it flips from
//! `false` to `true` exactly once and never reverts.
//!
//! Consumers may poll ([`CancellationToken::is_cancellation_requested`]),
//! propagate ([`CancellationToken::error_if_cancellation_requested`]),
//! await ([`CancellationToken::cancelled`]), or subscribe
//! ([`CancellationToken::add_cancel_listener`]). Listeners run exactly once,
//! in registration order, and failures are aggregated rather than aborting
//! the notification loop.
//!
//! # Example
//!
//! ```
//! use keel_coordination::ManualCancellationSource;
//!
//! let source = ManualCancellationSource::new();
//! let token = source.token();
//!
//! token.add_cancel_listener(Box::new(|| {
//!     println!("Cancelled!");
//!     Ok(())
//! }));
//!
//! source.cancel().unwrap();
//! assert!(token.is_cancellation_requested());
//! ```

use super::*;

mod aggregate;
mod source;

pub use source::{ManualCancellationSource, TimeoutCancellationSource};

use std::{
    collections::BTreeMap,
    pin::pin,
    sync::atomic::{AtomicBool, Ordering},
};

/// Callback invoked at most once when cancellation is requested.
pub type CancelListener = Box<dyn FnOnce() -> core::result::Result<(), BoxError> + Send>;

/// Receipt for a registered cancel listener, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: BTreeMap<u64, CancelListener>,
}

pub(crate) struct Core {
    cancelled: AtomicBool,
    registry: Mutex<Registry>,
    notify: tokio::sync::Notify,
}

impl Core {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            registry: Mutex::new(Registry::default()),
            notify: tokio::sync::Notify::new(),
        })
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// First call flips the flag and runs every currently-registered
    /// listener once, in registration order, collecting failures. Later
    /// calls are silent no-ops.
    pub(crate) fn cancel(&self) -> core::result::Result<(), AggregateError> {
        let listeners = {
            let mut registry = self.registry.lock().trace_expect("Failed to lock mutex");
            if self.cancelled.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            std::mem::take(&mut registry.listeners)
        };
        self.notify.notify_waiters();

        let mut failures = Vec::new();
        for (_, listener) in listeners {
            if let Err(e) = listener() {
                failures.push(e);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(AggregateError(failures))
        }
    }
}

/// Read-only handle representing a possibly-future cooperative
/// cancellation request.
#[derive(Clone)]
pub struct CancellationToken {
    core: Option<Arc<Core>>,
}

impl CancellationToken {
    /// A token that is never cancelled and ignores listener registration.
    ///
    /// Safe default root for call graphs that have no cancellation scope.
    pub fn none() -> Self {
        Self { core: None }
    }

    pub(crate) fn from_core(core: Arc<Core>) -> Self {
        Self { core: Some(core) }
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.core.as_ref().is_some_and(|core| core.is_cancelled())
    }

    /// `Err(Error::Cancelled)` iff cancellation has been requested,
    /// otherwise a no-op.
    pub fn error_if_cancellation_requested(&self) -> Result<()> {
        if self.is_cancellation_requested() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Registers `listener` to run when cancellation is requested.
    ///
    /// If the token is already cancelled, the listener runs immediately on
    /// the calling thread and any failure is logged rather than returned.
    /// This closes the subscribe/cancel race for composite tokens.
    pub fn add_cancel_listener(&self, listener: CancelListener) -> ListenerHandle {
        let Some(core) = &self.core else {
            return ListenerHandle(0);
        };
        {
            let mut registry = core.registry.lock().trace_expect("Failed to lock mutex");
            if !core.is_cancelled() {
                registry.next_id += 1;
                let id = registry.next_id;
                registry.listeners.insert(id, listener);
                return ListenerHandle(id);
            }
        }
        if let Err(e) = listener() {
            warn!("Cancel listener failed on already-cancelled token: {e}");
        }
        ListenerHandle(0)
    }

    /// Removes a listener registered with
    /// [`add_cancel_listener`](CancellationToken::add_cancel_listener).
    /// No-op if the listener has already fired or been removed.
    pub fn remove_cancel_listener(&self, handle: ListenerHandle) {
        if let Some(core) = &self.core {
            core.registry
                .lock()
                .trace_expect("Failed to lock mutex")
                .listeners
                .remove(&handle.0);
        }
    }

    /// Completes when cancellation is requested.
    ///
    /// Completes immediately if already cancelled; never completes for
    /// [`CancellationToken::none`].
    pub async fn cancelled(&self) {
        let Some(core) = &self.core else {
            return std::future::pending().await;
        };
        loop {
            let mut notified = pin!(core.notify.notified());
            notified.as_mut().enable();
            if core.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::none()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field(
                "cancellation_requested",
                &self.is_cancellation_requested(),
            )
            .finish()
    }
}
