use super::*;

/// Owning side of a [`CancellationToken`], cancelled explicitly.
///
/// The source is a one-way state machine: Active until the first
/// [`cancel()`](ManualCancellationSource::cancel), Cancelled forever after.
pub struct ManualCancellationSource {
    core: Arc<Core>,
}

impl ManualCancellationSource {
    pub fn new() -> Self {
        Self { core: Core::new() }
    }

    /// A read-only token observing this source.
    pub fn token(&self) -> CancellationToken {
        CancellationToken::from_core(self.core.clone())
    }

    /// Requests cancellation.
    ///
    /// The first call flips the flag and runs every currently-registered
    /// listener exactly once, in registration order. A failing listener
    /// does not affect the flag or the remaining listeners; all failures
    /// are returned together as an [`AggregateError`]. Second and later
    /// calls are silent no-ops.
    pub fn cancel(&self) -> core::result::Result<(), AggregateError> {
        self.core.cancel()
    }
}

impl Default for ManualCancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ManualCancellationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualCancellationSource")
            .field("cancellation_requested", &self.core.is_cancelled())
            .finish()
    }
}

/// A [`ManualCancellationSource`] armed with a timer that cancels the
/// token when the timeout elapses.
///
/// Must be constructed within a tokio runtime. After
/// [`stop_timer()`](TimeoutCancellationSource::stop_timer) it behaves as a
/// plain manual source.
pub struct TimeoutCancellationSource {
    inner: ManualCancellationSource,
    timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TimeoutCancellationSource {
    pub fn new(timeout: std::time::Duration) -> Self {
        let inner = ManualCancellationSource::new();
        let core = inner.core.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Err(e) = core.cancel() {
                warn!("Cancel listener failed on timeout: {e}");
            }
        });
        Self {
            inner,
            timer: Mutex::new(Some(timer)),
        }
    }

    /// Disarms the timer without cancelling.
    pub fn stop_timer(&self) {
        if let Some(timer) = self
            .timer
            .lock()
            .trace_expect("Failed to lock mutex")
            .take()
        {
            timer.abort();
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.inner.token()
    }

    /// Cancels immediately, disarming the timer first.
    pub fn cancel(&self) -> core::result::Result<(), AggregateError> {
        self.stop_timer();
        self.inner.cancel()
    }
}

impl std::fmt::Debug for TimeoutCancellationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutCancellationSource")
            .field(
                "cancellation_requested",
                &self.inner.core.is_cancelled(),
            )
            .finish()
    }
}
