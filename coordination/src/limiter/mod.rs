//! Weighted admission controller.
//!
//! An [`AdmissionController`] gatekeeps a shared capacity described by one
//! or more independently-configured limits ([`Config`]): time-window rates
//! (`per_second`, `per_minute`, `per_hour`, `per_timespan`) and a
//! parallel-slot bound (`parallel`). A reservation must fit **every**
//! configured limit at once; reservations are atomic, so a failed attempt
//! never leaves a partial hold behind.
//!
//! Grants are two-phase: the caller receives a [`Token`] and later settles
//! it with `commit()` or `rollback()`. Callers that do not fit immediately
//! can queue with [`AdmissionController::accrue_token_lazy`], bounded by a
//! timeout and a [`CancellationToken`]; queued waiters are granted in FIFO
//! order as capacity frees.
//!
//! # Example
//!
//! ```no_run
//! use keel_coordination::{limiter, AdmissionController};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let controller = AdmissionController::new(&limiter::Config {
//!     per_second: std::num::NonZeroUsize::new(100),
//!     parallel: std::num::NonZeroUsize::new(8),
//!     ..Default::default()
//! })
//! .unwrap();
//!
//! let token = controller
//!     .accrue_token_immediately(std::num::NonZeroUsize::MIN)
//!     .unwrap();
//! // ... do the admitted work ...
//! token.commit();
//! # });
//! ```

use super::*;

mod config;
mod strategy;
mod token;

pub use config::{Config, TimespanConfig};
pub use token::Token;

use std::{
    collections::{HashMap, VecDeque},
    num::NonZeroUsize,
    pin::pin,
    time::Duration,
};
use strategy::{Kind, Strategy};
use token::Hold;

/// Options for [`AdmissionController::accrue_token_lazy`].
///
/// `timeout: None` waits indefinitely; the default cancellation token is
/// [`CancellationToken::none`].
#[derive(Debug)]
pub struct AccrueOptions {
    pub weight: NonZeroUsize,
    pub timeout: Option<Duration>,
    pub cancellation_token: CancellationToken,
}

impl Default for AccrueOptions {
    fn default() -> Self {
        Self {
            weight: NonZeroUsize::MIN,
            timeout: None,
            cancellation_token: CancellationToken::none(),
        }
    }
}

pub(crate) enum Settlement {
    Commit,
    Rollback,
}

struct Waiter {
    id: u64,
    weight: NonZeroUsize,
    tx: tokio::sync::oneshot::Sender<Result<Token>>,
}

struct WindowHold {
    strategy: usize,
    weight: usize,
}

// A reservation prepared under the lock; window timers are spawned by
// `Shared::issue` once the grant is certain.
struct Granted {
    holds: Vec<Hold>,
    timers: Vec<(u64, Duration)>,
}

struct State {
    strategies: Vec<Strategy>,
    waiters: VecDeque<Waiter>,
    window_holds: HashMap<u64, WindowHold>,
    next_id: u64,
    disposed: bool,
}

impl State {
    /// Atomic all-or-nothing reservation across every strategy. On failure
    /// every reservation taken in this attempt is rolled back before
    /// returning.
    fn try_grant(&mut self, weight: usize) -> Option<Granted> {
        for idx in 0..self.strategies.len() {
            if !self.strategies[idx].try_reserve(weight) {
                for prior in 0..idx {
                    self.strategies[prior].release(weight);
                }
                return None;
            }
        }

        let mut holds = Vec::with_capacity(self.strategies.len());
        let mut timers = Vec::new();
        for (idx, strategy) in self.strategies.iter().enumerate() {
            match strategy.kind {
                Kind::Parallel => holds.push(Hold {
                    strategy: idx,
                    window_hold: None,
                }),
                Kind::TimeWindow(window) => {
                    self.next_id += 1;
                    let id = self.next_id;
                    self.window_holds.insert(id, WindowHold {
                        strategy: idx,
                        weight,
                    });
                    holds.push(Hold {
                        strategy: idx,
                        window_hold: Some(id),
                    });
                    timers.push((id, window));
                }
            }
        }
        Some(Granted { holds, timers })
    }

    fn remove_waiter(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|waiter| waiter.id == id) {
            Some(position) => {
                self.waiters.remove(position);
                true
            }
            None => false,
        }
    }

    fn is_drained(&self) -> bool {
        self.strategies.iter().all(|s| s.outstanding == 0)
    }
}

pub(crate) struct Shared {
    state: Mutex<State>,
    drained: tokio::sync::Notify,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().trace_expect("Failed to lock mutex")
    }

    // Arms the window-release timers and mints the token
    fn issue(self: &Arc<Self>, weight: NonZeroUsize, granted: Granted) -> Token {
        for (hold_id, window) in granted.timers {
            let shared = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                shared.release_window_hold(hold_id);
            });
        }
        metrics::counter!("admission_grants").increment(1);
        Token::new(self.clone(), weight, granted.holds)
    }

    /// Re-attempts queued waiters head-first after a release.
    ///
    /// The whole queue is re-scanned on every release, matching the
    /// original wake algorithm; a waiter blocked on one strategy can
    /// therefore sit behind a heavier one blocked on another. Returns
    /// tokens whose waiters vanished; the caller drops them after
    /// releasing the lock, because their rollback re-enters the lock.
    fn sweep(self: &Arc<Self>, state: &mut State) -> Vec<Token> {
        let mut rejected = Vec::new();
        let mut remaining = VecDeque::with_capacity(state.waiters.len());
        while let Some(waiter) = state.waiters.pop_front() {
            match state.try_grant(waiter.weight.get()) {
                Some(granted) => {
                    let token = self.issue(waiter.weight, granted);
                    if let Err(Ok(token)) = waiter.tx.send(Ok(token)) {
                        rejected.push(token);
                    }
                }
                None => remaining.push_back(waiter),
            }
        }
        state.waiters = remaining;
        rejected
    }

    fn release_window_hold(self: &Arc<Self>, hold_id: u64) {
        let rejected = {
            let mut state = self.lock();
            let Some(hold) = state.window_holds.remove(&hold_id) else {
                // Already rolled back
                return;
            };
            state.strategies[hold.strategy].release(hold.weight);
            let rejected = self.sweep(&mut state);
            self.signal_if_drained(&state);
            rejected
        };
        drop(rejected);
    }

    pub(crate) fn settle(self: &Arc<Self>, holds: &[Hold], weight: usize, settlement: Settlement) {
        let rejected = {
            let mut state = self.lock();
            for hold in holds {
                match hold.window_hold {
                    // Parallel slot: frees on either settlement
                    None => state.strategies[hold.strategy].release(weight),
                    Some(id) => match settlement {
                        // Weight stays consumed until the window elapses
                        Settlement::Commit => {}
                        Settlement::Rollback => {
                            // No-op if the window timer fired first
                            if state.window_holds.remove(&id).is_some() {
                                state.strategies[hold.strategy].release(weight);
                            }
                        }
                    },
                }
            }
            let rejected = self.sweep(&mut state);
            self.signal_if_drained(&state);
            rejected
        };
        drop(rejected);
    }

    async fn abandon_waiter(
        &self,
        id: u64,
        rx: tokio::sync::oneshot::Receiver<Result<Token>>,
        error: Error,
    ) -> Result<Token> {
        if self.lock().remove_waiter(id) {
            match &error {
                Error::Timeout => metrics::counter!("admission_timeouts").increment(1),
                Error::Cancelled => metrics::counter!("admission_cancellations").increment(1),
                _ => {}
            }
            return Err(error);
        }
        // Lost the race: the waiter was already resolved, surface that
        // outcome instead of leaking a granted token
        rx.await.trace_expect("Waiter resolved without an outcome")
    }

    fn signal_if_drained(&self, state: &State) {
        if state.disposed && state.is_drained() {
            self.drained.notify_waiters();
        }
    }
}

/// Gatekeeper granting or queueing requests for shared weighted capacity.
///
/// Construct with [`AdmissionController::new`]; dispose with
/// [`dispose()`](AdmissionController::dispose) when the service shuts
/// down. All methods are safe to call concurrently; timers require a
/// tokio runtime.
pub struct AdmissionController {
    shared: Arc<Shared>,
}

impl AdmissionController {
    pub fn new(config: &Config) -> Result<Self> {
        let strategies = config.build()?;

        metrics::describe_counter!(
            "admission_grants",
            metrics::Unit::Count,
            "Total number of granted admission tokens"
        );
        metrics::describe_counter!(
            "admission_rejections",
            metrics::Unit::Count,
            "Total number of admission attempts rejected for lack of capacity"
        );
        metrics::describe_counter!(
            "admission_timeouts",
            metrics::Unit::Count,
            "Total number of queued admission attempts that timed out"
        );
        metrics::describe_counter!(
            "admission_cancellations",
            metrics::Unit::Count,
            "Total number of queued admission attempts cancelled by their token"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    strategies,
                    waiters: VecDeque::new(),
                    window_holds: HashMap::new(),
                    next_id: 0,
                    disposed: false,
                }),
                drained: tokio::sync::Notify::new(),
            }),
        })
    }

    /// The largest weight any reservation could ever hold: the minimum of
    /// the configured limits.
    pub fn max_weight(&self) -> usize {
        self.shared
            .lock()
            .strategies
            .iter()
            .map(|s| s.max_weight)
            .min()
            .unwrap_or(0)
    }

    /// The weight currently grantable: the minimum available weight across
    /// the configured limits.
    pub fn available_weight(&self) -> usize {
        self.shared
            .lock()
            .strategies
            .iter()
            .map(|s| s.available_weight())
            .min()
            .unwrap_or(0)
    }

    /// Attempts an atomic reservation of `weight` across every limit.
    ///
    /// Either every limit has room and a [`Token`] is granted, or no hold
    /// survives and the call fails with [`Error::LimitExceeded`]. Never
    /// waits.
    pub fn accrue_token_immediately(&self, weight: NonZeroUsize) -> Result<Token> {
        let granted = {
            let mut state = self.shared.lock();
            if state.disposed {
                return Err(Error::InvalidOperation(
                    "admission controller is disposed",
                ));
            }
            state.try_grant(weight.get())
        };
        match granted {
            Some(granted) => Ok(self.shared.issue(weight, granted)),
            None => {
                metrics::counter!("admission_rejections").increment(1);
                Err(Error::LimitExceeded)
            }
        }
    }

    /// Reserves `options.weight`, queueing until capacity frees.
    ///
    /// Tries the immediate path first. On failure the caller joins a FIFO
    /// queue and waits for whichever comes first: a grant, the timeout
    /// ([`Error::Timeout`]), the cancellation token firing
    /// ([`Error::Cancelled`]), or disposal ([`Error::Disposed`]). The
    /// waiter leaves the queue exactly once no matter which terminal event
    /// wins the race. A weight no configuration could ever grant fails
    /// fast with [`Error::LimitExceeded`] instead of waiting out the
    /// timeout.
    pub async fn accrue_token_lazy(&self, options: AccrueOptions) -> Result<Token> {
        let AccrueOptions {
            weight,
            timeout,
            cancellation_token,
        } = options;

        let (id, mut rx) = {
            let mut state = self.shared.lock();
            if state.disposed {
                return Err(Error::InvalidOperation(
                    "admission controller is disposed",
                ));
            }
            if let Some(granted) = state.try_grant(weight.get()) {
                drop(state);
                return Ok(self.shared.issue(weight, granted));
            }
            if state.strategies.iter().any(|s| s.max_weight < weight.get()) {
                metrics::counter!("admission_rejections").increment(1);
                return Err(Error::LimitExceeded);
            }
            state.next_id += 1;
            let id = state.next_id;
            let (tx, rx) = tokio::sync::oneshot::channel();
            state.waiters.push_back(Waiter { id, weight, tx });
            (id, rx)
        };

        let expired = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            outcome = &mut rx => outcome.trace_expect("Waiter resolved without an outcome"),
            () = cancellation_token.cancelled() => {
                self.shared.abandon_waiter(id, rx, Error::Cancelled).await
            }
            () = expired => {
                self.shared.abandon_waiter(id, rx, Error::Timeout).await
            }
        }
    }

    /// Shuts the controller down.
    ///
    /// Marks the controller disposed (subsequent accruals fail), resolves
    /// every queued waiter with [`Error::Disposed`], then waits for the
    /// inner strategies to drain: outstanding tokens settle normally and
    /// window holds elapse rather than being aborted. Idempotent and safe
    /// to call concurrently; later calls just wait for the same drain.
    pub async fn dispose(&self) {
        let waiters = {
            let mut state = self.shared.lock();
            state.disposed = true;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.tx.send(Err(Error::Disposed));
        }

        loop {
            let mut drained = pin!(self.shared.drained.notified());
            drained.as_mut().enable();
            if self.shared.lock().is_drained() {
                return;
            }
            drained.await;
        }
    }
}

#[async_trait]
impl Disposable for AdmissionController {
    async fn dispose(&self) {
        self.dispose().await
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("AdmissionController")
            .field("disposed", &state.disposed)
            .field("queued_waiters", &state.waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weight(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    fn parallel(n: usize) -> AdmissionController {
        AdmissionController::new(&Config {
            parallel: NonZeroUsize::new(n),
            ..Default::default()
        })
        .unwrap()
    }

    async fn until_queued(controller: &AdmissionController, count: usize) {
        while controller.shared.lock().waiters.len() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_parallel_immediate_grants_and_rejection() {
        let controller = parallel(2);
        assert_eq!(controller.max_weight(), 2);
        assert_eq!(controller.available_weight(), 2);

        let t1 = controller.accrue_token_immediately(weight(1)).unwrap();
        let t2 = controller.accrue_token_immediately(weight(1)).unwrap();
        assert_eq!(controller.available_weight(), 0);
        assert!(matches!(
            controller.accrue_token_immediately(weight(1)),
            Err(Error::LimitExceeded)
        ));

        // Either settlement of a parallel slot frees it immediately
        t1.rollback();
        assert_eq!(controller.available_weight(), 1);
        let t3 = controller.accrue_token_immediately(weight(1)).unwrap();
        t2.commit();
        t3.commit();
        assert_eq!(controller.available_weight(), 2);
    }

    #[tokio::test]
    async fn test_failed_attempt_leaves_no_partial_hold() {
        // Weight 2 fits the rate limit but not the single parallel slot
        let controller = AdmissionController::new(&Config {
            per_second: NonZeroUsize::new(4),
            parallel: NonZeroUsize::new(1),
            ..Default::default()
        })
        .unwrap();

        assert!(matches!(
            controller.accrue_token_immediately(weight(2)),
            Err(Error::LimitExceeded)
        ));
        let state = controller.shared.lock();
        assert!(state.strategies.iter().all(|s| s.outstanding == 0));
        assert!(state.window_holds.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_times_out_at_deadline() {
        let controller = parallel(1);
        let held = controller.accrue_token_immediately(weight(1)).unwrap();

        let started = tokio::time::Instant::now();
        let outcome = controller
            .accrue_token_lazy(AccrueOptions {
                timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            })
            .await;
        assert!(matches!(outcome, Err(Error::Timeout)));

        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_millis(50) && elapsed < Duration::from_millis(60),
            "timed out after {elapsed:?}"
        );
        assert!(controller.shared.lock().waiters.is_empty());
        held.rollback();
    }

    #[tokio::test]
    async fn test_lazy_grant_on_release() {
        let controller = Arc::new(parallel(1));
        let held = controller.accrue_token_immediately(weight(1)).unwrap();

        let waiter = tokio::spawn({
            let controller = controller.clone();
            async move { controller.accrue_token_lazy(AccrueOptions::default()).await }
        });
        until_queued(&controller, 1).await;

        held.commit();
        let token = waiter.await.unwrap().unwrap();
        token.rollback();
        assert_eq!(controller.available_weight(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_never_also_resolves() {
        let controller = Arc::new(parallel(1));
        let held = controller.accrue_token_immediately(weight(1)).unwrap();
        let source = ManualCancellationSource::new();

        let waiter = tokio::spawn({
            let controller = controller.clone();
            let cancellation_token = source.token();
            async move {
                controller
                    .accrue_token_lazy(AccrueOptions {
                        cancellation_token,
                        ..Default::default()
                    })
                    .await
            }
        });
        until_queued(&controller, 1).await;

        source.cancel().unwrap();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled)));
        assert!(controller.shared.lock().waiters.is_empty());

        // The freed slot must not be consumed by the cancelled waiter
        held.rollback();
        assert_eq!(controller.available_weight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_withholds_window_weight_until_elapse() {
        let controller = AdmissionController::new(&Config {
            per_timespan: Some(TimespanConfig {
                delay: Duration::from_millis(100),
                count: weight(1),
            }),
            ..Default::default()
        })
        .unwrap();

        controller.accrue_token_immediately(weight(1)).unwrap().commit();
        assert_eq!(controller.available_weight(), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(controller.available_weight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_returns_window_weight_immediately() {
        let controller = AdmissionController::new(&Config {
            per_timespan: Some(TimespanConfig {
                delay: Duration::from_millis(100),
                count: weight(1),
            }),
            ..Default::default()
        })
        .unwrap();

        controller.accrue_token_immediately(weight(1)).unwrap().rollback();
        assert_eq!(controller.available_weight(), 1);

        // The disarmed window timer firing later must not double-release
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(controller.available_weight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_elapse_wakes_queued_waiter() {
        let controller = Arc::new(
            AdmissionController::new(&Config {
                per_second: NonZeroUsize::new(1),
                ..Default::default()
            })
            .unwrap(),
        );
        controller.accrue_token_immediately(weight(1)).unwrap().commit();

        let waiter = tokio::spawn({
            let controller = controller.clone();
            async move { controller.accrue_token_lazy(AccrueOptions::default()).await }
        });
        until_queued(&controller, 1).await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        waiter.await.unwrap().unwrap().rollback();
    }

    #[tokio::test]
    async fn test_waiters_grant_in_fifo_order() {
        let controller = Arc::new(parallel(1));
        let held = controller.accrue_token_immediately(weight(1)).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for index in [1, 2] {
            tokio::spawn({
                let controller = controller.clone();
                let tx = tx.clone();
                async move {
                    let token = controller
                        .accrue_token_lazy(AccrueOptions::default())
                        .await
                        .unwrap();
                    tx.send(index).unwrap();
                    token.rollback();
                }
            });
            until_queued(&controller, index).await;
        }

        held.rollback();
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_dropped_token_rolls_back() {
        let controller = parallel(1);
        drop(controller.accrue_token_immediately(weight(1)).unwrap());
        assert_eq!(controller.available_weight(), 1);
    }

    #[tokio::test]
    async fn test_oversized_lazy_weight_fails_fast() {
        let controller = parallel(2);
        let outcome = controller
            .accrue_token_lazy(AccrueOptions {
                weight: weight(3),
                ..Default::default()
            })
            .await;
        assert!(matches!(outcome, Err(Error::LimitExceeded)));
    }

    #[tokio::test]
    async fn test_dispose_resolves_waiters_and_drains() {
        let controller = Arc::new(parallel(1));
        let held = controller.accrue_token_immediately(weight(1)).unwrap();

        let waiter = tokio::spawn({
            let controller = controller.clone();
            async move { controller.accrue_token_lazy(AccrueOptions::default()).await }
        });
        until_queued(&controller, 1).await;

        let disposer = tokio::spawn({
            let controller = controller.clone();
            async move { controller.dispose().await }
        });

        // The queued waiter resolves right away...
        assert!(matches!(waiter.await.unwrap(), Err(Error::Disposed)));

        // ...but the drain waits for the outstanding token
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!disposer.is_finished());

        held.rollback();
        disposer.await.unwrap();

        // Idempotent, and accrual after dispose is misuse
        controller.dispose().await;
        assert!(matches!(
            controller.accrue_token_immediately(weight(1)),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_context_token_cancels_queued_accrual() {
        let controller = Arc::new(parallel(1));
        let held = controller.accrue_token_immediately(weight(1)).unwrap();

        let source = ManualCancellationSource::new();
        let ctx = ExecutionContext::empty().with_cancellation_token(source.token(), false);

        let waiter = tokio::spawn({
            let controller = controller.clone();
            let cancellation_token = ctx.cancellation_token().unwrap();
            async move {
                controller
                    .accrue_token_lazy(AccrueOptions {
                        cancellation_token,
                        ..Default::default()
                    })
                    .await
            }
        });
        until_queued(&controller, 1).await;

        source.cancel().unwrap();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled)));
        held.rollback();
    }
}
