use super::*;

type Subscriptions = Arc<Mutex<Vec<(CancellationToken, ListenerHandle)>>>;

impl CancellationToken {
    /// Combines `tokens` into one token with OR semantics.
    ///
    /// The aggregate is cancelled as soon as any input is cancelled. On the
    /// first input to fire it unsubscribes from every input, so no further
    /// work happens and no registration leaks, then flips its own flag and
    /// notifies its own listeners exactly once, with the same per-listener
    /// failure aggregation as a manual source. Inputs already cancelled at
    /// construction trigger immediately.
    pub fn aggregate<I>(tokens: I) -> CancellationToken
    where
        I: IntoIterator<Item = CancellationToken>,
    {
        let core = Core::new();
        let subscriptions: Subscriptions = Arc::new(Mutex::new(Vec::new()));

        for token in tokens {
            let handle = token.add_cancel_listener(Box::new({
                let core = core.clone();
                let subscriptions = subscriptions.clone();
                move || {
                    unsubscribe_all(&subscriptions);
                    core.cancel().map_err(Into::into)
                }
            }));
            subscriptions
                .lock()
                .trace_expect("Failed to lock mutex")
                .push((token, handle));
        }

        // An input may have fired while later inputs were still being
        // subscribed; tear those subscriptions down too.
        if core.is_cancelled() {
            unsubscribe_all(&subscriptions);
        }

        CancellationToken::from_core(core)
    }
}

fn unsubscribe_all(subscriptions: &Subscriptions) {
    let taken = std::mem::take(
        &mut *subscriptions.lock().trace_expect("Failed to lock mutex"),
    );
    for (token, handle) in taken {
        token.remove_cancel_listener(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_listener(counter: &Arc<AtomicUsize>) -> CancelListener {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_either_input_flips_the_aggregate_once() {
        for cancel_first in [0, 1] {
            let a = ManualCancellationSource::new();
            let b = ManualCancellationSource::new();
            let aggregate = CancellationToken::aggregate([a.token(), b.token()]);

            let fired = Arc::new(AtomicUsize::new(0));
            aggregate.add_cancel_listener(counting_listener(&fired));

            let (first, second) = if cancel_first == 0 { (&a, &b) } else { (&b, &a) };
            first.cancel().unwrap();
            assert!(aggregate.is_cancellation_requested());
            assert_eq!(fired.load(Ordering::SeqCst), 1);

            // The other input firing later must not re-notify
            second.cancel().unwrap();
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_inputs_are_unsubscribed_after_first_fire() {
        let a = ManualCancellationSource::new();
        let b = ManualCancellationSource::new();
        let aggregate = CancellationToken::aggregate([a.token(), b.token()]);

        a.cancel().unwrap();
        assert!(aggregate.is_cancellation_requested());

        // The aggregate's listener on b is gone, so a failing listener on
        // the aggregate cannot surface through b's cancel.
        aggregate.add_cancel_listener(Box::new(|| Err("should never run".into())));
        b.cancel().unwrap();
    }

    #[tokio::test]
    async fn test_already_cancelled_input_triggers_immediately() {
        let a = ManualCancellationSource::new();
        a.cancel().unwrap();
        let b = ManualCancellationSource::new();

        let aggregate = CancellationToken::aggregate([a.token(), b.token()]);
        assert!(aggregate.is_cancellation_requested());

        b.cancel().unwrap();
    }

    #[tokio::test]
    async fn test_aggregate_of_none_tokens_never_fires() {
        let aggregate =
            CancellationToken::aggregate([CancellationToken::none(), CancellationToken::none()]);
        assert!(!aggregate.is_cancellation_requested());
    }

    #[tokio::test]
    async fn test_listener_failures_propagate_to_the_input_canceller() {
        let a = ManualCancellationSource::new();
        let aggregate = CancellationToken::aggregate([a.token()]);
        aggregate.add_cancel_listener(Box::new(|| Err("downstream failure".into())));

        let Err(aggregate_error) = a.cancel() else {
            panic!("expected the downstream failure to surface");
        };
        assert_eq!(aggregate_error.0.len(), 1);
    }
}
