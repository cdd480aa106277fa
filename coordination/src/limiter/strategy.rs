use super::*;

pub(crate) enum Kind {
    /// Weight returns when the holder settles, commit or rollback alike.
    Parallel,
    /// Weight returns when the window elapses after the grant; only
    /// rollback short-circuits it.
    TimeWindow(Duration),
}

/// One independently-configured capacity strategy. Pure bookkeeping: the
/// controller composes reservations atomically under its own lock.
pub(crate) struct Strategy {
    pub max_weight: usize,
    pub outstanding: usize,
    pub kind: Kind,
}

impl Strategy {
    pub fn parallel(max_weight: NonZeroUsize) -> Self {
        Self {
            max_weight: max_weight.get(),
            outstanding: 0,
            kind: Kind::Parallel,
        }
    }

    pub fn time_window(window: Duration, max_weight: NonZeroUsize) -> Self {
        Self {
            max_weight: max_weight.get(),
            outstanding: 0,
            kind: Kind::TimeWindow(window),
        }
    }

    pub fn available_weight(&self) -> usize {
        self.max_weight - self.outstanding
    }

    pub fn try_reserve(&mut self, weight: usize) -> bool {
        if self.available_weight() < weight {
            return false;
        }
        self.outstanding += weight;
        true
    }

    pub fn release(&mut self, weight: usize) {
        self.outstanding = self
            .outstanding
            .checked_sub(weight)
            .trace_expect("Released more weight than outstanding");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release_bookkeeping() {
        let mut strategy = Strategy::parallel(NonZeroUsize::new(3).unwrap());
        assert_eq!(strategy.available_weight(), 3);

        assert!(strategy.try_reserve(2));
        assert_eq!(strategy.available_weight(), 1);
        assert!(!strategy.try_reserve(2));
        assert!(strategy.try_reserve(1));
        assert_eq!(strategy.available_weight(), 0);

        strategy.release(3);
        assert_eq!(strategy.available_weight(), 3);
    }
}
