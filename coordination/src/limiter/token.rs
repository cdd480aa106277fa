use super::*;

pub(crate) struct Hold {
    pub strategy: usize,
    pub window_hold: Option<u64>,
}

/// A capacity reservation receipt.
///
/// The holder owns the reserved weight until it settles the token with
/// exactly one of [`commit`](Token::commit) or [`rollback`](Token::rollback);
/// both consume the token, so double settlement is a compile error. A token
/// dropped unsettled is rolled back so a leak never wedges capacity.
pub struct Token {
    shared: Arc<Shared>,
    weight: NonZeroUsize,
    holds: Vec<Hold>,
    settled: bool,
}

impl Token {
    pub(crate) fn new(shared: Arc<Shared>, weight: NonZeroUsize, holds: Vec<Hold>) -> Self {
        Self {
            shared,
            weight,
            holds,
            settled: false,
        }
    }

    /// The weight this reservation holds.
    pub fn weight(&self) -> NonZeroUsize {
        self.weight
    }

    /// Settles the reservation as used.
    ///
    /// Parallel-slot weight frees immediately; time-window weight stays
    /// consumed until the window elapses from the grant instant.
    pub fn commit(mut self) {
        self.settled = true;
        self.shared
            .settle(&self.holds, self.weight.get(), Settlement::Commit);
    }

    /// Settles the reservation as unused, returning all weight immediately
    /// regardless of strategy kind.
    pub fn rollback(mut self) {
        self.settled = true;
        self.shared
            .settle(&self.holds, self.weight.get(), Settlement::Rollback);
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        if !self.settled {
            warn!("Admission token dropped without settlement, rolling back");
            self.shared
                .settle(&self.holds, self.weight.get(), Settlement::Rollback);
        }
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("weight", &self.weight)
            .finish()
    }
}
