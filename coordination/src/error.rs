use thiserror::Error as ThisError;

/// Arbitrary caller-supplied failure, as flowed out of cancel listeners.
pub type BoxError = Box<dyn core::error::Error + Send + Sync>;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    /// The operation observed a requested cancellation. Expected control
    /// flow, always recoverable by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Admission control has no room for the requested weight.
    #[error("admission limit exceeded")]
    LimitExceeded,

    /// Admission control could not grant capacity within the timeout.
    #[error("timed out waiting for admission")]
    Timeout,

    /// The admission controller was disposed while the caller was queued.
    #[error("admission controller disposed")]
    Disposed,

    /// Programmer misuse. A bug in the caller, not a retry target.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

/// Collects every failure raised while notifying a listener set. No inner
/// error is ever dropped.
#[derive(Debug)]
pub struct AggregateError(pub Vec<BoxError>);

impl core::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} listener failure(s)", self.0.len())?;
        for e in &self.0 {
            write!(f, "; {e}")?;
        }
        Ok(())
    }
}

impl core::error::Error for AggregateError {}
