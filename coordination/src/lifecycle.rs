//! Lifecycle contracts consumed by the rest of the toolkit.

use super::*;

/// Standard teardown contract.
///
/// Implementations must be idempotent, must never panic, and must be safe
/// to call concurrently from multiple tasks.
#[async_trait]
pub trait Disposable: Send + Sync {
    async fn dispose(&self);
}
