//! Ambient execution contexts.
//!
//! An [`ExecutionContext`] is an immutable chain of nodes threading
//! cross-cutting data (cancellation, structured-logging labels) through a
//! call graph without global state. Deriving a child context never mutates
//! the parent; contexts are cheap to clone and safe to share across tasks.
//!
//! Lookups walk the chain from the nearest node outwards. Cancellation is
//! single-value (the nearest node wins outright); logger labels are
//! multi-value (every node on the chain contributes, nearest wins per key).
//!
//! # Example
//!
//! ```
//! use keel_coordination::{ExecutionContext, ManualCancellationSource};
//!
//! let source = ManualCancellationSource::new();
//! let ctx = ExecutionContext::empty()
//!     .with_cancellation_token(source.token(), false)
//!     .with_logger_labels([("request_id", "42")]);
//!
//! assert!(!ctx.cancellation_token().unwrap().is_cancellation_requested());
//! assert_eq!(&*ctx.logger_labels()["request_id"], "42");
//! ```

use super::*;
use std::collections::HashMap;

struct Node {
    payload: Payload,
    prev: Option<Arc<Node>>,
}

enum Payload {
    Cancellation(CancellationToken),
    LoggerLabels(HashMap<Box<str>, Box<str>>),
}

/// Handle onto an immutable context chain. Cloning shares the chain.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    head: Option<Arc<Node>>,
}

impl ExecutionContext {
    /// The root context: no payload, no parent.
    pub fn empty() -> Self {
        Self { head: None }
    }

    /// The parent context, if this is not the root.
    pub fn prev(&self) -> Option<ExecutionContext> {
        self.head.as_ref().map(|node| Self {
            head: node.prev.clone(),
        })
    }

    /// Derives a child context carrying `token`.
    ///
    /// With `aggregate_with_prev`, and if a cancellation node already
    /// exists on the chain, the effective token is the aggregate of
    /// `token` and the nearest ancestor's token, so cancelling either
    /// cancels the child scope. Otherwise `token` is carried unchanged.
    pub fn with_cancellation_token(
        &self,
        token: CancellationToken,
        aggregate_with_prev: bool,
    ) -> Self {
        let token = if aggregate_with_prev {
            match self.find_cancellation_token() {
                Some(ancestor) => CancellationToken::aggregate([token, ancestor]),
                None => token,
            }
        } else {
            token
        };
        self.push(Payload::Cancellation(token))
    }

    /// Derives a child context carrying an immutable copy of `labels`.
    pub fn with_logger_labels<I, K, V>(&self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Box<str>>,
        V: Into<Box<str>>,
    {
        self.push(Payload::LoggerLabels(
            labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ))
    }

    /// The nearest cancellation token on the chain.
    ///
    /// Fails with [`Error::InvalidOperation`] if no cancellation node
    /// exists anywhere on the chain.
    pub fn cancellation_token(&self) -> Result<CancellationToken> {
        self.find_cancellation_token().ok_or(Error::InvalidOperation(
            "no cancellation token on the execution context chain",
        ))
    }

    /// The merged logger labels of the entire chain, nearest wins per key.
    ///
    /// A chain without label nodes yields an empty map.
    pub fn logger_labels(&self) -> HashMap<Box<str>, Box<str>> {
        let mut merged = HashMap::new();
        for payload in self.walk() {
            if let Payload::LoggerLabels(labels) = payload {
                for (key, value) in labels {
                    merged
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
            }
        }
        merged
    }

    fn push(&self, payload: Payload) -> Self {
        Self {
            head: Some(Arc::new(Node {
                payload,
                prev: self.head.clone(),
            })),
        }
    }

    fn find_cancellation_token(&self) -> Option<CancellationToken> {
        self.walk().find_map(|payload| match payload {
            Payload::Cancellation(token) => Some(token.clone()),
            _ => None,
        })
    }

    // Nearest-first payload walk
    fn walk(&self) -> impl Iterator<Item = &Payload> {
        std::iter::successors(self.head.as_deref(), |node| node.prev.as_deref())
            .map(|node| &node.payload)
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("depth", &self.walk().count())
            .finish()
    }
}
