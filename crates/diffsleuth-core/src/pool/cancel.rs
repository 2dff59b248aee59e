//! Hierarchical cancellation tokens.
//!
//! A token is cancelled when its own flag is set or when any ancestor is
//! cancelled. The pool gives every unit a child of the run token, so a
//! global abort reaches every unit while a per-unit timeout only cancels
//! that one unit.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct TokenInner {
    flag: AtomicBool,
    parent: Option<CancelToken>,
}

/// Cheap, cloneable cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// A fresh root token.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is cancelled whenever `self` is, but can also be
    /// cancelled on its own without affecting `self`.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                flag: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Request cancellation of this token and all of its children.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::Relaxed);
    }

    /// Check whether this token or any ancestor has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        let mut current = Some(self);
        while let Some(token) = current {
            if token.inner.flag.load(Ordering::Relaxed) {
                return true;
            }
            current = token.inner.parent.as_ref();
        }
        false
    }
}
