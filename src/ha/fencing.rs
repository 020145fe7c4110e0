//! Fencing-token guard for split-brain prevention.
//!
//! The guard remembers the token this node won and the highest token it has
//! seen anywhere. Once a higher token shows up, every guarded call fails with
//! [`FleetError::Fenced`] instead of being applied.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{FleetError, Result};

/// Zero means "holds nothing".
#[derive(Debug, Default)]
pub struct FencingGuard {
    held: AtomicU64,
    observed: AtomicU64,
}

impl FencingGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token this node holds, if any.
    pub fn held(&self) -> Option<u64> {
        match self.held.load(Ordering::Acquire) {
            0 => None,
            token => Some(token),
        }
    }

    /// Highest token observed so far
    pub fn observed(&self) -> u64 {
        self.observed.load(Ordering::Acquire)
    }

    /// Records a token seen in the store. Tokens never move backwards; the
    /// return value says whether `token` was news.
    pub fn observe(&self, token: u64) -> bool {
        self.observed.fetch_max(token, Ordering::AcqRel) < token
    }

    /// Takes ownership of a freshly won token.
    pub fn acquire(&self, token: u64) {
        self.observe(token);
        self.held.store(token, Ordering::Release);
    }

    pub fn release(&self) {
        self.held.store(0, Ordering::Release);
    }

    /// Fails unless this node holds the highest token observed.
    pub fn check(&self) -> Result<u64> {
        let held = self.held.load(Ordering::Acquire);
        let observed = self.observed.load(Ordering::Acquire);
        if held == 0 || held < observed {
            return Err(FleetError::Fenced { held, observed });
        }
        Ok(held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_held_is_fenced() {
        let guard = FencingGuard::new();
        assert!(matches!(guard.check(), Err(FleetError::Fenced { held: 0, .. })));
    }

    #[test]
    fn higher_token_fences_holder() {
        let guard = FencingGuard::new();
        guard.acquire(6);
        assert_eq!(guard.check().unwrap(), 6);
        assert!(guard.observe(7));
        assert!(matches!(
            guard.check(),
            Err(FleetError::Fenced {
                held: 6,
                observed: 7
            })
        ));
    }

    #[test]
    fn observed_tokens_never_decrease() {
        let guard = FencingGuard::new();
        assert!(guard.observe(5));
        assert!(!guard.observe(3));
        assert!(!guard.observe(5));
        assert_eq!(guard.observed(), 5);
    }
}
