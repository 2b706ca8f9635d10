//! Token issuance for searches and transfers.

use std::sync::atomic::{AtomicI32, Ordering};

/// Hands out monotonically increasing tokens, wrapping from `i32::MAX` back to zero.
#[derive(Debug)]
pub struct TokenFactory {
    next: AtomicI32,
}

impl TokenFactory {
    pub fn new(start: i32) -> Self {
        Self {
            next: AtomicI32::new(start.max(0)),
        }
    }

    /// Start from a random non-negative value.
    pub fn random() -> Self {
        Self::new(rand::random::<i32>() & i32::MAX)
    }

    pub fn next_token(&self) -> i32 {
        // fetch_update only fails when the closure returns None; ours never does.
        match self
            .next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| Some(wrapping_next(t)))
        {
            Ok(t) | Err(t) => t,
        }
    }

    /// Next token for which `in_use` is false. Gives up after a full cycle of attempts.
    pub fn next_available(&self, in_use: impl Fn(i32) -> bool) -> Option<i32> {
        (0..=1024).map(|_| self.next_token()).find(|t| !in_use(*t))
    }
}

fn wrapping_next(t: i32) -> i32 {
    if t == i32::MAX {
        0
    } else {
        t + 1
    }
}

impl Default for TokenFactory {
    fn default() -> Self {
        Self::random()
    }
}
