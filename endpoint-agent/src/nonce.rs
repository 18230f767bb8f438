//! Replay protection for one-time authentication nonces
//!
//! The seen set is never pruned: a nonce stays rejected for the whole
//! process lifetime.

use crate::errors::AgentError;
use parking_lot::Mutex;
use std::collections::HashSet;

/// Tracks every nonce presented to the agent
#[derive(Debug, Default)]
pub struct NonceValidator {
    seen: Mutex<HashSet<String>>,
}

impl NonceValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject a nonce that was already seen; the nonce is recorded either way
    pub fn validate(&self, nonce: &str) -> Result<(), AgentError> {
        let fresh = self.seen.lock().insert(nonce.to_string());
        if !fresh {
            return Err(AgentError::authentication(
                "nonce: Duplicate authentication nonce",
            ));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
