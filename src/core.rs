//! Runtime-agnostic bookkeeping shared by the request driver.

use crate::errors::{Error, RetryMetadata};

/// Tracks replays across one logical call.
#[derive(Debug, Default)]
pub(crate) struct RetryState {
    pub(crate) attempts: u32,
    pub(crate) last_status: Option<u16>,
    pub(crate) last_error: Option<String>,
}

impl RetryState {
    pub(crate) fn new() -> Self {
        Self {
            attempts: 0,
            last_status: None,
            last_error: None,
        }
    }

    pub(crate) fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub(crate) fn record_status(&mut self, status: u16) {
        self.last_status = Some(status);
    }

    pub(crate) fn record_error(&mut self, err: &Error) {
        self.last_error = Some(err.to_string());
    }

    /// `None` unless the call was attempted more than once.
    pub(crate) fn metadata(&self) -> Option<RetryMetadata> {
        if self.attempts <= 1 {
            None
        } else {
            Some(RetryMetadata {
                attempts: self.attempts,
                last_status: self.last_status,
                last_error: self.last_error.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_attempt_has_no_metadata() {
        let mut state = RetryState::new();
        state.record_attempt();
        state.record_status(200);
        assert!(state.metadata().is_none());
    }

    #[test]
    fn replays_are_reported() {
        let mut state = RetryState::new();
        for status in [503, 502, 200] {
            state.record_attempt();
            state.record_status(status);
        }
        let meta = state.metadata().unwrap();
        assert_eq!(meta.attempts, 3);
        assert_eq!(meta.last_status, Some(200));
        assert!(meta.last_error.is_none());
    }
}
