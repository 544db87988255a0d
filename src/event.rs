//! Async-event-fd shim.
//!
//! Holds the last-seen async-event fd of an opened context so a later
//! restore of the sibling event file can hand it back without re-deriving
//! it. Restoring an event file before its context exists is a programming
//! error in the caller, not a recoverable condition.

use crate::error::{CrError, CrResult};

#[derive(Debug, Default)]
pub struct EventFdShim {
    last_event_fd: Option<i32>,
}

impl EventFdShim {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the async-event fd of a context just opened or reopened.
    pub fn note_context_opened(&mut self, async_fd: i32) {
        self.last_event_fd = Some(async_fd);
    }

    /// Resolve the fd to hand back for an `ibevent` file restore. Fails if
    /// no context has been opened yet in this process.
    pub fn resolve(&self) -> CrResult<i32> {
        self.last_event_fd
            .ok_or(CrError::UnsupportedFeature("no verbs context opened before event-file restore"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_before_any_context_fails() {
        let shim = EventFdShim::new();
        assert!(shim.resolve().is_err());
    }

    #[test]
    fn resolve_after_context_returns_its_async_fd() {
        let mut shim = EventFdShim::new();
        shim.note_context_opened(9);
        assert_eq!(shim.resolve().unwrap(), 9);
    }

    #[test]
    fn later_context_supersedes_earlier_one() {
        let mut shim = EventFdShim::new();
        shim.note_context_opened(9);
        shim.note_context_opened(11);
        assert_eq!(shim.resolve().unwrap(), 11);
    }
}
