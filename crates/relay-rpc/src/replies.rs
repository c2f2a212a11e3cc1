//! Inbound request ids still owed a reply.

use std::collections::HashSet;

use parking_lot::Mutex;
use relay_core::ids::RequestId;

/// Tracks inbound requests so each gets at most one response.
#[derive(Default)]
pub(crate) struct ReplyTracker {
    awaiting: Mutex<HashSet<RequestId>>,
}

impl ReplyTracker {
    /// Record a dispatched request. Returns false if `id` was already awaiting a reply.
    pub(crate) fn track(&self, id: RequestId) -> bool {
        self.awaiting.lock().insert(id)
    }

    /// Claim the right to reply to `id`. Returns false if it was never
    /// dispatched or has already been answered.
    pub(crate) fn complete(&self, id: &RequestId) -> bool {
        self.awaiting.lock().remove(id)
    }

    /// Forget every outstanding request. Returns how many were dropped.
    pub(crate) fn clear(&self) -> usize {
        let mut awaiting = self.awaiting.lock();
        let dropped = awaiting.len();
        awaiting.clear();
        dropped
    }

    pub(crate) fn len(&self) -> usize {
        self.awaiting.lock().len()
    }
}
