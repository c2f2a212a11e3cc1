//! Outstanding outbound calls awaiting their responses.
//!
//! Each registered id owns a one-shot slot. Exactly one of three things
//! resolves it: the matching response ([`PendingCallTable::resolve`]), the
//! connection closing ([`PendingCallTable::cancel_all`]), or the waiter
//! going away ([`PendingCall`] dropped unresolved).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use relay_core::errors::RelayError;
use relay_core::ids::RequestId;
use relay_core::wire::Response;
use tokio::sync::oneshot;

use crate::connection::CloseReason;

/// What a waiter receives: its response, or the reason the connection closed.
pub type CallOutcome = Result<Response, CloseReason>;

struct Entry {
    generation: u64,
    slot: oneshot::Sender<CallOutcome>,
}

#[derive(Default)]
struct Table {
    calls: HashMap<RequestId, Entry>,
    closed: Option<CloseReason>,
    next_generation: u64,
}

/// Map from outstanding request id to its waiter.
#[derive(Default)]
pub struct PendingCallTable {
    inner: Mutex<Table>,
}

impl PendingCallTable {
    /// Create an empty table.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reserve `id` and return its waiter.
    ///
    /// Fails with [`RelayError::DuplicateId`] while `id` is outstanding and
    /// with [`RelayError::ConnectionClosed`] after [`Self::cancel_all`].
    pub fn register(self: &Arc<Self>, id: RequestId) -> Result<PendingCall, RelayError> {
        let mut table = self.inner.lock();
        if table.closed.is_some() {
            return Err(RelayError::ConnectionClosed);
        }
        if table.calls.contains_key(&id) {
            return Err(RelayError::DuplicateId { id });
        }
        let generation = table.next_generation;
        table.next_generation += 1;
        let (slot, rx) = oneshot::channel();
        let _ = table.calls.insert(id.clone(), Entry { generation, slot });
        Ok(PendingCall {
            id,
            generation,
            table: Arc::clone(self),
            rx,
            settled: false,
        })
    }

    /// Deliver `response` to the waiter for `id`.
    ///
    /// Returns false if no waiter is registered (unknown, answered already,
    /// or abandoned by its caller).
    pub fn resolve(&self, id: &RequestId, response: Response) -> bool {
        let entry = self.inner.lock().calls.remove(id);
        match entry {
            Some(entry) => entry.slot.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    /// Drop the waiter for `id` without resolving it.
    pub fn remove(&self, id: &RequestId) -> bool {
        self.inner.lock().calls.remove(id).is_some()
    }

    /// Resolve every waiter with `reason` and refuse further registrations.
    ///
    /// Returns the number of waiters resolved. Later calls return 0.
    pub fn cancel_all(&self, reason: CloseReason) -> usize {
        let drained: Vec<Entry> = {
            let mut table = self.inner.lock();
            if table.closed.is_none() {
                table.closed = Some(reason.clone());
            }
            table.calls.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.slot.send(Err(reason.clone()));
        }
        count
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.inner.lock().calls.len()
    }

    /// Whether no calls are outstanding.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().calls.is_empty()
    }

    /// Whether `id` is outstanding.
    pub fn contains(&self, id: &RequestId) -> bool {
        self.inner.lock().calls.contains_key(id)
    }

    /// Whether [`Self::cancel_all`] has run.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }

    fn remove_generation(&self, id: &RequestId, generation: u64) {
        let mut table = self.inner.lock();
        if table.calls.get(id).is_some_and(|e| e.generation == generation) {
            let _ = table.calls.remove(id);
        }
    }
}

/// The waiting side of one registered call.
///
/// Dropping it before it resolves removes its table entry, so a response
/// arriving later is reported as unmatched.
pub struct PendingCall {
    id: RequestId,
    generation: u64,
    table: Arc<PendingCallTable>,
    rx: oneshot::Receiver<CallOutcome>,
    settled: bool,
}

impl PendingCall {
    /// The id this call was registered under.
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the outcome. Cancel-safe: dropping the future leaves the
    /// call registered until the `PendingCall` itself is dropped.
    pub async fn wait(&mut self) -> CallOutcome {
        let outcome = match (&mut self.rx).await {
            Ok(outcome) => outcome,
            // Slot dropped without a send: the entry was removed out from under us.
            Err(_) => Err(CloseReason::Local),
        };
        self.settled = true;
        outcome
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.settled {
            self.table.remove_generation(&self.id, self.generation);
        }
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}
