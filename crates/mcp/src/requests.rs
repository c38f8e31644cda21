// In-flight request tracking for cooperative cancellation

use crate::protocol::RequestId;
use geoscope_core::DispatchError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

struct Entry {
    generation: u64,
    token: CancellationToken,
}

/// Outcome of a cancellation notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The request was in flight and its token has been signalled
    Cancelled,
    /// Nothing registered under that id; nothing to do
    NotFound,
}

/// Correlation id → cancellation token for every running cancellable request
#[derive(Clone, Default)]
pub struct ActiveRequests {
    entries: Arc<Mutex<HashMap<RequestId, Entry>>>,
    next_generation: Arc<AtomicU64>,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<RequestId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `id` and hand back a guard owning its token. The entry is
    /// removed when the guard drops unless a cancellation removed it first.
    pub fn register(&self, id: RequestId) -> Result<ActiveRequest, DispatchError> {
        let mut entries = self.entries();
        if entries.contains_key(&id) {
            return Err(DispatchError::InvalidRequest(format!(
                "request id {} is already in flight",
                id
            )));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        entries.insert(
            id.clone(),
            Entry {
                generation,
                token: token.clone(),
            },
        );
        tracing::debug!(request_id = %id, "Registered cancellable request");

        Ok(ActiveRequest {
            registry: self.clone(),
            id,
            generation,
            token,
        })
    }

    /// Register `id` if there is one; notifications are never tracked
    pub fn register_optional(&self, id: Option<&RequestId>) -> Result<Option<ActiveRequest>, DispatchError> {
        id.map(|id| self.register(id.clone())).transpose()
    }

    /// Signal and forget the token registered under `id`
    pub fn cancel(&self, id: &RequestId, reason: Option<&str>) -> CancelOutcome {
        let removed = self.entries().remove(id);

        match removed {
            Some(entry) => {
                entry.token.cancel();
                tracing::info!(
                    request_id = %id,
                    reason = reason.unwrap_or("none"),
                    "Cancelled in-flight request"
                );
                CancelOutcome::Cancelled
            }
            None => {
                tracing::debug!(
                    request_id = %id,
                    "Cancellation for unknown or finished request ignored"
                );
                CancelOutcome::NotFound
            }
        }
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Cancel everything, e.g. when the transport closes
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Entry> = self.entries().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.token.cancel();
        }
        drained.len()
    }

    fn complete(&self, id: &RequestId, generation: u64) {
        let mut entries = self.entries();
        if entries
            .get(id)
            .is_some_and(|entry| entry.generation == generation)
        {
            entries.remove(id);
            tracing::debug!(request_id = %id, "Request finished");
        }
    }
}

/// Registration handle held by the dispatcher while a request runs
pub struct ActiveRequest {
    registry: ActiveRequests,
    id: RequestId,
    generation: u64,
    token: CancellationToken,
}

impl ActiveRequest {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl std::fmt::Debug for ActiveRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveRequest")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        self.registry.complete(&self.id, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_complete() {
        let requests = ActiveRequests::new();
        let id = RequestId::Number(1);

        let active = requests.register(id.clone()).unwrap();
        assert!(requests.contains(&id));
        assert!(!active.is_cancelled());

        drop(active);
        assert!(requests.is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected_while_in_flight() {
        let requests = ActiveRequests::new();
        let id = RequestId::from("dup");

        let active = requests.register(id.clone()).unwrap();
        assert!(requests.register(id.clone()).is_err());

        drop(active);
        assert!(requests.register(id).is_ok());
    }

    #[test]
    fn test_cancel_signals_and_removes() {
        let requests = ActiveRequests::new();
        let id = RequestId::Number(42);

        let active = requests.register(id.clone()).unwrap();
        let token = active.token();

        assert_eq!(requests.cancel(&id, Some("user abort")), CancelOutcome::Cancelled);
        assert!(token.is_cancelled());
        assert!(!requests.contains(&id));

        // Second cancel finds nothing
        assert_eq!(requests.cancel(&id, None), CancelOutcome::NotFound);
    }

    #[test]
    fn test_cancel_unknown_is_noop() {
        let requests = ActiveRequests::new();
        let other = requests.register(RequestId::Number(1)).unwrap();

        assert_eq!(requests.cancel(&RequestId::Number(99), None), CancelOutcome::NotFound);
        assert_eq!(requests.len(), 1);
        assert!(!other.is_cancelled());
    }

    #[test]
    fn test_stale_guard_does_not_remove_reused_id() {
        let requests = ActiveRequests::new();
        let id = RequestId::Number(5);

        let first = requests.register(id.clone()).unwrap();
        requests.cancel(&id, None);

        let second = requests.register(id.clone()).unwrap();
        drop(first);

        assert!(requests.contains(&id));
        drop(second);
        assert!(!requests.contains(&id));
    }

    #[test]
    fn test_cancel_all() {
        let requests = ActiveRequests::new();
        let a = requests.register(RequestId::Number(1)).unwrap();
        let b = requests.register(RequestId::Number(2)).unwrap();

        assert_eq!(requests.cancel_all(), 2);
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert!(requests.is_empty());
    }
}
