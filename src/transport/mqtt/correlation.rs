//! Pending request/response correlation keyed by `$rid`.
//!
//! Twin operations publish a request and await the matching response
//! publish. The registry maps each random request id to a oneshot completer
//! and guarantees the entry is destroyed on exactly one of: response
//! received, caller cancellation, age-out, or transport disconnect.
//!
//! Completers are always resolved after the map lock is released, and a
//! oneshot send only wakes the waiter's own task, so producers never run
//! waiter continuations inline.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{ErrorKind, IotHubError, IotHubResult};

/// Raw twin response routed back to an awaiting caller. The body is decoded
/// on the caller's task, never on the inbound callback.
#[derive(Debug)]
pub struct TwinResponse {
    pub status: i32,
    /// Server-assigned version from the response topic query string;
    /// present only on reported-patch 204 responses.
    pub version: Option<i64>,
    pub body: Vec<u8>,
}

type Completer = oneshot::Sender<IotHubResult<TwinResponse>>;

/// The two twin operation flavors. The variant carries the completer, so an
/// entry holds exactly one completer by construction.
pub enum PendingCompleter {
    GetTwin(Completer),
    PatchTwin(Completer),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    GetTwin,
    PatchTwin,
}

/// One in-flight twin operation.
pub struct PendingOperation {
    created_at: Instant,
    completer: PendingCompleter,
}

impl PendingOperation {
    pub fn get_twin(completer: Completer) -> Self {
        Self {
            created_at: Instant::now(),
            completer: PendingCompleter::GetTwin(completer),
        }
    }

    pub fn patch_twin(completer: Completer) -> Self {
        Self {
            created_at: Instant::now(),
            completer: PendingCompleter::PatchTwin(completer),
        }
    }

    pub fn kind(&self) -> PendingKind {
        match self.completer {
            PendingCompleter::GetTwin(_) => PendingKind::GetTwin,
            PendingCompleter::PatchTwin(_) => PendingKind::PatchTwin,
        }
    }

    fn into_completer(self) -> Completer {
        match self.completer {
            PendingCompleter::GetTwin(tx) | PendingCompleter::PatchTwin(tx) => tx,
        }
    }
}

/// Concurrent map of request id to pending operation.
#[derive(Default)]
pub struct CorrelationRegistry {
    entries: Mutex<HashMap<String, PendingOperation>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending operation under a request id. The id must be
    /// unused; request ids are random and never reused within a handler.
    pub fn insert(&self, request_id: &str, pending: PendingOperation) -> IotHubResult<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(request_id) {
            return Err(IotHubError::new(
                ErrorKind::ArgumentInvalid,
                format!("Request id '{request_id}' is already pending"),
            ));
        }
        entries.insert(request_id.to_string(), pending);
        Ok(())
    }

    /// Atomically remove the entry and resolve its completer with the
    /// response. Returns false (and changes nothing) for unknown ids.
    pub fn complete(&self, request_id: &str, response: TwinResponse) -> bool {
        let pending = self.entries.lock().remove(request_id);
        match pending {
            Some(pending) => {
                // The waiter may have stopped listening; that is fine.
                let _ = pending.into_completer().send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Remove the entry and drop its completer, waking the waiter with a
    /// cancellation. No-op for unknown ids.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.entries.lock().remove(request_id).is_some()
    }

    /// Remove and fail every entry older than `max_age`. With
    /// `max_age = 0` every pending operation fails immediately.
    pub fn sweep<F>(&self, max_age: Duration, error: F) -> usize
    where
        F: Fn() -> IotHubError,
    {
        let now = Instant::now();
        let expired: Vec<PendingOperation> = {
            let mut entries = self.entries.lock();
            let stale_ids: Vec<String> = entries
                .iter()
                .filter(|(_, op)| now.duration_since(op.created_at) >= max_age)
                .map(|(id, _)| id.clone())
                .collect();
            stale_ids
                .into_iter()
                .filter_map(|id| entries.remove(&id))
                .collect()
        };

        let count = expired.len();
        for pending in expired {
            let _ = pending.into_completer().send(Err(error()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn response(status: i32) -> TwinResponse {
        TwinResponse {
            status,
            version: None,
            body: Vec::new(),
        }
    }

    #[tokio::test]
    async fn pending_kind_follows_the_completer_variant() {
        let (get_tx, _get_rx) = oneshot::channel();
        let (patch_tx, _patch_rx) = oneshot::channel();
        assert_eq!(
            PendingOperation::get_twin(get_tx).kind(),
            PendingKind::GetTwin
        );
        assert_eq!(
            PendingOperation::patch_twin(patch_tx).kind(),
            PendingKind::PatchTwin
        );
    }

    #[tokio::test]
    async fn complete_resolves_the_registered_waiter() {
        let registry = CorrelationRegistry::new();
        let (tx, rx) = oneshot::channel();
        registry.insert("r1", PendingOperation::get_twin(tx)).unwrap();

        assert!(registry.complete("r1", response(200)));
        let resolved = rx.await.unwrap().unwrap();
        assert_eq!(resolved.status, 200);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn duplicate_request_ids_are_rejected() {
        let registry = CorrelationRegistry::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();

        registry.insert("r1", PendingOperation::get_twin(tx1)).unwrap();
        let err = registry
            .insert("r1", PendingOperation::patch_twin(tx2))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentInvalid);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn unknown_response_leaves_registry_unchanged() {
        let registry = CorrelationRegistry::new();
        let (tx, mut rx) = oneshot::channel();
        registry.insert("r1", PendingOperation::get_twin(tx)).unwrap();

        assert!(!registry.complete("stranger", response(200)));
        assert_eq!(registry.len(), 1);
        // The registered waiter was not touched.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_removes_entry_and_wakes_waiter_with_closure() {
        let registry = CorrelationRegistry::new();
        let (tx, rx) = oneshot::channel();
        registry.insert("r1", PendingOperation::patch_twin(tx)).unwrap();

        assert!(registry.cancel("r1"));
        assert!(registry.is_empty());
        assert!(rx.await.is_err());

        // A response arriving after cancellation is discarded.
        assert!(!registry.complete("r1", response(204)));
    }

    #[tokio::test]
    async fn sweep_fails_only_entries_past_max_age() {
        let registry = CorrelationRegistry::new();
        let (old_tx, old_rx) = oneshot::channel();
        registry
            .insert("old", PendingOperation::get_twin(old_tx))
            .unwrap();

        std::thread::sleep(Duration::from_millis(30));

        let (young_tx, mut young_rx) = oneshot::channel();
        registry
            .insert("young", PendingOperation::get_twin(young_tx))
            .unwrap();

        let swept = registry.sweep(Duration::from_millis(20), || {
            IotHubError::network("Did not receive twin response from service.")
        });

        assert_eq!(swept, 1);
        assert_eq!(registry.len(), 1);
        let err = old_rx.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkErrors);
        assert!(young_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sweep_with_zero_age_fails_everything() {
        let registry = CorrelationRegistry::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        registry.insert("a", PendingOperation::get_twin(tx1)).unwrap();
        registry.insert("b", PendingOperation::patch_twin(tx2)).unwrap();

        let swept = registry.sweep(Duration::ZERO, || IotHubError::network("gone"));
        assert_eq!(swept, 2);
        assert!(registry.is_empty());
        assert!(rx1.await.unwrap().is_err());
        assert!(rx2.await.unwrap().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_insert_and_complete_never_lose_entries() {
        let registry = Arc::new(CorrelationRegistry::new());
        let mut waiters = Vec::new();

        for i in 0..64 {
            let (tx, rx) = oneshot::channel();
            registry
                .insert(&format!("r{i}"), PendingOperation::get_twin(tx))
                .unwrap();
            waiters.push(rx);
        }

        let mut producers = Vec::new();
        for i in 0..64 {
            let registry = registry.clone();
            producers.push(tokio::spawn(async move {
                registry.complete(&format!("r{i}"), response(200))
            }));
        }

        for producer in producers {
            assert!(producer.await.unwrap());
        }
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap().status, 200);
        }
        assert!(registry.is_empty());
    }
}
