use hb_core::wire::{CorrelationId, Reply};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::time::Instant;

struct PendingEntry {
    responder: oneshot::Sender<Reply>,
    created_at: Instant,
}

/// Outstanding requests keyed by correlation id. Settling removes the entry,
/// so a second settle for the same id is a no-op.
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<CorrelationId, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when `id` is already outstanding.
    pub fn register(&self, id: CorrelationId) -> Option<oneshot::Receiver<Reply>> {
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return None;
        }
        let (responder, receiver) = oneshot::channel();
        entries.insert(
            id,
            PendingEntry {
                responder,
                created_at: Instant::now(),
            },
        );
        Some(receiver)
    }

    /// Hands `reply` to whoever is waiting on its id. Returns false when
    /// nothing was waiting: already settled, timed out, or never sent.
    pub fn settle(&self, reply: Reply) -> bool {
        let Some(entry) = self.lock().remove(&reply.request_id) else {
            return false;
        };
        entry.responder.send(reply).is_ok()
    }

    pub fn cancel(&self, id: &CorrelationId) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn is_outstanding(&self, id: &CorrelationId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn oldest_age(&self) -> Option<std::time::Duration> {
        let now = Instant::now();
        self.lock()
            .values()
            .map(|entry| now.saturating_duration_since(entry.created_at))
            .max()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, PendingEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Cancels its request when dropped, so a timed-out or abandoned send never
/// leaves an entry behind.
pub(crate) struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    id: CorrelationId,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(pending: &'a PendingRequests, id: CorrelationId) -> Self {
        Self { pending, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.cancel(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn settle_is_idempotent() {
        let pending = PendingRequests::new();
        let id = CorrelationId::from("msg_1");
        let receiver = pending.register(id.clone()).expect("fresh id");

        assert!(pending.settle(Reply::ok(id.clone(), json!({"n": 1}))));
        assert!(!pending.settle(Reply::ok(id.clone(), json!({"n": 2}))));

        let reply = receiver.await.expect("settled");
        assert_eq!(reply.data, Some(json!({"n": 1})));
        assert!(pending.is_empty());
    }

    #[test]
    fn outstanding_ids_are_never_reused() {
        let pending = PendingRequests::new();
        let id = CorrelationId::from("msg_2");
        let _receiver = pending.register(id.clone()).expect("fresh id");
        assert!(pending.register(id.clone()).is_none());
        assert!(pending.is_outstanding(&id));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn guard_cancels_on_drop_and_late_reply_is_ignored() {
        let pending = PendingRequests::new();
        let id = CorrelationId::from("msg_3");
        let _receiver = pending.register(id.clone()).expect("fresh id");
        {
            let _guard = PendingGuard::new(&pending, id.clone());
        }
        assert!(!pending.is_outstanding(&id));
        assert!(!pending.settle(Reply::err(id, "too late")));
    }
}
