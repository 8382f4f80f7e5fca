use crate::collab::SurfaceRenderer;
use crate::endpoint::{HandlerError, MessageHandler};
use async_trait::async_trait;
use hb_core::sync::SyncEvent;
use hb_core::wire::{Envelope, MalformedMessage, MessageType};
use hb_core::{BookmarkRecord, ContextId};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The event is about some other bookmark, or nothing is shown.
    NotRendering,
    Unchanged,
    Updated,
}

impl ApplyOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ApplyOutcome::NotRendering => "not_rendering",
            ApplyOutcome::Unchanged => "unchanged",
            ApplyOutcome::Updated => "updated",
        }
    }
}

#[derive(Default)]
pub struct LocalView {
    current: Mutex<Option<BookmarkRecord>>,
}

impl LocalView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn show(&self, record: BookmarkRecord) {
        *self.lock() = Some(record);
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    pub fn current(&self) -> Option<BookmarkRecord> {
        self.lock().clone()
    }

    pub fn current_for(&self, url: &str) -> Option<BookmarkRecord> {
        self.lock().as_ref().filter(|record| record.url == url).cloned()
    }

    pub fn apply(&self, event: &SyncEvent) -> (ApplyOutcome, Option<BookmarkRecord>) {
        let mut current = self.lock();
        match current.as_mut() {
            Some(record) if record.url == event.subject_url => {
                if event.changed_fields.apply_to(record) {
                    (ApplyOutcome::Updated, Some(record.clone()))
                } else {
                    (ApplyOutcome::Unchanged, None)
                }
            }
            _ => (ApplyOutcome::NotRendering, None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<BookmarkRecord>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct SyncReceiver {
    view: Arc<LocalView>,
    renderer: Option<Arc<dyn SurfaceRenderer>>,
}

impl SyncReceiver {
    pub fn new(view: Arc<LocalView>, renderer: Option<Arc<dyn SurfaceRenderer>>) -> Self {
        Self { view, renderer }
    }

    pub fn view(&self) -> &Arc<LocalView> {
        &self.view
    }

    pub fn receive(&self, envelope: &Envelope) -> Result<ApplyOutcome, MalformedMessage> {
        if !envelope.msg_type.is_sync_notification() {
            return Err(MalformedMessage::InvalidData {
                msg_type: envelope.msg_type,
                reason: "not a sync notification".to_string(),
            });
        }
        let event: SyncEvent = serde_json::from_value(Value::Object(envelope.data.clone()))
            .map_err(|err| MalformedMessage::InvalidData {
                msg_type: envelope.msg_type,
                reason: err.to_string(),
            })?;

        let (outcome, updated) = self.view.apply(&event);
        if let (Some(record), Some(renderer)) = (updated, &self.renderer) {
            renderer.redraw(&record);
        }
        debug!(
            event = "sync_applied",
            subject = %event.subject_url,
            source = %event.source_context,
            outcome = outcome.as_str()
        );
        Ok(outcome)
    }
}

/// Handler for the control surface and document agents: answers pings,
/// applies sync notifications and reports what it is showing.
pub struct SurfaceHandler {
    context: ContextId,
    receiver: SyncReceiver,
}

impl SurfaceHandler {
    pub fn new(context: ContextId, receiver: SyncReceiver) -> Self {
        Self { context, receiver }
    }
}

#[async_trait]
impl MessageHandler for SurfaceHandler {
    async fn handle(&self, envelope: Envelope) -> Result<Value, HandlerError> {
        match envelope.msg_type {
            MessageType::Ping => Ok(json!({"pong": true, "context": self.context.to_string()})),
            MessageType::BookmarkUpdated | MessageType::TagUpdated => {
                let outcome = self
                    .receiver
                    .receive(&envelope)
                    .map_err(|err| HandlerError::new(err.to_string()))?;
                Ok(json!({"applied": outcome.as_str()}))
            }
            MessageType::RefreshData => {
                let current = self.receiver.view().current();
                serde_json::to_value(current).map_err(|err| HandlerError::new(err.to_string()))
            }
            other => Err(HandlerError::new(format!(
                "{other} is not handled by {}",
                self.context
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hb_core::sync::ChangedFields;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRenderer {
        redraws: AtomicUsize,
    }

    impl SurfaceRenderer for CountingRenderer {
        fn redraw(&self, _record: &BookmarkRecord) {
            self.redraws.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn sync_envelope(event: &SyncEvent) -> Envelope {
        let Value::Object(data) = serde_json::to_value(event).expect("encode") else {
            panic!("event encodes as an object")
        };
        Envelope::new(event.message_type(), data, event.source_context)
    }

    fn receiver_showing(url: &str) -> (SyncReceiver, Arc<CountingRenderer>) {
        let view = Arc::new(LocalView::new());
        view.show(BookmarkRecord::new(url));
        let renderer = Arc::new(CountingRenderer::default());
        (
            SyncReceiver::new(view, Some(renderer.clone() as Arc<dyn SurfaceRenderer>)),
            renderer,
        )
    }

    #[test]
    fn matching_subject_is_merged_and_redrawn() {
        let (receiver, renderer) = receiver_showing("https://example.com");
        let event = SyncEvent::new(
            "https://example.com",
            ChangedFields::tags(vec!["rust".to_string()]),
            ContextId::ControlSurface,
        );
        let outcome = receiver.receive(&sync_envelope(&event)).expect("valid");
        assert_eq!(outcome, ApplyOutcome::Updated);
        assert_eq!(renderer.redraws.load(Ordering::SeqCst), 1);
        assert_eq!(
            receiver.view().current().expect("shown").tags,
            vec!["rust"]
        );

        let again = receiver.receive(&sync_envelope(&event)).expect("valid");
        assert_eq!(again, ApplyOutcome::Unchanged);
        assert_eq!(renderer.redraws.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn other_subject_is_a_silent_no_op() {
        let (receiver, renderer) = receiver_showing("https://example.com");
        let event = SyncEvent::new(
            "https://other.test",
            ChangedFields {
                toread: Some(true),
                ..ChangedFields::default()
            },
            ContextId::Background,
        );
        let outcome = receiver.receive(&sync_envelope(&event)).expect("valid");
        assert_eq!(outcome, ApplyOutcome::NotRendering);
        assert_eq!(renderer.redraws.load(Ordering::SeqCst), 0);
        assert!(!receiver.view().current().expect("shown").toread);
    }

    #[test]
    fn non_sync_payloads_are_malformed() {
        let (receiver, _) = receiver_showing("https://example.com");
        let ping = Envelope::new(MessageType::Ping, Map::new(), ContextId::Background);
        assert!(receiver.receive(&ping).is_err());

        let mut bogus = Map::new();
        bogus.insert("subjectUrl".to_string(), json!(42));
        let envelope = Envelope::new(MessageType::TagUpdated, bogus, ContextId::Background);
        assert!(receiver.receive(&envelope).is_err());
    }

    #[tokio::test]
    async fn surface_handler_answers_ping_and_refresh() {
        let view = Arc::new(LocalView::new());
        view.show(BookmarkRecord::new("https://example.com"));
        let handler = SurfaceHandler::new(
            ContextId::Document(2),
            SyncReceiver::new(view, None),
        );

        let pong = handler
            .handle(Envelope::new(MessageType::Ping, Map::new(), ContextId::Background))
            .await
            .expect("pong");
        assert_eq!(pong["context"], "document:2");

        let shown = handler
            .handle(Envelope::new(MessageType::RefreshData, Map::new(), ContextId::Background))
            .await
            .expect("refresh");
        assert_eq!(shown["url"], "https://example.com");

        let err = handler
            .handle(Envelope::new(MessageType::GetTabId, Map::new(), ContextId::Background))
            .await
            .expect_err("unsupported");
        assert!(err.0.contains("getTabId"));
    }
}
