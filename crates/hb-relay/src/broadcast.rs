use crate::client::MessagingClient;
use crate::collab::ContextRegistry;
use crate::SendError;
use futures_util::future::join_all;
use hb_core::sync::SyncEvent;
use hb_core::wire::{Envelope, MessageType};
use hb_core::ContextId;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub context: ContextId,
    pub error: Option<SendError>,
}

impl DeliveryOutcome {
    pub fn delivered(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastReport {
    pub subject_url: String,
    pub msg_type: MessageType,
    pub deliveries: Vec<DeliveryOutcome>,
}

impl BroadcastReport {
    pub fn delivered_count(&self) -> usize {
        self.deliveries.iter().filter(|d| d.delivered()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.deliveries.len() - self.delivered_count()
    }

    pub fn outcome_for(&self, context: &ContextId) -> Option<&DeliveryOutcome> {
        self.deliveries.iter().find(|d| d.context == *context)
    }

    pub fn to_value(&self) -> Value {
        let deliveries = self
            .deliveries
            .iter()
            .map(|delivery| match &delivery.error {
                None => json!({"context": delivery.context.to_string(), "delivered": true}),
                Some(err) => json!({
                    "context": delivery.context.to_string(),
                    "delivered": false,
                    "error": err.to_string(),
                }),
            })
            .collect::<Vec<_>>();
        json!({
            "subjectUrl": self.subject_url,
            "type": self.msg_type.as_str(),
            "delivered": self.delivered_count(),
            "failed": self.failed_count(),
            "deliveries": deliveries,
        })
    }
}

/// Best-effort fan-out of one confirmed change. Each recipient gets its own
/// send with its own timeout; one slow or missing recipient never holds up
/// the others and never fails the publish.
pub struct BroadcastSynchronizer {
    client: Arc<MessagingClient>,
    registry: Option<Arc<dyn ContextRegistry>>,
}

impl BroadcastSynchronizer {
    pub fn new(client: Arc<MessagingClient>, registry: Option<Arc<dyn ContextRegistry>>) -> Self {
        Self { client, registry }
    }

    /// Every live context other than the event's source and the publisher.
    pub async fn recipients(&self, event: &SyncEvent) -> Vec<ContextId> {
        let publisher = self.client.origin();
        let excluded = |context: &ContextId| *context == publisher || *context == event.source_context;

        let mut recipients = Vec::new();
        if !excluded(&ContextId::ControlSurface)
            && self.client.is_live(&ContextId::ControlSurface).await
        {
            recipients.push(ContextId::ControlSurface);
        }
        if let Some(registry) = &self.registry {
            let mut documents = registry
                .list_open_contexts()
                .await
                .into_iter()
                .filter(|open| open.url == event.subject_url && !excluded(&open.context))
                .map(|open| open.context)
                .collect::<Vec<_>>();
            documents.sort();
            documents.dedup();
            recipients.extend(documents);
        }
        if !excluded(&ContextId::Background) {
            recipients.push(ContextId::Background);
        }
        recipients
    }

    pub async fn publish(&self, event: &SyncEvent) -> BroadcastReport {
        let msg_type = event.message_type();
        let data = match serde_json::to_value(event) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let recipients = self.recipients(event).await;

        let sends = recipients.iter().map(|target| {
            let envelope = Envelope::new(msg_type, data.clone(), self.client.origin());
            let mut options = self.client.options_for(target);
            options.inject = false;
            async move {
                let result = self.client.send_with(target, envelope, options).await;
                DeliveryOutcome {
                    context: *target,
                    error: result.err(),
                }
            }
        });
        let deliveries = join_all(sends).await;

        for delivery in &deliveries {
            if let Some(err) = &delivery.error {
                warn!(
                    event = "broadcast_delivery_failed",
                    context = %delivery.context,
                    subject = %event.subject_url,
                    error = %err
                );
            }
        }
        let report = BroadcastReport {
            subject_url: event.subject_url.clone(),
            msg_type,
            deliveries,
        };
        info!(
            event = "broadcast_complete",
            subject = %report.subject_url,
            msg_type = msg_type.as_str(),
            delivered = report.delivered_count(),
            failed = report.failed_count()
        );
        report
    }
}
