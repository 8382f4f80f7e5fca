use crate::client::MessagingClient;
use crate::hub::{ContextHub, Mailbox, Transport};
use async_trait::async_trait;
use hb_core::wire::{decode_envelope, Envelope, Reply};
use hb_core::ContextId;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// What a context does with a request addressed to it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Result<Value, HandlerError>;
}

/// A registered context: one task runs handlers to completion in arrival
/// order, another feeds replies to the context's messaging client.
pub struct ContextEndpoint {
    context: ContextId,
    hub: Arc<ContextHub>,
    client: Arc<MessagingClient>,
    dispatcher: JoinHandle<()>,
    reply_pump: JoinHandle<()>,
}

impl ContextEndpoint {
    pub async fn spawn(
        hub: Arc<ContextHub>,
        client: Arc<MessagingClient>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let context = client.origin();
        let Mailbox {
            mut requests,
            mut replies,
        } = hub.register(context).await;

        let dispatcher = {
            let hub = hub.clone();
            tokio::spawn(async move {
                while let Some(raw) = requests.recv().await {
                    dispatch(&hub, context, handler.as_ref(), raw).await;
                }
            })
        };
        let reply_pump = {
            let client = client.clone();
            tokio::spawn(async move {
                while let Some(raw) = replies.recv().await {
                    client.on_reply(&raw);
                }
            })
        };

        Self {
            context,
            hub,
            client,
            dispatcher,
            reply_pump,
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn client(&self) -> &Arc<MessagingClient> {
        &self.client
    }

    /// Tears the context down, as when a popup closes or a page navigates.
    pub async fn shutdown(self) {
        self.hub.unregister(&self.context).await;
        self.dispatcher.abort();
        self.reply_pump.abort();
    }
}

async fn dispatch(hub: &ContextHub, context: ContextId, handler: &dyn MessageHandler, raw: Value) {
    let envelope = match decode_envelope(&raw) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(
                event = "malformed_message_dropped",
                direction = "inbound",
                context = %context,
                error = %err
            );
            return;
        }
    };

    let request_id = envelope.request_id.clone();
    let origin = envelope.origin;
    let msg_type = envelope.msg_type;
    let reply = match handler.handle(envelope).await {
        Ok(data) => Reply::ok(request_id, data),
        Err(err) => {
            debug!(
                event = "request_failed",
                context = %context,
                msg_type = msg_type.as_str(),
                error = %err
            );
            Reply::err(request_id, err.0)
        }
    };

    if let Err(reason) = hub.post_reply(&origin, reply.to_value()).await {
        debug!(
            event = "reply_undeliverable",
            context = %context,
            origin = %origin,
            reason = %reason
        );
    }
}
