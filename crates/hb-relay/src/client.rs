use crate::collab::{ContextRegistry, InjectionMode};
use crate::hub::Transport;
use crate::injection::{is_injectable_url, InjectionEvent, InjectionState, InjectionTracker};
use crate::pending::{PendingGuard, PendingRequests};
use crate::{DeliveryFailure, SendError};
use hb_core::config::MessagingConfig;
use hb_core::retry::RetryPolicy;
use hb_core::wire::{decode_envelope, decode_reply, Envelope, MalformedMessage, MessageType, Reply};
use hb_core::ContextId;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const INJECTION_MODES: [InjectionMode; 2] = [InjectionMode::Primary, InjectionMode::Fallback];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Budget for one wait; reset after every injection step.
    pub timeout: Duration,
    pub inject: bool,
}

pub struct MessagingClient {
    origin: ContextId,
    transport: Arc<dyn Transport>,
    registry: Option<Arc<dyn ContextRegistry>>,
    pending: PendingRequests,
    injection: InjectionTracker,
    config: MessagingConfig,
    retry: RetryPolicy,
}

impl MessagingClient {
    pub fn new(
        origin: ContextId,
        transport: Arc<dyn Transport>,
        config: MessagingConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            origin,
            transport,
            registry: None,
            pending: PendingRequests::new(),
            injection: InjectionTracker::new(),
            config,
            retry,
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn ContextRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn origin(&self) -> ContextId {
        self.origin
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn injection_state(&self, target: &ContextId) -> InjectionState {
        self.injection.state(target)
    }

    pub fn options_for(&self, target: &ContextId) -> SendOptions {
        if target.is_document() {
            SendOptions {
                timeout: self.config.tab_timeout(),
                inject: self.registry.is_some(),
            }
        } else {
            SendOptions {
                timeout: self.config.request_timeout(),
                inject: false,
            }
        }
    }

    pub async fn is_live(&self, target: &ContextId) -> bool {
        self.transport.is_live(target).await
    }

    pub async fn send(
        &self,
        target: &ContextId,
        msg_type: MessageType,
        data: Map<String, Value>,
    ) -> Result<Value, SendError> {
        let envelope = Envelope::new(msg_type, data, self.origin);
        self.send_with(target, envelope, self.options_for(target))
            .await
    }

    /// Sends `envelope` and waits for its reply. Unanswered attempts are
    /// re-issued under the retry policy with a fresh correlation id; at most
    /// two injections happen across the whole chain.
    pub async fn send_with(
        &self,
        target: &ContextId,
        envelope: Envelope,
        options: SendOptions,
    ) -> Result<Value, SendError> {
        if let Err(source) = decode_envelope(&envelope.to_value()) {
            warn!(
                event = "malformed_message_dropped",
                direction = "outbound",
                context = %target,
                msg_type = envelope.msg_type.as_str(),
                error = %source
            );
            return Err(SendError::Malformed {
                target: *target,
                source,
            });
        }

        let injections = AtomicUsize::new(0);
        let injections = &injections;
        let envelope = &envelope;
        let options = &options;
        self.retry
            .run(
                "send",
                move |attempt| async move {
                    let outgoing = if attempt == 1 {
                        envelope.clone()
                    } else {
                        envelope.reissue()
                    };
                    self.attempt(target, outgoing, options, injections).await
                },
                SendError::is_retryable,
            )
            .await
    }

    pub fn on_reply(&self, raw: &Value) {
        match decode_reply(raw) {
            Ok(reply) => {
                let id = reply.request_id.clone();
                if !self.pending.settle(reply) {
                    debug!(event = "late_reply_ignored", origin = %self.origin, correlation_id = %id);
                }
            }
            Err(err) => {
                warn!(
                    event = "malformed_message_dropped",
                    direction = "reply",
                    origin = %self.origin,
                    error = %err
                );
            }
        }
    }

    pub fn mark_ready(&self, context: &ContextId) -> InjectionState {
        self.injection.apply(context, InjectionEvent::ReadySignal)
    }

    pub fn context_recreated(&self, context: &ContextId) -> InjectionState {
        self.injection.apply(context, InjectionEvent::Recreated)
    }

    async fn attempt(
        &self,
        target: &ContextId,
        envelope: Envelope,
        options: &SendOptions,
        injections: &AtomicUsize,
    ) -> Result<Value, SendError> {
        let id = envelope.request_id.clone();
        let Some(receiver) = self.pending.register(id.clone()) else {
            return Err(SendError::Malformed {
                target: *target,
                source: MalformedMessage::InvalidField {
                    field: "requestId",
                    reason: "already outstanding".to_string(),
                },
            });
        };
        let _pending = PendingGuard::new(&self.pending, id.clone());
        let payload = envelope.to_value();

        let mut deadline = Instant::now() + options.timeout;
        match self.transport.post_request(target, payload.clone()).await {
            Ok(()) => {}
            Err(DeliveryFailure::RecipientAbsent) if options.inject && target.is_document() => {
                debug!(event = "recipient_absent", context = %target, correlation_id = %id);
                self.inject_and_repost(target, &payload, options, injections)
                    .await?;
                deadline = Instant::now() + options.timeout;
            }
            Err(reason) => {
                debug!(event = "delivery_failed", context = %target, reason = %reason);
                return Err(SendError::Delivery {
                    target: *target,
                    reason,
                });
            }
        }

        match tokio::time::timeout_at(deadline, receiver).await {
            Ok(Ok(reply)) => {
                if target.is_document() {
                    self.injection.apply(target, InjectionEvent::Delivered);
                }
                interpret(target, envelope.msg_type, reply)
            }
            Ok(Err(_)) => Err(SendError::Delivery {
                target: *target,
                reason: DeliveryFailure::PortClosed,
            }),
            Err(_) => {
                let timeout_ms = options.timeout.as_millis() as u64;
                warn!(
                    event = "send_timeout",
                    context = %target,
                    correlation_id = %id,
                    msg_type = envelope.msg_type.as_str(),
                    timeout_ms
                );
                Err(SendError::Timeout {
                    target: *target,
                    timeout_ms,
                })
            }
        }
    }

    async fn inject_and_repost(
        &self,
        target: &ContextId,
        payload: &Value,
        options: &SendOptions,
        injections: &AtomicUsize,
    ) -> Result<(), SendError> {
        let delivery = |reason| SendError::Delivery {
            target: *target,
            reason,
        };
        if self.injection.state(target) == InjectionState::Failed {
            return Err(delivery(DeliveryFailure::InjectionPreviouslyFailed));
        }
        let Some(registry) = &self.registry else {
            return Err(delivery(DeliveryFailure::RecipientAbsent));
        };
        self.injection.apply(target, InjectionEvent::RecipientAbsent);

        if let Some(url) = registry.url_of(target).await {
            if !is_injectable_url(&url) {
                warn!(event = "injection_failed", context = %target, url = %url, reason = "not injectable");
                self.injection.apply(target, InjectionEvent::InjectionExhausted);
                return Err(delivery(DeliveryFailure::NotInjectable));
            }
        }

        let used = injections.load(Ordering::SeqCst);
        for mode in INJECTION_MODES.into_iter().skip(used) {
            injections.fetch_add(1, Ordering::SeqCst);
            let settle = match mode {
                InjectionMode::Primary => self.config.injection_settle(),
                InjectionMode::Fallback => self.config.fallback_settle(),
            };
            info!(event = "injection_attempt", context = %target, mode = mode.as_str());

            let step = async {
                registry
                    .inject(target, mode)
                    .await
                    .map_err(|err| err.to_string())?;
                tokio::time::sleep(settle).await;
                self.transport
                    .post_request(target, payload.clone())
                    .await
                    .map_err(|reason| reason.to_string())
            };
            match tokio::time::timeout(options.timeout, step).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(error)) => {
                    warn!(
                        event = "injection_failed",
                        context = %target,
                        mode = mode.as_str(),
                        error = %error
                    );
                }
                Err(_) => {
                    warn!(
                        event = "send_timeout",
                        context = %target,
                        stage = "injection",
                        mode = mode.as_str()
                    );
                    return Err(SendError::Timeout {
                        target: *target,
                        timeout_ms: options.timeout.as_millis() as u64,
                    });
                }
            }
        }

        self.injection
            .apply(target, InjectionEvent::InjectionExhausted);
        Err(delivery(DeliveryFailure::InjectionFailed))
    }
}

fn interpret(target: &ContextId, msg_type: MessageType, reply: Reply) -> Result<Value, SendError> {
    if reply.success {
        return Ok(reply.data.unwrap_or(Value::Null));
    }
    Err(SendError::Rejected {
        target: *target,
        msg_type,
        message: reply
            .error
            .unwrap_or_else(|| "request failed".to_string()),
    })
}
