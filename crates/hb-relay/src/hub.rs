use crate::DeliveryFailure;
use async_trait::async_trait;
use hb_core::ContextId;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Moves raw wire values between contexts. Requests and replies travel on
/// separate lanes so a context busy handling a request can still receive the
/// replies it is waiting on.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_request(&self, target: &ContextId, message: Value) -> Result<(), DeliveryFailure>;

    async fn post_reply(&self, target: &ContextId, reply: Value) -> Result<(), DeliveryFailure>;

    async fn is_live(&self, target: &ContextId) -> bool;
}

pub struct Mailbox {
    pub requests: mpsc::Receiver<Value>,
    pub replies: mpsc::Receiver<Value>,
}

#[derive(Clone)]
struct Route {
    requests: mpsc::Sender<Value>,
    replies: mpsc::Sender<Value>,
}

impl Route {
    fn is_closed(&self) -> bool {
        self.requests.is_closed() || self.replies.is_closed()
    }
}

#[derive(Clone, Copy)]
enum Lane {
    Request,
    Reply,
}

/// In-process stand-in for the host's runtime messaging: one bounded inbox
/// pair per live context.
pub struct ContextHub {
    capacity: usize,
    routes: RwLock<HashMap<ContextId, Route>>,
}

impl ContextHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `context`, replacing any previous instance of it.
    pub async fn register(&self, context: ContextId) -> Mailbox {
        let (request_tx, request_rx) = mpsc::channel(self.capacity);
        let (reply_tx, reply_rx) = mpsc::channel(self.capacity);
        let previous = self.routes.write().await.insert(
            context,
            Route {
                requests: request_tx,
                replies: reply_tx,
            },
        );
        info!(
            event = "context_registered",
            context = %context,
            replaced = previous.is_some()
        );
        Mailbox {
            requests: request_rx,
            replies: reply_rx,
        }
    }

    pub async fn unregister(&self, context: &ContextId) -> bool {
        let removed = self.routes.write().await.remove(context).is_some();
        if removed {
            info!(event = "context_unregistered", context = %context);
        }
        removed
    }

    pub async fn live_contexts(&self) -> Vec<ContextId> {
        let mut live = self
            .routes
            .read()
            .await
            .iter()
            .filter(|(_, route)| !route.is_closed())
            .map(|(context, _)| *context)
            .collect::<Vec<_>>();
        live.sort();
        live
    }

    async fn post(&self, target: &ContextId, lane: Lane, message: Value) -> Result<(), DeliveryFailure> {
        let route = self.routes.read().await.get(target).cloned();
        let Some(route) = route else {
            debug!(event = "recipient_absent", context = %target);
            return Err(DeliveryFailure::RecipientAbsent);
        };
        let sender = match lane {
            Lane::Request => route.requests,
            Lane::Reply => route.replies,
        };

        match sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.unregister(target).await;
                Err(DeliveryFailure::PortClosed)
            }
            // The context is alive, just busy; it stays registered.
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "inbox_backpressure", context = %target);
                Err(DeliveryFailure::InboxFull)
            }
        }
    }
}

#[async_trait]
impl Transport for ContextHub {
    async fn post_request(&self, target: &ContextId, message: Value) -> Result<(), DeliveryFailure> {
        self.post(target, Lane::Request, message).await
    }

    async fn post_reply(&self, target: &ContextId, reply: Value) -> Result<(), DeliveryFailure> {
        self.post(target, Lane::Reply, reply).await
    }

    async fn is_live(&self, target: &ContextId) -> bool {
        self.routes
            .read()
            .await
            .get(target)
            .is_some_and(|route| !route.is_closed())
    }
}
