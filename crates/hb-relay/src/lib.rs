//! Cross-context messaging: the in-process hub, the messaging client with
//! agent injection, per-context dispatch and the broadcast synchronizer.

use hb_core::wire::{MalformedMessage, MessageType};
use hb_core::ContextId;
use thiserror::Error;

pub mod actions;
pub mod broadcast;
pub mod client;
pub mod collab;
pub mod endpoint;
pub mod hub;
pub mod injection;
pub mod pending;
pub mod router;
pub mod view;

pub use actions::{ActionError, ActionOutcome, ForegroundActions};
pub use broadcast::{BroadcastReport, BroadcastSynchronizer, DeliveryOutcome};
pub use client::{MessagingClient, SendOptions};
pub use collab::{
    BookmarkBackend, CollaboratorError, ContextRegistry, InMemoryBackend, InjectionMode,
    OpenContext, SurfaceRenderer,
};
pub use endpoint::{ContextEndpoint, HandlerError, MessageHandler};
pub use hub::{ContextHub, Mailbox, Transport};
pub use injection::{InjectionEvent, InjectionState, InjectionTracker};
pub use pending::PendingRequests;
pub use router::BackgroundRouter;
pub use view::{ApplyOutcome, LocalView, SurfaceHandler, SyncReceiver};

/// Why a message never reached its recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    #[error("recipient is not registered")]
    RecipientAbsent,
    #[error("agent injection failed")]
    InjectionFailed,
    #[error("document does not allow agent injection")]
    NotInjectable,
    #[error("recipient port closed")]
    PortClosed,
    #[error("recipient inbox is full")]
    InboxFull,
    #[error("agent injection previously failed for this document")]
    InjectionPreviouslyFailed,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SendError {
    #[error("no reply from {target} within {timeout_ms} ms")]
    Timeout { target: ContextId, timeout_ms: u64 },
    #[error("could not deliver to {target}: {reason}")]
    Delivery {
        target: ContextId,
        reason: DeliveryFailure,
    },
    #[error("{target} rejected {msg_type}: {message}")]
    Rejected {
        target: ContextId,
        msg_type: MessageType,
        message: String,
    },
    #[error("malformed message for {target}: {source}")]
    Malformed {
        target: ContextId,
        #[source]
        source: MalformedMessage,
    },
}

impl SendError {
    /// An unanswered request, or one bounced off a busy inbox, is worth
    /// sending again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SendError::Timeout { .. }
                | SendError::Delivery {
                    reason: DeliveryFailure::InboxFull,
                    ..
                }
        )
    }

    pub fn target(&self) -> ContextId {
        match self {
            SendError::Timeout { target, .. }
            | SendError::Delivery { target, .. }
            | SendError::Rejected { target, .. }
            | SendError::Malformed { target, .. } => *target,
        }
    }
}
