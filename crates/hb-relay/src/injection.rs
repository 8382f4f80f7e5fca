use hb_core::ContextId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::info;
use url::Url;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InjectionState {
    #[default]
    Unknown,
    Injecting,
    Ready,
    /// Terminal until the document is recreated.
    Failed,
}

impl InjectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            InjectionState::Unknown => "unknown",
            InjectionState::Injecting => "injecting",
            InjectionState::Ready => "ready",
            InjectionState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionEvent {
    RecipientAbsent,
    Delivered,
    ReadySignal,
    /// Primary and fallback injection both failed, or the document refuses
    /// injection outright.
    InjectionExhausted,
    Recreated,
}

pub fn transition(state: InjectionState, event: InjectionEvent) -> InjectionState {
    use InjectionEvent as E;
    use InjectionState as S;

    match (state, event) {
        (_, E::Recreated) => S::Unknown,
        (S::Failed, _) => S::Failed,
        (_, E::Delivered | E::ReadySignal) => S::Ready,
        (_, E::RecipientAbsent) => S::Injecting,
        (_, E::InjectionExhausted) => S::Failed,
    }
}

/// Browser-internal pages never accept the document agent.
pub fn is_injectable_url(raw: &str) -> bool {
    let Ok(url) = Url::parse(raw) else {
        return false;
    };
    !matches!(
        url.scheme(),
        "chrome"
            | "chrome-extension"
            | "chrome-search"
            | "edge"
            | "about"
            | "moz-extension"
            | "safari-web-extension"
            | "view-source"
            | "devtools"
    )
}

#[derive(Default)]
pub struct InjectionTracker {
    states: Mutex<HashMap<ContextId, InjectionState>>,
}

impl InjectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, context: &ContextId) -> InjectionState {
        self.lock().get(context).copied().unwrap_or_default()
    }

    pub fn apply(&self, context: &ContextId, event: InjectionEvent) -> InjectionState {
        let mut states = self.lock();
        let current = states.get(context).copied().unwrap_or_default();
        let next = transition(current, event);
        if next != current {
            info!(
                event = "injection_state",
                context = %context,
                from = current.as_str(),
                to = next.as_str(),
                cause = ?event
            );
        }
        if next == InjectionState::Unknown {
            states.remove(context);
        } else {
            states.insert(*context, next);
        }
        next
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ContextId, InjectionState>> {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
