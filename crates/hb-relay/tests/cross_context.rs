use async_trait::async_trait;
use hb_core::config::{MessagingConfig, StorageConfig};
use hb_core::retry::RetryPolicy;
use hb_core::sync::{ChangedFields, SyncEvent};
use hb_core::wire::MessageType;
use hb_core::{BookmarkRecord, ContextId};
use hb_relay::{
    BackgroundRouter, BroadcastSynchronizer, CollaboratorError, ContextEndpoint, ContextHub,
    ContextRegistry, DeliveryFailure, ForegroundActions, InMemoryBackend, InjectionMode,
    InjectionState, LocalView, MessagingClient, OpenContext, SendError, SurfaceHandler,
    SyncReceiver,
};
use hb_storage::{MemoryStore, StorageLayer};
use serde_json::Map;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const PAGE: &str = "https://example.com/article";

/// Registry whose injections either bring up a document agent on the hub or
/// fail, as scripted per document.
struct ScriptedRegistry {
    hub: Arc<ContextHub>,
    tabs: Vec<OpenContext>,
    agent_loads: HashMap<ContextId, bool>,
    injections: AtomicUsize,
    spawned: Mutex<Vec<(ContextEndpoint, Arc<LocalView>)>>,
}

impl ScriptedRegistry {
    fn new(hub: Arc<ContextHub>, tabs: &[(u64, &str, bool)]) -> Self {
        Self {
            hub,
            tabs: tabs
                .iter()
                .map(|(id, url, _)| OpenContext {
                    context: ContextId::Document(*id),
                    url: (*url).to_string(),
                })
                .collect(),
            agent_loads: tabs
                .iter()
                .map(|(id, _, loads)| (ContextId::Document(*id), *loads))
                .collect(),
            injections: AtomicUsize::new(0),
            spawned: Mutex::new(Vec::new()),
        }
    }

    fn injections(&self) -> usize {
        self.injections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContextRegistry for ScriptedRegistry {
    async fn list_open_contexts(&self) -> Vec<OpenContext> {
        self.tabs.clone()
    }

    async fn inject(&self, context: &ContextId, _mode: InjectionMode) -> Result<(), CollaboratorError> {
        self.injections.fetch_add(1, Ordering::SeqCst);
        if !self.agent_loads.get(context).copied().unwrap_or(false) {
            return Err(CollaboratorError("script blocked by page".to_string()));
        }
        let url = self.url_of(context).await.unwrap_or_default();
        let agent = spawn_surface(&self.hub, *context, Some(&url)).await;
        self.spawned.lock().await.push(agent);
        Ok(())
    }
}

fn client(hub: &Arc<ContextHub>, origin: ContextId, retry: RetryPolicy) -> MessagingClient {
    MessagingClient::new(origin, hub.clone(), MessagingConfig::default(), retry)
}

async fn spawn_surface(
    hub: &Arc<ContextHub>,
    context: ContextId,
    showing: Option<&str>,
) -> (ContextEndpoint, Arc<LocalView>) {
    let view = Arc::new(LocalView::new());
    if let Some(url) = showing {
        view.show(BookmarkRecord::new(url));
    }
    let handler = Arc::new(SurfaceHandler::new(
        context,
        SyncReceiver::new(view.clone(), None),
    ));
    let endpoint = ContextEndpoint::spawn(
        hub.clone(),
        Arc::new(client(hub, context, RetryPolicy::no_retry())),
        handler,
    )
    .await;
    (endpoint, view)
}

async fn background_with_registry(
    hub: &Arc<ContextHub>,
    registry: Arc<ScriptedRegistry>,
) -> ContextEndpoint {
    let client = Arc::new(
        client(hub, ContextId::Background, RetryPolicy::default()).with_registry(registry),
    );
    let view = Arc::new(LocalView::new());
    ContextEndpoint::spawn(
        hub.clone(),
        client,
        Arc::new(SurfaceHandler::new(
            ContextId::Background,
            SyncReceiver::new(view, None),
        )),
    )
    .await
}

#[tokio::test(start_paused = true)]
async fn ping_to_uninjected_document_injects_once_and_replies_in_time() {
    let hub = Arc::new(ContextHub::new(16));
    let registry = Arc::new(ScriptedRegistry::new(hub.clone(), &[(3, PAGE, true)]));
    let background = background_with_registry(&hub, registry.clone()).await;

    let started = Instant::now();
    let reply = background
        .client()
        .send(&ContextId::Document(3), MessageType::Ping, Map::new())
        .await
        .expect("pong after injection");
    let elapsed = started.elapsed();

    assert_eq!(reply["pong"], true);
    assert_eq!(registry.injections(), 1);
    assert!(elapsed < MessagingConfig::default().tab_timeout());
    assert_eq!(
        background.client().injection_state(&ContextId::Document(3)),
        InjectionState::Ready
    );

    // The agent is live now; a second ping needs no injection.
    background
        .client()
        .send(&ContextId::Document(3), MessageType::Ping, Map::new())
        .await
        .expect("second pong");
    assert_eq!(registry.injections(), 1);
}

#[tokio::test(start_paused = true)]
async fn two_failed_injections_end_in_delivery_error() {
    let hub = Arc::new(ContextHub::new(16));
    let registry = Arc::new(ScriptedRegistry::new(hub.clone(), &[(4, PAGE, false)]));
    let background = background_with_registry(&hub, registry.clone()).await;

    let err = background
        .client()
        .send(&ContextId::Document(4), MessageType::Ping, Map::new())
        .await
        .expect_err("agent never loads");
    assert_eq!(
        err,
        SendError::Delivery {
            target: ContextId::Document(4),
            reason: DeliveryFailure::InjectionFailed
        }
    );
    assert_eq!(registry.injections(), 2);
    assert_eq!(
        background.client().injection_state(&ContextId::Document(4)),
        InjectionState::Failed
    );

    let again = background
        .client()
        .send(&ContextId::Document(4), MessageType::Ping, Map::new())
        .await
        .expect_err("still failed");
    assert_eq!(
        again,
        SendError::Delivery {
            target: ContextId::Document(4),
            reason: DeliveryFailure::InjectionPreviouslyFailed
        }
    );
    assert_eq!(registry.injections(), 2);
}

#[tokio::test(start_paused = true)]
async fn browser_pages_are_never_injected() {
    let hub = Arc::new(ContextHub::new(16));
    let registry = Arc::new(ScriptedRegistry::new(
        hub.clone(),
        &[(5, "chrome://settings", true)],
    ));
    let background = background_with_registry(&hub, registry.clone()).await;

    let err = background
        .client()
        .send(&ContextId::Document(5), MessageType::Ping, Map::new())
        .await
        .expect_err("not injectable");
    assert!(matches!(
        err,
        SendError::Delivery {
            reason: DeliveryFailure::NotInjectable,
            ..
        }
    ));
    assert_eq!(registry.injections(), 0);
}

#[tokio::test(start_paused = true)]
async fn one_silent_recipient_does_not_block_the_others() {
    let hub = Arc::new(ContextHub::new(16));
    let registry = Arc::new(ScriptedRegistry::new(
        hub.clone(),
        &[(1, PAGE, true), (2, PAGE, true), (3, "https://other.test", true)],
    ));
    let background = background_with_registry(&hub, registry.clone()).await;
    let (_surface, surface_view) =
        spawn_surface(&hub, ContextId::ControlSurface, Some(PAGE)).await;
    let (_doc_one, doc_one_view) = spawn_surface(&hub, ContextId::Document(1), Some(PAGE)).await;
    // Registered but never reads its inbox.
    let _silent = hub.register(ContextId::Document(2)).await;

    let broadcaster = BroadcastSynchronizer::new(
        background.client().clone(),
        Some(registry.clone() as Arc<dyn ContextRegistry>),
    );
    let event = SyncEvent::new(
        PAGE,
        ChangedFields::tags(vec!["rust".to_string()]),
        ContextId::Document(9),
    );

    let started = Instant::now();
    let report = broadcaster.publish(&event).await;
    let elapsed = started.elapsed();

    assert_eq!(report.deliveries.len(), 3);
    assert_eq!(report.delivered_count(), 2);
    assert!(report
        .outcome_for(&ContextId::ControlSurface)
        .expect("surface")
        .delivered());
    assert!(report
        .outcome_for(&ContextId::Document(1))
        .expect("doc 1")
        .delivered());
    let silent = report.outcome_for(&ContextId::Document(2)).expect("doc 2");
    assert!(matches!(silent.error, Some(SendError::Timeout { .. })));
    assert!(report.outcome_for(&ContextId::Document(3)).is_none());
    assert_eq!(registry.injections(), 0);

    assert_eq!(doc_one_view.current().expect("shown").tags, vec!["rust"]);
    assert_eq!(surface_view.current().expect("shown").tags, vec!["rust"]);
    assert!(elapsed < Duration::from_millis(
        MessagingConfig::default().tab_timeout_ms * RetryPolicy::default().max_attempts as u64 * 2
    ));
}

#[tokio::test(start_paused = true)]
async fn add_tag_from_the_surface_reaches_the_open_document() {
    let hub = Arc::new(ContextHub::new(16));
    let registry = Arc::new(ScriptedRegistry::new(hub.clone(), &[(7, PAGE, true)]));

    let background_client = Arc::new(
        client(&hub, ContextId::Background, RetryPolicy::no_retry())
            .with_registry(registry.clone()),
    );
    let storage = StorageLayer::new(
        Arc::new(MemoryStore::with_quota("primary", 1_000_000)),
        None,
        StorageConfig::default(),
        RetryPolicy::no_retry(),
    );
    let router = BackgroundRouter::new(
        Arc::new(InMemoryBackend::new()),
        storage.clone(),
        background_client.clone(),
        Arc::new(BroadcastSynchronizer::new(
            background_client.clone(),
            Some(registry.clone() as Arc<dyn ContextRegistry>),
        )),
    );
    let _background = ContextEndpoint::spawn(hub.clone(), background_client, Arc::new(router)).await;

    let (surface, surface_view) = spawn_surface(&hub, ContextId::ControlSurface, None).await;
    let (_document, document_view) = spawn_surface(&hub, ContextId::Document(7), Some(PAGE)).await;
    let actions = ForegroundActions::new(
        surface.client().clone(),
        Arc::new(BroadcastSynchronizer::new(
            surface.client().clone(),
            Some(registry.clone() as Arc<dyn ContextRegistry>),
        )),
        surface_view.clone(),
    );

    let outcome = actions.add_tag(PAGE, "rust async").await.expect("tagged");
    assert_eq!(outcome.record.tags, vec!["rust", "async"]);
    assert_eq!(outcome.report.failed_count(), 0);
    assert!(outcome
        .report
        .outcome_for(&ContextId::Document(7))
        .expect("document")
        .delivered());
    assert!(outcome.report.outcome_for(&ContextId::ControlSurface).is_none());
    assert_eq!(
        document_view.current().expect("shown").tags,
        vec!["rust", "async"]
    );
    assert_eq!(surface_view.current_for(PAGE).expect("shown").tags.len(), 2);

    let outcome = actions.set_toread(PAGE, true).await.expect("toread");
    assert!(outcome.record.toread);
    assert!(document_view.current().expect("shown").toread);

    storage.flush().await;
    let recent = hb_storage::layout::load_recent_tags(&storage)
        .await
        .expect("recent tags");
    assert_eq!(recent.tags, vec!["rust", "async"]);
}
