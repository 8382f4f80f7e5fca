use anyhow::{bail, Result};
use async_trait::async_trait;
use clap::Args;
use futures_util::future::join_all;
use hb_core::config::HoverboardConfig;
use hb_core::wire::MessageType;
use hb_core::{BookmarkRecord, ContextId};
use hb_relay::{
    BackgroundRouter, BroadcastSynchronizer, CollaboratorError, ContextEndpoint, ContextHub,
    ContextRegistry, ForegroundActions, InMemoryBackend, InjectionMode, LocalView,
    MessagingClient, OpenContext, SurfaceHandler, SyncReceiver,
};
use hb_storage::{MemoryStore, StorageLayer};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Ceiling of the host's synced storage area.
const SECONDARY_QUOTA_BYTES: u64 = 100 * 1024;

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Number of open documents showing the page.
    #[arg(long, default_value_t = 3)]
    pub documents: u64,
    /// How many of them refuse the agent (the highest ids).
    #[arg(long, default_value_t = 0)]
    pub blocked: u64,
    #[arg(long, default_value = "https://example.com/")]
    pub url: String,
    #[arg(long, default_value = "demo")]
    pub tag: String,
}

/// Stands in for the browser's tab list; injecting brings a document agent
/// up on the hub unless the document is blocked.
struct SimRegistry {
    hub: Arc<ContextHub>,
    config: HoverboardConfig,
    tabs: Vec<OpenContext>,
    first_blocked: u64,
    agents: Mutex<Vec<ContextEndpoint>>,
}

#[async_trait]
impl ContextRegistry for SimRegistry {
    async fn list_open_contexts(&self) -> Vec<OpenContext> {
        self.tabs.clone()
    }

    async fn inject(&self, context: &ContextId, mode: InjectionMode) -> Result<(), CollaboratorError> {
        let Some(id) = context.document_id() else {
            return Err(CollaboratorError(format!("{context} is not a document")));
        };
        if id >= self.first_blocked {
            return Err(CollaboratorError(format!(
                "{} injection refused by page",
                mode.as_str()
            )));
        }
        let url = self.url_of(context).await.unwrap_or_default();
        let agent = spawn_surface(&self.hub, &self.config, *context, Some(url)).await;
        self.agents.lock().await.push(agent.0);
        Ok(())
    }
}

async fn spawn_surface(
    hub: &Arc<ContextHub>,
    config: &HoverboardConfig,
    context: ContextId,
    showing: Option<String>,
) -> (ContextEndpoint, Arc<LocalView>) {
    let view = Arc::new(LocalView::new());
    if let Some(url) = showing {
        view.show(BookmarkRecord::new(url));
    }
    let client = Arc::new(MessagingClient::new(
        context,
        hub.clone(),
        config.messaging.clone(),
        config.retry.clone(),
    ));
    let handler = Arc::new(SurfaceHandler::new(
        context,
        SyncReceiver::new(view.clone(), None),
    ));
    (ContextEndpoint::spawn(hub.clone(), client, handler).await, view)
}

pub async fn run(config: &HoverboardConfig, args: SimulateArgs) -> Result<()> {
    if args.documents == 0 {
        bail!("Simulate at least one document");
    }
    let hub = Arc::new(ContextHub::new(config.messaging.inbox_capacity));
    let registry = Arc::new(SimRegistry {
        hub: hub.clone(),
        config: config.clone(),
        tabs: (1..=args.documents)
            .map(|id| OpenContext {
                context: ContextId::Document(id),
                url: args.url.clone(),
            })
            .collect(),
        first_blocked: args.documents.saturating_sub(args.blocked) + 1,
        agents: Mutex::new(Vec::new()),
    });
    let registry_dyn: Arc<dyn ContextRegistry> = registry.clone();

    let background_client = Arc::new(
        MessagingClient::new(
            ContextId::Background,
            hub.clone(),
            config.messaging.clone(),
            config.retry.clone(),
        )
        .with_registry(registry_dyn.clone()),
    );
    let storage = StorageLayer::new(
        Arc::new(MemoryStore::with_quota("primary", crate::storage::DEFAULT_QUOTA_BYTES)),
        Some(Arc::new(MemoryStore::with_quota(
            "secondary",
            SECONDARY_QUOTA_BYTES,
        ))),
        config.storage.clone(),
        config.retry.clone(),
    );
    let router = BackgroundRouter::new(
        Arc::new(InMemoryBackend::new()),
        storage.clone(),
        background_client.clone(),
        Arc::new(BroadcastSynchronizer::new(
            background_client.clone(),
            Some(registry_dyn.clone()),
        )),
    )
    .with_registry(registry_dyn.clone());
    let background = ContextEndpoint::spawn(hub.clone(), background_client.clone(), Arc::new(router)).await;

    let (surface, surface_view) =
        spawn_surface(&hub, config, ContextId::ControlSurface, None).await;
    info!(event = "simulation_started", documents = args.documents, blocked = args.blocked);

    // Reach every document once so agents get injected where the page allows.
    let pings = join_all(registry.tabs.iter().map(|open| {
        let client = background_client.clone();
        async move {
            let result = client
                .send(&open.context, MessageType::Ping, Map::new())
                .await;
            match result {
                Ok(_) => json!({"context": open.context.to_string(), "reachable": true}),
                Err(err) => json!({
                    "context": open.context.to_string(),
                    "reachable": false,
                    "error": err.to_string(),
                    "state": client.injection_state(&open.context).as_str(),
                }),
            }
        }
    }))
    .await;

    let actions = ForegroundActions::new(
        surface.client().clone(),
        Arc::new(BroadcastSynchronizer::new(
            surface.client().clone(),
            Some(registry_dyn),
        )),
        surface_view,
    );
    let action = match actions.add_tag(&args.url, &args.tag).await {
        Ok(outcome) => json!({
            "record": outcome.record,
            "broadcast": outcome.report.to_value(),
        }),
        Err(err) => json!({"error": err.user_message()}),
    };

    let output: Value = json!({
        "pings": pings,
        "addTag": action,
        "storage": {
            "pending": storage.pending_len(),
            "flushed": storage.close().await,
        },
    });

    surface.shutdown().await;
    background.shutdown().await;
    for agent in registry.agents.lock().await.drain(..) {
        agent.shutdown().await;
    }
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
