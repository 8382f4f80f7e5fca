use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use hb_core::config::HoverboardConfig;
use hb_storage::layout::{
    add_recent_tag, load_inhibit_list, load_recent_tags, save_inhibit_list,
};
use hb_storage::{EvictionReport, QuotaLevel, SqliteStore, StorageLayer, WriteAck};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// Matches the host's default local-storage allowance.
pub const DEFAULT_QUOTA_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// SQLite file; defaults to <data dir>/hoverboard/storage.db.
    #[arg(long, env = "HB_STORE")]
    pub db: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_QUOTA_BYTES)]
    pub quota_bytes: u64,
}

impl StoreArgs {
    fn db_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.db {
            return Ok(path.clone());
        }
        let Some(dir) = dirs::data_dir() else {
            bail!("No data directory available; pass --db");
        };
        Ok(dir.join("hoverboard").join("storage.db"))
    }

    pub fn open_layer(&self, config: &HoverboardConfig) -> Result<StorageLayer> {
        let path = self.db_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let store = SqliteStore::open(&path, self.quota_bytes)
            .with_context(|| format!("Failed to open store at {}", path.display()))?;
        Ok(StorageLayer::new(
            Arc::new(store),
            None,
            config.storage.clone(),
            config.retry.clone(),
        ))
    }
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum StorageCommand {
    Get { keys: Vec<String> },
    /// VALUE is parsed as JSON, falling back to a plain string.
    Set { key: String, value: String },
    #[command(alias = "rm")]
    Remove { keys: Vec<String> },
    Quota,
    Evict,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum RecentTagsCommand {
    /// Space-separated tags, most recent first.
    Add { tags: String },
    List,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum InhibitCommand {
    Add { url: String },
    #[command(alias = "rm")]
    Remove { url: String },
    List,
    /// Exit status reflects whether URL is inhibited.
    Check { url: String },
}

pub async fn run_storage(
    store: &StoreArgs,
    config: &HoverboardConfig,
    action: StorageCommand,
) -> Result<()> {
    let layer = store.open_layer(config)?;
    let output = match action {
        StorageCommand::Get { keys } => {
            if keys.is_empty() {
                bail!("Name at least one key");
            }
            Value::Object(layer.read(&keys).await?.into_iter().collect())
        }
        StorageCommand::Set { key, value } => {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            let ack = layer.write(BTreeMap::from([(key, value)])).await?;
            ack_json(&ack)
        }
        StorageCommand::Remove { keys } => {
            if keys.is_empty() {
                bail!("Name at least one key");
            }
            ack_json(&layer.remove(keys).await?)
        }
        StorageCommand::Quota => {
            let snapshot = layer.quota(true);
            let level = QuotaLevel::classify(snapshot.usage_percent, layer.config());
            json!({
                "usedBytes": snapshot.used_bytes,
                "totalBytes": snapshot.total_bytes,
                "usagePercent": snapshot.usage_percent,
                "level": level.as_str(),
            })
        }
        StorageCommand::Evict => eviction_json(&layer.evict()),
    };
    layer.close().await;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

pub async fn run_recent_tags(
    store: &StoreArgs,
    config: &HoverboardConfig,
    action: RecentTagsCommand,
) -> Result<()> {
    let layer = store.open_layer(config)?;
    let recent = match action {
        RecentTagsCommand::Add { tags } => {
            let now_ms = Utc::now().timestamp_millis();
            let (recent, ack) = add_recent_tag(&layer, &tags, now_ms).await?;
            if ack.is_none() {
                bail!("No tags given");
            }
            recent
        }
        RecentTagsCommand::List => load_recent_tags(&layer).await?,
    };
    layer.close().await;
    println!("{}", serde_json::to_string_pretty(&recent)?);
    Ok(())
}

pub async fn run_inhibit(
    store: &StoreArgs,
    config: &HoverboardConfig,
    action: InhibitCommand,
) -> Result<()> {
    let layer = store.open_layer(config)?;
    let mut list = load_inhibit_list(&layer).await?;
    match action {
        InhibitCommand::Add { url } => {
            if list.add(&url) {
                save_inhibit_list(&layer, &list).await?;
            }
        }
        InhibitCommand::Remove { url } => {
            if list.remove(&url) {
                save_inhibit_list(&layer, &list).await?;
            }
        }
        InhibitCommand::List => {}
        InhibitCommand::Check { url } => {
            let inhibited = list.is_inhibited(&url);
            layer.close().await;
            println!("{}", json!({"url": url, "inhibited": inhibited}));
            if !inhibited {
                std::process::exit(1);
            }
            return Ok(());
        }
    }
    layer.close().await;
    for url in list.urls() {
        println!("{url}");
    }
    Ok(())
}

fn ack_json(ack: &WriteAck) -> Value {
    let mut value = json!({"storedIn": ack.stored_in.as_str()});
    if let Some(warning) = &ack.warning {
        value["quota"] = json!({
            "level": warning.level.as_str(),
            "usagePercent": warning.usage_percent,
            "evicted": warning.evicted,
        });
    }
    value
}

fn eviction_json(report: &EvictionReport) -> Value {
    json!({
        "usageBefore": report.usage_before,
        "usageAfter": report.usage_after,
        "removed": report
            .removed
            .iter()
            .map(|candidate| json!({
                "key": candidate.key,
                "sizeBytes": candidate.size_bytes,
                "ageMs": candidate.age_ms,
            }))
            .collect::<Vec<_>>(),
        "failed": report.failed,
    })
}
