//! Demo command implementation.
//!
//! Runs a hub against [`MemoryChangeSource`], commits synthetic
//! insert/update/delete cycles round-robin across the watched collections,
//! and prints the resulting stats.

use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use streamhub_core::{
    BroadcastPublisher, ChangeSource, Document, Hub, HubConfig, HubStats, MemoryBroadcast,
    MemoryChangeSource,
};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Summary printed after a demo run.
#[derive(Debug, Serialize)]
pub struct DemoReport {
    /// Hub instance id.
    pub instance: String,
    /// Mutations committed.
    pub committed: u64,
    /// State before the hub was stopped.
    pub final_state: String,
    /// Hub counters.
    pub stats: HubStats,
}

/// Runs the demo command.
pub async fn run(
    config_path: Option<&Path>,
    events: u64,
    drop_after: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = match config_path {
        Some(path) => super::check_config::load(path)?,
        None => HubConfig::default(),
    };
    let report = execute(config, events, drop_after).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Runs a hub over `events` synthetic mutations.
pub async fn execute(
    config: HubConfig,
    events: u64,
    drop_after: Option<u64>,
) -> Result<DemoReport, Box<dyn std::error::Error>> {
    let collections: Vec<String> = config.watched_collections.iter().cloned().collect();
    let source = Arc::new(MemoryChangeSource::new(collections.iter().cloned()));
    let hub = Hub::new(
        config,
        Arc::clone(&source) as Arc<dyn ChangeSource>,
        Arc::new(MemoryBroadcast::default()) as Arc<dyn BroadcastPublisher>,
    );

    for collection in &collections {
        hub.register(collection, None, |event| {
            tracing::info!(
                collection = %event.collection,
                kind = %event.kind,
                id = %event.document_id,
                sequence = event.sequence,
                "change"
            );
            Ok(())
        })?;
    }
    hub.start().await?;

    for i in 0..events {
        let collection = &collections[(i / 3) as usize % collections.len()];
        let id = format!("doc-{}", i / 3);
        match i % 3 {
            0 => source.insert(collection, json!({ "_id": id, "seq": i }))?,
            1 => {
                let mut set = Document::new();
                set.insert("seq".into(), json!(i));
                source.update(collection, &id, set, &[])?
            }
            _ => source.delete(collection, &id)?,
        };

        if drop_after == Some(i + 1) {
            tracing::warn!(after = i + 1, "dropping store connection");
            source.drop_connection();
        }
    }

    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    while hub.stats().events_received < events && hub.state().is_running() {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!("timed out waiting for events to drain");
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let final_state = hub.state().to_string();
    let report = DemoReport {
        instance: hub.instance_id().to_string(),
        committed: events,
        final_state,
        stats: hub.stats(),
    };
    hub.stop().await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamhub_core::ReconnectConfig;

    fn quick_config() -> HubConfig {
        HubConfig::new(["messages", "rooms"]).with_reconnect(
            ReconnectConfig::new(5)
                .with_backoff_base(Duration::from_millis(1))
                .with_backoff_cap(Duration::from_millis(5)),
        )
    }

    #[tokio::test]
    async fn demo_dispatches_every_mutation() {
        let report = execute(quick_config(), 12, None).await.unwrap();
        assert_eq!(report.final_state, "watching");
        assert_eq!(report.stats.events_received, 12);
        assert_eq!(report.stats.events_dispatched, 12);
        assert_eq!(report.stats.deliveries, 12);
        assert_eq!(report.stats.reconnects, 0);
    }

    #[tokio::test]
    async fn demo_survives_connection_drop() {
        let report = execute(quick_config(), 12, Some(4)).await.unwrap();
        assert_eq!(report.stats.events_dispatched, 12);
        assert!(report.stats.reconnects >= 1);
    }
}
