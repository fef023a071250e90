//! Runs the synchronization pipeline over newline-delimited JSON events.
//!
//! Each stdin line is a `NewEvent` document; it is appended to an in-memory event
//! store and flows through dispatch, projection and cache invalidation. On EOF the
//! pipeline drains and the resulting read models are printed as JSON.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use readsync_core::ExpectedVersion;
use readsync_customers::CustomerQueryModel;
use readsync_devices::DeviceQueryModel;
use readsync_events::NewEvent;
use readsync_infra::cache::{Cache, InMemoryCache};
use readsync_infra::dispatcher::{DeadLetter, DeadLetterStore, Dispatcher, InMemoryDeadLetterStore};
use readsync_infra::event_store::{EventStore, InMemoryEventStore};
use readsync_infra::read_model::ReadModelStore;
use readsync_infra::workers::WorkerStats;
use readsync_infra::{InMemoryReadSide, Pipeline, SyncConfig};

#[derive(Debug, Serialize)]
struct Summary {
    stats: WorkerStats,
    customers: Vec<CustomerQueryModel>,
    devices: Vec<DeviceQueryModel>,
    dead_letters: Vec<DeadLetter>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    readsync_observability::init();

    let config = SyncConfig::from_env().context("invalid configuration")?;
    let cache = build_cache(&config).await?;

    let read_side = InMemoryReadSide::new();
    let dead_letters = Arc::new(InMemoryDeadLetterStore::new());
    let dispatcher = read_side.dispatcher(&config, cache, Dispatcher::new(dead_letters.clone()));
    let pipeline = Pipeline::start(&config, InMemoryEventStore::new(), dispatcher);
    info!(lanes = config.lanes, policy = ?config.sequence_policy, "pipeline started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0_u64;
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let event = match parse_event(&line) {
            Ok(event) => event,
            Err(err) => {
                warn!(line = line_no, error = %err, "skipping malformed event");
                continue;
            }
        };

        if let Err(err) = pipeline
            .store()
            .append_new(vec![event], ExpectedVersion::Any)
            .await
        {
            warn!(line = line_no, error = %err, retryable = err.is_retryable(), "append failed");
        }
    }

    let stats = pipeline.shutdown().await;

    let summary = Summary {
        stats,
        customers: read_side.customers.list().await?,
        devices: read_side.devices.list().await?,
        dead_letters: dead_letters.list().await?,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

fn parse_event(line: &str) -> anyhow::Result<NewEvent> {
    serde_json::from_str(line).context("expected a NewEvent JSON document")
}

fn in_memory_cache(config: &SyncConfig) -> Arc<dyn Cache> {
    Arc::new(InMemoryCache::new().with_default_ttl(config.cache_ttl))
}

#[cfg(feature = "redis")]
async fn build_cache(config: &SyncConfig) -> anyhow::Result<Arc<dyn Cache>> {
    use readsync_infra::cache::RedisCache;

    match &config.redis_url {
        Some(url) => {
            let cache = RedisCache::connect(url)
                .await
                .context("connecting to redis")?
                .with_default_ttl(config.cache_ttl);
            info!("using redis cache");
            Ok(Arc::new(cache))
        }
        None => Ok(in_memory_cache(config)),
    }
}

#[cfg(not(feature = "redis"))]
async fn build_cache(config: &SyncConfig) -> anyhow::Result<Arc<dyn Cache>> {
    if config.redis_url.is_some() {
        warn!("REDIS_URL is set but the redis feature is disabled; using the in-memory cache");
    }
    Ok(in_memory_cache(config))
}
