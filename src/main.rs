//! cachewheel demo
//!
//! Runs a concurrent read-through workload against a cluster of in-memory
//! cache nodes backed by a simulated slow data source, then drains the
//! cleaner and prints the cache statistics.
//!
//! ```text
//! ┌──────────┐   take(user:N)   ┌──────────────┐   miss   ┌─────────────┐
//! │ workload │ ───────────────▶ │ CacheCluster │ ───────▶ │ slow source │
//! └──────────┘                  └──────────────┘          └─────────────┘
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cachewheel::cache::{Cache, CacheCleaner, CacheCluster, CacheStat};
use cachewheel::config::{parse_duration, Config, NodeConf, DEFAULT_WEIGHT};
use cachewheel::store::{InMemoryStore, KvStore};
use cachewheel::{Error, LogReporter, SharedCalls};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Timing wheel backed read-through cache demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "CACHEWHEEL_CONFIG")]
    config: Option<PathBuf>,

    /// Number of cache nodes when the configuration lists none
    #[arg(long, env = "CACHEWHEEL_NODES", default_value = "3")]
    nodes: usize,

    /// Total lookups to issue
    #[arg(long, env = "CACHEWHEEL_REQUESTS", default_value = "10000")]
    requests: u64,

    /// Distinct keys the lookups are spread over
    #[arg(long, env = "CACHEWHEEL_KEYS", default_value = "500")]
    keys: u64,

    /// Lookups in flight at once
    #[arg(long, env = "CACHEWHEEL_CONCURRENCY", default_value = "64")]
    concurrency: usize,

    /// Simulated latency of the data source
    #[arg(long, env = "CACHEWHEEL_SOURCE_LATENCY", default_value = "20ms", value_parser = parse_duration)]
    source_latency: Duration,

    /// Interval of the stat log
    #[arg(long, env = "CACHEWHEEL_STAT_INTERVAL", default_value = "1s", value_parser = parse_duration)]
    stat_interval: Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Simulated Source
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct User {
    id: u64,
    name: String,
}

/// Slow data source where every tenth id does not exist
struct UserSource {
    latency: Duration,
    queries: AtomicU64,
}

impl UserSource {
    async fn find(&self, id: u64) -> cachewheel::Result<User> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;
        if id % 10 == 0 {
            return Err(Error::NotFound);
        }
        Ok(User {
            id,
            name: format!("user-{}", id),
        })
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    if config.nodes.is_empty() {
        config.nodes = (0..args.nodes)
            .map(|i| NodeConf::new(format!("node-{}", i), DEFAULT_WEIGHT))
            .collect();
    }

    info!("Starting cachewheel demo");
    info!("  Nodes: {}", config.nodes.len());
    info!("  Requests: {} over {} keys", args.requests, args.keys);
    info!("  Cleaner: {:?}", config.cleaner);

    let cleaner = CacheCleaner::new(config.cleaner.clone(), Arc::new(LogReporter))?;
    let stat = Arc::new(CacheStat::new("users"));
    let cluster = CacheCluster::from_conf(
        &config.nodes,
        |_| Ok(Arc::new(InMemoryStore::new()) as Arc<dyn KvStore>),
        Arc::new(SharedCalls::new()),
        Arc::clone(&stat),
        Arc::clone(&cleaner),
        config.cache.clone(),
    )?;

    let shutdown = CancellationToken::new();
    let reporter = Arc::clone(&stat).spawn_reporter(args.stat_interval, shutdown.clone());

    let source = UserSource {
        latency: args.source_latency,
        queries: AtomicU64::new(0),
    };
    let keys = args.keys.max(1);

    let not_found = stream::iter(0..args.requests)
        .map(|i| {
            let cluster = &cluster;
            let source = &source;
            async move {
                let id = i * 7919 % keys;
                let key = format!("user:{}", id);

                // Occasional invalidation, as a write path would do
                if i % 100 == 99 {
                    if let Err(e) = cluster.del(&[key.as_str()]).await {
                        warn!(key = %key, error = %e, "Delete failed");
                    }
                }

                match cluster.take(&key, || source.find(id)).await {
                    Ok(_) => 0u64,
                    Err(Error::NotFound) => 1,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Lookup failed");
                        0
                    }
                }
            }
        })
        .buffer_unordered(args.concurrency.max(1))
        .fold(0u64, |acc, missing| async move { acc + missing })
        .await;

    let snapshot = stat.snapshot();
    info!(
        requests = args.requests,
        source_queries = source.queries.load(Ordering::Relaxed),
        not_found,
        hit_ratio = format!("{:.1}%", stat.hit_ratio() * 100.0),
        db_fails = snapshot.db_fails,
        "Workload finished"
    );

    let drained = cleaner.shutdown().await?;
    shutdown.cancel();
    if let Err(e) = reporter.await {
        warn!(error = %e, "Stat reporter exited abnormally");
    }

    info!(drained, "cachewheel demo complete");
    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
