//! Cache Statistics
//!
//! Per-node request counters, updated with relaxed atomic increments and
//! logged periodically by an optional background reporter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Default interval of the stat log
pub const STAT_INTERVAL: Duration = Duration::from_secs(60);

/// Cache request counters
#[derive(Debug, Default)]
pub struct CacheStat {
    name: String,
    total: AtomicU64,
    hit: AtomicU64,
    miss: AtomicU64,
    db_fails: AtomicU64,
}

impl CacheStat {
    /// Create counters labelled `name` in the stat log
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn incr_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_hit(&self) {
        self.hit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_miss(&self) {
        self.miss.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_db_fails(&self) {
        self.db_fails.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hit.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.miss.load(Ordering::Relaxed)
    }

    pub fn db_fails(&self) -> u64 {
        self.db_fails.load(Ordering::Relaxed)
    }

    /// Fraction of lookups that were hits
    pub fn hit_ratio(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }

    /// Get snapshot of all counters
    pub fn snapshot(&self) -> StatSnapshot {
        StatSnapshot {
            total: self.total(),
            hits: self.hits(),
            misses: self.misses(),
            db_fails: self.db_fails(),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.hit.store(0, Ordering::Relaxed);
        self.miss.store(0, Ordering::Relaxed);
        self.db_fails.store(0, Ordering::Relaxed);
    }

    /// Log the traffic of every `period` until `shutdown` fires
    ///
    /// Counters keep growing; each line reports the difference since the
    /// previous one and is skipped when there was no traffic.
    pub fn spawn_reporter(
        self: Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last = self.snapshot();

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let current = self.snapshot();
                        let delta = current.since(&last);
                        last = current;
                        if delta.total > 0 {
                            info!(
                                cache = %self.name,
                                requests = delta.total,
                                hit_ratio = format!("{:.1}%", delta.hit_ratio() * 100.0),
                                hit = delta.hits,
                                miss = delta.misses,
                                db_fails = delta.db_fails,
                                "Cache stats"
                            );
                        }
                    }
                }
            }
        })
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatSnapshot {
    pub total: u64,
    pub hits: u64,
    pub misses: u64,
    pub db_fails: u64,
}

impl StatSnapshot {
    /// Counter growth since `earlier`
    pub fn since(&self, earlier: &StatSnapshot) -> StatSnapshot {
        StatSnapshot {
            total: self.total.saturating_sub(earlier.total),
            hits: self.hits.saturating_sub(earlier.hits),
            misses: self.misses.saturating_sub(earlier.misses),
            db_fails: self.db_fails.saturating_sub(earlier.db_fails),
        }
    }

    pub fn hit_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.hits as f64 / self.total as f64
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
