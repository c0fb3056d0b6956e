use crate::models::{SubscriptionEntry, UsageSnapshot};
use crate::providers::FetchContext;
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_TTL: Duration = Duration::from_secs(90);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CacheState {
    snapshots: Arc<Vec<UsageSnapshot>>,
    stored_at: Instant,
    updated_at: DateTime<Utc>,
}

/// Last aggregated result set, served while younger than the TTL
#[derive(Debug)]
pub struct SnapshotCache {
    state: RwLock<Option<CacheState>>,
    ttl: Duration,
}

impl SnapshotCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: RwLock::new(None),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached snapshots, or `None` if nothing was stored or it has expired
    pub fn get(&self) -> Option<Arc<Vec<UsageSnapshot>>> {
        let guard = self.state.read().unwrap_or_else(|p| p.into_inner());
        let state = guard.as_ref()?;
        if state.stored_at.elapsed() > self.ttl {
            return None;
        }
        Some(state.snapshots.clone())
    }

    /// Replaces the cached set. Concurrent writers race; the last one wins.
    pub fn set(&self, snapshots: Vec<UsageSnapshot>) {
        let next = CacheState {
            snapshots: Arc::new(snapshots),
            stored_at: Instant::now(),
            updated_at: Utc::now(),
        };
        let mut guard = self.state.write().unwrap_or_else(|p| p.into_inner());
        *guard = Some(next);
    }

    /// Wall-clock time of the last `set`, regardless of expiry
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        let guard = self.state.read().unwrap_or_else(|p| p.into_inner());
        guard.as_ref().map(|s| s.updated_at)
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

/// Everything needed to run one full aggregation cycle into the cache
#[derive(Clone)]
pub struct Refresher {
    pub registry: Arc<Registry>,
    pub cache: Arc<SnapshotCache>,
    pub entries: Arc<Vec<SubscriptionEntry>>,
    /// Deadline for a single cycle
    pub timeout: Duration,
}

impl Refresher {
    /// Fetches all entries and stores the result, failures included
    pub async fn refresh(&self) -> Arc<Vec<UsageSnapshot>> {
        let snapshots = Arc::new(self.collect(&FetchContext::with_timeout(self.timeout)).await);
        self.cache.set(snapshots.as_ref().clone());
        snapshots
    }

    async fn collect(&self, ctx: &FetchContext) -> Vec<UsageSnapshot> {
        let started = Instant::now();
        let snapshots = self.registry.fetch_all(ctx, &self.entries).await;
        let failed = snapshots.iter().filter(|s| !s.is_ok()).count();
        debug!(
            entries = snapshots.len(),
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "refreshed usage cache"
        );
        snapshots
    }

    /// Re-runs [`Refresher::refresh`] every `interval` until `stop` fires.
    /// The first cycle runs one interval after spawning. `stop` also cancels
    /// a cycle in flight, whose partial result is then discarded.
    pub fn spawn(self, interval: Duration, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "background refresh started");

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let ctx = FetchContext::with_timeout(self.timeout).with_cancel(&stop);
                        let snapshots = self.collect(&ctx).await;
                        if stop.is_cancelled() {
                            break;
                        }
                        self.cache.set(snapshots);
                    }
                }
            }
            info!("background refresh stopped");
        })
    }
}
