use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::store::CacheStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub inspected: usize,
    pub removed: u64,
    pub busy: u64,
    pub bytes_reclaimed: u64,
}

/// When and how aggressively the sweeper evicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPolicy {
    pub threshold: u64,
    pub percent: u8,
}

impl SweepPolicy {
    pub fn trigger_size(&self) -> u64 {
        let scaled = u128::from(self.threshold) * u128::from(self.percent) / 100;
        u64::try_from(scaled).unwrap_or(u64::MAX)
    }
}

impl CacheStore {
    /// Evicts the least requested third of the entries once the resident size reaches the
    /// policy's trigger. Returns `None` when the sweep was skipped.
    ///
    /// Entries are ranked by hits since the previous sweep; every entry whose hit count is at or
    /// below the count of the k-th least requested entry (k = n/3, at least 1) is removed unless
    /// a reader is still attached. Survivors start the next period with zero hits.
    pub fn sweep(&self, policy: SweepPolicy) -> Option<SweepStats> {
        if self.total_size() < policy.trigger_size() || self.request_count() == 0 {
            return None;
        }

        let mut entries = self.entries.write();
        let mut ranked: Vec<_> = entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.hits()))
            .collect();
        let mut stats = SweepStats {
            inspected: ranked.len(),
            ..SweepStats::default()
        };
        if ranked.is_empty() {
            self.counters.reset_requests();
            return Some(stats);
        }
        ranked.sort_by_key(|(_, hits)| *hits);
        let k = (ranked.len() / 3).max(1);
        let cutoff = ranked[k - 1].1;

        for (key, hits) in ranked {
            let Some(entry) = entries.get(&key) else {
                continue;
            };
            if hits <= cutoff {
                if entry.reader_count() > 0 {
                    stats.busy += 1;
                    entry.reset_hits();
                    continue;
                }
                if let Some(entry) = entries.remove(&key) {
                    stats.removed += 1;
                    stats.bytes_reclaimed += entry.evict() as u64;
                    debug!(key = %key, hits, "evicted cache entry");
                }
            } else {
                entry.reset_hits();
            }
        }
        self.counters.reset_requests();
        Some(stats)
    }
}

pub fn spawn_sweeper(
    store: Arc<CacheStore>,
    interval: Duration,
    policy: SweepPolicy,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(stats) = store.sweep(policy) else {
                continue;
            };
            crate::metrics::record_cache_sweep_run();
            crate::metrics::record_cache_sweep_removed(stats.removed, stats.bytes_reclaimed);
            info!(
                inspected = stats.inspected,
                removed = stats.removed,
                busy = stats.busy,
                bytes_reclaimed = stats.bytes_reclaimed,
                total_size = store.total_size(),
                "cache sweep finished"
            );
        }
    }))
}
