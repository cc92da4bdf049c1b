//! Runtime thread count sampling, every 30 seconds.
//!
//! The count comes from the `Threads:` line of `/proc/self/status` and
//! covers every OS thread of the process: runtime workers, blocking pool,
//! collector tasks.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use crate::config::OmConfig;
use crate::error::{OmError, OmResult};
use crate::store::{cond, Agg, Granularity, Pager, Record, Store, TimeBucket};

const COLLECT_TICK: Duration = Duration::from_secs(30);
const SWEEP_TICK: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadStat {
    pub at: i64,
    pub count: i64,
}

impl Record for ThreadStat {
    const TABLE: &'static str = "thread_stat";
}

/// Parse the `Threads:` line of `/proc/<pid>/status`.
pub fn parse_thread_count(content: &str) -> Option<i64> {
    content
        .lines()
        .find(|l| l.starts_with("Threads:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

pub struct ThreadCollector {
    storage: Pager<ThreadStat>,
    max_period: Duration,
}

impl ThreadCollector {
    pub fn new(config: &OmConfig, store: &Store) -> Self {
        Self {
            storage: store.pager::<ThreadStat>(),
            max_period: config.max_period(),
        }
    }

    pub fn collect(&self) {
        let content = std::fs::read_to_string("/proc/self/status").unwrap_or_default();
        let Some(count) = parse_thread_count(&content) else {
            error!("thread collect failed to parse /proc/self/status");
            return;
        };
        let stat = ThreadStat {
            at: chrono::Utc::now().timestamp(),
            count,
        };
        if let Err(e) = self.storage.put(&stat) {
            error!("Save thread stat failed: {e:#}");
        }
    }

    /// Average per bucket, rounded to whole threads.
    pub fn time_range(
        &self,
        start: i64,
        end: i64,
        granularity: Option<Granularity>,
    ) -> OmResult<Vec<TimeBucket>> {
        if start <= 0 || end <= 0 || start > end {
            return Err(OmError::verify("Invalid time range"));
        }
        let granularity = granularity.unwrap_or(Granularity::Minute);
        let mut buckets = self
            .storage
            .group_by_time(None, start, end, granularity, Agg::Avg, &["count"])
            .map_err(|e| OmError::sys(format!("GroupByTime failed: {e:#}")))?;
        for bucket in &mut buckets {
            if let Some(v) = bucket.value.get_mut("count") {
                *v = v.round();
            }
        }
        Ok(buckets)
    }

    pub fn count(&self) -> OmResult<i64> {
        self.storage
            .count(None)
            .map_err(|e| OmError::sys(format!("Count failed: {e:#}")))
    }

    pub fn sweep(&self) {
        let expiration = chrono::Utc::now().timestamp() - self.max_period.as_secs() as i64;
        if let Err(e) = self
            .storage
            .delete(&cond(serde_json::json!({"at": {"$lt": expiration}})))
        {
            error!("Clear thread stat failed: {e:#}");
        }
    }

    pub fn spawn(self: &Arc<Self>) {
        let collector = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(COLLECT_TICK);
            loop {
                ticker.tick().await;
                collector.collect();
            }
        });
        let collector = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_TICK);
            loop {
                ticker.tick().await;
                collector.sweep();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_thread_count() {
        let content = "Name:\topsidecar\nUmask:\t0022\nThreads:\t17\nSigQ:\t0/126\n";
        assert_eq!(parse_thread_count(content), Some(17));
        assert_eq!(parse_thread_count("Name: x"), None);
    }

    #[test]
    fn test_collect_reads_live_process() {
        let store = Store::in_memory().unwrap();
        let collector = ThreadCollector::new(&OmConfig::default(), &store);
        collector.collect();
        assert_eq!(collector.count().unwrap(), 1);
    }

    #[test]
    fn test_time_range_rounds_average() {
        let store = Store::in_memory().unwrap();
        let collector = ThreadCollector::new(&OmConfig::default(), &store);
        collector.storage.put(&ThreadStat { at: 60, count: 10 }).unwrap();
        collector.storage.put(&ThreadStat { at: 70, count: 11 }).unwrap();
        let buckets = collector
            .time_range(1, 120, Some(Granularity::Minute))
            .unwrap();
        assert_eq!(buckets.len(), 1);
        // avg 10.5 rounds to 11
        assert_eq!(buckets[0].value["count"], 11.0);
    }

    #[test]
    fn test_sweep_honors_retention() {
        let store = Store::in_memory().unwrap();
        let mut collector = ThreadCollector::new(&OmConfig::default(), &store);
        collector.max_period = Duration::from_secs(60);
        let now = chrono::Utc::now().timestamp();
        collector
            .storage
            .put(&ThreadStat {
                at: now - 3600,
                count: 5,
            })
            .unwrap();
        collector
            .storage
            .put(&ThreadStat { at: now, count: 6 })
            .unwrap();
        collector.sweep();
        assert_eq!(collector.count().unwrap(), 1);
    }
}
