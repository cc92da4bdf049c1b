//! Error-log mining: per-minute level counts and signature aggregation.
//!
//! A signature is the normalized form of `msg` plus `error`: UUIDs, hex
//! literals and whole-word integers collapse to `?`, so cosmetically
//! different instances of the same failure coalesce. The signature hash is
//! `SHA1(level + "|" + signature)` — it depends only on the normalized
//! form.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::error;

use crate::config::OmConfig;
use crate::error::{OmError, OmResult};
use crate::logindex::{LogIndex, LogRecord, SearchOptions};
use crate::store::{
    cond, Agg, AggField, Granularity, Pager, Record, Sorter, Store, TimeBucket,
};

const COLLECT_TICK: Duration = Duration::from_secs(30);
const SWEEP_TICK: Duration = Duration::from_secs(60);
const COLLECT_WINDOW: Duration = Duration::from_secs(60);
const COLLECT_LEVELS: &[&str] = &["error", "fatal", "dpanic"];
const SEARCH_MAX: usize = 50_000;

pub const ERR_FIELDS: &[&str] = &["warn", "error", "panic", "total"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrBucket {
    pub at: i64,
    pub warn: i64,
    pub error: i64,
    pub panic: i64,
    pub total: i64,
}

impl Record for ErrBucket {
    const TABLE: &'static str = "err_stat";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrSigBucket {
    pub at: i64,
    pub level: String,
    pub sig_hash: String,
    pub count: i64,
}

impl Record for ErrSigBucket {
    const TABLE: &'static str = "err_sig_stat";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrSigMeta {
    pub sig_hash: String,
    pub signature: String,
    pub level: String,
    pub sample_msg: String,
    pub sample_error: String,
    pub sample_trace: String,
    pub first_at: i64,
    pub last_at: i64,
}

impl Record for ErrSigMeta {
    const TABLE: &'static str = "err_sig_meta";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrSigRank {
    pub sig_hash: String,
    pub signature: String,
    pub level: String,
    pub count: i64,
    pub sample_msg: String,
    pub sample_error: String,
    pub sample_trace: String,
    pub first_at: i64,
    pub last_at: i64,
}

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}")
            .expect("uuid regex")
    })
}

fn hex_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"0x[0-9a-fA-F]+").expect("hex regex"))
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d+\b").expect("number regex"))
}

fn space_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("space regex"))
}

/// Replace volatile fragments with `?` and collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    let s = uuid_re().replace_all(s, "?");
    let s = hex_re().replace_all(&s, "?");
    let s = number_re().replace_all(&s, "?");
    space_re().replace_all(s.trim(), " ").to_string()
}

/// `norm(msg) | norm(err)`, omitting the empty side.
pub fn build_signature(msg: &str, err: &str) -> String {
    let norm_msg = normalize_text(msg);
    let norm_err = normalize_text(err);
    match (norm_msg.is_empty(), norm_err.is_empty()) {
        (false, false) => format!("{norm_msg} | {norm_err}"),
        (false, true) => norm_msg,
        (true, false) => norm_err,
        (true, true) => String::new(),
    }
}

pub fn hash_signature(level: &str, signature: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(level.as_bytes());
    hasher.update(b"|");
    hasher.update(signature.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct ErrSigAggregator {
    logs: LogIndex,
    storage: Pager<ErrBucket>,
    sig_storage: Pager<ErrSigBucket>,
    sig_meta: Pager<ErrSigMeta>,
    max_period: Duration,
}

impl ErrSigAggregator {
    pub fn new(config: &OmConfig, store: &Store, logs: LogIndex) -> Self {
        Self {
            logs,
            storage: store.pager::<ErrBucket>(),
            sig_storage: store.pager::<ErrSigBucket>(),
            sig_meta: store.pager::<ErrSigMeta>(),
            max_period: config.max_period(),
        }
    }

    /// Scan the trailing window of error-class records and fold them into
    /// the minute rollups.
    pub fn collect(&self) {
        let now = chrono::Local::now();
        let opts = SearchOptions {
            start_time: (now - chrono::Duration::seconds(COLLECT_WINDOW.as_secs() as i64))
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            end_time: now.format("%Y-%m-%d %H:%M:%S").to_string(),
            levels: COLLECT_LEVELS.iter().map(|s| s.to_string()).collect(),
            size: SEARCH_MAX,
            ..Default::default()
        };
        let records = match self.logs.search_logs(&opts) {
            Ok(matches) => matches.into_iter().map(|m| m.record).collect::<Vec<_>>(),
            Err(e) => {
                error!("Failed to collect error logs: {e}");
                return;
            }
        };
        let now_bucket = (chrono::Utc::now().timestamp() / 60) * 60;
        self.ingest(&records, now_bucket);
    }

    /// Fold one window of records into the stores. Separated from the log
    /// scan so the aggregation is directly testable.
    pub fn ingest(&self, records: &[LogRecord], now_bucket: i64) {
        let mut bucket = ErrBucket {
            at: chrono::Utc::now().timestamp(),
            ..Default::default()
        };
        for rec in records {
            bucket.total += 1;
            match rec.level.to_ascii_lowercase().as_str() {
                "error" => bucket.error += 1,
                "fatal" | "dpanic" => bucket.panic += 1,
                "warn" => bucket.warn += 1,
                _ => {}
            }
        }
        if let Err(e) = self.storage.put(&bucket) {
            error!("Failed to save error statistics: {e:#}");
            return;
        }

        let mut sig_agg: HashMap<String, ErrSigBucket> = HashMap::new();
        let mut sig_samples: HashMap<String, ErrSigMeta> = HashMap::new();
        for rec in records {
            let level = rec.level.to_ascii_lowercase();
            let signature = build_signature(&rec.msg, &rec.error);
            if signature.is_empty() {
                continue;
            }
            let sig_hash = hash_signature(&level, &signature);
            let entry = sig_agg.entry(sig_hash.clone()).or_insert_with(|| {
                sig_samples.insert(
                    sig_hash.clone(),
                    ErrSigMeta {
                        sig_hash: sig_hash.clone(),
                        signature: signature.clone(),
                        level: level.clone(),
                        sample_msg: rec.msg.clone(),
                        sample_error: rec.error.clone(),
                        sample_trace: rec.trace_id.clone(),
                        first_at: now_bucket,
                        last_at: now_bucket,
                    },
                );
                ErrSigBucket {
                    at: now_bucket,
                    level: level.clone(),
                    sig_hash: sig_hash.clone(),
                    count: 0,
                }
            });
            entry.count += 1;
        }

        for (hash, stat) in &sig_agg {
            self.upsert_meta(hash, &sig_samples[hash], now_bucket);
            if let Err(e) = self.sig_storage.put(stat) {
                error!(sig_hash = %hash, "Failed to save sig stat: {e:#}");
            }
        }
    }

    /// Keep the first samples, refresh lastAt; firstAt never changes after
    /// creation.
    fn upsert_meta(&self, hash: &str, sample: &ErrSigMeta, now_bucket: i64) {
        let key = cond(serde_json::json!({"sigHash": hash}));
        match self.sig_meta.get(&key) {
            Ok(None) => {
                if let Err(e) = self.sig_meta.put(sample) {
                    error!(sig_hash = %hash, "Failed to save sig meta: {e:#}");
                }
            }
            Ok(Some(mut existing)) => {
                existing.last_at = now_bucket;
                if existing.sample_msg.is_empty() && !sample.sample_msg.is_empty() {
                    existing.sample_msg = sample.sample_msg.clone();
                }
                if existing.sample_error.is_empty() && !sample.sample_error.is_empty() {
                    existing.sample_error = sample.sample_error.clone();
                }
                if existing.sample_trace.is_empty() && !sample.sample_trace.is_empty() {
                    existing.sample_trace = sample.sample_trace.clone();
                }
                let _ = self.sig_meta.update(&key, &existing);
            }
            Err(e) => error!(sig_hash = %hash, "Failed to get sig meta: {e:#}"),
        }
    }

    pub fn time_range(
        &self,
        start: i64,
        end: i64,
        granularity: Option<Granularity>,
        fields: &[String],
    ) -> OmResult<Vec<TimeBucket>> {
        if start <= 0 || end <= 0 || start > end {
            return Err(OmError::verify("Invalid time range"));
        }
        let granularity = granularity.unwrap_or(Granularity::Day);
        let fields: Vec<&str> = if fields.is_empty() {
            ERR_FIELDS.to_vec()
        } else {
            for f in fields {
                if !ERR_FIELDS.contains(&f.as_str()) {
                    return Err(OmError::verify(format!("unsupported field: {f}")));
                }
            }
            fields.iter().map(|s| s.as_str()).collect()
        };
        self.storage
            .group_by_time(None, start, end, granularity, Agg::Total, &fields)
            .map_err(|e| OmError::sys(format!("GroupByTime failed: {e:#}")))
    }

    /// Heaviest signatures in the window, meta joined in.
    pub fn top_signatures(
        &self,
        start: i64,
        end: i64,
        levels: &[String],
        limit: i64,
    ) -> OmResult<Vec<ErrSigRank>> {
        if start == 0 || end == 0 || start > end {
            return Err(OmError::verify("Invalid time range"));
        }
        let limit = if limit <= 0 { 10 } else { limit };

        let mut c = serde_json::json!({
            "at": {"$gte": start, "$lte": end},
        });
        let levels: Vec<&str> = levels
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .collect();
        if levels.len() == 1 {
            c["level"] = serde_json::json!(levels[0]);
        } else if levels.len() > 1 {
            c["level"] = serde_json::json!({"$in": levels});
        }

        let aggs = vec![AggField::new("count", Agg::Sum, "cnt")];
        let grouped = self
            .sig_storage
            .group_by_fields(
                Some(&cond(c)),
                &["sigHash"],
                &aggs,
                1,
                limit,
                Some(&Sorter::desc("cnt")),
            )
            .map_err(|e| OmError::sys(format!("GroupByFields failed: {e:#}")))?;

        let mut result = Vec::with_capacity(grouped.items.len());
        for item in grouped.items {
            let mut rank = ErrSigRank {
                sig_hash: item.group["sigHash"].clone(),
                count: item.value["cnt"] as i64,
                ..Default::default()
            };
            if let Ok(Some(meta)) = self
                .sig_meta
                .get(&cond(serde_json::json!({"sigHash": rank.sig_hash})))
            {
                rank.signature = meta.signature;
                rank.level = meta.level;
                rank.sample_msg = meta.sample_msg;
                rank.sample_error = meta.sample_error;
                rank.sample_trace = meta.sample_trace;
                rank.first_at = meta.first_at;
                rank.last_at = meta.last_at;
            }
            result.push(rank);
        }
        Ok(result)
    }

    pub fn sweep(&self) {
        let expiration = chrono::Utc::now().timestamp() - self.max_period.as_secs() as i64;
        let by_at = cond(serde_json::json!({"at": {"$lt": expiration}}));
        if let Err(e) = self.storage.delete(&by_at) {
            error!("Clear err stat failed: {e:#}");
        }
        if let Err(e) = self.sig_storage.delete(&by_at) {
            error!("Clear sig stat failed: {e:#}");
        }
        if let Err(e) = self
            .sig_meta
            .delete(&cond(serde_json::json!({"lastAt": {"$lt": expiration}})))
        {
            error!("Clear sig meta failed: {e:#}");
        }
    }

    pub fn spawn(self: &Arc<Self>) {
        let agg = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(COLLECT_TICK);
            loop {
                ticker.tick().await;
                agg.collect();
            }
        });
        let agg = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_TICK);
            loop {
                ticker.tick().await;
                agg.sweep();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(level: &str, msg: &str, err: &str, trace: &str) -> LogRecord {
        LogRecord {
            level: level.to_string(),
            msg: msg.to_string(),
            error: err.to_string(),
            trace_id: trace.to_string(),
            ..Default::default()
        }
    }

    fn aggregator() -> ErrSigAggregator {
        let store = Store::in_memory().unwrap();
        ErrSigAggregator::new(&OmConfig::default(), &store, LogIndex::new("."))
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("failed task 17"), "failed task ?");
        assert_eq!(
            normalize_text("id 550e8400-e29b-41d4-a716-446655440000 gone"),
            "id ? gone"
        );
        assert_eq!(normalize_text("ptr 0xDEADBEEF"), "ptr ?");
        assert_eq!(normalize_text("  a\t\tb   c  "), "a b c");
        // digits glued to words stay put
        assert_eq!(normalize_text("http2 stream"), "http2 stream");
    }

    #[test]
    fn test_build_signature_sides() {
        assert_eq!(build_signature("m 1", "e 2"), "m ? | e ?");
        assert_eq!(build_signature("m", ""), "m");
        assert_eq!(build_signature("", "e"), "e");
        assert_eq!(build_signature("", ""), "");
    }

    #[test]
    fn test_sig_hash_deterministic() {
        let a = hash_signature("error", build_signature("failed task 17", "").as_str());
        let b = hash_signature("error", build_signature("failed task 932", "").as_str());
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
        // level participates in the hash
        let c = hash_signature("fatal", build_signature("failed task 17", "").as_str());
        assert_ne!(a, c);
    }

    #[test]
    fn test_ingest_counts_levels() {
        let agg = aggregator();
        let records = vec![
            record("error", "boom 1", "", "t1"),
            record("error", "boom 2", "", "t2"),
            record("fatal", "dead", "", "t3"),
            record("dpanic", "dead", "", "t4"),
        ];
        agg.ingest(&records, 600);

        let bucket = agg.storage.find(1, 1, None, None).unwrap().items[0].clone();
        assert_eq!(bucket.total, 4);
        assert_eq!(bucket.error, 2);
        assert_eq!(bucket.panic, 2);
        assert_eq!(bucket.warn, 0);
    }

    #[test]
    fn test_ingest_coalesces_signatures() {
        let agg = aggregator();
        let records = vec![
            record("error", "failed task 17", "", "t1"),
            record("error", "failed task 932", "", "t2"),
        ];
        agg.ingest(&records, 600);

        let sigs = agg.sig_storage.find(1, 10, None, None).unwrap();
        assert_eq!(sigs.total, 1);
        assert_eq!(sigs.items[0].count, 2);

        let meta = agg.sig_meta.find(1, 10, None, None).unwrap();
        assert_eq!(meta.total, 1);
        assert_eq!(meta.items[0].signature, "failed task ?");
        // first sample is kept
        assert_eq!(meta.items[0].sample_msg, "failed task 17");
    }

    #[test]
    fn test_meta_first_at_immutable() {
        let agg = aggregator();
        agg.ingest(&[record("error", "oops 1", "", "t1")], 600);
        agg.ingest(&[record("error", "oops 2", "", "t2")], 1200);

        let meta = agg.sig_meta.find(1, 10, None, None).unwrap().items[0].clone();
        assert_eq!(meta.first_at, 600);
        assert_eq!(meta.last_at, 1200);
        assert_eq!(meta.sample_msg, "oops 1");

        // two buckets accumulated for the same signature
        let sigs = agg.sig_storage.find(1, 10, None, None).unwrap();
        assert_eq!(sigs.total, 2);
    }

    #[test]
    fn test_top_signatures_ranks_by_count() {
        let agg = aggregator();
        let mut records = vec![record("error", "rare thing", "", "t0")];
        for i in 0..5 {
            records.push(record("error", "common thing 9", "", &format!("t{i}")));
        }
        agg.ingest(&records, 600);

        let top = agg.top_signatures(1, 10_000, &[], 10).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].signature, "common thing ?");
        assert_eq!(top[0].count, 5);
        assert_eq!(top[1].count, 1);

        // limit truncates
        let top = agg.top_signatures(1, 10_000, &[], 1).unwrap();
        assert_eq!(top.len(), 1);

        // level filter
        let top = agg
            .top_signatures(1, 10_000, &["fatal".to_string()], 10)
            .unwrap();
        assert!(top.is_empty());
    }

    #[test]
    fn test_time_range_validates() {
        let agg = aggregator();
        assert!(agg.time_range(0, 10, None, &[]).is_err());
        assert!(agg
            .time_range(1, 10, None, &["nope".to_string()])
            .is_err());
    }

    #[test]
    fn test_sweep_clears_old_meta_by_last_at() {
        let mut agg = aggregator();
        agg.max_period = Duration::from_secs(3600);
        let old = chrono::Utc::now().timestamp() - 10 * 24 * 3600;
        agg.sig_meta
            .put(&ErrSigMeta {
                sig_hash: "h".into(),
                last_at: old,
                ..Default::default()
            })
            .unwrap();
        agg.sig_meta
            .put(&ErrSigMeta {
                sig_hash: "fresh".into(),
                last_at: chrono::Utc::now().timestamp(),
                ..Default::default()
            })
            .unwrap();
        agg.sweep();
        assert_eq!(agg.sig_meta.count(None).unwrap(), 1);
    }
}
