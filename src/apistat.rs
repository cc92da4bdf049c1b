//! Request latency mining: IN/OUT trace pairing into per-minute rollups.
//!
//! The service's request logs carry an `IN` record when a request enters
//! and an `OUT` record when it leaves, joined by trace id. Pairing them
//! recovers latency and outcome per request; aggregation buckets by
//! `(method, query-stripped uri)` per minute with status-class counters,
//! and a meta row per endpoint keeps representative samples.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use crate::config::OmConfig;
use crate::error::{OmError, OmResult};
use crate::logindex::{LogIndex, LogRecord, SearchOptions};
use crate::store::{
    cond, Agg, AggField, Granularity, PageCache, Pager, Record, Sorter, Store, TimeBucket,
};

const COLLECT_CATEGORIES: &[&str] = &["rest", "invoke"];
const COLLECT_LEVELS: &[&str] = &["info", "warn", "error"];
const COLLECT_SECOND: u32 = 45;
const SWEEP_TICK: Duration = Duration::from_secs(60);
const SEARCH_MAX: usize = 50_000;

pub const API_TIME_FIELDS: &[&str] = &[
    "count",
    "countSlow",
    "count2xx",
    "count4xx",
    "count5xx",
    "countOther",
    "sumLatency",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiLatencyStat {
    pub at: i64,
    pub method: String,
    pub uri: String,
    pub count: i64,
    pub count_slow: i64,
    pub sum_latency: i64,
    pub max_latency: i64,
    pub count_2xx: i64,
    pub sum_latency_2xx: i64,
    pub max_latency_2xx: i64,
    pub count_4xx: i64,
    pub sum_latency_4xx: i64,
    pub max_latency_4xx: i64,
    pub count_5xx: i64,
    pub sum_latency_5xx: i64,
    pub max_latency_5xx: i64,
    pub count_other: i64,
    pub sum_latency_other: i64,
    pub max_latency_other: i64,
}

impl Record for ApiLatencyStat {
    const TABLE: &'static str = "api_latency_stat";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiLogSample {
    pub msg: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiLatencySample {
    pub trace_id: String,
    pub url: String,
    pub request_at: i64,
    pub status: i64,
    pub latency_ms: i64,
    pub in_log: ApiLogSample,
    pub out_log: ApiLogSample,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiLatencyMeta {
    pub method: String,
    pub uri: String,
    pub sample_trace: String,
    pub sample_status: i64,
    pub sample_latest: Option<ApiLatencySample>,
    pub sample_2xx: Option<ApiLatencySample>,
    pub sample_4xx: Option<ApiLatencySample>,
    pub sample_5xx: Option<ApiLatencySample>,
    pub sample_slow: Option<ApiLatencySample>,
    pub first_at: i64,
    pub last_at: i64,
}

impl Record for ApiLatencyMeta {
    const TABLE: &'static str = "api_latency_meta";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiLatencyRank {
    pub method: String,
    pub uri: String,
    pub count: i64,
    pub avg_latency: i64,
    pub max_latency: i64,
    pub count_2xx: i64,
    pub count_4xx: i64,
    pub count_5xx: i64,
    pub count_other: i64,
    pub success_rate: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sample_trace: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiLatencySummary {
    pub count: i64,
    pub avg_latency: i64,
    pub count_5xx: i64,
    pub slow_count: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSampleResp {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<ApiLatencySample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_2xx: Option<ApiLatencySample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_4xx: Option<ApiLatencySample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_5xx: Option<ApiLatencySample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_slow: Option<ApiLatencySample>,
}

/// Strip the query string.
pub fn normalize_uri(uri: &str) -> &str {
    match uri.find('?') {
        Some(idx) => &uri[..idx],
        None => uri,
    }
}

#[derive(Debug, Clone)]
struct InRecord {
    at_ms: i64,
    method: String,
    uri: String,
    log: ApiLogSample,
}

#[derive(Debug, Clone)]
struct OutRecord {
    at_ms: i64,
    status: i64,
    log: ApiLogSample,
}

fn log_sample(rec: &LogRecord) -> ApiLogSample {
    ApiLogSample {
        msg: rec.msg.clone(),
        error: rec.error.clone(),
        data: rec.data.clone(),
    }
}

fn record_time_ms(rec: &LogRecord) -> Option<i64> {
    rec.parsed_time().map(|t| t.and_utc().timestamp_millis())
}

/// Split a window of log records into IN/OUT maps keyed by trace id.
/// Later records win, matching a retried request overwriting its first
/// attempt within the window.
fn pair_records(records: &[LogRecord]) -> (HashMap<String, InRecord>, HashMap<String, OutRecord>) {
    let mut in_map = HashMap::new();
    let mut out_map = HashMap::new();
    for rec in records {
        let trace = rec.trace_id.trim();
        if trace.is_empty() {
            continue;
        }
        match rec.msg.trim().to_ascii_uppercase().as_str() {
            "IN" => {
                let Some(at_ms) = record_time_ms(rec) else {
                    continue;
                };
                in_map.insert(
                    trace.to_string(),
                    InRecord {
                        at_ms,
                        method: rec
                            .data
                            .get("method")
                            .map(|m| m.trim().to_ascii_uppercase())
                            .unwrap_or_default(),
                        uri: rec.data.get("uri").cloned().unwrap_or_default(),
                        log: log_sample(rec),
                    },
                );
            }
            "OUT" => {
                let Some(at_ms) = record_time_ms(rec) else {
                    continue;
                };
                out_map.insert(
                    trace.to_string(),
                    OutRecord {
                        at_ms,
                        status: rec
                            .data
                            .get("status")
                            .and_then(|s| s.parse().ok())
                            .unwrap_or(0),
                        log: log_sample(rec),
                    },
                );
            }
            _ => {}
        }
    }
    (in_map, out_map)
}

fn take_by_time(dst: &mut Option<ApiLatencySample>, sample: &ApiLatencySample) {
    let newer = dst
        .as_ref()
        .map(|d| sample.request_at > d.request_at)
        .unwrap_or(true);
    if newer {
        *dst = Some(sample.clone());
    }
}

fn take_slow(dst: &mut Option<ApiLatencySample>, sample: &ApiLatencySample) {
    let slower = dst
        .as_ref()
        .map(|d| {
            sample.latency_ms > d.latency_ms
                || (sample.latency_ms == d.latency_ms && sample.request_at > d.request_at)
        })
        .unwrap_or(true);
    if slower {
        *dst = Some(sample.clone());
    }
}

pub struct ApiLatencyAggregator {
    logs: LogIndex,
    storage: Pager<ApiLatencyStat>,
    meta: Pager<ApiLatencyMeta>,
    slow_ms: i64,
    max_age: Duration,
}

impl ApiLatencyAggregator {
    pub fn new(config: &OmConfig, store: &Store, logs: LogIndex) -> Self {
        Self {
            logs,
            storage: store.pager::<ApiLatencyStat>(),
            meta: store.pager::<ApiLatencyMeta>(),
            slow_ms: config.slow_ms,
            max_age: config.max_period(),
        }
    }

    fn window_opts(start: chrono::DateTime<chrono::Local>, end: chrono::DateTime<chrono::Local>) -> SearchOptions {
        SearchOptions {
            start_time: start.format("%Y-%m-%d %H:%M:%S").to_string(),
            end_time: end.format("%Y-%m-%d %H:%M:%S").to_string(),
            categories: COLLECT_CATEGORIES.iter().map(|s| s.to_string()).collect(),
            levels: COLLECT_LEVELS.iter().map(|s| s.to_string()).collect(),
            size: SEARCH_MAX,
            ..Default::default()
        }
    }

    /// Scan the trailing minute and fold paired traces into the rollups.
    pub fn collect(&self) {
        let now = chrono::Local::now();
        let opts = Self::window_opts(now - chrono::Duration::seconds(60), now);
        let records = match self.logs.search_logs(&opts) {
            Ok(matches) => matches.into_iter().map(|m| m.record).collect::<Vec<_>>(),
            Err(e) => {
                error!("latency collect search failed: {e}");
                return;
            }
        };
        let now_bucket = (chrono::Utc::now().timestamp() / 60) * 60;
        self.ingest(&records, now_bucket);
    }

    /// Fold one window of records into stats and meta. Separated from the
    /// scan for testability.
    pub fn ingest(&self, records: &[LogRecord], now_bucket: i64) {
        let (in_map, out_map) = pair_records(records);

        let mut stats: HashMap<String, ApiLatencyStat> = HashMap::new();
        let mut metas: HashMap<String, ApiLatencyMeta> = HashMap::new();

        for (trace, input) in &in_map {
            let Some(output) = out_map.get(trace) else {
                continue;
            };
            let latency = output.at_ms - input.at_ms;
            if latency < 0 {
                continue;
            }
            let uri = normalize_uri(&input.uri).to_string();
            let key = format!("{}|{uri}", input.method);

            let stat = stats.entry(key.clone()).or_insert_with(|| ApiLatencyStat {
                at: now_bucket,
                method: input.method.clone(),
                uri: uri.clone(),
                ..Default::default()
            });
            stat.count += 1;
            if latency > self.slow_ms {
                stat.count_slow += 1;
            }
            stat.sum_latency += latency;
            stat.max_latency = stat.max_latency.max(latency);
            match output.status {
                200..=299 => {
                    stat.count_2xx += 1;
                    stat.sum_latency_2xx += latency;
                    stat.max_latency_2xx = stat.max_latency_2xx.max(latency);
                }
                400..=499 => {
                    stat.count_4xx += 1;
                    stat.sum_latency_4xx += latency;
                    stat.max_latency_4xx = stat.max_latency_4xx.max(latency);
                }
                500..=599 => {
                    stat.count_5xx += 1;
                    stat.sum_latency_5xx += latency;
                    stat.max_latency_5xx = stat.max_latency_5xx.max(latency);
                }
                _ => {
                    stat.count_other += 1;
                    stat.sum_latency_other += latency;
                    stat.max_latency_other = stat.max_latency_other.max(latency);
                }
            }

            let sample = ApiLatencySample {
                trace_id: trace.clone(),
                url: input.uri.clone(),
                request_at: input.at_ms,
                status: output.status,
                latency_ms: latency,
                in_log: input.log.clone(),
                out_log: output.log.clone(),
            };

            let meta = metas.entry(key).or_insert_with(|| ApiLatencyMeta {
                method: input.method.clone(),
                uri: uri.clone(),
                first_at: now_bucket,
                last_at: now_bucket,
                ..Default::default()
            });
            let was_latest = meta
                .sample_latest
                .as_ref()
                .map(|d| sample.request_at > d.request_at)
                .unwrap_or(true);
            take_by_time(&mut meta.sample_latest, &sample);
            if was_latest {
                meta.sample_trace = sample.trace_id.clone();
                meta.sample_status = sample.status;
            }
            take_slow(&mut meta.sample_slow, &sample);
            match output.status {
                200..=299 => take_by_time(&mut meta.sample_2xx, &sample),
                400..=499 => take_by_time(&mut meta.sample_4xx, &sample),
                500..=599 => take_by_time(&mut meta.sample_5xx, &sample),
                _ => {}
            }
        }

        for (key, stat) in &stats {
            if let Err(e) = self.storage.put(stat) {
                error!(key = %key, "save api latency stat failed: {e:#}");
            }
        }
        for (key, fresh) in metas {
            self.upsert_meta(&key, fresh, now_bucket);
        }
    }

    fn upsert_meta(&self, key: &str, fresh: ApiLatencyMeta, now_bucket: i64) {
        let meta_key = cond(serde_json::json!({
            "method": fresh.method,
            "uri": fresh.uri,
        }));
        match self.meta.get(&meta_key) {
            Ok(None) => {
                if let Err(e) = self.meta.put(&fresh) {
                    error!(key, "save api latency meta failed: {e:#}");
                }
            }
            Ok(Some(mut existing)) => {
                existing.last_at = now_bucket;
                if existing.first_at == 0 {
                    existing.first_at = fresh.first_at;
                }
                if let Some(sample) = &fresh.sample_latest {
                    let was_latest = existing
                        .sample_latest
                        .as_ref()
                        .map(|d| sample.request_at > d.request_at)
                        .unwrap_or(true);
                    take_by_time(&mut existing.sample_latest, sample);
                    if was_latest {
                        existing.sample_trace = sample.trace_id.clone();
                        existing.sample_status = sample.status;
                    }
                }
                if let Some(sample) = &fresh.sample_slow {
                    take_slow(&mut existing.sample_slow, sample);
                }
                if let Some(sample) = &fresh.sample_2xx {
                    take_by_time(&mut existing.sample_2xx, sample);
                }
                if let Some(sample) = &fresh.sample_4xx {
                    take_by_time(&mut existing.sample_4xx, sample);
                }
                if let Some(sample) = &fresh.sample_5xx {
                    take_by_time(&mut existing.sample_5xx, sample);
                }
                let _ = self.meta.update(&meta_key, &existing);
            }
            Err(e) => error!(key, "get api latency meta failed: {e:#}"),
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

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
        let granularity = granularity.unwrap_or(Granularity::Hour);
        let fields: Vec<&str> = if fields.is_empty() {
            vec!["count2xx", "count4xx", "count5xx"]
        } else {
            for f in fields {
                if !API_TIME_FIELDS.contains(&f.as_str()) {
                    return Err(OmError::verify(format!("unsupported field: {f}")));
                }
            }
            fields.iter().map(|s| s.as_str()).collect()
        };
        self.storage
            .group_by_time(None, start, end, granularity, Agg::Sum, &fields)
            .map_err(|e| OmError::sys(format!("GroupByTime failed: {e:#}")))
    }

    /// Window totals. A non-default slow threshold cannot be answered from
    /// the rollups, so the raw logs are re-paired for the slow count.
    pub fn summary(&self, start: i64, end: i64, slow_ms: i64) -> OmResult<ApiLatencySummary> {
        if start <= 0 || end <= 0 || start > end {
            return Err(OmError::verify("Invalid time range"));
        }
        let slow_ms = if slow_ms <= 0 { self.slow_ms } else { slow_ms };

        let items = self
            .storage
            .group_by_time(
                None,
                start,
                end,
                Granularity::Minute,
                Agg::Sum,
                &["count", "sumLatency", "count5xx", "countSlow"],
            )
            .map_err(|e| OmError::sys(format!("GroupByTime summary failed: {e:#}")))?;

        let mut count = 0i64;
        let mut sum = 0i64;
        let mut count_5xx = 0i64;
        let mut slow = 0i64;
        for item in &items {
            count += item.value["count"] as i64;
            sum += item.value["sumLatency"] as i64;
            count_5xx += item.value["count5xx"] as i64;
            slow += item.value["countSlow"] as i64;
        }

        let slow_count = if slow_ms != self.slow_ms {
            self.count_slow_rescan(start, end, slow_ms)?
        } else {
            slow
        };

        Ok(ApiLatencySummary {
            count,
            avg_latency: if count > 0 { sum / count } else { 0 },
            count_5xx,
            slow_count,
            updated_at: chrono::Utc::now().timestamp(),
        })
    }

    fn count_slow_rescan(&self, start: i64, end: i64, slow_ms: i64) -> OmResult<i64> {
        let to_local = |ts: i64| {
            chrono::DateTime::from_timestamp(ts, 0)
                .map(|t| t.with_timezone(&chrono::Local))
                .unwrap_or_else(chrono::Local::now)
        };
        let opts = Self::window_opts(to_local(start), to_local(end));
        let records = self
            .logs
            .search_logs(&opts)
            .map_err(|e| OmError::sys(format!("slow count search failed: {e}")))?
            .into_iter()
            .map(|m| m.record)
            .collect::<Vec<_>>();
        let (in_map, out_map) = pair_records(&records);
        let mut slow = 0i64;
        for (trace, input) in &in_map {
            if let Some(output) = out_map.get(trace) {
                let latency = output.at_ms - input.at_ms;
                if latency >= 0 && latency > slow_ms {
                    slow += 1;
                }
            }
        }
        Ok(slow)
    }

    /// Ranked endpoints with status-class filters and derived sorters.
    #[allow(clippy::too_many_arguments)]
    pub fn top_page(
        &self,
        start: i64,
        end: i64,
        page: i64,
        size: i64,
        methods: &[String],
        neg_methods: &[String],
        uri_prefix: &str,
        statuses: &[String],
        sort_by: &str,
        asc: bool,
    ) -> OmResult<PageCache<ApiLatencyRank>> {
        if start == 0 || end == 0 || start > end {
            return Err(OmError::verify("invalid time range"));
        }
        let page = if page <= 0 { 1 } else { page };
        let size = if size <= 0 { 10 } else { size };

        let mut c = serde_json::json!({
            "at": {"$gte": start, "$lte": end},
        });
        let clean = |list: &[String]| -> Vec<String> {
            list.iter()
                .map(|m| m.trim().to_ascii_uppercase())
                .filter(|m| !m.is_empty())
                .collect()
        };
        let methods = clean(methods);
        let neg_methods = clean(neg_methods);
        if methods.len() == 1 {
            c["method"] = serde_json::json!(methods[0]);
        } else if methods.len() > 1 {
            c["method"] = serde_json::json!({"$in": methods});
        } else if neg_methods.len() == 1 {
            c["method"] = serde_json::json!({"$ne": neg_methods[0]});
        } else if neg_methods.len() > 1 {
            c["method"] = serde_json::json!({"$nin": neg_methods});
        }
        if !uri_prefix.trim().is_empty() {
            c["uri"] = serde_json::json!({"$like": format!("{}%", uri_prefix.trim())});
        }

        let statuses: Vec<String> = statuses
            .iter()
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !statuses.is_empty() {
            let mut having = Vec::new();
            for status in &statuses {
                match status.as_str() {
                    "2xx" => having.push("c2 > 0"),
                    "4xx" => having.push("c4 > 0"),
                    "5xx" => having.push("c5 > 0"),
                    "other" => having.push("co > 0"),
                    _ => {}
                }
            }
            if having.is_empty() {
                return Ok(PageCache {
                    total: 0,
                    page,
                    size,
                    items: Vec::new(),
                });
            }
            c["$having"] = serde_json::json!(format!("({})", having.join(" OR ")));
        }

        let aggs = vec![
            AggField::new("count", Agg::Sum, "cnt"),
            AggField::new("sumLatency", Agg::Sum, "sum"),
            AggField::new("maxLatency", Agg::Max, "max"),
            AggField::new("count2xx", Agg::Sum, "c2"),
            AggField::new("sumLatency2xx", Agg::Sum, "s2"),
            AggField::new("maxLatency2xx", Agg::Max, "m2"),
            AggField::new("count4xx", Agg::Sum, "c4"),
            AggField::new("sumLatency4xx", Agg::Sum, "s4"),
            AggField::new("maxLatency4xx", Agg::Max, "m4"),
            AggField::new("count5xx", Agg::Sum, "c5"),
            AggField::new("sumLatency5xx", Agg::Sum, "s5"),
            AggField::new("maxLatency5xx", Agg::Max, "m5"),
            AggField::new("countOther", Agg::Sum, "co"),
            AggField::new("sumLatencyOther", Agg::Sum, "so"),
            AggField::new("maxLatencyOther", Agg::Max, "mo"),
        ];
        let sorter = build_latency_sorter(sort_by, asc)?;

        let grouped = self
            .storage
            .group_by_fields(
                Some(&cond(c)),
                &["method", "uri"],
                &aggs,
                page,
                size,
                Some(&sorter),
            )
            .map_err(|e| OmError::sys(format!("GroupByFields latency failed: {e:#}")))?;

        let mut items = Vec::with_capacity(grouped.items.len());
        for row in grouped.items {
            let count = row.value["cnt"] as i64;
            if count == 0 {
                continue;
            }
            let count_2xx = row.value["c2"] as i64;
            let mut rank = ApiLatencyRank {
                method: row.group["method"].clone(),
                uri: row.group["uri"].clone(),
                count,
                avg_latency: row.value["sum"] as i64 / count,
                max_latency: row.value["max"] as i64,
                count_2xx,
                count_4xx: row.value["c4"] as i64,
                count_5xx: row.value["c5"] as i64,
                count_other: row.value["co"] as i64,
                success_rate: count_2xx as f64 / count as f64,
                sample_trace: String::new(),
            };
            if let Ok(Some(meta)) = self.meta.get(&cond(serde_json::json!({
                "method": rank.method,
                "uri": rank.uri,
            }))) {
                rank.sample_trace = meta.sample_trace;
            }
            items.push(rank);
        }

        Ok(PageCache {
            total: grouped.total,
            page,
            size,
            items,
        })
    }

    /// Stored samples for one endpoint, filtered by type.
    pub fn sample(&self, method: &str, uri: &str, types: &[String]) -> OmResult<ApiSampleResp> {
        let method = method.trim().to_ascii_uppercase();
        let uri = uri.trim();
        if method.is_empty() || uri.is_empty() {
            return Err(OmError::verify("method and uri are required"));
        }
        let meta = self
            .meta
            .get(&cond(serde_json::json!({
                "method": method,
                "uri": normalize_uri(uri),
            })))
            .map_err(|e| OmError::sys(format!("get api latency meta failed: {e:#}")))?;
        let Some(meta) = meta else {
            return Ok(ApiSampleResp::default());
        };

        let mut wanted: Vec<String> = Vec::new();
        for t in types {
            let t = t.trim().to_ascii_lowercase();
            if t.is_empty() {
                continue;
            }
            match t.as_str() {
                "latest" | "2xx" | "4xx" | "5xx" | "slow" => wanted.push(t),
                other => {
                    return Err(OmError::verify(format!("unsupported type: {other}")))
                }
            }
        }
        if wanted.is_empty() {
            wanted = ["latest", "2xx", "4xx", "5xx", "slow"]
                .iter()
                .map(|s| s.to_string())
                .collect();
        }

        let mut resp = ApiSampleResp::default();
        for t in wanted {
            match t.as_str() {
                "latest" => resp.latest = meta.sample_latest.clone(),
                "2xx" => resp.sample_2xx = meta.sample_2xx.clone(),
                "4xx" => resp.sample_4xx = meta.sample_4xx.clone(),
                "5xx" => resp.sample_5xx = meta.sample_5xx.clone(),
                _ => resp.sample_slow = meta.sample_slow.clone(),
            }
        }
        Ok(resp)
    }

    /// Drop rollups and meta past the retention window.
    pub fn clear(&self) {
        let expiration = chrono::Utc::now().timestamp() - self.max_age.as_secs() as i64;
        if let Err(e) = self
            .storage
            .delete(&cond(serde_json::json!({"at": {"$lt": expiration}})))
        {
            error!("clear api latency stats failed: {e:#}");
        }
        if let Err(e) = self
            .meta
            .delete(&cond(serde_json::json!({"lastAt": {"$lt": expiration}})))
        {
            error!("clear api latency meta failed: {e:#}");
        }
    }

    /// Collect at second :45 of every minute; sweep every minute.
    pub fn spawn(self: &Arc<Self>) {
        let agg = self.clone();
        tokio::spawn(async move {
            let now_sec = chrono::Local::now().format("%S").to_string();
            let current: u32 = now_sec.parse().unwrap_or(0);
            let delay = (COLLECT_SECOND + 60 - current) % 60;
            tokio::time::sleep(Duration::from_secs(delay as u64)).await;
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
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
                agg.clear();
            }
        });
    }
}

fn build_latency_sorter(sort_by: &str, asc: bool) -> OmResult<Sorter> {
    let sort_by = sort_by.trim().to_ascii_lowercase();
    let sort_by = if sort_by.is_empty() {
        "avg".to_string()
    } else {
        sort_by
    };
    let sorter = match sort_by.as_str() {
        "avg" => Sorter::by_expr("CAST(sum AS REAL) / NULLIF(cnt, 0)", asc),
        "max" => Sorter {
            sort_field: Some("max".to_string()),
            expr: None,
            asc,
        },
        "count" | "cnt" => Sorter {
            sort_field: Some("cnt".to_string()),
            expr: None,
            asc,
        },
        "2xx" => Sorter {
            sort_field: Some("c2".to_string()),
            expr: None,
            asc,
        },
        "4xx" => Sorter {
            sort_field: Some("c4".to_string()),
            expr: None,
            asc,
        },
        "5xx" => Sorter {
            sort_field: Some("c5".to_string()),
            expr: None,
            asc,
        },
        "other" => Sorter {
            sort_field: Some("co".to_string()),
            expr: None,
            asc,
        },
        "success" | "successrate" => {
            Sorter::by_expr("CAST(c2 AS REAL) / NULLIF(cnt, 0)", asc)
        }
        other => return Err(OmError::verify(format!("unsupported sortBy: {other}"))),
    };
    Ok(sorter)
}
