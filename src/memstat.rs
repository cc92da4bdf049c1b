//! Memory growth tracking: periodic heap baselines, big-object rollups and
//! a windowed leak detector.
//!
//! Profiles are snapshots of the tracking allocator's big-allocation
//! registry, serialized under `.cache/heap/`. The leak detector keeps the
//! three most recent samples of (live bytes, live objects); a window that
//! is strictly increasing on either axis past the thresholds, outside the
//! cooldown, produces a LeakEvent with the top delta call sites.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::error::{OmError, OmResult};
use crate::heap::{self, ProfPoint};
use crate::store::{cond, Agg, AggField, PageCache, Pager, Record, Sorter, Store};

const BASELINE_TICK: Duration = Duration::from_secs(300);
const LEAK_TICK: Duration = Duration::from_secs(10);
const LEAK_WINDOW: usize = 3;
const LEAK_ALLOC_DELTA: u64 = 200 * 1024 * 1024;
const LEAK_OBJECT_DELTA: u64 = 200_000;
const LEAK_COOLDOWN: Duration = Duration::from_secs(120);
const BIG_TOP_LIMIT: usize = 50;
const BIG_MIN_INUSE: i64 = 1 << 20;
const LEAK_TOP_LIMIT: usize = 10;
const BASE_PROFILE_KEEP: usize = 1;
const LEAK_PROFILE_KEEP: usize = 100;
const LEAK_PROFILE_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 3600);
const LEAK_EVENT_KEEP: i64 = 10_000;

const HEAP_DIR: &str = ".cache/heap";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BigObjStat {
    pub at: i64,
    pub key: String,
    #[serde(rename = "func")]
    pub func: String,
    pub file: String,
    pub line: i64,
    pub inuse_space: i64,
    pub inuse_objects: i64,
    pub avg_obj_size: i64,
}

impl Record for BigObjStat {
    const TABLE: &'static str = "mem_big_stat";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeakPoint {
    pub func: String,
    pub file: String,
    pub line: i64,
    pub delta_space: i64,
    pub delta_objects: i64,
    pub avg_obj_size: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeakEvent {
    pub at: i64,
    pub alloc_bytes: u64,
    pub object_count: u64,
    pub alloc_delta: u64,
    pub object_delta: u64,
    pub base_inuse_space: i64,
    pub leak_inuse_space: i64,
    pub base_inuse_object: i64,
    pub leak_inuse_object: i64,
    pub base_profile: String,
    pub leak_profile: String,
    pub points: Vec<LeakPoint>,
}

impl Record for LeakEvent {
    const TABLE: &'static str = "mem_leak_event";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSample {
    pub at: i64,
    pub alloc_bytes: u64,
    pub objects: u64,
}

impl HeapSample {
    pub fn from_counters() -> Self {
        let (alloc_bytes, objects) = heap::live_counters();
        Self {
            at: chrono::Utc::now().timestamp(),
            alloc_bytes,
            objects,
        }
    }
}

/// Window verdict: fires only when the window is full, strictly
/// monotonically increasing on bytes or objects, and the growth clears the
/// thresholds.
pub fn check_leak_window(samples: &[HeapSample]) -> (bool, u64, u64) {
    if samples.len() < LEAK_WINDOW {
        return (false, 0, 0);
    }
    let mut alloc_growing = true;
    let mut obj_growing = true;
    for pair in samples.windows(2) {
        if pair[1].alloc_bytes <= pair[0].alloc_bytes {
            alloc_growing = false;
        }
        if pair[1].objects <= pair[0].objects {
            obj_growing = false;
        }
    }
    let alloc_delta = samples[samples.len() - 1]
        .alloc_bytes
        .saturating_sub(samples[0].alloc_bytes);
    let obj_delta = samples[samples.len() - 1]
        .objects
        .saturating_sub(samples[0].objects);
    let trigger = (alloc_growing && alloc_delta >= LEAK_ALLOC_DELTA)
        || (obj_growing && obj_delta >= LEAK_OBJECT_DELTA);
    (trigger, alloc_delta, obj_delta)
}

/// Site-keyed growth between two profiles, largest space delta first.
pub fn diff_points(base: &[ProfPoint], current: &[ProfPoint]) -> Vec<LeakPoint> {
    let base_map: HashMap<&str, &ProfPoint> =
        base.iter().map(|p| (p.key.as_str(), p)).collect();
    let mut diff: Vec<LeakPoint> = current
        .iter()
        .filter_map(|cur| {
            let (base_space, base_objs) = base_map
                .get(cur.key.as_str())
                .map(|b| (b.inuse_space, b.inuse_objects))
                .unwrap_or((0, 0));
            let delta_space = cur.inuse_space - base_space;
            let delta_objects = cur.inuse_objects - base_objs;
            if delta_space <= 0 && delta_objects <= 0 {
                return None;
            }
            Some(LeakPoint {
                func: cur.func.clone(),
                file: cur.file.clone(),
                line: cur.line,
                delta_space,
                delta_objects,
                avg_obj_size: if delta_objects > 0 {
                    delta_space / delta_objects
                } else {
                    delta_space
                },
            })
        })
        .collect();
    diff.sort_by(|a, b| b.delta_space.cmp(&a.delta_space));
    diff
}

pub fn profile_totals(points: &[ProfPoint]) -> (i64, i64) {
    points
        .iter()
        .fold((0, 0), |(s, o), p| (s + p.inuse_space, o + p.inuse_objects))
}

struct MemState {
    base_profile: Option<PathBuf>,
    last_leak_at: Option<i64>,
    samples: Vec<HeapSample>,
}

pub struct MemStat {
    big: Pager<BigObjStat>,
    leak: Pager<LeakEvent>,
    state: Mutex<MemState>,
    cooldown: Duration,
    ballast: Mutex<Vec<Vec<u8>>>,
}

impl MemStat {
    pub fn new(store: &Store) -> Self {
        Self {
            big: store.pager::<BigObjStat>(),
            leak: store.pager::<LeakEvent>(),
            state: Mutex::new(MemState {
                base_profile: None,
                last_leak_at: None,
                samples: Vec::new(),
            }),
            cooldown: LEAK_COOLDOWN,
            ballast: Mutex::new(Vec::new()),
        }
    }

    fn heap_dir() -> std::io::Result<PathBuf> {
        let dir = PathBuf::from(HEAP_DIR);
        std::fs::create_dir_all(&dir)?;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        Ok(dir)
    }

    fn write_profile(path: &Path, points: &[ProfPoint]) -> std::io::Result<()> {
        let body = serde_json::to_vec(points)?;
        std::fs::write(path, body)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
    }

    fn load_profile(path: &Path) -> Option<Vec<ProfPoint>> {
        let body = std::fs::read(path).ok()?;
        serde_json::from_slice(&body).ok()
    }

    /// Write a baseline profile and refresh the big-object rollups.
    pub fn collect_baseline(&self) {
        let Ok(dir) = Self::heap_dir() else {
            error!("ensure heap dir failed");
            return;
        };
        let at = chrono::Utc::now().timestamp();
        let path = dir.join(format!("heap_base_{at}.pprof"));
        let points = heap::snapshot();
        if let Err(e) = Self::write_profile(&path, &points) {
            error!("write heap profile failed: {e}");
            return;
        }

        self.record_big_stats(at, &points);

        self.state.lock().base_profile = Some(path);
        prune_profiles(&dir, "heap_base_", BASE_PROFILE_KEEP, None);
        prune_profiles(
            &dir,
            "heap_leak_",
            LEAK_PROFILE_KEEP,
            Some(LEAK_PROFILE_MAX_AGE),
        );
    }

    fn record_big_stats(&self, at: i64, points: &[ProfPoint]) {
        let mut points: Vec<&ProfPoint> = points
            .iter()
            .filter(|p| p.inuse_space >= BIG_MIN_INUSE)
            .collect();
        points.sort_by(|a, b| b.inuse_space.cmp(&a.inuse_space));
        points.truncate(BIG_TOP_LIMIT);
        for p in points {
            let stat = BigObjStat {
                at,
                key: p.key.clone(),
                func: p.func.clone(),
                file: p.file.clone(),
                line: p.line,
                inuse_space: p.inuse_space,
                inuse_objects: p.inuse_objects,
                avg_obj_size: p.avg_obj_size,
            };
            if let Err(e) = self.big.put(&stat) {
                error!("save big object stat failed: {e:#}");
            }
        }
    }

    /// One leak-loop tick with an externally supplied sample; the loop
    /// feeds in the allocator counters, tests feed synthetic growth.
    pub fn observe(&self, sample: HeapSample) {
        let (alloc_delta, obj_delta) = {
            let mut state = self.state.lock();
            state.samples.push(sample);
            let excess = state.samples.len().saturating_sub(LEAK_WINDOW);
            if excess > 0 {
                state.samples.drain(..excess);
            }
            let (ready, alloc_delta, obj_delta) = check_leak_window(&state.samples);
            if !ready {
                return;
            }
            if let Some(last) = state.last_leak_at {
                if sample.at - last < self.cooldown.as_secs() as i64 {
                    return;
                }
            }
            state.last_leak_at = Some(sample.at);
            (alloc_delta, obj_delta)
        };
        self.capture_leak(sample, alloc_delta, obj_delta);
    }

    fn capture_leak(&self, sample: HeapSample, alloc_delta: u64, obj_delta: u64) {
        let Ok(dir) = Self::heap_dir() else {
            error!("ensure heap dir failed");
            return;
        };

        let base_path = {
            let state = self.state.lock();
            state.base_profile.clone()
        };
        let base_path = match base_path.filter(|p| p.exists()) {
            Some(p) => Some(p),
            None => {
                self.collect_baseline();
                self.state.lock().base_profile.clone()
            }
        };

        let leak_path = dir.join(format!("heap_leak_{}.pprof", sample.at));
        let current = heap::snapshot();
        if let Err(e) = Self::write_profile(&leak_path, &current) {
            error!("write leak profile failed: {e}");
            return;
        }

        let base_points = base_path
            .as_ref()
            .and_then(|p| Self::load_profile(p))
            .unwrap_or_default();
        let mut points = diff_points(&base_points, &current);
        points.truncate(LEAK_TOP_LIMIT);
        let (base_space, base_objects) = profile_totals(&base_points);
        let (leak_space, leak_objects) = profile_totals(&current);

        let event = LeakEvent {
            at: sample.at,
            alloc_bytes: sample.alloc_bytes,
            object_count: sample.objects,
            alloc_delta,
            object_delta: obj_delta,
            base_inuse_space: base_space,
            leak_inuse_space: leak_space,
            base_inuse_object: base_objects,
            leak_inuse_object: leak_objects,
            base_profile: base_path
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default(),
            leak_profile: leak_path.to_string_lossy().to_string(),
            points,
        };
        if let Err(e) = self.leak.put(&event) {
            error!("save leak event failed: {e:#}");
        } else {
            info!(
                alloc_delta,
                obj_delta, "leak event recorded"
            );
            self.prune_leak_events();
        }
        prune_profiles(
            &dir,
            "heap_leak_",
            LEAK_PROFILE_KEEP,
            Some(LEAK_PROFILE_MAX_AGE),
        );
    }

    fn prune_leak_events(&self) {
        let page = match self
            .leak
            .find(1, LEAK_EVENT_KEEP, None, Some(&Sorter::desc("at")))
        {
            Ok(p) => p,
            Err(e) => {
                error!("find leak events failed: {e:#}");
                return;
            }
        };
        if page.total <= LEAK_EVENT_KEEP || page.items.is_empty() {
            return;
        }
        let cutoff = page.items[page.items.len() - 1].at;
        if cutoff == 0 {
            return;
        }
        if let Err(e) = self
            .leak
            .delete(&cond(serde_json::json!({"at": {"$lt": cutoff}})))
        {
            error!("delete old leak events failed: {e:#}");
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn big_top(
        &self,
        start: i64,
        end: i64,
        page: i64,
        size: i64,
        sort_by: &str,
        asc: bool,
    ) -> OmResult<PageCache<BigObjStat>> {
        if start == 0 || end == 0 || start > end {
            return Err(OmError::verify("invalid time range"));
        }
        let c = cond(serde_json::json!({
            "at": {"$gte": start, "$lte": end},
            "$having": format!("space >= {BIG_MIN_INUSE}"),
        }));
        let aggs = vec![
            AggField::new("inuseSpace", Agg::Max, "space"),
            AggField::new("inuseObjects", Agg::Max, "objs"),
            AggField::new("avgObjSize", Agg::Max, "avg"),
            AggField::new("at", Agg::Max, "lastAt"),
        ];
        let sort_field = match sort_by.trim().to_ascii_lowercase().as_str() {
            "inuseobjects" | "objects" | "objs" => "objs",
            "avgobjsize" | "avg" => "avg",
            "lastat" | "at" => "lastAt",
            _ => "space",
        };
        let grouped = self
            .big
            .group_by_fields(
                Some(&c),
                &["key", "func", "file", "line"],
                &aggs,
                page,
                size,
                Some(&Sorter {
                    sort_field: Some(sort_field.to_string()),
                    expr: None,
                    asc,
                }),
            )
            .map_err(|e| OmError::sys(format!("GroupByFields big object failed: {e:#}")))?;

        let items = grouped
            .items
            .into_iter()
            .map(|row| BigObjStat {
                at: row.value["lastAt"] as i64,
                key: row.group["key"].clone(),
                func: row.group["func"].clone(),
                file: row.group["file"].clone(),
                line: row.group["line"].parse().unwrap_or(0),
                inuse_space: row.value["space"] as i64,
                inuse_objects: row.value["objs"] as i64,
                avg_obj_size: row.value["avg"] as i64,
            })
            .collect();
        Ok(PageCache {
            total: grouped.total,
            page: grouped.page,
            size: grouped.size,
            items,
        })
    }

    pub fn big_count(&self, start: i64, end: i64) -> OmResult<i64> {
        if start == 0 || end == 0 || start > end {
            return Err(OmError::verify("invalid time range"));
        }
        let c = cond(serde_json::json!({
            "at": {"$gte": start, "$lte": end},
            "$having": format!("space >= {BIG_MIN_INUSE}"),
        }));
        let aggs = vec![
            AggField::new("inuseSpace", Agg::Max, "space"),
            AggField::new("inuseObjects", Agg::Max, "objs"),
        ];
        let grouped = self
            .big
            .group_by_fields(Some(&c), &["func", "file", "line"], &aggs, 1, 1, None)
            .map_err(|e| OmError::sys(format!("GroupByFields big count failed: {e:#}")))?;
        Ok(grouped.total)
    }

    pub fn leak_latest(&self) -> OmResult<Option<LeakEvent>> {
        let page = self
            .leak
            .find(1, 1, None, Some(&Sorter::desc("at")))
            .map_err(|e| OmError::sys(format!("Find leak event failed: {e:#}")))?;
        Ok(page.items.into_iter().next())
    }

    pub fn leak_count(&self, start: i64, end: i64) -> OmResult<i64> {
        if start == 0 || end == 0 || start > end {
            return Err(OmError::verify("invalid time range"));
        }
        self.leak
            .count(Some(&cond(serde_json::json!({
                "at": {"$gte": start, "$lte": end},
            }))))
            .map_err(|e| OmError::sys(format!("Count leak event failed: {e:#}")))
    }

    pub fn leak_page(
        &self,
        start: i64,
        end: i64,
        page: i64,
        size: i64,
    ) -> OmResult<PageCache<LeakEvent>> {
        if start > 0 && end > 0 && start > end {
            return Err(OmError::verify("invalid time range"));
        }
        let mut time = serde_json::Map::new();
        if start > 0 {
            time.insert("$gte".to_string(), serde_json::json!(start));
        }
        if end > 0 {
            time.insert("$lte".to_string(), serde_json::json!(end));
        }
        let c = if time.is_empty() {
            None
        } else {
            Some(cond(serde_json::json!({"at": time})))
        };
        self.leak
            .find(page, size, c.as_ref(), Some(&Sorter::desc("at")))
            .map_err(|e| OmError::sys(format!("Find leak page failed: {e:#}")))
    }

    // ------------------------------------------------------------------
    // Loops
    // ------------------------------------------------------------------

    pub fn spawn(self: &Arc<Self>) {
        let stat = self.clone();
        tokio::spawn(async move {
            stat.collect_baseline();
            let mut ticker = tokio::time::interval(BASELINE_TICK);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                stat.collect_baseline();
            }
        });
        let stat = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LEAK_TICK);
            loop {
                ticker.tick().await;
                stat.observe(HeapSample::from_counters());
            }
        });
        self.start_leak_ballast();
    }

    /// Self-test ballast driven by MEMSTAT_LEAK_* environment variables:
    /// retains buffers on a schedule so the detector has something to find.
    fn start_leak_ballast(self: &Arc<Self>) {
        if std::env::var("MEMSTAT_LEAK_TEST").as_deref() != Ok("1") {
            return;
        }
        let size_mb: usize = env_parse("MEMSTAT_LEAK_MB", 20);
        let count: usize = env_parse("MEMSTAT_LEAK_COUNT", 15);
        let interval_secs: u64 = env_parse("MEMSTAT_LEAK_INTERVAL", 2);
        if size_mb == 0 || count == 0 {
            return;
        }
        let stat = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            for _ in 0..count {
                ticker.tick().await;
                let mut buf = vec![0u8; size_mb * 1024 * 1024];
                for idx in (0..buf.len()).step_by(4096) {
                    buf[idx] = 1;
                }
                stat.ballast.lock().push(buf);
            }
        });
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Keep the newest `keep` profiles with the given prefix; drop anything
/// older than `max_age` outright.
fn prune_profiles(dir: &Path, prefix: &str, keep: usize, max_age: Option<Duration>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let now = std::time::SystemTime::now();
    let mut files: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(prefix) || !name.ends_with(".pprof") {
            continue;
        }
        let Ok(mtime) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if let Some(max_age) = max_age {
            if now.duration_since(mtime).unwrap_or_default() > max_age {
                let _ = std::fs::remove_file(entry.path());
                continue;
            }
        }
        files.push((mtime, entry.path()));
    }
    if files.len() <= keep {
        return;
    }
    files.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, path) in files.split_off(keep) {
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(at: i64, bytes: u64, objects: u64) -> HeapSample {
        HeapSample {
            at,
            alloc_bytes: bytes,
            objects,
        }
    }

    fn point(key: &str, space: i64, objects: i64) -> ProfPoint {
        ProfPoint {
            key: key.to_string(),
            func: key.to_string(),
            file: "f.rs".to_string(),
            line: 1,
            inuse_space: space,
            inuse_objects: objects,
            avg_obj_size: if objects > 0 { space / objects } else { space },
        }
    }

    #[test]
    fn test_window_requires_three_samples() {
        let (ready, _, _) = check_leak_window(&[sample(0, 1 << 30, 1)]);
        assert!(!ready);
        let (ready, _, _) =
            check_leak_window(&[sample(0, 1 << 30, 1), sample(10, 2 << 30, 2)]);
        assert!(!ready);
    }

    #[test]
    fn test_window_strictly_increasing_bytes() {
        let g = 1u64 << 30;
        let (ready, alloc_delta, _) = check_leak_window(&[
            sample(0, g, 10),
            sample(10, g + 150 * 1024 * 1024, 10),
            sample(20, g + 300 * 1024 * 1024, 10),
        ]);
        assert!(ready);
        assert_eq!(alloc_delta, 300 * 1024 * 1024);
    }

    #[test]
    fn test_window_rejects_dip() {
        let g = 1u64 << 30;
        let (ready, _, _) = check_leak_window(&[
            sample(0, g, 1_000_000),
            sample(10, g - 1, 1_100_000),
            sample(20, g + 300 * 1024 * 1024, 1_050_000),
        ]);
        assert!(!ready);
    }

    #[test]
    fn test_window_object_growth_triggers() {
        let (ready, _, obj_delta) = check_leak_window(&[
            sample(0, 100, 1_000_000),
            sample(10, 90, 1_150_000),
            sample(20, 80, 1_300_000),
        ]);
        assert!(ready);
        assert_eq!(obj_delta, 300_000);
    }

    #[test]
    fn test_window_below_threshold() {
        let (ready, _, _) = check_leak_window(&[
            sample(0, 1000, 10),
            sample(10, 2000, 20),
            sample(20, 3000, 30),
        ]);
        assert!(!ready);
    }

    #[test]
    fn test_diff_points_orders_by_delta() {
        let base = vec![point("a", 10 << 20, 10), point("b", 5 << 20, 5)];
        let cur = vec![
            point("a", 12 << 20, 12),
            point("b", 40 << 20, 6),
            point("c", 1 << 20, 1),
        ];
        let diff = diff_points(&base, &cur);
        assert_eq!(diff.len(), 3);
        assert_eq!(diff[0].func, "b");
        assert_eq!(diff[0].delta_space, 35 << 20);
        assert_eq!(diff[2].func, "a");
        // shrinking sites are dropped
        let shrunk = diff_points(&cur, &base);
        assert!(shrunk.iter().all(|p| p.func != "b"));
    }

    #[test]
    fn test_profile_totals() {
        let points = vec![point("a", 100, 2), point("b", 50, 1)];
        assert_eq!(profile_totals(&points), (150, 3));
    }

    #[test]
    fn test_observe_cooldown_and_threshold() {
        let _guard = crate::testutil::enter_temp_cwd("memstat");
        let store = Store::in_memory().unwrap();
        let stat = MemStat::new(&store);

        let g = 1u64 << 30;
        let step = 150 * 1024 * 1024;
        // first window fires
        stat.observe(sample(0, g, 10));
        stat.observe(sample(10, g + step, 10));
        stat.observe(sample(20, g + 2 * step, 10));
        assert_eq!(stat.leak.count(None).unwrap(), 1);

        // keeps growing inside the cooldown: no second event
        stat.observe(sample(30, g + 3 * step, 10));
        assert_eq!(stat.leak.count(None).unwrap(), 1);

        // after the cooldown a fresh growing window fires again
        stat.observe(sample(200, g + 5 * step, 10));
        stat.observe(sample(210, g + 7 * step, 10));
        assert_eq!(stat.leak.count(None).unwrap(), 2);
    }

    #[test]
    fn test_leak_event_records_deltas_and_profiles() {
        let _guard = crate::testutil::enter_temp_cwd("memleak");
        let store = Store::in_memory().unwrap();
        let stat = MemStat::new(&store);
        let g = 1u64 << 30;
        let step = 200 * 1024 * 1024;
        stat.observe(sample(0, g, 100));
        stat.observe(sample(10, g + step, 200));
        stat.observe(sample(20, g + 2 * step, 300));

        let event = stat.leak_latest().unwrap().unwrap();
        assert_eq!(event.at, 20);
        assert_eq!(event.alloc_delta, 2 * step);
        assert_eq!(event.object_delta, 200);
        assert!(event.leak_profile.contains("heap_leak_20"));
        assert!(Path::new(&event.leak_profile).exists());
    }

    #[test]
    fn test_baseline_writes_profile_and_prunes() {
        let _guard = crate::testutil::enter_temp_cwd("membase");
        let store = Store::in_memory().unwrap();
        let stat = MemStat::new(&store);
        stat.collect_baseline();
        let dir = Path::new(HEAP_DIR);
        let bases: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("heap_base_"))
            .collect();
        assert_eq!(bases.len(), 1);
    }

    #[test]
    fn test_big_top_groups_and_filters() {
        let store = Store::in_memory().unwrap();
        let stat = MemStat::new(&store);
        for (at, space) in [(100, 4 << 20), (200, 8 << 20)] {
            stat.big
                .put(&BigObjStat {
                    at,
                    key: "f|a.rs|1".into(),
                    func: "f".into(),
                    file: "a.rs".into(),
                    line: 1,
                    inuse_space: space,
                    inuse_objects: 2,
                    avg_obj_size: space / 2,
                })
                .unwrap();
        }
        // a small site below the floor never surfaces
        stat.big
            .put(&BigObjStat {
                at: 100,
                key: "tiny|b.rs|2".into(),
                func: "tiny".into(),
                file: "b.rs".into(),
                line: 2,
                inuse_space: 1024,
                inuse_objects: 1,
                avg_obj_size: 1024,
            })
            .unwrap();

        let top = stat.big_top(1, 1000, 1, 10, "space", false).unwrap();
        assert_eq!(top.total, 1);
        assert_eq!(top.items[0].func, "f");
        assert_eq!(top.items[0].inuse_space, 8 << 20);
        assert_eq!(top.items[0].at, 200);

        assert_eq!(stat.big_count(1, 1000).unwrap(), 1);
        assert!(stat.big_top(0, 0, 1, 10, "space", false).is_err());
    }

    #[test]
    fn test_leak_page_time_filter() {
        let store = Store::in_memory().unwrap();
        let stat = MemStat::new(&store);
        for at in [100, 200, 300] {
            stat.leak
                .put(&LeakEvent {
                    at,
                    ..Default::default()
                })
                .unwrap();
        }
        let page = stat.leak_page(150, 250, 1, 10).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].at, 200);
        let all = stat.leak_page(0, 0, 1, 10).unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.items[0].at, 300);
        assert_eq!(stat.leak_count(100, 300).unwrap(), 3);
    }

    #[test]
    fn test_prune_profiles_keeps_newest() {
        let _guard = crate::testutil::enter_temp_cwd("prune");
        let dir = Path::new(".");
        for i in 0..4 {
            let p = dir.join(format!("heap_base_{i}.pprof"));
            std::fs::write(&p, b"[]").unwrap();
            let mtime = std::time::SystemTime::now() - Duration::from_secs(100 - i * 10);
            let f = std::fs::File::options().write(true).open(&p).unwrap();
            f.set_times(
                std::fs::FileTimes::new()
                    .set_accessed(mtime)
                    .set_modified(mtime),
            )
            .unwrap();
        }
        prune_profiles(dir, "heap_base_", 2, None);
        let left = std::fs::read_dir(dir).unwrap().flatten().count();
        assert_eq!(left, 2);
    }
}
