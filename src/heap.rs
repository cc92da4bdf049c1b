//! Heap self-observation: a counting global allocator plus a live registry
//! of big allocations attributed to their call sites.
//!
//! The binary installs [`TrackingAlloc`] as the global allocator. Every
//! allocation updates two atomic counters (live bytes, live objects);
//! allocations of at least [`BIG_MIN_BYTES`] are additionally recorded in a
//! pointer-keyed registry together with the first application frame of the
//! current backtrace. A "heap profile" is a snapshot of the per-site
//! aggregates of that registry.
//!
//! Registry bookkeeping allocates, so it is guarded by a thread-local
//! reentrancy flag; nested allocations only touch the counters.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// Allocations at or above this size get call-site attribution.
pub const BIG_MIN_BYTES: usize = 1 << 20;

static LIVE_BYTES: AtomicU64 = AtomicU64::new(0);
static LIVE_OBJECTS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static IN_TRACKER: Cell<bool> = const { Cell::new(false) };
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Site {
    pub func: String,
    pub file: String,
    pub line: i64,
}

impl Site {
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.func, self.file, self.line)
    }

    fn unknown() -> Self {
        Self {
            func: "<unknown>".to_string(),
            file: String::new(),
            line: 0,
        }
    }
}

struct BigAlloc {
    size: usize,
    site: Site,
}

fn registry() -> &'static Mutex<HashMap<usize, BigAlloc>> {
    static REGISTRY: OnceLock<Mutex<HashMap<usize, BigAlloc>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// One aggregated call site in a heap profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfPoint {
    pub key: String,
    pub func: String,
    pub file: String,
    pub line: i64,
    pub inuse_space: i64,
    pub inuse_objects: i64,
    pub avg_obj_size: i64,
}

/// Live (bytes, objects) as seen by the counters. Zero when the tracking
/// allocator is not installed (tests, library consumers).
pub fn live_counters() -> (u64, u64) {
    (
        LIVE_BYTES.load(Ordering::Relaxed),
        LIVE_OBJECTS.load(Ordering::Relaxed),
    )
}

/// Snapshot of per-site aggregates over the live big-allocation registry.
pub fn snapshot() -> Vec<ProfPoint> {
    let reg = registry().lock();
    let mut agg: HashMap<Site, (i64, i64)> = HashMap::new();
    for alloc in reg.values() {
        let entry = agg.entry(alloc.site.clone()).or_insert((0, 0));
        entry.0 += alloc.size as i64;
        entry.1 += 1;
    }
    drop(reg);

    agg.into_iter()
        .map(|(site, (space, objects))| ProfPoint {
            key: site.key(),
            avg_obj_size: if objects > 0 { space / objects } else { space },
            func: site.func,
            file: site.file,
            line: site.line,
            inuse_space: space,
            inuse_objects: objects,
        })
        .collect()
}

/// Parse the textual form of `std::backtrace::Backtrace` into
/// `(func, file, line)` frames.
pub fn parse_backtrace(text: &str) -> Vec<Site> {
    let mut frames = Vec::new();
    let mut current: Option<Site> = None;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("at ") {
            if let Some(site) = current.as_mut() {
                // "path/file.rs:123:45"
                let mut parts = rest.rsplitn(3, ':');
                let _col = parts.next();
                let line_no = parts.next().and_then(|s| s.parse::<i64>().ok());
                let file = parts.next().unwrap_or("");
                if let Some(line_no) = line_no {
                    site.file = file.to_string();
                    site.line = line_no;
                }
            }
            continue;
        }
        // "  12: some::module::function"
        if let Some((idx, name)) = trimmed.split_once(": ") {
            if idx.chars().all(|c| c.is_ascii_digit()) {
                if let Some(done) = current.take() {
                    frames.push(done);
                }
                current = Some(Site {
                    func: name.trim().to_string(),
                    file: String::new(),
                    line: 0,
                });
            }
        }
    }
    if let Some(done) = current.take() {
        frames.push(done);
    }
    frames
}

/// Frames that belong to the allocator machinery itself, not the caller.
fn is_internal_frame(func: &str) -> bool {
    const PREFIXES: &[&str] = &[
        "opsidecar::heap",
        "std::",
        "core::",
        "alloc::",
        "__rust",
        "rust_begin_unwind",
        "backtrace",
        "<alloc::",
        "<std::",
    ];
    PREFIXES.iter().any(|p| func.starts_with(p))
}

fn capture_site() -> Site {
    let bt = std::backtrace::Backtrace::force_capture();
    let frames = parse_backtrace(&bt.to_string());
    frames
        .into_iter()
        .find(|f| !is_internal_frame(&f.func))
        .unwrap_or_else(Site::unknown)
}

fn record_big(ptr: usize, size: usize) {
    IN_TRACKER.with(|flag| {
        if flag.get() {
            return;
        }
        flag.set(true);
        let site = capture_site();
        registry().lock().insert(ptr, BigAlloc { size, site });
        flag.set(false);
    });
}

fn forget_big(ptr: usize) {
    IN_TRACKER.with(|flag| {
        if flag.get() {
            return;
        }
        flag.set(true);
        registry().lock().remove(&ptr);
        flag.set(false);
    });
}

/// Counting allocator wrapper. Installed by the server binary:
///
/// ```ignore
/// #[global_allocator]
/// static ALLOC: TrackingAlloc = TrackingAlloc::new();
/// ```
pub struct TrackingAlloc {
    inner: System,
}

impl TrackingAlloc {
    pub const fn new() -> Self {
        Self { inner: System }
    }
}

impl Default for TrackingAlloc {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for TrackingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc(layout);
        if !ptr.is_null() {
            LIVE_BYTES.fetch_add(layout.size() as u64, Ordering::Relaxed);
            LIVE_OBJECTS.fetch_add(1, Ordering::Relaxed);
            if layout.size() >= BIG_MIN_BYTES {
                record_big(ptr as usize, layout.size());
            }
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if !ptr.is_null() {
            LIVE_BYTES.fetch_sub(layout.size() as u64, Ordering::Relaxed);
            LIVE_OBJECTS.fetch_sub(1, Ordering::Relaxed);
            if layout.size() >= BIG_MIN_BYTES {
                forget_big(ptr as usize);
            }
        }
        self.inner.dealloc(ptr, layout);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = self.inner.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            LIVE_BYTES.fetch_sub(layout.size() as u64, Ordering::Relaxed);
            LIVE_BYTES.fetch_add(new_size as u64, Ordering::Relaxed);
            if layout.size() >= BIG_MIN_BYTES {
                forget_big(ptr as usize);
            }
            if new_size >= BIG_MIN_BYTES {
                record_big(new_ptr as usize, new_size);
            }
        }
        new_ptr
    }
}
