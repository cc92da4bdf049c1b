//! Shared unit-test fixtures.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, OnceLock};

// Tests that touch the working directory must not run concurrently.
static CWD_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Per-test working directory; restores the previous one on drop.
pub struct CwdGuard {
    _lock: MutexGuard<'static, ()>,
    prev: PathBuf,
    dir: PathBuf,
}

impl CwdGuard {
    pub fn path(&self) -> &PathBuf {
        &self.dir
    }
}

pub fn enter_temp_cwd(tag: &str) -> CwdGuard {
    let lock = CWD_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("omtest_{tag}_{}_{nanos}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let prev = std::env::current_dir().unwrap();
    std::env::set_current_dir(&dir).unwrap();
    CwdGuard {
        _lock: lock,
        prev,
        dir,
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.prev);
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}
