/// Filesystem primitives: atomic writes, append, and an exclusive-create
/// lock file with stale-lock recovery.
///
/// No teacher file implements locking directly — `tools/write.rs` calls
/// plain `fs::write`. This module is grounded instead on the exclusive-create
/// pattern real NDJSON stores use, and on `hooks.rs`'s use of a timeout to
/// bound worst-case latency (applied here to the lock acquire retry budget).
use crate::error::{ContextFsError, Result};
use rand::Rng;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const LOCK_ACQUIRE_RETRIES: u32 = 80;
const LOCK_RENAME_RETRIES: u32 = 5;
const BACKOFF_BASE_MS: u64 = 10;
const BACKOFF_CAP_MS: u64 = 60;

pub struct Store {
    pub root: PathBuf,
}

impl Store {
    /// Open (creating if absent) the `.contextfs` directory and its seed
    /// files. Mirrors the teacher's `ConfigFile::write_default_if_missing`:
    /// re-running on an already-initialized workspace is a no-op.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let pins = root.join("pins.md");
        if !pins.exists() {
            write_text_atomic(&pins, "")?;
        }
        let summary = root.join("summary.md");
        if !summary.exists() {
            write_text_atomic(&summary, "# Summary\n\n")?;
        }
        let history = root.join("history.ndjson");
        if !history.exists() {
            write_text_atomic(&history, "")?;
        }
        let archive = root.join("archive.ndjson");
        if !archive.exists() {
            write_text_atomic(&archive, "")?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn read_text(&self, name: &str) -> Result<String> {
        read_text(&self.path(name))
    }

    pub fn write_text_atomic(&self, name: &str, contents: &str) -> Result<()> {
        write_text_atomic(&self.path(name), contents)
    }

    pub fn append(&self, name: &str, line: &str) -> Result<()> {
        append(&self.path(name), line)
    }

    /// Run `f` while holding the store-wide lock. The lock is released as
    /// soon as the returned guard drops, which happens before `f`'s result
    /// is handed back here — callers that need to await an external call
    /// without holding the lock should acquire, copy what they need, drop
    /// the guard, await, then re-acquire for phase 3. See `compactor.rs`.
    pub fn with_lock<T>(&self, stale_ms: u64, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = LockGuard::acquire(&self.root.join(".lock"), stale_ms)?;
        f()
    }
}

fn read_text(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

/// Write `contents` to `path` via write-to-temp then rename, so readers
/// never observe a partial write. Temp name includes pid/millis/random
/// suffix to avoid collisions between concurrent writers to the same path.
pub fn write_text_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_name = format!(
        "{}.{}.{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("tmp"),
        std::process::id(),
        now_millis(),
        rand::thread_rng().gen::<u32>(),
    );
    let tmp_path = dir.join(tmp_name);

    let mut attempt = 0u32;
    loop {
        match fs::write(&tmp_path, contents) {
            Ok(()) => break,
            Err(e) if attempt < LOCK_RENAME_RETRIES => {
                attempt += 1;
                std::thread::sleep(backoff_duration(attempt));
                let _ = e;
            }
            Err(e) => return Err(e.into()),
        }
    }

    let mut attempt = 0u32;
    loop {
        match fs::rename(&tmp_path, path) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < LOCK_RENAME_RETRIES => {
                attempt += 1;
                std::thread::sleep(backoff_duration(attempt));
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e.into());
            }
        }
    }
}

/// Append a single NDJSON line (newline-terminated) to `path`, creating it
/// if absent. Uses `OpenOptions::append` the way the teacher's
/// `sessions.rs::append_turn` does.
pub fn append(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    f.write_all(line.as_bytes())?;
    if !line.ends_with('\n') {
        f.write_all(b"\n")?;
    }
    Ok(())
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

fn backoff_duration(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS.saturating_mul(attempt as u64).min(BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0..=2);
    Duration::from_millis(base + jitter)
}

/// Exclusive-create lock file, stamp-verified release, stale-lock recovery.
///
/// Acquire creates `<root>/.lock` with `OpenOptions::create_new`, writing a
/// stamp (pid + acquire time) so release can confirm it still owns the file
/// before removing it (a concurrent process may have recovered a stale lock
/// and written its own stamp in the meantime). If creation fails because the
/// file exists, its mtime is checked against `stale_ms`; a lock older than
/// that is considered abandoned (its owner crashed or hung) and is removed
/// before retrying.
struct LockGuard {
    path: PathBuf,
    stamp: String,
}

impl LockGuard {
    fn acquire(path: &Path, stale_ms: u64) -> Result<Self> {
        let mut attempt = 0u32;
        loop {
            let stamp = format!("{}:{}", std::process::id(), now_millis());
            match OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(path)
            {
                Ok(mut f) => {
                    f.write_all(stamp.as_bytes())?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                        stamp,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Ok(meta) = fs::metadata(path) {
                        if let Ok(modified) = meta.modified() {
                            let age_ms = SystemTime::now()
                                .duration_since(modified)
                                .unwrap_or_default()
                                .as_millis() as u64;
                            if age_ms > stale_ms {
                                let _ = fs::remove_file(path);
                                continue;
                            }
                        }
                    }
                    if attempt >= LOCK_ACQUIRE_RETRIES {
                        return Err(ContextFsError::Lock(format!(
                            "could not acquire {} after {} attempts",
                            path.display(),
                            attempt
                        )));
                    }
                    attempt += 1;
                    std::thread::sleep(backoff_duration(attempt));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Ok(current) = fs::read_to_string(&self.path) {
            if current == self.stamp {
                let _ = fs::remove_file(&self.path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join(".contextfs");
        let s1 = Store::open(&root).unwrap();
        s1.write_text_atomic("pins.md", "- a pin\n").unwrap();
        let s2 = Store::open(&root).unwrap();
        assert_eq!(s2.read_text("pins.md").unwrap(), "- a pin\n");
    }

    #[test]
    fn atomic_write_leaves_no_tmp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt");
        write_text_atomic(&path, "hello").unwrap();
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");
    }

    #[test]
    fn append_creates_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.ndjson");
        append(&path, "line1").unwrap();
        append(&path, "line2").unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "line1\nline2\n");
    }

    #[test]
    fn with_lock_runs_closure_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join(".contextfs");
        let store = Store::open(&root).unwrap();
        let result = store.with_lock(1000, || Ok(42)).unwrap();
        assert_eq!(result, 42);
        assert!(!root.join(".lock").exists());
    }

    #[test]
    fn stale_lock_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(".lock");
        fs::write(&lock_path, "9999999:1").unwrap();
        // any existing lock is older than a 1ms staleness threshold by the
        // time acquire() checks it, so it's treated as abandoned.
        std::thread::sleep(Duration::from_millis(5));
        let guard = LockGuard::acquire(&lock_path, 1).unwrap();
        drop(guard);
        assert!(!lock_path.exists());
    }
}
