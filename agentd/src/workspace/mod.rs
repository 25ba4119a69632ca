//! Per-task scoped filesystem area (spec §4.2): `screens/`, `state/`,
//! `logs/` under `<LOG_DIR>/<timestamp>_<task_id>/`, with atomic JSON
//! read/write and advisory locking.
//!
//! Grounded on the teacher's `WorktreeManager` (`base_dir` + per-execution
//! subdirectory lifecycle) and `ToolContext::validate_path` (path
//! containment discipline), adapted from "one git worktree per loop" to
//! "one screenshot/state directory per task."

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

fn io_err(path: &Path, source: std::io::Error) -> WorkspaceError {
    WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Per-task directory: `screens/`, `state/`, `logs/`.
pub struct Workspace {
    root: PathBuf,
    task_id: String,
    /// In-process lock keyed by state-file name, so two writers within this
    /// process never interleave a partial write. `fs2` advisory file locks
    /// additionally guard against a second process touching the same
    /// workspace (defense in depth; spec asks for either).
    file_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    screenshot_counter: Mutex<i64>,
}

impl Workspace {
    /// Create the directory tree for `task_id` under `log_dir`, named
    /// `<timestamp>_<task_id>` per spec §6.
    pub fn create(log_dir: &Path, task_id: &str) -> Result<Self, WorkspaceError> {
        let dir_name = format!("{}_{task_id}", taskstore::now_ms());
        let root = log_dir.join(dir_name);
        for sub in ["screens", "state", "logs"] {
            std::fs::create_dir_all(root.join(sub)).map_err(|e| io_err(&root, e))?;
        }
        debug!(%task_id, root = %root.display(), "Workspace::create");
        Ok(Self {
            root,
            task_id: task_id.to_string(),
            file_locks: Mutex::new(HashMap::new()),
            screenshot_counter: Mutex::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_path(&self, name: &str) -> PathBuf {
        self.root.join("state").join(name)
    }

    fn key_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.file_locks.lock().expect("workspace lock map poisoned");
        locks.entry(name.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Serialize `value` as JSON and write it atomically: write to
    /// `<name>.tmp`, `fsync`, `rename` over `<name>`. Readers never observe
    /// a partial file.
    pub fn write_state<T: Serialize>(&self, name: &str, value: &T) -> Result<(), WorkspaceError> {
        let lock = self.key_lock(name);
        let _guard = lock.lock().expect("workspace per-file lock poisoned");

        let target = self.state_path(name);
        let tmp = target.with_extension("tmp");
        let body = serde_json::to_vec_pretty(value)?;

        let file = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
        // Advisory lock guards a second process from writing the same key
        // concurrently while we hold the descriptor open.
        file.lock_exclusive().map_err(|e| io_err(&tmp, e))?;
        std::fs::write(&tmp, &body).map_err(|e| io_err(&tmp, e))?;
        file.sync_all().map_err(|e| io_err(&tmp, e))?;
        FileExt::unlock(&file).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &target).map_err(|e| io_err(&target, e))?;
        debug!(%self.task_id, name, "Workspace::write_state");
        Ok(())
    }

    /// Read and deserialize a state file, returning `default` if it's
    /// absent or unreadable (spec's explicit "returns default" contract —
    /// this is not an error case).
    pub fn read_state<T: DeserializeOwned>(&self, name: &str, default: T) -> T {
        let lock = self.key_lock(name);
        let _guard = lock.lock().expect("workspace per-file lock poisoned");

        let path = self.state_path(name);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or(default),
            Err(_) => default,
        }
    }

    /// Append one JSON line to a `.jsonl` file under `state/`, with a
    /// trailing newline. Readers of these files must tolerate a final
    /// truncated line (spec §6); this writer never produces one under
    /// normal operation, but a crash mid-write can still leave one on disk.
    pub fn append_jsonl<T: Serialize>(&self, name: &str, value: &T) -> Result<(), WorkspaceError> {
        use std::io::Write;
        let lock = self.key_lock(name);
        let _guard = lock.lock().expect("workspace per-file lock poisoned");

        let path = self.state_path(name);
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        file.lock_exclusive().map_err(|e| io_err(&path, e))?;
        file.write_all(&line).map_err(|e| io_err(&path, e))?;
        file.sync_all().map_err(|e| io_err(&path, e))?;
        FileExt::unlock(&file).map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    /// Read all complete lines of a `.jsonl` file, silently dropping a
    /// final truncated line rather than erroring (spec §6 tolerance
    /// requirement).
    pub fn read_jsonl<T: DeserializeOwned>(&self, name: &str) -> Vec<T> {
        let path = self.state_path(name);
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };
        let mut lines: Vec<&str> = contents.split('\n').collect();
        // Drop the trailing empty element `split` produces after the final
        // newline, and any genuinely truncated last line.
        if lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines
            .into_iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Save a screenshot under `screens/<monotonic_ts>.png`, bumping a
    /// counter on same-millisecond collisions so filenames stay strictly
    /// increasing within a task.
    pub fn save_screenshot(&self, image_bytes: &[u8]) -> Result<PathBuf, WorkspaceError> {
        let ts = {
            let mut counter = self.screenshot_counter.lock().expect("screenshot counter poisoned");
            let now = taskstore::now_ms();
            *counter = if now > *counter { now } else { *counter + 1 };
            *counter
        };
        let path = self.root.join("screens").join(format!("{ts}.png"));
        std::fs::write(&path, image_bytes).map_err(|e| io_err(&path, e))?;
        Ok(path)
    }

    /// Latest screenshot by filename (which is monotonic timestamp order).
    pub fn latest_screenshot(&self) -> Option<Vec<u8>> {
        let dir = self.root.join("screens");
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir).ok()?.filter_map(|e| e.ok().map(|e| e.path())).collect();
        entries.sort();
        let latest = entries.pop()?;
        std::fs::read(latest).ok()
    }

    /// Attempt UTF-8 first; on failure, fall back once to a lossy decode.
    /// Returns whether the lossy path was taken so callers can log it —
    /// spec: "never silently corrupts."
    pub fn read_text_lenient(&self, path: &Path) -> Result<(String, bool), WorkspaceError> {
        let bytes = std::fs::read(path).map_err(|e| io_err(path, e))?;
        match String::from_utf8(bytes) {
            Ok(text) => Ok((text, false)),
            Err(e) => Ok((String::from_utf8_lossy(e.as_bytes()).into_owned(), true)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq, Default)]
    struct Sample {
        value: u32,
    }

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path(), "task-1").unwrap();
        ws.write_state("sample.json", &Sample { value: 42 }).unwrap();
        let got: Sample = ws.read_state("sample.json", Sample::default());
        assert_eq!(got.value, 42);
    }

    #[test]
    fn read_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path(), "task-1").unwrap();
        let got: Sample = ws.read_state("missing.json", Sample { value: 7 });
        assert_eq!(got.value, 7);
    }

    #[test]
    fn jsonl_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path(), "task-1").unwrap();
        ws.append_jsonl("log.jsonl", &Sample { value: 1 }).unwrap();
        ws.append_jsonl("log.jsonl", &Sample { value: 2 }).unwrap();
        let got: Vec<Sample> = ws.read_jsonl("log.jsonl");
        assert_eq!(got, vec![Sample { value: 1 }, Sample { value: 2 }]);
    }

    #[test]
    fn jsonl_tolerates_truncated_final_line() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path(), "task-1").unwrap();
        ws.append_jsonl("log.jsonl", &Sample { value: 1 }).unwrap();
        let path = ws.state_path("log.jsonl");
        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str("{\"value\":");
        std::fs::write(&path, contents).unwrap();
        let got: Vec<Sample> = ws.read_jsonl("log.jsonl");
        assert_eq!(got, vec![Sample { value: 1 }]);
    }

    #[test]
    fn screenshots_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path(), "task-1").unwrap();
        let a = ws.save_screenshot(b"a").unwrap();
        let b = ws.save_screenshot(b"b").unwrap();
        assert!(b > a);
        assert_eq!(ws.latest_screenshot().unwrap(), b"b");
    }

    #[test]
    fn directory_layout_matches_spec() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path(), "task-1").unwrap();
        assert!(ws.root().join("screens").is_dir());
        assert!(ws.root().join("state").is_dir());
        assert!(ws.root().join("logs").is_dir());
    }
}
