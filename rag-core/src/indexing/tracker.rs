//! File tracking for incremental indexing.
//!
//! The tracker is a SHA-256-keyed manifest of every file the indexer has
//! successfully indexed, persisted as JSON next to the vector store. Change
//! detection takes a fast path on `(size, mtime)` and only hashes when that
//! is inconclusive. Saves are atomic: write to a `.tmp` sibling, fsync,
//! rename — a crash mid-save leaves either the old manifest or the new one,
//! never a truncated file.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const TRACKER_FILE_NAME: &str = "file_tracker.json";
const TRACKER_VERSION: u32 = 1;

/// State of a tracked file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    /// Repo-relative, forward-slash normalized path
    pub path: String,
    /// Hex SHA-256 of the file contents at index time
    pub file_hash: String,
    /// ISO-8601 UTC timestamp of the last successful index
    pub indexed_at: String,
    /// File size in bytes
    pub file_size: u64,
    /// Modification time in milliseconds since the epoch, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime_ms: Option<i64>,
    /// Number of chunks produced from this file
    #[serde(default)]
    pub chunk_count: usize,
}

/// Persistent tracker state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerState {
    /// Schema version
    pub version: u32,
    /// ISO-8601 UTC timestamp of the last save
    pub last_updated: String,
    /// Tracked files keyed by relative path
    pub files: BTreeMap<String, FileState>,
}

/// Compute the hex SHA-256 hash of a file's contents.
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).map_err(|source| Error::ReadFailure {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer).map_err(|source| Error::ReadFailure {
            path: path.to_path_buf(),
            source,
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Normalize a repo-relative path to POSIX separators.
#[must_use]
pub fn posix_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn mtime_ms_of(metadata: &fs::Metadata) -> Option<i64> {
    let modified = metadata.modified().ok()?;
    let since_epoch = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
    i64::try_from(since_epoch.as_millis()).ok()
}

/// Tracks file states for incremental indexing.
pub struct FileTracker {
    persist_dir: PathBuf,
    tracker_file: PathBuf,
    state: TrackerState,
}

impl FileTracker {
    /// Open (or initialize) the tracker under `persist_dir`.
    ///
    /// An unreadable or corrupt manifest is treated as absent: the next
    /// index run rebuilds it from scratch.
    #[must_use]
    pub fn new(persist_dir: &Path) -> Self {
        let tracker_file = persist_dir.join(TRACKER_FILE_NAME);
        let state = Self::load(&tracker_file);
        Self {
            persist_dir: persist_dir.to_path_buf(),
            tracker_file,
            state,
        }
    }

    fn load(tracker_file: &Path) -> TrackerState {
        if !tracker_file.exists() {
            return TrackerState { version: TRACKER_VERSION, ..TrackerState::default() };
        }
        match fs::read_to_string(tracker_file)
            .map_err(Error::from)
            .and_then(|raw| serde_json::from_str::<TrackerState>(&raw).map_err(Error::from))
        {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(file = %tracker_file.display(), error = %e, "could not load file tracker, starting fresh");
                TrackerState { version: TRACKER_VERSION, ..TrackerState::default() }
            }
        }
    }

    /// Tracked state for one file, if any.
    #[must_use]
    pub fn get_file_state(&self, path: &str) -> Option<&FileState> {
        self.state.files.get(path)
    }

    /// Record a successful index of `path`.
    pub fn update_file(
        &mut self,
        path: &str,
        file_hash: &str,
        file_size: u64,
        mtime_ms: Option<i64>,
        chunk_count: usize,
    ) {
        self.state.files.insert(
            path.to_string(),
            FileState {
                path: path.to_string(),
                file_hash: file_hash.to_string(),
                indexed_at: Utc::now().to_rfc3339(),
                file_size,
                mtime_ms,
                chunk_count,
            },
        );
    }

    /// Forget a file.
    pub fn remove_file(&mut self, path: &str) {
        self.state.files.remove(path);
    }

    /// Files whose current contents differ from the tracked hash, plus new
    /// files. The `(size, mtime)` fast path skips hashing unchanged files.
    pub fn get_changed_files(&self, repo_root: &Path, current_files: &[PathBuf]) -> Vec<PathBuf> {
        let mut changed = Vec::new();
        for file_path in current_files {
            let Ok(rel) = file_path.strip_prefix(repo_root) else {
                changed.push(file_path.clone());
                continue;
            };
            let rel_path = posix_path(rel);

            let Some(tracked) = self.state.files.get(&rel_path) else {
                changed.push(file_path.clone());
                continue;
            };

            // Fast path: identical size and mtime means unchanged.
            if let Ok(metadata) = fs::metadata(file_path) {
                let mtime = mtime_ms_of(&metadata);
                if metadata.len() == tracked.file_size
                    && mtime.is_some()
                    && mtime == tracked.mtime_ms
                {
                    continue;
                }
            }

            match compute_file_hash(file_path) {
                Ok(hash) if hash == tracked.file_hash => {}
                // Unreadable counts as changed; the indexer will record
                // the skip reason when it fails again.
                _ => changed.push(file_path.clone()),
            }
        }
        changed
    }

    /// Tracked paths that are absent from `current_files`.
    pub fn get_deleted_files(&self, repo_root: &Path, current_files: &[PathBuf]) -> Vec<String> {
        let current: std::collections::BTreeSet<String> = current_files
            .iter()
            .filter_map(|p| p.strip_prefix(repo_root).ok())
            .map(posix_path)
            .collect();

        self.state
            .files
            .keys()
            .filter(|tracked| !current.contains(*tracked))
            .cloned()
            .collect()
    }

    /// All tracked relative paths.
    #[must_use]
    pub fn tracked_paths(&self) -> Vec<String> {
        self.state.files.keys().cloned().collect()
    }

    /// Number of tracked files.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.state.files.len()
    }

    /// Sum of tracked chunk counts.
    #[must_use]
    pub fn total_chunks(&self) -> usize {
        self.state.files.values().map(|f| f.chunk_count).sum()
    }

    /// Timestamp of the last save.
    #[must_use]
    pub fn last_updated(&self) -> &str {
        &self.state.last_updated
    }

    /// Persist the state atomically: temp file, fsync, rename.
    pub fn save(&mut self) -> Result<()> {
        fs::create_dir_all(&self.persist_dir)?;
        self.state.version = TRACKER_VERSION;
        self.state.last_updated = Utc::now().to_rfc3339();

        let payload = serde_json::to_string_pretty(&self.state)?;
        let temp_path = self.tracker_file.with_extension("json.tmp");
        {
            use std::io::Write;
            let mut temp = fs::File::create(&temp_path)?;
            temp.write_all(payload.as_bytes())?;
            temp.sync_all()?;
        }
        if let Err(e) = fs::rename(&temp_path, &self.tracker_file) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(())
    }

    /// Delete the manifest and clear in-memory state.
    pub fn reset(&mut self) -> Result<()> {
        self.state = TrackerState { version: TRACKER_VERSION, ..TrackerState::default() };
        if self.tracker_file.exists() {
            fs::remove_file(&self.tracker_file)?;
        }
        Ok(())
    }
}
