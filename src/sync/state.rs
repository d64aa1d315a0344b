//! Persistent per-pair sync state.
//!
//! Bidirectional change detection needs to know what each side looked like
//! after the last completed sync. That catalog lives in a JSON document
//! keyed by the sync pair, written atomically (temp sibling + rename) so a
//! crash mid-save never destroys the prior state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::SyncError;

/// Newest state-file layout this build understands.
pub const STATE_VERSION: u32 = 1;

/// Which side of the pair an observation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Source,
    Dest,
}

/// What happened to a path on one side since the last recorded sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Created,
    Modified,
    Deleted,
    None,
}

impl ChangeType {
    pub fn is_change(self) -> bool {
        !matches!(self, ChangeType::None)
    }
}

/// Last-known fingerprint of one path across both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileState {
    pub relative_path: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    pub exists_in_source: bool,
    pub exists_in_dest: bool,
    pub is_dir: bool,
}

/// Persisted catalog for one sync pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub version: u32,
    pub source_path: String,
    pub dest_path: String,
    pub last_sync_time: DateTime<Utc>,
    pub files: HashMap<String, FileState>,
}

impl SyncState {
    pub fn new(source_path: impl Into<String>, dest_path: impl Into<String>) -> Self {
        Self {
            version: STATE_VERSION,
            source_path: source_path.into(),
            dest_path: dest_path.into(),
            last_sync_time: Utc::now(),
            files: HashMap::new(),
        }
    }
}

/// 64-bit FNV-1a over the pair key; names the state file.
pub fn fnv1a64(input: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    let mut hash = OFFSET_BASIS;
    for byte in input.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn clean_path(path: &str) -> String {
    let cleaned = path.replace('\\', "/");
    let trimmed = cleaned.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Stable identity of an ordered sync pair.
pub fn pair_key(source: &str, dest: &str) -> String {
    format!("{}|{}", clean_path(source), clean_path(dest))
}

/// `<config_dir>/syncnorris/state/<hex>.json` for a pair.
pub fn default_state_path(source: &str, dest: &str) -> Result<PathBuf, SyncError> {
    let base = dirs::config_dir()
        .ok_or_else(|| SyncError::state(PathBuf::new(), "no user config directory"))?;
    Ok(state_path_under(&base.join("syncnorris"), source, dest))
}

/// State file location under an explicit base directory.
pub fn state_path_under(base: &Path, source: &str, dest: &str) -> PathBuf {
    let hash = fnv1a64(&pair_key(source, dest));
    base.join("state").join(format!("{hash:016x}.json"))
}

/// Handle on the state document for one pair.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    pub state: SyncState,
}

impl StateStore {
    /// Load the state for a pair from its default location; a missing file
    /// yields a fresh empty state.
    pub fn open(source: &str, dest: &str) -> Result<Self, SyncError> {
        let path = default_state_path(source, dest)?;
        Self::open_at(path, source, dest)
    }

    /// Fresh empty state that is never persisted; used for stateless runs.
    pub fn ephemeral(source: &str, dest: &str) -> Self {
        Self {
            path: PathBuf::new(),
            state: SyncState::new(clean_path(source), clean_path(dest)),
        }
    }

    /// Load from an explicit path. Parse failures and future versions are
    /// fatal: misreading history could silently destroy data.
    pub fn open_at(path: PathBuf, source: &str, dest: &str) -> Result<Self, SyncError> {
        let state = match std::fs::read(&path) {
            Ok(bytes) => {
                let state: SyncState = serde_json::from_slice(&bytes)
                    .map_err(|err| SyncError::state(&path, format!("parse failure: {err}")))?;
                if state.version > STATE_VERSION {
                    return Err(SyncError::state(
                        &path,
                        format!(
                            "state version {} is newer than supported {}",
                            state.version, STATE_VERSION
                        ),
                    ));
                }
                state
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                SyncState::new(clean_path(source), clean_path(dest))
            }
            Err(err) => return Err(SyncError::state(&path, err.to_string())),
        };

        Ok(Self { path, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist atomically: write a temp sibling, then rename over the target.
    pub fn save(&self) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| SyncError::state(&self.path, err.to_string()))?;
        }

        let body = serde_json::to_vec_pretty(&self.state)
            .map_err(|err| SyncError::state(&self.path, format!("encode failure: {err}")))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &body)
            .map_err(|err| SyncError::state(&tmp, err.to_string()))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|err| SyncError::state(&self.path, err.to_string()))?;
        Ok(())
    }

    /// Record the post-sync fingerprint of a path. An entry that exists on
    /// neither side is dropped.
    #[allow(clippy::too_many_arguments)]
    pub fn update_file(
        &mut self,
        path: &str,
        size: u64,
        mod_time: DateTime<Utc>,
        hash: Option<String>,
        exists_in_source: bool,
        exists_in_dest: bool,
        is_dir: bool,
    ) {
        if !exists_in_source && !exists_in_dest {
            self.state.files.remove(path);
            return;
        }
        self.state.files.insert(
            path.to_string(),
            FileState {
                relative_path: path.to_string(),
                size,
                mod_time,
                hash,
                exists_in_source,
                exists_in_dest,
                is_dir,
            },
        );
    }

    pub fn remove_file(&mut self, path: &str) {
        self.state.files.remove(path);
    }

    /// Classify what happened to `path` on `side` given the current
    /// observation. Modified means the size changed or the current mod-time
    /// is strictly later than the recorded one plus the tolerance second.
    pub fn detect_change(
        &self,
        path: &str,
        current_size: u64,
        current_mod_time: Option<DateTime<Utc>>,
        exists: bool,
        side: Side,
    ) -> ChangeType {
        let record = self.state.files.get(path);
        let existed = record
            .map(|r| match side {
                Side::Source => r.exists_in_source,
                Side::Dest => r.exists_in_dest,
            })
            .unwrap_or(false);

        match (existed, exists) {
            (false, true) => ChangeType::Created,
            (true, false) => ChangeType::Deleted,
            (false, false) => ChangeType::None,
            (true, true) => {
                let record = record.expect("existed implies record");
                if current_size != record.size {
                    return ChangeType::Modified;
                }
                match current_mod_time {
                    Some(now) if now > record.mod_time + Duration::seconds(1) => {
                        ChangeType::Modified
                    }
                    _ => ChangeType::None,
                }
            }
        }
    }

    pub fn mark_sync_complete(&mut self) {
        self.state.last_sync_time = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fnv1a64_known_vectors() {
        // Reference values for the 64-bit FNV-1a parameters.
        assert_eq!(fnv1a64(""), 0xcbf29ce484222325);
        assert_eq!(fnv1a64("a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a64("foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn pair_key_normalizes_trailing_slashes() {
        assert_eq!(pair_key("/src/", "/dst"), "/src|/dst");
        assert_eq!(pair_key("/src", "/dst/"), pair_key("/src/", "/dst"));
    }

    #[test]
    fn detect_change_classifies_all_cases() {
        let mut store = StateStore::ephemeral("/a", "/b");
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        store.update_file("f.txt", 10, t0, None, true, true, false);

        // Unknown path appearing.
        assert_eq!(
            store.detect_change("new.txt", 5, Some(t0), true, Side::Source),
            ChangeType::Created
        );
        // Known path gone.
        assert_eq!(
            store.detect_change("f.txt", 0, None, false, Side::Dest),
            ChangeType::Deleted
        );
        // Same size, same time.
        assert_eq!(
            store.detect_change("f.txt", 10, Some(t0), true, Side::Source),
            ChangeType::None
        );
        // Inside the one-second slack.
        assert_eq!(
            store.detect_change(
                "f.txt",
                10,
                Some(t0 + Duration::seconds(1)),
                true,
                Side::Source
            ),
            ChangeType::None
        );
        // Size change.
        assert_eq!(
            store.detect_change("f.txt", 11, Some(t0), true, Side::Source),
            ChangeType::Modified
        );
        // Later mod-time beyond the slack.
        assert_eq!(
            store.detect_change(
                "f.txt",
                10,
                Some(t0 + Duration::seconds(2)),
                true,
                Side::Dest
            ),
            ChangeType::Modified
        );
    }

    #[test]
    fn update_with_neither_side_removes_entry() {
        let mut store = StateStore::ephemeral("/a", "/b");
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        store.update_file("f.txt", 10, t0, None, true, true, false);
        assert!(store.state.files.contains_key("f.txt"));

        store.update_file("f.txt", 10, t0, None, false, false, false);
        assert!(!store.state.files.contains_key("f.txt"));
    }
}
