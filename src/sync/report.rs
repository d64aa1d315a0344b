//! In-flight task descriptors, run statistics, and the final sync report.
//!
//! Counters are plain atomics so workers update them without locks; the
//! variable-length accumulators (operations, errors, differences,
//! conflicts) sit behind short-held mutexes.

use chrono::{DateTime, Utc};
use humansize::{format_size, BINARY};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::SyncMode;
use crate::fs::backend::FileRecord;
use crate::sync::compare::DifferenceReason;
use crate::sync::conflict::Conflict;

/// Lifecycle of a file task; terminal exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Errored,
}

/// Terminal outcome of processing one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResult {
    Copied,
    Updated,
    Synchronized,
    Skipped,
    Failed,
}

/// One file moving through the one-way pipeline. Created by the producer,
/// mutated by exactly one worker.
#[derive(Debug, Clone)]
pub struct FileTask {
    pub relative_path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub result: Option<TaskResult>,
    pub bytes_transferred: u64,
    pub duration: Duration,
    pub worker_id: usize,
    pub error: Option<String>,
    /// Comparator verdict detail, kept for difference reporting.
    pub difference: Option<DifferenceReason>,
    pub record: FileRecord,
}

impl FileTask {
    pub fn new(record: FileRecord) -> Self {
        Self {
            relative_path: record.relative_path.clone(),
            size: record.size,
            modified: record.modified,
            status: TaskStatus::Pending,
            result: None,
            bytes_transferred: 0,
            duration: Duration::ZERO,
            worker_id: 0,
            error: None,
            difference: None,
            record,
        }
    }
}

/// Lock-free counters shared by every worker in a run. Counters only go up;
/// the single exception is the bidirectional copy-to-update correction.
#[derive(Debug, Default)]
pub struct Statistics {
    pub files_scanned: AtomicU64,
    pub files_copied: AtomicU64,
    pub files_updated: AtomicU64,
    pub files_deleted: AtomicU64,
    pub files_synchronized: AtomicU64,
    pub files_skipped: AtomicU64,
    pub files_errored: AtomicU64,
    pub dirs_created: AtomicU64,
    pub dirs_deleted: AtomicU64,
    pub bytes_scanned: AtomicU64,
    pub bytes_transferred: AtomicU64,
    /// Peak per-file transfer speed observed, bytes per second.
    pub peak_speed: AtomicU64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a completed transfer into the peak-speed watermark.
    pub fn record_speed(&self, bytes: u64, duration: Duration) {
        let secs = duration.as_secs_f64();
        if secs <= 0.0 || bytes == 0 {
            return;
        }
        let speed = (bytes as f64 / secs) as u64;
        self.peak_speed.fetch_max(speed, Ordering::Relaxed);
    }

    pub fn snapshot(&self, wall_time: Duration) -> StatsSnapshot {
        let bytes_transferred = self.bytes_transferred.load(Ordering::Relaxed);
        let secs = wall_time.as_secs_f64();
        let average_speed = if secs > 0.0 {
            (bytes_transferred as f64 / secs) as u64
        } else {
            0
        };

        StatsSnapshot {
            files_scanned: self.files_scanned.load(Ordering::Relaxed),
            files_copied: self.files_copied.load(Ordering::Relaxed),
            files_updated: self.files_updated.load(Ordering::Relaxed),
            files_deleted: self.files_deleted.load(Ordering::Relaxed),
            files_synchronized: self.files_synchronized.load(Ordering::Relaxed),
            files_skipped: self.files_skipped.load(Ordering::Relaxed),
            files_errored: self.files_errored.load(Ordering::Relaxed),
            dirs_created: self.dirs_created.load(Ordering::Relaxed),
            dirs_deleted: self.dirs_deleted.load(Ordering::Relaxed),
            bytes_scanned: self.bytes_scanned.load(Ordering::Relaxed),
            bytes_transferred,
            average_speed,
            peak_speed: self.peak_speed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters, as it lands in the report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub files_scanned: u64,
    pub files_copied: u64,
    pub files_updated: u64,
    pub files_deleted: u64,
    pub files_synchronized: u64,
    pub files_skipped: u64,
    pub files_errored: u64,
    pub dirs_created: u64,
    pub dirs_deleted: u64,
    pub bytes_scanned: u64,
    pub bytes_transferred: u64,
    pub average_speed: u64,
    pub peak_speed: u64,
}

/// Final disposition of a run; doubles as the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Partial => 1,
            RunStatus::Failed => 2,
            RunStatus::Cancelled => 3,
        }
    }
}

/// One executed (or projected) operation in the report.
#[derive(Debug, Clone, Serialize)]
pub struct FileOperation {
    pub relative_path: String,
    pub result: TaskResult,
    pub bytes: u64,
    pub duration_ms: u64,
    pub worker_id: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&FileTask> for FileOperation {
    fn from(task: &FileTask) -> Self {
        Self {
            relative_path: task.relative_path.clone(),
            result: task.result.unwrap_or(TaskResult::Failed),
            bytes: task.bytes_transferred,
            duration_ms: task.duration.as_millis() as u64,
            worker_id: task.worker_id,
            error: task.error.clone(),
        }
    }
}

/// A captured per-file failure.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub path: String,
    pub action: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Compact side info attached to differences and conflicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub size: u64,
    pub mod_time: Option<DateTime<Utc>>,
    pub is_dir: bool,
}

impl From<&FileRecord> for EntryInfo {
    fn from(record: &FileRecord) -> Self {
        Self {
            size: record.size,
            mod_time: record.modified,
            is_dir: record.is_dir,
        }
    }
}

/// Machine-readable reason tags for the differences list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffReason {
    CopyError,
    UpdateError,
    Deleted,
    OnlyInSource,
    OnlyInDest,
    HashDifferent,
    ContentDifferent,
    SizeDifferent,
    Skipped,
}

impl From<DifferenceReason> for DiffReason {
    fn from(reason: DifferenceReason) -> Self {
        match reason {
            DifferenceReason::Size => DiffReason::SizeDifferent,
            DifferenceReason::Hash => DiffReason::HashDifferent,
            DifferenceReason::Content | DifferenceReason::ModTime => DiffReason::ContentDifferent,
            DifferenceReason::Missing => DiffReason::OnlyInSource,
        }
    }
}

/// One observed difference between the trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDifference {
    pub relative_path: String,
    pub reason: DiffReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_info: Option<EntryInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_info: Option<EntryInfo>,
}

/// Shared accumulation point for everything a run produces.
///
/// Counter updates are lock-free; list appends take a short mutex.
#[derive(Debug, Default)]
pub struct Collector {
    pub stats: Statistics,
    operations: Mutex<Vec<FileOperation>>,
    errors: Mutex<Vec<ErrorEntry>>,
    differences: Mutex<Vec<FileDifference>>,
    conflicts: Mutex<Vec<Conflict>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_operation(&self, op: FileOperation) {
        self.operations.lock().expect("collector poisoned").push(op);
    }

    pub fn push_error(&self, path: &str, action: &str, message: impl Into<String>) {
        self.errors.lock().expect("collector poisoned").push(ErrorEntry {
            path: path.to_string(),
            action: action.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn push_difference(&self, diff: FileDifference) {
        self.differences
            .lock()
            .expect("collector poisoned")
            .push(diff);
    }

    pub fn push_conflict(&self, conflict: Conflict) {
        self.conflicts
            .lock()
            .expect("collector poisoned")
            .push(conflict);
    }

    fn drain<T>(slot: &Mutex<Vec<T>>) -> Vec<T> {
        std::mem::take(&mut *slot.lock().expect("collector poisoned"))
    }

    /// Seal the run into a report. Consumes the accumulated lists.
    pub fn finish(
        &self,
        source_path: String,
        dest_path: String,
        mode: SyncMode,
        dry_run: bool,
        started_at: DateTime<Utc>,
        status: RunStatus,
    ) -> SyncReport {
        let finished_at = Utc::now();
        let wall = (finished_at - started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);

        SyncReport {
            operation_id: uuid::Uuid::new_v4().to_string(),
            source_path,
            dest_path,
            mode,
            dry_run,
            started_at,
            finished_at,
            duration_ms: wall.as_millis() as u64,
            stats: self.stats.snapshot(wall),
            operations: Self::drain(&self.operations),
            conflicts: Self::drain(&self.conflicts),
            errors: Self::drain(&self.errors),
            differences: Self::drain(&self.differences),
            status,
        }
    }
}

/// Everything a run produced, handed to the caller on return.
#[derive(Debug, Serialize)]
pub struct SyncReport {
    pub operation_id: String,
    pub source_path: String,
    pub dest_path: String,
    pub mode: SyncMode,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub stats: StatsSnapshot,
    pub operations: Vec<FileOperation>,
    pub conflicts: Vec<Conflict>,
    pub errors: Vec<ErrorEntry>,
    pub differences: Vec<FileDifference>,
    pub status: RunStatus,
}

impl SyncReport {
    /// Human summary block for terminal output.
    pub fn summary(&self) -> String {
        let s = &self.stats;
        let mut out = String::new();
        out.push_str(&format!(
            "{:?} sync {} -> {} finished: {:?}{}\n",
            self.mode,
            self.source_path,
            self.dest_path,
            self.status,
            if self.dry_run { " (dry run)" } else { "" },
        ));
        out.push_str(&format!(
            "  scanned {} files ({}), copied {}, updated {}, in sync {}, skipped {}, deleted {}, errors {}\n",
            s.files_scanned,
            format_size(s.bytes_scanned, BINARY),
            s.files_copied,
            s.files_updated,
            s.files_synchronized,
            s.files_skipped,
            s.files_deleted,
            s.files_errored,
        ));
        out.push_str(&format!(
            "  transferred {} in {:.1}s (avg {}/s, peak {}/s)\n",
            format_size(s.bytes_transferred, BINARY),
            self.duration_ms as f64 / 1000.0,
            format_size(s.average_speed, BINARY),
            format_size(s.peak_speed, BINARY),
        ));
        if !self.conflicts.is_empty() {
            out.push_str(&format!("  conflicts: {}\n", self.conflicts.len()));
        }
        out
    }
}

/// Standalone differences document for external writers.
#[derive(Debug, Serialize, Deserialize)]
pub struct DifferencesReport {
    pub generated: DateTime<Utc>,
    pub source_path: String,
    pub dest_path: String,
    pub mode: SyncMode,
    pub dry_run: bool,
    pub total_count: usize,
    pub conflict_count: usize,
    pub differences: Vec<FileDifference>,
    pub conflicts: Vec<Conflict>,
}

impl DifferencesReport {
    pub fn from_report(report: &SyncReport) -> Self {
        Self {
            generated: Utc::now(),
            source_path: report.source_path.clone(),
            dest_path: report.dest_path.clone(),
            mode: report.mode,
            dry_run: report.dry_run,
            total_count: report.differences.len(),
            conflict_count: report.conflicts.len(),
            differences: report.differences.clone(),
            conflicts: report.conflicts.clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Plain-text rendering for terminals.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Differences for {} -> {} ({} total, {} conflicts)\n",
            self.source_path, self.dest_path, self.total_count, self.conflict_count
        ));

        for diff in &self.differences {
            out.push_str(&format!(
                "  {:<18} {}",
                format!("[{}]", reason_tag(diff.reason)),
                diff.relative_path
            ));
            if let Some(details) = &diff.details {
                out.push_str(&format!("  ({details})"));
            }
            out.push('\n');
        }

        for conflict in &self.conflicts {
            out.push_str(&format!(
                "  [conflict]         {} ({:?})\n",
                conflict.path, conflict.kind
            ));
        }
        out
    }
}

fn reason_tag(reason: DiffReason) -> &'static str {
    match reason {
        DiffReason::CopyError => "copy_error",
        DiffReason::UpdateError => "update_error",
        DiffReason::Deleted => "deleted",
        DiffReason::OnlyInSource => "only_in_source",
        DiffReason::OnlyInDest => "only_in_dest",
        DiffReason::HashDifferent => "hash_different",
        DiffReason::ContentDifferent => "content_different",
        DiffReason::SizeDifferent => "size_different",
        DiffReason::Skipped => "skipped",
    }
}
