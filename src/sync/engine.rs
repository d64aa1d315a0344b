//! Sync engine: run orchestration for both modes.
//!
//! One-way runs delegate to the producer/consumer pipeline; bidirectional
//! runs scan both sides in parallel, analyze against the persisted state,
//! resolve conflicts under the configured policy, and execute the plan
//! sequentially in a deterministic order.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{SyncMode, SyncOptions};
use crate::error::SyncError;
use crate::fs::backend::{ByteStream, FileRecord, StorageBackend, WriteMetadata};
use crate::sync::analyze::{analyze, sort_actions, ActionKind, Direction, SyncAction};
use crate::sync::conflict::ConflictResolver;
use crate::sync::exclude::ExcludeMatcher;
use crate::sync::pipeline::OneWayPipeline;
use crate::sync::progress::{NullSink, ProgressEvent, ProgressReader, ProgressSink};
use crate::sync::report::{
    Collector, DiffReason, EntryInfo, FileDifference, FileOperation, RunStatus, SyncReport,
    TaskResult,
};
use crate::sync::state::{default_state_path, state_path_under, Side, StateStore};
use crate::sync::throttle::RateLimiter;

/// Emit a scan progress update every this many records.
const SCAN_PROGRESS_EVERY: usize = 200;

/// Orchestrates one run over a pair of backends.
pub struct SyncEngine {
    source: Arc<dyn StorageBackend>,
    dest: Arc<dyn StorageBackend>,
    options: SyncOptions,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl SyncEngine {
    /// Validate options and build an engine. Path and option problems are
    /// rejected here, before anything touches storage.
    pub fn new(
        source: Arc<dyn StorageBackend>,
        dest: Arc<dyn StorageBackend>,
        options: SyncOptions,
    ) -> Result<Self, SyncError> {
        options.validate()?;
        if source.describe().is_empty() {
            return Err(SyncError::validation("source", "source path is required"));
        }
        if dest.describe().is_empty() {
            return Err(SyncError::validation("destination", "destination path is required"));
        }

        Ok(Self {
            source,
            dest,
            options,
            sink: Arc::new(NullSink),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the sync and hand back the report. Only validation, scan, and
    /// state-load failures are fatal; per-file errors land in the report.
    pub async fn run(&self) -> Result<SyncReport, SyncError> {
        let started_at = chrono::Utc::now();
        let exclude = ExcludeMatcher::new(&self.options.exclude_patterns)?;
        let limiter = (self.options.bandwidth_limit > 0)
            .then(|| Arc::new(RateLimiter::new(self.options.bandwidth_limit)));
        let collector = Arc::new(Collector::new());

        info!(
            source = %self.source.describe(),
            dest = %self.dest.describe(),
            mode = ?self.options.mode,
            dry_run = self.options.dry_run,
            "starting sync"
        );

        match self.options.mode {
            SyncMode::OneWay => {
                let pipeline = OneWayPipeline {
                    source: Arc::clone(&self.source),
                    dest: Arc::clone(&self.dest),
                    options: self.options.clone(),
                    exclude,
                    limiter,
                    collector: Arc::clone(&collector),
                    sink: Arc::clone(&self.sink),
                    cancel: self.cancel.clone(),
                };
                let tasks = pipeline.run().await?;
                for task in &tasks {
                    collector.push_operation(FileOperation::from(task));
                }
            }
            SyncMode::Bidirectional => {
                self.run_bidirectional(&exclude, limiter, &collector).await?;
            }
        }

        let status = self.final_status(&collector);
        let report = collector.finish(
            self.source.describe(),
            self.dest.describe(),
            self.options.mode,
            self.options.dry_run,
            started_at,
            status,
        );
        info!(status = ?report.status, "sync finished");
        Ok(report)
    }

    fn final_status(&self, collector: &Collector) -> RunStatus {
        if self.cancel.is_cancelled() {
            return RunStatus::Cancelled;
        }
        let stats = &collector.stats;
        let errored = stats.files_errored.load(Ordering::Relaxed);
        if errored == 0 {
            return RunStatus::Success;
        }
        let succeeded = stats.files_copied.load(Ordering::Relaxed)
            + stats.files_updated.load(Ordering::Relaxed)
            + stats.files_synchronized.load(Ordering::Relaxed)
            + stats.files_skipped.load(Ordering::Relaxed)
            + stats.files_deleted.load(Ordering::Relaxed);
        if succeeded > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Failed
        }
    }

    async fn run_bidirectional(
        &self,
        exclude: &ExcludeMatcher,
        limiter: Option<Arc<RateLimiter>>,
        collector: &Arc<Collector>,
    ) -> Result<(), SyncError> {
        let source_root = self.source.describe();
        let dest_root = self.dest.describe();

        // Unreadable state is fatal: guessing at history risks data loss.
        let mut state = if self.options.stateful {
            let path = match &self.options.state_dir {
                Some(dir) => state_path_under(dir, &source_root, &dest_root),
                None => default_state_path(&source_root, &dest_root)?,
            };
            StateStore::open_at(path, &source_root, &dest_root)?
        } else {
            StateStore::ephemeral(&source_root, &dest_root)
        };

        // Scan both sides in parallel.
        let src_scan = tokio::spawn(scan_side(
            Arc::clone(&self.source),
            exclude.clone(),
            Arc::clone(&self.sink),
            Side::Source,
            self.cancel.clone(),
        ));
        let dst_scan = tokio::spawn(scan_side(
            Arc::clone(&self.dest),
            exclude.clone(),
            Arc::clone(&self.sink),
            Side::Dest,
            self.cancel.clone(),
        ));
        let (src_result, dst_result) = tokio::join!(src_scan, dst_scan);
        let (source_map, src_excluded) = src_result.map_err(|err| SyncError::Io {
            path: source_root.clone(),
            operation: "scan source",
            source: std::io::Error::other(err),
        })??;
        let (dest_map, dst_excluded) = dst_result.map_err(|err| SyncError::Io {
            path: dest_root.clone(),
            operation: "scan destination",
            source: std::io::Error::other(err),
        })??;

        if self.cancel.is_cancelled() {
            return Ok(());
        }

        // Every distinct file observed on either side counts as scanned;
        // excluded paths count once under skipped.
        let stats = &collector.stats;
        for record in source_map.values() {
            if !record.is_dir {
                stats.files_scanned.fetch_add(1, Ordering::Relaxed);
                stats.bytes_scanned.fetch_add(record.size, Ordering::Relaxed);
            }
        }
        for (path, record) in &dest_map {
            if !record.is_dir && !source_map.contains_key(path) {
                stats.files_scanned.fetch_add(1, Ordering::Relaxed);
                stats.bytes_scanned.fetch_add(record.size, Ordering::Relaxed);
            }
        }
        let excluded: std::collections::HashSet<String> =
            src_excluded.into_iter().chain(dst_excluded).collect();
        stats
            .files_skipped
            .fetch_add(excluded.len() as u64, Ordering::Relaxed);

        let mut analysis = analyze(&source_map, &dest_map, &state);
        info!(
            actions = analysis.actions.len(),
            conflicts = analysis.conflicts.len(),
            skips = analysis.skips.len(),
            "analysis complete"
        );

        for skip in &analysis.skips {
            stats.files_skipped.fetch_add(1, Ordering::Relaxed);
            state.update_file(
                &skip.path,
                skip.size,
                skip.mod_time.unwrap_or_else(chrono::Utc::now),
                None,
                true,
                true,
                false,
            );
        }

        // Resolve conflicts into extra actions.
        let resolver = ConflictResolver::new(self.options.conflict_policy);
        let mut actions = std::mem::take(&mut analysis.actions);
        for mut conflict in std::mem::take(&mut analysis.conflicts) {
            let resolved = resolver.resolve(&mut conflict);
            if !conflict.is_resolved() {
                // Ask policy without a driver: reported, not acted on.
                stats.files_skipped.fetch_add(1, Ordering::Relaxed);
            }
            actions.extend(resolved);
            collector.push_conflict(conflict);
        }

        sort_actions(&mut actions);

        for action in &actions {
            if self.cancel.is_cancelled() {
                break;
            }
            self.execute_action(action, &source_map, &dest_map, &mut state, limiter.as_ref(), collector)
                .await;
        }

        for path in &analysis.state_removals {
            state.remove_file(path);
        }

        if !self.options.dry_run && self.options.stateful && !self.cancel.is_cancelled() {
            state.mark_sync_complete();
            if let Err(err) = state.save() {
                // Deliberately non-fatal; the sync itself succeeded.
                warn!(error = %err, "failed to save sync state");
            }
        }

        Ok(())
    }

    /// Execute one planned action; failures are captured per-file.
    async fn execute_action(
        &self,
        action: &SyncAction,
        source_map: &HashMap<String, FileRecord>,
        dest_map: &HashMap<String, FileRecord>,
        state: &mut StateStore,
        limiter: Option<&Arc<RateLimiter>>,
        collector: &Arc<Collector>,
    ) {
        let stats = &collector.stats;
        let (from_backend, to_backend) = match action.direction {
            Direction::SourceToDest => (&self.source, &self.dest),
            Direction::DestToSource => (&self.dest, &self.source),
        };
        let (from_map, to_map) = match action.direction {
            Direction::SourceToDest => (source_map, dest_map),
            Direction::DestToSource => (dest_map, source_map),
        };

        match action.kind {
            ActionKind::Mkdir => {
                if self.options.dry_run {
                    stats.dirs_created.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                match to_backend.mkdir_all(&action.path).await {
                    Ok(()) => {
                        stats.dirs_created.fetch_add(1, Ordering::Relaxed);
                        state.update_file(
                            &action.path,
                            0,
                            chrono::Utc::now(),
                            None,
                            true,
                            true,
                            true,
                        );
                    }
                    Err(err) => {
                        stats.files_errored.fetch_add(1, Ordering::Relaxed);
                        collector.push_error(&action.path, "mkdir", format!("{err:#}"));
                    }
                }
            }
            ActionKind::Delete => {
                if self.options.dry_run {
                    stats.files_deleted.fetch_add(1, Ordering::Relaxed);
                    collector.push_difference(FileDifference {
                        relative_path: action.path.clone(),
                        reason: DiffReason::Deleted,
                        details: Some("would delete".into()),
                        source_info: None,
                        dest_info: None,
                    });
                    return;
                }
                match to_backend.delete(&action.path).await {
                    Ok(()) => {
                        stats.files_deleted.fetch_add(1, Ordering::Relaxed);
                        state.remove_file(&action.path);
                        collector.push_difference(FileDifference {
                            relative_path: action.path.clone(),
                            reason: DiffReason::Deleted,
                            details: None,
                            source_info: None,
                            dest_info: None,
                        });
                    }
                    Err(err) => {
                        stats.files_errored.fetch_add(1, Ordering::Relaxed);
                        collector.push_error(&action.path, "delete", format!("{err:#}"));
                    }
                }
            }
            ActionKind::Copy => {
                self.execute_copy(
                    action,
                    from_backend,
                    to_backend,
                    from_map,
                    to_map,
                    state,
                    limiter,
                    collector,
                )
                .await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_copy(
        &self,
        action: &SyncAction,
        from_backend: &Arc<dyn StorageBackend>,
        to_backend: &Arc<dyn StorageBackend>,
        from_map: &HashMap<String, FileRecord>,
        to_map: &HashMap<String, FileRecord>,
        state: &mut StateStore,
        limiter: Option<&Arc<RateLimiter>>,
        collector: &Arc<Collector>,
    ) {
        let stats = &collector.stats;
        let target = action.target.as_deref().unwrap_or(&action.path);
        let pre_existed = to_map.contains_key(target);
        let started = Instant::now();

        if self.options.dry_run {
            stats.files_copied.fetch_add(1, Ordering::Relaxed);
            if pre_existed {
                stats.files_copied.fetch_sub(1, Ordering::Relaxed);
                stats.files_updated.fetch_add(1, Ordering::Relaxed);
            }
            collector.push_difference(FileDifference {
                relative_path: action.path.clone(),
                reason: match action.direction {
                    Direction::SourceToDest => DiffReason::OnlyInSource,
                    Direction::DestToSource => DiffReason::OnlyInDest,
                },
                details: Some("would copy".into()),
                source_info: from_map.get(&action.path).map(EntryInfo::from),
                dest_info: to_map.get(target).map(EntryInfo::from),
            });
            return;
        }

        let Some(record) = from_map.get(&action.path) else {
            stats.files_errored.fetch_add(1, Ordering::Relaxed);
            collector.push_error(&action.path, "copy", "file vanished between scan and transfer");
            return;
        };

        self.sink.update(ProgressEvent::FileStart {
            path: action.path.clone(),
            size: record.size,
            index: 0,
        });

        let stream = match from_backend.read(&action.path).await {
            Ok(stream) => stream,
            Err(err) => {
                self.copy_failed(action, pre_existed, format!("{err:#}"), collector);
                return;
            }
        };

        let mut reader: ByteStream = stream;
        if let Some(limiter) = limiter {
            reader = Box::new(limiter.wrap(reader, self.cancel.clone()));
        }
        let reader: ByteStream = Box::new(ProgressReader::new(
            reader,
            action.path.clone(),
            record.size,
            Arc::clone(&self.sink),
        ));

        let meta = WriteMetadata::from(record);
        match to_backend.write(target, reader, record.size, &meta).await {
            Ok(()) => {
                // Count the transfer as a copy, then correct to an update
                // when the target already existed.
                stats.files_copied.fetch_add(1, Ordering::Relaxed);
                let result = if pre_existed {
                    stats.files_copied.fetch_sub(1, Ordering::Relaxed);
                    stats.files_updated.fetch_add(1, Ordering::Relaxed);
                    TaskResult::Updated
                } else {
                    TaskResult::Copied
                };
                stats.bytes_transferred.fetch_add(record.size, Ordering::Relaxed);
                stats.record_speed(record.size, started.elapsed());

                let (in_source, in_dest) = if action.target.is_none() {
                    (true, true)
                } else {
                    match action.direction {
                        Direction::SourceToDest => (false, true),
                        Direction::DestToSource => (true, false),
                    }
                };
                state.update_file(
                    target,
                    record.size,
                    record.modified.unwrap_or_else(chrono::Utc::now),
                    record.hash.clone(),
                    in_source,
                    in_dest,
                    false,
                );

                collector.push_operation(FileOperation {
                    relative_path: target.to_string(),
                    result,
                    bytes: record.size,
                    duration_ms: started.elapsed().as_millis() as u64,
                    worker_id: 0,
                    error: None,
                });
                self.sink.update(ProgressEvent::FileComplete {
                    path: action.path.clone(),
                    result,
                    bytes: record.size,
                });
            }
            Err(err) => {
                self.copy_failed(action, pre_existed, format!("{err:#}"), collector);
            }
        }
    }

    fn copy_failed(
        &self,
        action: &SyncAction,
        pre_existed: bool,
        message: String,
        collector: &Arc<Collector>,
    ) {
        let stats = &collector.stats;
        stats.files_errored.fetch_add(1, Ordering::Relaxed);
        let action_name = if pre_existed { "update" } else { "copy" };
        collector.push_error(&action.path, action_name, message.clone());
        collector.push_difference(FileDifference {
            relative_path: action.path.clone(),
            reason: if pre_existed {
                DiffReason::UpdateError
            } else {
                DiffReason::CopyError
            },
            details: Some(message.clone()),
            source_info: None,
            dest_info: None,
        });
        self.sink.update(ProgressEvent::FileError {
            path: action.path.clone(),
            message,
        });
    }
}

/// Scan one side into a path map, applying exclusions as we go. Returns
/// the map plus the excluded file paths for skip accounting.
async fn scan_side(
    backend: Arc<dyn StorageBackend>,
    exclude: ExcludeMatcher,
    sink: Arc<dyn ProgressSink>,
    side: Side,
    cancel: CancellationToken,
) -> Result<(HashMap<String, FileRecord>, Vec<String>), SyncError> {
    let records = backend.list("").await.map_err(|err| SyncError::Io {
        path: backend.describe(),
        operation: "scan",
        source: std::io::Error::other(err),
    })?;

    let mut map = HashMap::new();
    let mut excluded = Vec::new();
    let mut files = 0u64;
    let mut bytes = 0u64;

    for (count, record) in records.into_iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        if record.relative_path.is_empty() {
            continue;
        }
        if exclude.is_excluded(&record.relative_path) {
            if !record.is_dir {
                excluded.push(record.relative_path);
            }
            continue;
        }
        if !record.is_dir {
            files += 1;
            bytes += record.size;
        }
        map.insert(record.relative_path.clone(), record);

        if (count + 1) % SCAN_PROGRESS_EVERY == 0 {
            sink.update(ProgressEvent::ScanProgress { side, files, bytes });
        }
    }

    sink.update(ProgressEvent::ScanProgress { side, files, bytes });
    Ok((map, excluded))
}
