//! One-way producer/consumer pipeline.
//!
//! The destination is scanned up front into an index, then a scanner task
//! feeds file tasks into a bounded queue drained by N workers. Each worker
//! compares against the destination index and copies or updates through the
//! progress and bandwidth wrappers. Orphan cleanup runs after the workers
//! drain.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SyncOptions;
use crate::error::SyncError;
use crate::fs::backend::{ByteStream, FileRecord, StorageBackend, WriteMetadata};
use crate::sync::compare::{Comparator, Verdict};
use crate::sync::exclude::ExcludeMatcher;
use crate::sync::progress::{ProgressEvent, ProgressReader, ProgressSink};
use crate::sync::report::{
    Collector, DiffReason, EntryInfo, FileDifference, FileTask, TaskResult, TaskStatus,
};
use crate::sync::state::Side;
use crate::sync::throttle::RateLimiter;

/// Emit a scan progress update every this many records.
const SCAN_PROGRESS_EVERY: u64 = 100;

/// Destination tree snapshot taken before the workers start. Read-mostly
/// afterwards; orphan cleanup is the only later reader.
#[derive(Debug, Default)]
struct DestIndex {
    files: HashMap<String, FileRecord>,
    dirs: HashSet<String>,
}

/// One one-way run over a pair of backends.
pub(crate) struct OneWayPipeline {
    pub source: Arc<dyn StorageBackend>,
    pub dest: Arc<dyn StorageBackend>,
    pub options: SyncOptions,
    pub exclude: ExcludeMatcher,
    pub limiter: Option<Arc<RateLimiter>>,
    pub collector: Arc<Collector>,
    pub sink: Arc<dyn ProgressSink>,
    pub cancel: CancellationToken,
}

impl OneWayPipeline {
    /// Run scan, transfer, and orphan cleanup; returns every processed task.
    /// Only scan-phase failures are fatal.
    pub async fn run(&self) -> Result<Vec<FileTask>, SyncError> {
        let dest_records = self.dest.list("").await.map_err(|err| SyncError::Io {
            path: self.dest.describe(),
            operation: "scan destination",
            source: std::io::Error::other(err),
        })?;

        let mut index = DestIndex::default();
        for record in dest_records {
            if record.relative_path.is_empty() {
                continue;
            }
            if record.is_dir {
                index.dirs.insert(record.relative_path);
            } else {
                index.files.insert(record.relative_path.clone(), record);
            }
        }
        let index = Arc::new(RwLock::new(index));

        let (tx, rx) = mpsc::channel::<FileTask>(self.options.effective_queue_size());
        let rx = Arc::new(Mutex::new(rx));
        let sequence = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for worker_id in 0..self.options.effective_workers() {
            let worker = Worker {
                id: worker_id,
                source: Arc::clone(&self.source),
                dest: Arc::clone(&self.dest),
                index: Arc::clone(&index),
                comparator: Comparator::new(self.options.comparison, self.options.buffer_size)
                    .with_limiter(self.limiter.clone())
                    .with_progress({
                        let sink = Arc::clone(&self.sink);
                        Arc::new(move |path: &str, done, total| {
                            sink.update(ProgressEvent::FileProgress {
                                path: path.to_string(),
                                bytes_done: done,
                                total,
                            });
                        })
                    }),
                limiter: self.limiter.clone(),
                collector: Arc::clone(&self.collector),
                sink: Arc::clone(&self.sink),
                cancel: self.cancel.clone(),
                dry_run: self.options.dry_run,
                sequence: Arc::clone(&sequence),
            };
            let rx = Arc::clone(&rx);
            handles.push(tokio::spawn(worker.run(rx)));
        }

        let (source_files, source_dirs) = self.scan_and_feed(tx).await?;

        let mut tasks = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(mut worker_tasks) => tasks.append(&mut worker_tasks),
                Err(err) => warn!(error = %err, "worker task panicked"),
            }
        }

        if self.options.delete_orphans && !self.cancel.is_cancelled() {
            self.delete_orphans(&source_files, &source_dirs, &index).await;
        }

        Ok(tasks)
    }

    /// Scan the source and feed the task queue. Returns the sets of source
    /// files and directories for orphan cleanup.
    async fn scan_and_feed(
        &self,
        tx: mpsc::Sender<FileTask>,
    ) -> Result<(HashSet<String>, HashSet<String>), SyncError> {
        let records = self.source.list("").await.map_err(|err| SyncError::Io {
            path: self.source.describe(),
            operation: "scan source",
            source: std::io::Error::other(err),
        })?;

        let stats = &self.collector.stats;
        let mut source_files = HashSet::new();
        let mut source_dirs = HashSet::new();
        let mut seen = 0u64;

        for record in records {
            if self.cancel.is_cancelled() {
                break;
            }
            if record.relative_path.is_empty() {
                continue;
            }
            if record.is_dir {
                source_dirs.insert(record.relative_path);
                continue;
            }

            stats.files_scanned.fetch_add(1, Ordering::Relaxed);
            stats.bytes_scanned.fetch_add(record.size, Ordering::Relaxed);
            seen += 1;
            if seen % SCAN_PROGRESS_EVERY == 0 {
                self.sink.update(ProgressEvent::ScanProgress {
                    side: Side::Source,
                    files: stats.files_scanned.load(Ordering::Relaxed),
                    bytes: stats.bytes_scanned.load(Ordering::Relaxed),
                });
            }

            if self.exclude.is_excluded(&record.relative_path) {
                stats.files_skipped.fetch_add(1, Ordering::Relaxed);
                self.collector.push_difference(FileDifference {
                    relative_path: record.relative_path.clone(),
                    reason: DiffReason::Skipped,
                    details: Some("excluded by pattern".into()),
                    source_info: Some(EntryInfo::from(&record)),
                    dest_info: None,
                });
                continue;
            }

            source_files.insert(record.relative_path.clone());
            if tx.send(FileTask::new(record)).await.is_err() {
                // Every worker is gone; nothing left to feed.
                break;
            }
        }

        Ok((source_files, source_dirs))
    }

    /// Remove destination entries with no source counterpart: files first,
    /// then directories deepest-first so children empty out their parents.
    async fn delete_orphans(
        &self,
        source_files: &HashSet<String>,
        source_dirs: &HashSet<String>,
        index: &Arc<RwLock<DestIndex>>,
    ) {
        let stats = &self.collector.stats;
        let (orphan_files, mut orphan_dirs) = {
            let index = index.read().expect("dest index poisoned");
            let mut files: Vec<(String, FileRecord)> = index
                .files
                .iter()
                .filter(|(path, _)| {
                    !source_files.contains(*path) && !self.exclude.is_excluded(path)
                })
                .map(|(path, record)| (path.clone(), record.clone()))
                .collect();
            files.sort_by(|a, b| a.0.cmp(&b.0));

            let dirs: Vec<String> = index
                .dirs
                .iter()
                .filter(|path| !source_dirs.contains(*path) && !self.exclude.is_excluded(path))
                .cloned()
                .collect();
            (files, dirs)
        };

        for (path, record) in orphan_files {
            if self.cancel.is_cancelled() {
                return;
            }
            if self.options.dry_run {
                stats.files_deleted.fetch_add(1, Ordering::Relaxed);
                self.collector.push_difference(orphan_difference(&path, Some(&record), "would delete orphan"));
                continue;
            }
            match self.dest.delete(&path).await {
                Ok(()) => {
                    stats.files_deleted.fetch_add(1, Ordering::Relaxed);
                    self.collector.push_difference(orphan_difference(&path, Some(&record), "orphan deleted"));
                }
                Err(err) => {
                    stats.files_errored.fetch_add(1, Ordering::Relaxed);
                    self.collector.push_error(&path, "delete", format!("{err:#}"));
                }
            }
        }

        // Deepest first: a directory can only empty out after its children.
        orphan_dirs.sort_by(|a, b| {
            let depth = |p: &str| p.matches('/').count();
            depth(b).cmp(&depth(a)).then_with(|| b.cmp(a))
        });

        for path in orphan_dirs {
            if self.cancel.is_cancelled() {
                return;
            }
            if self.options.dry_run {
                stats.dirs_deleted.fetch_add(1, Ordering::Relaxed);
                self.collector.push_difference(orphan_difference(&path, None, "would delete orphan directory"));
                continue;
            }
            match self.dest.delete(&path).await {
                Ok(()) => {
                    stats.dirs_deleted.fetch_add(1, Ordering::Relaxed);
                    self.collector.push_difference(orphan_difference(&path, None, "orphan directory deleted"));
                }
                Err(err) => {
                    // Tolerated: usually a non-empty directory that still
                    // holds excluded files. Surface it as a skip.
                    debug!(path, error = %err, "orphan directory left in place");
                    self.collector.push_difference(FileDifference {
                        relative_path: path.clone(),
                        reason: DiffReason::Skipped,
                        details: Some("orphan directory not removed".into()),
                        source_info: None,
                        dest_info: None,
                    });
                }
            }
        }
    }
}

fn orphan_difference(path: &str, record: Option<&FileRecord>, details: &str) -> FileDifference {
    FileDifference {
        relative_path: path.to_string(),
        reason: DiffReason::Deleted,
        details: Some(details.to_string()),
        source_info: None,
        dest_info: record.map(EntryInfo::from),
    }
}

/// Per-worker context; each worker owns a comparator wired to the shared
/// sink and limiter.
struct Worker {
    id: usize,
    source: Arc<dyn StorageBackend>,
    dest: Arc<dyn StorageBackend>,
    index: Arc<RwLock<DestIndex>>,
    comparator: Comparator,
    limiter: Option<Arc<RateLimiter>>,
    collector: Arc<Collector>,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    dry_run: bool,
    sequence: Arc<AtomicU64>,
}

impl Worker {
    async fn run(self, rx: Arc<Mutex<mpsc::Receiver<FileTask>>>) -> Vec<FileTask> {
        let mut done = Vec::new();
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let task = { rx.lock().await.recv().await };
            let Some(mut task) = task else { break };

            self.process(&mut task).await;
            done.push(task);
        }
        done
    }

    async fn process(&self, task: &mut FileTask) {
        let started = Instant::now();
        task.status = TaskStatus::Processing;
        task.worker_id = self.id;

        self.sink.update(ProgressEvent::FileStart {
            path: task.relative_path.clone(),
            size: task.size,
            index: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
        });

        // Open the source stream up front so unreadable files fail fast.
        let stream = match self.source.read(&task.relative_path).await {
            Ok(stream) => stream,
            Err(err) => {
                self.fail(task, "copy", format!("{err:#}"), started);
                return;
            }
        };

        let existing = {
            let index = self.index.read().expect("dest index poisoned");
            index.files.get(&task.relative_path).cloned()
        };

        match existing {
            None => {
                self.transfer(task, Some(stream), false, started).await;
            }
            Some(dest_record) => {
                drop(stream);
                self.sink.update(ProgressEvent::CompareStart {
                    path: task.relative_path.clone(),
                });

                let verdict = self
                    .comparator
                    .compare(
                        self.source.as_ref(),
                        self.dest.as_ref(),
                        &task.record,
                        &dest_record,
                        &self.cancel,
                    )
                    .await;

                match verdict {
                    Ok(Verdict::Same) => {
                        self.sink.update(ProgressEvent::CompareComplete {
                            path: task.relative_path.clone(),
                            same: true,
                        });
                        self.complete(task, TaskResult::Synchronized, 0, started);
                    }
                    Ok(Verdict::Different(reason)) => {
                        self.sink.update(ProgressEvent::CompareComplete {
                            path: task.relative_path.clone(),
                            same: false,
                        });
                        task.difference = Some(reason);
                        self.transfer(task, None, true, started).await;
                    }
                    Err(SyncError::Cancelled) => {
                        task.status = TaskStatus::Completed;
                        task.result = Some(TaskResult::Skipped);
                        self.collector
                            .stats
                            .files_skipped
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        self.fail(task, "compare", err.to_string(), started);
                    }
                }
            }
        }
    }

    /// Copy or update one file, short-circuiting in dry-run mode.
    async fn transfer(
        &self,
        task: &mut FileTask,
        stream: Option<ByteStream>,
        overwrite: bool,
        started: Instant,
    ) {
        let stats = &self.collector.stats;
        let result = if overwrite {
            TaskResult::Updated
        } else {
            TaskResult::Copied
        };

        if self.dry_run {
            self.collector.push_difference(self.projection(task, overwrite));
            self.complete(task, result, 0, started);
            return;
        }

        let stream = match stream {
            Some(stream) => stream,
            None => match self.source.read(&task.relative_path).await {
                Ok(stream) => stream,
                Err(err) => {
                    self.fail(task, action_name(overwrite), format!("{err:#}"), started);
                    return;
                }
            },
        };

        let mut reader: ByteStream = stream;
        if let Some(limiter) = &self.limiter {
            reader = Box::new(limiter.wrap(reader, self.cancel.clone()));
        }
        let reader: ByteStream = Box::new(ProgressReader::new(
            reader,
            task.relative_path.clone(),
            task.size,
            Arc::clone(&self.sink),
        ));

        let meta = WriteMetadata::from(&task.record);
        match self
            .dest
            .write(&task.relative_path, reader, task.size, &meta)
            .await
        {
            Ok(()) => {
                stats.bytes_transferred.fetch_add(task.size, Ordering::Relaxed);
                stats.record_speed(task.size, started.elapsed());
                self.complete(task, result, task.size, started);
            }
            Err(err) => {
                self.fail(task, action_name(overwrite), format!("{err:#}"), started);
            }
        }
    }

    fn projection(&self, task: &FileTask, overwrite: bool) -> FileDifference {
        let reason = if overwrite {
            task.difference
                .map(DiffReason::from)
                .unwrap_or(DiffReason::ContentDifferent)
        } else {
            DiffReason::OnlyInSource
        };
        FileDifference {
            relative_path: task.relative_path.clone(),
            reason,
            details: Some(if overwrite { "would update" } else { "would copy" }.into()),
            source_info: Some(EntryInfo::from(&task.record)),
            dest_info: None,
        }
    }

    fn complete(&self, task: &mut FileTask, result: TaskResult, bytes: u64, started: Instant) {
        let stats = &self.collector.stats;
        match result {
            TaskResult::Copied => stats.files_copied.fetch_add(1, Ordering::Relaxed),
            TaskResult::Updated => stats.files_updated.fetch_add(1, Ordering::Relaxed),
            TaskResult::Synchronized => stats.files_synchronized.fetch_add(1, Ordering::Relaxed),
            TaskResult::Skipped => stats.files_skipped.fetch_add(1, Ordering::Relaxed),
            TaskResult::Failed => 0,
        };

        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.bytes_transferred = bytes;
        task.duration = started.elapsed();

        self.sink.update(ProgressEvent::FileComplete {
            path: task.relative_path.clone(),
            result,
            bytes,
        });
    }

    fn fail(&self, task: &mut FileTask, action: &str, message: String, started: Instant) {
        task.status = TaskStatus::Errored;
        task.result = Some(TaskResult::Failed);
        task.error = Some(message.clone());
        task.duration = started.elapsed();

        self.collector
            .stats
            .files_errored
            .fetch_add(1, Ordering::Relaxed);
        self.collector.push_error(&task.relative_path, action, message.clone());
        self.collector.push_difference(FileDifference {
            relative_path: task.relative_path.clone(),
            reason: if action == "update" {
                DiffReason::UpdateError
            } else {
                DiffReason::CopyError
            },
            details: Some(message.clone()),
            source_info: Some(EntryInfo::from(&task.record)),
            dest_info: None,
        });
        self.sink.update(ProgressEvent::FileError {
            path: task.relative_path.clone(),
            message,
        });
    }
}

fn action_name(overwrite: bool) -> &'static str {
    if overwrite {
        "update"
    } else {
        "copy"
    }
}
