//! File comparison strategies.
//!
//! Given two records of the same relative path on two backends, a
//! [`Comparator`] produces a [`Verdict`]. Cheap methods look only at
//! metadata; the content methods stream both sides, optionally through the
//! shared rate limiter, reporting progress as they go.

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;
use crate::fs::backend::{ByteStream, FileRecord, StorageBackend};
use crate::sync::throttle::RateLimiter;

/// Mod-time slack tolerated by timestamp-based comparisons, in seconds.
pub const MODTIME_TOLERANCE_SECS: i64 = 1;

/// How two files are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonMethod {
    /// Size only; names already matched by lookup.
    NameSize,
    /// Size, then mod-time within the tolerance window.
    Timestamp,
    /// Stream both files, abort at the first mismatching chunk.
    Binary,
    /// Stream each file through SHA-256 and compare digests.
    #[default]
    Hash,
    /// Like `Hash`, with an MD5 digest.
    Md5,
}

/// Why two files were judged different.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifferenceReason {
    Size,
    ModTime,
    Content,
    Hash,
    Missing,
}

/// Comparison outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Same,
    Different(DifferenceReason),
}

/// Callback receiving `(path, bytes_done, total)` while content streams.
pub type CompareProgress = Arc<dyn Fn(&str, u64, u64) + Send + Sync>;

/// Pluggable file comparator.
pub struct Comparator {
    method: ComparisonMethod,
    buffer_size: usize,
    limiter: Option<Arc<RateLimiter>>,
    progress: Option<CompareProgress>,
}

impl Comparator {
    pub fn new(method: ComparisonMethod, buffer_size: usize) -> Self {
        Self {
            method,
            buffer_size: buffer_size.max(1024),
            limiter: None,
            progress: None,
        }
    }

    /// Route content reads through the shared bandwidth limiter.
    pub fn with_limiter(mut self, limiter: Option<Arc<RateLimiter>>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_progress(mut self, progress: CompareProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn method(&self) -> ComparisonMethod {
        self.method
    }

    /// Compare one relative path across two backends.
    ///
    /// Failures are `SyncError::Comparison` (or `Cancelled`); the caller
    /// records them per-file rather than aborting the run.
    pub async fn compare(
        &self,
        source: &dyn StorageBackend,
        dest: &dyn StorageBackend,
        src: &FileRecord,
        dst: &FileRecord,
        cancel: &CancellationToken,
    ) -> Result<Verdict, SyncError> {
        if src.size != dst.size {
            return Ok(Verdict::Different(DifferenceReason::Size));
        }

        match self.method {
            ComparisonMethod::NameSize => Ok(Verdict::Same),
            ComparisonMethod::Timestamp => Ok(compare_timestamps(src, dst)),
            ComparisonMethod::Binary => self.compare_bytes(source, dest, src, dst, cancel).await,
            ComparisonMethod::Hash | ComparisonMethod::Md5 => {
                self.compare_digests(source, dest, src, dst, cancel).await
            }
        }
    }

    fn open_err(path: &str, err: anyhow::Error) -> SyncError {
        SyncError::Comparison {
            path: path.to_string(),
            message: format!("{err:#}"),
        }
    }

    fn wrap(&self, stream: ByteStream, cancel: &CancellationToken) -> ByteStream {
        match &self.limiter {
            Some(limiter) => Box::new(limiter.wrap(stream, cancel.clone())),
            None => stream,
        }
    }

    fn report(&self, path: &str, done: u64, total: u64) {
        if let Some(progress) = &self.progress {
            progress(path, done, total);
        }
    }

    async fn compare_bytes(
        &self,
        source: &dyn StorageBackend,
        dest: &dyn StorageBackend,
        src: &FileRecord,
        dst: &FileRecord,
        cancel: &CancellationToken,
    ) -> Result<Verdict, SyncError> {
        let path = src.relative_path.as_str();
        let total = src.size + dst.size;

        let mut left = self.wrap(
            source
                .read(path)
                .await
                .map_err(|e| Self::open_err(path, e))?,
            cancel,
        );
        let mut right = self.wrap(
            dest.read(&dst.relative_path)
                .await
                .map_err(|e| Self::open_err(path, e))?,
            cancel,
        );

        let mut buf_l = vec![0u8; self.buffer_size];
        let mut buf_r = vec![0u8; self.buffer_size];
        let mut done = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let n_l = fill_chunk(&mut left, &mut buf_l)
                .await
                .map_err(|e| Self::open_err(path, e.into()))?;
            let n_r = fill_chunk(&mut right, &mut buf_r)
                .await
                .map_err(|e| Self::open_err(path, e.into()))?;

            if n_l != n_r || buf_l[..n_l] != buf_r[..n_r] {
                return Ok(Verdict::Different(DifferenceReason::Content));
            }
            if n_l == 0 {
                return Ok(Verdict::Same);
            }

            done += (n_l + n_r) as u64;
            self.report(path, done, total);
        }
    }

    async fn compare_digests(
        &self,
        source: &dyn StorageBackend,
        dest: &dyn StorageBackend,
        src: &FileRecord,
        dst: &FileRecord,
        cancel: &CancellationToken,
    ) -> Result<Verdict, SyncError> {
        let path = src.relative_path.as_str();
        let total = src.size + dst.size;

        let src_digest = self
            .digest_one(source, src, cancel, 0, total)
            .await?;
        let dst_digest = self
            .digest_one(dest, dst, cancel, src.size, total)
            .await?;

        if src_digest == dst_digest {
            Ok(Verdict::Same)
        } else {
            Ok(Verdict::Different(DifferenceReason::Hash))
        }
    }

    async fn digest_one(
        &self,
        backend: &dyn StorageBackend,
        record: &FileRecord,
        cancel: &CancellationToken,
        progress_base: u64,
        progress_total: u64,
    ) -> Result<Vec<u8>, SyncError> {
        let path = record.relative_path.as_str();
        let stream = backend
            .read(path)
            .await
            .map_err(|e| Self::open_err(path, e))?;
        let mut stream = self.wrap(stream, cancel);

        let mut hasher = DigestKind::new(self.method);
        let mut buf = vec![0u8; self.buffer_size];
        let mut done = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let n = stream
                .read(&mut buf)
                .await
                .map_err(|e| Self::open_err(path, e.into()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            done += n as u64;
            self.report(path, progress_base + done, progress_total);
        }

        Ok(hasher.finalize())
    }
}

fn compare_timestamps(src: &FileRecord, dst: &FileRecord) -> Verdict {
    match (src.modified, dst.modified) {
        (Some(a), Some(b)) => {
            let delta = (a - b).num_seconds().abs();
            if delta > MODTIME_TOLERANCE_SECS {
                Verdict::Different(DifferenceReason::ModTime)
            } else {
                Verdict::Same
            }
        }
        // A side without timestamps cannot be judged newer; sizes matched.
        _ => Verdict::Same,
    }
}

/// Read until `buf` is full or the stream ends; returns bytes read.
async fn fill_chunk(stream: &mut ByteStream, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

enum DigestKind {
    Sha256(Sha256),
    Md5(Md5),
}

impl DigestKind {
    fn new(method: ComparisonMethod) -> Self {
        match method {
            ComparisonMethod::Md5 => Self::Md5(Md5::new()),
            _ => Self::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Md5(h) => h.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Md5(h) => h.finalize().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record_at(secs: i64) -> FileRecord {
        FileRecord::file("x.txt", 4, Some(Utc.timestamp_opt(secs, 0).unwrap()))
    }

    #[test]
    fn timestamps_within_tolerance_are_same() {
        let a = record_at(1_700_000_000);
        let b = record_at(1_700_000_001);
        assert_eq!(compare_timestamps(&a, &b), Verdict::Same);
    }

    #[test]
    fn timestamps_outside_tolerance_differ() {
        let a = record_at(1_700_000_000);
        let b = record_at(1_700_000_005);
        assert_eq!(
            compare_timestamps(&a, &b),
            Verdict::Different(DifferenceReason::ModTime)
        );
    }

    #[test]
    fn missing_timestamp_falls_back_to_same() {
        let a = record_at(1_700_000_000);
        let b = FileRecord::file("x.txt", 4, None);
        assert_eq!(compare_timestamps(&a, &b), Verdict::Same);
    }
}
