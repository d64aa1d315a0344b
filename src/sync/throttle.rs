//! Bandwidth throttling for sync transfers.
//!
//! A single token bucket is shared by every concurrent reader in a run.
//! Tokens are bytes; refill is computed lazily under the bucket mutex each
//! time a caller asks for capacity, so no background task is needed.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;
use crate::fs::backend::ByteStream;

/// Floor for the bucket, so tiny limits still move whole read chunks.
pub const MIN_BUCKET_SIZE: u64 = 64 * 1024;

/// Largest single read a throttled stream performs.
const READ_CHUNK: usize = 64 * 1024;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Shared token-bucket rate limiter.
///
/// `bucket_size = max(bytes_per_second, 64 KiB)`; a request larger than the
/// bucket is clamped so it can always eventually be satisfied.
pub struct RateLimiter {
    bytes_per_second: u64,
    bucket_size: u64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter for `bytes_per_second > 0`.
    pub fn new(bytes_per_second: u64) -> Self {
        let bytes_per_second = bytes_per_second.max(1);
        let bucket_size = bytes_per_second.max(MIN_BUCKET_SIZE);
        Self {
            bytes_per_second,
            bucket_size,
            bucket: Mutex::new(Bucket {
                // Start full so short transfers are not penalized.
                tokens: bucket_size as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.bytes_per_second
    }

    pub fn bucket_size(&self) -> u64 {
        self.bucket_size
    }

    /// Block until `n` tokens are available (clamped to the bucket size),
    /// or until the token is cancelled.
    pub async fn acquire(&self, n: u64, cancel: &CancellationToken) -> Result<(), SyncError> {
        if n == 0 {
            return Ok(());
        }
        let want = n.min(self.bucket_size) as f64;

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().expect("rate limiter poisoned");
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.last_refill = now;
                bucket.tokens = (bucket.tokens + elapsed * self.bytes_per_second as f64)
                    .min(self.bucket_size as f64);

                if bucket.tokens >= want {
                    bucket.tokens -= want;
                    return Ok(());
                }
                Duration::from_secs_f64((want - bucket.tokens) / self.bytes_per_second as f64)
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Wrap a byte stream so every read is paid for out of this bucket.
    pub fn wrap(
        self: &Arc<Self>,
        inner: ByteStream,
        cancel: CancellationToken,
    ) -> ThrottledReader {
        ThrottledReader {
            inner,
            limiter: Arc::clone(self),
            cancel,
            held: Vec::new(),
            held_offset: 0,
            pending: None,
        }
    }
}

type AcquireFuture = Pin<Box<dyn Future<Output = Result<(), SyncError>> + Send>>;

/// `AsyncRead` adapter that debits the shared bucket for every chunk.
///
/// Bytes are read from the inner stream first, then released to the caller
/// once tokens cover them; a chunk already handed out keeps its byte count
/// even if cancellation fires afterwards.
pub struct ThrottledReader {
    inner: ByteStream,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
    held: Vec<u8>,
    held_offset: usize,
    pending: Option<AcquireFuture>,
}

impl AsyncRead for ThrottledReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if let Some(fut) = self.pending.as_mut() {
                match fut.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(())) => {
                        self.pending = None;
                    }
                    Poll::Ready(Err(_)) => {
                        self.pending = None;
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::Interrupted,
                            "transfer cancelled",
                        )));
                    }
                }
            }

            if self.held_offset < self.held.len() {
                let remaining = self.held.len() - self.held_offset;
                let take = remaining.min(buf.remaining());
                let start = self.held_offset;
                buf.put_slice(&self.held[start..start + take]);
                self.held_offset += take;
                if self.held_offset == self.held.len() {
                    self.held.clear();
                    self.held_offset = 0;
                }
                return Poll::Ready(Ok(()));
            }

            let chunk = READ_CHUNK.min(self.limiter.bucket_size as usize).max(1);
            let mut scratch = vec![0u8; chunk];
            let mut read_buf = ReadBuf::new(&mut scratch);
            let me = &mut *self;
            match Pin::new(&mut me.inner).poll_read(cx, &mut read_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Ready(Ok(())) => {
                    let n = read_buf.filled().len();
                    if n == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    scratch.truncate(n);
                    self.held = scratch;
                    self.held_offset = 0;

                    let limiter = Arc::clone(&self.limiter);
                    let cancel = self.cancel.clone();
                    self.pending = Some(Box::pin(async move {
                        limiter.acquire(n as u64, &cancel).await
                    }));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_size_has_a_floor() {
        let limiter = RateLimiter::new(1_000);
        assert_eq!(limiter.bucket_size(), MIN_BUCKET_SIZE);

        let limiter = RateLimiter::new(10_000_000);
        assert_eq!(limiter.bucket_size(), 10_000_000);
    }

    #[tokio::test]
    async fn oversized_request_is_clamped() {
        let limiter = RateLimiter::new(1_000);
        let cancel = CancellationToken::new();
        // Ten buckets' worth, but the clamp means the initial full bucket
        // already covers it.
        limiter
            .acquire(10 * limiter.bucket_size(), &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_acquire_returns_immediately() {
        let limiter = RateLimiter::new(1_000);
        let cancel = CancellationToken::new();
        // Drain the initial bucket.
        limiter.acquire(limiter.bucket_size(), &cancel).await.unwrap();

        cancel.cancel();
        let err = limiter.acquire(MIN_BUCKET_SIZE, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
