//! Progress reporting channel between the engine and external formatters.
//!
//! The core emits structured updates through a [`ProgressSink`]; consumers
//! render them however they like. Sinks are best-effort: updates may be
//! dropped, and a sink must never block the engine.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

use crate::fs::backend::ByteStream;
use crate::sync::report::TaskResult;
use crate::sync::state::Side;

/// Minimum spacing between `FileProgress` updates for one file.
pub const REPORT_INTERVAL: Duration = Duration::from_millis(50);

/// Byte delta that forces an update even inside the interval.
pub const REPORT_BYTES: u64 = 64 * 1024;

/// Structured progress updates emitted during a run.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    ScanProgress {
        side: Side,
        files: u64,
        bytes: u64,
    },
    FileStart {
        path: String,
        size: u64,
        index: u64,
    },
    CompareStart {
        path: String,
    },
    FileProgress {
        path: String,
        bytes_done: u64,
        total: u64,
    },
    CompareComplete {
        path: String,
        same: bool,
    },
    FileComplete {
        path: String,
        result: TaskResult,
        bytes: u64,
    },
    FileError {
        path: String,
        message: String,
    },
}

/// Best-effort consumer of progress updates.
pub trait ProgressSink: Send + Sync {
    fn update(&self, event: ProgressEvent);
}

/// Sink that drops everything.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn update(&self, _event: ProgressEvent) {}
}

/// Sink forwarding events into a bounded channel; full channel drops the
/// update rather than stalling a worker.
pub struct ChannelSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn update(&self, event: ProgressEvent) {
        let _ = self.tx.try_send(event);
    }
}

/// Read adapter that reports transfer progress for one file.
///
/// Updates are throttled on both time and bytes so high-throughput copies
/// don't drown the sink.
pub struct ProgressReader {
    inner: ByteStream,
    path: String,
    total: u64,
    bytes_done: u64,
    unreported: u64,
    last_report: Instant,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressReader {
    pub fn new(inner: ByteStream, path: impl Into<String>, total: u64, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            inner,
            path: path.into(),
            total,
            bytes_done: 0,
            unreported: 0,
            last_report: Instant::now(),
            sink,
        }
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }
}

impl AsyncRead for ProgressReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let me = &mut *self;
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = (buf.filled().len() - before) as u64;
                me.bytes_done += n;
                me.unreported += n;

                let due = me.unreported >= REPORT_BYTES
                    || me.last_report.elapsed() >= REPORT_INTERVAL;
                if n > 0 && due {
                    me.sink.update(ProgressEvent::FileProgress {
                        path: me.path.clone(),
                        bytes_done: me.bytes_done,
                        total: me.total,
                    });
                    me.unreported = 0;
                    me.last_report = Instant::now();
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
