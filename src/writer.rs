// SPDX-License-Identifier: MIT
//! Ordered, non-blocking buffered writes to client sockets and core stdin.
//!
//! Every outbound fd gets one writer task that drains a queue of chunks.
//! `enqueue` never blocks the caller; bytes appear on the wire in exactly the
//! order enqueued.  On a fatal write error the owner is notified once through
//! the failure callback (sessions get force-disconnected, cores are torn down
//! when their stdout reaches EOF).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

enum WriteOp {
    Data(Vec<u8>),
    /// Flush everything queued so far, then shut down the write half.
    Shutdown,
}

/// Handle to a writer task. Cheap to clone into the owning table entry.
#[derive(Debug)]
pub struct Writer {
    tx: mpsc::UnboundedSender<WriteOp>,
    pending: Arc<AtomicUsize>,
}

impl Writer {
    /// Spawn the writer task for `dst`. `on_fail` is invoked at most once,
    /// with the error of the write that failed; queued chunks after a failed
    /// write are discarded.
    pub fn spawn<W>(mut dst: W, on_fail: impl FnOnce(std::io::Error) + Send + 'static) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteOp>();
        let pending = Arc::new(AtomicUsize::new(0));
        let task_pending = pending.clone();
        tokio::spawn(async move {
            let mut on_fail = Some(on_fail);
            while let Some(op) = rx.recv().await {
                match op {
                    WriteOp::Data(chunk) => {
                        let result = dst.write_all(&chunk).await;
                        task_pending.fetch_sub(chunk.len(), Ordering::Relaxed);
                        if let Err(e) = result {
                            if let Some(f) = on_fail.take() {
                                f(e);
                            }
                            return;
                        }
                    }
                    WriteOp::Shutdown => {
                        let _ = dst.shutdown().await;
                        return;
                    }
                }
            }
        });
        Self { tx, pending }
    }

    /// Queue bytes for writing. Silently drops the chunk if the writer task
    /// has already terminated (failed or shut down).
    pub fn enqueue(&self, bytes: impl Into<Vec<u8>>) {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return;
        }
        self.pending.fetch_add(bytes.len(), Ordering::Relaxed);
        if self.tx.send(WriteOp::Data(bytes)).is_err() {
            self.pending.store(0, Ordering::Relaxed);
        }
    }

    /// Queue a write-half shutdown behind everything enqueued so far.
    pub fn shutdown(&self) {
        let _ = self.tx.send(WriteOp::Shutdown);
    }

    pub fn is_empty(&self) -> bool {
        self.pending_bytes() == 0
    }

    /// Bytes queued but not yet written out.
    pub fn pending_bytes(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}
