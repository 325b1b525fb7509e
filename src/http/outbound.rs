//! The outbound write queue and its gather-write coalescer.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use crate::http::connection::{Event, ReplyShared};
use crate::http::handler::WriteCompletion;

/// Upper bound on byte ranges gathered into one vectored write. This caps
/// the iovec count handed to the kernel, not the byte count.
pub(crate) const MAX_GATHER_BUFFERS: usize = 32;

/// One queued outbound unit: an ordered list of owned byte ranges plus an
/// optional completion callback fired once the last range is written.
pub(crate) struct SendItem {
    buffers: Vec<Bytes>,
    done: Option<WriteCompletion>,
}

impl SendItem {
    pub(crate) fn new(buffers: Vec<Bytes>, done: Option<WriteCompletion>) -> Self {
        Self { buffers, done }
    }
}

/// How the writer should wind down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseMode {
    /// Finish writing everything queued, then shut the socket down.
    Drain,
    /// Fail whatever is still queued and shut the socket down now.
    Abort,
}

struct QueueState {
    items: VecDeque<SendItem>,
    sending: bool,
    close: Option<CloseMode>,
    failed: bool,
}

/// Mutex-protected ordered queue of [`SendItem`]s feeding the writer task.
///
/// The mutex only ever guards queue mutation; completion callbacks are
/// always invoked with it released.
pub(crate) struct OutboundQueue {
    state: Mutex<QueueState>,
    wake: Notify,
    idle: Notify,
}

impl OutboundQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                sending: false,
                close: None,
                failed: false,
            }),
            wake: Notify::new(),
            idle: Notify::new(),
        }
    }

    /// Queues an item for writing and wakes the writer. If the queue is
    /// already closed or failed, the item's completion fires immediately
    /// with an error instead.
    pub(crate) fn push(&self, mut item: SendItem) {
        let rejected = {
            let mut q = self.state.lock();
            if q.failed || q.close.is_some() {
                item.done.take()
            } else {
                q.items.push_back(item);
                self.wake.notify_one();
                None
            }
        };
        if let Some(done) = rejected {
            done(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed",
            )));
        }
    }

    /// Asks the writer to wind down. `Abort` overrides an earlier `Drain`;
    /// a later `Drain` never downgrades an `Abort`.
    pub(crate) fn close(&self, mode: CloseMode) {
        let mut q = self.state.lock();
        match (q.close, mode) {
            (None, _) | (Some(CloseMode::Drain), CloseMode::Abort) => q.close = Some(mode),
            _ => {}
        }
        self.wake.notify_one();
    }

    /// Waits until every queued byte has been handed to the socket, or the
    /// queue has failed and been emptied.
    pub(crate) async fn flush(&self) {
        loop {
            {
                let q = self.state.lock();
                if q.items.is_empty() && !q.sending {
                    return;
                }
            }
            self.idle.notified().await;
        }
    }
}

enum Step {
    Write(Vec<Bytes>),
    Aborted(Vec<WriteCompletion>),
    Shutdown,
    Wait,
}

/// The per-connection writer task: drains the queue with bounded vectored
/// writes until it is closed or the socket fails.
pub(crate) async fn write_loop<W>(mut writer: W, shared: Arc<ReplyShared>)
where
    W: AsyncWrite + Unpin,
{
    let queue = &shared.queue;

    loop {
        let batch = loop {
            let (zero_sized, step) = {
                let mut q = queue.state.lock();
                // Items made only of empty buffers complete without
                // touching the socket.
                let zero_sized = advance(&mut q, 0);
                let step = if q.items.is_empty() {
                    q.sending = false;
                    queue.idle.notify_one();
                    if q.close.is_some() {
                        Step::Shutdown
                    } else {
                        Step::Wait
                    }
                } else if q.close == Some(CloseMode::Abort) {
                    let aborted = drain_completions(&mut q);
                    q.sending = false;
                    queue.idle.notify_one();
                    Step::Aborted(aborted)
                } else {
                    q.sending = true;
                    Step::Write(collect_batch(&q.items))
                };
                (zero_sized, step)
            };
            for done in zero_sized {
                done(Ok(()));
            }
            match step {
                Step::Write(batch) => break batch,
                Step::Aborted(aborted) => {
                    for done in aborted {
                        done(Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "connection aborted",
                        )));
                    }
                    let _ = writer.shutdown().await;
                    return;
                }
                Step::Shutdown => {
                    let _ = writer.shutdown().await;
                    return;
                }
                Step::Wait => queue.wake.notified().await,
            }
        };

        let slices: Vec<IoSlice<'_>> = batch.iter().map(|b| IoSlice::new(b)).collect();
        let result = match writer.write_vectored(&slices).await {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "socket closed while writing",
            )),
            other => other,
        };

        match result {
            Ok(written) => {
                shared.sent.fetch_add(written as u64, Ordering::Relaxed);
                let completed = {
                    let mut q = queue.state.lock();
                    let completed = advance(&mut q, written);
                    if q.items.is_empty() {
                        q.sending = false;
                        queue.idle.notify_one();
                    }
                    completed
                };
                for done in completed {
                    done(Ok(()));
                }
            }
            Err(err) => {
                // Peer died mid-write. Everything still queued fails with
                // the same error, in order, and the driver is told.
                shared.status.store(499, Ordering::Relaxed);
                let pending = {
                    let mut q = queue.state.lock();
                    q.failed = true;
                    q.sending = false;
                    let pending = drain_completions(&mut q);
                    queue.idle.notify_one();
                    pending
                };
                for done in pending {
                    done(Err(io::Error::new(err.kind(), err.to_string())));
                }
                let _ = shared.events.send(Event::WriteFailed(err));
                let _ = writer.shutdown().await;
                return;
            }
        }
    }
}

/// Empties the queue, returning the completions still owed, in order.
fn drain_completions(q: &mut QueueState) -> Vec<WriteCompletion> {
    q.items.drain(..).filter_map(|item| item.done).collect()
}

/// Gathers up to [`MAX_GATHER_BUFFERS`] non-empty ranges from the front of
/// the queue. `Bytes` clones are cheap handle copies.
fn collect_batch(items: &VecDeque<SendItem>) -> Vec<Bytes> {
    let mut batch = Vec::new();
    'items: for item in items {
        for buf in &item.buffers {
            if batch.len() == MAX_GATHER_BUFFERS {
                break 'items;
            }
            if !buf.is_empty() {
                batch.push(buf.clone());
            }
        }
    }
    batch
}

/// Advances the queue past `written` bytes: fully-written ranges are
/// dropped, a partially-written range is advanced in place, and the
/// completions of fully-written items are returned for the caller to fire
/// outside the lock, in order.
fn advance(q: &mut QueueState, mut written: usize) -> Vec<WriteCompletion> {
    let mut completed = Vec::new();

    while let Some(front) = q.items.front_mut() {
        while let Some(buf) = front.buffers.first_mut() {
            if buf.len() <= written {
                written -= buf.len();
                front.buffers.remove(0);
            } else {
                buf.advance(written);
                written = 0;
                break;
            }
        }

        if front.buffers.is_empty() {
            if let Some(item) = q.items.pop_front() {
                if let Some(done) = item.done {
                    completed.push(done);
                }
            }
        } else {
            break;
        }
    }

    if written > 0 {
        tracing::error!(extra = written, "write advanced past the queued bytes");
    }

    completed
}
