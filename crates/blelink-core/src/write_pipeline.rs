//! The serialized write pipeline.
//!
//! At most one write is in flight at a time. Concurrent callers queue
//! FIFO; each write is stamped with a monotonic sequence number so a late
//! completion for write N cannot be mistaken for the completion of write
//! N+1.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Queue depth at which the pipeline logs a diagnostic warning.
const QUEUE_DEPTH_WARNING_THRESHOLD: usize = 3;

struct PendingWrite {
    sequence: u64,
    completion: oneshot::Sender<Result<(), Error>>,
    timeout: CancellationToken,
}

struct Inner {
    pending: Option<PendingWrite>,
    waiters: VecDeque<oneshot::Sender<()>>,
    last_completion_at: Option<Instant>,
}

/// Serializes `send` calls, enforcing pacing, per-write timeout, and
/// sequence-tag validation of completion callbacks.
pub struct WritePipeline {
    sequence: AtomicU64,
    inner: Mutex<Inner>,
    write_timeout: Duration,
    pacing_delay: Duration,
}

impl WritePipeline {
    /// Create a pipeline with the given per-write timeout and the delay to
    /// apply between completion of write N and the start of write N+1.
    pub fn new(write_timeout: Duration, pacing_delay: Duration) -> Self {
        Self {
            sequence: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                pending: None,
                waiters: VecDeque::new(),
                last_completion_at: None,
            }),
            write_timeout,
            pacing_delay,
        }
    }

    /// Number of callers currently queued behind the in-flight write.
    pub fn queue_depth(&self) -> usize {
        self.inner.lock().unwrap().waiters.len()
    }

    /// Submit `bytes` for writing.
    ///
    /// `still_connected` is re-checked both before claiming the slot and
    /// after waking from the FIFO queue (the "revalidation on wake"
    /// contract): a waiter that wakes into a phase that is no longer
    /// `Connected` fails with [`Error::NotConnected`] without issuing a
    /// write. `issue` performs the platform write once this caller has
    /// exclusively claimed the slot and is handed the sequence number to
    /// publish to the delegate bridge; its future resolving does not mean
    /// the write completed, only that the request was submitted — the
    /// resulting completion must be reported back via [`Self::complete`].
    ///
    /// Takes `self` behind an `Arc` because the timeout armed for this
    /// write outlives the call: it is a detached task that calls back into
    /// [`Self::complete`] if the platform never does.
    pub async fn send<F, Fut>(
        self: &Arc<Self>,
        bytes: Bytes,
        still_connected: impl Fn() -> bool,
        issue: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(u64, Bytes) -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        self.wait_for_turn().await;

        if !still_connected() {
            self.advance_queue();
            return Err(Error::NotConnected);
        }

        self.apply_pacing_delay().await;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let (completion_tx, completion_rx) = oneshot::channel();
        let timeout_token = CancellationToken::new();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.pending = Some(PendingWrite {
                sequence,
                completion: completion_tx,
                timeout: timeout_token.clone(),
            });
        }

        self.arm_timeout(sequence, timeout_token);

        // Race the platform write against the pending slot's own
        // resolution rather than awaiting it inline: if `issue` hangs (the
        // case the armed timeout above exists to bound), the timeout's call
        // to `complete` must be able to resolve `completion_rx` and release
        // the next waiter without waiting for the stuck platform future to
        // return. Losing the race abandons `issue_fut` — the platform write
        // it wraps is no longer waited on once its slot has timed out.
        let issue_fut = issue(sequence, bytes);
        tokio::pin!(issue_fut);
        let result = tokio::select! {
            result = &mut completion_rx => result.unwrap_or(Err(Error::Cancelled)),
            outcome = &mut issue_fut => {
                if let Err(err) = outcome {
                    // The write was never accepted by the platform; resolve
                    // our own pending slot rather than waiting for a
                    // completion or timeout that will never come.
                    self.complete(sequence, Err(err));
                }
                completion_rx.await.unwrap_or(Err(Error::Cancelled))
            }
        };
        self.finish_turn();
        result
    }

    /// Report the outcome of the write tagged `sequence`. Rejects (returns
    /// `false`, logs, and drops) any completion whose sequence does not
    /// equal the currently-pending one — this is what prevents a late
    /// completion for write N from resuming write N+1.
    pub fn complete(&self, sequence: u64, result: Result<(), Error>) -> bool {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            match &inner.pending {
                Some(p) if p.sequence == sequence => inner.pending.take(),
                _ => None,
            }
        };
        match pending {
            Some(p) => {
                p.timeout.cancel();
                let _ = p.completion.send(result);
                true
            }
            None => {
                tracing::debug!(sequence, "rejected write completion: sequence mismatch");
                false
            }
        }
    }

    /// Every outstanding waiter (including an in-flight write, if any) is
    /// resumed with `error`. Used by shutdown and by the auto-reconnect
    /// cleanup step.
    pub fn fail_all(&self, error_factory: impl Fn() -> Error) {
        let (pending, waiters) = {
            let mut inner = self.inner.lock().unwrap();
            (inner.pending.take(), std::mem::take(&mut inner.waiters))
        };
        if let Some(p) = pending {
            p.timeout.cancel();
            let _ = p.completion.send(Err(error_factory()));
        }
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    async fn wait_for_turn(&self) {
        let maybe_rx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.pending.is_none() && inner.waiters.is_empty() {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                let depth = inner.waiters.len() + 1;
                inner.waiters.push_back(tx);
                if depth >= QUEUE_DEPTH_WARNING_THRESHOLD {
                    tracing::warn!(queue_depth = depth, "write queue depth threshold reached");
                }
                Some(rx)
            }
        };
        if let Some(rx) = maybe_rx {
            let _ = rx.await;
        }
    }

    async fn apply_pacing_delay(&self) {
        if self.pacing_delay.is_zero() {
            return;
        }
        let wait = {
            let inner = self.inner.lock().unwrap();
            inner.last_completion_at.map(|last| {
                let elapsed = last.elapsed();
                self.pacing_delay.saturating_sub(elapsed)
            })
        };
        if let Some(wait) = wait
            && !wait.is_zero()
        {
            tokio::time::sleep(wait).await;
        }
    }

    /// Spawn the timeout task for `sequence`. If `token` is not cancelled
    /// (by [`Self::complete`] resolving the same sequence) before
    /// `write_timeout` elapses, the slot is failed with
    /// [`Error::OperationTimeout`] and the next waiter is released.
    fn arm_timeout(self: &Arc<Self>, sequence: u64, token: CancellationToken) {
        let pipeline = Arc::clone(self);
        let timeout = self.write_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    pipeline.complete(sequence, Err(Error::OperationTimeout(timeout)));
                }
                _ = token.cancelled() => {}
            }
        });
    }

    fn finish_turn(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_completion_at = Some(Instant::now());
        if let Some(next) = inner.waiters.pop_front() {
            let _ = next.send(());
        }
    }

    fn advance_queue(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(next) = inner.waiters.pop_front() {
            let _ = next.send(());
        }
    }
}
