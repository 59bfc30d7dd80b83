//! Bounded worker pool with adaptive sizing driven by observed
//! success/failure/timeout rates. Tasks are admitted highest-priority
//! first, ties broken by submission order, mirroring the priority-queue
//! scheduling the persistent queue uses for upload records themselves.

use crate::error::{CoreError, CoreResult};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub min_parallelism: usize,
    pub max_parallelism: usize,
    pub initial_parallelism: usize,
    pub adaptive: bool,
    pub sample_window: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_parallelism: 1,
            max_parallelism: 8,
            initial_parallelism: 4,
            adaptive: true,
            sample_window: 5,
        }
    }
}

/// Rolling counters of task outcomes, partially decayed over time so
/// adaptive sizing weighs recent observations more heavily than stale
/// ones. Guards against oscillation on mildly lossy networks.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConcurrencyStats {
    pub success: u64,
    pub fail: u64,
    pub timeout: u64,
    pub samples: u64,
    pub parallelism: usize,
}

struct PendingTask {
    priority: i32,
    sequence: u64,
    cancelled: Arc<AtomicBool>,
    cancel_token: CancellationToken,
    work: BoxFuture<'static, CoreResult<()>>,
    result_tx: oneshot::Sender<CoreResult<()>>,
}

impl PartialEq for PendingTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for PendingTask {}

impl PartialOrd for PendingTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct GateInner {
    pending: BinaryHeap<PendingTask>,
    parallelism: usize,
    in_flight: usize,
    stats: ConcurrencyStats,
}

/// A handle to a submitted task. Awaiting it yields the task's result;
/// dropping or calling `cancel` releases it if still pending, or signals
/// the cooperative cancellation token if already admitted.
pub struct GateHandle {
    result_rx: oneshot::Receiver<CoreResult<()>>,
    cancelled: Arc<AtomicBool>,
    cancel_token: CancellationToken,
}

impl GateHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_token.cancel();
    }
}

impl Future for GateHandle {
    type Output = CoreResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.result_rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(CoreError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Bounded, priority-ordered, adaptively-sized dispatcher. Cloned handles
/// share the same underlying pool; the dispatcher loop runs as a single
/// background task for the pool's lifetime.
pub struct ConcurrencyGate {
    config: GateConfig,
    inner: Arc<Mutex<GateInner>>,
    notify: Arc<Notify>,
    sequence: AtomicU64,
    shutdown: Arc<AtomicBool>,
    current_parallelism: Arc<AtomicI64>,
}

impl ConcurrencyGate {
    pub fn new(config: GateConfig) -> Arc<Self> {
        let initial = config
            .initial_parallelism
            .clamp(config.min_parallelism, config.max_parallelism);

        let gate = Arc::new(Self {
            inner: Arc::new(Mutex::new(GateInner {
                pending: BinaryHeap::new(),
                parallelism: initial,
                in_flight: 0,
                stats: ConcurrencyStats {
                    parallelism: initial,
                    ..Default::default()
                },
            })),
            notify: Arc::new(Notify::new()),
            sequence: AtomicU64::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
            current_parallelism: Arc::new(AtomicI64::new(initial as i64)),
            config,
        });

        gate.clone().spawn_dispatcher();
        gate.clone().spawn_decay_timer();
        gate
    }

    pub fn current_parallelism(&self) -> usize {
        self.current_parallelism.load(Ordering::SeqCst).max(0) as usize
    }

    pub async fn stats(&self) -> ConcurrencyStats {
        self.inner.lock().await.stats
    }

    pub fn submit<F>(&self, priority: i32, task: F) -> GateHandle
    where
        F: Future<Output = CoreResult<()>> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancel_token = CancellationToken::new();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);

        let pending = PendingTask {
            priority,
            sequence,
            cancelled: cancelled.clone(),
            cancel_token: cancel_token.clone(),
            work: Box::pin(task),
            result_tx,
        };

        let inner = self.inner.clone();
        let notify = self.notify.clone();
        tokio::spawn(async move {
            inner.lock().await.pending.push(pending);
            notify.notify_one();
        });

        GateHandle {
            result_rx,
            cancelled,
            cancel_token,
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn spawn_dispatcher(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                if self.shutdown.load(Ordering::SeqCst) {
                    break;
                }

                let next = {
                    let mut inner = self.inner.lock().await;
                    let mut popped = None;
                    while inner.in_flight < inner.parallelism {
                        match inner.pending.pop() {
                            Some(task) if task.cancelled.load(Ordering::SeqCst) => {
                                let _ = task.result_tx.send(Err(CoreError::Cancelled));
                                continue;
                            }
                            Some(task) => {
                                popped = Some(task);
                                inner.in_flight += 1;
                                break;
                            }
                            None => break,
                        }
                    }
                    popped
                };

                match next {
                    Some(task) => self.clone().run_task(task),
                    None => {
                        self.notify.notified().await;
                    }
                }
            }
        });
    }

    fn run_task(self: Arc<Self>, task: PendingTask) {
        tokio::spawn(async move {
            let cancel_token = task.cancel_token.clone();
            let outcome = tokio::select! {
                result = task.work => result,
                _ = cancel_token.cancelled() => Err(CoreError::Cancelled),
            };

            self.record_outcome(&outcome).await;
            let _ = task.result_tx.send(outcome);

            let mut inner = self.inner.lock().await;
            inner.in_flight = inner.in_flight.saturating_sub(1);
            drop(inner);
            self.notify.notify_one();
        });
    }

    async fn record_outcome(&self, outcome: &CoreResult<()>) {
        if !self.config.adaptive {
            return;
        }

        let mut inner = self.inner.lock().await;
        match outcome {
            Ok(()) => inner.stats.success += 1,
            Err(err) if err.is_retryable() => {
                if matches!(err, CoreError::TransportTimeout(_)) {
                    inner.stats.timeout += 1;
                } else {
                    inner.stats.fail += 1;
                }
            }
            // Non-retriable (fatal) outcomes are excluded from the adaptive
            // denominator so correct rejections never shrink parallelism.
            Err(_) => {}
        }
        inner.stats.samples += 1;

        if inner.stats.samples >= self.config.sample_window as u64 {
            let total = (inner.stats.success + inner.stats.fail + inner.stats.timeout).max(1) as f64;
            let fail_rate = inner.stats.fail as f64 / total;
            let timeout_rate = inner.stats.timeout as f64 / total;
            let backlog = inner.pending.len();

            if timeout_rate > 0.3 || fail_rate > 0.5 {
                inner.parallelism = inner.parallelism.saturating_sub(1).max(self.config.min_parallelism);
                debug!(parallelism = inner.parallelism, timeout_rate, fail_rate, "gate: decreasing parallelism");
            } else if fail_rate < 0.1 && backlog > inner.parallelism {
                inner.parallelism = (inner.parallelism + 1).min(self.config.max_parallelism);
                debug!(parallelism = inner.parallelism, backlog, "gate: increasing parallelism");
            }
            inner.stats.parallelism = inner.parallelism;
            self.current_parallelism.store(inner.parallelism as i64, Ordering::SeqCst);
        }
    }

    fn spawn_decay_timer(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                if self.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let mut inner = self.inner.lock().await;
                inner.stats.success /= 2;
                inner.stats.fail /= 2;
                inner.stats.timeout /= 2;
                inner.stats.samples /= 2;
                trace!("gate: decayed rolling sample counters");
            }
        });
    }
}
