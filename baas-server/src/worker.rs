//! Worker pool.
//!
//! A fixed set of OS threads runs the hasher. A single dispatcher task owns
//! all pool state: the idle stack, the FIFO wait queue and the reply slot of
//! each busy worker. Connections talk to it through [`WorkerPool::dispatch`].
//!
//! Idle workers are reused most-recently-released first. Queued requests are
//! handed to workers strictly in arrival order.

use crate::error::ServerError;
use crate::event::{self, ServerEvent};
use crate::hasher::PasswordHasher;
use crate::metrics::Metrics;
use baas_protocol::{Operation, Request, Response};
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};

/// Returns the default worker count: one less than the number of CPUs, at
/// least one.
pub fn default_worker_count() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

/// Worker pool configuration.
#[derive(Clone, Default)]
pub struct WorkerPoolConfig {
    /// Number of worker threads. `None` uses [`default_worker_count`].
    pub workers: Option<usize>,
    /// Bound on the wait queue. When full, new requests are answered with
    /// `busy`. `None` leaves the queue unbounded.
    pub max_queue_length: Option<usize>,
    pub metrics: Option<Arc<Metrics>>,
}

impl WorkerPoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_max_queue_length(mut self, max: usize) -> Self {
        self.max_queue_length = Some(max);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Outcome of a dispatched request.
#[derive(Debug, Clone)]
pub struct Completion {
    pub response: Response,
    /// Worker that ran the request. `None` when the request was declined.
    pub worker: Option<usize>,
    /// Whether the request waited in the queue.
    pub enqueued: bool,
    /// Time from dispatch to completion.
    pub took: Duration,
}

/// Future returned by [`WorkerPool::dispatch`].
pub struct Dispatched {
    rx: oneshot::Receiver<Completion>,
}

impl Future for Dispatched {
    type Output = Result<Completion, ServerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map_err(|_| ServerError::WorkerGone)
    }
}

/// Point-in-time pool counters, readable from any task.
#[derive(Debug, Default)]
struct PoolStats {
    idle: AtomicUsize,
    queued: AtomicUsize,
}

/// Handle to the worker pool. Dropping every handle stops the dispatcher,
/// which in turn lets the worker threads exit.
#[derive(Clone)]
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<Job>,
    stats: Arc<PoolStats>,
    size: usize,
}

impl WorkerPool {
    /// Spawns the worker threads and the dispatcher task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: WorkerPoolConfig,
        hasher: Arc<dyn PasswordHasher>,
        events: broadcast::Sender<ServerEvent>,
    ) -> Result<Self, ServerError> {
        let size = config.workers.unwrap_or_else(default_worker_count).max(1);
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let (tx, rx) = mpsc::unbounded_channel();
            let hasher = hasher.clone();
            let done = done_tx.clone();
            thread::Builder::new()
                .name(format!("baas-worker-{}", index))
                .spawn(move || worker_loop(index, hasher, rx, done))
                .map_err(|source| ServerError::WorkerSpawn { index, source })?;
            workers.push(Some(tx));
        }
        drop(done_tx);

        let stats = Arc::new(PoolStats::default());
        stats.idle.store(size, Ordering::Release);
        if let Some(metrics) = &config.metrics {
            metrics.workers_idle.set(size as f64);
            metrics.queue_length.set(0.0);
        }

        let dispatcher = Dispatcher {
            in_flight: (0..size).map(|_| None).collect(),
            // Reversed so worker 0 is popped first.
            idle: (0..size).rev().collect(),
            workers,
            alive: size,
            queue: VecDeque::new(),
            max_queue_length: config.max_queue_length,
            stats: stats.clone(),
            metrics: config.metrics,
            events,
        };

        let (commands, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatcher.run(commands_rx, done_rx));
        tracing::info!(workers = size, "Worker pool started");

        Ok(Self {
            commands,
            stats,
            size,
        })
    }

    /// Hands a request to the pool.
    ///
    /// Dispatch order is the order of calls; the returned future resolves
    /// when a worker has answered, or immediately with a `busy` response
    /// when the bounded queue is full.
    pub fn dispatch(&self, request: Request) -> Dispatched {
        let (reply, rx) = oneshot::channel();
        // A closed channel drops the reply sender, so the future reports
        // WorkerGone.
        let _ = self.commands.send(Job {
            request,
            reply,
            submitted_at: Instant::now(),
        });
        Dispatched { rx }
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.size
    }

    /// Workers not running a request.
    pub fn idle_workers(&self) -> usize {
        self.stats.idle.load(Ordering::Acquire)
    }

    /// Requests waiting for a worker.
    pub fn queue_len(&self) -> usize {
        self.stats.queued.load(Ordering::Acquire)
    }
}

struct Job {
    request: Request,
    reply: oneshot::Sender<Completion>,
    submitted_at: Instant,
}

struct InFlight {
    reply: oneshot::Sender<Completion>,
    operation: Operation,
    submitted_at: Instant,
    enqueued: bool,
}

enum WorkerMsg {
    Done { worker: usize, response: Response },
    /// The thread is gone without answering what it was running.
    Exited { worker: usize },
}

/// Reports the thread's exit to the dispatcher, however it ends.
struct ExitGuard {
    worker: usize,
    done: mpsc::UnboundedSender<WorkerMsg>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.done.send(WorkerMsg::Exited {
            worker: self.worker,
        });
    }
}

struct Dispatcher {
    /// Job channel per worker; `None` once the thread is gone.
    workers: Vec<Option<mpsc::UnboundedSender<Request>>>,
    in_flight: Vec<Option<InFlight>>,
    idle: Vec<usize>,
    alive: usize,
    queue: VecDeque<Job>,
    max_queue_length: Option<usize>,
    stats: Arc<PoolStats>,
    metrics: Option<Arc<Metrics>>,
    events: broadcast::Sender<ServerEvent>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Job>,
        mut done: mpsc::UnboundedReceiver<WorkerMsg>,
    ) {
        loop {
            tokio::select! {
                biased;

                Some(msg) = done.recv() => match msg {
                    WorkerMsg::Done { worker, response } => self.on_worker_done(worker, response),
                    WorkerMsg::Exited { worker } => self.on_worker_exit(worker),
                },

                job = commands.recv() => match job {
                    Some(job) => self.on_dispatch(job),
                    None => break,
                },
            }
        }

        tracing::debug!(
            queued = self.queue.len(),
            "Worker pool handle dropped, stopping dispatcher"
        );
    }

    fn on_dispatch(&mut self, job: Job) {
        if let Some(worker) = self.idle.pop() {
            self.assign(worker, job, false);
        } else if self.alive == 0 {
            tracing::error!(request_id = %job.request.id, "No live workers, dropping request");
        } else if self
            .max_queue_length
            .is_some_and(|max| self.queue.len() >= max)
        {
            tracing::warn!(
                request_id = %job.request.id,
                queue_len = self.queue.len(),
                "Queue full, answering busy"
            );
            if let Some(metrics) = &self.metrics {
                metrics.requests_rejected_total.inc();
            }
            let _ = job.reply.send(Completion {
                response: Response::busy(&job.request.id),
                worker: None,
                enqueued: false,
                took: job.submitted_at.elapsed(),
            });
        } else {
            let request_id = job.request.id.clone();
            self.queue.push_back(job);
            let queue_len = self.queue.len();
            tracing::debug!(request_id = %request_id, queue_len, "Request queued");
            if let Some(metrics) = &self.metrics {
                metrics.requests_queued_total.inc();
            }
            event::emit(
                &self.events,
                ServerEvent::Queued {
                    request_id,
                    queue_len,
                },
            );
        }
        self.publish_stats();
    }

    fn on_worker_done(&mut self, worker: usize, response: Response) {
        let Some(in_flight) = self.in_flight.get_mut(worker).and_then(Option::take) else {
            tracing::warn!(worker, "Completion from a worker with nothing in flight");
            return;
        };

        match self.queue.pop_front() {
            Some(next) => self.assign(worker, next, true),
            None => self.idle.push(worker),
        }
        self.publish_stats();

        let took = in_flight.submitted_at.elapsed();
        if let Some(metrics) = &self.metrics {
            let op = in_flight.operation.as_str();
            metrics.requests_processed_total.with_label_values(&[op]).inc();
            metrics
                .request_duration
                .with_label_values(&[op])
                .observe(took.as_secs_f64());
        }

        // The connection may have gone away; its answer is dropped.
        let _ = in_flight.reply.send(Completion {
            response,
            worker: Some(worker),
            enqueued: in_flight.enqueued,
            took,
        });
    }

    /// Retires a worker whose thread has ended. Its in-flight reply is
    /// dropped, so that caller sees [`ServerError::WorkerGone`].
    fn on_worker_exit(&mut self, worker: usize) {
        let Some(tx) = self.workers.get_mut(worker).and_then(Option::take) else {
            // Normal shutdown after the dispatcher stopped handing out work.
            return;
        };
        drop(tx);
        self.alive = self.alive.saturating_sub(1);
        self.idle.retain(|&w| w != worker);

        let lost = self.in_flight[worker].take();
        tracing::error!(
            worker,
            alive = self.alive,
            request_lost = lost.is_some(),
            "Worker thread exited, retiring it"
        );

        if self.alive == 0 {
            tracing::error!(
                queued = self.queue.len(),
                "No live workers, dropping queued requests"
            );
            self.queue.clear();
        }
        self.publish_stats();
    }

    fn assign(&mut self, worker: usize, job: Job, enqueued: bool) {
        let Job {
            request,
            reply,
            submitted_at,
        } = job;
        let operation = request.operation;

        let sent = self.workers[worker]
            .as_ref()
            .is_some_and(|tx| tx.send(request).is_ok());
        if !sent {
            // Only reachable while its exit notice is still in the channel.
            tracing::error!(worker, "Worker thread is gone, dropping request");
            return;
        }
        self.in_flight[worker] = Some(InFlight {
            reply,
            operation,
            submitted_at,
            enqueued,
        });
    }

    fn publish_stats(&self) {
        self.stats.idle.store(self.idle.len(), Ordering::Release);
        self.stats.queued.store(self.queue.len(), Ordering::Release);
        if let Some(metrics) = &self.metrics {
            metrics.workers_idle.set(self.idle.len() as f64);
            metrics.queue_length.set(self.queue.len() as f64);
        }
    }
}

fn worker_loop(
    index: usize,
    hasher: Arc<dyn PasswordHasher>,
    mut jobs: mpsc::UnboundedReceiver<Request>,
    done: mpsc::UnboundedSender<WorkerMsg>,
) {
    tracing::debug!(worker = index, "Worker started");
    let guard = ExitGuard {
        worker: index,
        done,
    };

    while let Some(request) = jobs.blocking_recv() {
        let response = execute(hasher.as_ref(), &request);
        if guard
            .done
            .send(WorkerMsg::Done {
                worker: index,
                response,
            })
            .is_err()
        {
            break;
        }
    }

    tracing::debug!(worker = index, "Worker stopped");
}

/// Runs one request to completion. Hasher failures and panics both turn
/// into `success = false`.
pub(crate) fn execute(hasher: &dyn PasswordHasher, request: &Request) -> Response {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match request.operation {
        Operation::Hash => match hasher.hash(&request.password) {
            Ok(hash) => Response::hashed(&request.id, hash),
            Err(e) => {
                tracing::warn!(request_id = %request.id, error = %e, "Hash failed");
                Response::failed(&request.id)
            }
        },
        Operation::Compare => {
            let matched = request
                .hash
                .as_deref()
                .map(|hash| hasher.verify(&request.password, hash))
                .unwrap_or(Ok(false));
            match matched {
                Ok(matched) => Response::compared(&request.id, matched),
                Err(e) => {
                    tracing::debug!(request_id = %request.id, error = %e, "Compare failed");
                    Response::failed(&request.id)
                }
            }
        }
    }));

    outcome.unwrap_or_else(|_| {
        tracing::error!(request_id = %request.id, "Worker panicked while processing request");
        Response::failed(&request.id)
    })
}
