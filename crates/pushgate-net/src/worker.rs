//! Fixed pool of worker contexts.
//!
//! Each worker is a dedicated OS thread driving its own single-threaded
//! runtime. The acceptor hands connections out round-robin; once assigned, a
//! connection (its socket, decoder and timers) never leaves its worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::connection::{Assignment, ConnectionContext, serve_connection};

/// Map an I/O ratio (1-100, share of loop time favouring I/O) onto the
/// runtime's event interval: the number of scheduled tasks polled between
/// checks for I/O readiness. 100 polls I/O on every tick.
pub fn event_interval_for(io_ratio: u8) -> u32 {
    let ratio = u32::from(io_ratio.clamp(1, 100));
    1 + (100 - ratio) * 60 / 100
}

/// Sending side of the worker queues, shared with the acceptor.
pub struct WorkerDispatcher {
    queues: Vec<mpsc::UnboundedSender<Assignment>>,
    next: AtomicUsize,
}

impl WorkerDispatcher {
    /// Hand a connection to the next worker in round-robin order.
    pub fn assign(&self, assignment: Assignment) {
        if self.queues.is_empty() {
            tracing::warn!("No workers available, dropping {}", assignment.id);
            return;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        if let Err(rejected) = self.queues[index].send(assignment) {
            tracing::warn!("Worker {index} is gone, dropping {}", rejected.0.id);
        }
    }

    /// Number of workers.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// Whether the pool has no workers.
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

/// Handle owning the worker threads.
pub struct WorkerPool {
    dispatcher: Arc<WorkerDispatcher>,
    threads: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerPool {
    /// Launch `count` workers (at least one).
    ///
    /// If any worker fails to launch, the ones already running are stopped
    /// before the error is returned.
    pub fn spawn(
        count: usize,
        io_ratio: u8,
        drain_grace: Duration,
        ctx: Arc<ConnectionContext>,
    ) -> std::io::Result<Self> {
        let count = count.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut queues = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);

        for index in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            let launched = launch_worker(
                index,
                io_ratio,
                drain_grace,
                rx,
                shutdown_rx.clone(),
                Arc::clone(&ctx),
            );
            match launched {
                Ok(handle) => {
                    queues.push(tx);
                    threads.push(handle);
                }
                Err(e) => {
                    let partial = Self {
                        dispatcher: Arc::new(WorkerDispatcher {
                            queues,
                            next: AtomicUsize::new(0),
                        }),
                        threads,
                        shutdown_tx,
                    };
                    partial.shutdown();
                    return Err(e);
                }
            }
        }

        tracing::debug!("Launched {count} worker contexts");
        Ok(Self {
            dispatcher: Arc::new(WorkerDispatcher {
                queues,
                next: AtomicUsize::new(0),
            }),
            threads,
            shutdown_tx,
        })
    }

    /// Shared handle the acceptor uses to assign connections.
    pub fn dispatcher(&self) -> Arc<WorkerDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Signal every worker to close its connections and block until all
    /// worker threads have exited.
    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.threads {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                tracing::error!("{name} panicked during shutdown");
            }
        }
        tracing::debug!("Worker contexts stopped");
    }
}

fn launch_worker(
    index: usize,
    io_ratio: u8,
    drain_grace: Duration,
    queue: mpsc::UnboundedReceiver<Assignment>,
    shutdown: watch::Receiver<bool>,
    ctx: Arc<ConnectionContext>,
) -> std::io::Result<JoinHandle<()>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .event_interval(event_interval_for(io_ratio))
        .build()?;

    std::thread::Builder::new()
        .name(format!("pushgate-worker-{index}"))
        .spawn(move || runtime.block_on(worker_loop(queue, shutdown, drain_grace, ctx)))
}

async fn worker_loop(
    mut queue: mpsc::UnboundedReceiver<Assignment>,
    mut shutdown: watch::Receiver<bool>,
    drain_grace: Duration,
    ctx: Arc<ConnectionContext>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            assignment = queue.recv() => match assignment {
                Some(assignment) => {
                    connections.spawn(serve_connection(
                        Arc::clone(&ctx),
                        assignment,
                        shutdown.clone(),
                    ));
                }
                None => break,
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    tracing::error!("Connection task panicked: {e}");
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    let open = connections.len();
    if open > 0 {
        tracing::debug!("Draining {open} connections");
    }
    let drained = tokio::time::timeout(drain_grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            "{} connections still open after {drain_grace:?}, aborting",
            connections.len()
        );
        connections.shutdown().await;
    }
}
