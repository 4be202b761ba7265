//! TCP push server: acceptor context, worker pool and lifecycle sequencing.
//!
//! `start` launches the worker contexts and an acceptor thread, then returns;
//! the bind outcome is reported later through the caller's callback. `stop`
//! stops the acceptor first so no new connections are admitted, then drains
//! and joins the workers, and only then reports success.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use pushgate_config::Config;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::connection::{Assignment, ConnectionContext, ConnectionHandler};
use crate::framing::FrameConfig;
use crate::compression::CompressionConfig;
use crate::lifecycle::{Lifecycle, LifecycleError, ServerState};
use crate::platform::{SocketConfig, TransportBackend, bind_listener, resolve_bind_address};
use crate::registry::{ConnectionRegistry, DEFAULT_QUEUE_CAPACITY, IdGenerator};
use crate::worker::{WorkerDispatcher, WorkerPool, event_interval_for};

/// Pause after a failed `accept` (e.g. file descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Configuration for [`PushServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to. Default: `0.0.0.0:3000`.
    pub bind_addr: SocketAddr,
    /// Listener backend.
    pub transport: TransportBackend,
    /// Threads driving the acceptor. Default: 1.
    pub boss_threads: usize,
    /// Worker contexts. Default: number of CPU cores.
    pub worker_threads: usize,
    /// Share of worker loop time favouring I/O (1-100). Default: 70.
    pub io_ratio: u8,
    /// Maximum concurrent connections. Default: 100 000.
    pub max_connections: usize,
    /// Frames queued per connection before pushes are refused. Default: 1024.
    pub outbound_queue: usize,
    /// Close connections silent for this long. Default: 180s.
    pub idle_timeout: Duration,
    /// How long workers wait for connections to close on stop. Default: 5s.
    pub shutdown_grace: Duration,
    /// Codec settings.
    pub frame: FrameConfig,
    /// Options applied to accepted sockets.
    pub socket: SocketConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            transport: TransportBackend::default(),
            boss_threads: 1,
            worker_threads: num_cpus::get(),
            io_ratio: 70,
            max_connections: 100_000,
            outbound_queue: DEFAULT_QUEUE_CAPACITY,
            idle_timeout: Duration::from_secs(180),
            shutdown_grace: Duration::from_secs(5),
            frame: FrameConfig::default(),
            socket: SocketConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build from the loaded gateway configuration.
    pub fn from_config(config: &Config) -> std::io::Result<Self> {
        let server = &config.server;
        let codec = &config.codec;
        Ok(Self {
            bind_addr: resolve_bind_address(&server.host, server.port)?,
            transport: server.transport,
            boss_threads: server.boss_threads.max(1),
            worker_threads: if server.worker_threads == 0 {
                num_cpus::get()
            } else {
                server.worker_threads
            },
            io_ratio: server.io_ratio,
            max_connections: server.max_connections,
            outbound_queue: server.outbound_queue,
            idle_timeout: Duration::from_secs(server.idle_timeout_secs),
            frame: FrameConfig {
                max_frame_size: codec.max_frame_size,
                compression: CompressionConfig {
                    threshold: codec.compression_threshold,
                    enabled: codec.compression_enabled,
                },
            },
            ..Self::default()
        })
    }
}

/// Errors reported by lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Illegal lifecycle transition.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// An execution context could not be launched.
    #[error("failed to launch execution context: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Contexts owned by a started (or starting) server.
struct Running {
    acceptor_shutdown: watch::Sender<bool>,
    acceptor: Option<JoinHandle<()>>,
    workers: Option<WorkerPool>,
    local_addr: Option<SocketAddr>,
}

/// TCP server that accepts push connections and manages their lifecycle.
pub struct PushServer {
    config: ServerConfig,
    lifecycle: Arc<Lifecycle>,
    registry: Arc<ConnectionRegistry>,
    handler: Arc<dyn ConnectionHandler>,
    id_gen: Arc<IdGenerator>,
    running: Arc<Mutex<Option<Running>>>,
}

impl PushServer {
    /// Create a server. Connections are registered in `registry` and their
    /// frames delivered to `handler`.
    pub fn new(
        config: ServerConfig,
        registry: Arc<ConnectionRegistry>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        Self {
            config,
            lifecycle: Arc::new(Lifecycle::new()),
            registry,
            handler,
            id_gen: Arc::new(IdGenerator::new()),
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// `Created -> Initialized`.
    pub fn init(&self) -> Result<(), LifecycleError> {
        self.lifecycle.init()?;
        tracing::debug!("Push server initialized");
        Ok(())
    }

    /// Launch the worker pool and acceptor, then return.
    ///
    /// `on_result` is called from the acceptor thread once the listener is
    /// bound (with the bound address) or failed to bind. An illegal state is
    /// reported synchronously and `on_result` is not called.
    pub fn start<F>(&self, on_result: F) -> Result<(), LifecycleError>
    where
        F: FnOnce(Result<SocketAddr, ServerError>) + Send + 'static,
    {
        self.lifecycle.begin_start()?;
        let mut running = lock(&self.running);

        let ctx = Arc::new(ConnectionContext {
            registry: Arc::clone(&self.registry),
            handler: Arc::clone(&self.handler),
            frame_config: self.config.frame.clone(),
            socket_config: self.config.socket.clone(),
            idle_timeout: self.config.idle_timeout,
        });
        let workers = match WorkerPool::spawn(
            self.config.worker_threads,
            self.config.io_ratio,
            self.config.shutdown_grace,
            ctx,
        ) {
            Ok(workers) => workers,
            Err(e) => {
                tracing::error!("Failed to launch worker contexts: {e}");
                drop(running);
                on_result(Err(ServerError::Spawn(e)));
                return Ok(());
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let acceptor = Acceptor {
            bind_addr: self.config.bind_addr,
            transport: self.config.transport,
            dispatcher: workers.dispatcher(),
            id_gen: Arc::clone(&self.id_gen),
            lifecycle: Arc::clone(&self.lifecycle),
            running: Arc::clone(&self.running),
        };
        let callback: ResultCallback = Box::new(on_result);
        let callback = Arc::new(Mutex::new(Some(callback)));
        let launched = acceptor.launch(
            self.config.boss_threads,
            shutdown_rx,
            Arc::clone(&callback),
        );
        let handle = match launched {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("Failed to launch acceptor context: {e}");
                drop(running);
                workers.shutdown();
                if let Some(on_result) = lock(&callback).take() {
                    on_result(Err(ServerError::Spawn(e)));
                }
                return Ok(());
            }
        };

        *running = Some(Running {
            acceptor_shutdown: shutdown_tx,
            acceptor: Some(handle),
            workers: Some(workers),
            local_addr: None,
        });
        Ok(())
    }

    /// Stop accepting, close every connection, and block until all contexts
    /// have exited.
    ///
    /// `on_result` receives the released address, or the lifecycle error if
    /// the server was not running; the same error is also returned.
    pub fn stop<F>(&self, on_result: F) -> Result<(), LifecycleError>
    where
        F: FnOnce(Result<SocketAddr, ServerError>),
    {
        if let Err(e) = self.lifecycle.shutdown() {
            tracing::error!("Push server stop rejected: {e}");
            on_result(Err(ServerError::Lifecycle(e.clone())));
            return Err(e);
        }

        tracing::info!("Shutting down push server");
        let running = lock(&self.running).take();
        let mut released = self.config.bind_addr;

        if let Some(mut running) = running {
            released = running.local_addr.unwrap_or(released);

            // Acceptor first: no new connections while workers drain.
            let _ = running.acceptor_shutdown.send(true);
            if let Some(handle) = running.acceptor.take()
                && handle.join().is_err()
            {
                tracing::error!("Acceptor thread panicked");
            }

            if let Some(workers) = running.workers.take() {
                workers.shutdown();
            }
        }

        self.handler.on_shutdown();
        tracing::info!("Push server on {released} shutdown success");
        on_result(Ok(released));
        Ok(())
    }

    /// Whether the listener is bound and accepting.
    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        self.lifecycle.state()
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.running).as_ref().and_then(|r| r.local_addr)
    }

    /// Live connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Everything the acceptor thread owns.
struct Acceptor {
    bind_addr: SocketAddr,
    transport: TransportBackend,
    dispatcher: Arc<WorkerDispatcher>,
    id_gen: Arc<IdGenerator>,
    lifecycle: Arc<Lifecycle>,
    running: Arc<Mutex<Option<Running>>>,
}

type ResultCallback = Box<dyn FnOnce(Result<SocketAddr, ServerError>) + Send>;

impl Acceptor {
    /// Build the acceptor runtime and spawn its thread. The callback stays in
    /// `callback` until the thread takes it, so a failed launch can still
    /// report through it.
    fn launch(
        self,
        boss_threads: usize,
        shutdown: watch::Receiver<bool>,
        callback: Arc<Mutex<Option<ResultCallback>>>,
    ) -> std::io::Result<JoinHandle<()>> {
        let mut builder = if boss_threads > 1 {
            let mut builder = tokio::runtime::Builder::new_multi_thread();
            builder
                .worker_threads(boss_threads)
                .thread_name("pushgate-boss");
            builder
        } else {
            tokio::runtime::Builder::new_current_thread()
        };
        let runtime = builder
            .enable_all()
            .event_interval(event_interval_for(100))
            .build()?;

        std::thread::Builder::new()
            .name("pushgate-boss".to_string())
            .spawn(move || {
                let Some(on_result) = lock(&callback).take() else {
                    return;
                };
                self.run(runtime, shutdown, on_result);
            })
    }

    fn run(
        self,
        runtime: tokio::runtime::Runtime,
        shutdown: watch::Receiver<bool>,
        on_result: ResultCallback,
    ) {
        let listener = match runtime.block_on(bind_listener(self.bind_addr, self.transport)) {
            Ok(listener) => listener,
            Err(source) => {
                tracing::error!("Push server failed to bind {}: {source}", self.bind_addr);
                // Release the workers; the server stays in Starting.
                let workers = lock(&self.running)
                    .as_mut()
                    .and_then(|running| running.workers.take());
                if let Some(workers) = workers {
                    workers.shutdown();
                }
                on_result(Err(ServerError::Bind {
                    addr: self.bind_addr,
                    source,
                }));
                return;
            }
        };

        let local_addr = listener.local_addr().unwrap_or(self.bind_addr);
        if let Some(running) = lock(&self.running).as_mut() {
            running.local_addr = Some(local_addr);
        }
        if let Err(e) = self.lifecycle.finish_start() {
            tracing::error!("Push server could not enter Started: {e}");
            on_result(Err(e.into()));
            return;
        }

        tracing::info!(
            "Push server listening on {local_addr} ({:?}, {} workers)",
            self.transport,
            self.dispatcher.len()
        );
        on_result(Ok(local_addr));

        runtime.block_on(accept_loop(listener, &self.dispatcher, &self.id_gen, shutdown));
        tracing::debug!("Acceptor context stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: &WorkerDispatcher,
    id_gen: &IdGenerator,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let id = id_gen.next_id();
                    match stream.into_std() {
                        Ok(stream) => dispatcher.assign(Assignment { id, stream, peer }),
                        Err(e) => tracing::warn!("Failed to detach connection from {peer}: {e}"),
                    }
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
