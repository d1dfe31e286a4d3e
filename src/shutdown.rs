//! Cooperative shutdown for the capture pipeline
//!
//! One signal stops the packet read loop. Every downstream stage then drains
//! on its own as its input channel closes, so the coordinator only has to
//! bound how long that drain may take.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use derive_more::{Display, Error};
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Shutdown coordinator for the pipeline's workers
pub struct ShutdownCoordinator {
    /// Flag indicating shutdown has been initiated
    shutting_down: Arc<AtomicBool>,
    /// Broadcast channel for shutdown notifications
    shutdown_tx: broadcast::Sender<()>,
    /// Workers that have not yet finished draining
    active_workers: Arc<AtomicUsize>,
    config: ShutdownConfig,
}

/// Configuration for graceful shutdown
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Maximum time to wait for in-flight state to drain
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum ShutdownError {
    #[display(fmt = "shutdown already in progress")]
    AlreadyShuttingDown,
    #[display(fmt = "drain timeout exceeded with {} workers still running", remaining)]
    Timeout { remaining: usize },
}

impl ShutdownCoordinator {
    pub fn new(config: ShutdownConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shutting_down: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            active_workers: Arc::new(AtomicUsize::new(0)),
            config,
        }
    }

    /// Subscribe to the shutdown notification
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            flag: self.shutting_down.clone(),
            rx: self.shutdown_tx.subscribe(),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        self.config.drain_timeout
    }

    /// Track a running worker until the returned guard is dropped
    pub fn register_worker(&self) -> WorkerGuard {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
        WorkerGuard {
            counter: self.active_workers.clone(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    /// Initiate shutdown. The flag is raised before subscribers are woken so
    /// a signal subscribed late still observes it.
    pub fn trigger(&self) -> Result<(), ShutdownError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Err(ShutdownError::AlreadyShuttingDown);
        }

        log::info!("Initiating graceful shutdown");

        // nobody listening is fine: the flag is already set
        let _ = self.shutdown_tx.send(());

        Ok(())
    }

    /// Wait for `drained` to finish, bounded by the drain timeout
    pub async fn drain<F>(&self, drained: F) -> Result<(), ShutdownError>
    where
        F: Future<Output = ()>,
    {
        log::debug!("Draining {} workers", self.worker_count());

        match timeout(self.config.drain_timeout, drained).await {
            Ok(()) => {
                log::info!("Pipeline drained");
                Ok(())
            }
            Err(_) => {
                let remaining = self.worker_count();
                log::warn!(
                    "Drain timeout reached, {} workers still active",
                    remaining
                );
                Err(ShutdownError::Timeout { remaining })
            }
        }
    }

    /// Install signal handlers that trigger shutdown on SIGINT/SIGTERM
    pub fn install_signal_handlers(self: Arc<Self>) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let shutdown = self.clone();
            tokio::spawn(async move {
                let (mut sigterm, mut sigint) =
                    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                        (Ok(term), Ok(int)) => (term, int),
                        (Err(e), _) | (_, Err(e)) => {
                            log::error!("Failed to register signal handlers: {}", e);
                            return;
                        }
                    };

                tokio::select! {
                    _ = sigterm.recv() => {
                        log::info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        log::info!("Received SIGINT, initiating graceful shutdown");
                    }
                }

                if let Err(e) = shutdown.trigger() {
                    log::warn!("Shutdown error: {}", e);
                }
            });
        }

        #[cfg(not(unix))]
        {
            let shutdown = self.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::error!("Failed to register Ctrl+C handler: {}", e);
                    return;
                }
                log::info!("Received Ctrl+C, initiating graceful shutdown");

                if let Err(e) = shutdown.trigger() {
                    log::warn!("Shutdown error: {}", e);
                }
            });
        }
    }
}

/// Receiving half of the shutdown notification
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    rx: broadcast::Receiver<()>,
}

impl ShutdownSignal {
    /// Resolves once shutdown has been triggered, immediately if it already was
    pub async fn recv(&mut self) {
        if self.flag.load(Ordering::SeqCst) {
            return;
        }

        // a lagged or closed channel also means the coordinator is done
        let _ = self.rx.recv().await;
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Guard for tracking a running worker
pub struct WorkerGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
