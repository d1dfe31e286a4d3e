//! Fan-out of finished results to every registered sink
//!
//! Every sink gets its own bounded queue and a blocking worker draining it.
//! The dispatcher awaits each queue in turn, so a sink that falls behind
//! eventually pushes back on the whole pipeline instead of losing records.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::metrics::MetricsCollector;
use crate::output::{DnsResult, Sink};

/// Dispatcher side of one sink
pub struct SinkRegistration {
    pub name: String,
    sender: mpsc::Sender<Arc<DnsResult>>,
    live: bool,
}

impl SinkRegistration {
    pub fn is_live(&self) -> bool {
        self.live
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkReport {
    pub name: String,
    pub written: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub dispatched: u64,
    pub sinks: Vec<SinkReport>,
}

pub struct Dispatcher {
    registry: Vec<SinkRegistration>,
    workers: Vec<JoinHandle<SinkReport>>,
    channel_size: usize,
    metrics: MetricsCollector,
}

impl Dispatcher {
    pub fn new(channel_size: usize, metrics: MetricsCollector) -> Dispatcher {
        Dispatcher {
            registry: Vec::new(),
            workers: Vec::new(),
            channel_size,
            metrics,
        }
    }

    /// Initialize `sink` and start its worker. A sink that fails to
    /// initialize is left out for good; returns whether it was registered.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(&mut self, mut sink: Box<dyn Sink>) -> bool {
        let name = sink.name().to_string();

        if let Err(e) = sink.initialize() {
            log::warn!("sink {} failed to initialize, removing it: {}", name, e);
            return false;
        }

        let (sender, receiver) = mpsc::channel(self.channel_size);
        let metrics = self.metrics.clone();
        let worker = tokio::task::spawn_blocking(move || run_sink(sink, receiver, metrics));

        log::info!("sink {} registered", name);
        self.registry.push(SinkRegistration {
            name,
            sender,
            live: true,
        });
        self.workers.push(worker);

        true
    }

    pub fn registrations(&self) -> &[SinkRegistration] {
        &self.registry
    }

    pub fn live_sinks(&self) -> usize {
        self.registry.iter().filter(|r| r.live).count()
    }

    /// Hand one result to every live sink, waiting on full queues.
    pub async fn deliver(&mut self, result: Arc<DnsResult>) {
        for registration in self.registry.iter_mut().filter(|r| r.live) {
            if registration.sender.send(result.clone()).await.is_err() {
                log::warn!("sink {} stopped receiving, removing it", registration.name);
                registration.live = false;
            }
        }
    }

    /// Deliver everything from `results` until it closes, then close every
    /// sink queue and wait for the sink workers to finish.
    pub async fn run(mut self, mut results: mpsc::Receiver<Arc<DnsResult>>) -> DispatchReport {
        let mut dispatched = 0;
        while let Some(result) = results.recv().await {
            self.deliver(result).await;
            self.metrics.record_result();
            dispatched += 1;
        }

        let Dispatcher {
            registry, workers, ..
        } = self;
        drop(registry);

        let mut sinks = Vec::with_capacity(workers.len());
        for worker in workers {
            match worker.await {
                Ok(report) => sinks.push(report),
                Err(e) => log::error!("sink worker failed: {}", e),
            }
        }

        log::debug!("dispatcher finished after {} results", dispatched);
        DispatchReport { dispatched, sinks }
    }
}

fn run_sink(
    mut sink: Box<dyn Sink>,
    mut queue: mpsc::Receiver<Arc<DnsResult>>,
    metrics: MetricsCollector,
) -> SinkReport {
    let mut report = SinkReport {
        name: sink.name().to_string(),
        written: 0,
        failed: 0,
    };

    while let Some(result) = queue.blocking_recv() {
        match sink.write(result) {
            Ok(()) => {
                report.written += 1;
                metrics.record_sink_result(&report.name, true);
            }
            Err(e) => {
                report.failed += 1;
                metrics.record_sink_result(&report.name, false);
                log::warn!("sink {} write failed: {}", report.name, e);
            }
        }
    }

    if let Err(e) = sink.close() {
        log::warn!("sink {} failed to close: {}", report.name, e);
    }
    log::info!(
        "sink {} closed: {} written, {} failed",
        report.name,
        report.written,
        report.failed
    );

    report
}
