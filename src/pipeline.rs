//! Capture pipeline wiring
//!
//! ```text
//! source -> ingress -> decoders -+-> frag4 / frag6 -> defrag return -+-> tcp shards -> tcp return -+-> dispatcher -> sinks
//!                                +---------------------------------+-> results --------------------+
//! ```
//!
//! Every handoff is a bounded channel. The graph has no cycles, so shutdown
//! only has to stop the read loop: each stage exits once all senders of its
//! input channel are gone, and the drain ripples through to the sinks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use derive_more::{Display, Error, From};
use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::capture::decoder::{Decoded, IpFragment, LinkType, PacketDecoder, TcpSegment, UdpDatagram};
use crate::capture::defrag::{DefragError, IpDefragmenter, Reassembled};
use crate::capture::ingress::{IngressDecision, IngressFilter};
use crate::capture::source::{PacketSource, SourceError, SourceStats};
use crate::capture::tcp_assembly::{shard_for, Flushed, FramedMessage, StreamAssembler};
use crate::capture::{IpVersion, RawPacket, TransportProtocol};
use crate::config::{ConfigError, PipelineConfig};
use crate::metrics::MetricsCollector;
use crate::output::dispatch::{DispatchReport, Dispatcher, SinkReport};
use crate::output::{DnsResult, ResultBuilder, Sink};
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};

/// How often the read loop refreshes the source counters
const SOURCE_STATS_EVERY: u64 = 1024;

#[derive(Debug, Display, From, Error)]
pub enum PipelineError {
    Config(ConfigError),
    Source(SourceError),
}

type Result<T> = std::result::Result<T, PipelineError>;

/// What happened during one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub packets_read: u64,
    pub accepted: u64,
    pub ratio_skipped: u64,
    pub duplicates: u64,
    pub source: SourceStats,
    pub dispatched: u64,
    pub sinks: Vec<SinkReport>,
    /// False when the drain timed out and workers were aborted
    pub drained: bool,
}

#[derive(Debug, Default)]
struct ReadReport {
    packets_read: u64,
    accepted: u64,
    ratio_skipped: u64,
    duplicates: u64,
    source: SourceStats,
}

pub struct Pipeline {
    config: PipelineConfig,
    sinks: Vec<Box<dyn Sink>>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: MetricsCollector,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Pipeline> {
        config.validate()?;

        let shutdown = Arc::new(ShutdownCoordinator::new(config.shutdown_config()));

        Ok(Pipeline {
            config,
            sinks: Vec::new(),
            shutdown,
            metrics: MetricsCollector::new(),
        })
    }

    pub fn add_sink(&mut self, sink: Box<dyn Sink>) {
        self.sinks.push(sink);
    }

    pub fn shutdown_handle(&self) -> Arc<ShutdownCoordinator> {
        self.shutdown.clone()
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run until the source is exhausted or shutdown is triggered, then
    /// drain every stage.
    pub async fn run<S: PacketSource + 'static>(self, source: S) -> Result<PipelineReport> {
        let Pipeline {
            config,
            sinks,
            shutdown,
            metrics,
        } = self;

        let link_type = if config.no_ethernet {
            LinkType::RawIp
        } else {
            source.link_type()
        };

        log::info!(
            "starting pipeline: link={:?} port={} ratio={} dedup={} decoders={} tcp_shards={}",
            link_type,
            config.port,
            config.sample_ratio,
            config.dedup,
            config.decoder_workers,
            config.tcp_shards
        );

        let mut dispatcher = Dispatcher::new(config.sink_channel_size, metrics.clone());
        for sink in sinks {
            dispatcher.register(sink);
        }
        if dispatcher.live_sinks() == 0 {
            log::warn!("no usable sinks, results will be discarded");
        }

        let builder = ResultBuilder::from_config(&config, metrics.clone());
        let decoder = PacketDecoder::new(link_type, config.port, config.vxlan_port);

        let (packet_tx, packet_rx) = mpsc::channel::<RawPacket>(config.packet_channel_size);
        let (result_tx, result_rx) = mpsc::channel::<Arc<DnsResult>>(config.result_channel_size);
        let (frag4_tx, frag4_rx) = mpsc::channel::<IpFragment>(config.defrag_channel_size);
        let (frag6_tx, frag6_rx) = mpsc::channel::<IpFragment>(config.defrag_channel_size);
        let (reassembled_tx, reassembled_rx) =
            mpsc::channel::<Reassembled>(config.defrag_channel_size);
        let (framed_tx, framed_rx) = mpsc::channel::<FramedMessage>(config.tcp_return_channel_size);

        let mut shard_txs = Vec::with_capacity(config.tcp_shards);
        let mut shard_rxs = Vec::with_capacity(config.tcp_shards);
        for _ in 0..config.tcp_shards {
            let (tx, rx) = mpsc::channel::<TcpSegment>(config.tcp_channel_size);
            shard_txs.push(tx);
            shard_rxs.push(rx);
        }

        let mut dispatch = tokio::spawn(dispatcher.run(result_rx));
        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        workers.push(tokio::spawn(run_tcp_return(
            framed_rx,
            result_tx.clone(),
            builder.clone(),
            shutdown.clone(),
        )));

        for (index, rx) in shard_rxs.into_iter().enumerate() {
            workers.push(tokio::spawn(run_tcp_shard(
                index,
                rx,
                framed_tx.clone(),
                config.gc_interval(),
                config.tcp_max_buffered_segments,
                metrics.clone(),
                shutdown.clone(),
            )));
        }

        let routes = TransportRoutes {
            shards: shard_txs,
            results: result_tx,
            builder,
            metrics: metrics.clone(),
        };

        for (version, rx) in vec![(IpVersion::V4, frag4_rx), (IpVersion::V6, frag6_rx)] {
            let defrag = Arc::new(IpDefragmenter::new(version));
            let (done_tx, done_rx) = oneshot::channel();

            workers.push(tokio::spawn(run_defrag_gc(
                defrag.clone(),
                config.gc_interval(),
                done_rx,
                metrics.clone(),
            )));
            workers.push(tokio::spawn(run_defrag(
                defrag,
                rx,
                reassembled_tx.clone(),
                done_tx,
                metrics.clone(),
                shutdown.clone(),
            )));
        }

        workers.push(tokio::spawn(run_defrag_return(
            reassembled_rx,
            decoder.clone(),
            routes.clone(),
            shutdown.clone(),
        )));

        let packet_rx = Arc::new(Mutex::new(packet_rx));
        for id in 0..config.decoder_workers {
            workers.push(tokio::spawn(run_decoder(
                id,
                decoder.clone(),
                packet_rx.clone(),
                frag4_tx.clone(),
                frag6_tx.clone(),
                routes.clone(),
                shutdown.clone(),
            )));
        }

        // only the workers keep senders alive from here on
        drop(routes);
        drop(frag4_tx);
        drop(frag6_tx);
        drop(reassembled_tx);
        drop(framed_tx);

        let stats_task = if config.stats_interval_secs > 0 {
            let metrics = metrics.clone();
            let interval = config.stats_interval();
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    metrics.snapshot().log();
                }
            }))
        } else {
            None
        };

        let filter = IngressFilter::from_config(&config, Instant::now());
        let signal = shutdown.subscribe();
        let reader_metrics = metrics.clone();
        let runtime = Handle::current();
        let mut reader = tokio::task::spawn_blocking(move || {
            read_loop(source, packet_tx, filter, signal, runtime, reader_metrics)
        });

        // a source blocked inside `read_one` cannot be interrupted, so once
        // shutdown starts the reader gets one drain timeout to return
        let mut stop = shutdown.subscribe();
        let joined = tokio::select! {
            joined = &mut reader => Some(joined),
            _ = stop.recv() => {
                match tokio::time::timeout(shutdown.drain_timeout(), &mut reader).await {
                    Ok(joined) => Some(joined),
                    Err(_) => {
                        log::warn!("packet read loop did not stop within the drain timeout");
                        None
                    }
                }
            }
        };
        let reader_stopped = joined.is_some();

        let (read, read_error) = match joined {
            Some(Ok(outcome)) => outcome,
            Some(Err(e)) => {
                log::error!("packet read loop failed: {}", e);
                (ReadReport::default(), None)
            }
            None => (ReadReport::default(), None),
        };

        log::info!(
            "read loop finished after {} packets, draining",
            read.packets_read
        );

        let mut dispatch_report: Option<DispatchReport> = None;
        // a stuck reader still holds the packet sender, nothing downstream
        // can finish
        let drained = reader_stopped
            && shutdown
                .drain(async {
                    for result in join_all(workers.iter_mut()).await {
                        if let Err(e) = result {
                            log::error!("pipeline worker failed: {}", e);
                        }
                    }
                    match (&mut dispatch).await {
                        Ok(report) => dispatch_report = Some(report),
                        Err(e) => log::error!("dispatcher failed: {}", e),
                    }
                })
                .await
                .is_ok();

        if !drained {
            for worker in &workers {
                worker.abort();
            }
            dispatch.abort();
        }
        if let Some(stats_task) = stats_task {
            stats_task.abort();
        }

        metrics.snapshot().log();

        if let Some(e) = read_error {
            return Err(e.into());
        }

        let dispatch_report = dispatch_report.unwrap_or_default();
        Ok(PipelineReport {
            packets_read: read.packets_read,
            accepted: read.accepted,
            ratio_skipped: read.ratio_skipped,
            duplicates: read.duplicates,
            source: read.source,
            dispatched: dispatch_report.dispatched,
            sinks: dispatch_report.sinks,
            drained,
        })
    }
}

/// Arrival time for reassembly state. Follows the runtime clock, so GC
/// ticks and the ages they compare against share one time source.
fn state_clock() -> Instant {
    tokio::time::Instant::now().into_std()
}

enum Handoff {
    Sent,
    Closed,
    Cancelled,
}

/// Queue a packet for the decoders from the blocking reader thread. A full
/// queue is waited on until space frees up or shutdown is triggered.
fn hand_off(
    packets: &mpsc::Sender<RawPacket>,
    packet: RawPacket,
    signal: &mut ShutdownSignal,
    runtime: &Handle,
) -> Handoff {
    let packet = match packets.try_send(packet) {
        Ok(()) => return Handoff::Sent,
        Err(TrySendError::Closed(_)) => return Handoff::Closed,
        Err(TrySendError::Full(packet)) => packet,
    };

    runtime.block_on(async {
        tokio::select! {
            sent = packets.send(packet) => match sent {
                Ok(()) => Handoff::Sent,
                Err(_) => Handoff::Closed,
            },
            _ = signal.recv() => Handoff::Cancelled,
        }
    })
}

/// Blocking read loop. A source that blocks inside `read_one` only sees the
/// shutdown signal once its next packet or timeout arrives.
fn read_loop<S: PacketSource>(
    mut source: S,
    packets: mpsc::Sender<RawPacket>,
    mut filter: IngressFilter,
    mut signal: ShutdownSignal,
    runtime: Handle,
    metrics: MetricsCollector,
) -> (ReadReport, Option<SourceError>) {
    let mut report = ReadReport::default();
    let mut error = None;

    loop {
        if signal.is_triggered() {
            log::info!("shutdown requested, stopping packet read loop");
            break;
        }

        let packet = match source.read_one() {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                log::info!("packet source exhausted");
                break;
            }
            Err(e) => {
                log::error!("packet source failed: {}", e);
                error = Some(e);
                break;
            }
        };

        report.packets_read += 1;
        metrics.record_packet("captured");
        if report.packets_read % SOURCE_STATS_EVERY == 0 {
            let stats = source.stats();
            metrics.update_source_stats(stats.received, stats.dropped);
        }

        match filter.check(&packet.data, Instant::now()) {
            IngressDecision::Accept => {
                report.accepted += 1;
                match hand_off(&packets, packet, &mut signal, &runtime) {
                    Handoff::Sent => {}
                    Handoff::Closed => {
                        log::warn!("decoders stopped, ending read loop");
                        break;
                    }
                    Handoff::Cancelled => {
                        log::info!("shutdown requested while decoders were busy, stopping packet read loop");
                        break;
                    }
                }
            }
            IngressDecision::SkipRatio => {
                report.ratio_skipped += 1;
                metrics.record_ingress_rejected("ratio");
            }
            IngressDecision::Duplicate => {
                report.duplicates += 1;
                metrics.record_ingress_rejected("duplicate");
            }
        }
    }

    report.source = source.stats();
    metrics.update_source_stats(report.source.received, report.source.dropped);

    (report, error)
}

/// Senders for payloads whose transport layer is known
#[derive(Clone)]
struct TransportRoutes {
    shards: Vec<mpsc::Sender<TcpSegment>>,
    results: mpsc::Sender<Arc<DnsResult>>,
    builder: ResultBuilder,
    metrics: MetricsCollector,
}

impl TransportRoutes {
    /// Returns false once the downstream channel is closed
    async fn forward_udp(&self, datagram: UdpDatagram) -> bool {
        self.metrics.record_packet("udp");

        let result = self.builder.build(
            &datagram.header,
            datagram.src_port,
            datagram.dst_port,
            TransportProtocol::Udp,
            &datagram.payload,
            datagram.timestamp,
        );

        match result {
            Some(result) => self.results.send(Arc::new(result)).await.is_ok(),
            None => true,
        }
    }

    async fn forward_tcp(&self, segment: TcpSegment) -> bool {
        self.metrics.record_packet("tcp");

        let shard = shard_for(&segment, self.shards.len());
        self.shards[shard].send(segment).await.is_ok()
    }
}

async fn run_decoder(
    id: usize,
    decoder: PacketDecoder,
    packets: Arc<Mutex<mpsc::Receiver<RawPacket>>>,
    frag4: mpsc::Sender<IpFragment>,
    frag6: mpsc::Sender<IpFragment>,
    routes: TransportRoutes,
    shutdown: Arc<ShutdownCoordinator>,
) {
    let _guard = shutdown.register_worker();
    let metrics = routes.metrics.clone();

    loop {
        let packet = {
            let mut packets = packets.lock().await;
            packets.recv().await
        };
        let packet = match packet {
            Some(packet) => packet,
            None => break,
        };

        let open = match decoder.decode(&packet) {
            Ok(Decoded::Fragment(fragment)) => {
                metrics.record_packet("fragment");
                let queue = match fragment.header.version {
                    IpVersion::V4 => &frag4,
                    IpVersion::V6 => &frag6,
                };
                queue.send(fragment).await.is_ok()
            }
            Ok(Decoded::Udp(datagram)) => routes.forward_udp(datagram).await,
            Ok(Decoded::Tcp(segment)) => routes.forward_tcp(segment).await,
            Ok(Decoded::Ignored) => {
                metrics.record_packet("ignored");
                true
            }
            Err(e) => {
                log::trace!("decoder {}: {}", id, e);
                metrics.record_decode_error("raw");
                true
            }
        };

        if !open {
            log::warn!("decoder {}: downstream closed", id);
            break;
        }
    }

    log::debug!("decoder {} finished", id);
}

async fn run_defrag(
    defrag: Arc<IpDefragmenter>,
    mut fragments: mpsc::Receiver<IpFragment>,
    reassembled: mpsc::Sender<Reassembled>,
    done: oneshot::Sender<()>,
    metrics: MetricsCollector,
    shutdown: Arc<ShutdownCoordinator>,
) {
    let _guard = shutdown.register_worker();
    let version = defrag.version();

    while let Some(fragment) = fragments.recv().await {
        match defrag.submit(fragment, state_clock()) {
            Ok(Some(datagram)) => {
                metrics.record_fragment(version, "reassembled");
                if reassembled.send(datagram).await.is_err() {
                    break;
                }
            }
            Ok(None) => metrics.record_fragment(version, "buffered"),
            Err(e @ DefragError::HoleDetected { .. }) => {
                log::debug!("{} reassembly stalled: {}", version, e);
                metrics.record_fragment(version, "hole");
            }
            Err(e) => {
                log::warn!("{} fragment rejected: {}", version, e);
                metrics.record_fragment(version, "rejected");
            }
        }
    }

    log::debug!("{} reassembler finished with {} lists pending", version, defrag.len());
    drop(done);
}

async fn run_defrag_gc(
    defrag: Arc<IpDefragmenter>,
    interval: Duration,
    mut done: oneshot::Receiver<()>,
    metrics: MetricsCollector,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut done => break,
            _ = ticker.tick() => {
                let cutoff = match state_clock().checked_sub(interval) {
                    Some(cutoff) => cutoff,
                    None => continue,
                };
                let discarded = defrag.discard_older_than(cutoff);
                if discarded > 0 {
                    metrics.record_fragments_expired(defrag.version(), discarded);
                }
            }
        }
    }
}

/// Second decode pass over reassembled datagrams
async fn run_defrag_return(
    mut datagrams: mpsc::Receiver<Reassembled>,
    decoder: PacketDecoder,
    routes: TransportRoutes,
    shutdown: Arc<ShutdownCoordinator>,
) {
    let _guard = shutdown.register_worker();

    while let Some(datagram) = datagrams.recv().await {
        let open = match decoder.decode_reassembled(&datagram) {
            Ok(Decoded::Udp(udp)) => routes.forward_udp(udp).await,
            Ok(Decoded::Tcp(segment)) => routes.forward_tcp(segment).await,
            Ok(_) => true,
            Err(e) => {
                log::debug!("reassembled datagram dropped: {}", e);
                routes.metrics.record_decode_error("reassembled");
                true
            }
        };

        if !open {
            break;
        }
    }
}

/// Log a flush and pass on the messages it recovered. Returns false once the
/// return pass is gone.
async fn forward_flushed(
    shard: usize,
    version: IpVersion,
    flushed: Flushed,
    framed: &mpsc::Sender<FramedMessage>,
) -> bool {
    let stats = flushed.stats;
    if stats.flushed > 0 || stats.closed > 0 {
        log::info!(
            "tcp shard {}: {} flushed: {}, closed: {}, recovered: {}",
            shard,
            version,
            stats.flushed,
            stats.closed,
            flushed.messages.len()
        );
    }

    for message in flushed.messages {
        if framed.send(message).await.is_err() {
            return false;
        }
    }
    true
}

async fn run_tcp_shard(
    index: usize,
    mut segments: mpsc::Receiver<TcpSegment>,
    framed: mpsc::Sender<FramedMessage>,
    gc_interval: Duration,
    max_buffered: usize,
    metrics: MetricsCollector,
    shutdown: Arc<ShutdownCoordinator>,
) {
    let _guard = shutdown.register_worker();
    let mut v4 = StreamAssembler::new(IpVersion::V4, max_buffered, metrics.clone());
    let mut v6 = StreamAssembler::new(IpVersion::V6, max_buffered, metrics);

    let mut ticker = tokio::time::interval(gc_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            segment = segments.recv() => {
                let segment = match segment {
                    Some(segment) => segment,
                    None => break,
                };
                let assembler = match segment.header.version {
                    IpVersion::V4 => &mut v4,
                    IpVersion::V6 => &mut v6,
                };
                for message in assembler.assemble(segment, state_clock()) {
                    if framed.send(message).await.is_err() {
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if let Some(cutoff) = state_clock().checked_sub(gc_interval) {
                    let stale_v4 = v4.flush_older_than(cutoff);
                    let stale_v6 = v6.flush_older_than(cutoff);
                    if !forward_flushed(index, IpVersion::V4, stale_v4, &framed).await {
                        return;
                    }
                    if !forward_flushed(index, IpVersion::V6, stale_v6, &framed).await {
                        return;
                    }
                }
            }
        }
    }

    if forward_flushed(index, IpVersion::V4, v4.flush_all(), &framed).await {
        forward_flushed(index, IpVersion::V6, v6.flush_all(), &framed).await;
    }
}

/// Parse framed TCP messages into results
async fn run_tcp_return(
    mut messages: mpsc::Receiver<FramedMessage>,
    results: mpsc::Sender<Arc<DnsResult>>,
    builder: ResultBuilder,
    shutdown: Arc<ShutdownCoordinator>,
) {
    let _guard = shutdown.register_worker();

    while let Some(message) = messages.recv().await {
        let result = builder.build(
            &message.header,
            message.src_port,
            message.dst_port,
            TransportProtocol::Tcp,
            &message.payload,
            message.timestamp,
        );

        if let Some(result) = result {
            if results.send(Arc::new(result)).await.is_err() {
                break;
            }
        }
    }
}
