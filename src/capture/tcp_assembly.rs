//! DNS over TCP reassembly
//!
//! Each direction of a connection gets a [`StreamSequencer`], which turns
//! segments into in-order bytes, and a [`DnsStreamFramer`], which cuts those
//! bytes into length-prefixed DNS messages. [`StreamAssembler`] owns the
//! per-flow state for one IP version inside a TCP shard.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::capture::decoder::{DatagramHeader, TcpSegment};
use crate::capture::{fnv1a64, fnv1a64_extend, IpVersion};
use crate::metrics::MetricsCollector;

/// In-order bytes released by the sequencer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub data: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A segment seen before the stream start was known
#[derive(Debug)]
struct HeldSegment {
    seq: u32,
    fin: bool,
    data: Vec<u8>,
    timestamp: Option<DateTime<Utc>>,
}

/// Orders one direction of a TCP stream.
///
/// The SYN fixes the start of the stream. Segments that arrive before it are
/// held and replayed once it shows up. A capture that starts mid-connection
/// never sees the SYN, so the held segments are anchored at the earliest of
/// them once the hold is full or the stream is flushed.
///
/// Positions are tracked relative to the start in 64 bits, so the stream
/// never wraps from the sequencer's point of view.
#[derive(Debug)]
pub struct StreamSequencer {
    base: Option<u32>,
    next: u64,
    held: Vec<HeldSegment>,
    pending: BTreeMap<u64, StreamChunk>,
    max_buffered: usize,
    fin_at: Option<u64>,
    retransmits: u64,
    dropped: u64,
}

impl StreamSequencer {
    pub fn new(max_buffered: usize) -> StreamSequencer {
        StreamSequencer {
            base: None,
            next: 0,
            held: Vec::new(),
            pending: BTreeMap::new(),
            max_buffered,
            fin_at: None,
            retransmits: 0,
            dropped: 0,
        }
    }

    /// Stream offset of an absolute sequence number. May be negative for
    /// data from before the stream start.
    fn relative(&self, base: u32, seq: u32) -> i64 {
        let expected = base.wrapping_add(self.next as u32);
        let delta = seq.wrapping_sub(expected) as i32;
        self.next as i64 + delta as i64
    }

    /// Feed one segment; returns whatever became contiguous.
    pub fn push(
        &mut self,
        seq: u32,
        syn: bool,
        fin: bool,
        payload: &[u8],
        timestamp: Option<DateTime<Utc>>,
    ) -> Vec<StreamChunk> {
        // SYN occupies one sequence number ahead of the data
        let data_seq = if syn { seq.wrapping_add(1) } else { seq };

        let mut out = Vec::new();
        let base = match self.base {
            Some(base) => base,
            None if syn => {
                self.base = Some(data_seq);
                self.replay_held(data_seq, &mut out);
                data_seq
            }
            None => {
                if payload.is_empty() && !fin {
                    return out;
                }
                self.held.push(HeldSegment {
                    seq: data_seq,
                    fin,
                    data: payload.to_vec(),
                    timestamp,
                });
                // no SYN in sight: stop waiting once the hold is full
                if self.held.len() > self.max_buffered {
                    return self.anchor_at_earliest();
                }
                return out;
            }
        };

        self.accept(base, data_seq, fin, payload, timestamp, &mut out);
        out
    }

    /// Start the stream at the earliest held segment when no SYN was seen.
    /// Returns the bytes that became contiguous.
    pub fn anchor_at_earliest(&mut self) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        if self.base.is_some() {
            return out;
        }

        let reference = match self.held.first() {
            Some(first) => first.seq,
            None => return out,
        };
        let earliest = self
            .held
            .iter()
            .map(|h| h.seq)
            .min_by_key(|&seq| seq.wrapping_sub(reference) as i32)
            .unwrap_or(reference);

        self.base = Some(earliest);
        self.replay_held(earliest, &mut out);
        out
    }

    fn replay_held(&mut self, base: u32, out: &mut Vec<StreamChunk>) {
        let mut held = std::mem::take(&mut self.held);
        held.sort_by_key(|h| h.seq.wrapping_sub(base) as i32);
        for h in held {
            self.accept(base, h.seq, h.fin, &h.data, h.timestamp, out);
        }
    }

    fn accept(
        &mut self,
        base: u32,
        data_seq: u32,
        fin: bool,
        payload: &[u8],
        timestamp: Option<DateTime<Utc>>,
        out: &mut Vec<StreamChunk>,
    ) {
        let start = self.relative(base, data_seq);
        let end = start + payload.len() as i64;

        if fin {
            self.fin_at = Some(end.max(0) as u64);
        }

        if payload.is_empty() {
            return;
        }

        let next = self.next as i64;
        if end <= next {
            self.retransmits += 1;
        } else if start <= next {
            let skip = (next - start) as usize;
            self.next = end as u64;
            out.push(StreamChunk {
                data: payload[skip..].to_vec(),
                timestamp,
            });
            self.release_pending(out);
        } else if self.pending.len() >= self.max_buffered {
            self.dropped += 1;
        } else {
            let keep_existing = self
                .pending
                .get(&(start as u64))
                .map_or(false, |existing| existing.data.len() >= payload.len());
            if !keep_existing {
                self.pending.insert(
                    start as u64,
                    StreamChunk {
                        data: payload.to_vec(),
                        timestamp,
                    },
                );
            }
        }
    }

    fn release_pending(&mut self, out: &mut Vec<StreamChunk>) {
        while let Some((&start, _)) = self.pending.iter().next() {
            if start > self.next {
                break;
            }
            let chunk = match self.pending.remove(&start) {
                Some(chunk) => chunk,
                None => break,
            };

            let end = start + chunk.data.len() as u64;
            if end <= self.next {
                continue;
            }

            let skip = (self.next - start) as usize;
            self.next = end;
            out.push(StreamChunk {
                data: chunk.data[skip..].to_vec(),
                timestamp: chunk.timestamp,
            });
        }
    }

    /// FIN seen and every byte before it delivered
    pub fn is_finished(&self) -> bool {
        self.fin_at.map_or(false, |fin_at| self.next >= fin_at)
    }

    /// Bytes waiting on a gap or on the stream start
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || !self.held.is_empty()
    }

    /// The stream start is known
    pub fn is_anchored(&self) -> bool {
        self.base.is_some()
    }

    pub fn retransmits(&self) -> u64 {
        self.retransmits
    }

    /// Segments refused because the out-of-order buffer was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    AwaitingLength,
    AwaitingBody(u16),
}

/// Splits a byte stream into DNS messages, each preceded by its length as a
/// big-endian u16.
#[derive(Debug)]
pub struct DnsStreamFramer {
    buffer: Vec<u8>,
    state: FrameState,
}

impl DnsStreamFramer {
    pub fn new() -> DnsStreamFramer {
        DnsStreamFramer {
            buffer: Vec::new(),
            state: FrameState::AwaitingLength,
        }
    }

    /// Append bytes and return every message they complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(data);

        let mut messages = Vec::new();
        let mut start = 0;
        loop {
            let available = self.buffer.len() - start;
            match self.state {
                FrameState::AwaitingLength => {
                    if available < 2 {
                        break;
                    }
                    let len = u16::from_be_bytes([self.buffer[start], self.buffer[start + 1]]);
                    self.state = FrameState::AwaitingBody(len);
                }
                FrameState::AwaitingBody(len) => {
                    let needed = len as usize + 2;
                    if available < needed {
                        break;
                    }
                    messages.push(self.buffer[start + 2..start + needed].to_vec());
                    start += needed;
                    self.state = FrameState::AwaitingLength;
                }
            }
        }

        self.buffer.drain(..start);
        messages
    }

    /// Bytes held back waiting for the rest of a message
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for DnsStreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// One direction of a TCP connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TcpFlowKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl TcpFlowKey {
    pub fn of(segment: &TcpSegment) -> TcpFlowKey {
        TcpFlowKey {
            src: segment.header.src,
            dst: segment.header.dst,
            src_port: segment.src_port,
            dst_port: segment.dst_port,
        }
    }
}

/// A complete DNS message cut out of a TCP stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedMessage {
    pub header: DatagramHeader,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Closed streams that still held undelivered bytes
    pub flushed: usize,
    pub closed: usize,
}

/// Result of closing idle streams
#[derive(Debug, Default)]
pub struct Flushed {
    /// Whole messages recovered from the closed streams
    pub messages: Vec<FramedMessage>,
    pub stats: FlushStats,
}

struct TcpStream {
    header: DatagramHeader,
    src_port: u16,
    dst_port: u16,
    sequencer: StreamSequencer,
    framer: DnsStreamFramer,
    last_seen: Instant,
}

impl TcpStream {
    fn holds_data(&self) -> bool {
        self.sequencer.has_pending() || self.framer.buffered() > 0
    }

    fn frame(&mut self, chunks: Vec<StreamChunk>, messages: &mut Vec<FramedMessage>) {
        for chunk in chunks {
            for payload in self.framer.push(&chunk.data) {
                messages.push(FramedMessage {
                    header: self.header.clone(),
                    src_port: self.src_port,
                    dst_port: self.dst_port,
                    payload,
                    timestamp: chunk.timestamp,
                });
            }
        }
    }

    /// Deliver what an idle stream can still give: held segments are anchored
    /// at the earliest one. Bytes behind a gap stay undelivered.
    fn close(mut self, messages: &mut Vec<FramedMessage>, stats: &mut FlushStats) {
        let chunks = self.sequencer.anchor_at_earliest();
        self.frame(chunks, messages);
        if self.holds_data() {
            stats.flushed += 1;
        }
        stats.closed += 1;
    }
}

pub struct StreamAssembler {
    version: IpVersion,
    streams: HashMap<TcpFlowKey, TcpStream>,
    // flows closed by FIN or RST, kept so late retransmissions are not
    // taken for a new stream
    recently_closed: HashMap<TcpFlowKey, Instant>,
    max_buffered: usize,
    metrics: MetricsCollector,
}

impl StreamAssembler {
    pub fn new(version: IpVersion, max_buffered: usize, metrics: MetricsCollector) -> StreamAssembler {
        StreamAssembler {
            version,
            streams: HashMap::new(),
            recently_closed: HashMap::new(),
            max_buffered,
            metrics,
        }
    }

    pub fn assemble(&mut self, segment: TcpSegment, now: Instant) -> Vec<FramedMessage> {
        let key = TcpFlowKey::of(&segment);

        if segment.rst {
            if self.streams.remove(&key).is_some() {
                self.metrics.record_tcp_event(self.version, "reset", 1);
            }
            self.recently_closed.insert(key, now);
            return Vec::new();
        }

        if segment.syn {
            self.recently_closed.remove(&key);
        } else if self.recently_closed.contains_key(&key) {
            self.metrics.record_tcp_event(self.version, "late", 1);
            return Vec::new();
        }

        if !self.streams.contains_key(&key) {
            // a bare ACK does not start a stream
            if segment.payload.is_empty() && !segment.syn && !segment.fin {
                return Vec::new();
            }
            self.metrics.record_tcp_event(self.version, "opened", 1);
        }

        let max_buffered = self.max_buffered;
        let stream = self.streams.entry(key.clone()).or_insert_with(|| TcpStream {
            header: segment.header.clone(),
            src_port: segment.src_port,
            dst_port: segment.dst_port,
            sequencer: StreamSequencer::new(max_buffered),
            framer: DnsStreamFramer::new(),
            last_seen: now,
        });
        stream.last_seen = now;

        let dropped_before = stream.sequencer.dropped();
        let chunks = stream.sequencer.push(
            segment.seq,
            segment.syn,
            segment.fin,
            &segment.payload,
            segment.timestamp,
        );
        if stream.sequencer.dropped() > dropped_before {
            self.metrics.record_tcp_event(self.version, "segment_dropped", 1);
        }

        let mut messages = Vec::new();
        stream.frame(chunks, &mut messages);

        if stream.sequencer.is_finished() {
            self.streams.remove(&key);
            self.recently_closed.insert(key, now);
            self.metrics.record_tcp_event(self.version, "closed", 1);
        }

        messages
    }

    /// Close streams idle since before `cutoff`. Whole messages they still
    /// hold are returned, partial ones are discarded. Closed-flow records
    /// older than `cutoff` are forgotten.
    pub fn flush_older_than(&mut self, cutoff: Instant) -> Flushed {
        let stale: Vec<TcpFlowKey> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.last_seen < cutoff)
            .map(|(key, _)| key.clone())
            .collect();

        let mut flushed = Flushed::default();
        for key in stale {
            if let Some(stream) = self.streams.remove(&key) {
                stream.close(&mut flushed.messages, &mut flushed.stats);
            }
        }
        self.recently_closed.retain(|_, closed_at| *closed_at >= cutoff);

        self.record_flush(flushed.stats);
        flushed
    }

    pub fn flush_all(&mut self) -> Flushed {
        let mut flushed = Flushed::default();
        for (_, stream) in self.streams.drain() {
            stream.close(&mut flushed.messages, &mut flushed.stats);
        }
        self.recently_closed.clear();

        self.record_flush(flushed.stats);
        flushed
    }

    fn record_flush(&self, stats: FlushStats) {
        if stats.closed > 0 {
            self.metrics
                .record_tcp_event(self.version, "expired", stats.closed as u64);
        }
        if stats.flushed > 0 {
            self.metrics
                .record_tcp_event(self.version, "flushed", stats.flushed as u64);
        }
    }

    /// Flows remembered as closed
    pub fn closed_len(&self) -> usize {
        self.recently_closed.len()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

fn endpoint_bytes(ip: IpAddr, port: u16) -> Vec<u8> {
    let mut bytes = match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    bytes.extend_from_slice(&port.to_be_bytes());
    bytes
}

/// Pick the TCP shard for a segment. Both directions of a connection land
/// on the same shard.
pub fn shard_for(segment: &TcpSegment, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }

    let a = endpoint_bytes(segment.header.src, segment.src_port);
    let b = endpoint_bytes(segment.header.dst, segment.dst_port);
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };

    let hash = fnv1a64_extend(fnv1a64(&lo), &hi);
    let hash = fnv1a64_extend(hash, &[segment.header.protocol]);

    (hash % shards as u64) as usize
}
