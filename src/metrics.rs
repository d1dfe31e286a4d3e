//! Prometheus Metrics Module
//!
//! Counters for every drop, evict and delivery decision the pipeline makes.
//! Exporting them is left to the embedding process; `gather_text` renders the
//! default registry for logs and tests.

use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounter,
    IntCounterVec, IntGaugeVec, TextEncoder,
};

use crate::capture::IpVersion;

lazy_static! {
    /// Packets seen at each pipeline stage
    pub static ref PACKETS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dnsscope_packets_total",
        "Packets observed per pipeline stage",
        &["stage"]
    ).unwrap();

    /// Packets rejected by the ingress filter
    pub static ref INGRESS_REJECTED: IntCounterVec = register_int_counter_vec!(
        "dnsscope_ingress_rejected_total",
        "Packets rejected before decoding",
        &["reason"]
    ).unwrap();

    /// Packets dropped because a header failed to decode
    pub static ref DECODE_ERRORS: IntCounterVec = register_int_counter_vec!(
        "dnsscope_decode_errors_total",
        "Packets dropped on malformed link, IP or transport headers",
        &["path"]
    ).unwrap();

    /// Fragment reassembly outcomes
    pub static ref FRAGMENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dnsscope_fragments_total",
        "IP fragments by reassembly outcome",
        &["ip_version", "outcome"]
    ).unwrap();

    /// TCP stream events
    pub static ref TCP_STREAMS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dnsscope_tcp_streams_total",
        "TCP stream assembly events",
        &["ip_version", "event"]
    ).unwrap();

    /// Payloads that were not valid DNS
    pub static ref DNS_PARSE_ERRORS: IntCounter = register_int_counter!(
        "dnsscope_dns_parse_errors_total",
        "Payloads dropped because they did not parse as DNS"
    ).unwrap();

    /// Results handed to the dispatcher
    pub static ref RESULTS_TOTAL: IntCounter = register_int_counter!(
        "dnsscope_results_total",
        "DNS results built and dispatched"
    ).unwrap();

    /// Results accepted by each sink
    pub static ref SINK_RESULTS: IntCounterVec = register_int_counter_vec!(
        "dnsscope_sink_results_total",
        "DNS results written per sink",
        &["sink", "status"]
    ).unwrap();

    /// Counters reported by the packet source itself
    pub static ref SOURCE_PACKETS: IntGaugeVec = register_int_gauge_vec!(
        "dnsscope_source_packets",
        "Packet counters reported by the capture source",
        &["kind"]
    ).unwrap();
}

fn version_label(version: IpVersion) -> &'static str {
    match version {
        IpVersion::V4 => "ipv4",
        IpVersion::V6 => "ipv6",
    }
}

/// Handle through which workers record pipeline events
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    start_time: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    pub fn record_packet(&self, stage: &str) {
        PACKETS_TOTAL.with_label_values(&[stage]).inc();
    }

    pub fn record_ingress_rejected(&self, reason: &str) {
        INGRESS_REJECTED.with_label_values(&[reason]).inc();
    }

    pub fn record_decode_error(&self, path: &str) {
        DECODE_ERRORS.with_label_values(&[path]).inc();
    }

    pub fn record_fragment(&self, version: IpVersion, outcome: &str) {
        FRAGMENTS_TOTAL
            .with_label_values(&[version_label(version), outcome])
            .inc();
    }

    pub fn record_fragments_expired(&self, version: IpVersion, count: usize) {
        FRAGMENTS_TOTAL
            .with_label_values(&[version_label(version), "expired"])
            .inc_by(count as u64);
    }

    pub fn record_tcp_event(&self, version: IpVersion, event: &str, count: u64) {
        TCP_STREAMS_TOTAL
            .with_label_values(&[version_label(version), event])
            .inc_by(count);
    }

    pub fn record_dns_parse_error(&self) {
        DNS_PARSE_ERRORS.inc();
    }

    pub fn record_result(&self) {
        RESULTS_TOTAL.inc();
    }

    pub fn record_sink_result(&self, sink: &str, ok: bool) {
        let status = if ok { "ok" } else { "error" };
        SINK_RESULTS.with_label_values(&[sink, status]).inc();
    }

    pub fn update_source_stats(&self, received: u64, dropped: u64) {
        SOURCE_PACKETS
            .with_label_values(&["received"])
            .set(received as i64);
        SOURCE_PACKETS
            .with_label_values(&["dropped"])
            .set(dropped as i64);
    }

    /// Snapshot of the headline counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            captured: PACKETS_TOTAL.with_label_values(&["captured"]).get(),
            ratio_skipped: INGRESS_REJECTED.with_label_values(&["ratio"]).get(),
            duplicates: INGRESS_REJECTED.with_label_values(&["duplicate"]).get(),
            decode_errors: DECODE_ERRORS.with_label_values(&["raw"]).get(),
            dns_parse_errors: DNS_PARSE_ERRORS.get(),
            results: RESULTS_TOTAL.get(),
            source_received: SOURCE_PACKETS.with_label_values(&["received"]).get(),
            source_dropped: SOURCE_PACKETS.with_label_values(&["dropped"]).get(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub captured: u64,
    pub ratio_skipped: u64,
    pub duplicates: u64,
    pub decode_errors: u64,
    pub dns_parse_errors: u64,
    pub results: u64,
    pub source_received: i64,
    pub source_dropped: i64,
}

impl StatsSnapshot {
    pub fn log(&self) {
        log::info!(
            "stats: uptime={}s captured={} ratio_skipped={} duplicates={} decode_errors={} dns_parse_errors={} results={} source_received={} source_dropped={}",
            self.uptime_secs,
            self.captured,
            self.ratio_skipped,
            self.duplicates,
            self.decode_errors,
            self.dns_parse_errors,
            self.results,
            self.source_received,
            self.source_dropped
        );
    }
}

/// Render the default registry in the Prometheus text format
pub fn gather_text() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}
