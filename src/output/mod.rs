//! Finished DNS records and the sinks that consume them

pub mod dispatch;
pub mod json;

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use derive_more::{Display, Error};
use ipnetwork::IpNetwork;
use serde_derive::Serialize;

use crate::capture::decoder::DatagramHeader;
use crate::capture::{IpVersion, TransportProtocol};
use crate::config::PipelineConfig;
use crate::dns::protocol::DnsPacket;
use crate::metrics::MetricsCollector;

#[derive(Debug, Display, Error)]
pub enum SinkError {
    #[display(fmt = "sink I/O error: {}", _0)]
    Io(std::io::Error),
    #[display(fmt = "failed to serialize result: {}", _0)]
    Serialize(serde_json::Error),
    #[display(fmt = "sink is unusable: {}", reason)]
    Unusable { reason: String },
}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        SinkError::Io(e)
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(e: serde_json::Error) -> Self {
        SinkError::Serialize(e)
    }
}

/// One observed DNS message. Shared read-only between sinks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsResult {
    pub timestamp: DateTime<Utc>,
    pub dns: DnsPacket,
    pub ip_version: u8,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub protocol: TransportProtocol,
    /// Length of the DNS payload on the wire
    pub packet_length: usize,
    pub server: Option<String>,
}

/// Consumer of finished results.
///
/// Each sink runs on its own blocking thread, so `write` may block.
pub trait Sink: Send + 'static {
    fn name(&self) -> &str;

    /// Called once before any result. An error removes the sink for the
    /// rest of the run.
    fn initialize(&mut self) -> Result<(), SinkError>;

    fn write(&mut self, result: Arc<DnsResult>) -> Result<(), SinkError>;

    fn close(&mut self) -> Result<(), SinkError>;
}

/// Turns transport payloads into `DnsResult`s
#[derive(Debug, Clone)]
pub struct ResultBuilder {
    mask_size4: u8,
    mask_size6: u8,
    server: Option<String>,
    metrics: MetricsCollector,
}

impl ResultBuilder {
    pub fn new(mask_size4: u8, mask_size6: u8, server: Option<String>, metrics: MetricsCollector) -> Self {
        ResultBuilder {
            mask_size4,
            mask_size6,
            server,
            metrics,
        }
    }

    pub fn from_config(config: &PipelineConfig, metrics: MetricsCollector) -> Self {
        let server = if config.server_name.is_empty() {
            None
        } else {
            Some(config.server_name.clone())
        };

        ResultBuilder::new(config.mask_size4, config.mask_size6, server, metrics)
    }

    /// Keep only the first `mask` bits of an address
    fn mask(&self, ip: IpAddr) -> IpAddr {
        let prefix = match ip {
            IpAddr::V4(_) => self.mask_size4,
            IpAddr::V6(_) => self.mask_size6,
        };

        IpNetwork::new(ip, prefix)
            .map(|net| net.network())
            .unwrap_or(ip)
    }

    /// Parse `payload` as DNS and wrap it. Returns `None` for anything that
    /// does not parse.
    pub fn build(
        &self,
        header: &DatagramHeader,
        src_port: u16,
        dst_port: u16,
        protocol: TransportProtocol,
        payload: &[u8],
        timestamp: Option<DateTime<Utc>>,
    ) -> Option<DnsResult> {
        let dns = match DnsPacket::from_bytes(payload) {
            Ok(dns) => dns,
            Err(e) => {
                log::trace!("dropping {} payload from {}: {}", protocol, header.src, e);
                self.metrics.record_dns_parse_error();
                return None;
            }
        };

        Some(DnsResult {
            timestamp: timestamp.unwrap_or_else(Utc::now),
            dns,
            ip_version: match header.version {
                IpVersion::V4 => 4,
                IpVersion::V6 => 6,
            },
            src_ip: self.mask(header.src),
            dst_ip: self.mask(header.dst),
            src_port: Some(src_port),
            dst_port: Some(dst_port),
            protocol,
            packet_length: payload.len(),
            server: self.server.clone(),
        })
    }
}
