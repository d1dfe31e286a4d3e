//! Frame builders and a capturing sink shared by the integration tests

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;

use etherparse::PacketBuilder;
use parking_lot::Mutex;

use dnsscope::capture::RawPacket;
use dnsscope::dns::protocol::{DnsPacket, DnsQuestion, DnsRecord, QueryType};
use dnsscope::output::{DnsResult, Sink, SinkError};

pub const CLIENT_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
pub const SERVER_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];
pub const CLIENT_V4: [u8; 4] = [10, 0, 0, 1];
pub const SERVER_V4: [u8; 4] = [10, 0, 0, 53];
pub const CLIENT_V6: [u8; 16] = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
pub const SERVER_V6: [u8; 16] = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x53];

pub fn query(id: u16, name: &str) -> Vec<u8> {
    let mut packet = DnsPacket::new();
    packet.header.id = id;
    packet.header.recursion_desired = true;
    packet
        .questions
        .push(DnsQuestion::new(name.to_string(), QueryType::A));
    packet.to_bytes().unwrap()
}

/// A response with `answers` A records, large enough to need fragmenting
pub fn response(id: u16, name: &str, answers: usize) -> Vec<u8> {
    let mut packet = DnsPacket::new();
    packet.header.id = id;
    packet.header.response = true;
    packet
        .questions
        .push(DnsQuestion::new(name.to_string(), QueryType::A));
    for i in 0..answers {
        packet.answers.push(DnsRecord::A {
            domain: format!("host-{}.{}", i, name),
            addr: Ipv4Addr::new(192, 0, 2, (i % 250) as u8),
            ttl: 300,
        });
    }
    packet.to_bytes().unwrap()
}

pub fn raw(data: Vec<u8>) -> RawPacket {
    RawPacket::new(data, None)
}

pub fn udp4(src_port: u16, dst_port: u16, payload: &[u8]) -> RawPacket {
    let builder = PacketBuilder::ethernet2(CLIENT_MAC, SERVER_MAC)
        .ipv4(CLIENT_V4, SERVER_V4, 64)
        .udp(src_port, dst_port);
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, payload).unwrap();
    raw(frame)
}

pub fn udp6(src_port: u16, dst_port: u16, payload: &[u8]) -> RawPacket {
    let builder = PacketBuilder::ethernet2(CLIENT_MAC, SERVER_MAC)
        .ipv6(CLIENT_V6, SERVER_V6, 64)
        .udp(src_port, dst_port);
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, payload).unwrap();
    raw(frame)
}

/// UDP header plus payload, checksum left zero
pub fn udp_datagram(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(8 + payload.len());
    datagram.extend_from_slice(&src_port.to_be_bytes());
    datagram.extend_from_slice(&dst_port.to_be_bytes());
    datagram.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    datagram.extend_from_slice(&[0, 0]);
    datagram.extend_from_slice(payload);
    datagram
}

fn ethernet(ether_type: u16) -> Vec<u8> {
    let mut frame = SERVER_MAC.to_vec();
    frame.extend_from_slice(&CLIENT_MAC);
    frame.extend_from_slice(&ether_type.to_be_bytes());
    frame
}

/// Split `datagram` into fragments of at most `chunk` bytes (a multiple
/// of 8). Each entry is (offset in 8 byte units, more fragments, bytes).
pub fn split(datagram: &[u8], chunk: usize) -> Vec<(u16, bool, Vec<u8>)> {
    assert_eq!(chunk % 8, 0);
    datagram
        .chunks(chunk)
        .enumerate()
        .map(|(i, part)| {
            let offset = (i * chunk / 8) as u16;
            let more = (i + 1) * chunk < datagram.len();
            (offset, more, part.to_vec())
        })
        .collect()
}

pub fn ipv4_fragment(id: u16, offset: u16, more: bool, data: &[u8]) -> RawPacket {
    let mut frame = ethernet(0x0800);
    let total_len = (20 + data.len()) as u16;
    let flags_offset = offset | if more { 0x2000 } else { 0 };

    frame.extend_from_slice(&[0x45, 0]);
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&id.to_be_bytes());
    frame.extend_from_slice(&flags_offset.to_be_bytes());
    frame.extend_from_slice(&[64, 17, 0, 0]);
    frame.extend_from_slice(&SERVER_V4);
    frame.extend_from_slice(&CLIENT_V4);
    frame.extend_from_slice(data);
    raw(frame)
}

pub fn ipv6_fragment(id: u32, offset: u16, more: bool, data: &[u8]) -> RawPacket {
    let mut frame = ethernet(0x86DD);
    let payload_len = (8 + data.len()) as u16;

    frame.extend_from_slice(&[0x60, 0, 0, 0]);
    frame.extend_from_slice(&payload_len.to_be_bytes());
    frame.extend_from_slice(&[44, 64]);
    frame.extend_from_slice(&SERVER_V6);
    frame.extend_from_slice(&CLIENT_V6);

    let offset_flags = (offset << 3) | more as u16;
    frame.extend_from_slice(&[17, 0]);
    frame.extend_from_slice(&offset_flags.to_be_bytes());
    frame.extend_from_slice(&id.to_be_bytes());
    frame.extend_from_slice(data);
    raw(frame)
}

pub struct TcpFlags {
    pub syn: bool,
    pub fin: bool,
}

pub const DATA: TcpFlags = TcpFlags {
    syn: false,
    fin: false,
};

pub fn tcp4(src_port: u16, dst_port: u16, seq: u32, flags: TcpFlags, payload: &[u8]) -> RawPacket {
    let mut builder = PacketBuilder::ethernet2(CLIENT_MAC, SERVER_MAC)
        .ipv4(CLIENT_V4, SERVER_V4, 64)
        .tcp(src_port, dst_port, seq, 65535);
    if flags.syn {
        builder = builder.syn();
    }
    if flags.fin {
        builder = builder.fin();
    }
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, payload).unwrap();
    raw(frame)
}

/// Prefix each message with its length, DNS over TCP style
pub fn tcp_stream(messages: &[Vec<u8>]) -> Vec<u8> {
    let mut stream = Vec::new();
    for message in messages {
        stream.extend_from_slice(&(message.len() as u16).to_be_bytes());
        stream.extend_from_slice(message);
    }
    stream
}

pub type Captured = Arc<Mutex<Vec<Arc<DnsResult>>>>;

pub struct CapturingSink {
    name: String,
    captured: Captured,
}

impl CapturingSink {
    pub fn new(name: &str) -> (Box<CapturingSink>, Captured) {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = CapturingSink {
            name: name.to_string(),
            captured: captured.clone(),
        };
        (Box::new(sink), captured)
    }
}

impl Sink for CapturingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn write(&mut self, result: Arc<DnsResult>) -> Result<(), SinkError> {
        self.captured.lock().push(result);
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}
