//! Link, tunnel, IP and transport decoding.
//!
//! `decode` classifies one captured frame: a fragment on its way to the
//! reassembler, a UDP payload on the DNS port, a TCP segment on the DNS
//! port, or something the pipeline ignores. Reassembled datagrams come back
//! through `decode_reassembled`, which runs the same transport logic.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use derive_more::{Display, Error};
use etherparse::{
    Ethernet2HeaderSlice, Ipv4HeaderSlice, Ipv6HeaderSlice, TcpHeaderSlice, UdpHeaderSlice,
};

use crate::capture::defrag::Reassembled;
use crate::capture::{IpVersion, RawPacket};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88A8;
const ETHERTYPE_QINQ_LEGACY: u16 = 0x9100;

const IPPROTO_HOPOPTS: u8 = 0;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;
const IPPROTO_ROUTING: u8 = 43;
const IPPROTO_FRAGMENT: u8 = 44;
const IPPROTO_AH: u8 = 51;
const IPPROTO_DSTOPTS: u8 = 60;

const SLL_HEADER_LEN: usize = 16;
const VXLAN_HEADER_LEN: usize = 8;
const UDP_HEADER_LEN: usize = 8;
const MAX_TUNNEL_DEPTH: usize = 4;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[display(fmt = "truncated {} header", layer)]
    Truncated { layer: &'static str },
    #[display(fmt = "malformed {} header: {}", layer, reason)]
    Malformed { layer: &'static str, reason: String },
    #[display(fmt = "tunnels nested deeper than {}", max)]
    TooDeep { max: usize },
}

impl DecodeError {
    fn malformed<E: std::fmt::Display>(layer: &'static str, e: E) -> DecodeError {
        DecodeError::Malformed {
            layer,
            reason: e.to_string(),
        }
    }
}

type Result<T> = std::result::Result<T, DecodeError>;

/// Link layer framing of captured packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    /// No link header; the IP version comes from the first nibble
    RawIp,
    /// Linux cooked capture (SLL)
    LinuxSll,
}

impl LinkType {
    /// Map a pcap DLT/LINKTYPE number
    pub fn from_dlt(dlt: u32) -> Option<LinkType> {
        match dlt {
            1 => Some(LinkType::Ethernet),
            12 | 14 | 101 | 228 | 229 => Some(LinkType::RawIp),
            113 => Some(LinkType::LinuxSll),
            _ => None,
        }
    }
}

/// Network layer identity of a datagram
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatagramHeader {
    pub version: IpVersion,
    pub src: IpAddr,
    pub dst: IpAddr,
    /// Transport protocol, or for IPv6 the header following the fragment header
    pub protocol: u8,
}

/// Fragmentation fields of one IP fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    pub id: u32,
    /// Offset in 8 byte units
    pub offset: u16,
    pub more_fragments: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpFragment {
    pub header: DatagramHeader,
    pub info: FragmentInfo,
    pub payload: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub header: DatagramHeader,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub header: DatagramHeader,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Where a decoded packet goes next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Fragment(IpFragment),
    Udp(UdpDatagram),
    Tcp(TcpSegment),
    Ignored,
}

/// Stateless apart from its settings; every worker builds its own.
#[derive(Debug, Clone)]
pub struct PacketDecoder {
    link_type: LinkType,
    port: u16,
    vxlan_port: u16,
}

impl PacketDecoder {
    pub fn new(link_type: LinkType, port: u16, vxlan_port: u16) -> PacketDecoder {
        PacketDecoder {
            link_type,
            port,
            vxlan_port,
        }
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    pub fn decode(&self, packet: &RawPacket) -> Result<Decoded> {
        let data = &packet.data;
        let ts = packet.timestamp;

        match self.link_type {
            LinkType::Ethernet => self.decode_ethernet(data, ts, 0),
            LinkType::RawIp => self.decode_raw_ip(data, ts, 0),
            LinkType::LinuxSll => self.decode_sll(data, ts, 0),
        }
    }

    /// Second pass over a datagram rebuilt from fragments
    pub fn decode_reassembled(&self, datagram: &Reassembled) -> Result<Decoded> {
        let mut header = datagram.header.clone();
        let mut payload = &datagram.payload[..];

        if header.version == IpVersion::V6 {
            let (next, consumed, fragment) = walk_ipv6_extensions(header.protocol, payload)?;
            if fragment.is_some() {
                return Err(DecodeError::Malformed {
                    layer: "ipv6",
                    reason: "fragment header inside reassembled datagram".to_string(),
                });
            }
            header.protocol = next;
            payload = &payload[consumed..];
        }

        self.decode_transport(header, payload, datagram.timestamp, 0)
    }

    fn decode_ethernet(&self, data: &[u8], ts: Option<DateTime<Utc>>, depth: usize) -> Result<Decoded> {
        let eth = Ethernet2HeaderSlice::from_slice(data)
            .map_err(|e| DecodeError::malformed("ethernet", e))?;

        let mut ether_type = eth.ether_type().0;
        let mut offset = eth.slice().len();

        while ether_type == ETHERTYPE_VLAN
            || ether_type == ETHERTYPE_QINQ
            || ether_type == ETHERTYPE_QINQ_LEGACY
        {
            let tag = data
                .get(offset..offset + 4)
                .ok_or(DecodeError::Truncated { layer: "vlan" })?;
            ether_type = u16::from_be_bytes([tag[2], tag[3]]);
            offset += 4;
        }

        self.decode_ethertype(ether_type, &data[offset..], ts, depth)
    }

    fn decode_sll(&self, data: &[u8], ts: Option<DateTime<Utc>>, depth: usize) -> Result<Decoded> {
        if data.len() < SLL_HEADER_LEN {
            return Err(DecodeError::Truncated { layer: "sll" });
        }
        let protocol = u16::from_be_bytes([data[14], data[15]]);

        self.decode_ethertype(protocol, &data[SLL_HEADER_LEN..], ts, depth)
    }

    fn decode_raw_ip(&self, data: &[u8], ts: Option<DateTime<Utc>>, depth: usize) -> Result<Decoded> {
        match data.first().map(|b| b >> 4) {
            Some(4) => self.decode_ipv4(data, ts, depth),
            Some(6) => self.decode_ipv6(data, ts, depth),
            Some(v) => Err(DecodeError::Malformed {
                layer: "ip",
                reason: format!("unknown version {}", v),
            }),
            None => Err(DecodeError::Truncated { layer: "ip" }),
        }
    }

    fn decode_ethertype(
        &self,
        ether_type: u16,
        data: &[u8],
        ts: Option<DateTime<Utc>>,
        depth: usize,
    ) -> Result<Decoded> {
        match ether_type {
            ETHERTYPE_IPV4 => self.decode_ipv4(data, ts, depth),
            ETHERTYPE_IPV6 => self.decode_ipv6(data, ts, depth),
            _ => Ok(Decoded::Ignored),
        }
    }

    fn decode_ipv4(&self, data: &[u8], ts: Option<DateTime<Utc>>, depth: usize) -> Result<Decoded> {
        let ip = Ipv4HeaderSlice::from_slice(data).map_err(|e| DecodeError::malformed("ipv4", e))?;

        let header_len = ip.slice().len();
        // trailing link padding is not part of the datagram
        let end = (ip.total_len() as usize).min(data.len()).max(header_len);
        let payload = &data[header_len..end];

        let header = DatagramHeader {
            version: IpVersion::V4,
            src: IpAddr::V4(ip.source_addr()),
            dst: IpAddr::V4(ip.destination_addr()),
            protocol: ip.protocol().0,
        };

        let offset = ip.fragments_offset().value();
        if !ip.dont_fragment() && (ip.more_fragments() || offset != 0) {
            return Ok(Decoded::Fragment(IpFragment {
                header,
                info: FragmentInfo {
                    id: ip.identification() as u32,
                    offset,
                    more_fragments: ip.more_fragments(),
                },
                payload: payload.to_vec(),
                timestamp: ts,
            }));
        }

        self.decode_transport(header, payload, ts, depth)
    }

    fn decode_ipv6(&self, data: &[u8], ts: Option<DateTime<Utc>>, depth: usize) -> Result<Decoded> {
        let ip = Ipv6HeaderSlice::from_slice(data).map_err(|e| DecodeError::malformed("ipv6", e))?;

        let header_len = ip.slice().len();
        let end = (header_len + ip.payload_length() as usize).min(data.len());
        let body = &data[header_len..end];

        let (next, consumed, fragment) = walk_ipv6_extensions(ip.next_header().0, body)?;
        let header = DatagramHeader {
            version: IpVersion::V6,
            src: IpAddr::V6(ip.source_addr()),
            dst: IpAddr::V6(ip.destination_addr()),
            protocol: next,
        };
        let payload = &body[consumed..];

        if let Some(info) = fragment {
            return Ok(Decoded::Fragment(IpFragment {
                header,
                info,
                payload: payload.to_vec(),
                timestamp: ts,
            }));
        }

        self.decode_transport(header, payload, ts, depth)
    }

    fn decode_transport(
        &self,
        header: DatagramHeader,
        payload: &[u8],
        ts: Option<DateTime<Utc>>,
        depth: usize,
    ) -> Result<Decoded> {
        match header.protocol {
            IPPROTO_UDP => {
                let udp =
                    UdpHeaderSlice::from_slice(payload).map_err(|e| DecodeError::malformed("udp", e))?;
                let src_port = udp.source_port();
                let dst_port = udp.destination_port();

                let udp_len = udp.length() as usize;
                let end = if udp_len >= UDP_HEADER_LEN {
                    udp_len.min(payload.len())
                } else {
                    payload.len()
                };
                let data = &payload[UDP_HEADER_LEN..end];

                if src_port == self.port || dst_port == self.port {
                    return Ok(Decoded::Udp(UdpDatagram {
                        header,
                        src_port,
                        dst_port,
                        payload: data.to_vec(),
                        timestamp: ts,
                    }));
                }

                if dst_port == self.vxlan_port {
                    return self.decode_vxlan(data, ts, depth);
                }

                Ok(Decoded::Ignored)
            }
            IPPROTO_TCP => {
                let tcp =
                    TcpHeaderSlice::from_slice(payload).map_err(|e| DecodeError::malformed("tcp", e))?;
                let src_port = tcp.source_port();
                let dst_port = tcp.destination_port();

                if src_port != self.port && dst_port != self.port {
                    return Ok(Decoded::Ignored);
                }

                Ok(Decoded::Tcp(TcpSegment {
                    header,
                    src_port,
                    dst_port,
                    seq: tcp.sequence_number(),
                    syn: tcp.syn(),
                    fin: tcp.fin(),
                    rst: tcp.rst(),
                    payload: payload[tcp.slice().len()..].to_vec(),
                    timestamp: ts,
                }))
            }
            _ => Ok(Decoded::Ignored),
        }
    }

    fn decode_vxlan(&self, data: &[u8], ts: Option<DateTime<Utc>>, depth: usize) -> Result<Decoded> {
        if depth + 1 > MAX_TUNNEL_DEPTH {
            return Err(DecodeError::TooDeep {
                max: MAX_TUNNEL_DEPTH,
            });
        }
        if data.len() < VXLAN_HEADER_LEN {
            return Err(DecodeError::Truncated { layer: "vxlan" });
        }
        if data[0] & 0x08 == 0 {
            return Err(DecodeError::Malformed {
                layer: "vxlan",
                reason: "VNI flag not set".to_string(),
            });
        }

        self.decode_ethernet(&data[VXLAN_HEADER_LEN..], ts, depth + 1)
    }
}

/// Skip IPv6 extension headers. Returns the next protocol, the bytes
/// consumed and, if a fragment header was found, its fields. Nothing past
/// a fragment header is interpreted.
fn walk_ipv6_extensions(first: u8, data: &[u8]) -> Result<(u8, usize, Option<FragmentInfo>)> {
    let mut next = first;
    let mut offset = 0;

    loop {
        match next {
            IPPROTO_HOPOPTS | IPPROTO_ROUTING | IPPROTO_DSTOPTS | IPPROTO_AH => {
                let ext = data
                    .get(offset..offset + 2)
                    .ok_or(DecodeError::Truncated { layer: "ipv6 extension" })?;
                let len = if next == IPPROTO_AH {
                    (ext[1] as usize + 2) * 4
                } else {
                    (ext[1] as usize + 1) * 8
                };
                next = ext[0];
                offset += len;
                if offset > data.len() {
                    return Err(DecodeError::Truncated { layer: "ipv6 extension" });
                }
            }
            IPPROTO_FRAGMENT => {
                let frag = data
                    .get(offset..offset + 8)
                    .ok_or(DecodeError::Truncated { layer: "ipv6 fragment" })?;
                let offset_flags = u16::from_be_bytes([frag[2], frag[3]]);
                let info = FragmentInfo {
                    id: u32::from_be_bytes([frag[4], frag[5], frag[6], frag[7]]),
                    offset: offset_flags >> 3,
                    more_fragments: offset_flags & 0x1 == 1,
                };
                return Ok((frag[0], offset + 8, Some(info)));
            }
            _ => return Ok((next, offset, None)),
        }
    }
}
