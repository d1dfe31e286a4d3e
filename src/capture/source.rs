//! Packet sources feeding the pipeline's read loop
//!
//! A source is read from one blocking thread; `read_one` may block until a
//! packet is available and returns `Ok(None)` once the source is exhausted.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use derive_more::{Display, Error};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError, PcapNGReader};

use crate::capture::decoder::LinkType;
use crate::capture::RawPacket;

const READ_BUFFER_SIZE: usize = 65536;

#[derive(Debug, Display, Error)]
pub enum SourceError {
    #[display(fmt = "capture I/O error: {}", _0)]
    Io(std::io::Error),
    #[display(fmt = "bad capture format: {}", reason)]
    Format { reason: String },
    #[display(fmt = "unsupported link type {}", dlt)]
    UnsupportedLinkType { dlt: i32 },
}

impl From<std::io::Error> for SourceError {
    fn from(e: std::io::Error) -> Self {
        SourceError::Io(e)
    }
}

type Result<T> = std::result::Result<T, SourceError>;

/// Counters as reported by the source itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub received: u64,
    /// Packets the capture layer lost before we could read them
    pub dropped: u64,
}

pub trait PacketSource: Send {
    fn link_type(&self) -> LinkType;

    fn read_one(&mut self) -> Result<Option<RawPacket>>;

    fn stats(&self) -> SourceStats;
}

/// Packets queued in memory; used for replay and in tests.
pub struct MemorySource {
    link_type: LinkType,
    packets: VecDeque<RawPacket>,
    received: u64,
}

impl MemorySource {
    pub fn new(link_type: LinkType) -> MemorySource {
        MemorySource {
            link_type,
            packets: VecDeque::new(),
            received: 0,
        }
    }

    pub fn push(&mut self, packet: RawPacket) {
        self.packets.push_back(packet);
    }

    pub fn from_packets<I: IntoIterator<Item = RawPacket>>(
        link_type: LinkType,
        packets: I,
    ) -> MemorySource {
        MemorySource {
            link_type,
            packets: packets.into_iter().collect(),
            received: 0,
        }
    }
}

impl PacketSource for MemorySource {
    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn read_one(&mut self) -> Result<Option<RawPacket>> {
        let packet = self.packets.pop_front();
        if packet.is_some() {
            self.received += 1;
        }
        Ok(packet)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            received: self.received,
            dropped: 0,
        }
    }
}

enum PcapReader {
    Legacy {
        reader: LegacyPcapReader<BufReader<File>>,
        nanos: bool,
    },
    Ng {
        reader: PcapNGReader<BufReader<File>>,
        /// Link type of each interface, by interface id
        interfaces: Vec<i32>,
    },
}

/// Reads a classic pcap or pcapng capture file.
///
/// The link type of the first interface decides how every packet is decoded;
/// pcapng packets from interfaces with a different link type are skipped.
pub struct PcapFileSource {
    reader: PcapReader,
    link_type: LinkType,
    dlt: i32,
    stash: Option<RawPacket>,
    received: u64,
}

impl PcapFileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<PcapFileSource> {
        let path = path.as_ref();

        let mut magic = [0u8; 4];
        File::open(path)?.read_exact(&mut magic)?;
        let magic = u32::from_le_bytes(magic);

        let buffered = BufReader::with_capacity(READ_BUFFER_SIZE, File::open(path)?);
        let reader = match magic {
            0x0a0d_0d0a => {
                let reader = PcapNGReader::new(READ_BUFFER_SIZE, buffered)
                    .map_err(|e| format_error("pcapng header", e))?;
                PcapReader::Ng {
                    reader,
                    interfaces: Vec::new(),
                }
            }
            0xa1b2_c3d4 | 0xd4c3_b2a1 | 0xa1b2_3c4d | 0x4d3c_b2a1 => {
                let reader = LegacyPcapReader::new(READ_BUFFER_SIZE, buffered)
                    .map_err(|e| format_error("pcap header", e))?;
                PcapReader::Legacy {
                    reader,
                    nanos: magic == 0xa1b2_3c4d || magic == 0x4d3c_b2a1,
                }
            }
            _ => {
                return Err(SourceError::Format {
                    reason: format!("unknown capture magic 0x{:08x}", magic),
                })
            }
        };

        let mut source = PcapFileSource {
            reader,
            link_type: LinkType::Ethernet,
            dlt: -1,
            stash: None,
            received: 0,
        };

        // the link type is only known once the first packet's headers are read
        source.stash = source.next_packet()?;
        if source.dlt < 0 && source.stash.is_none() {
            source.dlt = 1;
        }
        source.link_type = LinkType::from_dlt(source.dlt as u32)
            .ok_or(SourceError::UnsupportedLinkType { dlt: source.dlt })?;

        log::info!(
            "opened capture {} (link type {})",
            path.display(),
            source.dlt
        );

        Ok(source)
    }

    fn next_packet(&mut self) -> Result<Option<RawPacket>> {
        match &mut self.reader {
            PcapReader::Legacy { reader, nanos } => next_legacy(reader, *nanos, &mut self.dlt),
            PcapReader::Ng { reader, interfaces } => next_ng(reader, interfaces, &mut self.dlt),
        }
    }
}

impl PacketSource for PcapFileSource {
    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn read_one(&mut self) -> Result<Option<RawPacket>> {
        let packet = match self.stash.take() {
            Some(packet) => Some(packet),
            None => self.next_packet()?,
        };
        if packet.is_some() {
            self.received += 1;
        }
        Ok(packet)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            received: self.received,
            dropped: 0,
        }
    }
}

fn format_error<E: std::fmt::Display>(context: &str, e: E) -> SourceError {
    SourceError::Format {
        reason: format!("{}: {}", context, e),
    }
}

fn timestamp(secs: i64, nanos: u32) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, nanos).single()
}

fn next_legacy(
    reader: &mut LegacyPcapReader<BufReader<File>>,
    nanos: bool,
    dlt: &mut i32,
) -> Result<Option<RawPacket>> {
    loop {
        match reader.next() {
            Ok((offset, block)) => match block {
                PcapBlockOwned::LegacyHeader(header) => {
                    *dlt = header.network.0;
                    reader.consume(offset);
                }
                PcapBlockOwned::Legacy(packet) => {
                    let fraction = if nanos {
                        packet.ts_usec
                    } else {
                        packet.ts_usec.saturating_mul(1000)
                    };
                    let caplen = (packet.caplen as usize).min(packet.data.len());
                    let raw = RawPacket::new(
                        packet.data[..caplen].to_vec(),
                        timestamp(packet.ts_sec as i64, fraction),
                    );
                    reader.consume(offset);
                    return Ok(Some(raw));
                }
                _ => reader.consume(offset),
            },
            Err(PcapError::Eof) => return Ok(None),
            Err(PcapError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| format_error("pcap refill", e))?;
            }
            Err(e) => return Err(format_error("pcap", e)),
        }
    }
}

fn next_ng(
    reader: &mut PcapNGReader<BufReader<File>>,
    interfaces: &mut Vec<i32>,
    dlt: &mut i32,
) -> Result<Option<RawPacket>> {
    use pcap_parser::pcapng::Block;

    loop {
        match reader.next() {
            Ok((offset, block)) => match block {
                PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                    interfaces.clear();
                    reader.consume(offset);
                }
                PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                    let linktype = idb.linktype.0;
                    if *dlt < 0 {
                        *dlt = linktype;
                    }
                    interfaces.push(linktype);
                    reader.consume(offset);
                }
                PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                    let linktype = interfaces.get(epb.if_id as usize).copied();
                    if linktype != Some(*dlt) {
                        log::debug!(
                            "skipping packet on interface {} with link type {:?}",
                            epb.if_id,
                            linktype
                        );
                        reader.consume(offset);
                        continue;
                    }

                    // default interface resolution is microseconds
                    let micros = ((epb.ts_high as u64) << 32) | epb.ts_low as u64;
                    let caplen = (epb.caplen as usize).min(epb.data.len());
                    let raw = RawPacket::new(
                        epb.data[..caplen].to_vec(),
                        timestamp(
                            (micros / 1_000_000) as i64,
                            ((micros % 1_000_000) * 1000) as u32,
                        ),
                    );
                    reader.consume(offset);
                    return Ok(Some(raw));
                }
                PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                    if interfaces.first().copied() != Some(*dlt) {
                        reader.consume(offset);
                        continue;
                    }
                    let caplen = (spb.origlen as usize).min(spb.data.len());
                    let raw = RawPacket::new(spb.data[..caplen].to_vec(), None);
                    reader.consume(offset);
                    return Ok(Some(raw));
                }
                _ => reader.consume(offset),
            },
            Err(PcapError::Eof) => return Ok(None),
            Err(PcapError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| format_error("pcapng refill", e))?;
            }
            Err(e) => return Err(format_error("pcapng", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("dnsscope-{}-{}", std::process::id(), name))
    }

    fn legacy_capture(packets: &[(u32, u32, &[u8])], nanos: bool) -> Vec<u8> {
        let magic: u32 = if nanos { 0xa1b2_3c4d } else { 0xa1b2_c3d4 };
        let mut out = Vec::new();
        out.extend_from_slice(&magic.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&65535u32.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());

        for (secs, frac, data) in packets {
            out.extend_from_slice(&secs.to_le_bytes());
            out.extend_from_slice(&frac.to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(data);
        }
        out
    }

    #[test]
    fn test_memory_source_drains_in_order() {
        let mut source = MemorySource::from_packets(
            LinkType::RawIp,
            vec![
                RawPacket::new(vec![1], None),
                RawPacket::new(vec![2], None),
            ],
        );

        assert_eq!(source.read_one().unwrap().unwrap().data, vec![1]);
        assert_eq!(source.read_one().unwrap().unwrap().data, vec![2]);
        assert!(source.read_one().unwrap().is_none());
        assert_eq!(source.stats().received, 2);
    }

    #[test]
    fn test_legacy_pcap_file() {
        let path = temp_path("legacy.pcap");
        let capture = legacy_capture(&[(1_600_000_000, 250_000, b"first"), (1_600_000_001, 0, b"second")], false);
        File::create(&path).unwrap().write_all(&capture).unwrap();

        let mut source = PcapFileSource::open(&path).unwrap();
        assert_eq!(source.link_type(), LinkType::Ethernet);

        let first = source.read_one().unwrap().unwrap();
        assert_eq!(first.data, b"first");
        assert_eq!(
            first.timestamp,
            Utc.timestamp_opt(1_600_000_000, 250_000_000).single()
        );
        assert_eq!(source.read_one().unwrap().unwrap().data, b"second");
        assert!(source.read_one().unwrap().is_none());
        assert_eq!(source.stats().received, 2);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_legacy_nanosecond_timestamps() {
        let path = temp_path("nanos.pcap");
        let capture = legacy_capture(&[(10, 123_456_789, b"x")], true);
        File::create(&path).unwrap().write_all(&capture).unwrap();

        let mut source = PcapFileSource::open(&path).unwrap();
        let packet = source.read_one().unwrap().unwrap();
        assert_eq!(packet.timestamp, Utc.timestamp_opt(10, 123_456_789).single());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_rejects_unknown_magic() {
        let path = temp_path("garbage.pcap");
        File::create(&path)
            .unwrap()
            .write_all(b"definitely not a capture")
            .unwrap();

        assert!(matches!(
            PcapFileSource::open(&path),
            Err(SourceError::Format { .. })
        ));

        std::fs::remove_file(&path).ok();
    }
}
