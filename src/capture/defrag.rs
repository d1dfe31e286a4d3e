//! IP fragment reassembly
//!
//! One engine serves both IP versions; only the limits differ. Fragments are
//! keyed by (source, destination, protocol, identification) and collected in
//! offset order until the final fragment has arrived and the byte count
//! matches the end of the datagram. Lists that stop receiving fragments are
//! evicted by `discard_older_than`, which the pipeline calls from a timer.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use derive_more::{Display, Error};
use parking_lot::RwLock;

use crate::capture::decoder::{DatagramHeader, IpFragment};
use crate::capture::IpVersion;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum DefragError {
    #[display(fmt = "fragment offset {} exceeds the limit", offset)]
    OffsetTooLarge { offset: u16 },
    #[display(fmt = "fragment would extend the datagram to {} bytes", size)]
    DatagramTooLarge { size: usize },
    #[display(fmt = "non-final fragment of {} bytes is too small", len)]
    FragmentTooSmall { len: usize },
    #[display(fmt = "hole or overlap at byte {}", at)]
    HoleDetected { at: usize },
    #[display(fmt = "more than {} fragments for one datagram", count)]
    TooManyFragments { count: usize },
}

type Result<T> = std::result::Result<T, DefragError>;

/// Per IP version bounds applied before any state is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentLimits {
    pub max_datagram_size: usize,
    /// Largest offset accepted, in 8 byte units
    pub max_offset: u16,
    pub max_fragments: usize,
    /// Smallest payload a non-final fragment may carry
    pub min_fragment_size: usize,
}

impl FragmentLimits {
    pub const IPV4: FragmentLimits = FragmentLimits {
        max_datagram_size: 65535,
        max_offset: 8183,
        max_fragments: 8192,
        min_fragment_size: 8,
    };

    pub const IPV6: FragmentLimits = FragmentLimits {
        max_datagram_size: 65535,
        max_offset: 8191,
        max_fragments: 8191,
        min_fragment_size: 0,
    };

    pub fn for_version(version: IpVersion) -> FragmentLimits {
        match version {
            IpVersion::V4 => FragmentLimits::IPV4,
            IpVersion::V6 => FragmentLimits::IPV6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub id: u32,
}

impl FlowKey {
    pub fn of(fragment: &IpFragment) -> FlowKey {
        FlowKey {
            src: fragment.header.src,
            dst: fragment.header.dst,
            protocol: fragment.header.protocol,
            id: fragment.info.id,
        }
    }
}

/// A datagram rebuilt from its fragments. Header and timestamp come from
/// the fragment at offset zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    pub header: DatagramHeader,
    pub payload: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowStats {
    pub fragments: usize,
    pub bytes: usize,
    pub final_seen: bool,
}

struct FragmentList {
    /// Payloads by byte offset
    fragments: BTreeMap<u32, Vec<u8>>,
    /// End of the furthest fragment
    highest: usize,
    /// Sum of all payload lengths
    current: usize,
    final_seen: bool,
    last_seen: Instant,
    first: Option<(DatagramHeader, Option<DateTime<Utc>>)>,
}

impl FragmentList {
    fn new(now: Instant) -> FragmentList {
        FragmentList {
            fragments: BTreeMap::new(),
            highest: 0,
            current: 0,
            final_seen: false,
            last_seen: now,
            first: None,
        }
    }

    fn insert(&mut self, offset: u32, fragment: IpFragment, now: Instant) {
        let end = offset as usize + fragment.payload.len();

        self.highest = self.highest.max(end);
        self.current += fragment.payload.len();
        self.last_seen = now;
        if !fragment.info.more_fragments {
            self.final_seen = true;
        }
        if offset == 0 {
            self.first = Some((fragment.header, fragment.timestamp));
        }

        self.fragments.insert(offset, fragment.payload);
    }

    fn is_complete(&self) -> bool {
        self.final_seen && self.highest == self.current
    }

    /// Concatenate in offset order; every fragment must start where the
    /// previous one ended.
    fn assemble(&self) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(self.current);
        for (&offset, data) in &self.fragments {
            if offset as usize != payload.len() {
                return Err(DefragError::HoleDetected { at: payload.len() });
            }
            payload.extend_from_slice(data);
        }
        Ok(payload)
    }
}

pub struct IpDefragmenter {
    version: IpVersion,
    limits: FragmentLimits,
    fragments: RwLock<HashMap<FlowKey, FragmentList>>,
}

impl IpDefragmenter {
    pub fn new(version: IpVersion) -> IpDefragmenter {
        IpDefragmenter::with_limits(version, FragmentLimits::for_version(version))
    }

    pub fn with_limits(version: IpVersion, limits: FragmentLimits) -> IpDefragmenter {
        IpDefragmenter {
            version,
            limits,
            fragments: RwLock::new(HashMap::new()),
        }
    }

    pub fn version(&self) -> IpVersion {
        self.version
    }

    fn check_limits(&self, fragment: &IpFragment) -> Result<()> {
        let info = fragment.info;
        let len = fragment.payload.len();

        if info.offset > self.limits.max_offset {
            return Err(DefragError::OffsetTooLarge {
                offset: info.offset,
            });
        }

        let size = info.offset as usize * 8 + len;
        if size > self.limits.max_datagram_size {
            return Err(DefragError::DatagramTooLarge { size });
        }

        if info.more_fragments && len < self.limits.min_fragment_size {
            return Err(DefragError::FragmentTooSmall { len });
        }

        Ok(())
    }

    /// Add one fragment. Returns the datagram once it is complete.
    ///
    /// Fragments failing the limits are rejected without touching any list.
    /// A repeated offset is ignored and does not count as activity.
    pub fn submit(&self, fragment: IpFragment, now: Instant) -> Result<Option<Reassembled>> {
        self.check_limits(&fragment)?;

        let key = FlowKey::of(&fragment);
        let offset = fragment.info.offset as u32 * 8;

        let mut fragments = self.fragments.write();
        let list = fragments
            .entry(key.clone())
            .or_insert_with(|| FragmentList::new(now));

        if list.fragments.contains_key(&offset) {
            return Ok(None);
        }

        if list.fragments.len() >= self.limits.max_fragments {
            let count = list.fragments.len();
            fragments.remove(&key);
            return Err(DefragError::TooManyFragments { count });
        }

        list.insert(offset, fragment, now);
        if !list.is_complete() {
            return Ok(None);
        }

        let payload = list.assemble()?;
        let (header, timestamp) = list
            .first
            .take()
            .ok_or(DefragError::HoleDetected { at: 0 })?;
        fragments.remove(&key);

        Ok(Some(Reassembled {
            header,
            payload,
            timestamp,
        }))
    }

    /// Drop every list idle since before `cutoff`. Returns how many went.
    pub fn discard_older_than(&self, cutoff: Instant) -> usize {
        let mut fragments = self.fragments.write();
        let before = fragments.len();
        fragments.retain(|_, list| list.last_seen >= cutoff);
        let discarded = before - fragments.len();

        if discarded > 0 {
            log::debug!("{}: discarded {} stale fragment lists", self.version, discarded);
        }

        discarded
    }

    /// Number of datagrams in progress
    pub fn len(&self) -> usize {
        self.fragments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.read().is_empty()
    }

    pub fn flow_stats(&self, key: &FlowKey) -> Option<FlowStats> {
        self.fragments.read().get(key).map(|list| FlowStats {
            fragments: list.fragments.len(),
            bytes: list.current,
            final_seen: list.final_seen,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;
    use std::time::Duration;

    use chrono::TimeZone;

    use crate::capture::decoder::FragmentInfo;

    fn header() -> DatagramHeader {
        DatagramHeader {
            version: IpVersion::V4,
            src: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            dst: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2)),
            protocol: 17,
        }
    }

    fn frag(id: u32, offset: u16, more: bool, payload: &[u8]) -> IpFragment {
        IpFragment {
            header: header(),
            info: FragmentInfo {
                id,
                offset,
                more_fragments: more,
            },
            payload: payload.to_vec(),
            timestamp: None,
        }
    }

    fn key(id: u32) -> FlowKey {
        FlowKey {
            src: header().src,
            dst: header().dst,
            protocol: 17,
            id,
        }
    }

    #[test]
    fn test_in_order_reassembly() {
        let defrag = IpDefragmenter::new(IpVersion::V4);
        let now = Instant::now();

        assert_eq!(defrag.submit(frag(1, 0, true, &[1; 16]), now), Ok(None));
        assert_eq!(defrag.submit(frag(1, 2, true, &[2; 8]), now), Ok(None));
        let done = defrag
            .submit(frag(1, 3, false, &[3; 5]), now)
            .unwrap()
            .unwrap();

        let mut expected = vec![1; 16];
        expected.extend_from_slice(&[2; 8]);
        expected.extend_from_slice(&[3; 5]);
        assert_eq!(done.payload, expected);
        assert_eq!(done.header, header());
        assert!(defrag.is_empty());
    }

    #[test]
    fn test_final_fragment_first() {
        let defrag = IpDefragmenter::new(IpVersion::V4);
        let now = Instant::now();

        assert_eq!(defrag.submit(frag(7, 1, false, b"tail"), now), Ok(None));
        let stats = defrag.flow_stats(&key(7)).unwrap();
        assert!(stats.final_seen);
        assert_eq!(stats.bytes, 4);

        let done = defrag
            .submit(frag(7, 0, true, b"01234567"), now)
            .unwrap()
            .unwrap();
        assert_eq!(done.payload, b"01234567tail");
    }

    #[test]
    fn test_header_and_timestamp_from_first_fragment() {
        let defrag = IpDefragmenter::new(IpVersion::V4);
        let now = Instant::now();

        let mut tail = frag(3, 1, false, b"x");
        tail.timestamp = Some(Utc.timestamp_opt(2_000, 0).unwrap());
        let mut head = frag(3, 0, true, b"01234567");
        head.timestamp = Some(Utc.timestamp_opt(1_000, 0).unwrap());

        defrag.submit(tail, now).unwrap();
        let done = defrag.submit(head, now).unwrap().unwrap();
        assert_eq!(done.timestamp, Some(Utc.timestamp_opt(1_000, 0).unwrap()));
    }

    #[test]
    fn test_duplicate_offset_ignored() {
        let defrag = IpDefragmenter::new(IpVersion::V4);
        let start = Instant::now();

        defrag.submit(frag(2, 0, true, b"AAAAAAAA"), start).unwrap();
        let later = start + Duration::from_secs(30);
        assert_eq!(defrag.submit(frag(2, 0, true, b"BBBBBBBB"), later), Ok(None));

        // duplicate did not refresh the list
        assert_eq!(defrag.discard_older_than(start + Duration::from_secs(1)), 1);
    }

    #[test]
    fn test_security_limits_create_no_state() {
        let defrag = IpDefragmenter::new(IpVersion::V4);
        let now = Instant::now();

        assert_eq!(
            defrag.submit(frag(1, 8184, false, b"x"), now),
            Err(DefragError::OffsetTooLarge { offset: 8184 })
        );
        assert_eq!(
            defrag.submit(frag(1, 8183, false, &[0; 72]), now),
            Err(DefragError::DatagramTooLarge { size: 65536 })
        );
        assert_eq!(
            defrag.submit(frag(1, 0, true, &[0; 7]), now),
            Err(DefragError::FragmentTooSmall { len: 7 })
        );
        assert!(defrag.is_empty());
    }

    #[test]
    fn test_ipv6_has_no_minimum_size() {
        let defrag = IpDefragmenter::new(IpVersion::V6);
        let now = Instant::now();

        assert_eq!(defrag.submit(frag(1, 0, true, &[0; 7]), now), Ok(None));
        assert_eq!(defrag.submit(frag(1, 8191, true, &[0; 7]), now), Ok(None));
        assert_eq!(
            defrag.submit(frag(1, 8192, true, &[0; 7]), now),
            Err(DefragError::OffsetTooLarge { offset: 8192 })
        );
    }

    #[test]
    fn test_overlap_reported_as_hole() {
        let defrag = IpDefragmenter::new(IpVersion::V4);
        let now = Instant::now();

        defrag.submit(frag(5, 0, true, &[0; 16]), now).unwrap();
        defrag.submit(frag(5, 1, true, &[0; 8]), now).unwrap();
        assert_eq!(
            defrag.submit(frag(5, 3, false, &[0; 8]), now),
            Err(DefragError::HoleDetected { at: 16 })
        );

        // the list stays until collected
        assert_eq!(defrag.len(), 1);
        assert_eq!(defrag.discard_older_than(now + Duration::from_secs(1)), 1);
    }

    #[test]
    fn test_too_many_fragments_evicts() {
        let limits = FragmentLimits {
            max_fragments: 3,
            ..FragmentLimits::IPV4
        };
        let defrag = IpDefragmenter::with_limits(IpVersion::V4, limits);
        let now = Instant::now();

        for i in 0..3u16 {
            assert_eq!(defrag.submit(frag(9, i * 2, true, &[0; 8]), now), Ok(None));
        }
        assert_eq!(
            defrag.submit(frag(9, 10, true, &[0; 8]), now),
            Err(DefragError::TooManyFragments { count: 3 })
        );
        assert!(defrag.is_empty());
    }

    #[test]
    fn test_flows_are_independent() {
        let defrag = IpDefragmenter::new(IpVersion::V4);
        let now = Instant::now();

        defrag.submit(frag(1, 0, true, b"11111111"), now).unwrap();
        defrag.submit(frag(2, 0, true, b"22222222"), now).unwrap();
        assert_eq!(defrag.len(), 2);

        let one = defrag.submit(frag(1, 1, false, b"1"), now).unwrap().unwrap();
        assert_eq!(one.payload, b"111111111");
        assert_eq!(defrag.len(), 1);
    }

    #[test]
    fn test_discard_keeps_active_lists() {
        let defrag = IpDefragmenter::new(IpVersion::V4);
        let start = Instant::now();

        defrag.submit(frag(1, 0, true, b"oldoldol"), start).unwrap();
        defrag
            .submit(frag(2, 0, true, b"newnewne"), start + Duration::from_secs(20))
            .unwrap();

        assert_eq!(defrag.discard_older_than(start + Duration::from_secs(10)), 1);
        assert!(defrag.flow_stats(&key(1)).is_none());
        assert!(defrag.flow_stats(&key(2)).is_some());
    }
}
