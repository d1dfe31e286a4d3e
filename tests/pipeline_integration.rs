//! Whole pipeline runs over in-memory captures

mod common;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dnsscope::capture::decoder::LinkType;
use dnsscope::capture::source::MemorySource;
use dnsscope::capture::TransportProtocol;
use dnsscope::config::{PipelineConfig, SampleRatio};
use dnsscope::output::{DnsResult, Sink, SinkError};
use dnsscope::pipeline::Pipeline;

use common::*;

fn config() -> PipelineConfig {
    PipelineConfig {
        stats_interval_secs: 0,
        ..PipelineConfig::default()
    }
}

#[tokio::test]
async fn test_udp_query_reaches_every_sink_once() {
    let mut pipeline = Pipeline::new(config()).unwrap();
    let (first, first_seen) = CapturingSink::new("first");
    let (second, second_seen) = CapturingSink::new("second");
    pipeline.add_sink(first);
    pipeline.add_sink(second);

    let payload = query(0x1234, "example.com");
    let source = MemorySource::from_packets(LinkType::Ethernet, vec![udp4(40000, 53, &payload)]);

    let report = pipeline.run(source).await.unwrap();
    assert!(report.drained);
    assert_eq!(report.packets_read, 1);
    assert_eq!(report.dispatched, 1);

    for seen in &[first_seen, second_seen] {
        let results = seen.lock();
        assert_eq!(results.len(), 1);

        let result = &results[0];
        assert_eq!(result.protocol, TransportProtocol::Udp);
        assert_eq!(result.packet_length, payload.len());
        assert_eq!(result.dns.questions[0].name, "example.com.");
        assert_eq!(result.dns.header.id, 0x1234);
        assert_eq!(result.ip_version, 4);
        assert_eq!(result.src_ip, IpAddr::from(CLIENT_V4));
        assert_eq!(result.src_port, Some(40000));
        assert_eq!(result.dst_port, Some(53));
        assert_eq!(result.server.as_deref(), Some("default"));
    }
}

#[tokio::test]
async fn test_non_dns_traffic_is_ignored() {
    let mut pipeline = Pipeline::new(config()).unwrap();
    let (sink, seen) = CapturingSink::new("sink");
    pipeline.add_sink(sink);

    let source = MemorySource::from_packets(
        LinkType::Ethernet,
        vec![
            udp4(40000, 123, &query(1, "ntp.example")),
            udp4(40000, 53, b"not dns"),
            udp6(40000, 53, &query(2, "v6.example")),
        ],
    );

    let report = pipeline.run(source).await.unwrap();
    assert_eq!(report.packets_read, 3);

    let results = seen.lock();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].ip_version, 6);
    assert_eq!(results[0].dns.questions[0].name, "v6.example.");
}

#[tokio::test]
async fn test_fragmented_ipv4_response_reassembled() {
    let mut pipeline = Pipeline::new(config()).unwrap();
    let (sink, seen) = CapturingSink::new("sink");
    pipeline.add_sink(sink);

    let dns = response(77, "frag.example", 120);
    assert!(dns.len() > 1500);
    let datagram = udp_datagram(53, 40000, &dns);

    let mut fragments: Vec<_> = split(&datagram, 1480)
        .into_iter()
        .map(|(offset, more, data)| ipv4_fragment(0xbeef, offset, more, &data))
        .collect();
    // last fragment first, as it often arrives on real links
    fragments.rotate_right(1);
    // a second datagram interleaved with the first
    let other = udp_datagram(53, 40001, &response(78, "frag2.example", 100));
    for (i, (offset, more, data)) in split(&other, 1480).into_iter().enumerate() {
        let at = (i * 2 + 1).min(fragments.len());
        fragments.insert(at, ipv4_fragment(0xbeee, offset, more, &data));
    }

    let source = MemorySource::from_packets(LinkType::Ethernet, fragments);
    let report = pipeline.run(source).await.unwrap();
    assert!(report.drained);

    let results = seen.lock();
    assert_eq!(results.len(), 2);
    let result = results
        .iter()
        .find(|r| r.dns.header.id == 77)
        .expect("reassembled response");
    assert_eq!(result.protocol, TransportProtocol::Udp);
    assert_eq!(result.dns.answers.len(), 120);
    assert_eq!(result.packet_length, dns.len());
    assert_eq!(result.src_port, Some(53));
    assert!(results.iter().any(|r| r.dns.header.id == 78 && r.dst_port == Some(40001)));
}

#[tokio::test]
async fn test_fragmented_ipv6_response_reassembled() {
    let mut pipeline = Pipeline::new(config()).unwrap();
    let (sink, seen) = CapturingSink::new("sink");
    pipeline.add_sink(sink);

    let dns = response(6, "frag6.example", 80);
    let datagram = udp_datagram(53, 40000, &dns);
    let fragments: Vec<_> = split(&datagram, 1232)
        .into_iter()
        .map(|(offset, more, data)| ipv6_fragment(0x0102_0304, offset, more, &data))
        .collect();

    let source = MemorySource::from_packets(LinkType::Ethernet, fragments);
    pipeline.run(source).await.unwrap();

    let results = seen.lock();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].ip_version, 6);
    assert_eq!(results[0].dns.answers.len(), 80);
}

#[tokio::test]
async fn test_incomplete_fragments_produce_nothing() {
    let mut pipeline = Pipeline::new(config()).unwrap();
    let (sink, seen) = CapturingSink::new("sink");
    pipeline.add_sink(sink);

    let datagram = udp_datagram(53, 40000, &response(9, "hole.example", 100));
    let mut fragments = split(&datagram, 1480);
    fragments.remove(1);
    let packets: Vec<_> = fragments
        .into_iter()
        .map(|(offset, more, data)| ipv4_fragment(9, offset, more, &data))
        .collect();

    let source = MemorySource::from_packets(LinkType::Ethernet, packets);
    let report = pipeline.run(source).await.unwrap();

    assert!(report.drained);
    assert!(seen.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dns_over_tcp_split_across_segments() {
    let mut pipeline = Pipeline::new(PipelineConfig {
        decoder_workers: 4,
        tcp_shards: 3,
        ..config()
    })
    .unwrap();
    let (sink, seen) = CapturingSink::new("sink");
    pipeline.add_sink(sink);

    let first = query(1, "one.example");
    let second = query(2, "two.example");
    let stream = tcp_stream(&[first.clone(), second.clone()]);
    let cut = first.len() + 5;

    let isn = 7_000;
    let packets = vec![
        tcp4(40000, 53, isn, TcpFlags { syn: true, fin: false }, &[]),
        // second half first: must wait for the gap
        tcp4(40000, 53, isn + 1 + cut as u32, DATA, &stream[cut..]),
        tcp4(40000, 53, isn + 1, DATA, &stream[..cut]),
        // retransmission of the first half
        tcp4(40000, 53, isn + 1, DATA, &stream[..cut]),
        tcp4(
            40000,
            53,
            isn + 1 + stream.len() as u32,
            TcpFlags { syn: false, fin: true },
            &[],
        ),
    ];

    let source = MemorySource::from_packets(LinkType::Ethernet, packets);
    let report = pipeline.run(source).await.unwrap();
    assert!(report.drained);

    let results = seen.lock();
    let names: Vec<&str> = results
        .iter()
        .map(|r| r.dns.questions[0].name.as_str())
        .collect();
    assert_eq!(names, vec!["one.example.", "two.example."]);
    assert!(results.iter().all(|r| r.protocol == TransportProtocol::Tcp));
    assert_eq!(results[0].packet_length, first.len());
    assert_eq!(results[1].packet_length, second.len());
}

#[tokio::test]
async fn test_sampling_and_dedup() {
    let mut pipeline = Pipeline::new(PipelineConfig {
        sample_ratio: SampleRatio { accept: 1, of: 2 },
        dedup: true,
        ..config()
    })
    .unwrap();
    let (sink, seen) = CapturingSink::new("sink");
    pipeline.add_sink(sink);

    let mut packets = Vec::new();
    for id in 0..10u16 {
        packets.push(udp4(40000 + id, 53, &query(id, "sampled.example")));
    }
    // accepted by the sampler twice, so the second copy is a duplicate
    let repeated = udp4(41000, 53, &query(500, "dup.example"));
    packets.push(repeated.clone());
    packets.push(repeated.clone());
    packets.push(repeated.clone());
    packets.push(repeated);

    let source = MemorySource::from_packets(LinkType::Ethernet, packets);
    let report = pipeline.run(source).await.unwrap();

    assert_eq!(report.packets_read, 14);
    assert_eq!(report.ratio_skipped, 7);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.accepted, 6);
    assert_eq!(seen.lock().len(), 6);
}

#[tokio::test]
async fn test_ip_masking_applies_to_results() {
    let mut pipeline = Pipeline::new(PipelineConfig {
        mask_size4: 8,
        ..config()
    })
    .unwrap();
    let (sink, seen) = CapturingSink::new("sink");
    pipeline.add_sink(sink);

    let source = MemorySource::from_packets(
        LinkType::Ethernet,
        vec![udp4(40000, 53, &query(3, "masked.example"))],
    );
    pipeline.run(source).await.unwrap();

    let results = seen.lock();
    assert_eq!(results[0].src_ip, "10.0.0.0".parse::<IpAddr>().unwrap());
    assert_eq!(results[0].dst_ip, "10.0.0.0".parse::<IpAddr>().unwrap());
}

struct BrokenSink;

impl Sink for BrokenSink {
    fn name(&self) -> &str {
        "broken"
    }

    fn initialize(&mut self) -> Result<(), SinkError> {
        Err(SinkError::Unusable {
            reason: "refuses to start".to_string(),
        })
    }

    fn write(&mut self, _: std::sync::Arc<dnsscope::output::DnsResult>) -> Result<(), SinkError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_unusable_sink_does_not_stop_the_rest() {
    let mut pipeline = Pipeline::new(config()).unwrap();
    pipeline.add_sink(Box::new(BrokenSink));
    let (sink, seen) = CapturingSink::new("working");
    pipeline.add_sink(sink);

    let source = MemorySource::from_packets(
        LinkType::Ethernet,
        vec![udp4(40000, 53, &query(4, "still.works"))],
    );
    let report = pipeline.run(source).await.unwrap();

    assert_eq!(report.sinks.len(), 1);
    assert_eq!(report.sinks[0].name, "working");
    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test]
async fn test_raw_ip_capture() {
    let mut pipeline = Pipeline::new(PipelineConfig {
        no_ethernet: true,
        ..config()
    })
    .unwrap();
    let (sink, seen) = CapturingSink::new("sink");
    pipeline.add_sink(sink);

    let frame = udp4(40000, 53, &query(5, "raw.example"));
    let ip_only = raw(frame.data[14..].to_vec());
    // the source claims ethernet, the configuration wins
    let source = MemorySource::from_packets(LinkType::Ethernet, vec![ip_only]);
    pipeline.run(source).await.unwrap();

    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dns_over_tcp_with_syn_after_data() {
    let mut pipeline = Pipeline::new(PipelineConfig {
        decoder_workers: 4,
        tcp_shards: 2,
        ..config()
    })
    .unwrap();
    let (sink, seen) = CapturingSink::new("sink");
    pipeline.add_sink(sink);

    let first = query(11, "early.example");
    let second = query(12, "late.example");
    let stream = tcp_stream(&[first, second]);
    let cut = 9;

    let isn = 90_000u32;
    let mut packets = Vec::new();
    for port in 41000..41016u16 {
        // the second segment, then the SYN, then the first segment
        packets.push(tcp4(port, 53, isn + 1 + cut as u32, DATA, &stream[cut..]));
        packets.push(tcp4(port, 53, isn, TcpFlags { syn: true, fin: false }, &[]));
        packets.push(tcp4(port, 53, isn + 1, DATA, &stream[..cut]));
        packets.push(tcp4(
            port,
            53,
            isn + 1 + stream.len() as u32,
            TcpFlags { syn: false, fin: true },
            &[],
        ));
    }

    let source = MemorySource::from_packets(LinkType::Ethernet, packets);
    let report = pipeline.run(source).await.unwrap();
    assert!(report.drained);

    let results = seen.lock();
    assert_eq!(results.len(), 32);
    for port in 41000..41016u16 {
        let mut ids: Vec<u16> = results
            .iter()
            .filter(|r| r.src_port == Some(port))
            .map(|r| r.dns.header.id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![11, 12], "flow from port {}", port);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fragments_spread_over_decoders() {
    let mut pipeline = Pipeline::new(PipelineConfig {
        decoder_workers: 4,
        ..config()
    })
    .unwrap();
    let (sink, seen) = CapturingSink::new("sink");
    pipeline.add_sink(sink);

    let mut packets = Vec::new();
    for id in 0..8u16 {
        let datagram = udp_datagram(53, 40000 + id, &response(id, "spread.example", 100));
        let mut fragments = split(&datagram, 1480);
        fragments.reverse();
        for (offset, more, data) in fragments {
            packets.push(ipv4_fragment(0x1000 + id, offset, more, &data));
        }
    }

    let source = MemorySource::from_packets(LinkType::Ethernet, packets);
    let report = pipeline.run(source).await.unwrap();
    assert!(report.drained);

    let results = seen.lock();
    let mut ids: Vec<u16> = results.iter().map(|r| r.dns.header.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..8).collect::<Vec<u16>>());
    assert!(results.iter().all(|r| r.dns.answers.len() == 100));
}

/// Sink whose writes block until released
struct StalledSink {
    released: Arc<AtomicBool>,
}

impl Sink for StalledSink {
    fn name(&self) -> &str {
        "stalled"
    }

    fn initialize(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn write(&mut self, _: Arc<DnsResult>) -> Result<(), SinkError> {
        while !self.released.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_with_stalled_sink_is_bounded() {
    let mut pipeline = Pipeline::new(PipelineConfig {
        packet_channel_size: 1,
        tcp_channel_size: 1,
        tcp_return_channel_size: 1,
        defrag_channel_size: 1,
        result_channel_size: 1,
        sink_channel_size: 1,
        drain_timeout_secs: 1,
        ..config()
    })
    .unwrap();
    let released = Arc::new(AtomicBool::new(false));
    pipeline.add_sink(Box::new(StalledSink {
        released: released.clone(),
    }));

    let packets: Vec<_> = (0..1000u16)
        .map(|id| udp4(40000, 53, &query(id, "stalled.example")))
        .collect();
    let source = MemorySource::from_packets(LinkType::Ethernet, packets);

    let shutdown = pipeline.shutdown_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.trigger().unwrap();
    });

    let started = Instant::now();
    let report = pipeline.run(source).await.unwrap();
    let elapsed = started.elapsed();
    released.store(true, Ordering::SeqCst);

    assert!(elapsed < Duration::from_secs(4), "run took {:?}", elapsed);
    assert!(!report.drained);
    assert!(report.packets_read < 1000);
}
