//! dnsscope
//!
//! A passive DNS capture pipeline. Packets from a capture source are sampled,
//! decoded, reassembled from IP fragments and TCP streams, parsed as DNS and
//! handed to any number of sinks.
//!
//! # Architecture
//!
//! * `capture` - packet sources, ingress filtering, decoding and reassembly
//! * `dns` - DNS wire format
//! * `output` - result records, sinks and fan-out
//! * `pipeline` - wiring of all stages into tokio tasks

/// Packet acquisition, decoding and reassembly
pub mod capture;

/// Pipeline configuration
pub mod config;

/// DNS wire format parsing
pub mod dns;

/// Prometheus counters
pub mod metrics;

/// DNS results and sinks
pub mod output;

/// Stage wiring and lifecycle
pub mod pipeline;

/// Graceful shutdown
pub mod shutdown;
