//! DNS Protocol Implementation
//!
//! Parsing of captured DNS messages:
//! * `buffer` - cursor based reads and writes, name compression
//! * `protocol` - headers, questions, records and whole packets

/// Buffer implementations for DNS packet parsing
pub mod buffer;

/// DNS protocol structures and wire format
pub mod protocol;
