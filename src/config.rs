//! Runtime configuration for the capture pipeline

use std::convert::TryFrom;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};

use crate::shutdown::ShutdownConfig;

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    #[display(fmt = "failed to read config: {}", _0)]
    Io(std::io::Error),
    #[display(fmt = "failed to parse config: {}", _0)]
    Toml(toml::de::Error),
    #[display(fmt = "invalid sample ratio {:?}: {}", value, reason)]
    InvalidRatio { value: String, reason: &'static str },
    #[display(fmt = "invalid {}: {}", field, reason)]
    Invalid { field: &'static str, reason: String },
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Toml(e)
    }
}

type Result<T> = std::result::Result<T, ConfigError>;

/// Deterministic sampling ratio `A:B`: accept A packets out of every B.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SampleRatio {
    pub accept: u32,
    pub of: u32,
}

impl SampleRatio {
    pub const ALL: SampleRatio = SampleRatio { accept: 1, of: 1 };

    /// A ratio whose sides are equal never rejects anything.
    pub fn is_passthrough(&self) -> bool {
        self.accept == self.of
    }
}

impl Default for SampleRatio {
    fn default() -> Self {
        SampleRatio::ALL
    }
}

impl FromStr for SampleRatio {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason| ConfigError::InvalidRatio {
            value: s.to_string(),
            reason,
        };

        let mut parts = s.trim().split(':');
        let (a, b) = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), None) => (a, b),
            _ => return Err(invalid("expected A:B")),
        };

        let accept: u32 = a.trim().parse().map_err(|_| invalid("A is not a number"))?;
        let of: u32 = b.trim().parse().map_err(|_| invalid("B is not a number"))?;

        if of == 0 {
            return Err(invalid("B must be positive"));
        }
        if accept > of {
            return Err(invalid("A must not exceed B"));
        }

        Ok(SampleRatio { accept, of })
    }
}

impl TryFrom<String> for SampleRatio {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<SampleRatio> for String {
    fn from(r: SampleRatio) -> String {
        r.to_string()
    }
}

impl fmt::Display for SampleRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.accept, self.of)
    }
}

/// Pipeline configuration
///
/// Every field has a default so a TOML file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// DNS port matched on either side of UDP and TCP
    pub port: u16,
    pub sample_ratio: SampleRatio,
    pub dedup: bool,
    pub dedup_cleanup_interval_secs: u64,
    pub dedup_max_entries: usize,
    /// Capture has no link layer; IP version is taken from the first nibble
    pub no_ethernet: bool,
    pub gc_interval_secs: u64,
    pub decoder_workers: usize,
    pub tcp_shards: usize,
    pub packet_channel_size: usize,
    pub tcp_channel_size: usize,
    pub tcp_return_channel_size: usize,
    pub defrag_channel_size: usize,
    pub result_channel_size: usize,
    pub sink_channel_size: usize,
    pub mask_size4: u8,
    pub mask_size6: u8,
    pub server_name: String,
    pub stats_interval_secs: u64,
    pub drain_timeout_secs: u64,
    pub tcp_max_buffered_segments: usize,
    pub vxlan_port: u16,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            port: 53,
            sample_ratio: SampleRatio::ALL,
            dedup: false,
            dedup_cleanup_interval_secs: 60,
            dedup_max_entries: 1_000_000,
            no_ethernet: false,
            gc_interval_secs: 10,
            decoder_workers: 2,
            tcp_shards: 1,
            packet_channel_size: 1000,
            tcp_channel_size: 10000,
            tcp_return_channel_size: 10000,
            defrag_channel_size: 10000,
            result_channel_size: 100000,
            sink_channel_size: 10000,
            mask_size4: 32,
            mask_size6: 128,
            server_name: "default".to_string(),
            stats_interval_secs: 10,
            drain_timeout_secs: 5,
            tcp_max_buffered_segments: 256,
            vxlan_port: 4789,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        let channels = [
            ("packet_channel_size", self.packet_channel_size),
            ("tcp_channel_size", self.tcp_channel_size),
            ("tcp_return_channel_size", self.tcp_return_channel_size),
            ("defrag_channel_size", self.defrag_channel_size),
            ("result_channel_size", self.result_channel_size),
            ("sink_channel_size", self.sink_channel_size),
            ("decoder_workers", self.decoder_workers),
            ("tcp_shards", self.tcp_shards),
            ("tcp_max_buffered_segments", self.tcp_max_buffered_segments),
        ];
        for &(field, value) in channels.iter() {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.sample_ratio.of == 0 || self.sample_ratio.accept > self.sample_ratio.of {
            return Err(ConfigError::InvalidRatio {
                value: self.sample_ratio.to_string(),
                reason: "A must not exceed B",
            });
        }
        if self.mask_size4 > 32 {
            return Err(ConfigError::Invalid {
                field: "mask_size4",
                reason: format!("{} is longer than 32", self.mask_size4),
            });
        }
        if self.mask_size6 > 128 {
            return Err(ConfigError::Invalid {
                field: "mask_size6",
                reason: format!("{} is longer than 128", self.mask_size6),
            });
        }
        if self.gc_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "gc_interval_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.dedup && self.dedup_cleanup_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "dedup_cleanup_interval_secs",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn dedup_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.dedup_cleanup_interval_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn shutdown_config(&self) -> ShutdownConfig {
        ShutdownConfig {
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
        }
    }
}
