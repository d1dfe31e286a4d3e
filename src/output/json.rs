//! JSON lines sink: one serialized `DnsResult` per line

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crate::output::{DnsResult, Sink, SinkError};

enum Target {
    Stdout,
    File(PathBuf),
}

pub struct JsonLinesSink {
    name: String,
    target: Target,
    writer: Option<BufWriter<Box<dyn Write + Send>>>,
}

impl JsonLinesSink {
    pub fn stdout() -> JsonLinesSink {
        JsonLinesSink {
            name: "stdout".to_string(),
            target: Target::Stdout,
            writer: None,
        }
    }

    /// Appends to `path`, creating it if needed
    pub fn file<P: Into<PathBuf>>(path: P) -> JsonLinesSink {
        let path = path.into();
        JsonLinesSink {
            name: format!("file:{}", path.display()),
            target: Target::File(path),
            writer: None,
        }
    }
}

impl Sink for JsonLinesSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self) -> Result<(), SinkError> {
        let out: Box<dyn Write + Send> = match &self.target {
            Target::Stdout => Box::new(io::stdout()),
            Target::File(path) => {
                let file: File = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| SinkError::Unusable {
                        reason: format!("cannot open {}: {}", path.display(), e),
                    })?;
                Box::new(file)
            }
        };

        self.writer = Some(BufWriter::new(out));
        Ok(())
    }

    fn write(&mut self, result: Arc<DnsResult>) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or_else(|| SinkError::Unusable {
            reason: "not initialized".to_string(),
        })?;

        serde_json::to_writer(&mut *writer, &*result)?;
        writer.write_all(b"\n")?;

        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};

    use chrono::{TimeZone, Utc};

    use crate::capture::TransportProtocol;
    use crate::dns::protocol::{DnsPacket, DnsQuestion, QueryType};

    fn result() -> Arc<DnsResult> {
        let mut dns = DnsPacket::new();
        dns.questions
            .push(DnsQuestion::new("example.net.".to_string(), QueryType::Aaaa));
        Arc::new(DnsResult {
            timestamp: Utc.timestamp_opt(1_650_000_000, 0).unwrap(),
            dns,
            ip_version: 4,
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 53)),
            src_port: Some(33333),
            dst_port: Some(53),
            protocol: TransportProtocol::Tcp,
            packet_length: 29,
            server: Some("lab".to_string()),
        })
    }

    #[test]
    fn test_writes_one_line_per_result() {
        let path = std::env::temp_dir().join(format!("dnsscope-json-{}.jsonl", std::process::id()));
        std::fs::remove_file(&path).ok();

        let mut sink = JsonLinesSink::file(&path);
        sink.initialize().unwrap();
        sink.write(result()).unwrap();
        sink.write(result()).unwrap();
        sink.close().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["protocol"], "tcp");
        assert_eq!(value["server"], "lab");
        assert_eq!(value["dns"]["questions"][0]["name"], "example.net.");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_unwritable_path_is_unusable() {
        let mut sink = JsonLinesSink::file("/nonexistent-dir/for/dnsscope/out.jsonl");
        assert!(matches!(
            sink.initialize(),
            Err(SinkError::Unusable { .. })
        ));
    }

    #[test]
    fn test_write_before_initialize_fails() {
        let mut sink = JsonLinesSink::stdout();
        assert!(sink.write(result()).is_err());
    }
}
