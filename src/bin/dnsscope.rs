//! dnsscope command line
//!
//! Replays a capture file through the pipeline and writes one JSON object per
//! DNS message to stdout or a file. Logs go to stderr.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use dnsscope::capture::source::PcapFileSource;
use dnsscope::config::{PipelineConfig, SampleRatio};
use dnsscope::output::json::JsonLinesSink;
use dnsscope::pipeline::{Pipeline, PipelineError, PipelineReport};

/// Passive DNS capture: reassemble, parse and export DNS traffic
#[derive(Parser)]
#[command(name = "dnsscope")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Capture file to read (pcap or pcapng)
    #[arg(short = 'r', long, env = "DNSSCOPE_PCAP")]
    pcap: PathBuf,

    /// Pipeline configuration file (TOML)
    #[arg(short, long, env = "DNSSCOPE_CONFIG")]
    config: Option<PathBuf>,

    /// DNS port to match
    #[arg(short, long, env = "DNSSCOPE_PORT")]
    port: Option<u16>,

    /// Sampling ratio A:B
    #[arg(long, env = "DNSSCOPE_SAMPLE_RATIO")]
    sample_ratio: Option<SampleRatio>,

    /// Drop packets whose bytes were already seen in the dedup window
    #[arg(long, env = "DNSSCOPE_DEDUP")]
    dedup: bool,

    /// Capture has no link layer header
    #[arg(long, env = "DNSSCOPE_NO_ETHERNET")]
    no_ethernet: bool,

    #[arg(long, env = "DNSSCOPE_DECODER_WORKERS")]
    decoder_workers: Option<usize>,

    #[arg(long, env = "DNSSCOPE_TCP_SHARDS")]
    tcp_shards: Option<usize>,

    /// Identity recorded in every result
    #[arg(long, env = "DNSSCOPE_SERVER_NAME")]
    server_name: Option<String>,

    /// Write results to this file instead of stdout
    #[arg(short, long, env = "DNSSCOPE_OUTPUT")]
    output: Option<PathBuf>,

    /// Log filter, e.g. "info" or "dnsscope=debug"
    #[arg(long, env = "DNSSCOPE_LOG", default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, env = "DNSSCOPE_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[derive(ValueEnum, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let init_result = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
    };

    if let Err(e) = init_result {
        eprintln!("Warning: logger already initialized: {}", e);
    }
}

fn build_config(cli: &Cli) -> Result<PipelineConfig, PipelineError> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_toml_file(path)?,
        None => PipelineConfig::default(),
    };

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(ratio) = cli.sample_ratio {
        config.sample_ratio = ratio;
    }
    if cli.dedup {
        config.dedup = true;
    }
    if cli.no_ethernet {
        config.no_ethernet = true;
    }
    if let Some(workers) = cli.decoder_workers {
        config.decoder_workers = workers;
    }
    if let Some(shards) = cli.tcp_shards {
        config.tcp_shards = shards;
    }
    if let Some(name) = &cli.server_name {
        config.server_name = name.clone();
    }

    Ok(config)
}

async fn run(cli: Cli) -> Result<PipelineReport, PipelineError> {
    let config = build_config(&cli)?;
    let mut pipeline = Pipeline::new(config)?;

    let sink = match &cli.output {
        Some(path) => JsonLinesSink::file(path),
        None => JsonLinesSink::stdout(),
    };
    pipeline.add_sink(Box::new(sink));

    let source = PcapFileSource::open(&cli.pcap)?;

    pipeline.shutdown_handle().install_signal_handlers();

    pipeline.run(source).await
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "dnsscope starting");

    match run(cli).await {
        Ok(report) => {
            tracing::info!(
                packets = report.packets_read,
                accepted = report.accepted,
                ratio_skipped = report.ratio_skipped,
                duplicates = report.duplicates,
                results = report.dispatched,
                drained = report.drained,
                "dnsscope finished"
            );
            for sink in &report.sinks {
                tracing::info!(
                    sink = %sink.name,
                    written = sink.written,
                    failed = sink.failed,
                    "sink summary"
                );
            }
            if !report.drained {
                std::process::exit(2);
            }
        }
        Err(e) => {
            tracing::error!("dnsscope failed: {}", e);
            std::process::exit(1);
        }
    }
}
