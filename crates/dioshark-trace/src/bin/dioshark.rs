//! Block I/O trace collector.
//!
//! Traces one or more block devices with one collector thread per CPU and
//! prints every record until the trace channels run dry or the process is
//! interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Trace /dev/sda (requires root and a mounted debugfs)
//! sudo dioshark
//!
//! # Trace two devices, writing records to a file
//! sudo dioshark -d /dev/sda -d /dev/nvme0n1 --output trace.txt
//!
//! # Only count records, print the final report as JSON
//! sudo dioshark -d /dev/sdb --quiet --json
//! ```

use clap::Parser;
use dioshark_trace::config::{SetupParams, TraceConfig, DEFAULT_DEBUGFS_ROOT};
use dioshark_trace::session::{RunReport, TraceSession};
use dioshark_trace::sink::{CountingSink, LogSink, RecordSink, WriterSink};
use log::{debug, error, info, warn};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "dioshark")]
#[command(about = "Multi-device, per-CPU block I/O trace collector")]
#[command(version)]
struct Cli {
    /// Block device to trace (repeatable).
    #[arg(short, long = "device", value_name = "PATH", default_value = "/dev/sda")]
    devices: Vec<PathBuf>,

    /// Write records to this file instead of the log.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of collector threads (default: online CPUs).
    #[arg(long)]
    cpus: Option<usize>,

    /// Channel poll timeout in milliseconds.
    #[arg(long, default_value = "1000")]
    timeout_ms: u64,

    /// Consecutive empty reads before a collector stops (0 = never).
    #[arg(long, default_value = "100")]
    empty_reads: u32,

    /// debugfs mount point.
    #[arg(long, default_value = DEFAULT_DEBUGFS_ROOT)]
    debugfs: PathBuf,

    /// Kernel sub-buffer size in bytes.
    #[arg(long)]
    buf_size: Option<u32>,

    /// Number of kernel sub-buffers per CPU.
    #[arg(long)]
    buf_count: Option<u32>,

    /// Category mask (hex with 0x prefix, or decimal).
    #[arg(long, value_parser = parse_mask)]
    act_mask: Option<u16>,

    /// First traced sector.
    #[arg(long, default_value = "0")]
    start_lba: u64,

    /// Last traced sector (0 = end of device).
    #[arg(long, default_value = "0")]
    end_lba: u64,

    /// Only trace I/O issued by this pid (0 = all).
    #[arg(long, default_value = "0")]
    pid: u32,

    /// Print the final report as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Count records without printing them.
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = build_config(&cli);
    if let Err(e) = config.worker_count() {
        error!("{}", e);
        std::process::exit(1);
    }

    let (sink, writer) = match build_sink(&cli) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create {}: {}", display_opt(&cli.output), e);
            std::process::exit(1);
        }
    };

    let mut session = TraceSession::new(config, sink.clone());
    for device in &cli.devices {
        if let Err(e) = session.register(device) {
            error!("{}", e);
            std::process::exit(1);
        }
    }

    let shutdown = session.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        shutdown.request_shutdown();
        debug!("Worker states at shutdown: {:?}", shutdown.worker_states());
    }) {
        warn!("Failed to install signal handler: {}", e);
    }

    info!(
        "Tracing {} device(s) (Ctrl+C to stop)...",
        session.registry().len()
    );
    let report = session.run();

    if let Some(writer) = writer {
        if let Err(e) = writer.flush() {
            error!("Failed to flush {}: {}", display_opt(&cli.output), e);
        }
    }
    if cli.quiet {
        info!("Counted {} records", report.records);
    }
    if cli.json {
        print_json(&report);
    }

    std::process::exit(exit_code(&report));
}

fn build_config(cli: &Cli) -> TraceConfig {
    let defaults = SetupParams::default();
    let setup = SetupParams {
        buf_size: cli.buf_size.unwrap_or(defaults.buf_size),
        buf_nr: cli.buf_count.unwrap_or(defaults.buf_nr),
        act_mask: cli.act_mask.unwrap_or(defaults.act_mask),
        start_lba: cli.start_lba,
        end_lba: cli.end_lba,
        pid: cli.pid,
    };
    let mut config = TraceConfig::default()
        .with_debugfs_root(&cli.debugfs)
        .with_poll_timeout(Duration::from_millis(cli.timeout_ms))
        .with_empty_read_limit(cli.empty_reads)
        .with_setup(setup);
    if let Some(cpus) = cli.cpus {
        config = config.with_cpus(cpus);
    }
    config
}

type FileSink = WriterSink<BufWriter<File>>;

/// The record sink plus, when writing to a file, a handle to flush it.
fn build_sink(cli: &Cli) -> std::io::Result<(Arc<dyn RecordSink>, Option<Arc<FileSink>>)> {
    if cli.quiet {
        let sink: Arc<dyn RecordSink> = Arc::new(CountingSink::default());
        return Ok((sink, None));
    }
    match &cli.output {
        Some(path) => {
            let writer = Arc::new(WriterSink::new(BufWriter::new(File::create(path)?)));
            let sink: Arc<dyn RecordSink> = writer.clone();
            Ok((sink, Some(writer)))
        }
        None => {
            let sink: Arc<dyn RecordSink> = Arc::new(LogSink);
            Ok((sink, None))
        }
    }
}

fn print_json(report: &RunReport) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to serialize report: {}", e),
    }
}

fn exit_code(report: &RunReport) -> i32 {
    if report.is_clean() {
        0
    } else {
        1
    }
}

fn display_opt(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map_or_else(|| "output".to_string(), |p| p.display().to_string())
}

fn parse_mask(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid mask {s:?}: {e}"))
}
