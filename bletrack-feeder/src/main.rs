//! bletrack-feeder: inspect and record the BLE capture link.
//!
//! Supports:
//! - Printing decoded frames from a serial device, TCP bridge, file or stdin
//! - Recording the raw byte stream to a file for offline decoding

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};

use bletrack_core::config::LogLevel;
use bletrack_core::frame::{Frame, FrameDecoder, FrameFormat, HeaderLayout, DEFAULT_MAX_DEVICES};
use bletrack_core::transport::Transport;
use bletrack_core::types::{unix_now, CaptureRecord, TransportError};
use bletrack_feeder::{init_tracing, open_transport};
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(
    name = "bletrack-feeder",
    version,
    about = "BLE capture link inspection and recording"
)]
struct Cli {
    /// Log verbosity (RUST_LOG overrides)
    #[arg(long, value_enum, default_value = "info", global = true)]
    log_level: LevelArg,

    /// Also write logs to a timestamped file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LevelArg {
    Info,
    Debug,
}

impl From<LevelArg> for LogLevel {
    fn from(l: LevelArg) -> Self {
        match l {
            LevelArg::Info => LogLevel::Info,
            LevelArg::Debug => LogLevel::Debug,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Decode frames from the link and print them
    Dump {
        /// Serial device, tcp://host:port, file path, or - for stdin
        source: String,

        /// Serial baud rate
        #[arg(long, default_value = "115200")]
        baud: u32,

        /// Header layout: compact (u8 mac_count) or wide (u16 mac_count)
        #[arg(long, default_value = "wide")]
        layout: String,

        /// Maximum devices accepted per frame
        #[arg(long, default_value_t = DEFAULT_MAX_DEVICES)]
        max_devices: u16,

        /// Read timeout in milliseconds
        #[arg(long, default_value = "1000")]
        timeout_ms: u64,

        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,

        /// Print one JSON document per frame instead of text
        #[arg(long)]
        json: bool,
    },
    /// Copy the raw byte stream to a file
    Record {
        /// Serial device, tcp://host:port, or - for stdin
        source: String,

        /// Output file
        #[arg(short, long)]
        output: String,

        #[arg(long, default_value = "115200")]
        baud: u32,

        #[arg(long, default_value = "1000")]
        timeout_ms: u64,

        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },
}

fn main() {
    let cli = Cli::parse();
    match init_tracing(cli.log_level.into(), cli.log_dir.as_deref()) {
        Ok(Some(path)) => info!(path = %path.display(), "logging to file"),
        Ok(None) => {}
        Err(e) => {
            eprintln!("Error opening log file: {e}");
            std::process::exit(1);
        }
    }

    match cli.command {
        Commands::Dump {
            source,
            baud,
            layout,
            max_devices,
            timeout_ms,
            duration,
            json,
        } => {
            let Some(layout) = HeaderLayout::from_name(&layout) else {
                eprintln!("Error: unknown layout {layout:?} (expected compact or wide)");
                std::process::exit(1);
            };
            let format = FrameFormat::new(layout, max_devices);
            cmd_dump(&source, baud, format, timeout_ms, duration, json)
        }
        Commands::Record {
            source,
            output,
            baud,
            timeout_ms,
            duration,
        } => cmd_record(&source, &output, baud, timeout_ms, duration),
    }
}

fn open_or_exit(source: &str, baud: u32, timeout_ms: u64) -> Box<dyn Transport + Send> {
    match open_transport(source, baud, Duration::from_millis(timeout_ms)) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Error opening {source}: {e}");
            std::process::exit(1);
        }
    }
}

fn expired(started: Instant, duration: Option<u64>) -> bool {
    duration.is_some_and(|d| started.elapsed() >= Duration::from_secs(d))
}

fn cmd_dump(
    source: &str,
    baud: u32,
    format: FrameFormat,
    timeout_ms: u64,
    duration: Option<u64>,
    json: bool,
) {
    let mut transport = open_or_exit(source, baud, timeout_ms);
    let mut decoder = FrameDecoder::new(format);
    info!(source, layout = %format.layout, max_devices = format.max_devices, "dumping frames");

    let started = Instant::now();
    while !expired(started, duration) {
        match decoder.next_frame(&mut transport) {
            Ok(frame) => {
                if json {
                    print_json(frame);
                } else {
                    print_frame(&frame);
                }
            }
            Err(e) if e.is_idle() => continue,
            Err(e) if e.is_fatal() => {
                debug!(error = %e, "input finished");
                break;
            }
            Err(e) => warn!(error = %e, "frame discarded"),
        }
    }
    transport.close();

    let stats = decoder.stats();
    eprintln!(
        "{} frames, {} devices, {} gaps, {} bytes skipped, {} discarded",
        stats.frames,
        stats.devices,
        stats.sequence_gaps,
        stats.bytes_skipped,
        stats.header_errors + stats.device_errors + stats.oversized_frames
    );
}

fn print_frame(frame: &Frame) {
    let h = &frame.header;
    println!();
    println!("=== Buffer {} ===", h.sequence);
    println!("Timestamp: {:.3}", unix_now());
    println!("Total advertisements: {}", h.adv_raw_count);
    println!("Number of MACs: {}", h.mac_count);
    if frame.sequence_gap {
        println!("(sequence gap before this frame)");
    }
    for (i, d) in frame.devices.iter().enumerate() {
        println!("Device {}:", i + 1);
        println!("  MAC: {}", d.mac_string());
        println!("  RSSI: {} dBm", d.rssi);
        println!("  Advertisements: {}", d.n_adv);
    }
}

fn print_json(frame: Frame) {
    let record = CaptureRecord::new(frame, None, unix_now());
    match serde_json::to_string(&record) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "failed to serialize frame"),
    }
}

fn cmd_record(source: &str, output: &str, baud: u32, timeout_ms: u64, duration: Option<u64>) {
    let mut transport = open_or_exit(source, baud, timeout_ms);
    let mut out = match File::create(output) {
        Ok(f) => BufWriter::new(f),
        Err(e) => {
            eprintln!("Error creating {output}: {e}");
            std::process::exit(1);
        }
    };

    info!(source, output, "recording raw stream");
    let started = Instant::now();
    let mut written = 0u64;
    while !expired(started, duration) {
        match transport.read_byte() {
            Ok(b) => {
                if let Err(e) = out.write_all(&[b]) {
                    eprintln!("Error writing {output}: {e}");
                    std::process::exit(1);
                }
                written += 1;
            }
            Err(TransportError::TimedOut) => continue,
            Err(e) => {
                debug!(error = %e, "input finished");
                break;
            }
        }
    }
    transport.close();
    if let Err(e) = out.flush() {
        eprintln!("Error writing {output}: {e}");
        std::process::exit(1);
    }
    eprintln!("Recorded {written} bytes to {output}");
}
