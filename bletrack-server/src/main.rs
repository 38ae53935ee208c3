//! bletrack: CLI for BLE capture tracking.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{Cell, Table};

use bletrack_core::config::{self, Config, GpsMode, LogLevel, StorageEndpoint};
use bletrack_core::frame::{Frame, FrameDecoder, FrameFormat, HeaderLayout};
use bletrack_core::lifecycle::Lifecycle;
use bletrack_core::types::{mac_to_string, unix_now, CaptureRecord, Mac};
use bletrack_feeder::{init_tracing, open_transport};
use tracing::{info, warn};

mod db;
mod notification;
mod track;

#[derive(Parser)]
#[command(name = "bletrack", version, about = "BLE capture tracker with GPS correlation")]
struct Cli {
    /// Log verbosity (default from config; RUST_LOG overrides)
    #[arg(long, value_enum, global = true)]
    log_level: Option<LevelArg>,

    /// Also write logs to a timestamped file in this directory
    #[arg(long, global = true)]
    log_dir: Option<String>,

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

#[derive(Clone, Copy, ValueEnum)]
enum GpsModeArg {
    Inline,
    Thread,
}

impl From<GpsModeArg> for GpsMode {
    fn from(m: GpsModeArg) -> Self {
        match m {
            GpsModeArg::Inline => GpsMode::Inline,
            GpsModeArg::Thread => GpsMode::Thread,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Capture from the link with persistence and notifications
    Track {
        /// Serial device, tcp://host:port, file path, or - for stdin
        #[arg(long)]
        link: Option<String>,

        /// Link baud rate
        #[arg(long)]
        baud: Option<u32>,

        /// Header layout: compact or wide
        #[arg(long)]
        layout: Option<String>,

        /// Maximum devices accepted per frame
        #[arg(long)]
        max_devices: Option<u16>,

        /// GPS source (same identifiers as --link)
        #[arg(long)]
        gps: Option<String>,

        #[arg(long, value_enum)]
        gps_mode: Option<GpsModeArg>,

        /// SQLite path, ndjson:<path>, or none
        #[arg(long)]
        storage: Option<String>,

        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,

        /// Notification queue capacity (0 = unbounded)
        #[arg(long)]
        queue_capacity: Option<usize>,

        #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
        telegram_token: Option<String>,

        /// Telegram chat to notify (repeatable)
        #[arg(long = "chat-id")]
        chat_ids: Vec<i64>,

        /// URL to POST notifications to
        #[arg(long)]
        webhook: Option<String>,
    },

    /// Decode a recorded capture file and print a device table
    Decode {
        /// Capture file, or - for stdin
        file: String,

        #[arg(long)]
        layout: Option<String>,

        #[arg(long)]
        max_devices: Option<u16>,

        /// Print every frame instead of the summary table
        #[arg(short, long)]
        raw: bool,
    },

    /// Decode a recorded capture file into the SQLite database
    Import {
        /// Capture file, or - for stdin
        file: String,

        /// SQLite database path (default from config)
        #[arg(long)]
        db_path: Option<String>,

        #[arg(long)]
        layout: Option<String>,

        #[arg(long)]
        max_devices: Option<u16>,
    },

    /// Show database statistics
    Stats {
        /// SQLite database path (default from config)
        #[arg(long)]
        db_path: Option<String>,

        /// Devices to list
        #[arg(long, default_value = "10")]
        top: i64,

        /// Also list the most recent captures
        #[arg(long, default_value = "0")]
        recent: i64,

        /// Show one device by MAC
        #[arg(long)]
        mac: Option<String>,

        /// Print the stored JSON document of one capture
        #[arg(long)]
        capture: Option<i64>,
    },

    /// Print the lifecycle state diagram as Graphviz DOT
    Graph,

    /// Show the active configuration
    Config {
        /// Write the configuration (defaults plus any existing values) to disk
        #[arg(long)]
        init: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let mut cfg = config::load_config().unwrap_or_else(|e| {
        eprintln!("Error loading {}: {e}", config::config_file().display());
        std::process::exit(1);
    });
    if let Some(dir) = cli.log_dir {
        cfg.log_dir = Some(dir);
    }
    let level = cli.log_level.map(LogLevel::from).unwrap_or(cfg.log_level);
    match init_tracing(level, cfg.log_dir.as_deref().map(Path::new)) {
        Ok(Some(path)) => info!(path = %path.display(), "logging to file"),
        Ok(None) => {}
        Err(e) => {
            eprintln!("Error opening log file: {e}");
            std::process::exit(1);
        }
    }

    match cli.command {
        Commands::Track {
            link,
            baud,
            layout,
            max_devices,
            gps,
            gps_mode,
            storage,
            duration,
            queue_capacity,
            telegram_token,
            chat_ids,
            webhook,
        } => {
            if let Some(v) = link {
                cfg.link.transport = v;
            }
            if let Some(v) = baud {
                cfg.link.baud = v;
            }
            if let Some(v) = layout {
                cfg.link.layout = parse_layout(&v);
            }
            if let Some(v) = max_devices {
                cfg.link.max_devices = v;
            }
            if gps.is_some() {
                cfg.gps.source = gps;
            }
            if let Some(v) = gps_mode {
                cfg.gps.mode = v.into();
            }
            if let Some(v) = storage {
                cfg.storage = StorageEndpoint::parse(&v);
            }
            if duration.is_some() {
                cfg.capture.duration_secs = duration;
            }
            if let Some(v) = queue_capacity {
                cfg.capture.queue_capacity = v;
            }
            if telegram_token.is_some() {
                cfg.notify.telegram_token = telegram_token;
            }
            if !chat_ids.is_empty() {
                cfg.notify.chat_ids = chat_ids;
            }
            if webhook.is_some() {
                cfg.notify.webhook = webhook;
            }
            cmd_track(&cfg)
        }
        Commands::Decode {
            file,
            layout,
            max_devices,
            raw,
        } => {
            let layout = layout.map_or(cfg.link.layout, |l| parse_layout(&l));
            let format = FrameFormat::new(layout, max_devices.unwrap_or(cfg.link.max_devices));
            cmd_decode(&file, format, raw)
        }
        Commands::Import {
            file,
            db_path,
            layout,
            max_devices,
        } => {
            let layout = layout.map_or(cfg.link.layout, |l| parse_layout(&l));
            let format = FrameFormat::new(layout, max_devices.unwrap_or(cfg.link.max_devices));
            cmd_import(&file, &db_path_or_config(db_path, &cfg), format)
        }
        Commands::Stats {
            db_path,
            top,
            recent,
            mac,
            capture,
        } => {
            let path = db_path_or_config(db_path, &cfg);
            if let Some(id) = capture {
                cmd_show_capture(&path, id)
            } else if let Some(mac) = mac {
                cmd_show_device(&path, &mac)
            } else {
                cmd_stats(&path, top, recent)
            }
        }
        Commands::Graph => print!("{}", Lifecycle::to_dot()),
        Commands::Config { init } => cmd_config(&cfg, init),
    }
}

fn parse_layout(name: &str) -> HeaderLayout {
    HeaderLayout::from_name(name).unwrap_or_else(|| {
        eprintln!("Error: unknown layout {name:?} (expected compact or wide)");
        std::process::exit(1);
    })
}

fn db_path_or_config(db_path: Option<String>, cfg: &Config) -> String {
    match (db_path, &cfg.storage) {
        (Some(p), _) => p,
        (None, StorageEndpoint::Sqlite(p)) => p.clone(),
        (None, other) => {
            eprintln!(
                "Error: storage is {}, pass --db-path to use a database",
                other.describe()
            );
            std::process::exit(1);
        }
    }
}

fn open_db(db_path: &str) -> db::Database {
    db::Database::open(db_path).unwrap_or_else(|e| {
        eprintln!("Error opening database {db_path}: {e}");
        std::process::exit(1);
    })
}

fn or_dash<T: ToString>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or("-".into())
}

// ---------------------------------------------------------------------------
// track
// ---------------------------------------------------------------------------

fn cmd_track(cfg: &Config) {
    let report = track::run_track(cfg).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    println!();
    match &report.outcome {
        Ok(summary) => println!(
            "Track stopped ({:?}) after {:.1}s",
            summary.reason, summary.elapsed_secs
        ),
        Err(e) => println!("Track aborted: {e}"),
    }
    println!("  Link:     {}", cfg.link.transport);
    println!("  Storage:  {}", report.storage);
    if let Some(id) = report.session_id {
        println!("  Session:  {id}");
    }
    println!("  State:    {}", report.final_state);
    println!();

    let c = &report.capture;
    let d = &report.decoder;
    let mut table = Table::new();
    table.set_header(vec!["Counter", "Value"]);
    let rows: Vec<(&str, u64)> = vec![
        ("Frames", d.frames),
        ("Devices", d.devices),
        ("Sequence gaps", d.sequence_gaps),
        ("Bytes skipped", d.bytes_skipped),
        ("Frames discarded", d.header_errors + d.device_errors + d.oversized_frames),
        ("Records with fix", c.with_fix),
        ("Stored", c.stored),
        ("Store failures", c.store_failures),
        ("Persist skipped", c.persist_skipped),
        ("Notifications", c.notifications),
        ("Delivered", report.dispatch.delivered),
        ("Delivery failures", report.dispatch.failed),
        ("Queue dropped", report.queue_dropped),
    ];
    for (name, value) in rows {
        table.add_row(vec![Cell::new(name), Cell::new(value)]);
    }
    if let Some(gps) = report.gps {
        table.add_row(vec![Cell::new("GPS sentences"), Cell::new(gps.sentences)]);
        table.add_row(vec![Cell::new("GPS fixes"), Cell::new(gps.fixes)]);
    }
    println!("{table}");

    if report.outcome.is_err() {
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// decode
// ---------------------------------------------------------------------------

/// Per-MAC totals over a decoded capture.
struct DeviceTally {
    mac: Mac,
    frames: u32,
    advertisements: u64,
    best_rssi: i8,
    last_rssi: i8,
    addr_type: u8,
}

impl DeviceTally {
    fn new(mac: Mac) -> Self {
        DeviceTally {
            mac,
            frames: 0,
            advertisements: 0,
            best_rssi: i8::MIN,
            last_rssi: i8::MIN,
            addr_type: 0,
        }
    }
}

fn tally_frame(devices: &mut HashMap<Mac, DeviceTally>, frame: &Frame) {
    for d in &frame.devices {
        let tally = devices.entry(d.mac).or_insert_with(|| DeviceTally::new(d.mac));
        tally.frames += 1;
        tally.advertisements += u64::from(d.n_adv);
        tally.best_rssi = tally.best_rssi.max(d.rssi);
        tally.last_rssi = d.rssi;
        tally.addr_type = d.addr_type;
    }
}

/// Decode every frame in a recorded capture, calling `on_frame` in order.
fn for_each_frame(
    file: &str,
    format: FrameFormat,
    mut on_frame: impl FnMut(Frame),
) -> FrameDecoder {
    let mut transport = open_transport(file, 0, Duration::from_secs(1)).unwrap_or_else(|e| {
        eprintln!("Error opening {file}: {e}");
        std::process::exit(1);
    });

    let mut decoder = FrameDecoder::new(format);
    loop {
        match decoder.next_frame(&mut transport) {
            Ok(frame) => on_frame(frame),
            Err(e) if e.is_fatal() => break,
            Err(_) => continue,
        }
    }
    transport.close();
    decoder
}

fn cmd_decode(file: &str, format: FrameFormat, raw: bool) {
    let mut devices: HashMap<Mac, DeviceTally> = HashMap::new();
    let mut first_seq = None;
    let mut last_seq = None;

    let decoder = for_each_frame(file, format, |frame| {
        first_seq.get_or_insert(frame.header.sequence);
        last_seq = Some(frame.header.sequence);
        if raw {
            println!("{frame:?}");
        }
        tally_frame(&mut devices, &frame);
    });

    if !raw {
        print_decode_summary(&devices, &decoder, first_seq, last_seq);
    }
}

fn print_decode_summary(
    devices: &HashMap<Mac, DeviceTally>,
    decoder: &FrameDecoder,
    first_seq: Option<u8>,
    last_seq: Option<u8>,
) {
    let stats = decoder.stats();
    println!();
    println!(
        "Frames: {} decoded ({} layout), {} gaps, {} bytes skipped, {} devices",
        stats.frames,
        decoder.format().layout,
        stats.sequence_gaps,
        stats.bytes_skipped,
        devices.len()
    );
    if let (Some(first), Some(last)) = (first_seq, last_seq) {
        println!("Sequence: {first} .. {last}");
    }
    println!();

    if devices.is_empty() {
        return;
    }

    let mut table = Table::new();
    table.set_header(vec!["MAC", "Type", "Frames", "Advs", "Best RSSI", "Last RSSI"]);

    let mut sorted: Vec<_> = devices.values().collect();
    sorted.sort_by_key(|d| (std::cmp::Reverse(d.frames), d.mac));

    for d in sorted {
        table.add_row(vec![
            Cell::new(mac_to_string(&d.mac)),
            Cell::new(if d.addr_type == 0 { "public" } else { "random" }),
            Cell::new(d.frames),
            Cell::new(d.advertisements),
            Cell::new(format!("{} dBm", d.best_rssi)),
            Cell::new(format!("{} dBm", d.last_rssi)),
        ]);
    }

    println!("{table}");
}

// ---------------------------------------------------------------------------
// import
// ---------------------------------------------------------------------------

fn cmd_import(file: &str, db_path: &str, format: FrameFormat) {
    let mut database = open_db(db_path);
    let session_id = database
        .start_session(file, format.layout.name())
        .unwrap_or_else(|e| {
            eprintln!("Error starting session: {e}");
            std::process::exit(1);
        });

    // Batch mode for throughput
    if let Err(e) = database.set_batch(true) {
        eprintln!("Error starting transaction: {e}");
        std::process::exit(1);
    }

    // Offline captures carry no wall clock; stamp with import time.
    let imported_at = unix_now();
    let mut stored = 0u64;
    let mut failed = 0u64;
    let decoder = for_each_frame(file, format, |frame| {
        let record = CaptureRecord::new(frame, None, imported_at);
        match database.insert_capture(&record) {
            Ok(_) => stored += 1,
            Err(e) => {
                failed += 1;
                warn!(sequence = record.header().sequence, error = %e, "capture not imported");
            }
        }
    });

    let stats = decoder.stats();
    let finished = database.set_batch(false).and_then(|_| {
        database.end_session(
            session_id,
            "import",
            stats.frames,
            stored,
            stats.sequence_gaps,
            stats.bytes_skipped,
        )
    });
    if let Err(e) = finished {
        eprintln!("Error committing import: {e}");
        std::process::exit(1);
    }

    println!();
    println!("Import complete: {file}");
    println!(
        "  Frames: {} decoded, {} stored, {} failed, {} gaps",
        stats.frames, stored, failed, stats.sequence_gaps
    );
    println!("  Session: {session_id}");
    println!("  Database: {db_path} ({} captures)", database.count_captures());
}

// ---------------------------------------------------------------------------
// stats / config
// ---------------------------------------------------------------------------

fn cmd_stats(db_path: &str, top: i64, recent: i64) {
    let database = open_db(db_path);
    let stats = database.stats();

    println!();
    println!("Database: {db_path}");
    println!();
    println!("  Sessions:   {}", stats.sessions);
    println!("  Captures:   {}", stats.captures);
    println!("  With fix:   {}", stats.with_fix);
    println!("  Sightings:  {}", stats.sightings);
    println!("  Devices:    {}", stats.devices);
    println!();

    let devices = database.top_devices(top).unwrap_or_else(|e| {
        eprintln!("Error reading devices: {e}");
        std::process::exit(1);
    });
    if !devices.is_empty() {
        let mut table = Table::new();
        table.set_header(vec!["MAC", "Sightings", "Best RSSI", "Last lat", "Last lon"]);
        for d in devices {
            table.add_row(vec![
                Cell::new(d.mac),
                Cell::new(d.sightings),
                Cell::new(or_dash(d.best_rssi)),
                Cell::new(or_dash(d.last_lat.map(|l| format!("{l:.5}")))),
                Cell::new(or_dash(d.last_lon.map(|l| format!("{l:.5}")))),
            ]);
        }
        println!("{table}");
    }

    if recent <= 0 {
        return;
    }
    let captures = database.recent_captures(recent).unwrap_or_else(|e| {
        eprintln!("Error reading captures: {e}");
        std::process::exit(1);
    });
    println!();
    let mut table = Table::new();
    table.set_header(vec!["ID", "Time", "Seq", "Advs", "MACs", "Lat", "Lon"]);
    for c in captures {
        table.add_row(vec![
            Cell::new(c.id),
            Cell::new(format!("{:.3}", c.timestamp)),
            Cell::new(c.sequence),
            Cell::new(c.adv_raw_count),
            Cell::new(c.mac_count),
            Cell::new(or_dash(c.lat.map(|l| format!("{l:.5}")))),
            Cell::new(or_dash(c.lon.map(|l| format!("{l:.5}")))),
        ]);
    }
    println!("{table}");
}

fn cmd_show_device(db_path: &str, mac: &str) {
    let database = open_db(db_path);
    match database.get_device(&mac.to_ascii_uppercase()) {
        Ok(Some(d)) => match serde_json::to_string_pretty(&d) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("Error: {e}"),
        },
        Ok(None) => {
            eprintln!("No device {mac} in {db_path}");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error reading device: {e}");
            std::process::exit(1);
        }
    }
}

fn cmd_show_capture(db_path: &str, capture_id: i64) {
    let database = open_db(db_path);
    match database.capture_document(capture_id) {
        Ok(Some(doc)) => println!("{doc:#}"),
        Ok(None) => {
            eprintln!("No capture {capture_id} in {db_path}");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error reading capture: {e}");
            std::process::exit(1);
        }
    }
}

fn cmd_config(cfg: &Config, init: bool) {
    if init {
        match config::save_config(cfg) {
            Ok(path) => println!("Wrote {}", path.display()),
            Err(e) => {
                eprintln!("Error writing config: {e}");
                std::process::exit(1);
            }
        }
        return;
    }
    println!("# {}", config::config_file().display());
    print!("{}", config::serialize_config(cfg));
}

#[cfg(test)]
mod tests {
    use super::*;
    use bletrack_core::frame::FrameHeader;
    use bletrack_core::types::{mac_from_str, DeviceRecord, ADV_DATA_LEN};

    fn frame(seq: u8, seen: &[(&str, i8)]) -> Frame {
        let devices: Vec<DeviceRecord> = seen
            .iter()
            .map(|(mac, rssi)| DeviceRecord {
                mac: mac_from_str(mac).unwrap(),
                addr_type: 1,
                adv_type: 0,
                rssi: *rssi,
                data_len: 0,
                data: [0; ADV_DATA_LEN],
                n_adv: 3,
            })
            .collect();
        Frame {
            header: FrameHeader {
                sequence: seq,
                adv_raw_count: 3 * devices.len() as u16,
                mac_count: devices.len() as u16,
            },
            devices,
            sequence_gap: false,
        }
    }

    #[test]
    fn test_tally_tracks_best_and_last_rssi() {
        let mut devices = HashMap::new();
        tally_frame(
            &mut devices,
            &frame(1, &[("AA:00:00:00:00:01", -70), ("AA:00:00:00:00:02", -50)]),
        );
        tally_frame(&mut devices, &frame(2, &[("AA:00:00:00:00:01", -40)]));
        tally_frame(&mut devices, &frame(3, &[("AA:00:00:00:00:01", -90)]));

        let a = &devices[&mac_from_str("AA:00:00:00:00:01").unwrap()];
        assert_eq!(a.frames, 3);
        assert_eq!(a.advertisements, 9);
        assert_eq!(a.best_rssi, -40);
        assert_eq!(a.last_rssi, -90);
        assert_eq!(devices.len(), 2);
    }

    #[test]
    fn test_cli_global_log_flags_after_subcommand() {
        let args = ["bletrack", "stats", "--log-dir", "/tmp/bt", "--log-level", "debug"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.log_dir.as_deref(), Some("/tmp/bt"));
        assert!(matches!(cli.log_level, Some(LevelArg::Debug)));
        assert!(matches!(cli.command, Commands::Stats { .. }));
    }

    #[test]
    fn test_cli_parses_track_overrides() {
        let cli = Cli::try_parse_from([
            "bletrack",
            "track",
            "--link",
            "tcp://127.0.0.1:7000",
            "--layout",
            "compact",
            "--chat-id",
            "1",
            "--chat-id",
            "2",
            "--gps-mode",
            "thread",
        ])
        .unwrap();
        match cli.command {
            Commands::Track {
                link,
                layout,
                chat_ids,
                gps_mode,
                ..
            } => {
                assert_eq!(link.as_deref(), Some("tcp://127.0.0.1:7000"));
                assert_eq!(layout.as_deref(), Some("compact"));
                assert_eq!(chat_ids, vec![1, 2]);
                assert!(matches!(gps_mode, Some(GpsModeArg::Thread)));
            }
            _ => panic!("expected track"),
        }
    }
}
