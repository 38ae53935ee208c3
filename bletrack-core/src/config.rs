//! Configuration file management for bletrack.
//!
//! Reads/writes `~/.bletrack/config.yaml` with link, GPS, capture, storage
//! and notifier settings. CLI flags override whatever is loaded here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::frame::{FrameFormat, HeaderLayout, DEFAULT_MAX_DEVICES};
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::types::ConfigError;

/// Full configuration structure.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub link: LinkConfig,
    pub gps: GpsConfig,
    pub capture: CaptureConfig,
    pub storage: StorageEndpoint,
    pub notify: NotifyConfig,
    pub log_level: LogLevel,
    /// Directory for timestamped log files. `None` logs to stderr only.
    pub log_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    /// Serial device path, `tcp://host:port`, `-` for stdin, or a file path.
    pub transport: String,
    pub baud: u32,
    pub layout: HeaderLayout,
    pub max_devices: u16,
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpsConfig {
    pub source: Option<String>,
    pub baud: u32,
    pub mode: GpsMode,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    pub duration_secs: Option<u64>,
    /// 0 means unbounded.
    pub queue_capacity: usize,
    pub rescan_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotifyConfig {
    pub telegram_token: Option<String>,
    pub chat_ids: Vec<i64>,
    pub webhook: Option<String>,
    pub drain_interval_secs: u64,
    /// Max notifications per drain; 0 drains everything queued.
    pub batch: usize,
}

/// Where capture records go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEndpoint {
    Sqlite(String),
    JsonLines(String),
    Disabled,
}

impl StorageEndpoint {
    /// `ndjson:<path>` selects the JSON-lines sink; anything else is a SQLite path.
    pub fn parse(s: &str) -> StorageEndpoint {
        let s = s.trim();
        if s.is_empty() || s == "none" || s == "null" || s == "~" {
            StorageEndpoint::Disabled
        } else if let Some(path) = s.strip_prefix("ndjson:") {
            StorageEndpoint::JsonLines(path.to_string())
        } else {
            StorageEndpoint::Sqlite(s.strip_prefix("sqlite:").unwrap_or(s).to_string())
        }
    }

    pub fn describe(&self) -> String {
        match self {
            StorageEndpoint::Sqlite(p) => p.clone(),
            StorageEndpoint::JsonLines(p) => format!("ndjson:{p}"),
            StorageEndpoint::Disabled => "none".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpsMode {
    /// Polled once per capture loop iteration.
    #[default]
    Inline,
    /// Polled on a dedicated thread.
    Thread,
}

impl GpsMode {
    pub fn name(self) -> &'static str {
        match self {
            GpsMode::Inline => "inline",
            GpsMode::Thread => "thread",
        }
    }

    pub fn from_name(s: &str) -> Option<GpsMode> {
        match s {
            "inline" => Some(GpsMode::Inline),
            "thread" => Some(GpsMode::Thread),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    pub fn name(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }

    pub fn from_name(s: &str) -> Option<LogLevel> {
        match s {
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            _ => None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            link: LinkConfig {
                transport: "/dev/ttyUSB0".into(),
                baud: 115_200,
                layout: HeaderLayout::default(),
                max_devices: DEFAULT_MAX_DEVICES,
                read_timeout_ms: 1000,
            },
            gps: GpsConfig {
                source: None,
                baud: 9600,
                mode: GpsMode::default(),
                poll_interval_ms: 200,
            },
            capture: CaptureConfig {
                duration_secs: None,
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
                rescan_interval_secs: 60,
            },
            storage: StorageEndpoint::Sqlite("data/bletrack.db".into()),
            notify: NotifyConfig {
                telegram_token: None,
                chat_ids: Vec::new(),
                webhook: None,
                drain_interval_secs: 2,
                batch: 0,
            },
            log_level: LogLevel::default(),
            log_dir: None,
        }
    }
}

impl Config {
    pub fn frame_format(&self) -> FrameFormat {
        FrameFormat::new(self.link.layout, self.link.max_devices)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.link.read_timeout_ms)
    }

    pub fn capture_duration(&self) -> Option<Duration> {
        self.capture.duration_secs.map(Duration::from_secs)
    }
}

/// Get the config directory path (`~/.bletrack/`).
pub fn config_dir() -> PathBuf {
    dirs_home().join(".bletrack")
}

/// Get the config file path.
pub fn config_file() -> PathBuf {
    config_dir().join("config.yaml")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load config from `~/.bletrack/config.yaml`.
///
/// Returns defaults if the file doesn't exist.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_file())
}

pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(path)?;
    parse_config(&text)
}

/// Save config to `~/.bletrack/config.yaml`.
pub fn save_config(config: &Config) -> Result<PathBuf, ConfigError> {
    let path = config_file();
    save_config_to(config, &path)?;
    Ok(path)
}

pub fn save_config_to(config: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, serialize_config(config))?;
    Ok(())
}

/// Parse simple YAML-like config text. Unknown keys are ignored.
pub fn parse_config(text: &str) -> Result<Config, ConfigError> {
    let mut config = Config::default();
    let mut current_section: Option<String> = None;

    for line in text.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }

        let is_indented = line.starts_with("  ") || line.starts_with('\t');

        let Some((key, val)) = stripped.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let val = val.trim();

        if !is_indented {
            if val.is_empty() {
                current_section = Some(key.to_string());
                continue;
            }
            current_section = None;
            match key {
                "log_level" => config.log_level = parse_enum(key, val, LogLevel::from_name)?,
                "log_dir" => config.log_dir = parse_string_value(val),
                _ => {}
            }
            continue;
        }

        let Some(section) = current_section.as_deref() else {
            continue;
        };
        let full_key = format!("{section}.{key}");
        match (section, key) {
            ("link", "transport") => {
                if let Some(v) = parse_string_value(val) {
                    config.link.transport = v;
                }
            }
            ("link", "baud") => config.link.baud = parse_number(&full_key, val)?,
            ("link", "layout") => {
                config.link.layout = parse_enum(&full_key, val, HeaderLayout::from_name)?
            }
            ("link", "max_devices") => config.link.max_devices = parse_number(&full_key, val)?,
            ("link", "read_timeout_ms") => {
                config.link.read_timeout_ms = parse_number(&full_key, val)?
            }

            ("gps", "source") => config.gps.source = parse_string_value(val),
            ("gps", "baud") => config.gps.baud = parse_number(&full_key, val)?,
            ("gps", "mode") => config.gps.mode = parse_enum(&full_key, val, GpsMode::from_name)?,
            ("gps", "poll_interval_ms") => {
                config.gps.poll_interval_ms = parse_number(&full_key, val)?
            }

            ("capture", "duration_secs") => {
                config.capture.duration_secs = match parse_string_value(val) {
                    Some(_) => Some(parse_number(&full_key, val)?),
                    None => None,
                }
            }
            ("capture", "queue_capacity") => {
                config.capture.queue_capacity = parse_number(&full_key, val)?
            }
            ("capture", "rescan_interval_secs") => {
                config.capture.rescan_interval_secs = parse_number(&full_key, val)?
            }

            ("storage", "endpoint") => {
                let endpoint = parse_string_value(val).unwrap_or_default();
                config.storage = StorageEndpoint::parse(&endpoint);
            }

            ("notify", "telegram_token") => config.notify.telegram_token = parse_string_value(val),
            ("notify", "chat_ids") => config.notify.chat_ids = parse_id_list(&full_key, val)?,
            ("notify", "webhook") => config.notify.webhook = parse_string_value(val),
            ("notify", "drain_interval_secs") => {
                config.notify.drain_interval_secs = parse_number(&full_key, val)?
            }
            ("notify", "batch") => config.notify.batch = parse_number(&full_key, val)?,
            _ => {}
        }
    }

    Ok(config)
}

fn invalid(key: &str, val: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: val.to_string(),
    }
}

fn parse_string_value(val: &str) -> Option<String> {
    if val == "null" || val == "~" || val.is_empty() {
        return None;
    }
    // Strip quotes
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return Some(val[1..val.len() - 1].to_string());
    }
    Some(val.to_string())
}

fn parse_number<N: std::str::FromStr>(key: &str, val: &str) -> Result<N, ConfigError> {
    let v = parse_string_value(val).unwrap_or_default();
    v.parse().map_err(|_| invalid(key, val))
}

fn parse_enum<E>(key: &str, val: &str, from_name: fn(&str) -> Option<E>) -> Result<E, ConfigError> {
    let v = parse_string_value(val).unwrap_or_default();
    from_name(&v).ok_or_else(|| invalid(key, val))
}

fn parse_id_list(key: &str, val: &str) -> Result<Vec<i64>, ConfigError> {
    let Some(v) = parse_string_value(val) else {
        return Ok(Vec::new());
    };
    v.trim_matches(|c| c == '[' || c == ']')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().map_err(|_| invalid(key, val)))
        .collect()
}

fn opt_line(key: &str, val: Option<impl std::fmt::Display>, quoted: bool) -> String {
    match val {
        Some(v) if quoted => format!("  {key}: \"{v}\""),
        Some(v) => format!("  {key}: {v}"),
        None => format!("  {key}: null"),
    }
}

/// Serialize config to YAML-like text.
pub fn serialize_config(config: &Config) -> String {
    let mut lines = vec!["# bletrack configuration".to_string(), String::new()];

    lines.push("link:".into());
    lines.push(format!("  transport: \"{}\"", config.link.transport));
    lines.push(format!("  baud: {}", config.link.baud));
    lines.push(format!("  layout: {}", config.link.layout));
    lines.push(format!("  max_devices: {}", config.link.max_devices));
    lines.push(format!("  read_timeout_ms: {}", config.link.read_timeout_ms));
    lines.push(String::new());

    lines.push("gps:".into());
    lines.push(opt_line("source", config.gps.source.as_ref(), true));
    lines.push(format!("  baud: {}", config.gps.baud));
    lines.push(format!("  mode: {}", config.gps.mode.name()));
    lines.push(format!("  poll_interval_ms: {}", config.gps.poll_interval_ms));
    lines.push(String::new());

    lines.push("capture:".into());
    lines.push(opt_line("duration_secs", config.capture.duration_secs, false));
    lines.push(format!("  queue_capacity: {}", config.capture.queue_capacity));
    lines.push(format!(
        "  rescan_interval_secs: {}",
        config.capture.rescan_interval_secs
    ));
    lines.push(String::new());

    lines.push("storage:".into());
    lines.push(format!("  endpoint: \"{}\"", config.storage.describe()));
    lines.push(String::new());

    lines.push("notify:".into());
    lines.push(opt_line("telegram_token", config.notify.telegram_token.as_ref(), true));
    let ids: Vec<String> = config.notify.chat_ids.iter().map(|id| id.to_string()).collect();
    lines.push(format!("  chat_ids: [{}]", ids.join(", ")));
    lines.push(opt_line("webhook", config.notify.webhook.as_ref(), true));
    lines.push(format!(
        "  drain_interval_secs: {}",
        config.notify.drain_interval_secs
    ));
    lines.push(format!("  batch: {}", config.notify.batch));
    lines.push(String::new());

    lines.push(format!("log_level: {}", config.log_level.name()));
    match &config.log_dir {
        Some(dir) => lines.push(format!("log_dir: \"{dir}\"")),
        None => lines.push("log_dir: null".into()),
    }

    lines.join("\n") + "\n"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.link.layout, HeaderLayout::Wide);
        assert_eq!(config.link.max_devices, 1024);
        assert_eq!(config.capture.queue_capacity, 1024);
        assert_eq!(config.gps.mode, GpsMode::Inline);
        assert!(config.notify.webhook.is_none());
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn test_parse_config() {
        let text = r#"
link:
  transport: "/dev/ttyACM1"
  baud: 921600
  layout: compact
  max_devices: 200
  read_timeout_ms: 250

gps:
  source: "/dev/ttyUSB1"
  mode: thread

capture:
  duration_secs: 3600
  queue_capacity: 0

storage:
  endpoint: "ndjson:/tmp/captures.ndjson"

notify:
  telegram_token: "123:abc"
  chat_ids: [111, -222]
  drain_interval_secs: 5
  batch: 20

log_level: debug
log_dir: "/var/log/bletrack"
"#;
        let config = parse_config(text).unwrap();
        assert_eq!(config.link.transport, "/dev/ttyACM1");
        assert_eq!(config.link.baud, 921_600);
        assert_eq!(config.link.layout, HeaderLayout::Compact);
        assert_eq!(config.frame_format().max_devices, 200);
        assert_eq!(config.read_timeout(), Duration::from_millis(250));
        assert_eq!(config.gps.source.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(config.gps.mode, GpsMode::Thread);
        assert_eq!(config.capture_duration(), Some(Duration::from_secs(3600)));
        assert_eq!(config.capture.queue_capacity, 0);
        assert_eq!(
            config.storage,
            StorageEndpoint::JsonLines("/tmp/captures.ndjson".into())
        );
        assert_eq!(config.notify.telegram_token.as_deref(), Some("123:abc"));
        assert_eq!(config.notify.chat_ids, vec![111, -222]);
        assert_eq!(config.notify.drain_interval_secs, 5);
        assert_eq!(config.notify.batch, 20);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.log_dir.as_deref(), Some("/var/log/bletrack"));
    }

    #[test]
    fn test_parse_config_null_values() {
        let text = r#"
gps:
  source: null

capture:
  duration_secs: ~

notify:
  webhook: null
  chat_ids: null

log_dir: null
"#;
        let config = parse_config(text).unwrap();
        assert!(config.gps.source.is_none());
        assert!(config.capture.duration_secs.is_none());
        assert!(config.notify.webhook.is_none());
        assert!(config.notify.chat_ids.is_empty());
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = parse_config("link:\n  layout: huge\n").unwrap_err();
        match err {
            ConfigError::Invalid { key, value } => {
                assert_eq!(key, "link.layout");
                assert_eq!(value, "huge");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(parse_config("link:\n  baud: fast\n").is_err());
        assert!(parse_config("log_level: trace\n").is_err());
        assert!(parse_config("notify:\n  chat_ids: [1, x]\n").is_err());
        assert!(parse_config("notify:\n  batch: -1\n").is_err());
    }

    #[test]
    fn test_storage_endpoint_parse() {
        assert_eq!(
            StorageEndpoint::parse("data/x.db"),
            StorageEndpoint::Sqlite("data/x.db".into())
        );
        assert_eq!(
            StorageEndpoint::parse("sqlite:data/x.db"),
            StorageEndpoint::Sqlite("data/x.db".into())
        );
        assert_eq!(StorageEndpoint::parse("none"), StorageEndpoint::Disabled);
        assert_eq!(
            StorageEndpoint::parse("ndjson:out.ndjson").describe(),
            "ndjson:out.ndjson"
        );
    }

    #[test]
    fn test_roundtrip() {
        let mut config = Config::default();
        config.link.layout = HeaderLayout::Compact;
        config.gps.source = Some("tcp://127.0.0.1:2947".into());
        config.capture.duration_secs = Some(90);
        config.storage = StorageEndpoint::Disabled;
        config.notify.chat_ids = vec![42, 43];
        config.notify.webhook = Some("https://example.com/hook".into());
        config.notify.batch = 8;
        config.log_level = LogLevel::Debug;
        config.log_dir = Some("logs".into());

        let text = serialize_config(&config);
        let parsed = parse_config(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let mut config = Config::default();
        config.link.transport = "tcp://10.0.0.5:9000".into();
        save_config_to(&config, &path).unwrap();
        assert_eq!(load_config_from(&path).unwrap(), config);
    }
}
