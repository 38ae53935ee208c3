//! Shared types, error enums, and capture records for bletrack-core.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::frame::{Frame, FrameHeader};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures reported by a byte transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No byte arrived within the transport's read timeout. Retrying is fine.
    #[error("read timed out")]
    TimedOut,
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("transport closed")]
    Closed,
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True if the transport can no longer deliver bytes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Closed | TransportError::Io(_))
    }
}

/// Failure to decode the current frame. The decoder resumes on the next call.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Failed while hunting for the magic marker.
    #[error("sync read failed: {0}")]
    Sync(#[from] TransportError),
    #[error("header incomplete: {0}")]
    Header(#[source] TransportError),
    #[error("frame declares {count} devices, limit is {max}")]
    TooManyDevices { count: u16, max: u16 },
    #[error("device block {index} of {count} incomplete: {source}")]
    Device {
        index: u16,
        count: u16,
        #[source]
        source: TransportError,
    },
}

impl DecodeError {
    /// The transport error underneath, if any.
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            DecodeError::Sync(e) | DecodeError::Header(e) => Some(e),
            DecodeError::Device { source, .. } => Some(source),
            DecodeError::TooManyDevices { .. } => None,
        }
    }

    /// True when the capture loop must stop: the transport is gone.
    pub fn is_fatal(&self) -> bool {
        self.transport().is_some_and(TransportError::is_fatal)
    }

    /// True for an idle read timeout while searching for a frame.
    pub fn is_idle(&self) -> bool {
        matches!(self, DecodeError::Sync(TransportError::TimedOut))
    }
}

/// Persistence failures. Always non-fatal to the capture loop.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("document serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Stop flag
// ---------------------------------------------------------------------------

/// Cloneable external stop signal shared between the capture loop, the GPS
/// poller thread and whoever handles Ctrl-C.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        StopFlag::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// MAC address helpers
// ---------------------------------------------------------------------------

/// 6-byte BLE device address, in wire order.
pub type Mac = [u8; 6];

/// Format a MAC as upper-case colon-hex (`AA:BB:CC:DD:EE:FF`).
pub fn mac_to_string(mac: &Mac) -> String {
    mac.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse colon- or dash-separated hex into a MAC.
pub fn mac_from_str(s: &str) -> Option<Mac> {
    let mut mac = [0u8; 6];
    let mut parts = s.trim().split(|c| c == ':' || c == '-');
    for slot in mac.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *slot = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

/// Encode bytes as lower-case hex.
pub fn hex_encode(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for &b in data {
        s.push(HEX_CHARS[(b >> 4) as usize] as char);
        s.push(HEX_CHARS[(b & 0x0F) as usize] as char);
    }
    s
}

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

// ---------------------------------------------------------------------------
// Device record
// ---------------------------------------------------------------------------

/// Advertisement payload bytes carried per device block.
pub const ADV_DATA_LEN: usize = 31;

/// One BLE device seen during a capture window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub mac: Mac,
    pub addr_type: u8,
    pub adv_type: u8,
    /// dBm, decoded from the wire byte as two's complement.
    pub rssi: i8,
    pub data_len: u8,
    pub data: [u8; ADV_DATA_LEN],
    /// Advertisements merged into this record during the window.
    pub n_adv: u8,
}

impl DeviceRecord {
    pub fn mac_string(&self) -> String {
        mac_to_string(&self.mac)
    }

    /// Meaningful part of the advertisement payload.
    pub fn payload(&self) -> &[u8] {
        let len = (self.data_len as usize).min(ADV_DATA_LEN);
        &self.data[..len]
    }
}

impl Serialize for DeviceRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("DeviceRecord", 7)?;
        s.serialize_field("mac", &self.mac_string())?;
        s.serialize_field("addr_type", &self.addr_type)?;
        s.serialize_field("adv_type", &self.adv_type)?;
        s.serialize_field("rssi", &self.rssi)?;
        s.serialize_field("data_len", &self.data_len)?;
        s.serialize_field("data", &hex_encode(self.payload()))?;
        s.serialize_field("n_adv", &self.n_adv)?;
        s.end()
    }
}

// ---------------------------------------------------------------------------
// GPS fix
// ---------------------------------------------------------------------------

/// A single GPS position sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kts: f64,
    /// Receiver reported an active fix for this sample.
    pub valid: bool,
    /// Unix seconds when the sentence was read.
    pub observed_at: f64,
}

impl GpsFix {
    pub fn location(&self) -> Location {
        Location {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

// ---------------------------------------------------------------------------
// Capture record
// ---------------------------------------------------------------------------

/// A decoded frame joined with the GPS fix sampled at correlation time.
///
/// Serializes to the document shape stored by every sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureRecord {
    pub timestamp: f64,
    #[serde(flatten)]
    header: FrameHeader,
    devices: Vec<DeviceRecord>,
    gps: Option<GpsFix>,
}

impl CaptureRecord {
    pub fn new(frame: Frame, gps: Option<GpsFix>, timestamp: f64) -> Self {
        CaptureRecord {
            timestamp,
            header: frame.header,
            devices: frame.devices,
            gps,
        }
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn devices(&self) -> &[DeviceRecord] {
        &self.devices
    }

    pub fn gps(&self) -> Option<&GpsFix> {
        self.gps.as_ref()
    }

    pub fn to_document(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Outbound message handed from the capture path to notifiers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub text: String,
    pub location: Option<Location>,
}

impl Notification {
    pub fn text(text: impl Into<String>) -> Self {
        Notification {
            text: text.into(),
            location: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn device(data_len: u8) -> DeviceRecord {
        let mut data = [0u8; ADV_DATA_LEN];
        data[..3].copy_from_slice(&[0x02, 0x01, 0x06]);
        DeviceRecord {
            mac: [0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03],
            addr_type: 1,
            adv_type: 0,
            rssi: -62,
            data_len,
            data,
            n_adv: 4,
        }
    }

    #[test]
    fn test_mac_roundtrip() {
        let mac = mac_from_str("aa:bb:cc:01:02:03").unwrap();
        assert_eq!(mac, [0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03]);
        assert_eq!(mac_to_string(&mac), "AA:BB:CC:01:02:03");
    }

    #[test]
    fn test_mac_from_str_rejects_bad_input() {
        assert!(mac_from_str("AA:BB:CC").is_none());
        assert!(mac_from_str("AA:BB:CC:DD:EE:FF:00").is_none());
        assert!(mac_from_str("GG:BB:CC:DD:EE:FF").is_none());
    }

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(&[0x02, 0x01, 0xAF]), "0201af");
    }

    #[test]
    fn test_payload_respects_data_len() {
        assert_eq!(device(3).payload(), &[0x02, 0x01, 0x06]);
        assert_eq!(device(0).payload().len(), 0);
        // Out-of-range length is clamped to the fixed block size
        assert_eq!(device(200).payload().len(), ADV_DATA_LEN);
    }

    #[test]
    fn test_device_serialization() {
        let doc = serde_json::to_value(device(3)).unwrap();
        assert_eq!(doc["mac"], "AA:BB:CC:01:02:03");
        assert_eq!(doc["rssi"], -62);
        assert_eq!(doc["data"], "020106");
        assert_eq!(doc["n_adv"], 4);
    }

    #[test]
    fn test_capture_document_shape() {
        let frame = Frame {
            header: FrameHeader {
                sequence: 7,
                adv_raw_count: 12,
                mac_count: 1,
            },
            devices: vec![device(3)],
            sequence_gap: false,
        };
        let fix = GpsFix {
            latitude: 40.4168,
            longitude: -3.7038,
            speed_kts: 1.5,
            valid: true,
            observed_at: 100.0,
        };
        let record = CaptureRecord::new(frame, Some(fix), 101.0);
        let doc = record.to_document().unwrap();

        assert_eq!(doc["sequence"], 7);
        assert_eq!(doc["adv_raw_count"], 12);
        assert_eq!(doc["mac_count"], 1);
        assert_eq!(doc["devices"][0]["mac"], "AA:BB:CC:01:02:03");
        assert_eq!(doc["gps"]["latitude"], 40.4168);
        assert_eq!(doc["timestamp"], 101.0);
    }

    #[test]
    fn test_capture_document_without_fix() {
        let frame = Frame {
            header: FrameHeader {
                sequence: 1,
                adv_raw_count: 0,
                mac_count: 0,
            },
            devices: vec![],
            sequence_gap: false,
        };
        let doc = CaptureRecord::new(frame, None, 1.0).to_document().unwrap();
        assert!(doc["gps"].is_null());
    }

    #[test]
    fn test_decode_error_fatality() {
        assert!(DecodeError::Sync(TransportError::Closed).is_fatal());
        assert!(DecodeError::Header(TransportError::Io(std::io::Error::other("gone"))).is_fatal());
        assert!(!DecodeError::Sync(TransportError::TimedOut).is_fatal());
        assert!(DecodeError::Sync(TransportError::TimedOut).is_idle());
        assert!(!DecodeError::Header(TransportError::ShortRead {
            expected: 5,
            actual: 2
        })
        .is_fatal());
        assert!(!DecodeError::TooManyDevices { count: 9, max: 4 }.is_fatal());
    }

    #[test]
    fn test_stop_flag_shared() {
        let flag = StopFlag::new();
        let other = flag.clone();
        assert!(!other.is_set());
        flag.stop();
        assert!(other.is_set());
    }
}
