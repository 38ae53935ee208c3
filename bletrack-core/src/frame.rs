//! Synchronize on the capture stream and decode header + device frames.
//!
//! Wire format (little-endian):
//! - magic `55 55 55 55`
//! - sequence (u8, wraps at 256)
//! - adv_raw_count (u16)
//! - mac_count (u8 in the compact layout, u16 in the wide layout)
//! - `mac_count` device blocks of 42 bytes each
//!
//! Responsibilities:
//! - Sliding-window search for the magic marker at any byte offset
//! - Reject frames whose device count exceeds the configured limit
//! - Emit a frame only when every device block was read in full
//! - Detect sequence gaps without reordering or dropping frames

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::transport::Transport;
use crate::types::{DecodeError, DeviceRecord, TransportError, ADV_DATA_LEN};

/// Frame boundary marker.
pub const MAGIC: [u8; 4] = [0x55, 0x55, 0x55, 0x55];

/// Fixed size of one device block on the wire.
pub const DEVICE_LEN: usize = 6 + 1 + 1 + 1 + 1 + ADV_DATA_LEN + 1;

/// Default cap on devices per frame (matches the capture firmware buffer).
pub const DEFAULT_MAX_DEVICES: u16 = 1024;

/// Bytes scanned without finding a marker before a sync loss is reported.
pub const SYNC_LOSS_WINDOW: u64 = 4096;

// ---------------------------------------------------------------------------
// Format
// ---------------------------------------------------------------------------

/// Width of the header's `mac_count` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderLayout {
    /// 1-byte `mac_count`, 8-byte header.
    Compact,
    /// 2-byte `mac_count`, 9-byte header.
    #[default]
    Wide,
}

impl HeaderLayout {
    /// Total header length including the magic marker.
    pub fn header_len(self) -> usize {
        match self {
            HeaderLayout::Compact => 8,
            HeaderLayout::Wide => 9,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HeaderLayout::Compact => "compact",
            HeaderLayout::Wide => "wide",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "compact" | "u8" | "1" => Some(HeaderLayout::Compact),
            "wide" | "u16" | "2" => Some(HeaderLayout::Wide),
            _ => None,
        }
    }
}

impl std::fmt::Display for HeaderLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoder configuration, fixed per transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub layout: HeaderLayout,
    pub max_devices: u16,
}

impl FrameFormat {
    pub fn new(layout: HeaderLayout, max_devices: u16) -> Self {
        FrameFormat {
            layout,
            max_devices,
        }
    }
}

impl Default for FrameFormat {
    fn default() -> Self {
        FrameFormat::new(HeaderLayout::Wide, DEFAULT_MAX_DEVICES)
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameHeader {
    pub sequence: u8,
    pub adv_raw_count: u16,
    pub mac_count: u16,
}

/// A fully decoded frame: header plus every device block it declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub devices: Vec<DeviceRecord>,
    /// The sequence number did not follow the previous frame's.
    pub sequence_gap: bool,
}

/// Parse the header bytes that follow the magic marker.
pub fn parse_header(body: &[u8], layout: HeaderLayout) -> Option<FrameHeader> {
    if body.len() != layout.header_len() - MAGIC.len() {
        return None;
    }
    let sequence = body[0];
    let adv_raw_count = u16::from_le_bytes([body[1], body[2]]);
    let mac_count = match layout {
        HeaderLayout::Compact => body[3] as u16,
        HeaderLayout::Wide => u16::from_le_bytes([body[3], body[4]]),
    };
    Some(FrameHeader {
        sequence,
        adv_raw_count,
        mac_count,
    })
}

/// Parse one fixed-size device block.
pub fn parse_device(block: &[u8]) -> Option<DeviceRecord> {
    if block.len() != DEVICE_LEN {
        return None;
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&block[0..6]);
    let mut data = [0u8; ADV_DATA_LEN];
    data.copy_from_slice(&block[10..10 + ADV_DATA_LEN]);

    Some(DeviceRecord {
        mac,
        addr_type: block[6],
        adv_type: block[7],
        rssi: block[8] as i8,
        data_len: block[9],
        data,
        n_adv: block[10 + ADV_DATA_LEN],
    })
}

/// Serialize a header the way the capture firmware does.
pub fn encode_header(header: &FrameHeader, layout: HeaderLayout) -> Vec<u8> {
    let mut out = Vec::with_capacity(layout.header_len());
    out.extend_from_slice(&MAGIC);
    out.push(header.sequence);
    out.extend_from_slice(&header.adv_raw_count.to_le_bytes());
    match layout {
        HeaderLayout::Compact => out.push(header.mac_count as u8),
        HeaderLayout::Wide => out.extend_from_slice(&header.mac_count.to_le_bytes()),
    }
    out
}

/// Serialize one device block.
pub fn encode_device(device: &DeviceRecord) -> [u8; DEVICE_LEN] {
    let mut out = [0u8; DEVICE_LEN];
    out[0..6].copy_from_slice(&device.mac);
    out[6] = device.addr_type;
    out[7] = device.adv_type;
    out[8] = device.rssi as u8;
    out[9] = device.data_len;
    out[10..10 + ADV_DATA_LEN].copy_from_slice(&device.data);
    out[10 + ADV_DATA_LEN] = device.n_adv;
    out
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Running counters for the decoder. Every absorbed failure lands here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecoderStats {
    pub frames: u64,
    pub devices: u64,
    pub bytes_skipped: u64,
    pub sync_losses: u64,
    pub header_errors: u64,
    pub device_errors: u64,
    pub oversized_frames: u64,
    pub sequence_gaps: u64,
}

/// Stateful frame decoder.
///
/// Call `next_frame()` repeatedly against the same transport. Search state
/// survives failed calls, so a timeout mid-search loses nothing and a
/// discarded frame does not restart the session.
pub struct FrameDecoder {
    format: FrameFormat,
    window: [u8; 4],
    filled: usize,
    skipped_since_sync: u64,
    last_sequence: Option<u8>,
    stats: DecoderStats,
}

impl FrameDecoder {
    pub fn new(format: FrameFormat) -> Self {
        FrameDecoder {
            format,
            window: [0; 4],
            filled: 0,
            skipped_since_sync: 0,
            last_sequence: None,
            stats: DecoderStats::default(),
        }
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    pub fn last_sequence(&self) -> Option<u8> {
        self.last_sequence
    }

    /// Read and decode the next complete frame.
    pub fn next_frame<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<Frame, DecodeError> {
        self.synchronize(transport)?;
        trace!("frame marker found");

        let layout = self.format.layout;
        let body_len = layout.header_len() - MAGIC.len();
        let body = transport.read_exact_bytes(body_len).map_err(|e| {
            self.stats.header_errors += 1;
            debug!(error = %e, "header read failed");
            DecodeError::Header(e)
        })?;
        let header = parse_header(&body, layout).ok_or_else(|| {
            self.stats.header_errors += 1;
            DecodeError::Header(TransportError::ShortRead {
                expected: body_len,
                actual: body.len(),
            })
        })?;

        if header.mac_count > self.format.max_devices {
            self.stats.oversized_frames += 1;
            warn!(
                mac_count = header.mac_count,
                max = self.format.max_devices,
                "frame exceeds device limit, resynchronizing"
            );
            return Err(DecodeError::TooManyDevices {
                count: header.mac_count,
                max: self.format.max_devices,
            });
        }

        let count = header.mac_count;
        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = transport
                .read_exact_bytes(DEVICE_LEN)
                .and_then(|block| {
                    parse_device(&block).ok_or(TransportError::ShortRead {
                        expected: DEVICE_LEN,
                        actual: block.len(),
                    })
                })
                .map_err(|source| {
                    self.stats.device_errors += 1;
                    debug!(index, count, error = %source, "device block read failed");
                    DecodeError::Device {
                        index,
                        count,
                        source,
                    }
                })?;
            devices.push(device);
        }

        let sequence_gap = self.check_sequence(header.sequence);
        self.stats.frames += 1;
        self.stats.devices += devices.len() as u64;

        Ok(Frame {
            header,
            devices,
            sequence_gap,
        })
    }

    /// Consume bytes until the last four read equal the magic marker.
    fn synchronize<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<(), TransportError> {
        loop {
            let b = transport.read_byte()?;
            if self.filled == MAGIC.len() {
                self.window.rotate_left(1);
                self.window[MAGIC.len() - 1] = b;
                self.note_skipped();
            } else {
                self.window[self.filled] = b;
                self.filled += 1;
            }

            if self.filled == MAGIC.len() && self.window == MAGIC {
                if self.skipped_since_sync > 0 {
                    debug!(skipped = self.skipped_since_sync, "resynchronized");
                }
                self.filled = 0;
                self.skipped_since_sync = 0;
                return Ok(());
            }
        }
    }

    fn note_skipped(&mut self) {
        self.stats.bytes_skipped += 1;
        self.skipped_since_sync += 1;
        if self.skipped_since_sync % SYNC_LOSS_WINDOW == 0 {
            self.stats.sync_losses += 1;
            warn!(
                skipped = self.skipped_since_sync,
                "no frame marker found, still searching"
            );
        }
    }

    /// Returns true on a gap. Always adopts the received sequence.
    fn check_sequence(&mut self, received: u8) -> bool {
        let gap = match self.last_sequence {
            Some(last) => {
                let expected = last.wrapping_add(1);
                if received != expected {
                    self.stats.sequence_gaps += 1;
                    warn!(expected, received, "sequence gap");
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        self.last_sequence = Some(received);
        gap
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        FrameDecoder::new(FrameFormat::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
