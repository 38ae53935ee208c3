//! GPS fix correlation from NMEA sentences.
//!
//! The correlator drains whatever the GPS source has buffered, parses RMC
//! sentences, and keeps the most recent fix whose status flag is active.
//! Invalid or malformed sentences never clear the retained fix.
//!
//! Two ways to drive it:
//! - cooperative: the capture loop calls `poll()` between frames
//! - parallel: `spawn_poller()` moves the correlator onto its own thread
//!
//! Either way, readers share only a `FixHandle`.

use std::io;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::types::{unix_now, GpsFix, StopFlag};

/// Longest line kept while waiting for a newline. NMEA caps sentences at 82.
const MAX_LINE_LEN: usize = 512;

// ---------------------------------------------------------------------------
// NMEA parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq)]
pub enum NmeaError {
    #[error("sentence does not start with '$'")]
    MissingStart,
    #[error("checksum mismatch: sentence says {expected:02X}, computed {computed:02X}")]
    Checksum { expected: u8, computed: u8 },
    #[error("malformed checksum field")]
    BadChecksumField,
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// Recommended minimum data (RMC) sentence, position fields only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RmcSentence {
    /// Status flag `A` (active). `V` means the receiver has no fix.
    pub active: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed_kts: f64,
}

/// XOR of every byte between `$` and `*`.
pub fn nmea_checksum(body: &str) -> u8 {
    body.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Parse one NMEA line. `Ok(None)` means a well-formed sentence of a type
/// the correlator ignores (GGA, GSV, ...).
pub fn parse_sentence(line: &str) -> Result<Option<RmcSentence>, NmeaError> {
    let line = line.trim();
    let line = line.strip_prefix('$').ok_or(NmeaError::MissingStart)?;

    let body = match line.split_once('*') {
        Some((body, sum)) => {
            let expected =
                u8::from_str_radix(sum.trim(), 16).map_err(|_| NmeaError::BadChecksumField)?;
            let computed = nmea_checksum(body);
            if expected != computed {
                return Err(NmeaError::Checksum { expected, computed });
            }
            body
        }
        None => line,
    };

    let mut fields = body.split(',');
    let kind = fields.next().ok_or(NmeaError::MissingField("type"))?;
    // Talker prefix varies: GP, GN, GL, GA, BD
    if kind.len() != 5 || !kind.ends_with("RMC") {
        return Ok(None);
    }

    let fields: Vec<&str> = fields.collect();
    let field = |i: usize, name: &'static str| nth_field(&fields, i, name);

    let status = field(1, "status")?;
    let active = match status {
        "A" => true,
        "V" | "" => false,
        other => {
            return Err(NmeaError::InvalidField {
                field: "status",
                value: other.to_string(),
            })
        }
    };

    let latitude = parse_coordinate(field(2, "latitude")?, field(3, "N/S")?, 'N', 'S', "latitude")?;
    let longitude =
        parse_coordinate(field(4, "longitude")?, field(5, "E/W")?, 'E', 'W', "longitude")?;

    let speed = field(6, "speed")?;
    let speed_kts = if speed.is_empty() {
        0.0
    } else {
        speed.parse::<f64>().map_err(|_| NmeaError::InvalidField {
            field: "speed",
            value: speed.to_string(),
        })?
    };

    Ok(Some(RmcSentence {
        active,
        latitude,
        longitude,
        speed_kts,
    }))
}

fn nth_field<'a>(fields: &[&'a str], i: usize, name: &'static str) -> Result<&'a str, NmeaError> {
    fields.get(i).copied().ok_or(NmeaError::MissingField(name))
}

/// Convert `dddmm.mmmm` + hemisphere into signed decimal degrees.
fn parse_coordinate(
    value: &str,
    hemisphere: &str,
    positive: char,
    negative: char,
    field: &'static str,
) -> Result<Option<f64>, NmeaError> {
    if value.is_empty() {
        return Ok(None);
    }
    let invalid = || NmeaError::InvalidField {
        field,
        value: format!("{value},{hemisphere}"),
    };
    let raw: f64 = value.parse().map_err(|_| invalid())?;
    let degrees = (raw / 100.0).trunc();
    let minutes = raw - degrees * 100.0;
    if !(0.0..60.0).contains(&minutes) {
        return Err(invalid());
    }
    let decimal = degrees + minutes / 60.0;

    let sign = match hemisphere.chars().next() {
        Some(c) if c == positive => 1.0,
        Some(c) if c == negative => -1.0,
        _ => return Err(invalid()),
    };
    Ok(Some(sign * decimal))
}

// ---------------------------------------------------------------------------
// Source boundary
// ---------------------------------------------------------------------------

/// A GPS byte source that can be drained without blocking.
pub trait GpsSource {
    /// Append whatever bytes are buffered right now. Returns the number of
    /// bytes appended; `Ok(0)` means nothing was waiting.
    fn read_available(&mut self, buf: &mut Vec<u8>) -> io::Result<usize>;
}

impl<S: GpsSource + ?Sized> GpsSource for Box<S> {
    fn read_available(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        (**self).read_available(buf)
    }
}

// ---------------------------------------------------------------------------
// Shared fix
// ---------------------------------------------------------------------------

/// Cloneable read handle on the retained fix.
#[derive(Debug, Clone, Default)]
pub struct FixHandle(Arc<RwLock<Option<GpsFix>>>);

impl FixHandle {
    pub fn new() -> Self {
        FixHandle::default()
    }

    /// Most recent valid fix, or `None` before the first one.
    pub fn get(&self) -> Option<GpsFix> {
        *self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, fix: GpsFix) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Some(fix);
    }
}

/// Anything that can refresh and report the current fix.
pub trait FixPoller {
    fn poll(&mut self) -> Option<GpsFix>;
}

// ---------------------------------------------------------------------------
// Correlator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GpsStats {
    pub sentences: u64,
    pub fixes: u64,
    pub inactive: u64,
    pub parse_errors: u64,
    pub read_errors: u64,
}

pub struct GpsCorrelator<S> {
    source: S,
    pending: Vec<u8>,
    fix: FixHandle,
    stats: GpsStats,
}

impl<S: GpsSource> GpsCorrelator<S> {
    pub fn new(source: S) -> Self {
        GpsCorrelator {
            source,
            pending: Vec::new(),
            fix: FixHandle::new(),
            stats: GpsStats::default(),
        }
    }

    pub fn handle(&self) -> FixHandle {
        self.fix.clone()
    }

    pub fn current(&self) -> Option<GpsFix> {
        self.fix.get()
    }

    pub fn stats(&self) -> GpsStats {
        self.stats
    }

    /// Drain buffered input, parse complete lines, update the retained fix.
    pub fn poll(&mut self) -> Option<GpsFix> {
        loop {
            match self.source.read_available(&mut self.pending) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.stats.read_errors += 1;
                    warn!(error = %e, "GPS read failed");
                    break;
                }
            }
        }

        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            let text = String::from_utf8_lossy(&line);
            self.ingest_line(&text);
        }

        if self.pending.len() > MAX_LINE_LEN {
            self.stats.parse_errors += 1;
            debug!(len = self.pending.len(), "discarding unterminated GPS input");
            self.pending.clear();
        }

        self.current()
    }

    fn ingest_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match parse_sentence(line) {
            Ok(Some(rmc)) => {
                self.stats.sentences += 1;
                if !rmc.active {
                    self.stats.inactive += 1;
                    return;
                }
                match (rmc.latitude, rmc.longitude) {
                    (Some(latitude), Some(longitude)) => {
                        let fix = GpsFix {
                            latitude,
                            longitude,
                            speed_kts: rmc.speed_kts.max(0.0),
                            valid: true,
                            observed_at: unix_now(),
                        };
                        trace!(latitude, longitude, "GPS fix updated");
                        self.fix.set(fix);
                        self.stats.fixes += 1;
                    }
                    _ => {
                        self.stats.parse_errors += 1;
                        debug!("active RMC without coordinates");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.stats.parse_errors += 1;
                debug!(error = %e, "ignoring malformed NMEA sentence");
            }
        }
    }
}

impl<S: GpsSource> FixPoller for GpsCorrelator<S> {
    fn poll(&mut self) -> Option<GpsFix> {
        GpsCorrelator::poll(self)
    }
}

impl<S: GpsSource + Send + 'static> GpsCorrelator<S> {
    /// Move the correlator onto its own thread, polling every `interval`
    /// until `stop` is set. The thread returns its final counters.
    pub fn spawn_poller(
        mut self,
        interval: Duration,
        stop: StopFlag,
    ) -> io::Result<(FixHandle, JoinHandle<GpsStats>)> {
        let handle = self.handle();
        let join = thread::Builder::new()
            .name("gps-poller".into())
            .spawn(move || {
                while !stop.is_set() {
                    self.poll();
                    thread::sleep(interval);
                }
                self.stats
            })?;
        Ok((handle, join))
    }
}

// ---------------------------------------------------------------------------
// Feed used by the capture pipeline
// ---------------------------------------------------------------------------

/// How the capture loop obtains GPS fixes.
pub enum GpsFeed {
    /// No GPS attached; records carry no fix.
    None,
    /// Polled by the capture loop itself.
    Inline(Box<dyn FixPoller + Send>),
    /// Refreshed elsewhere (poller thread); the loop only reads.
    Shared(FixHandle),
}

impl GpsFeed {
    pub fn inline<S: GpsSource + Send + 'static>(correlator: GpsCorrelator<S>) -> Self {
        GpsFeed::Inline(Box::new(correlator))
    }

    /// Drain pending input if this loop owns the source.
    pub fn refresh(&mut self) {
        if let GpsFeed::Inline(poller) = self {
            poller.poll();
        }
    }

    /// Refresh, then return the fix to correlate with the current frame.
    pub fn sample(&mut self) -> Option<GpsFix> {
        match self {
            GpsFeed::None => None,
            GpsFeed::Inline(poller) => poller.poll(),
            GpsFeed::Shared(handle) => handle.get(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
