//! Capture pipeline: decode, correlate, persist, notify.
//!
//! `CapturePipeline::run` owns the transport for the duration of a session
//! and is meant to run on its own thread. The only state it shares with the
//! outside world is the notification queue, the GPS fix handle (in threaded
//! mode) and the stop flag.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::frame::{DecoderStats, FrameDecoder, FrameFormat};
use crate::gps::GpsFeed;
use crate::lifecycle::{Lifecycle, LifecycleError, Operation, State, Trigger};
use crate::queue::NotificationQueue;
use crate::sink::CaptureSink;
use crate::transport::Transport;
use crate::types::{unix_now, CaptureRecord, DecodeError, Notification, StopFlag};

/// Devices listed by name in a notification before summarizing the rest.
const SUMMARY_DEVICES: usize = 3;

// ---------------------------------------------------------------------------
// Uplink hook
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
#[error("uplink failed: {0}")]
pub struct UplinkError(pub String);

/// Off-board link probed when a re-scan is due (Wi-Fi upload and similar).
pub trait Uplink {
    fn is_available(&mut self) -> bool;
    fn transmit(&mut self) -> Result<(), UplinkError>;
}

// ---------------------------------------------------------------------------
// Run control
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RunLimits {
    /// Wall-clock budget for the session. `None` runs until stopped.
    pub duration: Option<Duration>,
    pub stop: StopFlag,
}

impl RunLimits {
    pub fn new(duration: Option<Duration>, stop: StopFlag) -> Self {
        RunLimits { duration, stop }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Duration,
    Signal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    pub records: u64,
    pub stored: u64,
    pub store_failures: u64,
    pub persist_skipped: u64,
    pub notifications: u64,
    pub decode_errors: u64,
    pub idle_reads: u64,
    pub with_fix: u64,
    pub uplink_transmits: u64,
    pub uplink_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub reason: StopReason,
    pub elapsed_secs: f64,
    pub capture: CaptureStats,
    pub decoder: DecoderStats,
    pub final_state: &'static str,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transport failed: {0}")]
    Transport(#[source] DecodeError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct CapturePipeline<T, S> {
    transport: T,
    decoder: FrameDecoder,
    gps: GpsFeed,
    sink: S,
    queue: Arc<NotificationQueue>,
    lifecycle: Lifecycle,
    uplink: Option<Box<dyn Uplink + Send>>,
    probed_at: f64,
    stats: CaptureStats,
}

impl<T: Transport, S: CaptureSink> CapturePipeline<T, S> {
    pub fn new(transport: T, format: FrameFormat, sink: S, queue: Arc<NotificationQueue>) -> Self {
        CapturePipeline {
            transport,
            decoder: FrameDecoder::new(format),
            gps: GpsFeed::None,
            sink,
            queue,
            lifecycle: Lifecycle::default(),
            uplink: None,
            probed_at: 0.0,
            stats: CaptureStats::default(),
        }
    }

    pub fn with_gps(mut self, gps: GpsFeed) -> Self {
        self.gps = gps;
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_uplink(mut self, uplink: Box<dyn Uplink + Send>) -> Self {
        self.uplink = Some(uplink);
        self
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Hand the sink back once the session is over.
    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    pub fn decoder_stats(&self) -> DecoderStats {
        self.decoder.stats()
    }

    /// Run until the duration elapses, the stop flag is set, or the
    /// transport fails. Transport failure moves the lifecycle to ERROR and
    /// is returned; the counters stay readable through `stats()`.
    pub fn run(&mut self, limits: &RunLimits) -> Result<RunSummary, PipelineError> {
        match self.lifecycle.state() {
            State::Initializing => {
                self.lifecycle.fire(Trigger::InitializeComplete)?;
            }
            State::Error => {
                self.lifecycle.fire(Trigger::ErrorResolved)?;
            }
            _ => {}
        }
        info!(
            transport = self.transport.name(),
            layout = %self.decoder.format().layout,
            max_devices = self.decoder.format().max_devices,
            "capture started"
        );

        let started = Instant::now();
        self.probed_at = unix_now();

        let reason = loop {
            if limits.stop.is_set() {
                break StopReason::Signal;
            }
            if limits.duration.is_some_and(|d| started.elapsed() >= d) {
                break StopReason::Duration;
            }

            self.maybe_uplink(unix_now())?;

            match self.decoder.next_frame(&mut self.transport) {
                Ok(frame) => {
                    let fix = self.gps.sample();
                    let record = CaptureRecord::new(frame, fix, unix_now());
                    self.handle_record(record);
                }
                Err(e) if e.is_idle() => {
                    self.stats.idle_reads += 1;
                    self.gps.refresh();
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "transport failure, stopping capture");
                    self.transport.close();
                    self.flush_sink();
                    self.lifecycle.fire(Trigger::ErrorOccurred)?;
                    return Err(PipelineError::Transport(e));
                }
                Err(e) => {
                    self.stats.decode_errors += 1;
                    debug!(error = %e, "frame discarded");
                }
            }
        };

        self.transport.close();
        self.flush_sink();
        self.lifecycle.shutdown();

        let summary = RunSummary {
            reason,
            elapsed_secs: started.elapsed().as_secs_f64(),
            capture: self.stats,
            decoder: self.decoder.stats(),
            final_state: self.lifecycle.state().name(),
        };
        info!(
            reason = ?summary.reason,
            records = summary.capture.records,
            stored = summary.capture.stored,
            gaps = summary.decoder.sequence_gaps,
            "capture stopped"
        );
        Ok(summary)
    }

    fn handle_record(&mut self, record: CaptureRecord) {
        self.stats.records += 1;
        if record.gps().is_some() {
            self.stats.with_fix += 1;
        }

        if self.lifecycle.permits(Operation::Persist) {
            match self.sink.store(&record) {
                Ok(()) => self.stats.stored += 1,
                Err(e) => {
                    self.stats.store_failures += 1;
                    warn!(sequence = record.header().sequence, error = %e, "record not persisted");
                }
            }
        } else {
            self.stats.persist_skipped += 1;
        }

        self.queue.enqueue(summarize(&record));
        self.stats.notifications += 1;
    }

    fn flush_sink(&mut self) {
        if let Err(e) = self.sink.flush() {
            warn!(error = %e, "sink flush failed");
        }
    }

    fn maybe_uplink(&mut self, now: f64) -> Result<(), LifecycleError> {
        let Some(uplink) = self.uplink.as_mut() else {
            return Ok(());
        };
        let interval = self.lifecycle.rescan_interval().as_secs_f64();
        if !self.lifecycle.rescan_due(now) || now - self.probed_at < interval {
            return Ok(());
        }
        self.probed_at = now;

        if !uplink.is_available() {
            debug!("uplink not available");
            return Ok(());
        }
        self.lifecycle.fire(Trigger::WifiAvailable)?;
        if !self.lifecycle.permits(Operation::Transmit) {
            return Ok(());
        }
        match uplink.transmit() {
            Ok(()) => {
                self.stats.uplink_transmits += 1;
                info!("uplink transmit complete");
                self.lifecycle.fire(Trigger::TransmissionComplete)?;
            }
            Err(e) => {
                self.stats.uplink_failures += 1;
                warn!(error = %e, "uplink transmit failed");
                self.lifecycle.fire(Trigger::ConnectionFailed)?;
            }
        }
        Ok(())
    }
}

/// Build the chat message for one capture record.
pub fn summarize(record: &CaptureRecord) -> Notification {
    let header = record.header();
    let devices = record.devices();

    let mut listed: Vec<String> = devices
        .iter()
        .take(SUMMARY_DEVICES)
        .map(|d| format!("{}(RSSI:{}dB)", d.mac_string(), d.rssi))
        .collect();
    if devices.len() > SUMMARY_DEVICES {
        listed.push(format!("... +{} more", devices.len() - SUMMARY_DEVICES));
    }

    let mut text = format!(
        "Buffer received\nSequence: #{}\nDevices: {} ({})\nAdvertisements: {}\n",
        header.sequence,
        devices.len(),
        listed.join(", "),
        header.adv_raw_count,
    );

    let location = match record.gps() {
        Some(fix) => {
            text.push_str(&format!(
                "GPS: {:.6}, {:.6} ({:.2} knots)\n",
                fix.latitude, fix.longitude, fix.speed_kts
            ));
            Some(fix.location())
        }
        None => {
            text.push_str("GPS: no fix\n");
            None
        }
    };

    Notification { text, location }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
