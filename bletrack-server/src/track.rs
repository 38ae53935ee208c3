//! Live tracking session: wires link, GPS, storage and notifiers together.
//!
//! Threads:
//! - capture pipeline on a blocking thread (decode, correlate, persist, enqueue)
//! - optional GPS poller thread (`gps.mode: thread`)
//! - tokio runtime for the notification dispatcher and Ctrl-C handling

use std::fs::File;
use std::io::{self, BufWriter};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use bletrack_core::config::{Config, GpsConfig, GpsMode, NotifyConfig, StorageEndpoint};
use bletrack_core::frame::{DecoderStats, HeaderLayout};
use bletrack_core::gps::{GpsCorrelator, GpsFeed, GpsStats};
use bletrack_core::lifecycle::{Lifecycle, State};
use bletrack_core::pipeline::{CapturePipeline, CaptureStats, PipelineError, RunLimits, RunSummary};
use bletrack_core::queue::NotificationQueue;
use bletrack_core::sink::{CaptureSink, JsonLinesSink, NullSink};
use bletrack_core::types::{CaptureRecord, SinkError, StopFlag};
use bletrack_feeder::{open_gps_source, open_transport};

use crate::db::Database;
use crate::notification::{
    DispatchStats, NotificationDispatcher, SubscriberRegistry, TelegramNotifier, WebhookNotifier,
};

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("cannot open link {id}: {source}")]
    Link {
        id: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot open GPS source {id}: {source}")]
    Gps {
        id: String,
        #[source]
        source: io::Error,
    },
    #[error("storage: {0}")]
    Sink(#[from] SinkError),
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("runtime: {0}")]
    Runtime(#[source] io::Error),
    #[error("capture thread panicked")]
    Panicked,
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// The storage backend chosen by configuration.
pub enum TrackSink {
    Sqlite { db: Database, session_id: i64 },
    JsonLines(JsonLinesSink<BufWriter<File>>),
    Null(NullSink),
}

impl TrackSink {
    pub fn open(
        endpoint: &StorageEndpoint,
        source: &str,
        layout: HeaderLayout,
    ) -> Result<Self, TrackError> {
        Ok(match endpoint {
            StorageEndpoint::Sqlite(path) => {
                let mut db = Database::open(path)?;
                let session_id = db.start_session(source, layout.name())?;
                TrackSink::Sqlite { db, session_id }
            }
            StorageEndpoint::JsonLines(path) => TrackSink::JsonLines(JsonLinesSink::create(path)?),
            StorageEndpoint::Disabled => TrackSink::Null(NullSink),
        })
    }

    pub fn session_id(&self) -> Option<i64> {
        match self {
            TrackSink::Sqlite { session_id, .. } => Some(*session_id),
            _ => None,
        }
    }

    /// Close the database session, if any, with the run's counters.
    fn finish(
        self,
        outcome: &Result<RunSummary, PipelineError>,
        capture: CaptureStats,
        decoder: DecoderStats,
    ) {
        let TrackSink::Sqlite { mut db, session_id } = self else {
            return;
        };
        let result = match outcome {
            Ok(summary) => db.end_session_from(session_id, summary),
            Err(_) => db.end_session(
                session_id,
                "transport_error",
                decoder.frames,
                capture.stored,
                decoder.sequence_gaps,
                decoder.bytes_skipped,
            ),
        };
        if let Err(e) = result {
            warn!(session_id, error = %e, "failed to close session");
        }
    }
}

impl CaptureSink for TrackSink {
    fn store(&mut self, record: &CaptureRecord) -> Result<(), SinkError> {
        match self {
            TrackSink::Sqlite { db, .. } => db.store(record),
            TrackSink::JsonLines(sink) => sink.store(record),
            TrackSink::Null(sink) => sink.store(record),
        }
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        match self {
            TrackSink::Sqlite { db, .. } => db.flush(),
            TrackSink::JsonLines(sink) => sink.flush(),
            TrackSink::Null(sink) => sink.flush(),
        }
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Build the dispatcher with whichever notifiers are configured.
pub fn build_dispatcher(
    notify: &NotifyConfig,
    queue: Arc<NotificationQueue>,
) -> NotificationDispatcher {
    let mut dispatcher = NotificationDispatcher::new(queue).with_batch(notify.batch);

    if let Some(token) = notify.telegram_token.as_deref().filter(|t| !t.is_empty()) {
        let subscribers = Arc::new(SubscriberRegistry::new());
        for &chat_id in &notify.chat_ids {
            if !subscribers.add(chat_id) {
                debug!(chat_id, "duplicate chat id in config");
            }
        }
        if subscribers.is_empty() {
            warn!("telegram token set but no chat ids configured");
        }
        dispatcher = dispatcher.with_notifier(Box::new(TelegramNotifier::new(token, subscribers)));
    }
    if let Some(url) = notify.webhook.as_deref().filter(|u| !u.is_empty()) {
        dispatcher = dispatcher.with_notifier(Box::new(WebhookNotifier::new(url)));
    }
    if dispatcher.notifier_names().is_empty() {
        info!("no notifiers configured, notifications will be discarded");
    }
    dispatcher
}

fn open_gps(
    gps: &GpsConfig,
    stop: &StopFlag,
) -> Result<(GpsFeed, Option<JoinHandle<GpsStats>>), TrackError> {
    let Some(id) = gps.source.as_deref() else {
        return Ok((GpsFeed::None, None));
    };
    let gps_error = |source| TrackError::Gps {
        id: id.to_string(),
        source,
    };
    let correlator = GpsCorrelator::new(open_gps_source(id, gps.baud).map_err(gps_error)?);
    match gps.mode {
        GpsMode::Inline => Ok((GpsFeed::inline(correlator), None)),
        GpsMode::Thread => {
            let interval = Duration::from_millis(gps.poll_interval_ms.max(1));
            let (handle, join) = correlator
                .spawn_poller(interval, stop.clone())
                .map_err(gps_error)?;
            Ok((GpsFeed::Shared(handle), Some(join)))
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Everything known about a finished session.
pub struct TrackReport {
    /// `Err` when the link failed; counters below are still valid.
    pub outcome: Result<RunSummary, PipelineError>,
    pub capture: CaptureStats,
    pub decoder: DecoderStats,
    pub final_state: State,
    pub dispatch: DispatchStats,
    pub queue_dropped: u64,
    /// Only available when GPS ran on its own thread.
    pub gps: Option<GpsStats>,
    pub storage: String,
    pub session_id: Option<i64>,
}

/// Run one tracking session until the duration elapses, Ctrl-C, or the link fails.
pub fn run_track(config: &Config) -> Result<TrackReport, TrackError> {
    let link = &config.link;
    let transport = open_transport(&link.transport, link.baud, config.read_timeout()).map_err(
        |source| TrackError::Link {
            id: link.transport.clone(),
            source,
        },
    )?;
    let sink = TrackSink::open(&config.storage, &link.transport, link.layout)?;
    let session_id = sink.session_id();

    let aux_stop = StopFlag::new();
    let (gps, gps_poller) = open_gps(&config.gps, &aux_stop)?;

    let queue = Arc::new(NotificationQueue::new(config.capture.queue_capacity));
    let lifecycle = Lifecycle::new(Duration::from_secs(config.capture.rescan_interval_secs));
    let mut pipeline =
        CapturePipeline::new(transport, config.frame_format(), sink, Arc::clone(&queue))
            .with_gps(gps)
            .with_lifecycle(lifecycle);
    let dispatcher = build_dispatcher(&config.notify, Arc::clone(&queue));

    info!(
        link = %link.transport,
        storage = %config.storage.describe(),
        gps = config.gps.source.as_deref().unwrap_or("none"),
        gps_mode = config.gps.mode.name(),
        session_id,
        "tracking"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(TrackError::Runtime)?;

    let capture_stop = StopFlag::new();
    let limits = RunLimits::new(config.capture_duration(), capture_stop.clone());
    let drain_interval = Duration::from_secs(config.notify.drain_interval_secs.max(1));

    let joined = runtime.block_on(async move {
        let dispatch_stop = StopFlag::new();
        let dispatch_task = tokio::spawn(dispatcher.run(drain_interval, dispatch_stop.clone()));

        let signal_task = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            info!("interrupt received, stopping capture (press Ctrl-C again to exit)");
            capture_stop.stop();
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("second interrupt, exiting without a clean shutdown");
                std::process::exit(130);
            }
        });

        let capture = tokio::task::spawn_blocking(move || {
            let outcome = pipeline.run(&limits);
            (pipeline, outcome)
        })
        .await;

        signal_task.abort();
        dispatch_stop.stop();
        let dispatch = dispatch_task.await.unwrap_or_default();
        capture.map(|(pipeline, outcome)| (pipeline, outcome, dispatch))
    });

    aux_stop.stop();
    let gps_stats = gps_poller.and_then(|join| join.join().ok());

    let (pipeline, outcome, dispatch) = joined.map_err(|_| TrackError::Panicked)?;
    let capture = pipeline.stats();
    let decoder = pipeline.decoder_stats();
    let final_state = pipeline.lifecycle().state();
    pipeline.into_sink().finish(&outcome, capture, decoder);

    Ok(TrackReport {
        outcome,
        capture,
        decoder,
        final_state,
        dispatch,
        queue_dropped: queue.dropped(),
        gps: gps_stats,
        storage: config.storage.describe(),
        session_id,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bletrack_core::frame::{encode_device, encode_header, FrameHeader};
    use bletrack_core::types::{
        mac_from_str, DeviceRecord, Notification, TransportError, ADV_DATA_LEN,
    };
    use std::io::Write;

    const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A\r\n";

    fn device(mac: &str, rssi: i8) -> DeviceRecord {
        DeviceRecord {
            mac: mac_from_str(mac).unwrap(),
            addr_type: 0,
            adv_type: 0,
            rssi,
            data_len: 0,
            data: [0u8; ADV_DATA_LEN],
            n_adv: 1,
        }
    }

    fn capture_file(dir: &tempfile::TempDir, frames: u8) -> String {
        let mut bytes = vec![0x00, 0x13, 0x37];
        for seq in 0..frames {
            let header = FrameHeader {
                sequence: seq,
                adv_raw_count: 4,
                mac_count: 2,
            };
            bytes.extend(encode_header(&header, HeaderLayout::Wide));
            bytes.extend(encode_device(&device("AA:BB:CC:DD:EE:01", -40)));
            bytes.extend(encode_device(&device("AA:BB:CC:DD:EE:02", -80)));
        }
        let path = dir.path().join("capture.bin");
        std::fs::write(&path, bytes).unwrap();
        path.to_str().unwrap().to_string()
    }

    fn test_config(link: String, storage: StorageEndpoint) -> Config {
        let mut config = Config::default();
        config.link.transport = link;
        config.storage = storage;
        config.notify.drain_interval_secs = 1;
        config
    }

    #[test]
    fn test_replay_into_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let link = capture_file(&dir, 3);
        let db_path = dir.path().join("track.db").to_str().unwrap().to_string();
        let config = test_config(link, StorageEndpoint::Sqlite(db_path.clone()));

        let report = run_track(&config).unwrap();
        // End of a replayed file is a closed link
        match &report.outcome {
            Err(PipelineError::Transport(e)) => {
                assert!(matches!(e.transport(), Some(TransportError::Closed)))
            }
            other => panic!("expected closed link, got {other:?}"),
        }
        assert_eq!(report.final_state, State::Error);
        assert_eq!(report.capture.records, 3);
        assert_eq!(report.capture.stored, 3);
        assert_eq!(report.decoder.sequence_gaps, 0);
        assert_eq!(report.dispatch.drained, 3);
        assert!(report.session_id.is_some());

        let db = Database::open(&db_path).unwrap();
        let stats = db.stats();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.captures, 3);
        assert_eq!(stats.sightings, 6);
        assert_eq!(stats.devices, 2);
    }

    #[test]
    fn test_replay_into_ndjson_with_gps() {
        let dir = tempfile::tempdir().unwrap();
        let link = capture_file(&dir, 2);
        let out = dir.path().join("records.ndjson");
        let mut gps_file = tempfile::NamedTempFile::new().unwrap();
        gps_file.write_all(RMC.repeat(20).as_bytes()).unwrap();
        gps_file.flush().unwrap();

        let mut config = test_config(
            link,
            StorageEndpoint::JsonLines(out.to_str().unwrap().to_string()),
        );
        config.gps.source = Some(gps_file.path().to_str().unwrap().to_string());
        config.gps.mode = GpsMode::Thread;
        config.gps.poll_interval_ms = 5;

        let report = run_track(&config).unwrap();
        assert_eq!(report.capture.records, 2);
        assert!(report.gps.is_some());
        assert!(report.session_id.is_none());

        let text = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["sequence"], 1);
    }

    #[test]
    fn test_missing_link_is_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(
            dir.path().join("absent.bin").to_str().unwrap().to_string(),
            StorageEndpoint::Disabled,
        );
        assert!(matches!(run_track(&config), Err(TrackError::Link { .. })));
    }

    #[test]
    fn test_build_dispatcher_from_config() {
        let queue = Arc::new(NotificationQueue::unbounded());
        let mut notify = Config::default().notify;
        assert!(build_dispatcher(&notify, Arc::clone(&queue)).notifier_names().is_empty());

        notify.telegram_token = Some("123:abc".into());
        notify.chat_ids = vec![1, 2];
        notify.webhook = Some("http://localhost/hook".into());
        let dispatcher = build_dispatcher(&notify, queue);
        assert_eq!(dispatcher.notifier_names(), vec!["telegram", "webhook"]);
    }

    #[tokio::test]
    async fn test_dispatcher_honours_configured_batch() {
        let queue = Arc::new(NotificationQueue::unbounded());
        for i in 0..5 {
            queue.enqueue(Notification::text(format!("n{i}")));
        }
        let mut notify = Config::default().notify;
        notify.batch = 2;

        let mut dispatcher = build_dispatcher(&notify, Arc::clone(&queue));
        assert_eq!(dispatcher.dispatch_once().await, 2);
        assert_eq!(queue.len(), 3);
    }
}
