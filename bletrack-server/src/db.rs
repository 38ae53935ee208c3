//! SQLite persistence: WAL mode, 4 tables, indexed queries.
//!
//! Schema: sessions, captures, sightings, devices.
//! Every capture row keeps the full JSON document next to the indexed
//! columns; `sightings` holds one row per device per capture and `devices`
//! aggregates per MAC.

use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use serde::Serialize;
use std::path::Path;

use bletrack_core::pipeline::{RunSummary, StopReason};
use bletrack_core::sink::CaptureSink;
use bletrack_core::types::{hex_encode, unix_now, CaptureRecord, SinkError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    layout TEXT NOT NULL,
    start_time REAL NOT NULL,
    end_time REAL,
    stop_reason TEXT,
    frames INTEGER DEFAULT 0,
    stored INTEGER DEFAULT 0,
    sequence_gaps INTEGER DEFAULT 0,
    bytes_skipped INTEGER DEFAULT 0
);

CREATE TABLE IF NOT EXISTS captures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER REFERENCES sessions(id),
    timestamp REAL NOT NULL,
    sequence INTEGER NOT NULL,
    adv_raw_count INTEGER NOT NULL,
    mac_count INTEGER NOT NULL,
    lat REAL,
    lon REAL,
    speed_kts REAL,
    document TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sightings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    capture_id INTEGER NOT NULL REFERENCES captures(id),
    mac TEXT NOT NULL,
    addr_type INTEGER NOT NULL,
    adv_type INTEGER NOT NULL,
    rssi INTEGER NOT NULL,
    n_adv INTEGER NOT NULL,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS devices (
    mac TEXT PRIMARY KEY,
    first_seen REAL NOT NULL,
    last_seen REAL NOT NULL,
    sightings INTEGER DEFAULT 0,
    best_rssi INTEGER,
    last_lat REAL,
    last_lon REAL
);

CREATE INDEX IF NOT EXISTS idx_captures_timestamp ON captures(timestamp);
CREATE INDEX IF NOT EXISTS idx_captures_session ON captures(session_id);
CREATE INDEX IF NOT EXISTS idx_sightings_mac ON sightings(mac);
CREATE INDEX IF NOT EXISTS idx_sightings_capture ON sightings(capture_id);
CREATE INDEX IF NOT EXISTS idx_devices_last_seen ON devices(last_seen);
"#;

/// SQLite database for BLE capture records.
pub struct Database {
    conn: Connection,
    batch: bool,
    pending: u32,
    session_id: Option<i64>,
}

impl Database {
    /// Open or create a database at the given path.
    ///
    /// Missing parent directories are created; failing to create them is an
    /// `Io` error rather than a confusing SQLite open failure.
    pub fn open(path: &str) -> Result<Self, SinkError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory().map_err(backend)?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Connection::open(path).map_err(backend)?
        };

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;

        Ok(Database {
            conn,
            batch: false,
            pending: 0,
            session_id: None,
        })
    }

    /// Group writes into one transaction until `flush()`.
    pub fn set_batch(&mut self, batch: bool) -> SqlResult<()> {
        if batch == self.batch {
            return Ok(());
        }
        if batch {
            self.conn.execute_batch("BEGIN;")?;
        } else {
            self.conn.execute_batch("COMMIT;")?;
            self.pending = 0;
        }
        self.batch = batch;
        Ok(())
    }

    /// Commit pending batched writes.
    pub fn commit(&mut self) -> SqlResult<()> {
        if self.batch && self.pending > 0 {
            self.conn.execute_batch("COMMIT; BEGIN;")?;
            self.pending = 0;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Start a capture session. Later captures are attached to it.
    pub fn start_session(&mut self, source: &str, layout: &str) -> SqlResult<i64> {
        self.conn.execute(
            "INSERT INTO sessions (source, layout, start_time) VALUES (?1, ?2, ?3)",
            params![source, layout, unix_now()],
        )?;
        let id = self.conn.last_insert_rowid();
        self.session_id = Some(id);
        Ok(id)
    }

    pub fn end_session(
        &mut self,
        session_id: i64,
        stop_reason: &str,
        frames: u64,
        stored: u64,
        sequence_gaps: u64,
        bytes_skipped: u64,
    ) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE sessions SET end_time = ?1, stop_reason = ?2, frames = ?3, stored = ?4,
                 sequence_gaps = ?5, bytes_skipped = ?6
             WHERE id = ?7",
            params![
                unix_now(),
                stop_reason,
                frames as i64,
                stored as i64,
                sequence_gaps as i64,
                bytes_skipped as i64,
                session_id
            ],
        )?;
        if self.session_id == Some(session_id) {
            self.session_id = None;
        }
        Ok(())
    }

    /// Close a session from a pipeline run summary.
    pub fn end_session_from(&mut self, session_id: i64, summary: &RunSummary) -> SqlResult<()> {
        let reason = match summary.reason {
            StopReason::Duration => "duration",
            StopReason::Signal => "signal",
        };
        self.end_session(
            session_id,
            reason,
            summary.decoder.frames,
            summary.capture.stored,
            summary.decoder.sequence_gaps,
            summary.decoder.bytes_skipped,
        )
    }

    // -----------------------------------------------------------------------
    // Captures
    // -----------------------------------------------------------------------

    /// Insert one capture with its sightings. Returns capture_id.
    ///
    /// The capture row, its sightings and the device upserts are written
    /// under one savepoint: either all of them land or none do. Inside batch
    /// mode the savepoint nests in the open transaction, so a failed record
    /// rolls back alone.
    pub fn insert_capture(&mut self, record: &CaptureRecord) -> Result<i64, SinkError> {
        let document = serde_json::to_string(record)?;
        let header = record.header();
        let fix = record.gps();
        let position = fix.map(|f| (f.latitude, f.longitude));
        let session_id = self.session_id;

        let sp = self.conn.savepoint().map_err(backend)?;
        sp.execute(
            "INSERT INTO captures (session_id, timestamp, sequence, adv_raw_count, mac_count,
                 lat, lon, speed_kts, document)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session_id,
                record.timestamp,
                header.sequence,
                header.adv_raw_count,
                header.mac_count,
                fix.map(|f| f.latitude),
                fix.map(|f| f.longitude),
                fix.map(|f| f.speed_kts),
                document
            ],
        )
        .map_err(backend)?;
        let capture_id = sp.last_insert_rowid();

        for device in record.devices() {
            let mac = device.mac_string();
            sp.execute(
                "INSERT INTO sightings (capture_id, mac, addr_type, adv_type, rssi, n_adv, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    capture_id,
                    mac,
                    device.addr_type,
                    device.adv_type,
                    device.rssi,
                    device.n_adv,
                    hex_encode(device.payload())
                ],
            )
            .map_err(backend)?;
            upsert_device(&sp, &mac, device.rssi, record.timestamp, position).map_err(backend)?;
        }
        sp.commit().map_err(backend)?;

        self.pending += 1;
        Ok(capture_id)
    }

    pub fn count_captures(&self) -> i64 {
        self.conn
            .query_row("SELECT COUNT(*) FROM captures", [], |r| r.get(0))
            .unwrap_or(0)
    }

    /// Most recent captures first.
    pub fn recent_captures(&self, limit: i64) -> SqlResult<Vec<CaptureRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, sequence, adv_raw_count, mac_count, lat, lon
             FROM captures ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |r| {
            Ok(CaptureRow {
                id: r.get(0)?,
                timestamp: r.get(1)?,
                sequence: r.get(2)?,
                adv_raw_count: r.get(3)?,
                mac_count: r.get(4)?,
                lat: r.get(5)?,
                lon: r.get(6)?,
            })
        })?;
        rows.collect()
    }

    /// Stored JSON document for a capture.
    pub fn capture_document(&self, capture_id: i64) -> SqlResult<Option<serde_json::Value>> {
        let text: Option<String> = self
            .conn
            .query_row(
                "SELECT document FROM captures WHERE id = ?1",
                params![capture_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(text.and_then(|t| serde_json::from_str(&t).ok()))
    }

    // -----------------------------------------------------------------------
    // Devices
    // -----------------------------------------------------------------------

    pub fn get_device(&self, mac: &str) -> SqlResult<Option<DeviceRow>> {
        self.conn
            .query_row(
                "SELECT mac, first_seen, last_seen, sightings, best_rssi, last_lat, last_lon
                 FROM devices WHERE mac = ?1",
                params![mac],
                device_row,
            )
            .optional()
    }

    /// Devices ordered by number of sightings.
    pub fn top_devices(&self, limit: i64) -> SqlResult<Vec<DeviceRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT mac, first_seen, last_seen, sightings, best_rssi, last_lat, last_lon
             FROM devices ORDER BY sightings DESC, last_seen DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], device_row)?;
        rows.collect()
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    fn count(&self, table: &str) -> i64 {
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap_or(0)
    }

    pub fn stats(&self) -> DbStats {
        DbStats {
            sessions: self.count("sessions"),
            captures: self.count_captures(),
            sightings: self.count("sightings"),
            devices: self.count("devices"),
            with_fix: self
                .conn
                .query_row(
                    "SELECT COUNT(*) FROM captures WHERE lat IS NOT NULL",
                    [],
                    |r| r.get(0),
                )
                .unwrap_or(0),
        }
    }
}

fn upsert_device(
    conn: &Connection,
    mac: &str,
    rssi: i8,
    timestamp: f64,
    position: Option<(f64, f64)>,
) -> SqlResult<()> {
    let (lat, lon) = position.unzip();
    conn.execute(
        "INSERT INTO devices
             (mac, first_seen, last_seen, sightings, best_rssi, last_lat, last_lon)
         VALUES (?1, ?2, ?2, 1, ?3, ?4, ?5)
         ON CONFLICT(mac) DO UPDATE SET
            last_seen = MAX(last_seen, excluded.last_seen),
            sightings = sightings + 1,
            best_rssi = MAX(COALESCE(best_rssi, -128), excluded.best_rssi),
            last_lat = COALESCE(excluded.last_lat, last_lat),
            last_lon = COALESCE(excluded.last_lon, last_lon)",
        params![mac, timestamp, rssi, lat, lon],
    )?;
    Ok(())
}

fn backend(e: rusqlite::Error) -> SinkError {
    SinkError::Backend(e.to_string())
}

fn device_row(r: &rusqlite::Row<'_>) -> SqlResult<DeviceRow> {
    Ok(DeviceRow {
        mac: r.get(0)?,
        first_seen: r.get(1)?,
        last_seen: r.get(2)?,
        sightings: r.get(3)?,
        best_rssi: r.get(4)?,
        last_lat: r.get(5)?,
        last_lon: r.get(6)?,
    })
}

impl CaptureSink for Database {
    fn store(&mut self, record: &CaptureRecord) -> Result<(), SinkError> {
        self.insert_capture(record).map(|_| ())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.commit().map_err(backend)
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct CaptureRow {
    pub id: i64,
    pub timestamp: f64,
    pub sequence: i64,
    pub adv_raw_count: i64,
    pub mac_count: i64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct DeviceRow {
    pub mac: String,
    pub first_seen: f64,
    pub last_seen: f64,
    pub sightings: i64,
    pub best_rssi: Option<i64>,
    pub last_lat: Option<f64>,
    pub last_lon: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct DbStats {
    pub sessions: i64,
    pub captures: i64,
    pub sightings: i64,
    pub devices: i64,
    pub with_fix: i64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bletrack_core::frame::{Frame, FrameHeader};
    use bletrack_core::types::{mac_from_str, DeviceRecord, GpsFix, ADV_DATA_LEN};

    fn test_db() -> Database {
        Database::open(":memory:").unwrap()
    }

    fn device(mac: &str, rssi: i8) -> DeviceRecord {
        let mut data = [0u8; ADV_DATA_LEN];
        data[..3].copy_from_slice(&[0x02, 0x01, 0x06]);
        DeviceRecord {
            mac: mac_from_str(mac).unwrap(),
            addr_type: 1,
            adv_type: 0,
            rssi,
            data_len: 3,
            data,
            n_adv: 2,
        }
    }

    fn record(seq: u8, devices: Vec<DeviceRecord>, fix: Option<GpsFix>, ts: f64) -> CaptureRecord {
        let frame = Frame {
            header: FrameHeader {
                sequence: seq,
                adv_raw_count: 20,
                mac_count: devices.len() as u16,
            },
            devices,
            sequence_gap: false,
        };
        CaptureRecord::new(frame, fix, ts)
    }

    fn fix() -> GpsFix {
        GpsFix {
            latitude: 43.3623,
            longitude: -8.4115,
            speed_kts: 3.2,
            valid: true,
            observed_at: 10.0,
        }
    }

    #[test]
    fn test_open_memory() {
        let db = test_db();
        assert_eq!(db.count_captures(), 0);
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/captures.db");
        let db = Database::open(path.to_str().unwrap()).unwrap();
        assert_eq!(db.count_captures(), 0);
        assert!(path.exists());
    }

    #[test]
    fn test_open_reports_unusable_parent() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let path = blocker.join("captures.db");

        match Database::open(path.to_str().unwrap()) {
            Err(SinkError::Io(_)) => {}
            Err(other) => panic!("expected I/O error, got {other}"),
            Ok(_) => panic!("opened a database below a regular file"),
        }
    }

    /// Make the second sightings insert of any capture fail.
    fn fail_second_sighting(db: &Database) {
        db.conn
            .execute_batch(
                "CREATE TRIGGER fail_second_sighting BEFORE INSERT ON sightings
                 WHEN (SELECT COUNT(*) FROM sightings WHERE capture_id = NEW.capture_id) >= 1
                 BEGIN SELECT RAISE(ABORT, 'sightings insert rejected'); END;",
            )
            .unwrap();
    }

    #[test]
    fn test_failed_capture_leaves_no_partial_rows() {
        let mut db = test_db();
        fail_second_sighting(&db);

        let rec = record(
            4,
            vec![device("AA:BB:CC:00:00:01", -40), device("AA:BB:CC:00:00:02", -70)],
            Some(fix()),
            10.0,
        );
        assert!(matches!(db.store(&rec), Err(SinkError::Backend(_))));

        let stats = db.stats();
        assert_eq!(stats.captures, 0);
        assert_eq!(stats.sightings, 0);
        assert_eq!(stats.devices, 0);

        // Single-device captures still go through
        db.store(&record(5, vec![device("AA:BB:CC:00:00:03", -50)], None, 11.0))
            .unwrap();
        assert_eq!(db.stats().captures, 1);
        assert_eq!(db.stats().devices, 1);
    }

    #[test]
    fn test_failed_capture_in_batch_keeps_earlier_records() {
        let mut db = test_db();
        db.set_batch(true).unwrap();
        fail_second_sighting(&db);

        db.store(&record(1, vec![device("11:11:11:11:11:11", -60)], None, 1.0))
            .unwrap();
        let bad = record(
            2,
            vec![device("22:22:22:22:22:22", -61), device("33:33:33:33:33:33", -62)],
            None,
            2.0,
        );
        assert!(db.store(&bad).is_err());
        db.flush().unwrap();
        db.set_batch(false).unwrap();

        let stats = db.stats();
        assert_eq!(stats.captures, 1);
        assert_eq!(stats.sightings, 1);
        assert_eq!(stats.devices, 1);
        assert!(db.get_device("22:22:22:22:22:22").unwrap().is_none());
    }

    #[test]
    fn test_insert_capture() {
        let mut db = test_db();
        let rec = record(
            5,
            vec![device("AA:BB:CC:00:00:01", -40), device("AA:BB:CC:00:00:02", -70)],
            Some(fix()),
            100.0,
        );
        let id = db.insert_capture(&rec).unwrap();
        assert!(id > 0);

        let stats = db.stats();
        assert_eq!(stats.captures, 1);
        assert_eq!(stats.sightings, 2);
        assert_eq!(stats.devices, 2);
        assert_eq!(stats.with_fix, 1);

        let doc = db.capture_document(id).unwrap().unwrap();
        assert_eq!(doc["sequence"], 5);
        assert_eq!(doc["devices"][1]["rssi"], -70);
        assert_eq!(doc["gps"]["latitude"], 43.3623);
    }

    #[test]
    fn test_device_aggregation() {
        let mut db = test_db();
        db.insert_capture(&record(1, vec![device("11:22:33:44:55:66", -80)], Some(fix()), 1.0))
            .unwrap();
        db.insert_capture(&record(2, vec![device("11:22:33:44:55:66", -50)], None, 5.0))
            .unwrap();
        db.insert_capture(&record(3, vec![device("11:22:33:44:55:66", -90)], None, 3.0))
            .unwrap();

        let dev = db.get_device("11:22:33:44:55:66").unwrap().unwrap();
        assert_eq!(dev.sightings, 3);
        assert_eq!(dev.first_seen, 1.0);
        assert_eq!(dev.last_seen, 5.0);
        assert_eq!(dev.best_rssi, Some(-50));
        // Position from the last fix is kept when later captures have none
        assert_eq!(dev.last_lat, Some(43.3623));
        assert!(db.get_device("00:00:00:00:00:00").unwrap().is_none());
    }

    #[test]
    fn test_recent_and_top() {
        let mut db = test_db();
        for i in 0..5u8 {
            let mut devices = vec![device("AA:AA:AA:AA:AA:AA", -60)];
            if i % 2 == 0 {
                devices.push(device("BB:BB:BB:BB:BB:BB", -70));
            }
            db.insert_capture(&record(i, devices, None, i as f64)).unwrap();
        }
        let recent = db.recent_captures(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].sequence, 4);

        let top = db.top_devices(10).unwrap();
        assert_eq!(top[0].mac, "AA:AA:AA:AA:AA:AA");
        assert_eq!(top[0].sightings, 5);
        assert_eq!(top[1].sightings, 3);
    }

    #[test]
    fn test_session_lifecycle() {
        let mut db = test_db();
        let sid = db.start_session("/dev/ttyUSB0", "wide").unwrap();
        assert!(sid > 0);
        db.insert_capture(&record(1, vec![], None, 1.0)).unwrap();
        db.end_session(sid, "signal", 1, 1, 0, 3).unwrap();

        let session_of_capture: Option<i64> = db
            .conn
            .query_row("SELECT session_id FROM captures LIMIT 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(session_of_capture, Some(sid));
        assert_eq!(db.stats().sessions, 1);

        // Captures after the session ends are unattached
        db.insert_capture(&record(2, vec![], None, 2.0)).unwrap();
        let unattached: i64 = db
            .conn
            .query_row(
                "SELECT COUNT(*) FROM captures WHERE session_id IS NULL",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(unattached, 1);
    }

    #[test]
    fn test_batch_mode_commits_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.db");
        let path = path.to_str().unwrap();

        let mut db = Database::open(path).unwrap();
        db.set_batch(true).unwrap();
        db.store(&record(1, vec![device("AA:BB:CC:DD:EE:01", -33)], None, 1.0))
            .unwrap();
        db.flush().unwrap();

        // A second connection sees committed rows
        let other = Database::open(path).unwrap();
        assert_eq!(other.count_captures(), 1);
        drop(other);

        db.set_batch(false).unwrap();
        db.store(&record(2, vec![], None, 2.0)).unwrap();
        assert_eq!(Database::open(path).unwrap().count_captures(), 2);
    }

    #[test]
    fn test_sink_trait_object() {
        let mut sink: Box<dyn CaptureSink> = Box::new(test_db());
        sink.store(&record(9, vec![], None, 9.0)).unwrap();
        sink.flush().unwrap();
    }
}
