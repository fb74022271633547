//! Per-event archive
//!
//! One SQLite file per event holds everything gathered and produced for that
//! event: event and station metadata, observed and synthetic waveforms, the
//! run configuration of each evaluation and keyed auxiliary records (misfit
//! windows, adjoint sources).
//!
//! The archive is opened in exclusive locking mode on a single connection, so
//! exactly one process at a time may hold it. A second opener fails quickly
//! with [`FlowaError::ArchiveBusy`].

pub mod records;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions,
};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::{FlowaError, Result};
use crate::models::{Event, StationMetadata, Stream, WindowSet};

pub use records::{AdjointRecord, AuxEntry, AuxRecord, WindowRecord, ADJOINT_SOURCES, MISFIT_WINDOWS};

/// How long a second opener waits for the lock before giving up
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

/// Waveform tag for observed data, which does not change between evaluations
pub const OBSERVED_TAG: &str = "observed";

/// Waveform tag for synthetics of one evaluation, e.g. `synthetic_m00s00`
pub fn synthetic_tag(model: &str, step: &str) -> String {
    format!("synthetic_{}{}", model, step)
}

/// Exclusive handle on one event archive
#[derive(Debug)]
pub struct Archive {
    pool: SqlitePool,
    path: PathBuf,
}

impl Archive {
    /// Open (creating if needed) and lock an archive file
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", path.display());
        debug!("Opening archive: {}", db_url);

        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(SqliteJournalMode::Delete)
            .locking_mode(SqliteLockingMode::Exclusive)
            .busy_timeout(BUSY_TIMEOUT);

        // The lock lives as long as the one connection, so it must never be recycled
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| busy_or(e, path))?;

        // Take the exclusive lock now rather than at the first write, and keep it
        lock_exclusive(&pool).await.map_err(|e| busy_or(e, path))?;
        init_tables(&pool).await?;

        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Delete every record of one evaluation: auxiliary data, config and synthetics
    ///
    /// Observed waveforms and metadata are shared between evaluations and kept.
    pub async fn clean(&self, model: &str, step: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM auxiliary WHERE model = ? AND step = ?")
            .bind(model)
            .bind(step)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM config WHERE model = ? AND step = ?")
            .bind(model)
            .bind(step)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM waveforms WHERE tag = ?")
            .bind(synthetic_tag(model, step))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    /// Store the run configuration used for one evaluation
    pub async fn write_config(&self, model: &str, step: &str, config: &serde_json::Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO config (model, step, record, saved_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(model, step) DO UPDATE SET
                record = excluded.record,
                saved_at = excluded.saved_at
            "#,
        )
        .bind(model)
        .bind(step)
        .bind(serde_json::to_string(config)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn read_event(&self, event_id: &str) -> Result<Option<Event>> {
        let row = sqlx::query("SELECT record FROM events WHERE event_id = ?")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        decode_row(row)
    }

    pub async fn write_event(&self, event: &Event) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (event_id, record, saved_at) VALUES (?, ?, ?)
            ON CONFLICT(event_id) DO UPDATE SET
                record = excluded.record,
                saved_at = excluded.saved_at
            "#,
        )
        .bind(&event.event_id)
        .bind(serde_json::to_string(event)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn read_station(&self, network: &str, station: &str) -> Result<Option<StationMetadata>> {
        let row = sqlx::query("SELECT record FROM stations WHERE network = ? AND station = ?")
            .bind(network)
            .bind(station)
            .fetch_optional(&self.pool)
            .await?;
        decode_row(row)
    }

    pub async fn write_station(&self, metadata: &StationMetadata) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stations (network, station, record, saved_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(network, station) DO UPDATE SET
                record = excluded.record,
                saved_at = excluded.saved_at
            "#,
        )
        .bind(&metadata.network)
        .bind(&metadata.station)
        .bind(serde_json::to_string(metadata)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn read_waveforms(&self, network: &str, station: &str, tag: &str) -> Result<Option<Stream>> {
        let row = sqlx::query(
            "SELECT record FROM waveforms WHERE network = ? AND station = ? AND tag = ?",
        )
        .bind(network)
        .bind(station)
        .bind(tag)
        .fetch_optional(&self.pool)
        .await?;
        decode_row(row)
    }

    pub async fn write_waveforms(&self, network: &str, station: &str, tag: &str, stream: &Stream) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO waveforms (network, station, tag, record, saved_at) VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(network, station, tag) DO UPDATE SET
                record = excluded.record,
                saved_at = excluded.saved_at
            "#,
        )
        .bind(network)
        .bind(station)
        .bind(tag)
        .bind(serde_json::to_string(stream)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replace one station's auxiliary records for an evaluation, all or nothing
    pub async fn persist_station(
        &self,
        model: &str,
        step: &str,
        network: &str,
        station: &str,
        records: &[AuxRecord],
    ) -> Result<()> {
        let saved_at = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM auxiliary WHERE model = ? AND step = ? AND network = ? AND station = ?",
        )
        .bind(model)
        .bind(step)
        .bind(network)
        .bind(station)
        .execute(&mut *tx)
        .await?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO auxiliary (
                    category, model, step, network, station, component, idx, record, saved_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(record.category)
            .bind(model)
            .bind(step)
            .bind(network)
            .bind(station)
            .bind(&record.component)
            .bind(record.index as i64)
            .bind(serde_json::to_string(&record.payload)?)
            .bind(&saved_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Windows of the most recent evaluation before `(model, step)`
    ///
    /// Tags are zero padded, so string order is evaluation order.
    pub async fn previous_windows(
        &self,
        network: &str,
        station: &str,
        model: &str,
        step: &str,
    ) -> Result<Option<WindowSet>> {
        let latest = sqlx::query(
            r#"
            SELECT model, step FROM auxiliary
            WHERE category = ? AND network = ? AND station = ?
              AND (model < ? OR (model = ? AND step < ?))
            ORDER BY model DESC, step DESC
            LIMIT 1
            "#,
        )
        .bind(MISFIT_WINDOWS)
        .bind(network)
        .bind(station)
        .bind(model)
        .bind(model)
        .bind(step)
        .fetch_optional(&self.pool)
        .await?;

        let Some(latest) = latest else {
            return Ok(None);
        };
        let found_model: String = latest.get("model");
        let found_step: String = latest.get("step");

        let rows = sqlx::query(
            r#"
            SELECT component, record FROM auxiliary
            WHERE category = ? AND model = ? AND step = ? AND network = ? AND station = ?
            ORDER BY component, idx
            "#,
        )
        .bind(MISFIT_WINDOWS)
        .bind(&found_model)
        .bind(&found_step)
        .bind(network)
        .bind(station)
        .fetch_all(&self.pool)
        .await?;

        let mut windows = WindowSet::new();
        for row in rows {
            let component: String = row.get("component");
            let record: String = row.get("record");
            let record: WindowRecord = serde_json::from_str(&record)?;
            windows.entry(component).or_default().push(record.to_window());
        }
        debug!(
            station = %format!("{}.{}", network, station),
            model = %found_model,
            step = %found_step,
            "Loaded previous windows"
        );
        Ok(Some(windows))
    }

    /// All auxiliary records of one category, in key order
    pub async fn list_auxiliary(&self, category: &str) -> Result<Vec<AuxEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT category, model, step, network, station, component, idx, record
            FROM auxiliary WHERE category = ?
            ORDER BY model, step, network, station, component, idx
            "#,
        )
        .bind(category)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let record: String = row.get("record");
                let idx: i64 = row.get("idx");
                Ok(AuxEntry {
                    category: row.get("category"),
                    model: row.get("model"),
                    step: row.get("step"),
                    network: row.get("network"),
                    station: row.get("station"),
                    component: row.get("component"),
                    index: idx as u32,
                    payload: serde_json::from_str(&record)?,
                })
            })
            .collect()
    }
}

async fn lock_exclusive(pool: &SqlitePool) -> std::result::Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN EXCLUSIVE").execute(&mut *conn).await?;
    sqlx::query("COMMIT").execute(&mut *conn).await?;
    Ok(())
}

fn busy_or(err: sqlx::Error, path: &Path) -> FlowaError {
    if is_busy(&err) {
        FlowaError::ArchiveBusy(path.to_path_buf())
    } else {
        FlowaError::Archive(err)
    }
}

/// SQLITE_BUSY or SQLITE_LOCKED, including extended codes
fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let code_busy = db
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .map(|c| matches!(c & 0xff, 5 | 6))
                .unwrap_or(false);
            code_busy || db.message().contains("database is locked")
        }
        _ => false,
    }
}

fn decode_row<T: serde::de::DeserializeOwned>(row: Option<sqlx::sqlite::SqliteRow>) -> Result<Option<T>> {
    match row {
        Some(row) => {
            let record: String = row.get("record");
            Ok(Some(serde_json::from_str(&record)?))
        }
        None => Ok(None),
    }
}

/// Create archive tables if they don't exist
async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            event_id TEXT PRIMARY KEY,
            record TEXT NOT NULL,
            saved_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stations (
            network TEXT NOT NULL,
            station TEXT NOT NULL,
            record TEXT NOT NULL,
            saved_at TEXT NOT NULL,
            PRIMARY KEY (network, station)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS waveforms (
            network TEXT NOT NULL,
            station TEXT NOT NULL,
            tag TEXT NOT NULL,
            record TEXT NOT NULL,
            saved_at TEXT NOT NULL,
            PRIMARY KEY (network, station, tag)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS auxiliary (
            category TEXT NOT NULL,
            model TEXT NOT NULL,
            step TEXT NOT NULL,
            network TEXT NOT NULL,
            station TEXT NOT NULL,
            component TEXT NOT NULL,
            idx INTEGER NOT NULL,
            record TEXT NOT NULL,
            saved_at TEXT NOT NULL,
            PRIMARY KEY (category, model, step, network, station, component, idx)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS config (
            model TEXT NOT NULL,
            step TEXT NOT NULL,
            record TEXT NOT NULL,
            saved_at TEXT NOT NULL,
            PRIMARY KEY (model, step)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Trace, Window};
    use chrono::TimeZone;

    fn trace() -> Trace {
        Trace {
            network: "NZ".into(),
            station: "BFZ".into(),
            location: String::new(),
            channel: "HHZ".into(),
            starttime: Utc.with_ymd_and_hms(2018, 2, 18, 7, 43, 28).unwrap(),
            sampling_rate: 10.0,
            data: vec![0.0; 100],
            processing: vec![],
        }
    }

    fn window_record(left: usize) -> AuxRecord {
        let window = Window {
            left,
            right: left + 10,
            cc_shift: 1,
            dlna: 0.0,
            max_cc_value: 0.9,
            weight: 1.0,
        };
        AuxRecord {
            category: MISFIT_WINDOWS,
            component: "Z".into(),
            index: 0,
            payload: serde_json::to_value(WindowRecord::new(&window, &trace(), -20.0)).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_second_open_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2018p130600.db");

        let first = Archive::open(&path).await.unwrap();
        let second = Archive::open(&path).await;
        assert!(matches!(second, Err(FlowaError::ArchiveBusy(_))), "{:?}", second);

        first.close().await;
        let reopened = Archive::open(&path).await;
        assert!(reopened.is_ok());
    }

    #[tokio::test]
    async fn test_waveform_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(&dir.path().join("a.db")).await.unwrap();

        let stream = Stream::new(vec![trace()]);
        archive
            .write_waveforms("NZ", "BFZ", OBSERVED_TAG, &stream)
            .await
            .unwrap();
        let back = archive
            .read_waveforms("NZ", "BFZ", OBSERVED_TAG)
            .await
            .unwrap();
        assert_eq!(back, Some(stream));
        assert!(archive
            .read_waveforms("NZ", "BFZ", &synthetic_tag("m00", "s00"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_clean_only_touches_current_evaluation() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(&dir.path().join("a.db")).await.unwrap();

        archive
            .persist_station("m00", "s00", "NZ", "BFZ", &[window_record(5)])
            .await
            .unwrap();
        archive
            .persist_station("m01", "s00", "NZ", "BFZ", &[window_record(7)])
            .await
            .unwrap();

        let stream = Stream::new(vec![trace()]);
        for tag in [synthetic_tag("m00", "s00"), synthetic_tag("m01", "s00"), OBSERVED_TAG.to_string()] {
            archive.write_waveforms("NZ", "BFZ", &tag, &stream).await.unwrap();
        }

        let removed = archive.clean("m01", "s00").await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(archive.list_auxiliary(MISFIT_WINDOWS).await.unwrap().len(), 1);

        // Only the synthetics of the cleaned evaluation go
        for (tag, kept) in [
            (synthetic_tag("m01", "s00"), false),
            (synthetic_tag("m00", "s00"), true),
            (OBSERVED_TAG.to_string(), true),
        ] {
            let stored = archive.read_waveforms("NZ", "BFZ", &tag).await.unwrap();
            assert_eq!(stored.is_some(), kept, "{}", tag);
        }
    }

    #[tokio::test]
    async fn test_persist_replaces_station_records() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(&dir.path().join("a.db")).await.unwrap();

        let mut second = window_record(20);
        second.index = 1;
        archive
            .persist_station("m00", "s00", "NZ", "BFZ", &[window_record(5), second])
            .await
            .unwrap();
        archive
            .persist_station("m00", "s00", "NZ", "BFZ", &[window_record(5)])
            .await
            .unwrap();

        assert_eq!(archive.list_auxiliary(MISFIT_WINDOWS).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_key_rolls_back_whole_station() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(&dir.path().join("a.db")).await.unwrap();

        // Same key twice violates the primary key on the second insert
        let result = archive
            .persist_station("m00", "s00", "NZ", "BFZ", &[window_record(5), window_record(9)])
            .await;
        assert!(result.is_err());
        assert!(archive.list_auxiliary(MISFIT_WINDOWS).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_previous_windows_picks_latest_earlier_evaluation() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(&dir.path().join("a.db")).await.unwrap();

        archive
            .persist_station("m00", "s00", "NZ", "BFZ", &[window_record(5)])
            .await
            .unwrap();
        archive
            .persist_station("m01", "s00", "NZ", "BFZ", &[window_record(7)])
            .await
            .unwrap();

        let windows = archive
            .previous_windows("NZ", "BFZ", "m01", "s02")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(windows["Z"][0].left, 7);

        let windows = archive
            .previous_windows("NZ", "BFZ", "m01", "s00")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(windows["Z"][0].left, 5);

        assert!(archive
            .previous_windows("NZ", "BFZ", "m00", "s00")
            .await
            .unwrap()
            .is_none());
    }
}
