//! presence-store — SQLite persistence for the attendance core.
//!
//! One database file holds three tables: enrolled persons (with their
//! facial template as a JSON float array), per-weekday work schedules,
//! and the attendance ledger. [`SqliteStore`] implements the core's
//! boundary traits over a shared async connection.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use presence_core::{
    AttendanceLedger, AttendanceRecord, CaptureMethod, DirectoryError, EnrolledTemplate,
    LedgerError, ScheduleError, ScheduleLookup, Template, TemplateDirectory,
};
use rusqlite::params;
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

const DAY_FMT: &str = "%Y-%m-%d";
const TIMESTAMP_FMT: &str = "%Y-%m-%dT%H:%M:%S";
const TIME_FMT: &str = "%H:%M";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS persons (
    id        INTEGER PRIMARY KEY,
    name      TEXT NOT NULL,
    template  TEXT
);

CREATE TABLE IF NOT EXISTS schedules (
    person_id   INTEGER NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
    weekday     INTEGER NOT NULL CHECK (weekday BETWEEN 0 AND 6),
    start_time  TEXT NOT NULL,
    PRIMARY KEY (person_id, weekday)
);

CREATE TABLE IF NOT EXISTS attendance (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id        INTEGER NOT NULL REFERENCES persons(id),
    day              TEXT NOT NULL,
    entry_at         TEXT NOT NULL,
    exit_at          TEXT,
    lateness_minutes INTEGER NOT NULL DEFAULT 0,
    method           TEXT NOT NULL,
    UNIQUE (person_id, day)
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
}

/// A person row as shown by the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct PersonRow {
    pub id: i64,
    pub name: String,
    pub enrolled: bool,
}

/// Clone-safe handle to the attendance database.
#[derive(Clone)]
pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open(path.as_ref().to_path_buf()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory database, used by tests and diagnostics.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Create or rename a person. Enrollment is a separate step.
    pub async fn upsert_person(&self, id: i64, name: String) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO persons (id, name) VALUES (?1, ?2)
                     ON CONFLICT(id) DO UPDATE SET name = excluded.name",
                    params![id, name],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Store a person's template. Re-enrollment overwrites the previous
    /// one — a person has exactly one template at a time.
    pub async fn enroll_template(
        &self,
        person_id: i64,
        template: &Template,
    ) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(template)
            .map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))?;
        self.conn
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE persons SET template = ?2 WHERE id = ?1",
                    params![person_id, encoded],
                )?;
                if updated == 0 {
                    return Err(rusqlite::Error::QueryReturnedNoRows.into());
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Remove a person; their template and schedule go with them.
    /// Attendance history is kept.
    pub async fn remove_person(&self, person_id: i64) -> Result<bool, StoreError> {
        let removed = self
            .conn
            .call(move |conn| {
                conn.execute("DELETE FROM schedules WHERE person_id = ?1", params![person_id])?;
                let n = conn.execute("DELETE FROM persons WHERE id = ?1", params![person_id])?;
                Ok(n > 0)
            })
            .await?;
        Ok(removed)
    }

    pub async fn list_persons(&self) -> Result<Vec<PersonRow>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id, name, template IS NOT NULL FROM persons ORDER BY id")?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(PersonRow {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            enrolled: row.get(2)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Set the expected start time for one weekday (0 = Monday).
    pub async fn set_schedule(
        &self,
        person_id: i64,
        weekday: u8,
        start: NaiveTime,
    ) -> Result<(), StoreError> {
        let start = start.format(TIME_FMT).to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO schedules (person_id, weekday, start_time) VALUES (?1, ?2, ?3)
                     ON CONFLICT(person_id, weekday) DO UPDATE SET start_time = excluded.start_time",
                    params![person_id, weekday, start],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// All attendance records for one calendar day, oldest entry first.
    pub async fn records_for_day(&self, day: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        let day_str = day.format(DAY_FMT).to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, person_id, day, entry_at, exit_at, lateness_minutes, method
                     FROM attendance WHERE day = ?1 ORDER BY entry_at",
                )?;
                let rows = stmt
                    .query_map(params![day_str], record_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }
}

fn parse_text_column<T, E>(
    value: &str,
    idx: usize,
    parse: impl Fn(&str) -> Result<T, E>,
) -> rusqlite::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    parse(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let day: String = row.get(2)?;
    let entry_at: String = row.get(3)?;
    let exit_at: Option<String> = row.get(4)?;
    let method: String = row.get(6)?;

    Ok(AttendanceRecord {
        id: row.get(0)?,
        person_id: row.get(1)?,
        day: parse_text_column(&day, 2, |s| NaiveDate::parse_from_str(s, DAY_FMT))?,
        entry_at: parse_text_column(&entry_at, 3, |s| {
            NaiveDateTime::parse_from_str(s, TIMESTAMP_FMT)
        })?,
        exit_at: exit_at
            .map(|s| {
                parse_text_column(&s, 4, |s| NaiveDateTime::parse_from_str(s, TIMESTAMP_FMT))
            })
            .transpose()?,
        lateness_minutes: row.get(5)?,
        method: parse_text_column(&method, 6, CaptureMethod::from_str)?,
    })
}

#[async_trait]
impl TemplateDirectory for SqliteStore {
    async fn list_enrolled(&self) -> Result<Vec<EnrolledTemplate>, DirectoryError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, template FROM persons WHERE template IS NOT NULL ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;

        // A row that fails template decoding is skipped, not fatal: one
        // corrupt enrollment must not take matching down for everyone.
        let mut enrolled = Vec::with_capacity(rows.len());
        for (person_id, name, encoded) in rows {
            match serde_json::from_str::<Template>(&encoded) {
                Ok(template) => enrolled.push(EnrolledTemplate {
                    person_id,
                    name,
                    template,
                }),
                Err(err) => {
                    tracing::warn!(person_id, error = %err, "skipping undecodable template");
                }
            }
        }
        Ok(enrolled)
    }
}

#[async_trait]
impl AttendanceLedger for SqliteStore {
    async fn find_for_day(
        &self,
        person_id: i64,
        day: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, LedgerError> {
        let day_str = day.format(DAY_FMT).to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, person_id, day, entry_at, exit_at, lateness_minutes, method
                     FROM attendance WHERE person_id = ?1 AND day = ?2",
                )?;
                let mut rows = stmt.query_map(params![person_id, day_str], record_from_row)?;
                Ok(rows.next().transpose()?)
            })
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))
    }

    async fn create_entry(
        &self,
        person_id: i64,
        day: NaiveDate,
        entry_at: NaiveDateTime,
        lateness_minutes: i64,
        method: CaptureMethod,
    ) -> Result<AttendanceRecord, LedgerError> {
        let day_str = day.format(DAY_FMT).to_string();
        let entry_str = entry_at.format(TIMESTAMP_FMT).to_string();
        let method_str = method.to_string();
        let id = self
            .conn
            .call(move |conn| {
                // UNIQUE(person_id, day) backstops the resolver's lock:
                // a second same-day insert fails instead of duplicating.
                conn.execute(
                    "INSERT INTO attendance (person_id, day, entry_at, lateness_minutes, method)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![person_id, day_str, entry_str, lateness_minutes, method_str],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        Ok(AttendanceRecord {
            id,
            person_id,
            day,
            entry_at,
            exit_at: None,
            lateness_minutes,
            method,
        })
    }

    async fn close_record(
        &self,
        record_id: i64,
        exit_at: NaiveDateTime,
    ) -> Result<AttendanceRecord, LedgerError> {
        let exit_str = exit_at.format(TIMESTAMP_FMT).to_string();
        self.conn
            .call(move |conn| {
                // Conditional write: only an open record can be closed.
                let updated = conn.execute(
                    "UPDATE attendance SET exit_at = ?2 WHERE id = ?1 AND exit_at IS NULL",
                    params![record_id, exit_str],
                )?;
                if updated == 0 {
                    return Err(rusqlite::Error::QueryReturnedNoRows.into());
                }
                let record = conn.query_row(
                    "SELECT id, person_id, day, entry_at, exit_at, lateness_minutes, method
                     FROM attendance WHERE id = ?1",
                    params![record_id],
                    record_from_row,
                )?;
                Ok(record)
            })
            .await
            .map_err(|e| LedgerError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl ScheduleLookup for SqliteStore {
    async fn expected_start(
        &self,
        person_id: i64,
        day: NaiveDate,
    ) -> Result<Option<NaiveTime>, ScheduleError> {
        let weekday = day.weekday().num_days_from_monday();
        self.conn
            .call(move |conn| {
                let start: Option<String> = conn
                    .query_row(
                        "SELECT start_time FROM schedules WHERE person_id = ?1 AND weekday = ?2",
                        params![person_id, weekday],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(|err| match err {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                match start {
                    Some(s) => Ok(Some(parse_text_column(&s, 0, |s| {
                        NaiveTime::parse_from_str(s, TIME_FMT)
                    })?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(|e| ScheduleError::Unavailable(e.to_string()))
    }
}
