//! Attendance resolution — the clock-in/clock-out state machine.
//!
//! Per (person, calendar day) the states are `NoRecordToday` → `Open` →
//! `Closed`. The first match of the day opens a record and computes
//! lateness against the expected start time; the second closes it; any
//! further match the same day is rejected.

use crate::types::{AttendanceRecord, CaptureMethod, EnrolledTemplate};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("template directory unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("attendance ledger unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("schedule lookup unavailable: {0}")]
    Unavailable(String),
}

/// Read side of the template store: the full enrolled gallery.
#[async_trait]
pub trait TemplateDirectory: Send + Sync {
    async fn list_enrolled(&self) -> Result<Vec<EnrolledTemplate>, DirectoryError>;
}

/// Persistence boundary for attendance records.
///
/// `find_for_day` returns the day's record whether open or closed — with
/// at most one record per (person, day) that single read answers both
/// "is there an open record?" and "was today already completed?".
#[async_trait]
pub trait AttendanceLedger: Send + Sync {
    async fn find_for_day(
        &self,
        person_id: i64,
        day: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, LedgerError>;

    async fn create_entry(
        &self,
        person_id: i64,
        day: NaiveDate,
        entry_at: NaiveDateTime,
        lateness_minutes: i64,
        method: CaptureMethod,
    ) -> Result<AttendanceRecord, LedgerError>;

    async fn close_record(
        &self,
        record_id: i64,
        exit_at: NaiveDateTime,
    ) -> Result<AttendanceRecord, LedgerError>;
}

/// Expected daily start time per person, from the work schedule.
#[async_trait]
pub trait ScheduleLookup: Send + Sync {
    async fn expected_start(
        &self,
        person_id: i64,
        day: NaiveDate,
    ) -> Result<Option<NaiveTime>, ScheduleError>;
}

/// Which transition a successful resolution performed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum ResolveOutcome {
    /// First match of the day: a new record was opened.
    Opened { record: AttendanceRecord },
    /// Second match of the day: the open record was closed.
    Closed { record: AttendanceRecord },
}

impl ResolveOutcome {
    pub fn record(&self) -> &AttendanceRecord {
        match self {
            ResolveOutcome::Opened { record } | ResolveOutcome::Closed { record } => record,
        }
    }
}

#[derive(Error, Debug)]
pub enum ResolveError {
    /// Third match of the day — the record is already closed and a person
    /// cannot punch again until the next calendar day.
    #[error("attendance for person {person_id} already closed on {day}")]
    AlreadyClosedToday { person_id: i64, day: NaiveDate },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Resolves matched identities into attendance transitions.
///
/// The find-then-write sequence for one person runs under a per-person
/// async mutex, so near-simultaneous matches from different capture
/// stations can never both open (or both close) a record. Resolutions
/// for different persons share nothing and proceed in parallel.
pub struct AttendanceResolver<L, S> {
    ledger: Arc<L>,
    schedule: Arc<S>,
    dependency_timeout: Duration,
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl<L: AttendanceLedger, S: ScheduleLookup> AttendanceResolver<L, S> {
    pub fn new(ledger: Arc<L>, schedule: Arc<S>, dependency_timeout: Duration) -> Self {
        Self {
            ledger,
            schedule,
            dependency_timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve one match for `person_id` at `now` (local time).
    ///
    /// "Today" is the calendar date of `now`. A record left open the
    /// previous evening is not closed by a post-midnight match — the new
    /// day starts fresh with its own entry record.
    pub async fn resolve(
        &self,
        person_id: i64,
        now: NaiveDateTime,
        method: CaptureMethod,
    ) -> Result<ResolveOutcome, ResolveError> {
        let day = now.date();
        let lock = self.person_lock(person_id);
        let _guard = lock.lock().await;

        let existing = self
            .ledger_call("find_for_day", self.ledger.find_for_day(person_id, day))
            .await?;

        match existing {
            None => {
                let lateness_minutes = self.lateness_for(person_id, day, now).await;
                let record = self
                    .ledger_call(
                        "create_entry",
                        self.ledger
                            .create_entry(person_id, day, now, lateness_minutes, method),
                    )
                    .await?;
                tracing::info!(person_id, %day, lateness_minutes, %method, "attendance opened");
                Ok(ResolveOutcome::Opened { record })
            }
            Some(open) if open.is_open() => {
                let record = self
                    .ledger_call("close_record", self.ledger.close_record(open.id, now))
                    .await?;
                tracing::info!(person_id, %day, record_id = record.id, "attendance closed");
                Ok(ResolveOutcome::Closed { record })
            }
            Some(_closed) => {
                tracing::debug!(person_id, %day, "match after record already closed");
                Err(ResolveError::AlreadyClosedToday { person_id, day })
            }
        }
    }

    /// Lateness in whole minutes, floored at zero. A missing schedule and
    /// a failed or timed-out lookup all default to zero: the punch itself
    /// must never be blocked by the lateness computation.
    async fn lateness_for(&self, person_id: i64, day: NaiveDate, now: NaiveDateTime) -> i64 {
        let lookup = tokio::time::timeout(
            self.dependency_timeout,
            self.schedule.expected_start(person_id, day),
        )
        .await;

        match lookup {
            Ok(Ok(Some(start))) => (now - day.and_time(start)).num_minutes().max(0),
            Ok(Ok(None)) => 0,
            Ok(Err(err)) => {
                tracing::warn!(person_id, %day, error = %err, "schedule lookup failed, lateness defaults to 0");
                0
            }
            Err(_) => {
                tracing::warn!(person_id, %day, timeout = ?self.dependency_timeout, "schedule lookup timed out, lateness defaults to 0");
                0
            }
        }
    }

    /// Run a ledger call under the dependency timeout; expiry surfaces as
    /// an `Unavailable` error for the caller to retry.
    async fn ledger_call<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, LedgerError>>,
    ) -> Result<T, LedgerError> {
        match tokio::time::timeout(self.dependency_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Unavailable(format!(
                "{op} timed out after {:?}",
                self.dependency_timeout
            ))),
        }
    }

    fn person_lock(&self, person_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(person_id).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeLedger {
        records: Mutex<Vec<AttendanceRecord>>,
        next_id: AtomicI64,
        creates: AtomicUsize,
        closes: AtomicUsize,
    }

    impl FakeLedger {
        fn records(&self) -> Vec<AttendanceRecord> {
            self.records.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AttendanceLedger for FakeLedger {
        async fn find_for_day(
            &self,
            person_id: i64,
            day: NaiveDate,
        ) -> Result<Option<AttendanceRecord>, LedgerError> {
            // Yield so concurrent resolutions interleave without the lock.
            tokio::task::yield_now().await;
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.person_id == person_id && r.day == day)
                .cloned())
        }

        async fn create_entry(
            &self,
            person_id: i64,
            day: NaiveDate,
            entry_at: NaiveDateTime,
            lateness_minutes: i64,
            method: CaptureMethod,
        ) -> Result<AttendanceRecord, LedgerError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            let record = AttendanceRecord {
                id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
                person_id,
                day,
                entry_at,
                exit_at: None,
                lateness_minutes,
                method,
            };
            self.records.lock().unwrap().push(record.clone());
            Ok(record)
        }

        async fn close_record(
            &self,
            record_id: i64,
            exit_at: NaiveDateTime,
        ) -> Result<AttendanceRecord, LedgerError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            let mut records = self.records.lock().unwrap();
            let record = records
                .iter_mut()
                .find(|r| r.id == record_id)
                .ok_or_else(|| LedgerError::Unavailable(format!("record {record_id} not found")))?;
            record.exit_at = Some(exit_at);
            Ok(record.clone())
        }
    }

    struct FakeSchedule {
        start: Option<NaiveTime>,
        fail: bool,
    }

    impl FakeSchedule {
        fn at(hour: u32, minute: u32) -> Self {
            Self {
                start: NaiveTime::from_hms_opt(hour, minute, 0),
                fail: false,
            }
        }

        fn unknown() -> Self {
            Self { start: None, fail: false }
        }

        fn failing() -> Self {
            Self { start: None, fail: true }
        }
    }

    #[async_trait]
    impl ScheduleLookup for FakeSchedule {
        async fn expected_start(
            &self,
            _person_id: i64,
            _day: NaiveDate,
        ) -> Result<Option<NaiveTime>, ScheduleError> {
            if self.fail {
                return Err(ScheduleError::Unavailable("schedule service down".into()));
            }
            Ok(self.start)
        }
    }

    fn resolver(
        ledger: Arc<FakeLedger>,
        schedule: FakeSchedule,
    ) -> AttendanceResolver<FakeLedger, FakeSchedule> {
        AttendanceResolver::new(ledger, Arc::new(schedule), Duration::from_secs(1))
    }

    fn at(day: (i32, u32, u32), hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(day.0, day.1, day.2)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    const DAY: (i32, u32, u32) = (2025, 3, 10);

    #[tokio::test]
    async fn test_first_match_opens_with_lateness() {
        let ledger = Arc::new(FakeLedger::default());
        let resolver = resolver(ledger.clone(), FakeSchedule::at(8, 0));

        let outcome = resolver
            .resolve(7, at(DAY, 8, 15), CaptureMethod::Face)
            .await
            .unwrap();

        match outcome {
            ResolveOutcome::Opened { record } => {
                assert_eq!(record.lateness_minutes, 15);
                assert!(record.is_open());
                assert_eq!(record.entry_at, at(DAY, 8, 15));
            }
            other => panic!("expected Opened, got {other:?}"),
        }
        assert_eq!(ledger.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_early_arrival_has_zero_lateness() {
        let ledger = Arc::new(FakeLedger::default());
        let resolver = resolver(ledger, FakeSchedule::at(8, 0));

        let outcome = resolver
            .resolve(7, at(DAY, 7, 42), CaptureMethod::Face)
            .await
            .unwrap();
        assert_eq!(outcome.record().lateness_minutes, 0);
    }

    #[tokio::test]
    async fn test_unknown_schedule_defaults_lateness_to_zero() {
        let ledger = Arc::new(FakeLedger::default());
        let resolver = resolver(ledger, FakeSchedule::unknown());

        let outcome = resolver
            .resolve(7, at(DAY, 9, 0), CaptureMethod::Face)
            .await
            .unwrap();
        assert_eq!(outcome.record().lateness_minutes, 0);
    }

    #[tokio::test]
    async fn test_schedule_failure_still_opens_with_zero_lateness() {
        let ledger = Arc::new(FakeLedger::default());
        let resolver = resolver(ledger.clone(), FakeSchedule::failing());

        let outcome = resolver
            .resolve(7, at(DAY, 9, 0), CaptureMethod::Face)
            .await
            .unwrap();
        assert!(matches!(outcome, ResolveOutcome::Opened { .. }));
        assert_eq!(outcome.record().lateness_minutes, 0);
        assert_eq!(ledger.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_match_closes_same_record_lateness_unchanged() {
        let ledger = Arc::new(FakeLedger::default());
        let resolver = resolver(ledger.clone(), FakeSchedule::at(8, 0));

        let opened = resolver
            .resolve(7, at(DAY, 8, 15), CaptureMethod::Face)
            .await
            .unwrap();
        let opened_id = opened.record().id;

        let closed = resolver
            .resolve(7, at(DAY, 17, 0), CaptureMethod::Face)
            .await
            .unwrap();

        match closed {
            ResolveOutcome::Closed { record } => {
                assert_eq!(record.id, opened_id);
                assert_eq!(record.exit_at, Some(at(DAY, 17, 0)));
                assert_eq!(record.lateness_minutes, 15);
            }
            other => panic!("expected Closed, got {other:?}"),
        }
        assert_eq!(ledger.creates.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_third_match_rejected_without_write() {
        let ledger = Arc::new(FakeLedger::default());
        let resolver = resolver(ledger.clone(), FakeSchedule::at(8, 0));

        resolver.resolve(7, at(DAY, 8, 0), CaptureMethod::Face).await.unwrap();
        resolver.resolve(7, at(DAY, 17, 0), CaptureMethod::Face).await.unwrap();

        let err = resolver
            .resolve(7, at(DAY, 18, 30), CaptureMethod::Face)
            .await
            .unwrap_err();

        match err {
            ResolveError::AlreadyClosedToday { person_id, day } => {
                assert_eq!(person_id, 7);
                assert_eq!(day, NaiveDate::from_ymd_opt(2025, 3, 10).unwrap());
            }
            other => panic!("expected AlreadyClosedToday, got {other:?}"),
        }
        assert_eq!(ledger.creates.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_post_midnight_match_opens_new_day() {
        let ledger = Arc::new(FakeLedger::default());
        let resolver = resolver(ledger.clone(), FakeSchedule::at(8, 0));

        // Open at 23:59, never closed that day.
        let opened = resolver
            .resolve(7, at(DAY, 23, 59), CaptureMethod::Face)
            .await
            .unwrap();
        let first_id = opened.record().id;

        // 00:01 the next day is a fresh NoRecordToday, not a close.
        let next = resolver
            .resolve(7, at((2025, 3, 11), 0, 1), CaptureMethod::Face)
            .await
            .unwrap();

        match next {
            ResolveOutcome::Opened { record } => {
                assert_ne!(record.id, first_id);
                assert_eq!(record.day, NaiveDate::from_ymd_opt(2025, 3, 11).unwrap());
            }
            other => panic!("expected Opened on the new day, got {other:?}"),
        }

        // The previous day's record is still open, untouched.
        let records = ledger.records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.is_open()));
    }

    #[tokio::test]
    async fn test_ledger_timeout_reported_as_unavailable() {
        struct SlowLedger;

        #[async_trait]
        impl AttendanceLedger for SlowLedger {
            async fn find_for_day(
                &self,
                _person_id: i64,
                _day: NaiveDate,
            ) -> Result<Option<AttendanceRecord>, LedgerError> {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(None)
            }

            async fn create_entry(
                &self,
                _person_id: i64,
                _day: NaiveDate,
                _entry_at: NaiveDateTime,
                _lateness_minutes: i64,
                _method: CaptureMethod,
            ) -> Result<AttendanceRecord, LedgerError> {
                unreachable!("find_for_day never completes in time")
            }

            async fn close_record(
                &self,
                _record_id: i64,
                _exit_at: NaiveDateTime,
            ) -> Result<AttendanceRecord, LedgerError> {
                unreachable!()
            }
        }

        let resolver = AttendanceResolver::new(
            Arc::new(SlowLedger),
            Arc::new(FakeSchedule::at(8, 0)),
            Duration::from_millis(20),
        );

        let err = resolver
            .resolve(7, at(DAY, 8, 0), CaptureMethod::Face)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Ledger(LedgerError::Unavailable(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_person_creates_exactly_one_record() {
        const N: usize = 8;
        let ledger = Arc::new(FakeLedger::default());
        let resolver = Arc::new(resolver(ledger.clone(), FakeSchedule::at(8, 0)));

        let mut handles = Vec::new();
        for _ in 0..N {
            let resolver = resolver.clone();
            handles.push(tokio::spawn(async move {
                resolver.resolve(7, at(DAY, 8, 15), CaptureMethod::Face).await
            }));
        }

        let mut opened = 0;
        let mut closed = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(ResolveOutcome::Opened { .. }) => opened += 1,
                Ok(ResolveOutcome::Closed { .. }) => closed += 1,
                Err(ResolveError::AlreadyClosedToday { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        // Serialized per person: one open, one close, the rest rejected.
        assert_eq!(opened, 1);
        assert_eq!(closed, 1);
        assert_eq!(rejected, N - 2);
        assert_eq!(ledger.records().len(), 1);
        assert_eq!(ledger.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_different_persons_resolve_independently() {
        let ledger = Arc::new(FakeLedger::default());
        let resolver = Arc::new(resolver(ledger.clone(), FakeSchedule::at(8, 0)));

        let mut handles = Vec::new();
        for person_id in 1..=5 {
            let resolver = resolver.clone();
            handles.push(tokio::spawn(async move {
                resolver.resolve(person_id, at(DAY, 8, 0), CaptureMethod::Face).await
            }));
        }

        for handle in handles {
            assert!(matches!(handle.await.unwrap(), Ok(ResolveOutcome::Opened { .. })));
        }
        assert_eq!(ledger.records().len(), 5);
    }
}
