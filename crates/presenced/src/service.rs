//! Capture-to-attendance pipeline behind the D-Bus surface.
//!
//! Holds the periodically refreshed template snapshot and wires the
//! matcher to the resolver. Capture stations send one template per
//! detected face; rejecting zero-face or multi-face captures happens
//! upstream, before the daemon is called.

use chrono::Local;
use presence_core::{
    AttendanceResolver, CaptureMethod, DirectoryError, EuclideanMatcher, MatchOutcome, Matcher,
    ResolveError, ResolveOutcome, Template, TemplateDirectory, TemplateSnapshot,
};
use presence_store::SqliteStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ServiceError {
    /// No enrolled template within threshold. The best distance seen is
    /// reported so stations can log near-misses and prompt a re-capture.
    #[error("no enrolled person matches the captured template")]
    NoIdentityMatch { best_distance: Option<f32> },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Successful registration, as rendered to capture stations.
#[derive(Debug, Serialize)]
pub struct CaptureOutcome {
    pub person_id: i64,
    pub name: String,
    /// Euclidean distance of the winning match.
    pub distance: f32,
    #[serde(flatten)]
    pub resolution: ResolveOutcome,
    /// One-line human-readable result for station displays.
    pub summary: String,
}

/// Snapshot and configuration info for the status surface.
#[derive(Debug, Serialize)]
pub struct StatusInfo {
    pub version: &'static str,
    pub enrolled: usize,
    pub snapshot_taken_at: String,
    pub match_threshold: f32,
}

pub struct AttendanceService {
    store: SqliteStore,
    snapshot: RwLock<Arc<TemplateSnapshot>>,
    matcher: EuclideanMatcher,
    resolver: AttendanceResolver<SqliteStore, SqliteStore>,
    match_threshold: f32,
}

impl AttendanceService {
    pub fn new(store: SqliteStore, match_threshold: f32, dependency_timeout: Duration) -> Self {
        let resolver = AttendanceResolver::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            dependency_timeout,
        );
        Self {
            store,
            snapshot: RwLock::new(Arc::new(TemplateSnapshot::empty())),
            matcher: EuclideanMatcher,
            resolver,
            match_threshold,
        }
    }

    /// Register one capture: match the template against the current
    /// snapshot, then open or close today's attendance record.
    pub async fn register_capture(
        &self,
        template: Template,
        method: CaptureMethod,
    ) -> Result<CaptureOutcome, ServiceError> {
        let event_id = Uuid::new_v4();
        let snapshot = self.snapshot.read().await.clone();
        tracing::debug!(%event_id, enrolled = snapshot.len(), %method, "capture received");

        let (person_id, name, distance) =
            match self
                .matcher
                .match_identity(&template, &snapshot, self.match_threshold)
            {
                MatchOutcome::Match {
                    person_id,
                    name,
                    distance,
                } => (person_id, name, distance),
                MatchOutcome::NoMatch { best_distance } => {
                    tracing::info!(%event_id, ?best_distance, "capture matched nobody");
                    return Err(ServiceError::NoIdentityMatch { best_distance });
                }
            };

        tracing::info!(%event_id, person_id, name = %name, distance, "identity matched");

        let now = Local::now().naive_local();
        let resolution = self.resolver.resolve(person_id, now, method).await?;
        let summary = render_summary(&name, &resolution);
        tracing::info!(%event_id, person_id, summary = %summary, "attendance registered");

        Ok(CaptureOutcome {
            person_id,
            name,
            distance,
            resolution,
            summary,
        })
    }

    /// Re-read the enrolled gallery and swap the snapshot in place.
    /// Returns the number of enrolled templates.
    pub async fn refresh_snapshot(&self) -> Result<usize, ServiceError> {
        let enrolled = self.store.list_enrolled().await?;
        let count = enrolled.len();
        let snapshot = Arc::new(TemplateSnapshot::new(enrolled));
        *self.snapshot.write().await = snapshot;
        tracing::debug!(enrolled = count, "template snapshot refreshed");
        Ok(count)
    }

    pub async fn status(&self) -> StatusInfo {
        let snapshot = self.snapshot.read().await.clone();
        StatusInfo {
            version: env!("CARGO_PKG_VERSION"),
            enrolled: snapshot.len(),
            snapshot_taken_at: snapshot.taken_at().to_rfc3339(),
            match_threshold: self.match_threshold,
        }
    }
}

/// Periodically refresh the template snapshot until the daemon exits.
pub fn spawn_refresher(
    service: Arc<AttendanceService>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The startup refresh already happened; skip the immediate tick.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(err) = service.refresh_snapshot().await {
                tracing::warn!(error = %err, "snapshot refresh failed; keeping previous snapshot");
            }
        }
    })
}

fn render_summary(name: &str, resolution: &ResolveOutcome) -> String {
    match resolution {
        ResolveOutcome::Opened { record } => {
            let time = record.entry_at.format("%H:%M");
            if record.lateness_minutes > 0 {
                format!("{name} clocked in at {time} ({} min late)", record.lateness_minutes)
            } else {
                format!("{name} clocked in at {time} (on time)")
            }
        }
        ResolveOutcome::Closed { record } => match record.exit_at {
            Some(exit) => format!("{name} clocked out at {}", exit.format("%H:%M")),
            None => format!("{name} clocked out"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::TEMPLATE_DIM;

    fn template(fill: f32) -> Template {
        Template::new(vec![fill; TEMPLATE_DIM]).unwrap()
    }

    async fn service_with_enrollment() -> AttendanceService {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.upsert_person(7, "Maria Gomez".into()).await.unwrap();
        store.enroll_template(7, &template(0.25)).await.unwrap();

        let service = AttendanceService::new(
            store,
            presence_core::DEFAULT_MATCH_THRESHOLD,
            Duration::from_secs(1),
        );
        service.refresh_snapshot().await.unwrap();
        service
    }

    #[tokio::test]
    async fn test_capture_opens_then_closes_then_rejects() {
        let service = service_with_enrollment().await;

        let opened = service
            .register_capture(template(0.25), CaptureMethod::Face)
            .await
            .unwrap();
        assert_eq!(opened.person_id, 7);
        assert_eq!(opened.distance, 0.0);
        assert!(matches!(opened.resolution, ResolveOutcome::Opened { .. }));
        assert!(opened.summary.contains("clocked in"));

        let closed = service
            .register_capture(template(0.25), CaptureMethod::Face)
            .await
            .unwrap();
        assert!(matches!(closed.resolution, ResolveOutcome::Closed { .. }));
        assert!(closed.summary.contains("clocked out"));

        let err = service
            .register_capture(template(0.25), CaptureMethod::Face)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Resolve(ResolveError::AlreadyClosedToday { person_id: 7, .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_face_is_no_match() {
        let service = service_with_enrollment().await;

        let err = service
            .register_capture(template(5.0), CaptureMethod::Face)
            .await
            .unwrap_err();
        match err {
            ServiceError::NoIdentityMatch { best_distance } => {
                assert!(best_distance.unwrap() > presence_core::DEFAULT_MATCH_THRESHOLD);
            }
            other => panic!("expected NoIdentityMatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_picks_up_new_enrollment() {
        let service = service_with_enrollment().await;
        assert_eq!(service.status().await.enrolled, 1);

        service.store.upsert_person(8, "Luis Peña".into()).await.unwrap();
        service.store.enroll_template(8, &template(3.0)).await.unwrap();

        // Not visible until a refresh.
        let err = service
            .register_capture(template(3.0), CaptureMethod::Face)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NoIdentityMatch { .. }));

        assert_eq!(service.refresh_snapshot().await.unwrap(), 2);
        let outcome = service
            .register_capture(template(3.0), CaptureMethod::Face)
            .await
            .unwrap();
        assert_eq!(outcome.person_id, 8);
    }
}
