use crate::service::{AttendanceService, ServiceError};
use presence_core::{CaptureMethod, ResolveError, Template};
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.presence.Attendance1";
pub const OBJECT_PATH: &str = "/org/presence/Attendance1";

/// D-Bus interface for the Presence attendance daemon.
///
/// Bus name: org.presence.Attendance1
/// Object path: /org/presence/Attendance1
///
/// Replies are JSON strings with a discriminating `result` tag, so
/// stations pattern-match on the kind instead of probing for fields.
pub struct AttendanceInterface {
    service: Arc<AttendanceService>,
}

impl AttendanceInterface {
    pub fn new(service: Arc<AttendanceService>) -> Self {
        Self { service }
    }
}

#[interface(name = "org.presence.Attendance1")]
impl AttendanceInterface {
    /// Register one facial capture. `template_json` is a JSON float array
    /// of the system dimensionality; `method` is face|card|manual.
    async fn register_capture(
        &self,
        template_json: &str,
        method: &str,
    ) -> zbus::fdo::Result<String> {
        let template: Template = serde_json::from_str(template_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad template: {e}")))?;
        let method: CaptureMethod = method
            .parse()
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("{e}")))?;

        let reply = match self.service.register_capture(template, method).await {
            Ok(outcome) => serde_json::json!({
                "result": "registered",
                "capture": outcome,
            }),
            Err(ServiceError::NoIdentityMatch { best_distance }) => serde_json::json!({
                "result": "no_match",
                "best_distance": best_distance,
            }),
            Err(ServiceError::Resolve(ResolveError::AlreadyClosedToday { person_id, day })) => {
                serde_json::json!({
                    "result": "already_closed",
                    "person_id": person_id,
                    "day": day.to_string(),
                })
            }
            // Transient dependency failures: a real error, retried by the caller.
            Err(err) => return Err(zbus::fdo::Error::Failed(err.to_string())),
        };
        Ok(reply.to_string())
    }

    /// Re-read the enrolled gallery now instead of waiting for the next
    /// periodic refresh. Returns the number of enrolled templates.
    async fn reload_templates(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("template reload requested");
        let count = self
            .service
            .refresh_snapshot()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        Ok(count as u32)
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.service.status().await;
        Ok(serde_json::json!(status).to_string())
    }
}
