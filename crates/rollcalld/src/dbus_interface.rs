use crate::attendance::{LogQuery, Period};
use crate::service::{AttendanceService, ServiceError};
use std::sync::Arc;
use std::time::Duration;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Frames travel as encoded image bytes (PNG, JPEG, ...). Structured replies
/// are JSON strings.
pub struct AttendanceBus {
    service: Arc<AttendanceService>,
    timeout: Duration,
}

impl AttendanceBus {
    pub fn new(service: Arc<AttendanceService>, timeout: Duration) -> Self {
        Self { service, timeout }
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

/// Parse a JSON log filter. An empty string selects every record.
fn parse_query(filter: &str) -> zbus::fdo::Result<LogQuery> {
    if filter.trim().is_empty() {
        return Ok(LogQuery::default());
    }
    serde_json::from_str(filter)
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad log filter: {e}")))
}

/// Parse a presence window: `today`, `week`, `month`, `all`, or a JSON
/// `{"from": ..., "to": ...}` object. An empty string means all time.
fn parse_period(period: &str) -> zbus::fdo::Result<Period> {
    let period = period.trim();
    if period.is_empty() {
        return Ok(Period::default());
    }
    if let Some(named) = Period::named(period, chrono::Utc::now()) {
        return Ok(named);
    }
    serde_json::from_str(period)
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad period {period:?}: {e}")))
}

/// Map a service failure to a D-Bus error.
fn service_error(e: ServiceError) -> zbus::fdo::Error {
    match e {
        ServiceError::BatchTooLarge { .. } => zbus::fdo::Error::InvalidArgs(e.to_string()),
        e => failed(e),
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceBus {
    /// Enroll (or re-enroll) an identity from one captured image.
    async fn register(&self, id: &str, display_name: &str, frame: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(id, display_name, bytes = frame.len(), "register requested");
        if id.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("identity id is empty".into()));
        }
        let registration = self
            .service
            .register(id, display_name, &frame)
            .await
            .map_err(|e| {
                tracing::warn!(id, error = %e, "registration failed");
                failed(e)
            })?;
        to_json(&registration)
    }

    /// Append an enrollment sample to an existing identity.
    async fn add_sample(&self, id: &str, frame: Vec<u8>) -> zbus::fdo::Result<u32> {
        tracing::info!(id, bytes = frame.len(), "add_sample requested");
        let samples = self.service.add_sample(id, &frame).await.map_err(failed)?;
        Ok(samples as u32)
    }

    /// Verify one captured image; the attempt is always logged.
    async fn verify(&self, frame: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::debug!(bytes = frame.len(), "verify requested");
        let pending = self.service.clone().verify_detached(frame);
        let verification = match tokio::time::timeout(self.timeout, pending).await {
            Ok(result) => result.map_err(|e: ServiceError| {
                tracing::error!(error = %e, "verification failed");
                failed(e)
            })?,
            Err(_) => {
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "verification timed out");
                return Err(failed("verification timed out"));
            }
        };
        to_json(&verification)
    }

    async fn list_identities(&self, include_synthetic: bool) -> zbus::fdo::Result<String> {
        to_json(&self.service.list(include_synthetic).await.map_err(failed)?)
    }

    /// One identity with its stored embeddings, or an empty string if unknown.
    async fn get_identity(&self, id: &str) -> zbus::fdo::Result<String> {
        match self.service.get(id).await.map_err(failed)? {
            Some(identity) => to_json(&identity),
            None => Ok(String::new()),
        }
    }

    async fn remove_identity(&self, id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(id, "remove_identity requested");
        self.service.remove(id).await.map_err(failed)
    }

    /// Filtered, paginated log records, newest first.
    async fn query_logs(&self, filter: &str) -> zbus::fdo::Result<String> {
        let query = parse_query(filter)?;
        to_json(&self.service.logs(query).await.map_err(failed)?)
    }

    /// Filtered log records as CSV.
    async fn export_logs(&self, filter: &str) -> zbus::fdo::Result<String> {
        let query = parse_query(filter)?;
        self.service.export(query).await.map_err(failed)
    }

    async fn log_stats(&self, filter: &str) -> zbus::fdo::Result<String> {
        let query = parse_query(filter)?;
        to_json(&self.service.stats(query).await.map_err(failed)?)
    }

    /// Days on which one identity was accepted within a period.
    async fn presence(&self, id: &str, period: &str) -> zbus::fdo::Result<String> {
        let period = parse_period(period)?;
        to_json(&self.service.presence(id, period).await.map_err(failed)?)
    }

    /// Distinct identities accepted within a period, overall and per day.
    async fn presence_summary(&self, period: &str) -> zbus::fdo::Result<String> {
        let period = parse_period(period)?;
        to_json(&self.service.summary(period).await.map_err(failed)?)
    }

    /// Bulk-generate synthetic identities for scale testing.
    async fn generate_synthetic(&self, count: u32) -> zbus::fdo::Result<u32> {
        tracing::info!(count, "generate_synthetic requested");
        let generated = self
            .service
            .generate_synthetic(count as usize)
            .await
            .map_err(|e| {
                tracing::warn!(count, error = %e, "generate_synthetic refused");
                service_error(e)
            })?;
        Ok(generated as u32)
    }

    /// Remove every synthetic identity.
    async fn clear_synthetic(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("clear_synthetic requested");
        let removed = self.service.clear_synthetic().await.map_err(failed)?;
        Ok(removed as u32)
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.service.status())
    }
}
