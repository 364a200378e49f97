//! Append-only attendance log.

use crate::db::{format_timestamp, now_rfc3339, StoreError};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, Utc};
use rollcall_core::{IdentityRef, SpoofCue};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tokio_rusqlite::Connection;
use uuid::Uuid;

/// Terminal outcome of one verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    NoMatch,
    Ambiguous,
    LivenessFailed,
    MultiFace,
    NoFace,
    LowQuality,
    EmbeddingFailed,
    DetectorFailed,
}

impl Outcome {
    pub const ALL: [Outcome; 9] = [
        Outcome::Accepted,
        Outcome::NoMatch,
        Outcome::Ambiguous,
        Outcome::LivenessFailed,
        Outcome::MultiFace,
        Outcome::NoFace,
        Outcome::LowQuality,
        Outcome::EmbeddingFailed,
        Outcome::DetectorFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Accepted => "accepted",
            Outcome::NoMatch => "no_match",
            Outcome::Ambiguous => "ambiguous",
            Outcome::LivenessFailed => "liveness_failed",
            Outcome::MultiFace => "multi_face",
            Outcome::NoFace => "no_face",
            Outcome::LowQuality => "low_quality",
            Outcome::EmbeddingFailed => "embedding_failed",
            Outcome::DetectorFailed => "detector_failed",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Outcome::ALL
            .into_iter()
            .find(|o| o.as_str() == s)
            .ok_or_else(|| format!("unknown outcome: {s}"))
    }
}

/// A record about to be written.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub request_id: Uuid,
    pub outcome: Outcome,
    pub identity: Option<IdentityRef>,
    pub similarity: Option<f32>,
    pub liveness_score: Option<f32>,
    pub liveness_reason: Option<SpoofCue>,
    pub latency_ms: f64,
}

/// A stored attendance record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub request_id: String,
    pub recorded_at: String,
    pub outcome: String,
    pub identity_id: Option<String>,
    pub identity_name: Option<String>,
    pub similarity: Option<f64>,
    pub liveness_score: Option<f64>,
    pub liveness_reason: Option<String>,
    pub latency_ms: f64,
}

/// Filter for log queries. Empty filter selects everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogQuery {
    pub outcome: Option<Outcome>,
    pub identity_id: Option<String>,
    /// Inclusive lower bound.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub to: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl LogQuery {
    fn where_clause(&self) -> (String, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut values = Vec::new();

        if let Some(outcome) = self.outcome {
            clauses.push("outcome = ?");
            values.push(Value::Text(outcome.as_str().to_string()));
        }
        if let Some(id) = &self.identity_id {
            clauses.push("identity_id = ?");
            values.push(Value::Text(id.clone()));
        }
        if let Some(from) = self.from {
            clauses.push("recorded_at >= ?");
            values.push(Value::Text(format_timestamp(from)));
        }
        if let Some(to) = self.to {
            clauses.push("recorded_at < ?");
            values.push(Value::Text(format_timestamp(to)));
        }

        if clauses.is_empty() {
            (String::new(), values)
        } else {
            (format!(" WHERE {}", clauses.join(" AND ")), values)
        }
    }
}

/// Time window for presence questions, with the same bounds as [`LogQuery`].
/// The default window is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Period {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::default()).and_utc()
}

impl Period {
    /// The UTC day containing `now`.
    pub fn day_of(now: DateTime<Utc>) -> Self {
        let start = midnight(now.date_naive());
        Self {
            from: Some(start),
            to: Some(start + Duration::days(1)),
        }
    }

    /// Seven UTC days ending with the day containing `now`.
    pub fn week_of(now: DateTime<Utc>) -> Self {
        let today = Self::day_of(now);
        Self {
            from: today.from.map(|from| from - Duration::days(6)),
            to: today.to,
        }
    }

    /// The UTC calendar month containing `now`.
    pub fn month_of(now: DateTime<Utc>) -> Self {
        let date = now.date_naive();
        let first = date - Duration::days(date.day0() as i64);
        Self {
            from: Some(midnight(first)),
            to: first.checked_add_months(Months::new(1)).map(midnight),
        }
    }

    /// Resolve `today`, `week`, `month` or `all` relative to `now`.
    pub fn named(name: &str, now: DateTime<Utc>) -> Option<Self> {
        match name {
            "today" => Some(Self::day_of(now)),
            "week" => Some(Self::week_of(now)),
            "month" => Some(Self::month_of(now)),
            "all" => Some(Self::default()),
            _ => None,
        }
    }

    /// Accepted records inside the window, optionally for one identity.
    fn accepted(&self, identity_id: Option<String>) -> LogQuery {
        LogQuery {
            outcome: Some(Outcome::Accepted),
            identity_id,
            from: self.from,
            to: self.to,
            ..Default::default()
        }
    }
}

/// Accepted check-ins of one identity on one UTC day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceDay {
    /// `YYYY-MM-DD`
    pub day: String,
    pub first_seen: String,
    pub last_seen: String,
    pub check_ins: u64,
}

/// Attendance of one identity within a period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityPresence {
    pub identity_id: String,
    pub present: bool,
    pub days_present: u64,
    pub check_ins: u64,
    /// Newest day first.
    pub days: Vec<PresenceDay>,
}

/// Distinct identities accepted on one UTC day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyPresence {
    pub day: String,
    pub present: u64,
}

/// Who was present within a period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceSummary {
    /// Distinct identities with at least one accepted check-in.
    pub present: u64,
    pub check_ins: u64,
    /// Newest day first.
    pub days: Vec<DailyPresence>,
}

/// Aggregate figures over a filtered slice of the log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogStats {
    pub total: u64,
    pub accepted: u64,
    pub rejected: u64,
    /// Percentage of attempts accepted, 0 when the log is empty.
    pub acceptance_rate: f64,
    pub mean_latency_ms: f64,
}

const COLUMNS: &str = "id, request_id, recorded_at, outcome, identity_id, identity_name, \
                       similarity, liveness_score, liveness_reason, latency_ms";

#[derive(Clone)]
pub struct AttendanceLog {
    conn: Connection,
}

impl AttendanceLog {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Append one record with a single insert. Returns the new row id.
    pub async fn record(&self, record: NewRecord) -> Result<i64, StoreError> {
        let recorded_at = now_rfc3339();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO attendance_log (request_id, recorded_at, outcome, identity_id,
                         identity_name, similarity, liveness_score, liveness_reason, latency_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        record.request_id.to_string(),
                        recorded_at,
                        record.outcome.as_str(),
                        record.identity.as_ref().map(|i| i.id.as_str()),
                        record.identity.as_ref().map(|i| i.display_name.as_str()),
                        record.similarity.map(f64::from),
                        record.liveness_score.map(f64::from),
                        record.liveness_reason.map(|r| r.as_str()),
                        record.latency_ms,
                    ],
                )?;
                Ok(c.last_insert_rowid())
            })
            .await
            .map_err(StoreError::Write)
    }

    /// Matching records, newest first.
    pub async fn query(&self, query: LogQuery) -> Result<Vec<AttendanceRecord>, StoreError> {
        let (filter, mut values) = query.where_clause();
        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
        values.push(Value::Integer(limit));
        values.push(Value::Integer(query.offset as i64));
        let sql = format!(
            "SELECT {COLUMNS} FROM attendance_log{filter} \
             ORDER BY recorded_at DESC, id DESC LIMIT ? OFFSET ?"
        );

        self.conn
            .call(move |c| {
                let mut stmt = c.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(values.iter()), |r| {
                        Ok(AttendanceRecord {
                            id: r.get(0)?,
                            request_id: r.get(1)?,
                            recorded_at: r.get(2)?,
                            outcome: r.get(3)?,
                            identity_id: r.get(4)?,
                            identity_name: r.get(5)?,
                            similarity: r.get(6)?,
                            liveness_score: r.get(7)?,
                            liveness_reason: r.get(8)?,
                            latency_ms: r.get(9)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(StoreError::Read)
    }

    /// Totals over the filtered log. Paging fields of the query are ignored.
    pub async fn stats(&self, query: LogQuery) -> Result<LogStats, StoreError> {
        let (filter, values) = query.where_clause();
        let sql = format!(
            "SELECT COUNT(*), SUM(outcome = 'accepted'), AVG(latency_ms) FROM attendance_log{filter}"
        );

        let (total, accepted, mean) = self
            .conn
            .call(move |c| {
                Ok(c.query_row(&sql, rusqlite::params_from_iter(values.iter()), |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, Option<i64>>(1)?,
                        r.get::<_, Option<f64>>(2)?,
                    ))
                })?)
            })
            .await
            .map_err(StoreError::Read)?;

        let total = total.max(0) as u64;
        let accepted = accepted.unwrap_or(0).max(0) as u64;
        Ok(LogStats {
            total,
            accepted,
            rejected: total - accepted,
            acceptance_rate: if total > 0 {
                accepted as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            mean_latency_ms: mean.unwrap_or(0.0),
        })
    }

    /// Days on which `identity_id` was accepted within `period`, newest first.
    ///
    /// Records carry fixed-width UTC timestamps, so the first ten characters
    /// are the UTC day.
    pub async fn presence(
        &self,
        identity_id: &str,
        period: Period,
    ) -> Result<IdentityPresence, StoreError> {
        let (filter, values) = period.accepted(Some(identity_id.to_string())).where_clause();
        let sql = format!(
            "SELECT substr(recorded_at, 1, 10) AS day, MIN(recorded_at), MAX(recorded_at), COUNT(*) \
             FROM attendance_log{filter} GROUP BY day ORDER BY day DESC"
        );

        let days = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(values.iter()), |r| {
                        Ok(PresenceDay {
                            day: r.get(0)?,
                            first_seen: r.get(1)?,
                            last_seen: r.get(2)?,
                            check_ins: r.get::<_, i64>(3)?.max(0) as u64,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(StoreError::Read)?;

        Ok(IdentityPresence {
            identity_id: identity_id.to_string(),
            present: !days.is_empty(),
            days_present: days.len() as u64,
            check_ins: days.iter().map(|d| d.check_ins).sum(),
            days,
        })
    }

    /// Distinct identities accepted within `period`, overall and per day.
    pub async fn summary(&self, period: Period) -> Result<PresenceSummary, StoreError> {
        let (filter, values) = period.accepted(None).where_clause();
        let totals_sql =
            format!("SELECT COUNT(DISTINCT identity_id), COUNT(*) FROM attendance_log{filter}");
        let daily_sql = format!(
            "SELECT substr(recorded_at, 1, 10) AS day, COUNT(DISTINCT identity_id) \
             FROM attendance_log{filter} GROUP BY day ORDER BY day DESC"
        );

        self.conn
            .call(move |c| {
                let (present, check_ins) =
                    c.query_row(&totals_sql, rusqlite::params_from_iter(values.iter()), |r| {
                        Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?))
                    })?;
                let mut stmt = c.prepare(&daily_sql)?;
                let days = stmt
                    .query_map(rusqlite::params_from_iter(values.iter()), |r| {
                        Ok(DailyPresence {
                            day: r.get(0)?,
                            present: r.get::<_, i64>(1)?.max(0) as u64,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(PresenceSummary {
                    present: present.max(0) as u64,
                    check_ins: check_ins.max(0) as u64,
                    days,
                })
            })
            .await
            .map_err(StoreError::Read)
    }

    /// Matching records as CSV with a header row.
    pub async fn export_csv(&self, query: LogQuery) -> Result<String, StoreError> {
        let records = self.query(query).await?;
        Ok(to_csv(&records))
    }
}

/// RFC 4180 CSV: CRLF line endings, fields quoted only when needed.
pub fn to_csv(records: &[AttendanceRecord]) -> String {
    let mut out = String::new();
    out.push_str(
        "id,request_id,recorded_at,outcome,identity_id,identity_name,\
         similarity,liveness_score,liveness_reason,latency_ms\r\n",
    );

    let opt_num = |v: Option<f64>| v.map(|x| format!("{x:.4}")).unwrap_or_default();
    for r in records {
        let fields = [
            r.id.to_string(),
            r.request_id.clone(),
            r.recorded_at.clone(),
            r.outcome.clone(),
            r.identity_id.clone().unwrap_or_default(),
            r.identity_name.clone().unwrap_or_default(),
            opt_num(r.similarity),
            opt_num(r.liveness_score),
            r.liveness_reason.clone().unwrap_or_default(),
            format!("{:.2}", r.latency_ms),
        ];
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{}", csv_field(field));
        }
        out.push_str("\r\n");
    }
    out
}

fn csv_field(field: &str) -> std::borrow::Cow<'_, str> {
    if field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\"")).into()
    } else {
        field.into()
    }
}
