//! Core domain model for load-forecast ingestion runs.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lfc-core";

/// Short-lived subscription credential scoped to a single invocation.
///
/// The value is never rendered through `Debug`; callers that need the raw
/// header value go through [`Credential::expose`].
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// One `(target time, value)` sample of a forecast run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub target_ts: DateTime<Utc>,
    pub mw: f64,
}

/// Feed-specific trimming and quality thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    pub horizon: TimeDelta,
    pub lookback: Option<TimeDelta>,
    pub min_points: usize,
}

impl WindowPolicy {
    /// Exclusive upper bound on target times, saturating at the latest
    /// representable instant.
    pub fn window_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.horizon)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Inclusive lower bound on target times, when a lookback is configured.
    pub fn window_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.lookback.map(|lookback| {
            now.checked_sub_signed(lookback)
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        })
    }

    pub fn contains(&self, now: DateTime<Utc>, target_ts: DateTime<Utc>) -> bool {
        if target_ts >= self.window_end(now) {
            return false;
        }
        match self.window_start(now) {
            Some(start) => target_ts >= start,
            None => true,
        }
    }
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self {
            horizon: TimeDelta::hours(48),
            lookback: None,
            min_points: 1,
        }
    }
}

/// Creation-time threshold below which runs are expired.
pub fn retention_cutoff(now: DateTime<Utc>, retention: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(retention)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Run metadata handed to the store; `created_at` is assigned on insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRun {
    pub feed: String,
    pub area: String,
    pub run_ts: DateTime<Utc>,
    pub payload_hash: String,
}

/// Persisted run metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub feed: String,
    pub area: String,
    pub run_ts: DateTime<Utc>,
    pub payload_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A stored run with its ordered points, as served to chart consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSeries {
    pub run_ts: DateTime<Utc>,
    pub points: Vec<ForecastPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    Ok,
    Skipped,
    Error,
}

/// Per-feed outcome of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedReport {
    pub feed: String,
    pub area: String,
    pub status: FeedStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_ts: Option<DateTime<Utc>>,
    pub points: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_target_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_target_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl FeedReport {
    pub fn ok(run: &NewRun, points: &[ForecastPoint]) -> Self {
        Self {
            feed: run.feed.clone(),
            area: run.area.clone(),
            status: FeedStatus::Ok,
            run_ts: Some(run.run_ts),
            points: points.len(),
            first_target_ts: points.first().map(|p| p.target_ts),
            last_target_ts: points.last().map(|p| p.target_ts),
            payload_hash: Some(run.payload_hash.clone()),
            reason: None,
        }
    }

    pub fn skipped(
        feed: &str,
        area: &str,
        points: usize,
        payload_hash: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            feed: feed.to_string(),
            area: area.to_string(),
            status: FeedStatus::Skipped,
            run_ts: None,
            points,
            first_target_ts: None,
            last_target_ts: None,
            payload_hash: Some(payload_hash.to_string()),
            reason: Some(reason.into()),
        }
    }

    pub fn error(feed: &str, area: &str, cause: impl Into<String>) -> Self {
        Self {
            feed: feed.to_string(),
            area: area.to_string(),
            status: FeedStatus::Error,
            run_ts: None,
            points: 0,
            first_target_ts: None,
            last_target_ts: None,
            payload_hash: None,
            reason: Some(cause.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Ok,
    CredentialFailed,
}

/// Structured result of one ingestion invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub invocation_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: OverallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub feeds: Vec<FeedReport>,
}

impl IngestReport {
    pub fn is_success(&self) -> bool {
        self.status == OverallStatus::Ok
    }

    pub fn feed(&self, feed: &str) -> Option<&FeedReport> {
        self.feeds.iter().find(|r| r.feed == feed)
    }
}
