//! Provider-facing adapters: credential capture, column resolution and
//! normalization of tabular forecast payloads.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::EventRequestWillBeSent;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use futures::{Stream, StreamExt};
use lfc_core::{Credential, ForecastPoint, WindowPolicy};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

pub const CRATE_NAME: &str = "lfc-adapters";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential observed within {waited:?}")]
    Timeout { waited: Duration },
    #[error("browser session ended without a request carrying {header}")]
    NotFound { header: String },
    #[error("browser session failed: {0}")]
    Browser(String),
}

/// Yields the subscription credential for one invocation.
#[async_trait]
pub trait CredentialAcquirer: Send + Sync {
    async fn acquire(&self) -> Result<Credential, CredentialError>;
}

/// Operator-supplied credential; no browser involved.
#[derive(Debug, Clone)]
pub struct StaticCredentialAcquirer {
    credential: Credential,
    header: String,
}

impl StaticCredentialAcquirer {
    pub fn new(credential: Credential, header: impl Into<String>) -> Self {
        Self {
            credential,
            header: header.into(),
        }
    }
}

#[async_trait]
impl CredentialAcquirer for StaticCredentialAcquirer {
    async fn acquire(&self) -> Result<Credential, CredentialError> {
        if self.credential.is_empty() {
            return Err(CredentialError::NotFound {
                header: self.header.clone(),
            });
        }
        Ok(self.credential.clone())
    }
}

/// Watches outgoing requests and keeps the first non-empty value of one
/// header sent to the API host.
#[derive(Debug)]
pub struct HeaderCapture {
    api_host: String,
    header_name: String,
    value: OnceLock<String>,
}

impl HeaderCapture {
    pub fn new(api_host: impl Into<String>, header_name: impl Into<String>) -> Self {
        Self {
            api_host: api_host.into().to_ascii_lowercase(),
            header_name: header_name.into(),
            value: OnceLock::new(),
        }
    }

    /// Returns true once a credential has been captured.
    pub fn observe(&self, url: &str, headers: &JsonValue) -> bool {
        if self.value.get().is_some() {
            return true;
        }
        if !self.targets_api_host(url) {
            return false;
        }
        let found = headers
            .as_object()
            .and_then(|map| {
                map.iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(&self.header_name))
            })
            .and_then(|(_, value)| value.as_str())
            .map(str::trim)
            .filter(|value| !value.is_empty());

        match found {
            Some(value) => {
                let _ = self.value.set(value.to_string());
                true
            }
            None => false,
        }
    }

    pub fn captured(&self) -> Option<Credential> {
        self.value.get().map(|v| Credential::new(v.clone()))
    }

    fn targets_api_host(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        host == self.api_host || host.ends_with(&format!(".{}", self.api_host))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTiming {
    pub settle_delay: Duration,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for CaptureTiming {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(3),
            timeout: Duration::from_secs(20),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Polls `capture` until it holds a value, the observer stops, or the
/// deadline (settle delay + timeout) passes.
pub async fn wait_for_capture(
    capture: &HeaderCapture,
    observer: &JoinHandle<()>,
    timing: CaptureTiming,
) -> Result<Credential, CredentialError> {
    tokio::time::sleep(timing.settle_delay).await;
    let deadline = Instant::now() + timing.timeout;
    let poll = timing.poll_interval.max(Duration::from_millis(10));

    loop {
        if let Some(credential) = capture.captured() {
            return Ok(credential);
        }
        if observer.is_finished() {
            return capture.captured().ok_or_else(|| CredentialError::NotFound {
                header: capture.header_name.clone(),
            });
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(CredentialError::Timeout {
                waited: timing.settle_delay + timing.timeout,
            });
        }
        tokio::time::sleep(poll.min(deadline - now)).await;
    }
}

#[derive(Debug, Clone)]
pub struct BrowserCredentialConfig {
    pub portal_url: String,
    pub api_host: String,
    pub header_name: String,
    pub timing: CaptureTiming,
    pub navigation_timeout: Duration,
    pub chrome_executable: Option<PathBuf>,
}

const BROWSER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Loads the provider portal in a throwaway headless Chromium and captures
/// the credential the portal attaches to its own API calls.
///
/// The request listener is attached to the portal page only, so a key sent
/// exclusively from an out-of-process iframe or a worker is never seen.
/// Teardown is bounded: if the browser does not close and exit within
/// `BROWSER_SHUTDOWN_TIMEOUT` per step, the process is killed.
#[derive(Debug, Clone)]
pub struct ChromiumCredentialAcquirer {
    config: BrowserCredentialConfig,
}

impl ChromiumCredentialAcquirer {
    pub fn new(config: BrowserCredentialConfig) -> Self {
        Self { config }
    }

    async fn capture_from(&self, browser: &Browser) -> Result<Credential, CredentialError> {
        let page = browser.new_page("about:blank").await.map_err(browser_error)?;
        let requests = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(browser_error)?;

        let capture = Arc::new(HeaderCapture::new(
            self.config.api_host.clone(),
            self.config.header_name.clone(),
        ));
        let observer = {
            let capture = Arc::clone(&capture);
            let requests = requests.map(|event| {
                let headers = serde_json::to_value(&event.request.headers).unwrap_or_default();
                (event.request.url.clone(), headers)
            });
            tokio::spawn(async move {
                watch_requests(requests, &capture).await;
            })
        };

        let portal = self.config.portal_url.as_str();
        match tokio::time::timeout(self.config.navigation_timeout, page.goto(portal)).await {
            Ok(Ok(_)) => debug!(portal, "portal loaded"),
            Ok(Err(err)) => {
                warn!(portal, error = %err, "portal navigation failed; still watching requests")
            }
            Err(_) => warn!(portal, "portal navigation timed out; still watching requests"),
        }

        let outcome = wait_for_capture(&capture, &observer, self.config.timing).await;
        observer.abort();
        outcome
    }
}

fn browser_error(err: impl fmt::Display) -> CredentialError {
    CredentialError::Browser(err.to_string())
}

/// Feeds `(url, headers)` pairs into `capture` until the first match or the
/// end of the stream. Returns whether a credential was captured.
///
/// Only requests issued by the portal page's own target reach this loop.
/// Out-of-process iframes and service workers run in separate CDP targets
/// and are not watched.
pub async fn watch_requests<S>(requests: S, capture: &HeaderCapture) -> bool
where
    S: Stream<Item = (String, JsonValue)>,
{
    let mut requests = pin!(requests);
    while let Some((url, headers)) = requests.next().await {
        if capture.observe(&url, &headers) {
            return true;
        }
    }
    false
}

/// Runs one teardown step under `limit`. A step that fails or overruns is
/// logged and reported as `false`.
async fn bounded_step<T, E, F>(limit: Duration, step_name: &str, step: F) -> bool
where
    E: fmt::Display,
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, step).await {
        Ok(Ok(_)) => true,
        Ok(Err(err)) => {
            warn!(step = step_name, error = %err, "browser teardown step failed");
            false
        }
        Err(_) => {
            let limit_ms = limit.as_millis() as u64;
            warn!(step = step_name, limit_ms, "browser teardown timed out");
            false
        }
    }
}

#[async_trait]
impl CredentialAcquirer for ChromiumCredentialAcquirer {
    async fn acquire(&self) -> Result<Credential, CredentialError> {
        let profile = tempfile::tempdir().map_err(browser_error)?;
        let mut builder = BrowserConfig::builder()
            .user_data_dir(profile.path())
            .request_timeout(self.config.navigation_timeout);
        if let Some(executable) = &self.config.chrome_executable {
            builder = builder.chrome_executable(executable);
        }
        let browser_config = builder.build().map_err(CredentialError::Browser)?;

        let (mut browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(browser_error)?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "browser handler event error");
                }
            }
        });

        let outcome = self.capture_from(&browser).await;

        let exited = bounded_step(BROWSER_SHUTDOWN_TIMEOUT, "closing browser", browser.close())
            .await
            && bounded_step(BROWSER_SHUTDOWN_TIMEOUT, "waiting for browser exit", browser.wait())
                .await;
        if !exited {
            if let Some(Err(err)) = browser.kill().await {
                warn!(error = %err, "killing browser");
            }
        }
        handler_task.abort();
        drop(profile);

        if outcome.is_ok() {
            info!(api_host = %self.config.api_host, "captured subscription credential");
        }
        outcome
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ColumnRole {
    Area,
    TargetTime,
    Value,
}

impl fmt::Display for ColumnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ColumnRole::Area => "area",
            ColumnRole::TargetTime => "target_time",
            ColumnRole::Value => "value",
        })
    }
}

/// Known provider column names per role, highest priority first.
pub const COLUMN_ALIASES: &[(ColumnRole, &[&str])] = &[
    (ColumnRole::Area, &["forecast_area", "zone", "region", "area"]),
    (
        ColumnRole::TargetTime,
        &[
            "forecast_datetime_beginning_utc",
            "forecast_hour_beginning_utc",
            "datetime_beginning_utc",
            "target_ts",
        ],
    ),
    (
        ColumnRole::Value,
        &["forecast_load_mw", "load_forecast_mw", "forecast_mw", "mw"],
    ),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "no column for role(s) {} among observed columns [{}]",
    join_roles(.missing),
    .observed.join(", ")
)]
pub struct SchemaMismatch {
    pub missing: Vec<ColumnRole>,
    pub observed: Vec<String>,
}

fn join_roles(roles: &[ColumnRole]) -> String {
    roles
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Column indices for the three canonical roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedColumns {
    pub area: usize,
    pub target_time: usize,
    pub value: usize,
}

pub fn resolve_columns(columns: &[String]) -> Result<ResolvedColumns, SchemaMismatch> {
    let lowered: Vec<String> = columns.iter().map(|c| c.to_ascii_lowercase()).collect();
    let mut found = BTreeMap::new();
    let mut missing = Vec::new();

    for (role, aliases) in COLUMN_ALIASES {
        let index = aliases
            .iter()
            .find_map(|alias| lowered.iter().position(|c| c == alias));
        match index {
            Some(index) => {
                found.insert(*role, index);
            }
            None => missing.push(*role),
        }
    }

    if !missing.is_empty() {
        return Err(SchemaMismatch {
            missing,
            observed: columns.to_vec(),
        });
    }

    Ok(ResolvedColumns {
        area: found[&ColumnRole::Area],
        target_time: found[&ColumnRole::TargetTime],
        value: found[&ColumnRole::Value],
    })
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("unreadable csv payload: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

fn normalize_header_name(name: &str) -> String {
    name.trim().trim_start_matches('\u{feff}').trim().to_string()
}

/// Parses a CSV payload; malformed rows are dropped, an unreadable header fails.
pub fn parse_csv(bytes: &[u8]) -> Result<RawTable, TableError> {
    let text = String::from_utf8_lossy(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let columns = reader
        .headers()?
        .iter()
        .map(normalize_header_name)
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    let mut malformed = 0usize;
    for record in reader.records() {
        match record {
            Ok(record) => rows.push(record.iter().map(str::to_string).collect()),
            Err(err) => {
                malformed += 1;
                debug!(error = %err, "skipping malformed csv row");
            }
        }
    }
    if malformed > 0 {
        warn!(malformed, "csv payload contained malformed rows");
    }

    Ok(RawTable { columns, rows })
}

const OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%d %H:%M:%S%.f%:z"];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M",
];

/// Absolute UTC instant; naive values are taken as UTC.
pub fn parse_target_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Some(ts) = OFFSET_FORMATS
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(raw, fmt).ok())
    {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

pub fn parse_value(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("0 points remained after filtering for area {area}")]
    EmptyResult { area: String },
    #[error("{found} points remained, at least {required} required")]
    InsufficientPoints { found: usize, required: usize },
}

/// Filters `table` to `area` and the feed window, returning a sorted series
/// with one point per target time (the last row wins).
pub fn normalize_points(
    table: &RawTable,
    columns: &ResolvedColumns,
    area: &str,
    now: DateTime<Utc>,
    window: &WindowPolicy,
) -> Result<Vec<ForecastPoint>, NormalizeError> {
    let mut by_target: BTreeMap<DateTime<Utc>, f64> = BTreeMap::new();
    let (mut other_area, mut bad_time) = (0usize, 0usize);
    let (mut bad_value, mut outside) = (0usize, 0usize);

    for row in &table.rows {
        if row.get(columns.area).map(String::as_str) != Some(area) {
            other_area += 1;
            continue;
        }
        let Some(target_ts) = row.get(columns.target_time).and_then(|v| parse_target_time(v)) else {
            bad_time += 1;
            continue;
        };
        let Some(mw) = row.get(columns.value).and_then(|v| parse_value(v)) else {
            bad_value += 1;
            continue;
        };
        if !window.contains(now, target_ts) {
            outside += 1;
            continue;
        }
        by_target.insert(target_ts, mw);
    }

    debug!(
        rows = table.rows.len(),
        kept = by_target.len(),
        other_area,
        bad_time,
        bad_value,
        outside,
        "normalized forecast rows"
    );

    if by_target.is_empty() {
        return Err(NormalizeError::EmptyResult {
            area: area.to_string(),
        });
    }
    if by_target.len() < window.min_points {
        return Err(NormalizeError::InsufficientPoints {
            found: by_target.len(),
            required: window.min_points,
        });
    }

    Ok(by_target
        .into_iter()
        .map(|(target_ts, mw)| ForecastPoint { target_ts, mw })
        .collect())
}
