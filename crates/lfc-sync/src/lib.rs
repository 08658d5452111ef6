//! Ingestion orchestration: configuration, the per-feed pipeline and the
//! optional interval scheduler.

use std::collections::HashSet;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use lfc_adapters::{
    normalize_points, parse_csv, resolve_columns, BrowserCredentialConfig, CaptureTiming,
    ChromiumCredentialAcquirer, CredentialAcquirer, NormalizeError, SchemaMismatch,
    StaticCredentialAcquirer, TableError,
};
use lfc_core::{
    retention_cutoff, Credential, FeedReport, IngestReport, NewRun, OverallStatus, WindowPolicy,
};
use lfc_storage::{
    fingerprint_points, FeedSource, FetchError, HttpClientConfig, HttpFetcher, PersistOutcome,
    PgRunStore, PgStoreOptions, RunStore, StoreError, DEFAULT_CREDENTIAL_HEADER,
};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lfc-sync";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(String),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

fn invalid(key: &str, value: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.into(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    pub id: String,
    pub url: String,
    pub window: WindowPolicy,
}

/// Environment key fragment for a feed id: `7day` -> `7DAY`, `v-short` -> `V_SHORT`.
pub fn feed_env_key(feed_id: &str) -> String {
    feed_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

const MAX_RETENTION_DAYS: i64 = 3650;
const MAX_WINDOW_HOURS: i64 = 8760;
const MAX_TIMEOUT_SECS: u64 = 3600;
const MAX_SETTLE_MS: u64 = 600_000;
const MAX_POLL_MS: u64 = 60_000;

struct Settings<F> {
    lookup: F,
}

impl<F> Settings<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.optional(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| invalid(key, raw.clone(), e.to_string()))
            })
            .transpose()
    }

    fn parsed_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.parsed(key)?.unwrap_or(default))
    }

    fn at_most<T>(&self, key: &str, default: T, max: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + Display + Copy,
        T::Err: Display,
    {
        let value = self.parsed_or(key, default)?;
        if value > max {
            return Err(invalid(key, value.to_string(), format!("must be at most {max}")));
        }
        Ok(value)
    }

    fn positive<T>(&self, key: &str, default: T, max: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + Default + Display + Copy,
        T::Err: Display,
    {
        let value = self.at_most(key, default, max)?;
        if value <= T::default() {
            return Err(invalid(key, value.to_string(), "must be greater than zero"));
        }
        Ok(value)
    }

    fn hours(&self, key: &str, default: i64) -> Result<TimeDelta, ConfigError> {
        let hours = self.positive(key, default, MAX_WINDOW_HOURS)?;
        TimeDelta::try_hours(hours)
            .ok_or_else(|| invalid(key, hours.to_string(), "out of range"))
    }
}

/// Database, retention and read API settings. Commands that never fetch
/// feeds load only this.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_acquire_timeout_secs: u64,
    pub db_statement_timeout_ms: u64,
    pub area: String,
    pub retention: TimeDelta,
    pub web_port: u16,
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Self::load(&Settings { lookup })
    }

    fn load<F>(s: &Settings<F>) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let retention_days = s.positive("RETENTION_DAYS", 7, MAX_RETENTION_DAYS)?;
        Ok(Self {
            database_url: s.required("DATABASE_URL")?,
            db_max_connections: s.positive("DB_MAX_CONNECTIONS", 5, 1_000)?,
            db_acquire_timeout_secs: s.positive("DB_ACQUIRE_TIMEOUT_SECS", 10, MAX_TIMEOUT_SECS)?,
            db_statement_timeout_ms: s.positive(
                "DB_STATEMENT_TIMEOUT_MS",
                30_000,
                MAX_TIMEOUT_SECS * 1_000,
            )?,
            area: s.string_or("AREA_FILTER", "RTO_COMBINED"),
            retention: TimeDelta::try_days(retention_days).ok_or_else(|| {
                invalid("RETENTION_DAYS", retention_days.to_string(), "out of range")
            })?,
            web_port: s.parsed_or("WEB_PORT", 8000)?,
        })
    }

    /// Runs created before this instant are expired.
    pub fn prune_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        retention_cutoff(now, self.retention)
    }

    pub fn pg_options(&self) -> PgStoreOptions {
        PgStoreOptions {
            max_connections: self.db_max_connections,
            acquire_timeout: Duration::from_secs(self.db_acquire_timeout_secs),
            statement_timeout: Some(Duration::from_millis(self.db_statement_timeout_ms)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store: StoreConfig,
    pub portal_url: String,
    pub api_host: String,
    pub credential_header: String,
    pub subscription_key: Option<String>,
    pub chrome_executable: Option<PathBuf>,
    pub credential_timing: CaptureTiming,
    pub navigation_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub feeds: Vec<FeedConfig>,
    pub schedule_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let s = Settings { lookup };
        let store = StoreConfig::load(&s)?;

        let portal_url = s.string_or("PORTAL_URL", "https://dataminer2.pjm.com/");
        Url::parse(&portal_url)
            .map_err(|e| invalid("PORTAL_URL", portal_url.clone(), e.to_string()))?;

        Ok(Self {
            store,
            portal_url,
            api_host: s.string_or("API_HOST", "api.pjm.com"),
            credential_header: s.string_or("CREDENTIAL_HEADER", DEFAULT_CREDENTIAL_HEADER),
            subscription_key: s.optional("SUBSCRIPTION_KEY"),
            chrome_executable: s.optional("CHROME_EXECUTABLE").map(PathBuf::from),
            credential_timing: CaptureTiming {
                settle_delay: Duration::from_millis(s.at_most(
                    "CREDENTIAL_SETTLE_MS",
                    3_000,
                    MAX_SETTLE_MS,
                )?),
                timeout: Duration::from_secs(s.positive(
                    "CREDENTIAL_TIMEOUT_SECS",
                    20,
                    MAX_TIMEOUT_SECS,
                )?),
                poll_interval: Duration::from_millis(s.positive(
                    "CREDENTIAL_POLL_MS",
                    500,
                    MAX_POLL_MS,
                )?),
            },
            navigation_timeout_secs: s.positive("NAVIGATION_TIMEOUT_SECS", 60, MAX_TIMEOUT_SECS)?,
            http_timeout_secs: s.positive("HTTP_TIMEOUT_SECS", 60, MAX_TIMEOUT_SECS)?,
            user_agent: s.string_or("LFC_USER_AGENT", "lfc-ingest/0.1"),
            feeds: load_feeds(&s)?,
            schedule_cron: s.string_or("SCHEDULE_CRON", "0 */15 * * * *"),
        })
    }

    /// `scheme://host[:port]` of the portal, sent as the `Origin` header.
    pub fn portal_origin(&self) -> Option<String> {
        Url::parse(&self.portal_url)
            .ok()
            .map(|url| url.origin().ascii_serialization())
            .filter(|origin| origin != "null")
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            credential_header: self.credential_header.clone(),
            referer: Some(self.portal_url.clone()),
            origin: self.portal_origin(),
        }
    }

    pub fn browser_credential_config(&self) -> BrowserCredentialConfig {
        BrowserCredentialConfig {
            portal_url: self.portal_url.clone(),
            api_host: self.api_host.clone(),
            header_name: self.credential_header.clone(),
            timing: self.credential_timing,
            navigation_timeout: Duration::from_secs(self.navigation_timeout_secs),
            chrome_executable: self.chrome_executable.clone(),
        }
    }
}

fn load_feeds<F>(s: &Settings<F>) -> Result<Vec<FeedConfig>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let feed_ids = s.string_or("FEEDS", "7day");
    let ids: Vec<&str> = feed_ids
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .collect();
    if ids.is_empty() {
        return Err(invalid("FEEDS", feed_ids.clone(), "at least one feed is required"));
    }

    // Two ids sharing an env key would read the same PJM_<FEED>_* settings.
    let mut seen = HashSet::new();
    for id in &ids {
        if !seen.insert(feed_env_key(id)) {
            return Err(invalid(
                "FEEDS",
                feed_ids.clone(),
                format!("feed {id} repeats an earlier feed's key PJM_{}_*", feed_env_key(id)),
            ));
        }
    }

    let default_horizon = s.positive("HORIZON_HOURS", 48, MAX_WINDOW_HOURS)?;
    let mut feeds = Vec::with_capacity(ids.len());
    for id in ids {
        let key = feed_env_key(id);
        let lookback_key = format!("PJM_{key}_LOOKBACK_HOURS");
        let lookback = match s.optional(&lookback_key) {
            Some(_) => Some(s.hours(&lookback_key, 0)?),
            None => None,
        };
        feeds.push(FeedConfig {
            id: id.to_string(),
            url: s.required(&format!("PJM_{key}_URL"))?,
            window: WindowPolicy {
                horizon: s.hours(&format!("PJM_{key}_HORIZON_HOURS"), default_horizon)?,
                lookback,
                min_points: s.positive(&format!("PJM_{key}_MIN_POINTS"), 1usize, 100_000)?,
            },
        });
    }
    Ok(feeds)
}

/// Everything that can end one feed's attempt early.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Schema(#[from] SchemaMismatch),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct IngestionPipeline {
    area: String,
    retention: TimeDelta,
    feeds: Vec<FeedConfig>,
    credentials: Box<dyn CredentialAcquirer>,
    source: Box<dyn FeedSource>,
    store: Arc<dyn RunStore>,
}

impl IngestionPipeline {
    pub fn new(config: &SyncConfig, store: Arc<dyn RunStore>) -> Result<Self> {
        let credentials: Box<dyn CredentialAcquirer> = match &config.subscription_key {
            Some(key) => Box::new(StaticCredentialAcquirer::new(
                Credential::new(key.clone()),
                config.credential_header.clone(),
            )),
            None => Box::new(ChromiumCredentialAcquirer::new(
                config.browser_credential_config(),
            )),
        };
        let source = HttpFetcher::new(config.http_client_config())?;
        Ok(Self {
            area: config.store.area.clone(),
            retention: config.store.retention,
            feeds: config.feeds.clone(),
            credentials,
            source: Box::new(source),
            store,
        })
    }

    pub fn with_credentials(mut self, credentials: Box<dyn CredentialAcquirer>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_source(mut self, source: Box<dyn FeedSource>) -> Self {
        self.source = source;
        self
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    fn prune_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        retention_cutoff(now, self.retention)
    }

    pub async fn run_once(&self) -> IngestReport {
        self.run_once_at(Utc::now()).await
    }

    /// One invocation: a shared credential, then every feed in order.
    /// `now` is both the windowing reference and the run timestamp.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> IngestReport {
        let invocation_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("ingest", %invocation_id);

        async move {
            let credential = match self.credentials.acquire().await {
                Ok(credential) => credential,
                Err(err) => {
                    error!(error = %err, "credential acquisition failed; no feed attempted");
                    return IngestReport {
                        invocation_id,
                        started_at,
                        finished_at: Utc::now(),
                        status: OverallStatus::CredentialFailed,
                        error: Some(err.to_string()),
                        feeds: Vec::new(),
                    };
                }
            };

            let mut feeds = Vec::with_capacity(self.feeds.len());
            for feed in &self.feeds {
                let feed_span = info_span!("feed", feed = %feed.id, area = %self.area);
                let report = match self
                    .ingest_feed(feed, &credential, now)
                    .instrument(feed_span)
                    .await
                {
                    Ok(report) => report,
                    Err(err) => {
                        warn!(feed = %feed.id, error = %err, "feed ingestion failed");
                        FeedReport::error(&feed.id, &self.area, err.to_string())
                    }
                };
                feeds.push(report);
            }

            IngestReport {
                invocation_id,
                started_at,
                finished_at: Utc::now(),
                status: OverallStatus::Ok,
                error: None,
                feeds,
            }
        }
        .instrument(span)
        .await
    }

    async fn ingest_feed(
        &self,
        feed: &FeedConfig,
        credential: &Credential,
        now: DateTime<Utc>,
    ) -> Result<FeedReport, FeedError> {
        let bytes = self.source.fetch(&feed.id, &feed.url, credential).await?;
        let table = parse_csv(&bytes)?;
        let columns = resolve_columns(&table.columns)?;
        let points = normalize_points(&table, &columns, &self.area, now, &feed.window)?;
        let payload_hash = fingerprint_points(&points);

        if self
            .store
            .has_payload(&feed.id, &self.area, &payload_hash)
            .await?
        {
            info!(points = points.len(), %payload_hash, "series unchanged; skipping");
            self.prune_after_skip(now).await;
            return Ok(FeedReport::skipped(
                &feed.id,
                &self.area,
                points.len(),
                &payload_hash,
                "duplicate payload_hash (normalized points unchanged)",
            ));
        }

        let run = NewRun {
            feed: feed.id.clone(),
            area: self.area.clone(),
            run_ts: now,
            payload_hash,
        };
        match self
            .store
            .persist_run(&run, &points, self.prune_cutoff(now))
            .await?
        {
            PersistOutcome::Inserted {
                points: written,
                pruned_runs,
            } => {
                info!(points = written, pruned_runs, run_ts = %run.run_ts, "stored forecast run");
                Ok(FeedReport::ok(&run, &points))
            }
            PersistOutcome::Conflict => {
                info!(payload_hash = %run.payload_hash, "run stored concurrently; skipping");
                self.prune_after_skip(now).await;
                Ok(FeedReport::skipped(
                    &feed.id,
                    &self.area,
                    points.len(),
                    &run.payload_hash,
                    "duplicate payload_hash (stored by a concurrent invocation)",
                ))
            }
        }
    }

    async fn prune_after_skip(&self, now: DateTime<Utc>) {
        if let Err(err) = self.store.prune(self.prune_cutoff(now)).await {
            warn!(error = %err, "retention prune failed");
        }
    }

    pub async fn prune(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.store.prune(self.prune_cutoff(now)).await
    }
}

pub async fn connect_store(config: &StoreConfig) -> Result<PgRunStore> {
    let store = PgRunStore::connect(&config.database_url, &config.pg_options())
        .await
        .context("connecting to postgres")?;
    store.migrate().await.context("applying migrations")?;
    Ok(store)
}

pub async fn run_ingest_once_from_env() -> Result<IngestReport> {
    let config = SyncConfig::from_env()?;
    let store = Arc::new(connect_store(&config.store).await?);
    let pipeline = IngestionPipeline::new(&config, store.clone())?;
    let report = pipeline.run_once().await;
    store.close().await;
    Ok(report)
}

pub async fn build_scheduler(pipeline: Arc<IngestionPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            let report = pipeline.run_once().await;
            info!(
                invocation_id = %report.invocation_id,
                status = ?report.status,
                feeds = report.feeds.len(),
                "scheduled ingestion finished"
            );
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
