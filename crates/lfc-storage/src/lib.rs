//! Authenticated feed retrieval, content fingerprinting and run persistence.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use lfc_core::{Credential, ForecastPoint, NewRun, RunRecord, RunSeries};
use reqwest::header::{HeaderName, HeaderValue, ACCEPT, ORIGIN, REFERER};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, Instrument};

pub const CRATE_NAME: &str = "lfc-storage";

pub const DEFAULT_CREDENTIAL_HEADER: &str = "Ocp-Apim-Subscription-Key";

const FEED_ACCEPT: &str = "text/csv,application/octet-stream,*/*";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Canonical text form of a point series: one `target|mw` line per point,
/// ordered by target time, values fixed to three decimals.
pub fn canonical_series(points: &[ForecastPoint]) -> String {
    let mut sorted: Vec<&ForecastPoint> = points.iter().collect();
    sorted.sort_by_key(|p| p.target_ts);
    sorted
        .iter()
        .map(|p| {
            format!(
                "{}|{:.3}",
                p.target_ts.to_rfc3339_opts(SecondsFormat::Secs, false),
                p.mw
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Deduplication fingerprint of a normalized series.
pub fn fingerprint_points(points: &[ForecastPoint]) -> String {
    sha256_hex(canonical_series(points).as_bytes())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub credential_header: String,
    pub referer: Option<String>,
    pub origin: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            credential_header: DEFAULT_CREDENTIAL_HEADER.to_string(),
            referer: None,
            origin: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("credential is not a valid header value")]
    InvalidCredential,
}

/// Retrieves a feed's raw payload with an acquired credential.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(
        &self,
        feed: &str,
        url: &str,
        credential: &Credential,
    ) -> Result<Vec<u8>, FetchError>;
}

/// Single-shot authenticated GET; any non-success status fails the call.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    credential_header: HeaderName,
    referer: Option<HeaderValue>,
    origin: Option<HeaderValue>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let credential_header = HeaderName::from_bytes(config.credential_header.as_bytes())
            .with_context(|| format!("invalid credential header {}", config.credential_header))?;
        let referer = config
            .referer
            .as_deref()
            .map(HeaderValue::from_str)
            .transpose()
            .context("invalid referer header")?;
        let origin = config
            .origin
            .as_deref()
            .map(HeaderValue::from_str)
            .transpose()
            .context("invalid origin header")?;

        Ok(Self {
            client,
            credential_header,
            referer,
            origin,
        })
    }
}

#[async_trait]
impl FeedSource for HttpFetcher {
    async fn fetch(
        &self,
        feed: &str,
        url: &str,
        credential: &Credential,
    ) -> Result<Vec<u8>, FetchError> {
        let mut key = HeaderValue::from_str(credential.expose())
            .map_err(|_| FetchError::InvalidCredential)?;
        key.set_sensitive(true);

        let mut request = self
            .client
            .get(url)
            .header(ACCEPT, FEED_ACCEPT)
            .header(self.credential_header.clone(), key);
        if let Some(referer) = &self.referer {
            request = request.header(REFERER, referer.clone());
        }
        if let Some(origin) = &self.origin {
            request = request.header(ORIGIN, origin.clone());
        }

        let span = info_span!("http_fetch", feed, url);
        async move {
            let resp = request.send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "fetched feed payload");
            Ok(body)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Inserted { points: u64, pruned_runs: u64 },
    /// Another run with the same `(feed, area, payload_hash)` already exists.
    Conflict,
}

/// Persistent home of runs and their points.
///
/// `persist_run` is atomic: the run row, its points and the retention prune
/// either all land or none do.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn has_payload(
        &self,
        feed: &str,
        area: &str,
        payload_hash: &str,
    ) -> Result<bool, StoreError>;

    async fn persist_run(
        &self,
        run: &NewRun,
        points: &[ForecastPoint],
        prune_before: DateTime<Utc>,
    ) -> Result<PersistOutcome, StoreError>;

    /// Deletes runs created before `prune_before` and any point left without a run.
    async fn prune(&self, prune_before: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn latest_run(&self, feed: &str, area: &str) -> Result<Option<RunRecord>, StoreError>;

    async fn runs_since(
        &self,
        feed: &str,
        area: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RunSeries>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgStoreOptions {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub statement_timeout: Option<Duration>,
}

impl Default for PgStoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
            statement_timeout: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub async fn connect(url: &str, options: &PgStoreOptions) -> Result<Self, StoreError> {
        let mut connect = PgConnectOptions::from_str(url)?;
        if let Some(timeout) = options.statement_timeout {
            let millis = format!("{}ms", timeout.as_millis());
            connect = connect.options([("statement_timeout", millis)]);
        }
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .acquire_timeout(options.acquire_timeout)
            .connect_with(connect)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("forecast schema is up to date");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn prune_with(
    conn: &mut PgConnection,
    prune_before: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let runs = sqlx::query("DELETE FROM forecast_runs WHERE created_at < $1")
        .bind(prune_before)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    sqlx::query(
        r#"
        DELETE FROM forecast_points p
         WHERE NOT EXISTS (
               SELECT 1
                 FROM forecast_runs r
                WHERE r.feed = p.feed
                  AND r.area = p.area
                  AND r.run_ts = p.run_ts
         )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    Ok(runs)
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn has_payload(
        &self,
        feed: &str,
        area: &str,
        payload_hash: &str,
    ) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1
                  FROM forecast_runs
                 WHERE feed = $1 AND area = $2 AND payload_hash = $3
            )
            "#,
        )
        .bind(feed)
        .bind(area)
        .bind(payload_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn persist_run(
        &self,
        run: &NewRun,
        points: &[ForecastPoint],
        prune_before: DateTime<Utc>,
    ) -> Result<PersistOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO forecast_runs (feed, area, run_ts, payload_hash)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (feed, area, payload_hash) DO NOTHING
            "#,
        )
        .bind(&run.feed)
        .bind(&run.area)
        .bind(run.run_ts)
        .bind(&run.payload_hash)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(PersistOutcome::Conflict);
        }

        let targets: Vec<DateTime<Utc>> = points.iter().map(|p| p.target_ts).collect();
        let values: Vec<f64> = points.iter().map(|p| p.mw).collect();
        let written = sqlx::query(
            r#"
            INSERT INTO forecast_points (feed, area, run_ts, target_ts, mw)
            SELECT $1, $2, $3, t.target_ts, t.mw
              FROM UNNEST($4::timestamptz[], $5::float8[]) AS t(target_ts, mw)
            ON CONFLICT (feed, area, run_ts, target_ts) DO NOTHING
            "#,
        )
        .bind(&run.feed)
        .bind(&run.area)
        .bind(run.run_ts)
        .bind(&targets)
        .bind(&values)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let pruned_runs = prune_with(&mut *tx, prune_before).await?;
        tx.commit().await?;

        Ok(PersistOutcome::Inserted {
            points: written,
            pruned_runs,
        })
    }

    async fn prune(&self, prune_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let pruned = prune_with(&mut *tx, prune_before).await?;
        tx.commit().await?;
        Ok(pruned)
    }

    async fn latest_run(&self, feed: &str, area: &str) -> Result<Option<RunRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT feed, area, run_ts, payload_hash, created_at
              FROM forecast_runs
             WHERE feed = $1 AND area = $2
             ORDER BY run_ts DESC
             LIMIT 1
            "#,
        )
        .bind(feed)
        .bind(area)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(RunRecord {
            feed: row.try_get("feed")?,
            area: row.try_get("area")?,
            run_ts: row.try_get("run_ts")?,
            payload_hash: row.try_get("payload_hash")?,
            created_at: row.try_get("created_at")?,
        }))
    }

    async fn runs_since(
        &self,
        feed: &str,
        area: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RunSeries>, StoreError> {
        let run_rows = sqlx::query(
            r#"
            SELECT run_ts
              FROM forecast_runs
             WHERE feed = $1 AND area = $2 AND run_ts >= $3
             ORDER BY run_ts ASC
            "#,
        )
        .bind(feed)
        .bind(area)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        if run_rows.is_empty() {
            return Ok(Vec::new());
        }

        let point_rows = sqlx::query(
            r#"
            SELECT run_ts, target_ts, mw
              FROM forecast_points
             WHERE feed = $1 AND area = $2 AND run_ts >= $3
             ORDER BY run_ts ASC, target_ts ASC
            "#,
        )
        .bind(feed)
        .bind(area)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut by_run: HashMap<DateTime<Utc>, Vec<ForecastPoint>> = HashMap::new();
        for row in point_rows {
            let run_ts: DateTime<Utc> = row.try_get("run_ts")?;
            by_run.entry(run_ts).or_default().push(ForecastPoint {
                target_ts: row.try_get("target_ts")?,
                mw: row.try_get("mw")?,
            });
        }

        let mut out = Vec::with_capacity(run_rows.len());
        for row in run_rows {
            let run_ts: DateTime<Utc> = row.try_get("run_ts")?;
            out.push(RunSeries {
                run_ts,
                points: by_run.remove(&run_ts).unwrap_or_default(),
            });
        }
        Ok(out)
    }
}

type PointKey = (String, String, DateTime<Utc>, DateTime<Utc>);

#[derive(Debug, Default)]
struct MemoryState {
    runs: Vec<RunRecord>,
    points: BTreeMap<PointKey, f64>,
}

impl MemoryState {
    fn prune(&mut self, prune_before: DateTime<Utc>) -> u64 {
        let before = self.runs.len();
        self.runs.retain(|r| r.created_at >= prune_before);
        let runs = &self.runs;
        self.points.retain(|(feed, area, run_ts, _), _| {
            runs.iter()
                .any(|r| &r.feed == feed && &r.area == area && &r.run_ts == run_ts)
        });
        (before - self.runs.len()) as u64
    }
}

/// In-process store with the same uniqueness and atomicity rules as Postgres.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    state: Mutex<MemoryState>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn persist_run_at(
        &self,
        run: &NewRun,
        points: &[ForecastPoint],
        created_at: DateTime<Utc>,
        prune_before: DateTime<Utc>,
    ) -> PersistOutcome {
        let mut state = self.state.lock().await;
        if state.runs.iter().any(|r| {
            r.feed == run.feed && r.area == run.area && r.payload_hash == run.payload_hash
        }) {
            return PersistOutcome::Conflict;
        }

        state.runs.push(RunRecord {
            feed: run.feed.clone(),
            area: run.area.clone(),
            run_ts: run.run_ts,
            payload_hash: run.payload_hash.clone(),
            created_at,
        });

        let mut written = 0u64;
        for point in points {
            let key = (run.feed.clone(), run.area.clone(), run.run_ts, point.target_ts);
            if !state.points.contains_key(&key) {
                state.points.insert(key, point.mw);
                written += 1;
            }
        }

        let pruned_runs = state.prune(prune_before);
        PersistOutcome::Inserted {
            points: written,
            pruned_runs,
        }
    }

    pub async fn runs(&self) -> Vec<RunRecord> {
        self.state.lock().await.runs.clone()
    }

    pub async fn run_count(&self) -> usize {
        self.state.lock().await.runs.len()
    }

    pub async fn point_count(&self) -> usize {
        self.state.lock().await.points.len()
    }

    pub async fn points_for(
        &self,
        feed: &str,
        area: &str,
        run_ts: DateTime<Utc>,
    ) -> Vec<ForecastPoint> {
        self.state
            .lock()
            .await
            .points
            .iter()
            .filter(|((f, a, r, _), _)| f == feed && a == area && *r == run_ts)
            .map(|((_, _, _, target_ts), mw)| ForecastPoint {
                target_ts: *target_ts,
                mw: *mw,
            })
            .collect()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn has_payload(
        &self,
        feed: &str,
        area: &str,
        payload_hash: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .runs
            .iter()
            .any(|r| r.feed == feed && r.area == area && r.payload_hash == payload_hash))
    }

    async fn persist_run(
        &self,
        run: &NewRun,
        points: &[ForecastPoint],
        prune_before: DateTime<Utc>,
    ) -> Result<PersistOutcome, StoreError> {
        Ok(self
            .persist_run_at(run, points, Utc::now(), prune_before)
            .await)
    }

    async fn prune(&self, prune_before: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.prune(prune_before))
    }

    async fn latest_run(&self, feed: &str, area: &str) -> Result<Option<RunRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .runs
            .iter()
            .filter(|r| r.feed == feed && r.area == area)
            .max_by_key(|r| r.run_ts)
            .cloned())
    }

    async fn runs_since(
        &self,
        feed: &str,
        area: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RunSeries>, StoreError> {
        let mut run_ts: Vec<DateTime<Utc>> = self
            .state
            .lock()
            .await
            .runs
            .iter()
            .filter(|r| r.feed == feed && r.area == area && r.run_ts >= since)
            .map(|r| r.run_ts)
            .collect();
        run_ts.sort();

        let mut out = Vec::with_capacity(run_ts.len());
        for ts in run_ts {
            out.push(RunSeries {
                run_ts: ts,
                points: self.points_for(feed, area, ts).await,
            });
        }
        Ok(out)
    }
}
