//! Pipeline orchestration: configuration, deduplication, snapshot persistence and scheduling.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use credisnap_adapters::{
    normalize_offers, normalize_reviews, ChromiumLauncher, ChromiumSettings,
    FinratingReviewsAdapter, MicroloansOffersAdapter, OfferSink, OfferSourceSettings,
    ReviewSourceSettings, SurfaceLauncher, DEFAULT_USER_AGENT,
};
use credisnap_core::{
    Fingerprint, OfferId, OfferRecord, PipelineKind, PipelineRun, RawOffer, ReviewRecord, RunStatus,
};
use credisnap_storage::{
    save_raw_offers, BlobStore, CookieStore, FileBlobStore, SessionStateStore, RAW_OFFERS_BLOB,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub const CRATE_NAME: &str = "credisnap-sync";

/// Moscow time, where the review feed dates its cards.
pub const SITE_UTC_OFFSET_SECS: i32 = 3 * 3600;

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub data_dir: PathBuf,
    pub headless: bool,
    pub user_agent: String,
    pub chrome_path: Option<PathBuf>,
    pub remote_browser: Option<String>,
    pub navigation_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    /// Offset used to resolve "today" for relative review dates.
    pub site_offset: FixedOffset,
    pub workspace_root: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            data_dir: PathBuf::from("./data"),
            headless: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            chrome_path: None,
            remote_browser: None,
            navigation_timeout_secs: 60,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            site_offset: FixedOffset::east_opt(SITE_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix()),
            workspace_root: PathBuf::from("."),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            data_dir: std::env::var("CREDISNAP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            headless: env_flag("CREDISNAP_HEADLESS", true),
            user_agent: std::env::var("CREDISNAP_USER_AGENT").unwrap_or(defaults.user_agent),
            chrome_path: std::env::var("CREDISNAP_CHROME_PATH").ok().map(PathBuf::from),
            remote_browser: std::env::var("CREDISNAP_REMOTE_BROWSER").ok().filter(|v| !v.is_empty()),
            navigation_timeout_secs: std::env::var("CREDISNAP_NAV_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.navigation_timeout_secs),
            scheduler_enabled: env_flag("CREDISNAP_SCHEDULER_ENABLED", false),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or(defaults.sync_cron),
            site_offset: std::env::var("CREDISNAP_SITE_UTC_OFFSET")
                .ok()
                .and_then(|v| parse_utc_offset(&v))
                .unwrap_or(defaults.site_offset),
            workspace_root: defaults.workspace_root,
        }
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL is not set")
    }

    /// Calendar date on the site at `at`.
    pub fn site_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.site_offset).date_naive()
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn chromium_settings(&self) -> ChromiumSettings {
        ChromiumSettings {
            headless: self.headless,
            chrome_path: self.chrome_path.clone(),
            remote_url: self.remote_browser.clone(),
            request_timeout: Duration::from_secs(self.navigation_timeout_secs),
        }
    }
}

/// Parse an offset such as `+03:00`.
pub fn parse_utc_offset(value: &str) -> Option<FixedOffset> {
    value.trim().parse().ok()
}

/// Per-source overrides read from `sources.yaml`. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SourcesFile {
    pub reviews: ReviewSourceSettings,
    pub microloans: OfferSourceSettings,
}

impl SourcesFile {
    /// Compiled-in defaults when `path` does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            debug!(path = %path.display(), "no sources file, using defaults");
            return Ok(Self::default());
        }
        let yaml = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&yaml).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn with_navigation_timeout(mut self, secs: u64) -> Self {
        self.reviews.navigation_timeout_secs = secs;
        self.microloans.navigation_timeout_secs = secs;
        self
    }

    pub fn without_delays(mut self) -> Self {
        self.reviews = self.reviews.without_delays();
        self.microloans = self.microloans.without_delays();
        self
    }
}

/// In-run offer dedup: the first offer seen with a given id wins.
#[derive(Debug, Default)]
pub struct OfferAccumulator {
    seen: HashSet<OfferId>,
    offers: Vec<RawOffer>,
    duplicates: usize,
}

impl OfferAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    pub fn into_offers(self) -> Vec<RawOffer> {
        self.offers
    }
}

impl OfferSink for OfferAccumulator {
    fn accept(&mut self, offer: RawOffer) -> bool {
        if !self.seen.insert(offer.offer_id.clone()) {
            debug!(offer_id = %offer.offer_id, "duplicate offer in run");
            self.duplicates += 1;
            return false;
        }
        self.offers.push(offer);
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReviewPartition {
    /// Reviews whose fingerprint was not in the previous state, in page order.
    pub new: Vec<ReviewRecord>,
    /// Reviews already present in the previous state.
    pub seen: usize,
    /// Fingerprints of everything scraped this run; becomes the next state.
    pub current: BTreeSet<Fingerprint>,
}

/// Split this run's reviews into new and already-seen. A fingerprint repeated
/// within the run is kept once.
pub fn partition_reviews(
    records: Vec<ReviewRecord>,
    previously_seen: &HashSet<Fingerprint>,
) -> ReviewPartition {
    let mut partition = ReviewPartition::default();
    for record in records {
        if !partition.current.insert(record.fingerprint.clone()) {
            debug!(fingerprint = %record.fingerprint, "duplicate review in run");
            continue;
        }
        if previously_seen.contains(&record.fingerprint) {
            partition.seen += 1;
        } else {
            partition.new.push(record);
        }
    }
    partition
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("snapshot store failure: {0}")]
    Store(String),
    #[error("batch of {0} rows does not fit a run record")]
    RowCount(usize),
}

#[derive(Debug, Clone, Copy)]
pub enum SnapshotBatch<'a> {
    Microloans(&'a [OfferRecord]),
    Reviews(&'a [ReviewRecord]),
}

impl SnapshotBatch<'_> {
    pub fn kind(&self) -> PipelineKind {
        match self {
            SnapshotBatch::Microloans(_) => PipelineKind::Microloans,
            SnapshotBatch::Reviews(_) => PipelineKind::Reviews,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SnapshotBatch::Microloans(rows) => rows.len(),
            SnapshotBatch::Reviews(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One unit of work against the snapshot tables. Dropping without `commit` discards it.
#[async_trait]
pub trait SnapshotTx: Send {
    async fn insert_run(&mut self, run: &PipelineRun) -> Result<(), SnapshotError>;

    async fn insert_offers(&mut self, run_id: Uuid, rows: &[OfferRecord]) -> Result<(), SnapshotError>;

    async fn insert_reviews(&mut self, run_id: Uuid, rows: &[ReviewRecord]) -> Result<(), SnapshotError>;

    /// Persist the terminal status, finish time and row count of `run`.
    async fn finish_run(&mut self, run: &PipelineRun) -> Result<(), SnapshotError>;

    async fn commit(self) -> Result<(), SnapshotError>;

    async fn rollback(self) -> Result<(), SnapshotError>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    type Tx: SnapshotTx;

    /// Create the snapshot tables if absent.
    async fn migrate(&self) -> Result<(), SnapshotError>;

    async fn begin(&self) -> Result<Self::Tx, SnapshotError>;
}

async fn fill_run<T: SnapshotTx>(
    tx: &mut T,
    run: &mut PipelineRun,
    batch: SnapshotBatch<'_>,
    rows: i32,
) -> Result<(), SnapshotError> {
    tx.insert_run(run).await?;
    match batch {
        SnapshotBatch::Microloans(offers) => tx.insert_offers(run.run_id, offers).await?,
        SnapshotBatch::Reviews(reviews) => tx.insert_reviews(run.run_id, reviews).await?,
    }
    run.finish(RunStatus::Ok, rows);
    tx.finish_run(run).await
}

/// Wraps a batch in a pipeline run and persists both in one transaction.
pub struct SnapshotWriter<S> {
    store: S,
}

impl<S: SnapshotStore> SnapshotWriter<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Either the run (status `ok`) and every row land, or none do. On failure the
    /// run is recorded with status `error` in a separate transaction.
    pub async fn write(&self, batch: SnapshotBatch<'_>) -> Result<Uuid, SnapshotError> {
        let mut run = PipelineRun::start(batch.kind());
        let span = info_span!("snapshot_write", run_id = %run.run_id, pipeline = %run.pipeline);
        async {
            match self.write_atomic(&mut run, batch).await {
                Ok(()) => {
                    info!(rows = batch.len(), "snapshot committed");
                    Ok(run.run_id)
                }
                Err(err) => {
                    error!("snapshot write failed, transaction rolled back: {err}");
                    self.record_failure(&run).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn write_atomic(
        &self,
        run: &mut PipelineRun,
        batch: SnapshotBatch<'_>,
    ) -> Result<(), SnapshotError> {
        let rows = i32::try_from(batch.len()).map_err(|_| SnapshotError::RowCount(batch.len()))?;
        let mut tx = self.store.begin().await?;
        match fill_run(&mut tx, run, batch, rows).await {
            Ok(()) => tx.commit().await,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("rollback failed: {rollback_err}");
                }
                Err(err)
            }
        }
    }

    async fn record_failure(&self, run: &PipelineRun) {
        let mut failed = run.clone();
        failed.status = RunStatus::Error;
        failed.finished_at = Some(Utc::now());
        failed.rows_count = None;
        let outcome = async {
            let mut tx = self.store.begin().await?;
            tx.insert_run(&failed).await?;
            tx.commit().await
        }
        .await;
        match outcome {
            Ok(()) => warn!("run recorded with status error"),
            Err(err) => error!("failed to record error status for run: {err}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub async fn connect(database_url: &str) -> Result<Self, SnapshotError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    type Tx = PgSnapshotTx;

    async fn migrate(&self) -> Result<(), SnapshotError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("snapshot tables ready");
        Ok(())
    }

    async fn begin(&self) -> Result<PgSnapshotTx, SnapshotError> {
        Ok(PgSnapshotTx {
            tx: self.pool.begin().await?,
        })
    }
}

pub struct PgSnapshotTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl SnapshotTx for PgSnapshotTx {
    async fn insert_run(&mut self, run: &PipelineRun) -> Result<(), SnapshotError> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_snapshot (run_id, pipeline, started_at, finished_at, status, rows_count)
            VALUES ($1, $2::pipeline_type, $3, $4, $5::pipeline_status, $6)
            "#,
        )
        .bind(run.run_id)
        .bind(run.pipeline.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.status.as_str())
        .bind(run.rows_count)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_offers(&mut self, run_id: Uuid, rows: &[OfferRecord]) -> Result<(), SnapshotError> {
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO microloan_snapshot (
                    id, run_id, card_index, offer_name, available_amount, repayment_period, total_cost,
                    avail_amount_min, avail_amount_max, repayment_period_min, repayment_period_max,
                    total_cost_min, total_cost_max
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12::numeric, $13::numeric)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(run_id)
            .bind(row.card_index)
            .bind(&row.offer_name)
            .bind(&row.available_amount)
            .bind(&row.repayment_period)
            .bind(&row.total_cost)
            .bind(row.avail_amount_min)
            .bind(row.avail_amount_max)
            .bind(row.repayment_period_min)
            .bind(row.repayment_period_max)
            .bind(row.total_cost_min)
            .bind(row.total_cost_max)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn insert_reviews(&mut self, run_id: Uuid, rows: &[ReviewRecord]) -> Result<(), SnapshotError> {
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO review_snapshot (id, run_id, fingerprint, title, body, rating, published_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(run_id)
            .bind(row.fingerprint.as_str())
            .bind(&row.title)
            .bind(&row.body)
            .bind(row.rating)
            .bind(row.published_at)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn finish_run(&mut self, run: &PipelineRun) -> Result<(), SnapshotError> {
        sqlx::query(
            r#"
            UPDATE pipeline_snapshot
               SET status = $2::pipeline_status,
                   finished_at = $3,
                   rows_count = $4
             WHERE run_id = $1
            "#,
        )
        .bind(run.run_id)
        .bind(run.status.as_str())
        .bind(run.finished_at)
        .bind(run.rows_count)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self) -> Result<(), SnapshotError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), SnapshotError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub pipeline: PipelineKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Distinct items that survived extraction and validation.
    pub captured: usize,
    /// In-run duplicates for offers; previously seen reviews for reviews.
    pub duplicates: usize,
    pub rows_written: usize,
}

pub struct SyncPipeline<S> {
    config: PipelineConfig,
    sources: SourcesFile,
    launcher: Arc<dyn SurfaceLauncher>,
    blobs: Arc<dyn BlobStore>,
    writer: SnapshotWriter<S>,
}

impl SyncPipeline<PgSnapshotStore> {
    /// Chromium launcher, file-backed state under the data dir and Postgres snapshots.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let sources = SourcesFile::load(&config.sources_path())
            .await?
            .with_navigation_timeout(config.navigation_timeout_secs);
        let store = PgSnapshotStore::connect(config.database_url()?)
            .await
            .context("connecting to Postgres")?;
        let launcher = Arc::new(ChromiumLauncher::new(config.chromium_settings()));
        let blobs = Arc::new(FileBlobStore::new(config.data_dir.clone()));
        Ok(Self::new(config, sources, launcher, blobs, store))
    }
}

impl<S: SnapshotStore> SyncPipeline<S> {
    pub fn new(
        config: PipelineConfig,
        sources: SourcesFile,
        launcher: Arc<dyn SurfaceLauncher>,
        blobs: Arc<dyn BlobStore>,
        store: S,
    ) -> Self {
        Self {
            config,
            sources,
            launcher,
            blobs,
            writer: SnapshotWriter::new(store),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn writer(&self) -> &SnapshotWriter<S> {
        &self.writer
    }

    pub async fn migrate(&self) -> Result<()> {
        self.writer
            .store()
            .migrate()
            .await
            .context("creating snapshot tables")
    }

    /// Capture offers, dedup by offer id, keep the raw capture and persist a snapshot.
    pub async fn run_offers(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let adapter = MicroloansOffersAdapter::new(self.sources.microloans.clone());
        let options = adapter.launch_options(Some(self.config.user_agent.clone()));
        let cookies = CookieStore::new(self.blobs.clone());
        let mut rng = StdRng::from_os_rng();

        let (accumulator, report) = adapter
            .collect(
                self.launcher.as_ref(),
                &options,
                &cookies,
                OfferAccumulator::new(),
                &mut rng,
            )
            .await
            .context("capturing microloan offers")?;
        let duplicates = accumulator.duplicates();
        let offers = accumulator.into_offers();
        info!(
            captured = report.offers_seen,
            unique = offers.len(),
            duplicates,
            "microloans collected"
        );

        save_raw_offers(self.blobs.as_ref(), RAW_OFFERS_BLOB, &offers)
            .await
            .context("saving raw offer capture")?;
        let records = normalize_offers(&offers).context("normalizing offers")?;
        let run_id = self
            .writer
            .write(SnapshotBatch::Microloans(&records))
            .await
            .context("writing microloan snapshot")?;

        Ok(RunSummary {
            run_id,
            pipeline: PipelineKind::Microloans,
            started_at,
            finished_at: Utc::now(),
            captured: offers.len(),
            duplicates,
            rows_written: records.len(),
        })
    }

    /// Scrape reviews, persist the ones not seen in the previous run, then replace
    /// the session state with this run's fingerprints.
    pub async fn run_reviews(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let state = SessionStateStore::reviews(self.blobs.clone());
        let previously_seen = state.load().await.context("loading review session state")?;

        let adapter = FinratingReviewsAdapter::new(self.sources.reviews.clone());
        let options = adapter.launch_options(Some(self.config.user_agent.clone()));
        let raw = adapter
            .collect(self.launcher.as_ref(), &options)
            .await
            .context("scraping reviews")?;
        let records = normalize_reviews(raw, self.config.site_date(started_at));
        let captured = records.len();
        let partition = partition_reviews(records, &previously_seen);
        info!(
            captured,
            new = partition.new.len(),
            seen = partition.seen,
            "reviews classified"
        );

        let run_id = self
            .writer
            .write(SnapshotBatch::Reviews(&partition.new))
            .await
            .context("writing review snapshot")?;
        state
            .save(partition.current.iter())
            .await
            .context("saving review session state")?;

        Ok(RunSummary {
            run_id,
            pipeline: PipelineKind::Reviews,
            started_at,
            finished_at: Utc::now(),
            captured,
            duplicates: partition.seen,
            rows_written: partition.new.len(),
        })
    }

    /// Create tables if absent, then run offers followed by reviews.
    pub async fn run_all(&self) -> Result<Vec<RunSummary>> {
        self.migrate().await?;
        let offers = self
            .run_offers()
            .instrument(info_span!("pipeline", kind = %PipelineKind::Microloans))
            .await?;
        let reviews = self
            .run_reviews()
            .instrument(info_span!("pipeline", kind = %PipelineKind::Reviews))
            .await?;
        Ok(vec![offers, reviews])
    }
}

impl<S: SnapshotStore + 'static> SyncPipeline<S> {
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.as_str();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_all().await {
                    Ok(summaries) => {
                        for summary in summaries {
                            info!(
                                run_id = %summary.run_id,
                                pipeline = %summary.pipeline,
                                rows = summary.rows_written,
                                "scheduled run finished"
                            );
                        }
                    }
                    Err(err) => error!("scheduled run failed: {err:#}"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// `run-all` with configuration from the environment.
pub async fn run_all_from_env() -> Result<Vec<RunSummary>> {
    let pipeline = SyncPipeline::from_config(PipelineConfig::from_env()).await?;
    pipeline.run_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailPoint, MemorySnapshotStore};
    use credisnap_adapters::testing::{ScriptedLauncher, ScriptedSurface};
    use credisnap_adapters::{Control, ControlState, ObservedResponse};
    use credisnap_core::review_fingerprint;
    use credisnap_storage::{load_raw_offers, MemoryBlobStore, REVIEWS_STATE_BLOB};

    const ONE_REVIEW_PAGE: &str = r#"
        <html><body>
          <mt-ugc-review-card>
            <div class="d-flex justify-content-between">
              <div class="p2-bold">Хорошо</div><div>5</div>
            </div>
            <div class="p3 color-gray-strong-text">1 января 2024</div>
            <div class="review-description">Все супер, рекомендую</div>
          </mt-ugc-review-card>
        </body></html>
    "#;

    fn offer_json(id: serde_json::Value, label: &str, rate: &str) -> serde_json::Value {
        serde_json::json!({
            "offer_id": id,
            "ad_label": label,
            "ad_sum_value": "до 30 000 ₽",
            "ad_sum_description": "до 30 дней",
            "law_psk_rate": rate,
            "short": {"min_sum": 1000, "max_sum": 30000, "min_term": 5, "max_term": 30}
        })
    }

    fn offers_response(offers: Vec<serde_json::Value>) -> ObservedResponse {
        ObservedResponse {
            url: "https://credistory.ru/api/mpl_offers_light?limit=20".to_string(),
            status: 200,
            body: serde_json::to_vec(&serde_json::json!({ "offers": offers })).unwrap(),
        }
    }

    fn raw_offer(id: serde_json::Value, label: &str) -> RawOffer {
        RawOffer::from_value(&offer_json(id, label, "100,0 - 292,0%")).unwrap()
    }

    fn offer_record(card_index: i32) -> OfferRecord {
        OfferRecord::from_raw(card_index, &raw_offer(serde_json::json!(card_index), "Займ")).unwrap()
    }

    fn pipeline(
        surface: ScriptedSurface,
        blobs: Arc<MemoryBlobStore>,
        store: MemorySnapshotStore,
    ) -> (SyncPipeline<MemorySnapshotStore>, ScriptedLauncher) {
        let launcher = ScriptedLauncher::new(surface);
        let pipeline = SyncPipeline::new(
            PipelineConfig::default(),
            SourcesFile::default().without_delays(),
            Arc::new(launcher.clone()),
            blobs,
            store,
        );
        (pipeline, launcher)
    }

    #[test]
    fn site_date_follows_moscow_time() {
        use chrono::TimeZone;
        let config = PipelineConfig::default();
        let late_utc = Utc.with_ymd_and_hms(2024, 3, 10, 22, 30, 0).unwrap();
        assert_eq!(config.site_date(late_utc), NaiveDate::from_ymd_opt(2024, 3, 11).unwrap());
        let early_utc = Utc.with_ymd_and_hms(2024, 3, 10, 20, 59, 0).unwrap();
        assert_eq!(config.site_date(early_utc), NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());

        assert_eq!(
            parse_utc_offset("-05:30"),
            FixedOffset::west_opt(5 * 3600 + 30 * 60)
        );
        assert_eq!(parse_utc_offset("+03:00"), Some(config.site_offset));
        assert_eq!(parse_utc_offset("moscow"), None);
    }

    #[test]
    fn first_offer_with_an_id_wins() {
        let mut acc = OfferAccumulator::new();
        assert!(acc.accept(raw_offer(serde_json::json!(17), "first")));
        assert!(!acc.accept(raw_offer(serde_json::json!("17"), "second")));
        assert!(acc.accept(raw_offer(serde_json::json!("a-1"), "third")));
        assert_eq!(acc.duplicates(), 1);
        let offers = acc.into_offers();
        assert_eq!(
            offers.iter().map(|o| o.ad_label.as_str()).collect::<Vec<_>>(),
            vec!["first", "third"]
        );
    }

    #[test]
    fn partition_separates_new_and_seen_reviews() {
        let record = |title: &str| ReviewRecord {
            fingerprint: review_fingerprint(title, "вчера", "текст"),
            title: title.to_string(),
            body: "текст".to_string(),
            rating: 4,
            published_at: None,
        };
        let seen = HashSet::from([record("old").fingerprint]);
        let partition =
            partition_reviews(vec![record("old"), record("new"), record("new")], &seen);

        assert_eq!(partition.seen, 1);
        assert_eq!(partition.new.len(), 1);
        assert_eq!(partition.new[0].title, "new");
        assert_eq!(partition.current.len(), 2);
    }

    #[tokio::test]
    async fn writer_commits_run_and_rows() {
        let store = MemorySnapshotStore::new();
        let writer = SnapshotWriter::new(store.clone());
        let rows = vec![offer_record(1), offer_record(2)];

        let run_id = writer.write(SnapshotBatch::Microloans(&rows)).await.unwrap();
        let run = store.run(run_id).unwrap();
        assert_eq!(run.pipeline, PipelineKind::Microloans);
        assert_eq!(run.status, RunStatus::Ok);
        assert_eq!(run.rows_count, Some(2));
        assert!(run.finished_at.is_some());
        assert_eq!(store.offer_rows(run_id), rows);
    }

    #[tokio::test]
    async fn zero_row_batch_is_a_successful_run() {
        let store = MemorySnapshotStore::new();
        let writer = SnapshotWriter::new(store.clone());
        let run_id = writer.write(SnapshotBatch::Reviews(&[])).await.unwrap();
        let run = store.run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Ok);
        assert_eq!(run.rows_count, Some(0));
    }

    #[tokio::test]
    async fn failure_mid_batch_leaves_no_rows_and_marks_run_error() {
        let store = MemorySnapshotStore::new().fail_at(FailPoint::Row(1));
        let writer = SnapshotWriter::new(store.clone());
        let rows = vec![offer_record(1), offer_record(2), offer_record(3)];

        let err = writer.write(SnapshotBatch::Microloans(&rows)).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Store(_)));
        assert_eq!(store.total_rows(), 0);

        let runs = store.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Error);
        assert_eq!(runs[0].rows_count, None);
        assert!(store.offer_rows(runs[0].run_id).is_empty());
    }

    #[tokio::test]
    async fn commit_failure_is_recorded_as_error_run() {
        let store = MemorySnapshotStore::new().fail_at(FailPoint::Commit);
        let writer = SnapshotWriter::new(store.clone());
        let rows = vec![offer_record(1)];

        assert!(writer.write(SnapshotBatch::Microloans(&rows)).await.is_err());
        assert_eq!(store.total_rows(), 0);
        assert_eq!(store.runs()[0].status, RunStatus::Error);
    }

    #[tokio::test]
    async fn new_review_is_persisted_and_remembered() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.insert(REVIEWS_STATE_BLOB, r#"{"seen_ids": []}"#).await;
        let store = MemorySnapshotStore::new();
        let surface = ScriptedSurface::new().with_content(ONE_REVIEW_PAGE);
        let (pipeline, _launcher) = pipeline(surface.clone(), blobs.clone(), store.clone());

        let summary = pipeline.run_reviews().await.unwrap();
        assert_eq!(summary.rows_written, 1);

        let run = store.run(summary.run_id).unwrap();
        assert_eq!(run.status, RunStatus::Ok);
        assert_eq!(run.rows_count, Some(1));

        let expected = review_fingerprint("Хорошо", "1 января 2024", "Все супер, рекомендую");
        let rows = store.review_rows(summary.run_id);
        assert_eq!(rows[0].fingerprint, expected);
        assert_eq!(rows[0].rating, 5);

        let state = SessionStateStore::reviews(blobs).load().await.unwrap();
        assert_eq!(state, HashSet::from([expected]));
        assert!(surface.is_closed());
    }

    #[tokio::test]
    async fn rerun_over_unchanged_page_writes_nothing_new() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = MemorySnapshotStore::new();
        let surface = ScriptedSurface::new().with_content(ONE_REVIEW_PAGE);
        let (pipeline, _launcher) = pipeline(surface, blobs.clone(), store.clone());

        pipeline.run_reviews().await.unwrap();
        let state_after_first = blobs.get(REVIEWS_STATE_BLOB).await;
        let second = pipeline.run_reviews().await.unwrap();

        assert_eq!(second.rows_written, 0);
        assert_eq!(second.duplicates, 1);
        assert_eq!(store.run(second.run_id).unwrap().rows_count, Some(0));
        assert_eq!(blobs.get(REVIEWS_STATE_BLOB).await, state_after_first);
    }

    #[tokio::test]
    async fn corrupt_state_aborts_before_launch() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.insert(REVIEWS_STATE_BLOB, "{not json").await;
        let store = MemorySnapshotStore::new();
        let (pipeline, launcher) = pipeline(ScriptedSurface::new(), blobs, store.clone());

        assert!(pipeline.run_reviews().await.is_err());
        assert!(launcher.launches().is_empty());
        assert!(store.runs().is_empty());
    }

    #[tokio::test]
    async fn failed_review_write_keeps_previous_state() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.insert(REVIEWS_STATE_BLOB, r#"{"seen_ids": []}"#).await;
        let store = MemorySnapshotStore::new().fail_at(FailPoint::Row(0));
        let surface = ScriptedSurface::new().with_content(ONE_REVIEW_PAGE);
        let (pipeline, _launcher) = pipeline(surface, blobs.clone(), store.clone());

        assert!(pipeline.run_reviews().await.is_err());
        assert!(SessionStateStore::reviews(blobs).load().await.unwrap().is_empty());
        assert_eq!(store.runs()[0].status, RunStatus::Error);
    }

    #[tokio::test]
    async fn offers_run_dedups_and_keeps_raw_capture() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = MemorySnapshotStore::new();
        let surface = ScriptedSurface::new()
            .with_response(offers_response(vec![
                offer_json(serde_json::json!(1), "Первый", "0,0 - 292,0%"),
                offer_json(serde_json::json!(2), "Второй", "100,0%"),
            ]))
            .with_response(offers_response(vec![
                offer_json(serde_json::json!("2"), "Второй повтор", "1,0 - 2,0%"),
                serde_json::json!({"offer_id": 9, "ad_label": "без short"}),
                offer_json(serde_json::json!(3), "Третий", "10,5 - 20,25%"),
            ]));
        let (pipeline, _launcher) = pipeline(surface, blobs.clone(), store.clone());

        let summary = pipeline.run_offers().await.unwrap();
        assert_eq!(summary.captured, 3);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.rows_written, 3);

        let rows = store.offer_rows(summary.run_id);
        assert_eq!(
            rows.iter().map(|r| (r.card_index, r.offer_name.as_str())).collect::<Vec<_>>(),
            vec![(1, "Первый"), (2, "Второй"), (3, "Третий")]
        );
        assert_eq!((rows[1].total_cost_min, rows[1].total_cost_max), (100.0, 100.0));
        assert_eq!((rows[2].total_cost_min, rows[2].total_cost_max), (10.5, 20.25));

        let capture = load_raw_offers(blobs.as_ref(), RAW_OFFERS_BLOB).await.unwrap().unwrap();
        assert_eq!(capture.offers.len(), 3);
        assert_eq!(
            capture.offers[0],
            offer_json(serde_json::json!(1), "Первый", "0,0 - 292,0%")
        );
    }

    #[tokio::test]
    async fn empty_offer_capture_writes_zero_row_run_without_raw_file() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = MemorySnapshotStore::new();
        let (pipeline, _launcher) = pipeline(ScriptedSurface::new(), blobs.clone(), store.clone());

        let summary = pipeline.run_offers().await.unwrap();
        assert_eq!(summary.rows_written, 0);
        assert_eq!(store.run(summary.run_id).unwrap().status, RunStatus::Ok);
        assert!(blobs.get(RAW_OFFERS_BLOB).await.is_none());
    }

    #[tokio::test]
    async fn malformed_rate_aborts_offer_run_before_persisting() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = MemorySnapshotStore::new();
        let surface = ScriptedSurface::new().with_response(offers_response(vec![offer_json(
            serde_json::json!(1),
            "Сломанный",
            "от 0%",
        )]));
        let (pipeline, _launcher) = pipeline(surface.clone(), blobs, store.clone());

        assert!(pipeline.run_offers().await.is_err());
        assert!(store.runs().is_empty());
        assert!(surface.is_closed());
    }

    #[tokio::test]
    async fn run_all_migrates_then_runs_both_pipelines() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = MemorySnapshotStore::new();
        let load_more = ReviewSourceSettings::default().load_more;
        let surface = ScriptedSurface::new()
            .with_content(ONE_REVIEW_PAGE)
            .with_control_states(&load_more, [ControlState::Enabled]);
        let (pipeline, launcher) = pipeline(surface, blobs, store.clone());

        let summaries = pipeline.run_all().await.unwrap();
        assert_eq!(store.migrations(), 1);
        assert_eq!(
            summaries.iter().map(|s| s.pipeline).collect::<Vec<_>>(),
            vec![PipelineKind::Microloans, PipelineKind::Reviews]
        );
        assert_eq!(store.runs().len(), 2);
        assert_eq!(launcher.launches().len(), 2);
        assert_eq!(
            launcher.launches()[0].capture_url_substring.as_deref(),
            Some("mpl_offers_light")
        );
        assert_eq!(launcher.launches()[1].capture_url_substring, None);
    }

    #[tokio::test]
    async fn sources_file_overrides_selected_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.yaml");
        std::fs::write(
            &path,
            "reviews:\n  max_pages: 3\n  load_more:\n    selector: button.more\nmicroloans:\n  humanize:\n    max_idle_rounds: 5\n",
        )
        .unwrap();

        let sources = SourcesFile::load(&path).await.unwrap().with_navigation_timeout(15);
        assert_eq!(sources.reviews.max_pages, 3);
        assert_eq!(sources.reviews.load_more, Control::new("button.more", None));
        assert_eq!(sources.reviews.url, "https://credistory.ru/finrating");
        assert_eq!(sources.microloans.humanize.max_idle_rounds, 5);
        assert_eq!(sources.microloans.humanize.max_scroll_rounds, 2_000);
        assert_eq!(sources.microloans.navigation_timeout_secs, 15);

        let missing = SourcesFile::load(&dir.path().join("absent.yaml")).await.unwrap();
        assert_eq!(missing, SourcesFile::default());
    }

    #[tokio::test]
    async fn scheduler_is_not_built_when_disabled() {
        let (pipeline, _launcher) = pipeline(
            ScriptedSurface::new(),
            Arc::new(MemoryBlobStore::new()),
            MemorySnapshotStore::new(),
        );
        let pipeline = Arc::new(pipeline);
        assert!(pipeline.maybe_build_scheduler().await.unwrap().is_none());
    }
}
