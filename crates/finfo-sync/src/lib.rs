//! Incremental update pipeline: frontier, fetch pool, record transform and ingestion.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Local, NaiveDate, Utc};
use finfo_adapters::{ExtractError, Extractor, FetchOutcome, FinfoExtractor, DEFAULT_BASE_URL};
use finfo_core::{Article, PostRow, Topic, UserRow, ORIGINAL_POST_FLOOR};
use finfo_storage::{
    DatabaseConfig, HttpClientConfig, MySqlGateway, RecordArchive, StorageError, StorageGateway,
    DEFAULT_USER_AGENT,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "finfo-sync";

pub const DEFAULT_CONFIG_FILE: &str = "finfo.yaml";
pub const DEFAULT_MAX_WORKERS: usize = 10;
/// The forum opened in 2021 and its pages only show `MM/DD`.
pub const DEFAULT_ASSUMED_YEAR: i32 = 2021;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UpdateSection {
    pub max_workers: usize,
    pub assumed_year: i32,
    pub archive_dir: Option<PathBuf>,
}

impl Default for UpdateSection {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            assumed_year: DEFAULT_ASSUMED_YEAR,
            archive_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExtractorSection {
    pub base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: Option<u64>,
}

impl Default for ExtractorSection {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: None,
        }
    }
}

/// On-disk YAML layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub database: DatabaseConfig,
    pub update: UpdateSection,
    pub extractor: ExtractorSection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub database: DatabaseConfig,
    pub max_workers: usize,
    pub assumed_year: i32,
    pub archive_dir: Option<PathBuf>,
    pub base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
    }
}

impl SyncConfig {
    /// Defaults, then the YAML file (explicit path, or `finfo.yaml` when present), then env.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => read_config_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                read_config_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => ConfigFile::default(),
        };
        let mut config = Self::from_file(file);
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(file: ConfigFile) -> Self {
        Self {
            database: file.database,
            max_workers: file.update.max_workers,
            assumed_year: file.update.assumed_year,
            archive_dir: file.update.archive_dir,
            base_url: file.extractor.base_url,
            user_agent: file.extractor.user_agent,
            http_timeout_secs: file.extractor.http_timeout_secs,
        }
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Some(v) = lookup("FINFO_MAX_WORKERS") {
            self.max_workers = v
                .parse()
                .with_context(|| format!("parsing FINFO_MAX_WORKERS={v}"))?;
        }
        if let Some(v) = lookup("FINFO_ASSUMED_YEAR") {
            self.assumed_year = v
                .parse()
                .with_context(|| format!("parsing FINFO_ASSUMED_YEAR={v}"))?;
        }
        if let Some(v) = lookup("FINFO_ARCHIVE_DIR") {
            self.archive_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FINFO_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = lookup("FINFO_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = lookup("FINFO_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = Some(
                v.parse()
                    .with_context(|| format!("parsing FINFO_HTTP_TIMEOUT_SECS={v}"))?,
            );
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            bail!("max_workers must be at least 1");
        }
        if self.base_url.trim().is_empty() {
            bail!("extractor base_url must not be empty");
        }
        Ok(())
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout_secs.map(Duration::from_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn update_options(&self) -> UpdateOptions {
        UpdateOptions {
            max_workers: self.max_workers,
            assumed_year: self.assumed_year,
        }
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

/// Run-fatal failures. Per-post problems never surface here.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote listing failed: {0}")]
    Listing(#[source] ExtractError),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("fetch worker aborted: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Ids to fetch: `[local_max, remote_max]`, or nothing when the remote is behind.
///
/// `local_max` is re-fetched in case the previous run stored it only partially.
pub fn compute_frontier(local_max: u64, remote_max: u64) -> Vec<u64> {
    if remote_max < local_max {
        return Vec::new();
    }
    (local_max..=remote_max).collect()
}

#[derive(Debug, Default)]
pub struct FetchReport {
    /// Records in arrival order.
    pub records: Vec<Article>,
    pub not_found: Vec<u64>,
    pub failed: Vec<u64>,
}

impl FetchReport {
    pub fn attempted(&self) -> usize {
        self.records.len() + self.not_found.len() + self.failed.len()
    }
}

/// Fixed-size set of workers draining one shared backlog.
#[derive(Debug, Clone, Copy)]
pub struct FetchPool {
    workers: usize,
}

impl FetchPool {
    /// Pool of `workers` tasks. A count of zero is raised to one so `drain` always makes progress.
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Fetches every backlog id exactly once and returns when all workers are done.
    pub async fn drain(
        &self,
        extractor: Arc<dyn Extractor>,
        backlog: Vec<u64>,
    ) -> Result<FetchReport, SyncError> {
        let queue = Arc::new(Mutex::new(VecDeque::from(backlog)));
        let report = Arc::new(Mutex::new(FetchReport::default()));

        let mut workers = JoinSet::new();
        for worker in 0..self.workers {
            let queue = Arc::clone(&queue);
            let report = Arc::clone(&report);
            let extractor = Arc::clone(&extractor);
            workers.spawn(
                async move {
                    loop {
                        let claimed = queue.lock().await.pop_front();
                        let Some(post_id) = claimed else {
                            break;
                        };
                        info!(post_id, "fetching post");
                        match extractor.fetch(post_id).await {
                            Ok(FetchOutcome::Found(article)) => {
                                info!(post_id, replies = article.replies.len(), "post fetched");
                                report.lock().await.records.push(article);
                            }
                            Ok(FetchOutcome::NotFound) => {
                                info!(post_id, "post missing or deleted, skipping");
                                report.lock().await.not_found.push(post_id);
                            }
                            Err(err) => {
                                warn!(post_id, error = %err, "fetch failed, skipping");
                                report.lock().await.failed.push(post_id);
                            }
                        }
                    }
                }
                .instrument(info_span!("fetch_worker", worker)),
            );
        }

        while let Some(joined) = workers.join_next().await {
            joined?;
        }

        let mut collected = report.lock().await;
        Ok(std::mem::take(&mut *collected))
    }
}

/// Run-scoped source of author surrogate ids: base snapshot plus tuples produced so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurrogateCounter {
    base: u64,
    produced: u64,
}

impl SurrogateCounter {
    pub fn new(base: u64) -> Self {
        Self { base, produced: 0 }
    }

    pub fn produced(&self) -> u64 {
        self.produced
    }

    pub fn next_id(&mut self) -> u64 {
        self.produced += 1;
        self.base + self.produced
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("post {post_id}: unknown topic {label:?}")]
    UnknownTopic { post_id: u64, label: String },
    #[error("post {post_id}: malformed date {raw:?}")]
    MalformedDate { post_id: u64, raw: String },
    #[error("post {post_id}: date {date} is after {reference}; cross-year runs are unsupported")]
    DateAfterReference {
        post_id: u64,
        date: NaiveDate,
        reference: NaiveDate,
    },
}

/// Post and user tuples in production order; `users[i]` authored `posts[i]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TupleBatch {
    pub posts: Vec<PostRow>,
    pub users: Vec<UserRow>,
}

impl TupleBatch {
    pub fn with_capacity(rows: usize) -> Self {
        Self {
            posts: Vec::with_capacity(rows),
            users: Vec::with_capacity(rows),
        }
    }

    pub fn append(&mut self, mut other: TupleBatch) {
        self.posts.append(&mut other.posts);
        self.users.append(&mut other.users);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecordTransformer {
    assumed_year: i32,
    reference_date: NaiveDate,
}

impl RecordTransformer {
    pub fn new(assumed_year: i32, reference_date: NaiveDate) -> Self {
        Self {
            assumed_year,
            reference_date,
        }
    }

    /// `MM/DD` in the assumed year. Dates past the reference date cannot be placed.
    pub fn resolve_date(&self, post_id: u64, raw: &str) -> Result<NaiveDate, TransformError> {
        let malformed = || TransformError::MalformedDate {
            post_id,
            raw: raw.to_string(),
        };
        let (month, day) = raw.trim().split_once('/').ok_or_else(malformed)?;
        let month: u32 = month.trim().parse().map_err(|_| malformed())?;
        let day: u32 = day.trim().parse().map_err(|_| malformed())?;
        let date = NaiveDate::from_ymd_opt(self.assumed_year, month, day).ok_or_else(malformed)?;
        if date > self.reference_date {
            return Err(TransformError::DateAfterReference {
                post_id,
                date,
                reference: self.reference_date,
            });
        }
        Ok(date)
    }

    /// All-or-nothing: on error no tuples are returned and `counter` is left untouched.
    pub fn transform(
        &self,
        article: &Article,
        counter: &mut SurrogateCounter,
    ) -> Result<TupleBatch, TransformError> {
        let topic = Topic::from_label(&article.topic_label).ok_or_else(|| {
            TransformError::UnknownTopic {
                post_id: article.id,
                label: article.topic_label.clone(),
            }
        })?;
        let mut ids = *counter;
        let mut batch = TupleBatch::with_capacity(article.replies.len() + 1);

        batch.users.push(UserRow {
            display_name: article.author.user_name.clone(),
            is_insurer: article.author.is_insurer(),
        });
        batch.posts.push(PostRow {
            post_id: article.id,
            title: article.title.clone(),
            floor: ORIGINAL_POST_FLOOR,
            create_time: self.resolve_date(article.id, &article.date_time)?,
            author_id: ids.next_id(),
            topic_id: topic.ordinal(),
            content: article.content.clone(),
        });

        for reply in &article.replies {
            batch.users.push(UserRow {
                display_name: reply.author.user_name.clone(),
                is_insurer: reply.author.is_insurer(),
            });
            batch.posts.push(PostRow {
                post_id: article.id,
                title: article.title.clone(),
                floor: reply.floor,
                create_time: self.resolve_date(article.id, &reply.date_time)?,
                author_id: ids.next_id(),
                topic_id: topic.ordinal(),
                content: reply.content.clone(),
            });
        }

        *counter = ids;
        Ok(batch)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub users_inserted: u64,
    pub users_skipped: usize,
    pub posts_inserted: u64,
}

/// Keeps decorated names unconditionally; undecorated names only when not yet known.
pub fn select_new_users(
    existing: impl IntoIterator<Item = String>,
    candidates: Vec<UserRow>,
) -> (Vec<UserRow>, usize) {
    let mut known: HashSet<String> = existing.into_iter().collect();
    let mut queued = Vec::with_capacity(candidates.len());
    let mut skipped = 0;
    for candidate in candidates {
        if candidate.is_decorated() {
            queued.push(candidate);
        } else if known.insert(candidate.display_name.clone()) {
            queued.push(candidate);
        } else {
            skipped += 1;
        }
    }
    (queued, skipped)
}

/// Deduplicates users against the store, then appends users and posts.
pub async fn ingest(
    storage: &dyn StorageGateway,
    batch: TupleBatch,
) -> Result<IngestReport, StorageError> {
    let existing = storage.user_names().await?;
    let (new_users, users_skipped) = select_new_users(existing, batch.users);
    let users_inserted = storage.insert_users(&new_users).await?;
    let posts_inserted = storage.insert_posts(&batch.posts).await?;
    info!(users_inserted, users_skipped, posts_inserted, "ingested batch");
    Ok(IngestReport {
        users_inserted,
        users_skipped,
        posts_inserted,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    pub max_workers: usize,
    pub assumed_year: i32,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            assumed_year: DEFAULT_ASSUMED_YEAR,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub local_max: u64,
    pub remote_max: u64,
    pub backlog: usize,
    pub fetched: usize,
    pub not_found: Vec<u64>,
    pub failed: Vec<u64>,
    pub dropped_records: Vec<u64>,
    pub ingest: IngestReport,
}

impl UpdateSummary {
    pub fn is_up_to_date(&self) -> bool {
        self.backlog == 0
    }
}

pub struct UpdatePipeline {
    extractor: Arc<dyn Extractor>,
    storage: Arc<dyn StorageGateway>,
    options: UpdateOptions,
    archive: Option<RecordArchive>,
}

impl UpdatePipeline {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        storage: Arc<dyn StorageGateway>,
        options: UpdateOptions,
    ) -> Self {
        Self {
            extractor,
            storage,
            options,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: RecordArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub async fn run_once(&self) -> Result<UpdateSummary, SyncError> {
        self.run_once_at(Local::now().date_naive()).await
    }

    /// One update with `reference_date` as "today" for date reconstruction.
    pub async fn run_once_at(&self, reference_date: NaiveDate) -> Result<UpdateSummary, SyncError> {
        let run_id = Uuid::new_v4();
        self.run(run_id, reference_date)
            .instrument(info_span!("update_run", %run_id))
            .await
    }

    async fn run(
        &self,
        run_id: Uuid,
        reference_date: NaiveDate,
    ) -> Result<UpdateSummary, SyncError> {
        let started_at = Utc::now();
        if self.options.assumed_year != reference_date.year() {
            warn!(
                assumed_year = self.options.assumed_year,
                current_year = reference_date.year(),
                "assumed year differs from the current year; posts from other years will be rejected or mis-dated"
            );
        }

        let local_max = self.storage.max_post_id().await?.unwrap_or(0);
        let user_base = self.storage.max_user_id().await?.unwrap_or(0);
        info!("updating post list");
        let remote_max = self
            .extractor
            .list_latest()
            .await
            .map_err(SyncError::Listing)?;
        let backlog = compute_frontier(local_max, remote_max);
        info!(local_max, remote_max, backlog = backlog.len(), "computed frontier");

        let mut summary = UpdateSummary {
            run_id,
            started_at,
            finished_at: started_at,
            local_max,
            remote_max,
            backlog: backlog.len(),
            fetched: 0,
            not_found: Vec::new(),
            failed: Vec::new(),
            dropped_records: Vec::new(),
            ingest: IngestReport::default(),
        };
        if backlog.is_empty() {
            info!("database is already up to date");
            summary.finished_at = Utc::now();
            return Ok(summary);
        }

        let pool = FetchPool::new(self.options.max_workers);
        let report = pool.drain(Arc::clone(&self.extractor), backlog).await?;
        summary.fetched = report.records.len();
        summary.not_found = report.not_found;
        summary.failed = report.failed;
        summary.not_found.sort_unstable();
        summary.failed.sort_unstable();

        let mut records = report.records;
        records.sort_by_key(|record| record.id);
        self.archive_records(&records).await;

        let transformer = RecordTransformer::new(self.options.assumed_year, reference_date);
        let mut counter = SurrogateCounter::new(user_base);
        let mut batch = TupleBatch::default();
        for record in &records {
            match transformer.transform(record, &mut counter) {
                Ok(tuples) => batch.append(tuples),
                Err(err) => {
                    warn!(post_id = record.id, error = %err, "dropping record");
                    summary.dropped_records.push(record.id);
                }
            }
        }

        summary.ingest = ingest(self.storage.as_ref(), batch).await?;
        summary.finished_at = Utc::now();
        info!(
            fetched = summary.fetched,
            not_found = summary.not_found.len(),
            failed = summary.failed.len(),
            dropped = summary.dropped_records.len(),
            "update complete"
        );
        Ok(summary)
    }

    async fn archive_records(&self, records: &[Article]) {
        let Some(archive) = &self.archive else {
            return;
        };
        for record in records {
            if let Err(err) = archive.store_record(record.id, record).await {
                warn!(post_id = record.id, error = %err, "archiving record failed");
            }
        }
    }
}

/// Connects the MySQL store and the finfo.tw extractor and runs one update.
pub async fn run_update(config: &SyncConfig) -> Result<UpdateSummary> {
    let storage = MySqlGateway::connect(&config.database)
        .await
        .context("unable to log into database")?;
    let extractor = FinfoExtractor::new(config.base_url.clone(), config.http_client_config())?;
    let mut pipeline = UpdatePipeline::new(
        Arc::new(extractor),
        Arc::new(storage),
        config.update_options(),
    );
    if let Some(dir) = &config.archive_dir {
        pipeline = pipeline.with_archive(RecordArchive::new(dir));
    }
    Ok(pipeline.run_once().await?)
}
