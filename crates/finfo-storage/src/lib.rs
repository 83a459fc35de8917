//! Storage gateways, raw record archive and HTTP fetch utilities for finfo.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use finfo_core::{PostRow, StoredUser, UserRow};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::{MySql, QueryBuilder};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "finfo-storage";

/// Desktop browser agent; the forum serves a reduced page to unknown agents.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/92.0.4515.159 Safari/537.36";

/// Rows per multi-row INSERT statement.
const INSERT_CHUNK_ROWS: usize = 500;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("storage rejected write: {0}")]
    Rejected(String),
}

/// Relational store the update pipeline reads from and appends to.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Highest stored `posts.post_id`, `None` when the table is empty.
    async fn max_post_id(&self) -> Result<Option<u64>, StorageError>;

    /// Highest stored `users.surrogate_id`, `None` when the table is empty.
    async fn max_user_id(&self) -> Result<Option<u64>, StorageError>;

    async fn user_names(&self) -> Result<Vec<String>, StorageError>;

    /// Appends users in order; the store assigns consecutive surrogate ids.
    async fn insert_users(&self, rows: &[UserRow]) -> Result<u64, StorageError>;

    async fn insert_posts(&self, rows: &[PostRow]) -> Result<u64, StorageError>;
}

/// Login settings for the MySQL/MariaDB store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Full `mysql://` URL; takes precedence over the individual fields.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 3306,
            user: "py-finfo".to_string(),
            password: None,
            database: "finfo".to_string(),
        }
    }
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> Result<MySqlConnectOptions, StorageError> {
        if let Some(url) = &self.url {
            return Ok(MySqlConnectOptions::from_str(url)?);
        }
        let mut options = MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(&self.database);
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        Ok(options)
    }

    /// Connection target without credentials, for logs.
    pub fn redacted(&self) -> String {
        match &self.url {
            Some(url) => match url.rsplit_once('@') {
                Some((_, target)) => format!("mysql://***@{target}"),
                None => url.clone(),
            },
            None => format!("{}@{}:{}/{}", self.user, self.host, self.port, self.database),
        }
    }
}

/// Gateway over a single MySQL connection.
#[derive(Debug, Clone)]
pub struct MySqlGateway {
    pool: MySqlPool,
}

impl MySqlGateway {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StorageError> {
        let options = config.connect_options()?;
        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        info!(database = %config.redacted(), "connected to database");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageGateway for MySqlGateway {
    async fn max_post_id(&self) -> Result<Option<u64>, StorageError> {
        let max = sqlx::query_scalar::<_, Option<u64>>(
            "SELECT CAST(MAX(post_id) AS UNSIGNED) FROM posts",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(max)
    }

    async fn max_user_id(&self) -> Result<Option<u64>, StorageError> {
        let max = sqlx::query_scalar::<_, Option<u64>>(
            "SELECT CAST(MAX(surrogate_id) AS UNSIGNED) FROM users",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(max)
    }

    async fn user_names(&self) -> Result<Vec<String>, StorageError> {
        let names = sqlx::query_scalar::<_, String>("SELECT display_name FROM users")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    async fn insert_users(&self, rows: &[UserRow]) -> Result<u64, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;
        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<MySql> =
                QueryBuilder::new("INSERT INTO users (display_name, is_insurer) ");
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.display_name.clone())
                    .push_bind(row.is_insurer);
            });
            affected += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn insert_posts(&self, rows: &[PostRow]) -> Result<u64, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;
        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<MySql> = QueryBuilder::new(
                "INSERT INTO posts (post_id, title, floor, create_time, author_id, topic_id, content) ",
            );
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.post_id)
                    .push_bind(row.title.clone())
                    .push_bind(row.floor)
                    .push_bind(row.create_time)
                    .push_bind(row.author_id)
                    .push_bind(row.topic_id)
                    .push_bind(row.content.clone());
            });
            affected += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    posts: Vec<PostRow>,
    users: Vec<StoredUser>,
    reject_writes: bool,
}

/// In-process gateway with the same append-only, auto-increment semantics as the SQL tables.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_posts(&self, rows: impl IntoIterator<Item = PostRow>) {
        self.state.lock().await.posts.extend(rows);
    }

    pub async fn seed_users(&self, rows: impl IntoIterator<Item = UserRow>) {
        let mut state = self.state.lock().await;
        for row in rows {
            push_user(&mut state.users, row);
        }
    }

    /// Makes every subsequent insert fail, as a dropped connection would.
    pub async fn reject_writes(&self, reject: bool) {
        self.state.lock().await.reject_writes = reject;
    }

    pub async fn posts(&self) -> Vec<PostRow> {
        self.state.lock().await.posts.clone()
    }

    pub async fn users(&self) -> Vec<StoredUser> {
        self.state.lock().await.users.clone()
    }
}

fn push_user(users: &mut Vec<StoredUser>, row: UserRow) {
    let surrogate_id = users.last().map_or(0, |u| u.surrogate_id) + 1;
    users.push(StoredUser {
        surrogate_id,
        display_name: row.display_name,
        is_insurer: row.is_insurer,
    });
}

#[async_trait]
impl StorageGateway for MemoryGateway {
    async fn max_post_id(&self) -> Result<Option<u64>, StorageError> {
        Ok(self.state.lock().await.posts.iter().map(|p| p.post_id).max())
    }

    async fn max_user_id(&self) -> Result<Option<u64>, StorageError> {
        Ok(self.state.lock().await.users.iter().map(|u| u.surrogate_id).max())
    }

    async fn user_names(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .state
            .lock()
            .await
            .users
            .iter()
            .map(|u| u.display_name.clone())
            .collect())
    }

    async fn insert_users(&self, rows: &[UserRow]) -> Result<u64, StorageError> {
        let mut state = self.state.lock().await;
        if state.reject_writes {
            return Err(StorageError::Rejected("users insert refused".to_string()));
        }
        for row in rows {
            push_user(&mut state.users, row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn insert_posts(&self, rows: &[PostRow]) -> Result<u64, StorageError> {
        let mut state = self.state.lock().await;
        if state.reject_writes {
            return Err(StorageError::Rejected("posts insert refused".to_string()));
        }
        state.posts.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedRecord {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// On-disk archive of fetched records, one directory per post id.
#[derive(Debug, Clone)]
pub struct RecordArchive {
    root: PathBuf,
}

impl RecordArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn record_relative_path(&self, post_id: u64, content_hash: &str) -> PathBuf {
        PathBuf::from(post_id.to_string()).join(format!("{content_hash}.json"))
    }

    /// Serialize `record` as pretty JSON and store it under a hash-addressed path.
    pub async fn store_record<T: Serialize>(
        &self,
        post_id: u64,
        record: &T,
    ) -> anyhow::Result<ArchivedRecord> {
        let bytes = serde_json::to_vec_pretty(record)
            .with_context(|| format!("serializing record {post_id}"))?;
        self.store_bytes(post_id, &bytes).await
    }

    /// Writes through a temp file and rename so readers never see partial records.
    pub async fn store_bytes(&self, post_id: u64, bytes: &[u8]) -> anyhow::Result<ArchivedRecord> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.record_relative_path(post_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = self.root.join(post_id.to_string());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |deduplicated| ArchivedRecord {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp archive {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(archived(false))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Per-request timeout; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 404, .. })
    }
}

/// Single-attempt HTTP GET client. Failures surface to the caller unretried.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.get(url).instrument(info_span!("http_fetch", url)).await
    }

    async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            final_url,
            body,
        })
    }
}
