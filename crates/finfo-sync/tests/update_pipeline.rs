use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use finfo_adapters::{ExtractError, Extractor, FetchOutcome};
use finfo_core::{Article, Author, Identity, PostRow, Reply, UserRow};
use finfo_storage::{MemoryGateway, RecordArchive, StorageGateway};
use finfo_sync::{FetchPool, SyncError, UpdateOptions, UpdatePipeline};
use tokio::sync::Barrier;

/// In-memory forum: a fixed listing head plus a map of pages.
#[derive(Default)]
struct ScriptedExtractor {
    latest: Option<u64>,
    articles: HashMap<u64, Article>,
    failing: HashSet<u64>,
    calls: Mutex<Vec<u64>>,
    /// The first `n` fetches wait here together.
    gate: Option<(usize, Barrier)>,
    started: AtomicUsize,
}

impl ScriptedExtractor {
    fn new(latest: u64, articles: impl IntoIterator<Item = Article>) -> Self {
        Self {
            latest: Some(latest),
            articles: articles.into_iter().map(|a| (a.id, a)).collect(),
            ..Self::default()
        }
    }

    fn failing(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.failing.extend(ids);
        self
    }

    fn gated(mut self, workers: usize) -> Self {
        self.gate = Some((workers, Barrier::new(workers)));
        self
    }

    fn calls(&self) -> Vec<u64> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn list_latest(&self) -> Result<u64, ExtractError> {
        self.latest
            .ok_or_else(|| ExtractError::Layout("listing unavailable".to_string()))
    }

    async fn fetch(&self, post_id: u64) -> Result<FetchOutcome, ExtractError> {
        self.calls.lock().unwrap().push(post_id);
        if let Some((workers, barrier)) = &self.gate {
            if self.started.fetch_add(1, Ordering::SeqCst) < *workers {
                barrier.wait().await;
            }
        }
        if self.failing.contains(&post_id) {
            return Err(ExtractError::Layout(format!("broken page {post_id}")));
        }
        Ok(match self.articles.get(&post_id) {
            Some(article) => FetchOutcome::Found(article.clone()),
            None => FetchOutcome::NotFound,
        })
    }
}

fn reference_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2021, 12, 31).unwrap()
}

fn options(max_workers: usize) -> UpdateOptions {
    UpdateOptions {
        max_workers,
        assumed_year: 2021,
    }
}

fn article(id: u64, author: &str, replies: &[(u32, &str, Identity)]) -> Article {
    Article {
        id,
        title: format!("thread {id}"),
        topic_label: "理賠申請".to_string(),
        date_time: "05/01".to_string(),
        author: Author::new(author, Identity::Insurer),
        content: format!("body of {id}"),
        replies: replies
            .iter()
            .map(|(floor, name, identity)| Reply {
                id: None,
                floor: *floor,
                date_time: "05/02".to_string(),
                author: Author::new(*name, *identity),
                content: format!("reply {floor}"),
                belongs_to: id,
            })
            .collect(),
    }
}

fn stored_post(post_id: u64, floor: u32) -> PostRow {
    PostRow {
        post_id,
        title: format!("thread {post_id}"),
        floor,
        create_time: NaiveDate::from_ymd_opt(2021, 4, 1).unwrap(),
        author_id: 1,
        topic_id: 3,
        content: "stored".to_string(),
    }
}

fn user(name: &str, is_insurer: bool) -> UserRow {
    UserRow {
        display_name: name.to_string(),
        is_insurer,
    }
}

#[tokio::test]
async fn update_fetches_frontier_and_appends_rows() {
    let storage = Arc::new(MemoryGateway::new());
    storage.seed_posts([stored_post(5, 0)]).await;
    storage.seed_users([user("甲*", true)]).await;
    let extractor = Arc::new(ScriptedExtractor::new(
        7,
        [
            article(5, "甲*", &[]),
            article(7, "乙*", &[(1, "林業務", Identity::Salesman)]),
        ],
    ));

    let pipeline = UpdatePipeline::new(extractor.clone(), storage.clone(), options(3));
    let summary = pipeline.run_once_at(reference_date()).await.unwrap();

    let mut calls = extractor.calls();
    calls.sort_unstable();
    assert_eq!(calls, vec![5, 6, 7]);
    assert_eq!(summary.local_max, 5);
    assert_eq!(summary.remote_max, 7);
    assert_eq!(summary.backlog, 3);
    assert_eq!(summary.fetched, 2);
    assert_eq!(summary.not_found, vec![6]);
    assert!(summary.failed.is_empty());

    let posts = storage.posts().await;
    let keys: Vec<(u64, u32)> = posts.iter().map(|p| (p.post_id, p.floor)).collect();
    // Post 5 was re-fetched, so its original row now appears twice.
    assert_eq!(keys, vec![(5, 0), (5, 0), (7, 0), (7, 1)]);
    let author_ids: Vec<u64> = posts[1..].iter().map(|p| p.author_id).collect();
    assert_eq!(author_ids, vec![2, 3, 4]);
    assert!(posts[1..].iter().all(|p| p.topic_id == 3));
    assert_eq!(
        posts[3].create_time,
        NaiveDate::from_ymd_opt(2021, 5, 2).unwrap()
    );

    assert_eq!(storage.max_post_id().await.unwrap(), Some(7));
    assert_eq!(summary.ingest.posts_inserted, 3);
}

#[tokio::test]
async fn remote_behind_local_is_up_to_date() {
    let storage = Arc::new(MemoryGateway::new());
    storage.seed_posts([stored_post(12, 0)]).await;
    let extractor = Arc::new(ScriptedExtractor::new(11, Vec::new()));

    let pipeline = UpdatePipeline::new(extractor.clone(), storage.clone(), options(4));
    let summary = pipeline.run_once_at(reference_date()).await.unwrap();

    assert!(summary.is_up_to_date());
    assert!(extractor.calls().is_empty());
    assert_eq!(storage.posts().await.len(), 1);
}

#[tokio::test]
async fn listing_failure_aborts_before_any_fetch() {
    let storage = Arc::new(MemoryGateway::new());
    let extractor = Arc::new(ScriptedExtractor::default());

    let pipeline = UpdatePipeline::new(extractor.clone(), storage.clone(), options(2));
    let err = pipeline.run_once_at(reference_date()).await.unwrap_err();

    assert!(matches!(err, SyncError::Listing(_)));
    assert!(extractor.calls().is_empty());
    assert!(storage.posts().await.is_empty());
}

#[tokio::test]
async fn only_unknown_or_decorated_users_are_added() {
    let storage = Arc::new(MemoryGateway::new());
    storage.seed_posts([stored_post(3, 0)]).await;
    storage
        .seed_users([user("Alice", false), user("Bob*", true)])
        .await;
    let extractor = Arc::new(ScriptedExtractor::new(
        3,
        [article(
            3,
            "Bob*",
            &[
                (1, "Alice", Identity::Salesman),
                (2, "Alice", Identity::Salesman),
            ],
        )],
    ));

    let pipeline = UpdatePipeline::new(extractor, storage.clone(), options(1));
    let summary = pipeline.run_once_at(reference_date()).await.unwrap();

    let names: Vec<String> = storage
        .users()
        .await
        .into_iter()
        .map(|u| u.display_name)
        .collect();
    assert_eq!(names, vec!["Alice", "Bob*", "Bob*"]);
    assert_eq!(summary.ingest.users_inserted, 1);
    assert_eq!(summary.ingest.users_skipped, 2);
}

#[tokio::test]
async fn pool_fetches_each_id_exactly_once() {
    for workers in [1, 2, 3, 10, 32] {
        let backlog: Vec<u64> = (100..125).collect();
        let extractor = Arc::new(ScriptedExtractor::new(124, Vec::new()));
        let report = FetchPool::new(workers)
            .drain(extractor.clone(), backlog.clone())
            .await
            .unwrap();

        let mut calls = extractor.calls();
        assert_eq!(calls.len(), backlog.len(), "workers = {workers}");
        calls.sort_unstable();
        assert_eq!(calls, backlog, "workers = {workers}");
        assert_eq!(report.attempted(), backlog.len());
    }
}

#[tokio::test]
async fn pool_runs_workers_concurrently() {
    let workers = 4;
    let extractor = Arc::new(ScriptedExtractor::new(20, Vec::new()).gated(workers));
    let drained = tokio::time::timeout(
        Duration::from_secs(5),
        FetchPool::new(workers).drain(extractor.clone(), (1..=10).collect()),
    )
    .await
    .expect("workers never met at the barrier")
    .unwrap();

    assert_eq!(drained.not_found.len(), 10);
}

#[tokio::test]
async fn storage_failure_is_fatal() {
    let storage = Arc::new(MemoryGateway::new());
    storage.reject_writes(true).await;
    let extractor = Arc::new(ScriptedExtractor::new(1, [article(1, "甲*", &[])]));

    let pipeline = UpdatePipeline::new(extractor, storage.clone(), options(2));
    let err = pipeline.run_once_at(reference_date()).await.unwrap_err();

    assert!(matches!(err, SyncError::Storage(_)));
    assert!(storage.posts().await.is_empty());
}

#[tokio::test]
async fn failed_fetches_and_bad_records_are_skipped() {
    let storage = Arc::new(MemoryGateway::new());
    let mut bad_topic = article(2, "丙*", &[]);
    bad_topic.topic_label = "閒聊".to_string();
    let extractor = Arc::new(
        ScriptedExtractor::new(
            3,
            [article(0, "甲*", &[]), bad_topic, article(3, "丁*", &[])],
        )
        .failing([1]),
    );

    let pipeline = UpdatePipeline::new(extractor, storage.clone(), options(2));
    let summary = pipeline.run_once_at(reference_date()).await.unwrap();

    assert_eq!(summary.failed, vec![1]);
    assert_eq!(summary.dropped_records, vec![2]);
    let posts = storage.posts().await;
    let ids: Vec<u64> = posts.iter().map(|p| p.post_id).collect();
    assert_eq!(ids, vec![0, 3]);
    // The dropped record consumed no surrogate ids.
    let author_ids: Vec<u64> = posts.iter().map(|p| p.author_id).collect();
    assert_eq!(author_ids, vec![1, 2]);
}

#[tokio::test]
async fn fetched_records_are_archived() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(MemoryGateway::new());
    let extractor = Arc::new(ScriptedExtractor::new(
        1,
        [article(0, "甲*", &[]), article(1, "乙*", &[])],
    ));

    let pipeline = UpdatePipeline::new(extractor, storage, options(2))
        .with_archive(RecordArchive::new(dir.path()));
    pipeline.run_once_at(reference_date()).await.unwrap();

    for post_id in [0, 1] {
        let entries = std::fs::read_dir(dir.path().join(post_id.to_string()))
            .unwrap()
            .count();
        assert_eq!(entries, 1, "post {post_id}");
    }
}

#[tokio::test]
async fn archive_failure_does_not_abort_the_update() {
    let dir = tempfile::tempdir().unwrap();
    let not_a_dir = dir.path().join("archive");
    std::fs::write(&not_a_dir, b"occupied").unwrap();
    let storage = Arc::new(MemoryGateway::new());
    let extractor = Arc::new(ScriptedExtractor::new(0, [article(0, "甲*", &[])]));

    let pipeline = UpdatePipeline::new(extractor, storage.clone(), options(1))
        .with_archive(RecordArchive::new(&not_a_dir));
    let summary = pipeline.run_once_at(reference_date()).await.unwrap();

    assert_eq!(summary.fetched, 1);
    assert_eq!(summary.ingest.posts_inserted, 1);
    assert_eq!(storage.posts().await.len(), 1);
    assert!(not_a_dir.is_file());
}

#[tokio::test]
async fn zero_workers_still_drain_the_backlog() {
    let extractor = Arc::new(ScriptedExtractor::new(3, Vec::new()));
    let report = FetchPool::new(0)
        .drain(extractor.clone(), vec![1, 2, 3])
        .await
        .unwrap();

    assert_eq!(extractor.calls(), vec![1, 2, 3]);
    assert_eq!(report.not_found, vec![1, 2, 3]);
}
