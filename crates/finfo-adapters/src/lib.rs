//! Extractor contract + the finfo.tw HTML extractor.

use async_trait::async_trait;
use finfo_core::{Article, Author, Identity, Reply};
use finfo_storage::{FetchError, HttpClientConfig, HttpFetcher};
use scraper::{ElementRef, Html, Node, Selector};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "finfo-adapters";

pub const DEFAULT_BASE_URL: &str = "https://finfo.tw/posts";

const LATEST_LINK: &str = "a.text-decoration-none.d-flex.justify-content-center.row";
const TITLE: &str = "h1.mb-16-px.display-2.display-1-sm";
const POST_CONTENT: &str = "div.post-content";
const COMMENT_CONTENT: &str = "div.comment-content";
const ENTRY_HEADER: &str = "div.d-flex.justify-content-start.mb-24-px";
const META_LINE: &str = "div.t6.text-gray-1";
const AUTHOR_NAME: &str = "span.font-weight-bold";

/// Separator between topic/floor and date in meta lines (U+FF0E, not an ASCII dot).
const META_SEPARATOR: char = '．';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Found(Article),
    NotFound,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected page layout: {0}")]
    Layout(String),
    #[error("invalid selector {selector}: {reason}")]
    Selector { selector: String, reason: String },
}

/// Source of forum records.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Id of the newest post on the remote listing.
    async fn list_latest(&self) -> Result<u64, ExtractError>;

    async fn fetch(&self, post_id: u64) -> Result<FetchOutcome, ExtractError>;
}

#[derive(Debug, Clone)]
pub struct FinfoExtractor {
    http: HttpFetcher,
    base_url: String,
}

impl FinfoExtractor {
    pub fn new(base_url: impl Into<String>, http: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(http)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn post_url(&self, post_id: u64) -> String {
        format!("{}/{post_id}", self.base_url)
    }
}

#[async_trait]
impl Extractor for FinfoExtractor {
    async fn list_latest(&self) -> Result<u64, ExtractError> {
        let page = self.http.fetch_bytes(&self.base_url).await?;
        parse_latest_id(&page.text())?.ok_or_else(|| {
            ExtractError::Layout(format!("no post link on listing {}", self.base_url))
        })
    }

    async fn fetch(&self, post_id: u64) -> Result<FetchOutcome, ExtractError> {
        let url = self.post_url(post_id);
        let page = match self.http.fetch_bytes(&url).await {
            Ok(page) => page,
            Err(err) if err.is_not_found() => return Ok(FetchOutcome::NotFound),
            Err(err) => return Err(err.into()),
        };
        debug!(post_id, url = %page.final_url, bytes = page.body.len(), "fetched post page");
        match parse_post_page(post_id, &page.text())? {
            Some(article) => Ok(FetchOutcome::Found(article)),
            None => Ok(FetchOutcome::NotFound),
        }
    }
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector {
        selector: css.to_string(),
        reason: e.to_string(),
    })
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn first_text(scope: ElementRef<'_>, css: &str) -> Result<Option<String>, ExtractError> {
    let sel = selector(css)?;
    Ok(scope.select(&sel).next().map(element_text))
}

/// Latest post id from the listing page, taken from the first post link.
pub fn parse_latest_id(html: &str) -> Result<Option<u64>, ExtractError> {
    let document = Html::parse_document(html);
    let sel = selector(LATEST_LINK)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|link| link.value().attr("href"))
        .and_then(|href| href.trim_end_matches('/').rsplit('/').next())
        .and_then(|segment| segment.parse().ok()))
}

/// Splits `投保規劃．03/14` or `B3．03/16` into its two halves.
fn split_meta(line: &str) -> Option<(String, String)> {
    let (head, tail) = line.split_once(META_SEPARATOR)?;
    Some((head.trim().to_string(), tail.trim().to_string()))
}

/// Flattens content paragraphs into plain text with inline markers for tags.
fn render_content(container: ElementRef<'_>) -> Result<String, ExtractError> {
    let paragraph = selector("div")?;
    let img = selector("img")?;
    let mut out = String::new();
    for para in container.select(&paragraph) {
        for child in para.children() {
            match child.value() {
                Node::Text(text) => out.push_str(text),
                Node::Element(element) => {
                    let Some(child) = ElementRef::wrap(child) else {
                        continue;
                    };
                    match element.name() {
                        "br" => out.push('\n'),
                        "a" => match child.select(&img).next().and_then(|i| i.value().attr("src")) {
                            Some(src) => out.push_str(&format!("\n<img>{src}<img>\n")),
                            None => out.push_str(&child.text().collect::<String>()),
                        },
                        name => {
                            let inner = child.text().collect::<String>();
                            out.push_str(&format!("<{name}>{inner}<{name}>"));
                        }
                    }
                }
                _ => {}
            }
        }
    }
    Ok(out.replace('\u{a0}', " ").trim().to_string())
}

fn parse_reply(
    post_id: u64,
    header: ElementRef<'_>,
    body: ElementRef<'_>,
) -> Result<Reply, ExtractError> {
    let meta = first_text(header, META_LINE)?
        .and_then(|line| split_meta(&line))
        .ok_or_else(|| ExtractError::Layout(format!("reply meta missing in post {post_id}")))?;
    let floor = meta
        .0
        .trim_start_matches('B')
        .parse::<u32>()
        .map_err(|_| ExtractError::Layout(format!("bad floor {:?} in post {post_id}", meta.0)))?;
    let user_name = first_text(header, AUTHOR_NAME)?
        .ok_or_else(|| ExtractError::Layout(format!("reply author missing in post {post_id}")))?;

    // Only salesmen expose a consultation link; policy-holders have none.
    let consultation = header
        .select(&selector("a")?)
        .next()
        .and_then(|a| a.value().attr("href"))
        .map(str::to_string);
    let (identity, reply_id) = match consultation {
        Some(href) => (
            Identity::Salesman,
            href.split_once('=').map(|(_, id)| id.to_string()),
        ),
        None => (Identity::Insurer, None),
    };

    Ok(Reply {
        id: reply_id,
        floor,
        date_time: meta.1,
        author: Author::new(user_name, identity),
        content: render_content(body)?,
        belongs_to: post_id,
    })
}

/// Parses one post page. `Ok(None)` means the post does not exist or was deleted.
pub fn parse_post_page(post_id: u64, html: &str) -> Result<Option<Article>, ExtractError> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let Some(title) = first_text(root, TITLE)? else {
        return Ok(None);
    };

    let (topic_label, date_time) = first_text(root, META_LINE)?
        .and_then(|line| split_meta(&line))
        .ok_or_else(|| ExtractError::Layout(format!("post meta missing in post {post_id}")))?;
    // Thread starters are always policy-holders.
    let author_name = first_text(root, AUTHOR_NAME)?
        .ok_or_else(|| ExtractError::Layout(format!("post author missing in post {post_id}")))?;
    let content_sel = selector(POST_CONTENT)?;
    let content = match root.select(&content_sel).next() {
        Some(container) => render_content(container)?,
        None => String::new(),
    };

    let header_sel = selector(ENTRY_HEADER)?;
    let comment_sel = selector(COMMENT_CONTENT)?;
    let headers: Vec<_> = root.select(&header_sel).skip(1).collect();
    let bodies: Vec<_> = root.select(&comment_sel).collect();
    // Headers without a body (deleted replies) are ignored; a body without a header is not.
    if headers.len() < bodies.len() {
        return Err(ExtractError::Layout(format!(
            "post {post_id} has {} reply headers but {} reply bodies",
            headers.len(),
            bodies.len()
        )));
    }
    let replies = headers
        .into_iter()
        .zip(bodies)
        .map(|(header, body)| parse_reply(post_id, header, body))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(Article {
        id: post_id,
        title,
        topic_label,
        date_time,
        author: Author::new(author_name, Identity::Insurer),
        content,
        replies,
    }))
}
