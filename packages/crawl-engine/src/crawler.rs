//! The crawl orchestrator: list discovery, pagination, and the bounded
//! worker pool that fetches, extracts, and persists chapters.
//!
//! A crawl walks a fixed sequence: fetch the landing page, extract document
//! info, gather the chapter list (paginating when configured), upsert the
//! document, then fan chapter downloads out over `max_workers` concurrent
//! workers. The stop signal is a monotonic latch checked before every HTTP
//! request; in-flight requests are never aborted.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info};
use url::Url;

use crate::config::SiteConfig;
use crate::fetcher::Fetcher;
use crate::ledger::{ChapterLedger, LedgerKey};
use crate::locator::{self, ChapterItem, LocatorSpec, Value};
use crate::store::{DocumentStore, NewDocument, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    ParsingList,
    Downloading,
    Completed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::ParsingList => "parsing_list",
            Stage::Downloading => "downloading",
            Stage::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Success => "SUCCESS",
        }
    }
}

/// Snapshot carried by every progress callback.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub stage: Stage,
    pub detail: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub current_chapter: String,
    pub document_title: Option<String>,
    pub document_author: Option<String>,
}

/// The supervisor-owned side of the crawl: progress, log lines, and the
/// cancellation latch. Callbacks must be cheap; they are invoked under the
/// progress mutex so consumers observe them in mutation order.
pub trait CrawlObserver: Send + Sync {
    fn on_progress(&self, update: &ProgressUpdate);
    fn on_log(&self, level: LogLevel, message: &str);
    fn should_stop(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlOutcome {
    Completed,
    Stopped,
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("url template '{name}' is not configured or unresolved")]
    UnresolvedTemplate { name: &'static str },
    #[error("failed to fetch landing page {url}")]
    LandingPageFetch { url: String },
    #[error("document title could not be extracted from the landing page")]
    MissingTitle,
    #[error("no chapters discovered")]
    NoChapters,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Crawler {
    config: Arc<SiteConfig>,
    fetcher: Arc<Fetcher>,
    ledger: Arc<dyn ChapterLedger>,
    store: Arc<dyn DocumentStore>,
    observer: Arc<dyn CrawlObserver>,
    book_id: String,
    max_workers: usize,
}

impl Crawler {
    pub fn new(
        config: Arc<SiteConfig>,
        fetcher: Arc<Fetcher>,
        ledger: Arc<dyn ChapterLedger>,
        store: Arc<dyn DocumentStore>,
        observer: Arc<dyn CrawlObserver>,
        book_id: impl Into<String>,
        max_workers: usize,
    ) -> Self {
        Self {
            config,
            fetcher,
            ledger,
            store,
            observer,
            book_id: book_id.into(),
            max_workers: max_workers.max(1),
        }
    }

    pub async fn run(&self) -> Result<CrawlOutcome, CrawlError> {
        let site_name = self.config.site.name.clone();
        self.observer.on_log(
            LogLevel::Info,
            &format!("starting crawl: site={site_name} book_id={}", self.book_id),
        );
        self.emit_stage(Stage::ParsingList, "fetching chapter list", 0, None, None);

        let start_url = self
            .config
            .build_url("book_detail", &[("book_id", &self.book_id)])
            .ok_or(CrawlError::UnresolvedTemplate { name: "book_detail" })?;

        if self.observer.should_stop() {
            return Ok(CrawlOutcome::Stopped);
        }
        let landing = self
            .fetcher
            .get(&start_url)
            .await
            .ok_or_else(|| CrawlError::LandingPageFetch { url: start_url.clone() })?;

        let (title, author, cover_url) = self.document_info(&landing)?;
        self.observer
            .on_log(LogLevel::Info, &format!("document: {title}"));

        let mut chapters = locator::extract_chapter_items(
            &landing,
            &self.config.parsers.chapter_list,
            &self.config.site.base_url,
        );

        if let Some(outcome) = self.paginate_list(&landing, &mut chapters).await {
            return Ok(outcome);
        }
        if chapters.is_empty() {
            return Err(CrawlError::NoChapters);
        }
        let total = chapters.len();
        info!(site = %site_name, book_id = %self.book_id, total, "chapter list discovered");
        self.observer.on_log(
            LogLevel::Info,
            &format!("discovered {total} chapters"),
        );

        let document_id = self
            .store
            .upsert_document(&NewDocument {
                title: title.clone(),
                author: author.clone(),
                cover_url,
                source_url: start_url,
                site_name: site_name.clone(),
            })
            .await?;

        self.emit_stage(
            Stage::Downloading,
            &format!("downloading {total} chapters"),
            total,
            Some(title.clone()),
            author.clone(),
        );

        let ctx = Arc::new(WorkerCtx {
            config: self.config.clone(),
            fetcher: self.fetcher.clone(),
            ledger: self.ledger.clone(),
            store: self.store.clone(),
            observer: self.observer.clone(),
            key: LedgerKey::new(site_name, self.book_id.clone()),
            document_id,
            total,
            delay: Duration::from_secs_f64(self.config.crawl.request_delay_secs.max(0.0)),
            document_title: title,
            document_author: author,
            progress: Mutex::new(Counts::default()),
        });

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut handles = Vec::with_capacity(total);
        for (i, chapter) in chapters.into_iter().enumerate() {
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                process_chapter(&ctx, (i + 1) as i32, chapter).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        // Partial results stay visible even when the crawl is interrupted.
        self.store.recompute_document_stats(document_id).await?;

        if self.observer.should_stop() {
            self.observer.on_log(LogLevel::Warning, "crawl stopped");
            return Ok(CrawlOutcome::Stopped);
        }

        let counts = ctx.counts();
        ctx.emit_with(Stage::Completed, "crawl complete".to_string(), String::new());
        let (ledger_success, ledger_failed) = self.ledger.stats(&ctx.key).await;
        self.observer.on_log(
            LogLevel::Success,
            &format!(
                "crawl complete: {} downloaded, {} failed (ledger: {ledger_success} succeeded, {ledger_failed} failed)",
                counts.completed, counts.failed
            ),
        );
        Ok(CrawlOutcome::Completed)
    }

    /// Resolve title/author/cover from the landing page. A configured
    /// `document_info` parser must yield a title; without one the site name
    /// stands in.
    fn document_info(
        &self,
        landing: &str,
    ) -> Result<(String, Option<String>, Option<String>), CrawlError> {
        let parsers = &self.config.parsers.document_info;
        if parsers.is_empty() {
            return Ok((self.config.site.name.clone(), None, None));
        }
        let fields = locator::extract_fields(landing, parsers);
        let title = fields
            .get("title")
            .and_then(Value::as_text)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(CrawlError::MissingTitle)?;
        let author = fields.get("author").and_then(Value::as_text);
        let cover_url = fields
            .get("cover_url")
            .or_else(|| fields.get("cover"))
            .and_then(Value::as_text)
            .map(|href| locator::join_url(&self.config.site.base_url, &href));
        Ok((title, author, cover_url))
    }

    /// Fetch list pages 2..N when pagination is enabled, appending chapters
    /// in discovery order. A failed page stops pagination but keeps what
    /// was gathered. Returns `Some(Stopped)` when the latch fires.
    async fn paginate_list(
        &self,
        landing: &str,
        chapters: &mut Vec<ChapterItem>,
    ) -> Option<CrawlOutcome> {
        let pagination = self.config.parsers.chapter_list.pagination.as_ref()?;
        if !pagination.enabled {
            return None;
        }

        let mut max_pages = pagination.max_page_manual;
        if let Some(xpath) = &pagination.max_page_xpath {
            max_pages = effective_max_pages(landing, xpath, pagination.max_page_manual);
        }
        debug!(max_pages, "list pagination enabled");

        for page in 2..=max_pages {
            if self.observer.should_stop() {
                return Some(CrawlOutcome::Stopped);
            }
            let Some(url) = self.config.build_url(
                "chapter_list_page",
                &[("book_id", &self.book_id), ("page", &page.to_string())],
            ) else {
                self.observer.on_log(
                    LogLevel::Warning,
                    "chapter_list_page template unresolved, stopping list pagination",
                );
                break;
            };
            self.emit_stage(
                Stage::ParsingList,
                &format!("parsing list page {page}/{max_pages}"),
                chapters.len(),
                None,
                None,
            );
            match self.fetcher.get(&url).await {
                Some(html) => {
                    let more = locator::extract_chapter_items(
                        &html,
                        &self.config.parsers.chapter_list,
                        &self.config.site.base_url,
                    );
                    self.observer.on_log(
                        LogLevel::Info,
                        &format!("list page {page}: {} chapters", more.len()),
                    );
                    chapters.extend(more);
                }
                None => {
                    self.observer.on_log(
                        LogLevel::Warning,
                        &format!(
                            "list page {page} failed, continuing with {} chapters",
                            chapters.len()
                        ),
                    );
                    break;
                }
            }
        }
        None
    }

    fn emit_stage(
        &self,
        stage: Stage,
        detail: &str,
        total: usize,
        document_title: Option<String>,
        document_author: Option<String>,
    ) {
        self.observer.on_progress(&ProgressUpdate {
            stage,
            detail: detail.to_string(),
            total,
            completed: 0,
            failed: 0,
            current_chapter: String::new(),
            document_title,
            document_author,
        });
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    completed: usize,
    failed: usize,
}

struct WorkerCtx {
    config: Arc<SiteConfig>,
    fetcher: Arc<Fetcher>,
    ledger: Arc<dyn ChapterLedger>,
    store: Arc<dyn DocumentStore>,
    observer: Arc<dyn CrawlObserver>,
    key: LedgerKey,
    document_id: i64,
    total: usize,
    delay: Duration,
    document_title: String,
    document_author: Option<String>,
    progress: Mutex<Counts>,
}

impl WorkerCtx {
    fn counts(&self) -> Counts {
        *self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mutate the counters and fire the progress callback while holding the
    /// lock, so callback order matches mutation order.
    fn note(&self, failed: bool, current_chapter: &str) {
        let mut counts = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        if failed {
            counts.failed += 1;
        } else {
            counts.completed += 1;
        }
        let update = ProgressUpdate {
            stage: Stage::Downloading,
            detail: format!("downloaded {}/{}", counts.completed, self.total),
            total: self.total,
            completed: counts.completed,
            failed: counts.failed,
            current_chapter: current_chapter.to_string(),
            document_title: Some(self.document_title.clone()),
            document_author: self.document_author.clone(),
        };
        self.observer.on_progress(&update);
    }

    fn emit_with(&self, stage: Stage, detail: String, current_chapter: String) {
        let counts = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        self.observer.on_progress(&ProgressUpdate {
            stage,
            detail,
            total: self.total,
            completed: counts.completed,
            failed: counts.failed,
            current_chapter,
            document_title: Some(self.document_title.clone()),
            document_author: self.document_author.clone(),
        });
    }
}

enum ContentOutcome {
    Done(String),
    Stopped,
}

async fn process_chapter(ctx: &WorkerCtx, chapter_num: i32, chapter: ChapterItem) {
    if ctx.observer.should_stop() {
        return;
    }

    if ctx.ledger.is_success(&ctx.key, &chapter.url).await {
        ctx.observer.on_log(
            LogLevel::Info,
            &format!("[{chapter_num}] {} already downloaded, skipping", chapter.title),
        );
        ctx.note(false, &chapter.title);
        return;
    }

    let content = match download_chapter_content(ctx, &chapter.url).await {
        ContentOutcome::Done(content) => content,
        ContentOutcome::Stopped => return,
    };

    if content.trim().is_empty() {
        ctx.observer.on_log(
            LogLevel::Error,
            &format!("[{chapter_num}] {} extracted empty content", chapter.title),
        );
        ctx.ledger.mark_failure(&ctx.key, &chapter.url).await;
        ctx.note(true, &chapter.title);
        return;
    }

    match ctx
        .store
        .upsert_chapter(ctx.document_id, chapter_num, &chapter.title, &content, &chapter.url)
        .await
    {
        Ok(_) => {
            ctx.ledger.mark_success(&ctx.key, &chapter.url).await;
            ctx.observer.on_log(
                LogLevel::Success,
                &format!("[{chapter_num}] {} ({} chars)", chapter.title, content.chars().count()),
            );
            ctx.note(false, &chapter.title);
            if !ctx.delay.is_zero() {
                tokio::time::sleep(ctx.delay).await;
            }
        }
        Err(e) => {
            ctx.observer.on_log(
                LogLevel::Error,
                &format!("[{chapter_num}] {} persistence failed: {e}", chapter.title),
            );
            ctx.ledger.mark_failure(&ctx.key, &chapter.url).await;
            ctx.note(true, &chapter.title);
        }
    }
}

/// Fetch a chapter across its sub-pages.
///
/// Sub-pages are joined with a blank line; a run of three identical
/// consecutive sub-pages terminates pagination (some sites serve the last
/// real page for every out-of-range page number).
async fn download_chapter_content(ctx: &WorkerCtx, chapter_url: &str) -> ContentOutcome {
    let spec = &ctx.config.parsers.chapter_content;
    let next = spec.next_page.as_ref();
    let paginating = next.is_some_and(|n| n.enabled);
    let mut max_pages = next.map_or(1, |n| n.max_pages_manual);

    let mut pages: Vec<String> = Vec::new();
    let mut current_url = chapter_url.to_string();
    let mut page_num: u32 = 1;
    let mut dup_run: u32 = 0;

    loop {
        if ctx.observer.should_stop() {
            return ContentOutcome::Stopped;
        }
        let Some(html) = ctx.fetcher.get(&current_url).await else {
            ctx.observer.on_log(
                LogLevel::Warning,
                &format!("sub-page {page_num} of {chapter_url} failed to fetch"),
            );
            break;
        };

        if page_num == 1 {
            if let Some(xpath) = next.and_then(|n| n.max_page_xpath.as_ref()) {
                max_pages = effective_max_pages(&html, xpath, max_pages);
            }
        }

        let content = match locator::evaluate(&html, &spec.content) {
            Value::Str(s) => s,
            Value::List(items) => items
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
            Value::Null => String::new(),
        };

        if !content.is_empty() {
            if pages.last() == Some(&content) {
                dup_run += 1;
                if dup_run >= 3 {
                    debug!(url = %chapter_url, page = page_num, "duplicate sub-page run, stopping");
                    break;
                }
            } else {
                pages.push(content);
                dup_run = 1;
            }
        }

        if !paginating || page_num >= max_pages {
            break;
        }
        let Some(next_url) = build_content_page_url(&ctx.config, chapter_url, page_num + 1) else {
            break;
        };
        if next_url == current_url {
            break;
        }
        current_url = next_url;
        page_num += 1;
    }

    let joined = pages.join("\n\n");
    let cleaned = match locator::postprocess::apply(Value::Str(joined), &spec.clean) {
        Value::Str(s) => s,
        Value::List(items) => items.join("\n"),
        Value::Null => String::new(),
    };
    ContentOutcome::Done(cleaned)
}

/// Next sub-page URL from the `chapter_content_page` template. `book_id`
/// and `chapter_id` come out of the chapter URL's path as its first and
/// second decimal-digit runs.
fn build_content_page_url(config: &SiteConfig, chapter_url: &str, page: u32) -> Option<String> {
    let (book_id, chapter_id) = path_digit_runs(chapter_url);
    config.build_url(
        "chapter_content_page",
        &[
            ("book_id", book_id.as_deref()?),
            ("chapter_id", chapter_id.as_deref()?),
            ("page", &page.to_string()),
        ],
    )
}

/// Effective page bound: the larger of the manual bound and the value the
/// page itself declares.
fn effective_max_pages(html: &str, xpath: &LocatorSpec, manual: u32) -> u32 {
    let extracted = locator::evaluate(html, xpath)
        .as_text()
        .and_then(|text| first_digit_run(&text))
        .and_then(|digits| digits.parse::<u32>().ok());
    match extracted {
        Some(n) if n >= 1 => n.max(manual),
        _ => manual,
    }
}

/// First decimal-digit run of a URL's path (host digits never count).
/// Task creation uses this to derive a book id from a start URL.
pub fn book_id_from_url(url: &str) -> Option<String> {
    path_digit_runs(url).0
}

fn path_digit_runs(url: &str) -> (Option<String>, Option<String>) {
    let path = Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    let mut runs = digit_runs(&path).into_iter();
    (runs.next(), runs.next())
}

fn digit_runs(s: &str) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            current.push(c);
        } else if !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

fn first_digit_run(s: &str) -> Option<String> {
    digit_runs(s).into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn digit_runs_come_from_the_path_in_order() {
        assert_eq!(
            path_digit_runs("https://m.djks5.com/novel/41934/123.html"),
            (Some("41934".to_string()), Some("123".to_string()))
        );
        assert_eq!(
            path_digit_runs("https://book8.example.com/novel/41934.html"),
            (Some("41934".to_string()), None)
        );
        assert_eq!(book_id_from_url("https://x.com/about"), None);
    }

    #[test]
    fn effective_max_pages_takes_the_larger_bound() {
        let html = r#"<html><select id="page"><option>1</option><option>10</option></select></html>"#;
        let xpath = LocatorSpec::from_json(&serde_json::json!({
            "expression": "//select[@id='page']/option[last()]/text()",
            "index": 0
        }))
        .unwrap();
        assert_eq!(effective_max_pages(html, &xpath, 50), 50);
        assert_eq!(effective_max_pages(html, &xpath, 3), 10);

        let no_digits = r#"<html><div id="page">last</div></html>"#;
        let div = LocatorSpec::from_json(&serde_json::json!({
            "expression": "//div[@id='page']/text()",
            "index": 0
        }))
        .unwrap();
        assert_eq!(effective_max_pages(no_digits, &div, 40), 40);
    }

    #[derive(Default)]
    struct TestObserver {
        stop: AtomicBool,
        stop_after_completed: Option<usize>,
        updates: Mutex<Vec<ProgressUpdate>>,
        logs: Mutex<Vec<(LogLevel, String)>>,
    }

    impl TestObserver {
        fn final_counts(&self) -> (usize, usize) {
            let updates = self.updates.lock().unwrap();
            updates
                .last()
                .map(|u| (u.completed, u.failed))
                .unwrap_or((0, 0))
        }
    }

    impl CrawlObserver for TestObserver {
        fn on_progress(&self, update: &ProgressUpdate) {
            if let Some(n) = self.stop_after_completed {
                if update.completed >= n {
                    self.stop.store(true, Ordering::SeqCst);
                }
            }
            self.updates.lock().unwrap().push(update.clone());
        }

        fn on_log(&self, level: LogLevel, message: &str) {
            self.logs.lock().unwrap().push((level, message.to_string()));
        }

        fn should_stop(&self) -> bool {
            self.stop.load(Ordering::SeqCst)
        }
    }

    fn site_config(base_url: &str, extra: serde_json::Value) -> Arc<SiteConfig> {
        let mut json = serde_json::json!({
            "site": {"name": "testsite", "base_url": base_url},
            "request": {"timeout_secs": 5},
            "crawl": {"request_delay_secs": 0, "max_retries": 1},
            "url_templates": {
                "book_detail": "/book/{book_id}/"
            },
            "parsers": {
                "document_info": {
                    "title": {"expression": "//h1/text()", "index": 0},
                    "author": {"expression": "//p[@id='author']/text()", "index": 0}
                },
                "chapter_list": {
                    "items": {"expression": "//div[@id='list']/dl/dd", "index": null},
                    "title": {"expression": ".//a/text()", "index": 0},
                    "url": {"expression": ".//a/@href", "index": 0}
                },
                "chapter_content": {
                    "content": {"expression": "//div[@id='content']//text()", "index": null}
                }
            }
        });
        if let (Some(base), Some(extra)) = (json.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                merge(base.entry(k.clone()).or_insert(serde_json::Value::Null), v);
            }
        }
        Arc::new(SiteConfig::from_json(&json).unwrap())
    }

    fn merge(target: &mut serde_json::Value, source: &serde_json::Value) {
        match (target, source) {
            (serde_json::Value::Object(t), serde_json::Value::Object(s)) => {
                for (k, v) in s {
                    merge(t.entry(k.clone()).or_insert(serde_json::Value::Null), v);
                }
            }
            (t, s) => *t = s.clone(),
        }
    }

    const LIST_PAGE: &str = r#"
        <html><body>
          <h1>Iron Harvest</h1>
          <p id="author">Jane Doe</p>
          <div id="list"><dl>
            <dd><a href="/book/7/1.html">Chapter One</a></dd>
            <dd><a href="/book/7/2.html">Chapter Two</a></dd>
            <dd><a href="/book/7/3.html">Chapter Three</a></dd>
          </dl></div>
        </body></html>
    "#;

    fn chapter_page(text: &str) -> String {
        format!(r#"<html><body><div id="content"><p>{text}</p></div></body></html>"#)
    }

    fn crawler_for(
        config: Arc<SiteConfig>,
        ledger: Arc<MemoryLedger>,
        store: Arc<MemoryStore>,
        observer: Arc<TestObserver>,
    ) -> Crawler {
        let fetcher = Arc::new(Fetcher::new(&config, None).unwrap());
        Crawler::new(config, fetcher, ledger, store, observer, "7", 2)
    }

    #[tokio::test]
    async fn single_page_crawl_persists_chapters_in_discovery_order() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/book/7/")
            .with_body(LIST_PAGE)
            .create_async()
            .await;
        for (num, text) in [(1, "alpha body"), (2, "beta body"), (3, "gamma body")] {
            server
                .mock("GET", format!("/book/7/{num}.html").as_str())
                .with_body(chapter_page(text))
                .create_async()
                .await;
        }

        let config = site_config(&server.url(), serde_json::json!({}));
        let ledger = Arc::new(MemoryLedger::new());
        let store = Arc::new(MemoryStore::new());
        let observer = Arc::new(TestObserver::default());
        let crawler = crawler_for(config, ledger.clone(), store.clone(), observer.clone());

        let outcome = crawler.run().await.unwrap();
        assert_eq!(outcome, CrawlOutcome::Completed);

        let doc = store
            .find_document_by_source_url(&format!("{}/book/7/", server.url()))
            .await
            .unwrap()
            .expect("document row");
        assert_eq!(doc.title, "Iron Harvest");
        assert_eq!(doc.author.as_deref(), Some("Jane Doe"));
        assert_eq!(doc.total_chapters, 3);

        let chapters = store.chapters_of(doc.id);
        assert_eq!(chapters.len(), 3);
        assert_eq!(chapters[0].chapter_num, 1);
        assert_eq!(chapters[0].title, "Chapter One");
        assert!(chapters[0].content.contains("alpha body"));
        assert_eq!(chapters[2].title, "Chapter Three");

        let key = LedgerKey::new("testsite", "7");
        for num in 1..=3 {
            let url = format!("{}/book/7/{num}.html", server.url());
            assert!(ledger.is_success(&key, &url).await);
        }
        assert_eq!(observer.final_counts(), (3, 0));
    }

    #[tokio::test]
    async fn rerun_skips_chapters_in_the_success_set() {
        let mut server = mockito::Server::new_async().await;
        let list = server
            .mock("GET", "/book/7/")
            .with_body(LIST_PAGE)
            .expect(1)
            .create_async()
            .await;
        let mut content_mocks = Vec::new();
        for num in 1..=3 {
            content_mocks.push(
                server
                    .mock("GET", format!("/book/7/{num}.html").as_str())
                    .with_body(chapter_page("never fetched"))
                    .expect(0)
                    .create_async()
                    .await,
            );
        }

        let config = site_config(&server.url(), serde_json::json!({}));
        let ledger = Arc::new(MemoryLedger::new());
        let key = LedgerKey::new("testsite", "7");
        ledger.seed_success(
            &key,
            (1..=3).map(|n| format!("{}/book/7/{n}.html", server.url())),
        );
        let store = Arc::new(MemoryStore::new());
        let observer = Arc::new(TestObserver::default());
        let crawler = crawler_for(config, ledger, store, observer.clone());

        let outcome = crawler.run().await.unwrap();
        assert_eq!(outcome, CrawlOutcome::Completed);
        assert_eq!(observer.final_counts(), (3, 0));

        list.assert_async().await;
        for mock in content_mocks {
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn duplicate_sub_page_run_terminates_content_pagination() {
        let mut server = mockito::Server::new_async().await;
        let single_chapter_list = r#"
            <html><body><h1>Doc</h1>
            <div id="list"><dl><dd><a href="/book/7/1.html">Only</a></dd></dl></div>
            </body></html>
        "#;
        server
            .mock("GET", "/book/7/")
            .with_body(single_chapter_list)
            .create_async()
            .await;
        let page_bodies = [
            ("/book/7/1.html", "page one"),
            ("/book/7/1_2.html", "page two"),
            ("/book/7/1_3.html", "page three"),
            ("/book/7/1_4.html", "page three"),
            ("/book/7/1_5.html", "page three"),
        ];
        let mut hits = Vec::new();
        for (path, text) in page_bodies {
            hits.push(
                server
                    .mock("GET", path)
                    .with_body(chapter_page(text))
                    .expect(1)
                    .create_async()
                    .await,
            );
        }
        let never = server
            .mock("GET", "/book/7/1_6.html")
            .with_body(chapter_page("page three"))
            .expect(0)
            .create_async()
            .await;

        let config = site_config(
            &server.url(),
            serde_json::json!({
                "url_templates": {
                    "chapter_content_page": "/book/{book_id}/{chapter_id}_{page}.html"
                },
                "parsers": {
                    "chapter_content": {
                        "next_page": {"enabled": true, "max_pages_manual": 10}
                    }
                }
            }),
        );
        let store = Arc::new(MemoryStore::new());
        let observer = Arc::new(TestObserver::default());
        let crawler = crawler_for(
            config,
            Arc::new(MemoryLedger::new()),
            store.clone(),
            observer,
        );

        assert_eq!(crawler.run().await.unwrap(), CrawlOutcome::Completed);

        let chapters = store.chapters_of(1);
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].content, "page one\n\npage two\n\npage three");

        for hit in hits {
            hit.assert_async().await;
        }
        never.assert_async().await;
    }

    #[tokio::test]
    async fn empty_content_marks_the_chapter_failed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/book/7/")
            .with_body(LIST_PAGE)
            .create_async()
            .await;
        server
            .mock("GET", "/book/7/1.html")
            .with_body(chapter_page("good"))
            .create_async()
            .await;
        server
            .mock("GET", "/book/7/2.html")
            .with_body("<html><body><div id='empty'></div></body></html>")
            .create_async()
            .await;
        server
            .mock("GET", "/book/7/3.html")
            .with_body(chapter_page("good"))
            .create_async()
            .await;

        let config = site_config(&server.url(), serde_json::json!({}));
        let ledger = Arc::new(MemoryLedger::new());
        let store = Arc::new(MemoryStore::new());
        let observer = Arc::new(TestObserver::default());
        let crawler = crawler_for(config, ledger.clone(), store.clone(), observer.clone());

        assert_eq!(crawler.run().await.unwrap(), CrawlOutcome::Completed);
        assert_eq!(observer.final_counts(), (2, 1));

        let key = LedgerKey::new("testsite", "7");
        let failed = ledger.failed_urls(&key);
        assert_eq!(failed, vec![format!("{}/book/7/2.html", server.url())]);

        let doc = store.document(1).unwrap();
        assert_eq!(doc.total_chapters, 2);
    }

    #[tokio::test]
    async fn stop_latch_ends_the_crawl_with_stopped() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/book/7/")
            .with_body(LIST_PAGE)
            .create_async()
            .await;
        server
            .mock("GET", "/book/7/1.html")
            .with_body(chapter_page("first"))
            .create_async()
            .await;
        let untouched: Vec<_> = {
            let mut mocks = Vec::new();
            for num in 2..=3 {
                mocks.push(
                    server
                        .mock("GET", format!("/book/7/{num}.html").as_str())
                        .with_body(chapter_page("later"))
                        .expect(0)
                        .create_async()
                        .await,
                );
            }
            mocks
        };

        let config = site_config(&server.url(), serde_json::json!({}));
        let store = Arc::new(MemoryStore::new());
        let observer = Arc::new(TestObserver {
            stop_after_completed: Some(1),
            ..TestObserver::default()
        });
        let fetcher = Arc::new(Fetcher::new(&config, None).unwrap());
        // One worker makes the persisted-then-stopped sequence deterministic.
        let crawler = Crawler::new(
            config,
            fetcher,
            Arc::new(MemoryLedger::new()),
            store.clone(),
            observer.clone(),
            "7",
            1,
        );

        assert_eq!(crawler.run().await.unwrap(), CrawlOutcome::Stopped);
        assert_eq!(store.chapters_of(1).len(), 1);
        for mock in untouched {
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn paginated_list_concatenates_in_discovery_order() {
        let mut server = mockito::Server::new_async().await;
        let page_one = r#"
            <html><body><h1>Doc</h1>
            <select id="pages"><option>1</option><option>3</option></select>
            <div id="list"><dl>
              <dd><a href="/book/7/1.html">One</a></dd>
            </dl></div></body></html>
        "#;
        let page = |n: u32| {
            format!(
                r#"<html><body><div id="list"><dl>
                   <dd><a href="/book/7/{n}.html">Chapter {n}</a></dd>
                   </dl></div></body></html>"#
            )
        };
        server.mock("GET", "/book/7/").with_body(page_one).create_async().await;
        server
            .mock("GET", "/book/7/page/2")
            .with_body(page(2))
            .create_async()
            .await;
        server
            .mock("GET", "/book/7/page/3")
            .with_body(page(3))
            .create_async()
            .await;
        for num in 1..=3 {
            server
                .mock("GET", format!("/book/7/{num}.html").as_str())
                .with_body(chapter_page("text"))
                .create_async()
                .await;
        }

        let config = site_config(
            &server.url(),
            serde_json::json!({
                "url_templates": {
                    "chapter_list_page": "/book/{book_id}/page/{page}"
                },
                "parsers": {
                    "chapter_list": {
                        "pagination": {
                            "enabled": true,
                            "max_page_manual": 1,
                            "max_page_xpath": {
                                "expression": "//select[@id='pages']/option[last()]/text()",
                                "index": 0
                            }
                        }
                    }
                }
            }),
        );
        let store = Arc::new(MemoryStore::new());
        let observer = Arc::new(TestObserver::default());
        let crawler = crawler_for(
            config,
            Arc::new(MemoryLedger::new()),
            store.clone(),
            observer,
        );

        assert_eq!(crawler.run().await.unwrap(), CrawlOutcome::Completed);
        let chapters = store.chapters_of(1);
        assert_eq!(chapters.len(), 3);
        // chapter_num reflects position across page boundaries
        assert_eq!(chapters[0].title, "One");
        assert_eq!(chapters[1].title, "Chapter 2");
        assert_eq!(chapters[2].title, "Chapter 3");
    }

    #[tokio::test]
    async fn missing_title_fails_the_crawl() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/book/7/")
            .with_body("<html><body><div id='list'></div></body></html>")
            .create_async()
            .await;

        let config = site_config(&server.url(), serde_json::json!({}));
        let crawler = crawler_for(
            config,
            Arc::new(MemoryLedger::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(TestObserver::default()),
        );
        assert!(matches!(crawler.run().await, Err(CrawlError::MissingTitle)));
    }
}
