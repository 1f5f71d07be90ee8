//! Configuration-driven web extraction engine.
//!
//! Ingests a per-site declarative spec (locators, pagination rules,
//! post-processing pipeline, URL templates) and materializes a
//! deduplicated, resumable corpus of multi-chapter documents into a
//! relational store. Swapping the configuration adapts the engine to a new
//! site; no code changes per site.
//!
//! Modules map onto the moving parts:
//!
//! - [`config`]: load and validate site specs, URL templating
//! - [`locator`]: xpath/regex evaluation and the post-process pipeline
//! - [`fetcher`]: retrying HTTP with per-attempt proxy selection
//! - [`ledger`]: cross-process success/failure sets with TTLs
//! - [`store`]: document/chapter persistence and derived stats
//! - [`crawler`]: the two-phase crawl state machine and worker pool

pub mod config;
pub mod crawler;
pub mod fetcher;
pub mod ledger;
pub mod locator;
pub mod store;

pub use config::{ConfigError, SiteConfig};
pub use crawler::{
    book_id_from_url, CrawlError, CrawlObserver, CrawlOutcome, Crawler, LogLevel, ProgressUpdate,
    Stage,
};
pub use fetcher::{Fetcher, ProxyProvider};
pub use ledger::{ChapterLedger, LedgerKey, MemoryLedger, RedisLedger};
pub use locator::{LocatorSpec, Value};
pub use store::{DocumentStore, MemoryStore, PostgresStore, StoreError};
