use std::{fmt, path::PathBuf, str::FromStr};

use async_trait::async_trait;

use crate::{
    crawler::Pacing,
    error::{ConfigError, CrawlError, ExtractError},
    http::{Fetch, Request, Session},
    retry::RetryPolicy,
    store::{Record, TableInit},
    validate::ResponseValidator,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Bilibili,
    Xhs,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Bilibili => "bilibili",
            Platform::Xhs => "xhs",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bilibili" | "bili" => Ok(Platform::Bilibili),
            "xhs" | "xiaohongshu" => Ok(Platform::Xhs),
            other => Err(format!("unknown platform '{}'", other)),
        }
    }
}

/// Opaque pagination state threaded between fetches of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// The only page of a single-page source.
    Start,
    /// 1-based page number.
    Page(u32),
    /// Continuation token handed out by the previous response. May be empty
    /// for the first request.
    Token(String),
}

/// One page worth of extracted items and where to continue, if anywhere.
#[derive(Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<Cursor>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next: Option<Cursor>) -> Self {
        Self { items, next }
    }

    /// A page after which the source is exhausted.
    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }

    /// For page-numbered sources: a short page means there is nothing after it.
    pub fn numbered(items: Vec<T>, page: u32, page_size: u32) -> Self {
        let next = (!items.is_empty() && items.len() >= page_size as usize)
            .then(|| Cursor::Page(page + 1));
        Self { items, next }
    }
}

/// Parameters of one crawl invocation. Read-only once the run starts.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub target: Option<String>,
    pub total: Option<usize>,
    pub page_size: Option<u32>,
    pub start_page: u32,
    pub save_dir: Option<PathBuf>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            target: None,
            total: None,
            page_size: None,
            start_page: 1,
            save_dir: None,
        }
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn total(mut self, total: usize) -> Self {
        self.total = Some(total);
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn start_page(mut self, page: u32) -> Self {
        self.start_page = page.max(1);
        self
    }

    pub fn save_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.save_dir = Some(dir.into());
        self
    }

    pub fn require_target(&self) -> Result<&str, ConfigError> {
        self.target.as_deref().ok_or(ConfigError::Missing("target id"))
    }
}

/// One platform endpoint: how to ask for a page, how to check the answer and
/// how to turn it into records.
#[async_trait]
pub trait Spider: Send + Sync {
    type Validator: ResponseValidator;
    type Item: Record;

    fn name(&self) -> String;

    fn alias(&self) -> String {
        self.name()
    }

    fn platform(&self) -> Platform;

    /// Table the items are upserted into.
    fn table(&self) -> String;

    fn table_init(&self) -> TableInit {
        TableInit::CreateIfMissing
    }

    fn validator(&self) -> &Self::Validator;

    /// Soft delay between pages when the run configuration sets none.
    fn pacing(&self) -> Option<Pacing> {
        None
    }

    fn first_cursor(&self, _ctx: &RunContext) -> Cursor {
        Cursor::Start
    }

    /// Called once before the first fetch. Spiders that need tokens, cookies
    /// or signing keys obtain them here and stash them in `session`.
    async fn before(
        &self,
        _fetch: &dyn Fetch,
        _retry: RetryPolicy,
        _session: &mut Session,
        _ctx: &RunContext,
    ) -> Result<(), CrawlError> {
        Ok(())
    }

    async fn request(
        &self,
        ctx: &RunContext,
        cursor: &Cursor,
        session: &Session,
    ) -> Result<Request, CrawlError>;

    fn extract(
        &self,
        body: <Self::Validator as ResponseValidator>::Body,
        ctx: &RunContext,
        cursor: &Cursor,
    ) -> Result<Page<Self::Item>, ExtractError>;

    /// Called after each successfully extracted page, before it is persisted.
    fn after_page(&self, _page: &Page<Self::Item>, _session: &mut Session) {}
}
