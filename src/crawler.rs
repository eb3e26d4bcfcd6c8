//! The crawl lifecycle: request, validate, extract and persist, page after
//! page, until the source is exhausted or the item limit is reached.

mod pacing;
mod statistics;

use std::{collections::HashSet, fmt, sync::Arc, time::Instant};

use futures::stream::{self, StreamExt};

use crate::{
    config::Settings,
    error::CrawlError,
    http::{Fetch, HttpClient, Session},
    retry::RetryPolicy,
    spider::{Cursor, Page, RunContext, Spider},
    store::{Record, Sink},
    validate::ResponseValidator,
};

pub use pacing::Pacing;
pub use statistics::RunReport;

#[derive(Debug, Clone)]
pub struct CrawlerOptions {
    pub retry: RetryPolicy,
    /// Overrides the spider's own pacing when set.
    pub pacing: Option<Pacing>,
}

impl Default for CrawlerOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            pacing: None,
        }
    }
}

impl CrawlerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            retry: settings.retry,
            pacing: settings.page_sleep,
        }
    }
}

fn limit_reached(ctx: &RunContext, report: &RunReport) -> bool {
    ctx.total.is_some_and(|total| report.items >= total)
}

/// Keep the last occurrence of every key, in first-seen order.
fn dedup_by_key<R: Record>(items: Vec<R>) -> Vec<R> {
    let mut seen = HashSet::new();
    let mut unique: Vec<R> = items
        .into_iter()
        .rev()
        .filter(|item| seen.insert(item.key().to_string()))
        .collect();
    unique.reverse();
    unique
}

/// A run that stopped early. Everything counted in `report` is already persisted.
#[derive(Debug)]
pub struct RunFailure {
    pub report: RunReport,
    pub error: CrawlError,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "spider '{}' aborted after {} pages ({} items saved): {}",
            self.report.spider, self.report.pages, self.report.items, self.error
        )
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

pub struct Crawler {
    fetch: Arc<dyn Fetch>,
    session: Session,
    retry: RetryPolicy,
    pacing: Option<Pacing>,
}

impl Crawler {
    /// `session` seeds every run; each run works on its own copy.
    pub fn new(
        fetch: Arc<dyn Fetch>,
        session: Session,
        CrawlerOptions { retry, pacing }: CrawlerOptions,
    ) -> Self {
        Self {
            fetch,
            session,
            retry,
            pacing,
        }
    }

    pub fn with_client(client: HttpClient, options: CrawlerOptions) -> Self {
        let session = client.session();
        Self::new(Arc::new(client), session, options)
    }

    /// Request, validate and extract one page. The retry policy wraps this as
    /// a single unit.
    async fn fetch_page<S: Spider>(
        &self,
        spider: &S,
        ctx: &RunContext,
        session: &Session,
        cursor: &Cursor,
    ) -> Result<Page<S::Item>, CrawlError> {
        let request = spider.request(ctx, cursor, session).await?;
        let response = self.fetch.fetch(session, &request).await?;
        let body = spider.validator().validate(&response)?;
        Ok(spider.extract(body, ctx, cursor)?)
    }

    /// Crawl until the spider reports no next cursor, returns an empty page,
    /// or `ctx.total` distinct items have been saved. Each page is persisted
    /// before the next one is requested.
    pub async fn run<S: Spider>(
        &self,
        spider: &S,
        ctx: &RunContext,
        sink: &dyn Sink<S::Item>,
    ) -> Result<RunReport, RunFailure> {
        let name = spider.name();
        let started = Instant::now();
        let mut report = RunReport::new(name.clone());
        tracing::info!("[{:^10}]: {}[{}]", "Start", name, spider.alias());

        let fail = |mut report: RunReport, error: CrawlError| {
            report.running_time = started.elapsed();
            tracing::error!(spider = %report.spider, "run aborted: {}", error);
            report.write_to_log();
            RunFailure { report, error }
        };

        let mut session = self.session.clone();
        if let Err(error) = spider
            .before(self.fetch.as_ref(), self.retry, &mut session, ctx)
            .await
        {
            return Err(fail(report, error));
        }

        let pacing = self.pacing.or_else(|| spider.pacing());
        let mut cursor = Some(spider.first_cursor(ctx));
        let mut saved_keys: HashSet<String> = HashSet::new();

        while let Some(current) = cursor.take() {
            if limit_reached(ctx, &report) {
                tracing::info!(spider = %name, "item limit reached");
                break;
            }
            let fetched = self
                .retry
                .execute(|_| self.fetch_page(spider, ctx, &session, &current))
                .await;
            let mut page = match fetched {
                Ok(done) => {
                    report.record_attempts(done.attempts);
                    done.value
                }
                Err(err) => {
                    report.record_attempts(err.attempts());
                    return Err(fail(report, err.into()));
                }
            };
            report.pages += 1;
            spider.after_page(&page, &mut session);

            if page.items.is_empty() {
                tracing::info!(spider = %name, page = report.pages, "empty page, source exhausted");
                break;
            }
            let mut items = dedup_by_key(std::mem::take(&mut page.items));
            if let Some(total) = ctx.total {
                let mut room = total.saturating_sub(saved_keys.len());
                items.retain(|item| {
                    if saved_keys.contains(item.key()) {
                        return true;
                    }
                    let keep = room > 0;
                    room = room.saturating_sub(1);
                    keep
                });
            }

            match sink.save(&items).await {
                Ok(summary) => {
                    saved_keys.extend(items.iter().map(|item| item.key().to_string()));
                    report.items = saved_keys.len();
                    report.batches += summary.batches.len();
                }
                Err(err) => return Err(fail(report, err.into())),
            }
            tracing::info!(
                spider = %name,
                page = report.pages,
                items = items.len(),
                saved = report.items,
                "page saved"
            );

            if limit_reached(ctx, &report) {
                tracing::info!(spider = %name, "item limit reached");
                break;
            }
            cursor = page.next.take();
            if let (Some(_), Some(pacing)) = (&cursor, &pacing) {
                pacing.wait().await;
            }
        }

        report.running_time = started.elapsed();
        tracing::info!("[{:^10}]: {}[{}]", "Finished", name, spider.alias());
        report.write_to_log();
        Ok(report)
    }

    /// Independent runs of one spider over several contexts, at most
    /// `concurrency` at a time. Runs share nothing but the sink's store;
    /// one failing does not stop the others. Results come back in input order.
    pub async fn run_many<S: Spider>(
        &self,
        spider: &S,
        contexts: Vec<RunContext>,
        sink: &dyn Sink<S::Item>,
        concurrency: usize,
    ) -> Vec<Result<RunReport, RunFailure>> {
        stream::iter(contexts)
            .map(|ctx| async move { self.run(spider, &ctx, sink).await })
            .buffered(concurrency.max(1))
            .collect()
            .await
    }
}
