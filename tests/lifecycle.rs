use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use spiders_for_all::{
    crawler::{Crawler, CrawlerOptions},
    error::{CrawlError, ExtractError, HttpError, StoreError, ValidationError},
    http::{Fetch, Request, Response, Session},
    retry::RetryPolicy,
    spider::{Cursor, Page, Platform, RunContext, Spider},
    store::{Column, Field, Record, SaveSummary, Sink, SqliteSink, Store, Table, TableInit},
    validate::{Envelope, Schema},
};

#[derive(Debug, Clone, Deserialize)]
struct Row {
    id: String,
    value: i64,
}

impl Record for Row {
    const KEY: &'static str = "id";

    fn columns() -> &'static [Column] {
        const COLUMNS: &[Column] = &[Column::text("id"), Column::integer("value")];
        COLUMNS
    }

    fn key(&self) -> &str {
        &self.id
    }

    fn fields(&self) -> Vec<Field> {
        vec![self.id.as_str().into(), self.value.into()]
    }
}

#[derive(Debug, Deserialize)]
struct Listing {
    items: Vec<Row>,
    next: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ListEnvelope {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<Listing>,
}

impl Envelope for ListEnvelope {
    fn check(&self) -> Result<(), ValidationError> {
        if self.code != 0 {
            return Err(ValidationError::Business {
                code: self.code,
                message: self.message.clone(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct ListSpider {
    validator: Schema<ListEnvelope>,
}

#[async_trait]
impl Spider for ListSpider {
    type Validator = Schema<ListEnvelope>;
    type Item = Row;

    fn name(&self) -> String {
        "list".into()
    }

    fn platform(&self) -> Platform {
        Platform::Bilibili
    }

    fn table(&self) -> String {
        "t_rows".into()
    }

    fn validator(&self) -> &Self::Validator {
        &self.validator
    }

    fn first_cursor(&self, ctx: &RunContext) -> Cursor {
        Cursor::Page(ctx.start_page)
    }

    async fn request(
        &self,
        ctx: &RunContext,
        cursor: &Cursor,
        _session: &Session,
    ) -> Result<Request, CrawlError> {
        let page = match cursor {
            Cursor::Page(page) => *page,
            _ => 1,
        };
        let target = ctx.target.as_deref().unwrap_or("all");
        Ok(Request::get(format!("https://list.test/{}", target)).param("page", page))
    }

    fn extract(
        &self,
        body: ListEnvelope,
        _ctx: &RunContext,
        _cursor: &Cursor,
    ) -> Result<Page<Row>, ExtractError> {
        let listing = body.data.ok_or(ExtractError::Missing { what: "data" })?;
        if listing.items.iter().any(|row| row.id.is_empty()) {
            return Err(ExtractError::Malformed {
                what: "row",
                reason: "empty id".into(),
            });
        }
        Ok(Page::new(listing.items, listing.next.map(Cursor::Page)))
    }
}

/// Replies from a queue, in order, and counts every call.
#[derive(Default)]
struct Scripted {
    replies: Mutex<VecDeque<Result<Response, HttpError>>>,
    calls: AtomicU32,
}

impl Scripted {
    fn new(replies: Vec<Result<Response, HttpError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetch for Scripted {
    async fn fetch(&self, _session: &Session, request: &Request) -> Result<Response, HttpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected request to {}", request.url))
    }
}

fn ok(body: serde_json::Value) -> Result<Response, HttpError> {
    Ok(Response {
        status: 200,
        url: "https://list.test/all".into(),
        body: body.to_string(),
    })
}

fn page(rows: &[(&str, i64)], next: Option<u32>) -> Result<Response, HttpError> {
    let items: Vec<_> = rows
        .iter()
        .map(|(id, value)| json!({ "id": id, "value": value }))
        .collect();
    ok(json!({ "code": 0, "data": { "items": items, "next": next } }))
}

fn unavailable() -> Result<Response, HttpError> {
    Err(HttpError::Status {
        url: "https://list.test/all".into(),
        status: 503,
    })
}

async fn sink(batch_size: usize) -> SqliteSink {
    let store = Store::in_memory().await.unwrap();
    let table = Table::of::<Row>("t_rows");
    store
        .init_table(&table, TableInit::CreateIfMissing)
        .await
        .unwrap();
    SqliteSink::new(store, table, batch_size)
}

fn crawler(fetch: Arc<Scripted>, max_attempts: u32) -> Crawler {
    Crawler::new(
        fetch,
        Session::new(),
        CrawlerOptions {
            retry: RetryPolicy::immediate(max_attempts),
            pacing: None,
        },
    )
}

async fn stored(sink: &SqliteSink) -> Vec<(String, i64)> {
    sqlx::query_as::<_, (String, i64)>("SELECT id, value FROM t_rows ORDER BY id")
        .fetch_all(sink.store().pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn pages_until_the_source_has_no_next_cursor() {
    let fetch = Scripted::new(vec![
        page(&[("a", 1), ("b", 2)], Some(2)),
        page(&[("c", 3), ("d", 4)], Some(3)),
        page(&[("e", 5), ("f", 6)], None),
    ]);
    let sink = sink(100).await;
    let report = crawler(fetch.clone(), 3)
        .run(&ListSpider::default(), &RunContext::new(), &sink)
        .await
        .unwrap();

    assert_eq!(fetch.calls(), 3);
    assert_eq!(report.pages, 3);
    assert_eq!(report.items, 6);
    assert_eq!(report.retries, 0);
    assert_eq!(sink.store().count(sink.table()).await.unwrap(), 6);
}

#[tokio::test]
async fn an_empty_page_ends_the_run() {
    let fetch = Scripted::new(vec![
        page(&[("a", 1), ("b", 2)], Some(2)),
        page(&[("c", 3), ("d", 4)], Some(3)),
        page(&[("e", 5), ("f", 6)], Some(4)),
        page(&[], Some(5)),
    ]);
    let sink = sink(100).await;
    let report = crawler(fetch.clone(), 3)
        .run(&ListSpider::default(), &RunContext::new(), &sink)
        .await
        .unwrap();

    assert_eq!(fetch.calls(), 4);
    assert_eq!(report.pages, 4);
    assert_eq!(stored(&sink).await.len(), 6);
}

#[tokio::test]
async fn transient_failures_are_retried_within_the_budget() {
    let fetch = Scripted::new(vec![unavailable(), unavailable(), page(&[("a", 1)], None)]);
    let sink = sink(100).await;
    let report = crawler(fetch.clone(), 5)
        .run(&ListSpider::default(), &RunContext::new(), &sink)
        .await
        .unwrap();

    assert_eq!(fetch.calls(), 3);
    assert_eq!(report.requests, 3);
    assert_eq!(report.retries, 2);
    assert_eq!(report.items, 1);
}

#[tokio::test]
async fn business_errors_in_successful_responses_are_retried() {
    let fetch = Scripted::new(vec![
        ok(json!({ "code": -352, "message": "risk control" })),
        page(&[("a", 1)], None),
    ]);
    let sink = sink(100).await;
    let report = crawler(fetch.clone(), 3)
        .run(&ListSpider::default(), &RunContext::new(), &sink)
        .await
        .unwrap();

    assert_eq!(fetch.calls(), 2);
    assert_eq!(report.retries, 1);
    assert_eq!(stored(&sink).await, vec![("a".to_string(), 1)]);
}

#[tokio::test]
async fn exhausting_retries_keeps_earlier_pages() {
    let fetch = Scripted::new(vec![
        page(&[("a", 1), ("b", 2)], Some(2)),
        unavailable(),
        unavailable(),
        unavailable(),
    ]);
    let sink = sink(100).await;
    let failure = crawler(fetch.clone(), 3)
        .run(&ListSpider::default(), &RunContext::new(), &sink)
        .await
        .unwrap_err();

    assert_eq!(fetch.calls(), 4);
    match &failure.error {
        CrawlError::RetriesExhausted { attempts, last } => {
            assert_eq!(*attempts, 3);
            assert!(matches!(**last, CrawlError::Http(HttpError::Status { status: 503, .. })));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(failure.report.pages, 1);
    assert_eq!(failure.report.items, 2);
    assert_eq!(stored(&sink).await.len(), 2);
}

#[tokio::test]
async fn extraction_errors_are_not_retried() {
    let fetch = Scripted::new(vec![page(&[("", 1)], None), page(&[("a", 1)], None)]);
    let sink = sink(100).await;
    let failure = crawler(fetch.clone(), 5)
        .run(&ListSpider::default(), &RunContext::new(), &sink)
        .await
        .unwrap_err();

    assert_eq!(fetch.calls(), 1);
    assert!(matches!(failure.error, CrawlError::Extract(_)));
    assert!(stored(&sink).await.is_empty());
}

#[tokio::test]
async fn rerunning_updates_rows_in_place() {
    let sink = sink(100).await;
    let first = Scripted::new(vec![page(&[("a", 1), ("b", 2)], None)]);
    crawler(first, 1)
        .run(&ListSpider::default(), &RunContext::new(), &sink)
        .await
        .unwrap();
    let second = Scripted::new(vec![page(&[("b", 20), ("c", 30)], None)]);
    crawler(second, 1)
        .run(&ListSpider::default(), &RunContext::new(), &sink)
        .await
        .unwrap();

    assert_eq!(
        stored(&sink).await,
        vec![
            ("a".to_string(), 1),
            ("b".to_string(), 20),
            ("c".to_string(), 30)
        ]
    );
}

#[tokio::test]
async fn total_caps_the_number_of_saved_items() {
    let fetch = Scripted::new(vec![
        page(&[("a", 1), ("b", 2)], Some(2)),
        page(&[("c", 3), ("d", 4)], Some(3)),
    ]);
    let sink = sink(100).await;
    let report = crawler(fetch.clone(), 1)
        .run(&ListSpider::default(), &RunContext::new().total(3), &sink)
        .await
        .unwrap();

    assert_eq!(fetch.calls(), 2);
    assert_eq!(report.items, 3);
    assert_eq!(stored(&sink).await.len(), 3);
}

#[tokio::test]
async fn a_zero_total_sends_no_requests() {
    let fetch = Scripted::new(vec![page(&[("a", 1)], None)]);
    let sink = sink(100).await;
    let report = crawler(fetch.clone(), 1)
        .run(&ListSpider::default(), &RunContext::new().total(0), &sink)
        .await
        .unwrap();

    assert_eq!(fetch.calls(), 0);
    assert_eq!(report.pages, 0);
    assert!(stored(&sink).await.is_empty());
}

#[tokio::test]
async fn repeated_keys_count_once_towards_the_total() {
    let fetch = Scripted::new(vec![
        page(&[("a", 1), ("a", 2), ("b", 3)], Some(2)),
        page(&[("b", 4), ("c", 5), ("d", 6)], Some(3)),
    ]);
    let sink = sink(100).await;
    let report = crawler(fetch.clone(), 1)
        .run(&ListSpider::default(), &RunContext::new().total(3), &sink)
        .await
        .unwrap();

    assert_eq!(fetch.calls(), 2);
    assert_eq!(report.items, 3);
    assert_eq!(
        stored(&sink).await,
        vec![
            ("a".to_string(), 2),
            ("b".to_string(), 4),
            ("c".to_string(), 5)
        ]
    );
}

#[tokio::test]
async fn items_are_written_in_batches() {
    let fetch = Scripted::new(vec![page(
        &[("a", 1), ("b", 2), ("c", 3), ("d", 4), ("e", 5)],
        None,
    )]);
    let sink = sink(2).await;
    let report = crawler(fetch, 1)
        .run(&ListSpider::default(), &RunContext::new(), &sink)
        .await
        .unwrap();

    assert_eq!(report.batches, 3);
    assert_eq!(report.items, 5);
}

#[tokio::test]
async fn independent_runs_each_get_their_own_report() {
    let fetch = Scripted::new(vec![
        page(&[("a", 1)], None),
        page(&[("b", 2), ("c", 3)], None),
    ]);
    let sink = sink(100).await;
    let contexts = vec![RunContext::new().target("x"), RunContext::new().target("y")];
    let results = crawler(fetch.clone(), 1)
        .run_many(&ListSpider::default(), contexts, &sink, 1)
        .await;

    let items: Vec<_> = results
        .into_iter()
        .map(|result| result.unwrap().items)
        .collect();
    assert_eq!(items, vec![1, 2]);
    assert_eq!(stored(&sink).await.len(), 3);
}

/// Accepts the first `capacity` saves, then reports a full disk.
struct FullDisk {
    capacity: usize,
    saves: Mutex<Vec<usize>>,
}

#[async_trait]
impl Sink<Row> for FullDisk {
    async fn save(&self, items: &[Row]) -> Result<SaveSummary, StoreError> {
        let mut saves = self.saves.lock().unwrap();
        if saves.len() >= self.capacity {
            return Err(StoreError::Arity {
                table: "t_rows".into(),
                got: 0,
                expected: items.len(),
            });
        }
        saves.push(items.len());
        Ok(SaveSummary {
            batches: vec![items.len()],
        })
    }
}

#[tokio::test]
async fn persistence_failures_abort_without_retrying() {
    let fetch = Scripted::new(vec![
        page(&[("a", 1), ("b", 2)], Some(2)),
        page(&[("c", 3)], Some(3)),
    ]);
    let sink = FullDisk {
        capacity: 1,
        saves: Mutex::new(Vec::new()),
    };
    let failure = crawler(fetch.clone(), 5)
        .run(&ListSpider::default(), &RunContext::new(), &sink)
        .await
        .unwrap_err();

    assert_eq!(fetch.calls(), 2);
    assert!(matches!(failure.error, CrawlError::Store(_)));
    assert_eq!(failure.report.items, 2);
    assert_eq!(*sink.saves.lock().unwrap(), vec![2]);
}
