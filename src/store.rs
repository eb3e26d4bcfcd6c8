//! SQLite persistence: one table per content type, keyed by the item's
//! natural key, written with batched upserts.

use std::{path::Path, str::FromStr, time::Duration};

use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow},
    Column as _, Row as _,
};

use crate::{error::StoreError, spider::Platform};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

impl Column {
    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Text,
        }
    }

    pub const fn integer(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Integer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Text(String),
    Integer(i64),
    Null,
}

impl From<String> for Field {
    fn from(value: String) -> Self {
        Field::Text(value)
    }
}

impl From<&str> for Field {
    fn from(value: &str) -> Self {
        Field::Text(value.to_string())
    }
}

impl From<i64> for Field {
    fn from(value: i64) -> Self {
        Field::Integer(value)
    }
}

impl<T: Into<Field>> From<Option<T>> for Field {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Field::Null)
    }
}

/// A persistable item. `fields()` must follow the order of `columns()`.
pub trait Record: Send + Sync + 'static {
    /// Natural key column; must appear in `columns()`.
    const KEY: &'static str;

    fn columns() -> &'static [Column];

    fn key(&self) -> &str;

    fn fields(&self) -> Vec<Field>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableInit {
    CreateIfMissing,
    /// Drop and create; for snapshot sources whose stale rows must not survive.
    Recreate,
}

/// Bookkeeping columns every table carries besides the record's own.
pub const RESERVED_COLUMNS: [&str; 3] = ["row_id", "created_at", "updated_at"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    name: String,
    key: &'static str,
    columns: &'static [Column],
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

impl Table {
    pub fn of<R: Record>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: R::KEY,
            columns: R::columns(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_columns(&self) -> Result<(), StoreError> {
        match self
            .columns
            .iter()
            .find(|column| RESERVED_COLUMNS.contains(&column.name))
        {
            Some(column) => Err(StoreError::ReservedColumn {
                table: self.name.clone(),
                column: column.name,
            }),
            None => Ok(()),
        }
    }

    fn create_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|column| {
                let kind = match column.kind {
                    ColumnKind::Text => "TEXT",
                    ColumnKind::Integer => "INTEGER",
                };
                if column.name == self.key {
                    format!("{} {} NOT NULL UNIQUE", quote(column.name), kind)
                } else {
                    format!("{} {}", quote(column.name), kind)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE TABLE IF NOT EXISTS {} (row_id INTEGER PRIMARY KEY AUTOINCREMENT, {}, created_at TEXT NOT NULL, updated_at TEXT NOT NULL)",
            quote(&self.name),
            columns
        )
    }

    fn upsert_sql(&self) -> String {
        let names = self
            .columns
            .iter()
            .map(|column| quote(column.name))
            .collect::<Vec<_>>();
        let placeholders = vec!["?"; names.len() + 2].join(", ");
        let updates = self
            .columns
            .iter()
            .filter(|column| column.name != self.key)
            .map(|column| format!("{0} = excluded.{0}", quote(column.name)))
            .chain(std::iter::once("updated_at = excluded.updated_at".to_string()))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({}, created_at, updated_at) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {}",
            quote(&self.name),
            names.join(", "),
            placeholders,
            quote(self.key),
            updates
        )
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) a database file. WAL and a busy timeout let
    /// parallel runs upsert into the same file.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        tracing::debug!("opened database '{}'", path.display());
        Ok(Self { pool })
    }

    /// `<db_dir>/<platform>.db`
    pub async fn open_platform(db_dir: &Path, platform: Platform) -> Result<Self, StoreError> {
        Self::open(&db_dir.join(format!("{}.db", platform.as_str()))).await
    }

    /// A private in-memory database on a single long-lived connection.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_table(&self, table: &Table, init: TableInit) -> Result<(), StoreError> {
        table.check_columns()?;
        if init == TableInit::Recreate {
            tracing::info!("dropping table '{}'", table.name);
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote(&table.name)))
                .execute(&self.pool)
                .await?;
        }
        sqlx::query(&table.create_sql()).execute(&self.pool).await?;
        Ok(())
    }

    /// Upsert `records` in one transaction. Later values win on key conflict;
    /// `created_at` keeps the first insertion time.
    pub async fn upsert_batch<R: Record>(&self, table: &Table, records: &[R]) -> Result<usize, StoreError> {
        let sql = table.upsert_sql();
        let now = chrono::Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for record in records {
            let fields = record.fields();
            if fields.len() != table.columns.len() {
                return Err(StoreError::Arity {
                    table: table.name.clone(),
                    got: fields.len(),
                    expected: table.columns.len(),
                });
            }
            let mut query = sqlx::query(&sql);
            for field in fields {
                query = match field {
                    Field::Text(value) => query.bind(value),
                    Field::Integer(value) => query.bind(value),
                    Field::Null => query.bind(None::<String>),
                };
            }
            query
                .bind(now.clone())
                .bind(now.clone())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(records.len())
    }

    /// Natural keys of the rows matching an ad hoc SQL `WHERE` expression,
    /// in insertion order. `None` selects every row.
    pub async fn select_keys(&self, table: &Table, filter: Option<&str>) -> Result<Vec<String>, StoreError> {
        let mut sql = format!("SELECT {} FROM {}", quote(table.key), quote(&table.name));
        if let Some(filter) = filter.map(str::trim).filter(|f| !f.is_empty()) {
            sql.push_str(" WHERE ");
            sql.push_str(filter);
        }
        sql.push_str(" ORDER BY row_id");
        Ok(sqlx::query_scalar::<_, String>(&sql)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Run an ad hoc statement and render every row as text.
    pub async fn query(&self, sql: &str) -> Result<Rows, StoreError> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        Ok(Rows::from_sqlite(&rows))
    }

    /// The `n` rows with the most views, read from the JSON `stat` column,
    /// as rank, title, view and `link_column`.
    pub async fn top_by_view(&self, table: &str, link_column: &str, n: usize) -> Result<Rows, StoreError> {
        let sql = format!(
            "SELECT title, CAST(json_extract(stat, '$.view') AS INTEGER) AS view, {} AS link \
             FROM {} ORDER BY view DESC, row_id LIMIT ?",
            quote(link_column),
            quote(table)
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(n).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        Ok(Rows::from_sqlite(&rows).ranked())
    }

    /// The first `n` rows in insertion order, every column.
    pub async fn head(&self, table: &str, n: usize) -> Result<Rows, StoreError> {
        let sql = format!("SELECT * FROM {} ORDER BY row_id LIMIT ?", quote(table));
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(n).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        Ok(Rows::from_sqlite(&rows))
    }

    pub async fn count(&self, table: &Table) -> Result<i64, StoreError> {
        Ok(
            sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", quote(&table.name)))
                .fetch_one(&self.pool)
                .await?,
        )
    }
}

/// A query result rendered as text, for display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Rows {
    fn from_sqlite(rows: &[SqliteRow]) -> Self {
        let columns = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let rows = rows
            .iter()
            .map(|row| (0..row.len()).map(|index| cell(row, index)).collect())
            .collect();
        Self { columns, rows }
    }

    fn ranked(mut self) -> Self {
        self.columns.insert(0, "rank".to_string());
        for (index, row) in self.rows.iter_mut().enumerate() {
            row.insert(0, (index + 1).to_string());
        }
        self
    }
}

/// NULL renders as an empty string.
fn cell(row: &SqliteRow, index: usize) -> String {
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map(|v| v.to_string()).unwrap_or_default();
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value.map(|v| v.to_string()).unwrap_or_default();
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value.unwrap_or_default();
    }
    "<blob>".to_string()
}

/// Sizes of the batches written by one `save` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveSummary {
    pub batches: Vec<usize>,
}

impl SaveSummary {
    pub fn rows(&self) -> usize {
        self.batches.iter().sum()
    }
}

#[async_trait]
pub trait Sink<T: Send + Sync>: Send + Sync {
    async fn save(&self, items: &[T]) -> Result<SaveSummary, StoreError>;
}

/// Writes items into one table, `batch_size` rows per transaction.
#[derive(Debug, Clone)]
pub struct SqliteSink {
    store: Store,
    table: Table,
    batch_size: usize,
}

impl SqliteSink {
    pub fn new(store: Store, table: Table, batch_size: usize) -> Self {
        Self {
            store,
            table,
            batch_size: batch_size.max(1),
        }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

#[async_trait]
impl<R: Record> Sink<R> for SqliteSink {
    async fn save(&self, items: &[R]) -> Result<SaveSummary, StoreError> {
        let mut summary = SaveSummary::default();
        for batch in items.chunks(self.batch_size) {
            let written = self.store.upsert_batch(&self.table, batch).await?;
            tracing::info!(table = %self.table.name, "Create or update {} items...", written);
            summary.batches.push(written);
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Note {
        id: String,
        title: String,
        likes: Option<i64>,
    }

    impl Record for Note {
        const KEY: &'static str = "note_id";

        fn columns() -> &'static [Column] {
            const COLUMNS: &[Column] = &[
                Column::text("note_id"),
                Column::text("title"),
                Column::integer("like"),
            ];
            COLUMNS
        }

        fn key(&self) -> &str {
            &self.id
        }

        fn fields(&self) -> Vec<Field> {
            vec![
                self.id.clone().into(),
                self.title.clone().into(),
                self.likes.into(),
            ]
        }
    }

    fn note(id: &str, title: &str) -> Note {
        Note {
            id: id.into(),
            title: title.into(),
            likes: Some(1),
        }
    }

    async fn sink(batch_size: usize) -> SqliteSink {
        let store = Store::in_memory().await.unwrap();
        let table = Table::of::<Note>("t_notes");
        store.init_table(&table, TableInit::CreateIfMissing).await.unwrap();
        SqliteSink::new(store, table, batch_size)
    }

    async fn save(sink: &SqliteSink, items: &[Note]) -> SaveSummary {
        Sink::<Note>::save(sink, items).await.unwrap()
    }

    async fn title_of(sink: &SqliteSink, id: &str) -> String {
        sqlx::query_scalar::<_, String>("SELECT title FROM t_notes WHERE note_id = ?")
            .bind(id)
            .fetch_one(sink.store().pool())
            .await
            .unwrap()
    }

    #[test]
    fn upsert_statement_quotes_reserved_words() {
        let sql = Table::of::<Note>("t_notes").upsert_sql();
        assert!(sql.contains("\"like\" = excluded.\"like\""));
        assert!(sql.contains("ON CONFLICT(\"note_id\")"));
        assert!(!sql.contains("\"note_id\" = excluded"));
    }

    #[tokio::test]
    async fn saves_in_bounded_batches() {
        let sink = sink(2).await;
        let items: Vec<Note> = (0..5).map(|i| note(&format!("n{}", i), "t")).collect();

        let summary = save(&sink, &items).await;

        assert_eq!(summary.batches, vec![2, 2, 1]);
        assert_eq!(summary.rows(), 5);
        assert_eq!(sink.store().count(sink.table()).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn conflicting_keys_take_the_latest_values() {
        let sink = sink(100).await;
        save(&sink, &[note("a", "first"), note("b", "first")]).await;
        save(&sink, &[note("a", "second")]).await;

        assert_eq!(sink.store().count(sink.table()).await.unwrap(), 2);
        assert_eq!(title_of(&sink, "a").await, "second");
        assert_eq!(title_of(&sink, "b").await, "first");
    }

    #[tokio::test]
    async fn null_fields_are_stored_as_null() {
        let sink = sink(10).await;
        let mut item = note("x", "t");
        item.likes = None;
        save(&sink, &[item]).await;
        let likes: Option<i64> = sqlx::query_scalar("SELECT \"like\" FROM t_notes WHERE note_id = 'x'")
            .fetch_one(sink.store().pool())
            .await
            .unwrap();
        assert_eq!(likes, None);
    }

    #[tokio::test]
    async fn selects_keys_with_ad_hoc_filters() {
        let sink = sink(10).await;
        save(&sink, &[note("a", "cats"), note("b", "dogs"), note("c", "cats")]).await;

        let all = sink.store().select_keys(sink.table(), None).await.unwrap();
        assert_eq!(all, vec!["a", "b", "c"]);
        let cats = sink
            .store()
            .select_keys(sink.table(), Some("title = 'cats'"))
            .await
            .unwrap();
        assert_eq!(cats, vec!["a", "c"]);
    }

    struct Comment {
        id: String,
    }

    impl Record for Comment {
        const KEY: &'static str = "id";

        fn columns() -> &'static [Column] {
            const COLUMNS: &[Column] = &[Column::text("id")];
            COLUMNS
        }

        fn key(&self) -> &str {
            &self.id
        }

        fn fields(&self) -> Vec<Field> {
            vec![self.id.as_str().into()]
        }
    }

    struct Stamped;

    impl Record for Stamped {
        const KEY: &'static str = "created_at";

        fn columns() -> &'static [Column] {
            const COLUMNS: &[Column] = &[Column::text("created_at")];
            COLUMNS
        }

        fn key(&self) -> &str {
            ""
        }

        fn fields(&self) -> Vec<Field> {
            vec![Field::Null]
        }
    }

    #[tokio::test]
    async fn records_may_use_id_as_their_natural_key() {
        let store = Store::in_memory().await.unwrap();
        let table = Table::of::<Comment>("t_comments");
        store.init_table(&table, TableInit::CreateIfMissing).await.unwrap();
        let sink = SqliteSink::new(store, table, 10);
        let comments = [Comment { id: "c2".into() }, Comment { id: "c1".into() }];
        Sink::<Comment>::save(&sink, &comments).await.unwrap();
        Sink::<Comment>::save(&sink, &comments[..1]).await.unwrap();

        let keys = sink.store().select_keys(sink.table(), None).await.unwrap();
        assert_eq!(keys, vec!["c2", "c1"]);
    }

    #[tokio::test]
    async fn reserved_column_names_are_rejected() {
        let store = Store::in_memory().await.unwrap();
        let err = store
            .init_table(&Table::of::<Stamped>("t_stamped"), TableInit::CreateIfMissing)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::ReservedColumn {
                column: "created_at",
                ..
            }
        ));
    }

    struct Clip {
        bvid: &'static str,
        title: &'static str,
        views: i64,
    }

    impl Record for Clip {
        const KEY: &'static str = "bvid";

        fn columns() -> &'static [Column] {
            const COLUMNS: &[Column] = &[
                Column::text("bvid"),
                Column::text("title"),
                Column::text("stat"),
                Column::text("short_link_v2"),
            ];
            COLUMNS
        }

        fn key(&self) -> &str {
            self.bvid
        }

        fn fields(&self) -> Vec<Field> {
            vec![
                self.bvid.into(),
                self.title.into(),
                format!(r#"{{"view":{},"like":0}}"#, self.views).into(),
                format!("https://b23.tv/{}", self.bvid).into(),
            ]
        }
    }

    async fn clips() -> Store {
        let store = Store::in_memory().await.unwrap();
        let table = Table::of::<Clip>("t_clips");
        store.init_table(&table, TableInit::CreateIfMissing).await.unwrap();
        let clips = [
            Clip { bvid: "BV1", title: "quiet", views: 10 },
            Clip { bvid: "BV2", title: "viral", views: 9000 },
            Clip { bvid: "BV3", title: "steady", views: 300 },
        ];
        store.upsert_batch(&table, &clips).await.unwrap();
        store
    }

    #[tokio::test]
    async fn ranks_rows_by_view_count() {
        let store = clips().await;
        let top = store.top_by_view("t_clips", "short_link_v2", 2).await.unwrap();

        assert_eq!(top.columns, ["rank", "title", "view", "link"]);
        assert_eq!(
            top.rows,
            vec![
                vec!["1", "viral", "9000", "https://b23.tv/BV2"],
                vec!["2", "steady", "300", "https://b23.tv/BV3"],
            ]
        );
    }

    #[tokio::test]
    async fn ad_hoc_queries_render_every_value_as_text() {
        let store = clips().await;
        let rows = store
            .query("SELECT bvid, NULL AS gone, 1.5 AS ratio FROM t_clips WHERE title = 'quiet'")
            .await
            .unwrap();
        assert_eq!(rows.columns, ["bvid", "gone", "ratio"]);
        assert_eq!(rows.rows, vec![vec!["BV1", "", "1.5"]]);

        let head = store.head("t_clips", 1).await.unwrap();
        assert_eq!(head.columns[0], "row_id");
        assert_eq!(head.rows.len(), 1);
        assert_eq!(head.rows[0][1], "BV1");
    }

    #[tokio::test]
    async fn recreate_drops_previous_rows() {
        let sink = sink(10).await;
        save(&sink, &[note("a", "t")]).await;
        sink.store()
            .init_table(sink.table(), TableInit::Recreate)
            .await
            .unwrap();
        assert_eq!(sink.store().count(sink.table()).await.unwrap(), 0);
    }
}
