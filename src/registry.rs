//! Every spider by platform and name, and the glue that turns a name plus
//! settings into a finished run.

use std::{path::Path, sync::Arc};

use crate::{
    config::Settings,
    crawler::{Crawler, CrawlerOptions, RunFailure, RunReport},
    error::{ConfigError, CrawlError},
    http::{parse_cookie_string, HttpClient},
    media::{download_all, CommandDownloader, DownloadSummary, MediaDownloader},
    platforms::{
        bilibili::{
            models::{AuthorVideoItem, FeedRecord, PlayItem, VideoItem},
            AuthorSpider, FeedSpider, PlayBoardSpider, PopularSpider,
            PreciousSpider, VideoBoardSpider, PLAY_BOARDS, VIDEO_BOARDS,
        },
        xhs::{models::AuthorNote, AuthorPageSpider, AuthorPostedSpider, Identity, NoteDownloader},
    },
    sign::CommandSigner,
    spider::{Platform, RunContext, Spider},
    store::{Record, Rows, SqliteSink, Store, Table},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiderInfo {
    pub platform: Platform,
    pub name: &'static str,
    pub alias: &'static str,
    pub table: &'static str,
    /// Natural key column of `table`.
    pub key: &'static str,
    /// Link column shown by `top_named` when rows carry a `stat.view` count.
    pub view_link: Option<&'static str>,
    /// Whether `RunContext::target` must be set.
    pub needs_target: bool,
}

fn info<R: Record>(
    platform: Platform,
    name: &'static str,
    alias: &'static str,
    table: &'static str,
) -> SpiderInfo {
    SpiderInfo {
        platform,
        name,
        alias,
        table,
        key: R::KEY,
        view_link: None,
        needs_target: false,
    }
}

impl SpiderInfo {
    fn per_target(mut self) -> Self {
        self.needs_target = true;
        self
    }

    fn ranked_by_view(mut self, link: &'static str) -> Self {
        self.view_link = Some(link);
        self
    }
}

pub fn catalog() -> Vec<SpiderInfo> {
    let mut spiders = vec![
        info::<VideoItem>(Platform::Bilibili, "popular", "综合热门", "t_bilibili_popular_videos")
            .ranked_by_view("short_link_v2"),
        info::<VideoItem>(Platform::Bilibili, "precious", "入站必刷", "t_bilibili_precious_videos")
            .ranked_by_view("short_link_v2"),
        info::<AuthorVideoItem>(Platform::Bilibili, "author", "up主", "t_bilibili_author_video")
            .per_target(),
        info::<FeedRecord>(Platform::Bilibili, "feed", "up主动态", "t_bilibili_author_feed")
            .per_target(),
    ];
    spiders.extend(VIDEO_BOARDS.iter().map(|board| {
        info::<VideoItem>(Platform::Bilibili, board.name, board.alias, board.table)
            .ranked_by_view("short_link_v2")
    }));
    spiders.extend(PLAY_BOARDS.iter().map(|board| {
        info::<PlayItem>(Platform::Bilibili, board.name, board.alias, board.table)
            .ranked_by_view("url")
    }));
    spiders.push(
        info::<AuthorNote>(Platform::Xhs, "author", "作者主页", "t_xhs_author_notes").per_target(),
    );
    spiders
}

pub fn find(platform: Platform, name: &str) -> Option<SpiderInfo> {
    catalog()
        .into_iter()
        .find(|spider| spider.platform == platform && spider.name == name)
}

/// One entry per table, optionally restricted to one platform. Spiders that
/// share a table are listed under the first of them.
pub fn tables(platform: Option<Platform>) -> Vec<SpiderInfo> {
    let mut tables: Vec<SpiderInfo> = Vec::new();
    for spider in catalog() {
        if platform.is_some_and(|platform| platform != spider.platform) {
            continue;
        }
        if !tables
            .iter()
            .any(|seen| seen.platform == spider.platform && seen.table == spider.table)
        {
            tables.push(spider);
        }
    }
    tables
}

fn find_table(platform: Platform, table: &str) -> Result<SpiderInfo, CrawlError> {
    tables(Some(platform))
        .into_iter()
        .find(|info| info.table == table)
        .ok_or_else(|| CrawlError::UnknownTable {
            platform: platform.to_string(),
            table: table.to_string(),
        })
}

fn xhs_identity(settings: &Settings) -> Identity {
    Identity {
        cookies: settings
            .xhs_cookies
            .as_deref()
            .map(parse_cookie_string)
            .unwrap_or_default(),
        headers: settings.xhs_headers.clone(),
    }
}

/// Prepare the spider's table and run it into the platform database.
async fn run_into<S: Spider>(
    crawler: &Crawler,
    store: &Store,
    batch_size: usize,
    spider: &S,
    ctx: &RunContext,
) -> Result<RunReport, RunFailure> {
    let table = Table::of::<S::Item>(spider.table());
    if let Err(err) = store.init_table(&table, spider.table_init()).await {
        return Err(RunFailure {
            report: RunReport::new(spider.name()),
            error: err.into(),
        });
    }
    let sink = SqliteSink::new(store.clone(), table, batch_size);
    crawler.run(spider, ctx, &sink).await
}

/// Pick the spider registered as `platform/name` and run it with `ctx`.
pub async fn run_named(
    settings: &Settings,
    platform: Platform,
    name: &str,
    ctx: &RunContext,
) -> Result<RunReport, RunFailure> {
    let setup_failed = |error: CrawlError| RunFailure {
        report: RunReport::new(name),
        error,
    };
    let Some(info) = find(platform, name) else {
        return Err(setup_failed(CrawlError::UnknownSpider {
            platform: platform.to_string(),
            name: name.to_string(),
        }));
    };
    if info.needs_target {
        ctx.require_target()
            .map_err(|err| setup_failed(err.into()))?;
    }
    let client = HttpClient::from_settings(settings).map_err(|err| setup_failed(err.into()))?;
    let crawler = Crawler::with_client(client, CrawlerOptions::from_settings(settings));
    let store = Store::open_platform(&settings.db_dir(), platform)
        .await
        .map_err(|err| setup_failed(err.into()))?;
    let batch_size = settings.batch_size;

    match (platform, name) {
        (Platform::Bilibili, "popular") => {
            run_into(&crawler, &store, batch_size, &PopularSpider::new(), ctx).await
        }
        (Platform::Bilibili, "precious") => {
            run_into(&crawler, &store, batch_size, &PreciousSpider::new(), ctx).await
        }
        (Platform::Bilibili, "author") => {
            let spider = AuthorSpider::new(settings.bilibili_sess_data.clone());
            run_into(&crawler, &store, batch_size, &spider, ctx).await
        }
        (Platform::Bilibili, "feed") => {
            let spider = FeedSpider::new(settings.bilibili_sess_data.clone());
            run_into(&crawler, &store, batch_size, &spider, ctx).await
        }
        (Platform::Bilibili, board) => {
            if let Some(spider) = VideoBoardSpider::named(board) {
                run_into(&crawler, &store, batch_size, &spider, ctx).await
            } else if let Some(spider) = PlayBoardSpider::named(board) {
                run_into(&crawler, &store, batch_size, &spider, ctx).await
            } else {
                Err(setup_failed(CrawlError::UnknownSpider {
                    platform: platform.to_string(),
                    name: board.to_string(),
                }))
            }
        }
        (Platform::Xhs, _) => {
            let identity = xhs_identity(settings);
            match settings
                .xhs_sign_command
                .as_deref()
                .and_then(CommandSigner::from_command_line)
            {
                Some(signer) => {
                    let spider = AuthorPostedSpider::new(identity, Arc::new(signer));
                    run_into(&crawler, &store, batch_size, &spider, ctx).await
                }
                None => {
                    tracing::warn!("XHS_SIGN_COMMAND is not set, only the first page of notes is reachable");
                    let spider = AuthorPageSpider::new(identity);
                    run_into(&crawler, &store, batch_size, &spider, ctx).await
                }
            }
        }
    }
}

/// Download media for the items stored by a platform's spiders. `filter` is
/// an SQL `WHERE` expression over the source table.
///
/// bilibili videos go through `MEDIA_COMMAND` and are read from any
/// `bvid`-keyed `table` (default `t_bilibili_author_video`); xhs notes are
/// fetched directly.
pub async fn download_named(
    settings: &Settings,
    platform: Platform,
    table: Option<&str>,
    filter: Option<&str>,
    save_dir: &Path,
    concurrency: usize,
) -> Result<DownloadSummary, CrawlError> {
    let info = downloadable_table(platform, table)?;
    let store = Store::open_platform(&settings.db_dir(), platform).await?;
    let (ids, downloader): (Vec<String>, Box<dyn MediaDownloader>) = match platform {
        Platform::Bilibili => {
            let command = settings
                .media_command
                .as_deref()
                .and_then(CommandDownloader::from_command_line)
                .ok_or(ConfigError::Missing("MEDIA_COMMAND"))?;
            let table = Table::of::<AuthorVideoItem>(info.table);
            (
                store.select_keys(&table, filter).await?,
                Box::new(command) as Box<dyn MediaDownloader>,
            )
        }
        Platform::Xhs => {
            let table = Table::of::<AuthorNote>(info.table);
            let client = HttpClient::from_settings(settings)?;
            let mut session = client.session();
            let identity = xhs_identity(settings);
            session.merge_cookies(&identity.cookies);
            session.merge_headers(&identity.headers);
            (
                store.select_keys(&table, filter).await?,
                Box::new(NoteDownloader::new(client, session)) as Box<dyn MediaDownloader>,
            )
        }
    };
    tracing::info!(platform = %platform, count = ids.len(), "downloading media");
    Ok(download_all(downloader.as_ref(), ids, save_dir, concurrency).await)
}

/// The catalog entry for a download source table, which must be keyed by the
/// id the platform's downloader understands.
fn downloadable_table(platform: Platform, table: Option<&str>) -> Result<SpiderInfo, CrawlError> {
    let (default, media_key) = match platform {
        Platform::Bilibili => ("t_bilibili_author_video", AuthorVideoItem::KEY),
        Platform::Xhs => ("t_xhs_author_notes", AuthorNote::KEY),
    };
    let info = find_table(platform, table.unwrap_or(default))?;
    if info.key != media_key {
        return Err(CrawlError::NotDownloadable {
            table: info.table.to_string(),
            key: info.key,
        });
    }
    Ok(info)
}

/// The `n` most viewed rows of a ranking table, or its first `n` rows when
/// the table keeps no view counts.
pub async fn top_named(
    settings: &Settings,
    platform: Platform,
    table: &str,
    n: usize,
) -> Result<Rows, CrawlError> {
    let info = find_table(platform, table)?;
    let store = Store::open_platform(&settings.db_dir(), platform).await?;
    let rows = match info.view_link {
        Some(link) => store.top_by_view(info.table, link, n).await?,
        None => store.head(info.table, n).await?,
    };
    Ok(rows)
}

/// Run an ad hoc SQL statement against a platform's database.
pub async fn query_platform(
    settings: &Settings,
    platform: Platform,
    sql: &str,
) -> Result<Rows, CrawlError> {
    let store = Store::open_platform(&settings.db_dir(), platform).await?;
    tracing::debug!(platform = %platform, "running ad hoc query: {}", sql);
    Ok(store.query(sql).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn catalog_entries_are_unique_per_platform() {
        let spiders = catalog();
        let keys: HashSet<_> = spiders.iter().map(|s| (s.platform, s.name)).collect();
        assert_eq!(keys.len(), spiders.len());
        assert!(find(Platform::Bilibili, "rank_drama").is_some());
        assert!(find(Platform::Xhs, "popular").is_none());
    }

    #[tokio::test]
    async fn unknown_spiders_fail_before_any_io() {
        let settings = Settings {
            workdir: "/nonexistent/spiders".into(),
            ..Settings::default()
        };
        let failure = run_named(&settings, Platform::Xhs, "weekly", &RunContext::new())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, CrawlError::UnknownSpider { .. }));
        assert_eq!(failure.report.pages, 0);
    }

    fn offline_settings() -> Settings {
        Settings {
            workdir: "/nonexistent/spiders".into(),
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn per_author_spiders_require_a_target() {
        let failure = run_named(&offline_settings(), Platform::Bilibili, "author", &RunContext::new())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, CrawlError::Config(ConfigError::Missing(_))));
    }

    #[test]
    fn tables_are_listed_once_per_platform() {
        let all = tables(None);
        let names: HashSet<_> = all.iter().map(|t| (t.platform, t.table)).collect();
        assert_eq!(names.len(), all.len());
        let xhs: Vec<_> = tables(Some(Platform::Xhs)).iter().map(|t| t.table).collect();
        assert_eq!(xhs, ["t_xhs_author_notes"]);
    }

    #[test]
    fn downloads_only_read_tables_keyed_by_media_ids() {
        let info = downloadable_table(Platform::Bilibili, None).unwrap();
        assert_eq!(info.table, "t_bilibili_author_video");
        assert!(downloadable_table(Platform::Bilibili, Some("t_bilibili_rank_all")).is_ok());
        assert!(matches!(
            downloadable_table(Platform::Bilibili, Some("t_bilibili_rank_drama")),
            Err(CrawlError::NotDownloadable { key: "url", .. })
        ));
        assert!(matches!(
            downloadable_table(Platform::Xhs, Some("t_bilibili_author_video")),
            Err(CrawlError::UnknownTable { .. })
        ));
    }

    #[tokio::test]
    async fn play_tables_are_rejected_before_touching_the_database() {
        let err = download_named(
            &offline_settings(),
            Platform::Bilibili,
            Some("t_bilibili_rank_drama"),
            None,
            Path::new("downloads"),
            1,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CrawlError::NotDownloadable { .. }));
    }

    #[tokio::test]
    async fn top_lists_the_most_viewed_plays() {
        use crate::platforms::bilibili::models::PlayStat;
        use crate::store::TableInit;
        use std::time::{SystemTime, UNIX_EPOCH};

        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let settings = Settings {
            workdir: std::env::temp_dir().join(format!("spiders-top-{}", nanos)),
            ..Settings::default()
        };
        let store = Store::open_platform(&settings.db_dir(), Platform::Bilibili)
            .await
            .unwrap();
        let table = Table::of::<PlayItem>("t_bilibili_rank_drama");
        store.init_table(&table, TableInit::CreateIfMissing).await.unwrap();
        let play = |url: &str, view: i64| PlayItem {
            rank: 1,
            rating: String::new(),
            stat: PlayStat {
                danmaku: 0,
                follow: 0,
                series_follow: 0,
                view,
            },
            title: url.trim_start_matches("https://b23.tv/").to_string(),
            url: url.to_string(),
        };
        store
            .upsert_batch(&table, &[play("https://b23.tv/ss1", 5), play("https://b23.tv/ss2", 50)])
            .await
            .unwrap();

        let top = top_named(&settings, Platform::Bilibili, "t_bilibili_rank_drama", 1)
            .await
            .unwrap();
        assert_eq!(top.rows, vec![vec!["1", "ss2", "50", "https://b23.tv/ss2"]]);

        let err = top_named(&settings, Platform::Bilibili, "t_nope", 1).await.unwrap_err();
        assert!(matches!(err, CrawlError::UnknownTable { .. }));
        let _ = std::fs::remove_dir_all(&settings.workdir);
    }
}
