use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::{
    crawler::Pacing,
    error::{ConfigError, CrawlError, ExtractError},
    http::{Fetch, Request, Session},
    retry::RetryPolicy,
    spider::{Cursor, Page, Platform, RunContext, Spider},
    store::TableInit,
    validate::Schema,
};

use super::{
    models::{
        AuthorVideoData, AuthorVideoItem, BiliResponse, FeedData, FeedRecord, PlayItem, PlayList,
        PopularData, VideoItem, VideoList,
    },
    wbi,
};

type Bili<D> = Schema<BiliResponse<D>>;

const POPULAR_URL: &str = "https://api.bilibili.com/x/web-interface/popular";
const PRECIOUS_URL: &str = "https://api.bilibili.com/x/web-interface/popular/precious";
const AUTHOR_URL: &str = "https://api.bilibili.com/x/space/wbi/arc/search";
const FEED_URL: &str = "https://api.bilibili.com/x/polymer/web-dynamic/v1/feed/space";

fn page_number(cursor: &Cursor) -> u32 {
    match cursor {
        Cursor::Page(page) => *page,
        _ => 1,
    }
}

/// 综合热门
#[derive(Debug, Default)]
pub struct PopularSpider {
    validator: Bili<PopularData>,
}

impl PopularSpider {
    const PAGE_SIZE: u32 = 20;

    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Spider for PopularSpider {
    type Validator = Bili<PopularData>;
    type Item = VideoItem;

    fn name(&self) -> String {
        "popular".into()
    }

    fn alias(&self) -> String {
        "综合热门".into()
    }

    fn platform(&self) -> Platform {
        Platform::Bilibili
    }

    fn table(&self) -> String {
        "t_bilibili_popular_videos".into()
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
        Ok(Request::get(POPULAR_URL)
            .param("pn", page_number(cursor))
            .param("ps", ctx.page_size.unwrap_or(Self::PAGE_SIZE)))
    }

    fn extract(
        &self,
        body: BiliResponse<PopularData>,
        ctx: &RunContext,
        cursor: &Cursor,
    ) -> Result<Page<VideoItem>, ExtractError> {
        let data = body.into_data()?;
        if data.no_more {
            return Ok(Page::last(data.list));
        }
        let page_size = ctx.page_size.unwrap_or(Self::PAGE_SIZE);
        Ok(Page::numbered(data.list, page_number(cursor), page_size))
    }
}

/// 入站必刷
#[derive(Debug, Default)]
pub struct PreciousSpider {
    validator: Bili<VideoList>,
}

impl PreciousSpider {
    const PAGE_SIZE: u32 = 100;

    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Spider for PreciousSpider {
    type Validator = Bili<VideoList>;
    type Item = VideoItem;

    fn name(&self) -> String {
        "precious".into()
    }

    fn alias(&self) -> String {
        "入站必刷".into()
    }

    fn platform(&self) -> Platform {
        Platform::Bilibili
    }

    fn table(&self) -> String {
        "t_bilibili_precious_videos".into()
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
        Ok(Request::get(PRECIOUS_URL)
            .param("page_size", ctx.page_size.unwrap_or(Self::PAGE_SIZE))
            .param("page", page_number(cursor)))
    }

    fn extract(
        &self,
        body: BiliResponse<VideoList>,
        ctx: &RunContext,
        cursor: &Cursor,
    ) -> Result<Page<VideoItem>, ExtractError> {
        let page_size = ctx.page_size.unwrap_or(Self::PAGE_SIZE);
        Ok(Page::numbered(body.into_data()?.list, page_number(cursor), page_size))
    }
}

/// A single-page ranking snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Board {
    pub name: &'static str,
    pub alias: &'static str,
    pub url: &'static str,
    pub table: &'static str,
}

const fn board(
    name: &'static str,
    alias: &'static str,
    url: &'static str,
    table: &'static str,
) -> Board {
    Board {
        name,
        alias,
        url,
        table,
    }
}

/// Boards listing regular videos.
pub const VIDEO_BOARDS: &[Board] = &[
    board("rank_all", "全站", "https://api.bilibili.com/x/web-interface/ranking/v2?rid=0&type=all", "t_bilibili_rank_all"),
    board("rank_cn_related", "国创相关", "https://api.bilibili.com/x/web-interface/ranking/v2?rid=168&type=all", "t_bilibili_rank_cn_related"),
    board("rank_cartoon", "动画", "https://api.bilibili.com/x/web-interface/ranking/v2?rid=1&type=all", "t_bilibili_rank_cartoon"),
    board("rank_music", "音乐", "https://api.bilibili.com/x/web-interface/ranking/v2?rid=3&type=all", "t_bilibili_rank_music"),
    board("rank_dance", "舞蹈", "https://api.bilibili.com/x/web-interface/ranking/v2?rid=129&type=all", "t_bilibili_rank_dance"),
    board("rank_game", "游戏", "https://api.bilibili.com/x/web-interface/ranking/v2?rid=4&type=all", "t_bilibili_rank_game"),
    board("rank_tech", "科技", "https://api.bilibili.com/x/web-interface/ranking/v2?rid=188&type=all", "t_bilibili_rank_tech"),
    board("rank_knowledge", "知识", "https://api.bilibili.com/x/web-interface/ranking/v2?rid=36&type=all", "t_bilibili_rank_knowledge"),
    board("rank_sport", "运动", "https://api.bilibili.com/x/web-interface/ranking/v2?rid=234&type=all", "t_bilibili_rank_sport"),
    board("rank_car", "汽车", "https://api.bilibili.com/x/web-interface/ranking/v2?rid=223&type=all", "t_bilibili_rank_car"),
    board("rank_life", "生活", "https://api.bilibili.com/x/web-interface/ranking/v2?rid=160&type=all", "t_bilibili_rank_life"),
    board("rank_food", "美食", "https://api.bilibili.com/x/web-interface/ranking/v2?rid=211&type=all", "t_bilibili_rank_food"),
    board("rank_animal", "动物圈", "https://api.bilibili.com/x/web-interface/ranking/v2?rid=217&type=all", "t_bilibili_rank_animal"),
    board("rank_auto_tune", "鬼畜", "https://api.bilibili.com/x/web-interface/ranking/v2?rid=119&type=all", "t_bilibili_rank_auto"),
    board("rank_fashion", "时尚", "https://api.bilibili.com/x/web-interface/ranking/v2?rid=155&type=all", "t_bilibili_rank_fashion"),
    board("rank_ent", "娱乐", "https://api.bilibili.com/x/web-interface/ranking/v2?rid=5&type=all", "t_bilibili_rank_ent"),
    board("rank_film", "影视", "https://api.bilibili.com/x/web-interface/ranking/v2?rid=181&type=all", "t_bilibili_rank_film"),
    board("rank_origin", "原创", "https://api.bilibili.com/x/web-interface/ranking/v2?rid=0&type=origin", "t_bilibili_rank_origin"),
    board("rank_new", "新人", "https://api.bilibili.com/x/web-interface/ranking/v2?rid=0&type=rookie", "t_bilibili_rank_new"),
];

/// Boards listing pgc seasons (drama, film...).
pub const PLAY_BOARDS: &[Board] = &[
    board("rank_drama", "番剧", "https://api.bilibili.com/pgc/web/rank/list?day=3&season_type=1", "t_bilibili_rank_drama"),
    board("rank_cn_cartoon", "国产动画", "https://api.bilibili.com/pgc/season/rank/web/list?day=3&season_type=4", "t_bilibili_rank_cn_cartoon"),
    board("rank_documentary", "纪录片", "https://api.bilibili.com/pgc/season/rank/web/list?day=3&season_type=3", "t_bilibili_rank_documentary"),
    board("rank_movie", "电影", "https://api.bilibili.com/pgc/season/rank/web/list?day=3&season_type=2", "t_bilibili_rank_movie"),
    board("rank_tv", "电视剧", "https://api.bilibili.com/pgc/season/rank/web/list?day=3&season_type=5", "t_bilibili_rank_tv"),
    board("rank_variety", "综艺", "https://api.bilibili.com/pgc/season/rank/web/list?day=3&season_type=7", "t_bilibili_rank_variety"),
];

fn find_board(boards: &[Board], name: &str) -> Option<Board> {
    boards.iter().copied().find(|board| board.name == name)
}

macro_rules! board_spider {
    ($spider:ident, $boards:ident, $data:ty, $item:ty) => {
        #[derive(Debug)]
        pub struct $spider {
            board: Board,
            validator: Bili<$data>,
        }

        impl $spider {
            pub fn new(board: Board) -> Self {
                Self {
                    board,
                    validator: Schema::new(),
                }
            }

            pub fn named(name: &str) -> Option<Self> {
                find_board($boards, name).map(Self::new)
            }
        }

        #[async_trait]
        impl Spider for $spider {
            type Validator = Bili<$data>;
            type Item = $item;

            fn name(&self) -> String {
                self.board.name.into()
            }

            fn alias(&self) -> String {
                self.board.alias.into()
            }

            fn platform(&self) -> Platform {
                Platform::Bilibili
            }

            fn table(&self) -> String {
                self.board.table.into()
            }

            fn table_init(&self) -> TableInit {
                TableInit::Recreate
            }

            fn validator(&self) -> &Self::Validator {
                &self.validator
            }

            async fn request(
                &self,
                _ctx: &RunContext,
                _cursor: &Cursor,
                _session: &Session,
            ) -> Result<Request, CrawlError> {
                Ok(Request::get(self.board.url))
            }

            fn extract(
                &self,
                body: BiliResponse<$data>,
                _ctx: &RunContext,
                _cursor: &Cursor,
            ) -> Result<Page<$item>, ExtractError> {
                Ok(Page::last(body.into_data()?.list))
            }
        }
    };
}

board_spider!(VideoBoardSpider, VIDEO_BOARDS, VideoList, VideoItem);
board_spider!(PlayBoardSpider, PLAY_BOARDS, PlayList, PlayItem);

/// Videos of one uploader (`target` is the uploader's mid). Signed with WBI.
#[derive(Debug)]
pub struct AuthorSpider {
    sess_data: Option<String>,
    mixin_key: OnceCell<String>,
    validator: Bili<AuthorVideoData>,
}

impl AuthorSpider {
    const PAGE_SIZE: u32 = 30;
    const DM_RAND: &'static [u8] = b"ABCDEFGHIJK";

    pub fn new(sess_data: Option<String>) -> Self {
        Self {
            sess_data,
            mixin_key: OnceCell::new(),
            validator: Schema::new(),
        }
    }

    /// Two distinct letters, the way the web player fills `dm_*_str`.
    fn dm_str() -> String {
        let len = Self::DM_RAND.len();
        let first = fastrand::usize(..len);
        let second = (first + 1 + fastrand::usize(..len - 1)) % len;
        [Self::DM_RAND[first] as char, Self::DM_RAND[second] as char]
            .iter()
            .collect()
    }
}

#[async_trait]
impl Spider for AuthorSpider {
    type Validator = Bili<AuthorVideoData>;
    type Item = AuthorVideoItem;

    fn name(&self) -> String {
        "author".into()
    }

    fn alias(&self) -> String {
        "up主".into()
    }

    fn platform(&self) -> Platform {
        Platform::Bilibili
    }

    fn table(&self) -> String {
        "t_bilibili_author_video".into()
    }

    fn validator(&self) -> &Self::Validator {
        &self.validator
    }

    fn pacing(&self) -> Option<Pacing> {
        Some(Pacing::Between(Duration::from_secs(5), Duration::from_secs(11)))
    }

    fn first_cursor(&self, ctx: &RunContext) -> Cursor {
        Cursor::Page(ctx.start_page)
    }

    async fn before(
        &self,
        fetch: &dyn Fetch,
        retry: RetryPolicy,
        session: &mut Session,
        ctx: &RunContext,
    ) -> Result<(), CrawlError> {
        ctx.require_target()?;
        session.set_header("accept-language", "zh-CN,zh;q=0.9,en;q=0.8");
        if let Some(sess_data) = &self.sess_data {
            session.set_cookie("SESSDATA", sess_data.clone());
        }

        let session: &Session = session;
        self.mixin_key
            .get_or_try_init(|| async {
                let nav = Request::get(wbi::NAV_URL);
                let nav = &nav;
                let response = retry
                    .execute(move |_| async move {
                        fetch.fetch(session, nav).await.map_err(CrawlError::from)
                    })
                    .await?;
                tracing::debug!("wbi keys fetched");
                Ok::<_, CrawlError>(wbi::mixin_key_from_nav(&response.value.body)?)
            })
            .await?;
        Ok(())
    }

    async fn request(
        &self,
        ctx: &RunContext,
        cursor: &Cursor,
        _session: &Session,
    ) -> Result<Request, CrawlError> {
        let mid = ctx.require_target()?;
        let key = self
            .mixin_key
            .get()
            .ok_or(ExtractError::Missing { what: "wbi mixin key" })?;
        let params = [
            ("mid", mid.to_string()),
            ("ps", ctx.page_size.unwrap_or(Self::PAGE_SIZE).to_string()),
            ("tid", "0".to_string()),
            ("pn", page_number(cursor).to_string()),
            ("keyword", String::new()),
            ("order", "pubdate".to_string()),
            ("platform", "web".to_string()),
            ("web_location", String::new()),
            ("dm_img_list", "[]".to_string()),
            ("dm_img_str", Self::dm_str()),
            ("dm_cover_img_str", Self::dm_str()),
            ("dm_img_inter", r#"{"ds":[],"wh":[0,0,0],"of":[0,0,0]}"#.to_string()),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect();
        let signed = wbi::sign(params, key, chrono::Utc::now().timestamp());
        Ok(Request::get(AUTHOR_URL).params(signed))
    }

    fn extract(
        &self,
        body: BiliResponse<AuthorVideoData>,
        ctx: &RunContext,
        cursor: &Cursor,
    ) -> Result<Page<AuthorVideoItem>, ExtractError> {
        let page_size = ctx.page_size.unwrap_or(Self::PAGE_SIZE);
        Ok(Page::numbered(
            body.into_data()?.list.vlist,
            page_number(cursor),
            page_size,
        ))
    }
}

/// Dynamics posted by one uploader. Needs a logged-in `SESSDATA` cookie.
#[derive(Debug)]
pub struct FeedSpider {
    sess_data: Option<String>,
    validator: Bili<FeedData>,
}

impl FeedSpider {
    pub fn new(sess_data: Option<String>) -> Self {
        Self {
            sess_data,
            validator: Schema::new(),
        }
    }
}

#[async_trait]
impl Spider for FeedSpider {
    type Validator = Bili<FeedData>;
    type Item = FeedRecord;

    fn name(&self) -> String {
        "feed".into()
    }

    fn alias(&self) -> String {
        "up主动态".into()
    }

    fn platform(&self) -> Platform {
        Platform::Bilibili
    }

    fn table(&self) -> String {
        "t_bilibili_author_feed".into()
    }

    fn validator(&self) -> &Self::Validator {
        &self.validator
    }

    fn first_cursor(&self, _ctx: &RunContext) -> Cursor {
        Cursor::Token(String::new())
    }

    async fn before(
        &self,
        _fetch: &dyn Fetch,
        _retry: RetryPolicy,
        session: &mut Session,
        ctx: &RunContext,
    ) -> Result<(), CrawlError> {
        ctx.require_target()?;
        let sess_data = self
            .sess_data
            .as_deref()
            .ok_or(ConfigError::Missing("BILIBILI_SESS_DATA"))?;
        session.set_cookie("SESSDATA", sess_data);
        Ok(())
    }

    async fn request(
        &self,
        ctx: &RunContext,
        cursor: &Cursor,
        _session: &Session,
    ) -> Result<Request, CrawlError> {
        let offset = match cursor {
            Cursor::Token(offset) => offset.as_str(),
            _ => "",
        };
        Ok(Request::get(FEED_URL)
            .param("offset", offset)
            .param("host_mid", ctx.require_target()?)
            .param("timezone_offset", -480)
            .param("platform", "web")
            .param("web_location", "")
            .param(
                "features",
                "itemOpusStyle,listOnlyfans,opusBigCover,onlyfansVote",
            ))
    }

    fn extract(
        &self,
        body: BiliResponse<FeedData>,
        _ctx: &RunContext,
        _cursor: &Cursor,
    ) -> Result<Page<FeedRecord>, ExtractError> {
        let data = body.into_data()?;
        let items = data.items.into_iter().map(FeedRecord::from).collect();
        let next = data.has_more.then_some(Cursor::Token(data.offset));
        Ok(Page::new(items, next))
    }

    fn after_page(&self, page: &Page<FeedRecord>, _session: &mut Session) {
        for item in &page.items {
            match &item.desc {
                Some(desc) => tracing::info!("{} at {}: {}", item.action, item.pub_time, desc),
                None => tracing::info!("{} at {}.", item.action, item.pub_time),
            }
        }
    }
}
