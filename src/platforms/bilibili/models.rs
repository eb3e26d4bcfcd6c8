use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    error::{ExtractError, ValidationError},
    store::{Column, Field, Record},
    validate::Envelope,
};

/// `{code, message, data}`; pgc endpoints carry the payload under `result`.
#[derive(Debug, Deserialize)]
pub struct BiliResponse<D> {
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(alias = "result")]
    pub data: Option<D>,
}

impl<D: DeserializeOwned + Send> Envelope for BiliResponse<D> {
    fn check(&self) -> Result<(), ValidationError> {
        if self.code != 0 {
            return Err(ValidationError::Business {
                code: self.code,
                message: self.message.clone().unwrap_or_default(),
            });
        }
        if self.data.is_none() {
            return Err(ValidationError::Shape("successful response without data".into()));
        }
        Ok(())
    }
}

impl<D> BiliResponse<D> {
    pub fn into_data(self) -> Result<D, ExtractError> {
        self.data.ok_or(ExtractError::Missing { what: "data" })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoOwner {
    pub mid: i64,
    pub name: String,
    pub face: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoStat {
    pub aid: i64,
    pub coin: i64,
    pub danmaku: i64,
    pub dislike: i64,
    pub favorite: i64,
    pub his_rank: i64,
    pub like: i64,
    pub now_rank: i64,
    pub reply: i64,
    pub share: i64,
    pub view: i64,
}

/// A video as listed by the popular, precious and ranking endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VideoItem {
    pub aid: i64,
    pub bvid: String,
    pub cid: i64,
    pub desc: String,
    pub owner: VideoOwner,
    pub pubdate: i64,
    #[serde(default)]
    pub short_link_v2: String,
    pub stat: VideoStat,
    pub tid: i64,
    pub title: String,
    pub tname: String,
    /// Only on the precious list.
    #[serde(default)]
    pub achievement: Option<String>,
}

fn to_json<T: Serialize>(value: &T) -> Field {
    serde_json::to_string(value).map(Field::Text).unwrap_or(Field::Null)
}

impl Record for VideoItem {
    const KEY: &'static str = "bvid";

    fn columns() -> &'static [Column] {
        const COLUMNS: &[Column] = &[
            Column::text("bvid"),
            Column::integer("aid"),
            Column::integer("cid"),
            Column::text("title"),
            Column::text("tname"),
            Column::text("desc"),
            Column::text("owner"),
            Column::integer("pubdate"),
            Column::text("short_link_v2"),
            Column::text("stat"),
            Column::integer("tid"),
            Column::text("achievement"),
        ];
        COLUMNS
    }

    fn key(&self) -> &str {
        &self.bvid
    }

    fn fields(&self) -> Vec<Field> {
        vec![
            self.bvid.as_str().into(),
            self.aid.into(),
            self.cid.into(),
            self.title.as_str().into(),
            self.tname.as_str().into(),
            self.desc.as_str().into(),
            to_json(&self.owner),
            self.pubdate.into(),
            self.short_link_v2.as_str().into(),
            to_json(&self.stat),
            self.tid.into(),
            self.achievement.clone().into(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayStat {
    pub danmaku: i64,
    pub follow: i64,
    pub series_follow: i64,
    pub view: i64,
}

/// An entry of a pgc (drama, film, documentary...) ranking.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlayItem {
    pub rank: i64,
    #[serde(default)]
    pub rating: String,
    pub stat: PlayStat,
    pub title: String,
    pub url: String,
}

impl Record for PlayItem {
    const KEY: &'static str = "url";

    fn columns() -> &'static [Column] {
        const COLUMNS: &[Column] = &[
            Column::text("url"),
            Column::integer("rank"),
            Column::text("rating"),
            Column::text("stat"),
            Column::text("title"),
        ];
        COLUMNS
    }

    fn key(&self) -> &str {
        &self.url
    }

    fn fields(&self) -> Vec<Field> {
        vec![
            self.url.as_str().into(),
            self.rank.into(),
            self.rating.as_str().into(),
            to_json(&self.stat),
            self.title.as_str().into(),
        ]
    }
}

#[derive(Debug, Deserialize)]
pub struct PopularData {
    pub no_more: bool,
    #[serde(default)]
    pub list: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
pub struct VideoList {
    #[serde(default)]
    pub list: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
pub struct PlayList {
    #[serde(default)]
    pub list: Vec<PlayItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthorVideoItem {
    pub bvid: String,
    pub aid: i64,
    pub title: String,
    pub mid: i64,
    pub comment: i64,
    #[serde(default)]
    pub description: Option<String>,
    pub is_pay: i64,
    /// `mm:ss`
    pub length: String,
}

impl Record for AuthorVideoItem {
    const KEY: &'static str = "bvid";

    fn columns() -> &'static [Column] {
        const COLUMNS: &[Column] = &[
            Column::text("bvid"),
            Column::integer("aid"),
            Column::text("title"),
            Column::integer("mid"),
            Column::integer("comment"),
            Column::text("description"),
            Column::integer("is_pay"),
            Column::text("length"),
        ];
        COLUMNS
    }

    fn key(&self) -> &str {
        &self.bvid
    }

    fn fields(&self) -> Vec<Field> {
        vec![
            self.bvid.as_str().into(),
            self.aid.into(),
            self.title.as_str().into(),
            self.mid.into(),
            self.comment.into(),
            self.description.clone().into(),
            self.is_pay.into(),
            self.length.as_str().into(),
        ]
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthorVideoData {
    pub list: AuthorVideoList,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuthorVideoList {
    #[serde(default)]
    pub vlist: Vec<AuthorVideoItem>,
}

#[derive(Debug, Deserialize)]
pub struct FeedData {
    pub has_more: bool,
    #[serde(default)]
    pub items: Vec<FeedItem>,
    #[serde(default)]
    pub offset: String,
}

#[derive(Debug, Deserialize)]
pub struct FeedItem {
    pub id_str: String,
    pub modules: FeedModules,
}

#[derive(Debug, Deserialize)]
pub struct FeedModules {
    pub module_author: FeedAuthor,
    pub module_dynamic: FeedDynamic,
    pub module_stat: FeedStat,
}

#[derive(Debug, Deserialize)]
pub struct FeedAuthor {
    pub name: String,
    pub pub_action: String,
    pub pub_time: String,
    #[serde(default)]
    pub jump_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FeedDynamic {
    #[serde(default)]
    pub desc: Option<FeedText>,
}

#[derive(Debug, Deserialize)]
pub struct FeedText {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct FeedStat {
    pub comment: FeedCount,
    pub like: FeedCount,
    pub forward: FeedCount,
}

#[derive(Debug, Deserialize)]
pub struct FeedCount {
    pub count: i64,
}

/// One dynamic of an uploader's feed, flattened for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRecord {
    pub id_str: String,
    pub pub_time: String,
    /// Author name followed by what they did, e.g. "someone投稿了视频".
    pub action: String,
    pub jump_url: Option<String>,
    pub desc: Option<String>,
    pub comment: i64,
    pub like: i64,
    pub forward: i64,
}

impl From<FeedItem> for FeedRecord {
    fn from(item: FeedItem) -> Self {
        let FeedModules {
            module_author: author,
            module_dynamic: dynamic,
            module_stat: stat,
        } = item.modules;
        Self {
            id_str: item.id_str,
            pub_time: author.pub_time,
            action: format!("{}{}", author.name, author.pub_action),
            jump_url: author.jump_url,
            desc: dynamic.desc.map(|desc| desc.text),
            comment: stat.comment.count,
            like: stat.like.count,
            forward: stat.forward.count,
        }
    }
}

impl Record for FeedRecord {
    const KEY: &'static str = "id_str";

    fn columns() -> &'static [Column] {
        const COLUMNS: &[Column] = &[
            Column::text("id_str"),
            Column::text("pub_time"),
            Column::text("action"),
            Column::text("jump_url"),
            Column::text("desc"),
            Column::integer("comment"),
            Column::integer("like"),
            Column::integer("forward"),
        ];
        COLUMNS
    }

    fn key(&self) -> &str {
        &self.id_str
    }

    fn fields(&self) -> Vec<Field> {
        vec![
            self.id_str.as_str().into(),
            self.pub_time.as_str().into(),
            self.action.as_str().into(),
            self.jump_url.clone().into(),
            self.desc.clone().into(),
            self.comment.into(),
            self.like.into(),
            self.forward.into(),
        ]
    }
}

/// Image keys served by the `nav` endpoint, logged in or not.
#[derive(Debug, Deserialize)]
pub struct NavResponse {
    pub data: Option<NavData>,
}

#[derive(Debug, Deserialize)]
pub struct NavData {
    pub wbi_img: Option<WbiImg>,
}

#[derive(Debug, Deserialize)]
pub struct WbiImg {
    pub img_url: String,
    pub sub_url: String,
}
