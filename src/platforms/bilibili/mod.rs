//! bilibili: popular lists, ranking boards and uploader pages.

pub mod models;
mod spiders;
pub mod wbi;

pub use spiders::{
    AuthorSpider, Board, FeedSpider, PlayBoardSpider, PopularSpider, PreciousSpider,
    VideoBoardSpider, PLAY_BOARDS, VIDEO_BOARDS,
};
