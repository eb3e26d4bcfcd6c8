//! Xiaohongshu (xhs): author notes and note media.

mod downloader;
pub mod models;
mod spiders;

pub use downloader::{note_detail, NoteDownloader};
pub use spiders::{AuthorPageSpider, AuthorPostedSpider, Identity};
