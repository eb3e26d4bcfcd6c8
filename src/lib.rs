//! Spiders for bilibili and xiaohongshu built on one lifecycle: request,
//! validate, extract and persist, with linear retries around each page.

pub mod config;
pub mod crawler;
pub mod error;
pub mod http;
pub mod media;
pub mod platforms;
pub mod registry;
pub mod retry;
pub mod sign;
pub mod spider;
pub mod store;
pub mod validate;

pub use config::Settings;
pub use crawler::{Crawler, CrawlerOptions, RunFailure, RunReport};
pub use error::CrawlError;
pub use spider::{Cursor, Page, Platform, RunContext, Spider};
