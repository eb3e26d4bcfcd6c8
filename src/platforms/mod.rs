//! Concrete spiders, one module per platform.

pub mod bilibili;
pub mod xhs;
