use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::{
    error::{DownloadError, ExtractError},
    http::{HttpClient, Request, Session},
    media::MediaDownloader,
};

use super::models::{initial_state, NoteDetail, VideoStream};

const EXPLORE_URL: &str = "https://www.xiaohongshu.com/explore";

/// Saves a note's text, images and videos under `<save_dir>/<note_id>/`.
#[derive(Debug, Clone)]
pub struct NoteDownloader {
    client: HttpClient,
    session: Session,
}

impl NoteDownloader {
    pub fn new(client: HttpClient, session: Session) -> Self {
        Self { client, session }
    }
}

/// The first entry of `note.noteDetailMap` in an explore page.
pub fn note_detail(html: &str) -> Result<NoteDetail, ExtractError> {
    let state = initial_state(html)?;
    let detail = state
        .get("note")
        .and_then(|note| note.get("noteDetailMap"))
        .and_then(|map| map.as_object())
        .and_then(|map| map.values().next())
        .and_then(|entry| entry.get("note"))
        .cloned()
        .ok_or(ExtractError::Missing {
            what: "note.noteDetailMap",
        })?;
    serde_json::from_value(detail).map_err(|err| ExtractError::Malformed {
        what: "note detail",
        reason: err.to_string(),
    })
}

/// Every stream of every codec, owned so the download loop holds no borrow
/// of `note` across awaits.
fn video_streams(note: &NoteDetail) -> Vec<VideoStream> {
    note.video
        .iter()
        .flat_map(|video| video.media.stream.values())
        .flatten()
        .cloned()
        .collect()
}

#[async_trait]
impl MediaDownloader for NoteDownloader {
    async fn download(&self, id: &str, save_dir: &Path) -> Result<PathBuf, DownloadError> {
        let page = self
            .client
            .request_retrying(&self.session, &Request::get(format!("{}/{}", EXPLORE_URL, id)))
            .await?;
        let note = note_detail(&page.body)?;

        let dir = save_dir.join(id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| DownloadError::Io {
                path: dir.clone(),
                source,
            })?;
        let text_path = dir.join("note.txt");
        let text = format!("{}\n\n{}", note.title, note.desc.as_deref().unwrap_or_default());
        tokio::fs::write(&text_path, text)
            .await
            .map_err(|source| DownloadError::Io {
                path: text_path.clone(),
                source,
            })?;

        for (index, image) in note.image_list.iter().enumerate() {
            let path = dir.join("images").join(format!("img-{}.webp", index));
            self.client
                .download_to(&self.session, &Request::get(image.url_default.as_str()), &path)
                .await?;
        }
        for (index, stream) in video_streams(&note).into_iter().enumerate() {
            let path = dir.join("videos").join(format!(
                "video-{}-{}-{}.mp4",
                index, stream.quality_type, stream.video_codec
            ));
            self.client
                .download_to(&self.session, &Request::get(stream.master_url.as_str()), &path)
                .await?;
        }
        tracing::info!(
            note = id,
            images = note.image_list.len(),
            "note saved to '{}'",
            dir.display()
        );
        Ok(dir)
    }
}
