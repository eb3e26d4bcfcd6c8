use std::{collections::BTreeMap, sync::OnceLock};

use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize};

use crate::{
    error::{ExtractError, ValidationError},
    store::{Column, Field, Record},
    validate::Envelope,
};

/// `{code, success, msg, data}` as returned by the `edith` API host.
#[derive(Debug, Deserialize)]
pub struct XhsResponse<D> {
    #[serde(default)]
    pub code: i64,
    pub success: bool,
    #[serde(default, alias = "message")]
    pub msg: Option<String>,
    pub data: Option<D>,
}

impl<D: DeserializeOwned + Send> Envelope for XhsResponse<D> {
    fn check(&self) -> Result<(), ValidationError> {
        if !self.success {
            return Err(ValidationError::Business {
                code: self.code,
                message: self.msg.clone().unwrap_or_default(),
            });
        }
        if self.data.is_none() {
            return Err(ValidationError::Shape("successful response without data".into()));
        }
        Ok(())
    }
}

impl<D> XhsResponse<D> {
    pub fn into_data(self) -> Result<D, ExtractError> {
        self.data.ok_or(ExtractError::Missing { what: "data" })
    }
}

/// A note as listed on a profile, in either the API's snake_case or the web
/// state's camelCase.
#[derive(Debug, Clone, Deserialize)]
pub struct NoteSummary {
    #[serde(default, alias = "noteId")]
    pub note_id: String,
    #[serde(default, rename = "display_title", alias = "displayTitle")]
    pub title: String,
    #[serde(default, rename = "type")]
    pub note_type: String,
}

#[derive(Debug, Deserialize)]
pub struct UserPostedData {
    #[serde(default)]
    pub cursor: String,
    pub has_more: bool,
    #[serde(default)]
    pub notes: Vec<NoteSummary>,
}

#[derive(Debug, Deserialize)]
pub struct ProfileNote {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "noteCard")]
    pub note_card: NoteSummary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorNote {
    pub note_id: String,
    pub author_id: String,
    pub note_title: String,
    pub note_type: String,
}

impl AuthorNote {
    pub fn new(summary: NoteSummary, author_id: &str) -> Self {
        Self {
            note_id: summary.note_id,
            author_id: author_id.to_string(),
            note_title: summary.title,
            note_type: summary.note_type,
        }
    }
}

impl Record for AuthorNote {
    const KEY: &'static str = "note_id";

    fn columns() -> &'static [Column] {
        const COLUMNS: &[Column] = &[
            Column::text("note_id"),
            Column::text("author_id"),
            Column::text("note_title"),
            Column::text("note_type"),
        ];
        COLUMNS
    }

    fn key(&self) -> &str {
        &self.note_id
    }

    fn fields(&self) -> Vec<Field> {
        vec![
            self.note_id.as_str().into(),
            self.author_id.as_str().into(),
            self.note_title.as_str().into(),
            self.note_type.as_str().into(),
        ]
    }
}

/// Full note as embedded in an explore page.
#[derive(Debug, Deserialize)]
pub struct NoteDetail {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default, rename = "imageList")]
    pub image_list: Vec<NoteImage>,
    #[serde(default)]
    pub video: Option<NoteVideo>,
}

#[derive(Debug, Deserialize)]
pub struct NoteImage {
    #[serde(rename = "urlDefault")]
    pub url_default: String,
}

#[derive(Debug, Deserialize)]
pub struct NoteVideo {
    pub media: VideoMedia,
}

#[derive(Debug, Deserialize)]
pub struct VideoMedia {
    /// Streams grouped by codec family (`h264`, `h265`...).
    #[serde(default)]
    pub stream: BTreeMap<String, Vec<VideoStream>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoStream {
    #[serde(rename = "masterUrl")]
    pub master_url: String,
    #[serde(default, rename = "qualityType")]
    pub quality_type: String,
    #[serde(default, rename = "videoCodec")]
    pub video_codec: String,
}

fn cached(cell: &'static OnceLock<Result<Regex, regex::Error>>, pattern: &str) -> Result<&'static Regex, ExtractError> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|err| ExtractError::Malformed {
            what: "pattern",
            reason: err.to_string(),
        })
}

/// The `window.__INITIAL_STATE__` object a web page is hydrated from. It is a
/// JavaScript literal, so bare `undefined` is read as `null`.
pub fn initial_state(html: &str) -> Result<serde_json::Value, ExtractError> {
    static STATE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    static UNDEFINED: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

    let state = cached(&STATE, r"(?s)window\.__INITIAL_STATE__\s*=\s*(\{.*?\})\s*</script>")?;
    let raw = state
        .captures(html)
        .and_then(|captures| captures.get(1))
        .ok_or(ExtractError::Missing {
            what: "initial state",
        })?
        .as_str();
    let json = cached(&UNDEFINED, r"\bundefined\b")?.replace_all(raw, "null");
    serde_json::from_str(&json).map_err(|err| ExtractError::Malformed {
        what: "initial state",
        reason: err.to_string(),
    })
}
