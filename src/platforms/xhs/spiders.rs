use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    error::{CrawlError, ExtractError},
    http::{Cookies, Fetch, Headers, Request, Session},
    retry::RetryPolicy,
    sign::{SignRequest, Signer},
    spider::{Cursor, Page, Platform, RunContext, Spider},
    validate::{PassThrough, Schema},
};

use super::models::{initial_state, AuthorNote, ProfileNote, UserPostedData, XhsResponse};

const PROFILE_URL: &str = "https://www.xiaohongshu.com/user/profile";
const USER_POSTED_URL: &str = "https://edith.xiaohongshu.com/api/sns/web/v1/user_posted";
const TABLE: &str = "t_xhs_author_notes";

/// Logged-in web identity: cookies plus any fixed headers.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub cookies: Cookies,
    pub headers: Headers,
}

impl Identity {
    fn apply(&self, session: &mut Session) {
        session.merge_cookies(&self.cookies);
        session.merge_headers(&self.headers);
    }
}

/// Notes of one author read from the profile page. The page only embeds the
/// first batch of notes, so this never goes past one page.
#[derive(Debug, Default)]
pub struct AuthorPageSpider {
    identity: Identity,
    validator: PassThrough,
}

impl AuthorPageSpider {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            validator: PassThrough,
        }
    }
}

#[async_trait]
impl Spider for AuthorPageSpider {
    type Validator = PassThrough;
    type Item = AuthorNote;

    fn name(&self) -> String {
        "author".into()
    }

    fn alias(&self) -> String {
        "作者主页".into()
    }

    fn platform(&self) -> Platform {
        Platform::Xhs
    }

    fn table(&self) -> String {
        TABLE.into()
    }

    fn validator(&self) -> &Self::Validator {
        &self.validator
    }

    async fn before(
        &self,
        _fetch: &dyn Fetch,
        _retry: RetryPolicy,
        session: &mut Session,
        ctx: &RunContext,
    ) -> Result<(), CrawlError> {
        ctx.require_target()?;
        self.identity.apply(session);
        Ok(())
    }

    async fn request(
        &self,
        ctx: &RunContext,
        _cursor: &Cursor,
        _session: &Session,
    ) -> Result<Request, CrawlError> {
        Ok(Request::get(format!("{}/{}", PROFILE_URL, ctx.require_target()?)))
    }

    fn extract(
        &self,
        body: String,
        ctx: &RunContext,
        _cursor: &Cursor,
    ) -> Result<Page<AuthorNote>, ExtractError> {
        let author_id = ctx.target.as_deref().unwrap_or_default();
        let state = initial_state(&body)?;
        let notes = state
            .get("user")
            .and_then(|user| user.get("notes"))
            .cloned()
            .ok_or(ExtractError::Missing { what: "user.notes" })?;
        let groups: Vec<Vec<ProfileNote>> =
            serde_json::from_value(notes).map_err(|err| ExtractError::Malformed {
                what: "user.notes",
                reason: err.to_string(),
            })?;
        let items = groups
            .into_iter()
            .flatten()
            .map(|note| {
                let mut summary = note.note_card;
                if summary.note_id.is_empty() {
                    summary.note_id = note.id;
                }
                AuthorNote::new(summary, author_id)
            })
            .filter(|note| !note.note_id.is_empty())
            .collect();
        Ok(Page::last(items))
    }
}

/// Notes of one author paged through the `user_posted` API. Every page must
/// carry headers produced by `signer`.
pub struct AuthorPostedSpider {
    identity: Identity,
    signer: Arc<dyn Signer>,
    validator: Schema<XhsResponse<UserPostedData>>,
}

impl AuthorPostedSpider {
    const PAGE_SIZE: u32 = 30;

    pub fn new(identity: Identity, signer: Arc<dyn Signer>) -> Self {
        Self {
            identity,
            signer,
            validator: Schema::new(),
        }
    }
}

#[async_trait]
impl Spider for AuthorPostedSpider {
    type Validator = Schema<XhsResponse<UserPostedData>>;
    type Item = AuthorNote;

    fn name(&self) -> String {
        "author".into()
    }

    fn alias(&self) -> String {
        "作者主页".into()
    }

    fn platform(&self) -> Platform {
        Platform::Xhs
    }

    fn table(&self) -> String {
        TABLE.into()
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
        self.identity.apply(session);
        session.set_header("origin", "https://www.xiaohongshu.com");
        session.set_header("referer", "https://www.xiaohongshu.com/");
        Ok(())
    }

    async fn request(
        &self,
        ctx: &RunContext,
        cursor: &Cursor,
        session: &Session,
    ) -> Result<Request, CrawlError> {
        let cursor = match cursor {
            Cursor::Token(token) => token.as_str(),
            _ => "",
        };
        let request = Request::get(USER_POSTED_URL)
            .param("num", ctx.page_size.unwrap_or(Self::PAGE_SIZE))
            .param("cursor", cursor)
            .param("user_id", ctx.require_target()?)
            .param("image_formats", "jpg,webp,avif");
        let url = request.full_url()?;
        let signed = self
            .signer
            .sign(SignRequest {
                url: url.as_str(),
                headers: session.headers(),
                params: &request.params,
            })
            .await?;
        Ok(request.headers(signed))
    }

    fn extract(
        &self,
        body: XhsResponse<UserPostedData>,
        ctx: &RunContext,
        _cursor: &Cursor,
    ) -> Result<Page<AuthorNote>, ExtractError> {
        let author_id = ctx.target.as_deref().unwrap_or_default();
        let data = body.into_data()?;
        let items = data
            .notes
            .into_iter()
            .map(|summary| AuthorNote::new(summary, author_id))
            .collect();
        let next = (data.has_more && !data.cursor.is_empty()).then_some(Cursor::Token(data.cursor));
        Ok(Page::new(items, next))
    }
}
