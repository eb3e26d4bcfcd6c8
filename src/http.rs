//! Outbound HTTP with rotating identity, per-run header/cookie state and
//! optional proxies.

mod user_agent;

use std::{collections::BTreeMap, path::Path};

use async_trait::async_trait;
use reqwest::{header::COOKIE, Method};
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;

use crate::{
    config::{Proxies, Settings},
    error::HttpError,
    retry::{RetryError, RetryPolicy},
};

pub use user_agent::random_user_agent;

/// Header names are stored lowercased so lookups are case-insensitive.
pub type Headers = BTreeMap<String, String>;
pub type Cookies = BTreeMap<String, String>;
pub type Params = Vec<(String, String)>;

/// Mutable identity for one crawl run.
///
/// Created from the client's defaults at run start and passed explicitly into
/// every request, so concurrent runs never observe each other's signatures or
/// cookies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    headers: Headers,
    cookies: Cookies,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_header(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn merge_headers(&mut self, headers: &Headers) {
        for (name, value) in headers {
            self.set_header(name, value.clone());
        }
    }

    pub fn set_cookie(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.insert(name.into(), value.into());
    }

    pub fn merge_cookies(&mut self, cookies: &Cookies) {
        self.cookies
            .extend(cookies.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn cookies(&self) -> &Cookies {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }
}

/// Parse a `k=v; k2=v2` cookie string. Pairs without `=` are skipped.
pub fn parse_cookie_string(raw: &str) -> Cookies {
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn cookie_header(cookies: &Cookies) -> Option<String> {
    if cookies.is_empty() {
        return None;
    }
    Some(
        cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub params: Params,
    pub headers: Headers,
    pub cookies: Cookies,
    pub json: Option<serde_json::Value>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            params: Vec::new(),
            headers: Headers::new(),
            cookies: Cookies::new(),
            json: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((name.into(), value.to_string()));
        self
    }

    pub fn params(mut self, params: impl IntoIterator<Item = (String, String)>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        for (name, value) in headers {
            self.headers.insert(name.to_ascii_lowercase(), value);
        }
        self
    }

    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.json = Some(body);
        self
    }

    /// The URL with `params` appended, encoded the way it goes on the wire.
    pub fn full_url(&self) -> Result<url::Url, HttpError> {
        let mut url = url::Url::parse(&self.url)
            .map_err(|err| HttpError::InvalidRequest(format!("'{}': {}", self.url, err)))?;
        if !self.params.is_empty() {
            url.query_pairs_mut().extend_pairs(
                self.params
                    .iter()
                    .map(|(name, value)| (name.as_str(), value.as_str())),
            );
        }
        Ok(url)
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub url: String,
    pub body: String,
}

impl Response {
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.body)
    }
}

/// A source of raw responses. `HttpClient` is the production implementation;
/// tests script their own.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, session: &Session, request: &Request) -> Result<Response, HttpError>;
}

#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub headers: Headers,
    pub cookies: Cookies,
    pub proxies: Proxies,
    pub retry: RetryPolicy,
}

impl ClientOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            headers: settings.default_headers.clone(),
            cookies: Cookies::new(),
            proxies: settings.proxies.clone(),
            retry: settings.retry,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    defaults: Session,
    retry: RetryPolicy,
}

impl HttpClient {
    pub fn new(options: ClientOptions) -> Result<Self, HttpError> {
        let invalid_proxy =
            |url: &str, err: reqwest::Error| HttpError::InvalidRequest(format!("proxy '{}': {}", url, err));
        let mut builder = reqwest::Client::builder();
        if let Some(url) = options.proxies.all.as_deref() {
            builder = builder.proxy(reqwest::Proxy::all(url).map_err(|err| invalid_proxy(url, err))?);
        }
        if let Some(url) = options.proxies.http.as_deref() {
            builder = builder.proxy(reqwest::Proxy::http(url).map_err(|err| invalid_proxy(url, err))?);
        }
        if let Some(url) = options.proxies.https.as_deref() {
            builder = builder.proxy(reqwest::Proxy::https(url).map_err(|err| invalid_proxy(url, err))?);
        }
        let inner = builder
            .build()
            .map_err(|err| HttpError::InvalidRequest(format!("client: {}", err)))?;

        let mut defaults = Session::new();
        defaults.merge_headers(&options.headers);
        defaults.merge_cookies(&options.cookies);

        Ok(Self {
            inner,
            defaults,
            retry: options.retry,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, HttpError> {
        Self::new(ClientOptions::from_settings(settings))
    }

    /// A fresh per-run session seeded with this client's default headers and cookies.
    pub fn session(&self) -> Session {
        self.defaults.clone()
    }

    fn prepare(
        &self,
        session: &Session,
        request: &Request,
    ) -> Result<reqwest::RequestBuilder, HttpError> {
        let url = request.full_url()?;

        let mut headers = session.headers().clone();
        headers.insert("user-agent".to_string(), random_user_agent().to_string());
        headers.extend(request.headers.clone());

        let mut cookies = session.cookies().clone();
        cookies.extend(request.cookies.clone());

        let mut builder = self.inner.request(request.method.clone(), url);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(cookie) = cookie_header(&cookies) {
            builder = builder.header(COOKIE, cookie);
        }
        if let Some(body) = &request.json {
            builder = builder.json(body);
        }
        Ok(builder)
    }

    async fn send(
        &self,
        session: &Session,
        request: &Request,
    ) -> Result<reqwest::Response, HttpError> {
        let builder = self.prepare(session, request)?;
        tracing::debug!("==> [{}] {}", request.method, request.url);
        let response = builder.send().await.map_err(|source| HttpError::Transport {
            url: request.url.clone(),
            source,
        })?;
        let status = response.status();
        tracing::debug!("<== [{}] {}", status, response.url());
        if !status.is_success() {
            return Err(HttpError::Status {
                url: response.url().to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    /// One attempt. Non-success statuses become `HttpError::Status`.
    pub async fn request(
        &self,
        session: &Session,
        request: &Request,
    ) -> Result<Response, HttpError> {
        let response = self.send(session, request).await?;
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let body = response.text().await.map_err(|source| HttpError::Transport {
            url: url.clone(),
            source,
        })?;
        Ok(Response { status, url, body })
    }

    /// `request` wrapped in this client's retry policy, for one-off calls made
    /// outside a crawl cycle.
    pub async fn request_retrying(
        &self,
        session: &Session,
        request: &Request,
    ) -> Result<Response, HttpError> {
        self.retry
            .execute(|_| self.request(session, request))
            .await
            .map(|done| done.value)
            .map_err(RetryError::into_inner)
    }

    /// Stream a response body into `path`, creating parent directories.
    pub async fn download_to(
        &self,
        session: &Session,
        request: &Request,
        path: &Path,
    ) -> Result<u64, HttpError> {
        let io_err = |source| HttpError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut response = self.send(session, request).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut file = tokio::fs::File::create(path).await.map_err(io_err)?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|source| HttpError::Transport {
                url: request.url.clone(),
                source,
            })?
        {
            file.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_err)?;
        Ok(written)
    }
}

#[async_trait]
impl Fetch for HttpClient {
    async fn fetch(&self, session: &Session, request: &Request) -> Result<Response, HttpError> {
        self.request(session, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::oneshot,
    };

    /// Serve a single canned response and hand back the raw request text.
    async fn serve_once(status_line: &'static str, body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                if n == 0 || raw.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let reply = format!(
                "HTTP/1.1 {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&raw).to_string());
        });
        (format!("http://{}", addr), rx)
    }

    fn client() -> HttpClient {
        let mut options = ClientOptions::default();
        options.headers.insert("X-Default".into(), "yes".into());
        options.cookies.insert("a".into(), "1".into());
        HttpClient::new(options).unwrap()
    }

    #[test]
    fn parses_cookie_strings() {
        let cookies = parse_cookie_string("a1=xyz; web_session=abc ;broken; =nope");
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies["a1"], "xyz");
        assert_eq!(cookies["web_session"], "abc");
    }

    #[test]
    fn session_headers_are_case_insensitive() {
        let mut session = Session::new();
        session.set_header("Accept-Language", "zh-CN");
        session.set_header("accept-language", "en");
        assert_eq!(session.headers().len(), 1);
        assert_eq!(session.headers()["accept-language"], "en");
    }

    #[test]
    fn full_url_appends_params_to_existing_query() {
        let request = Request::get("https://api.example.com/x?rid=0")
            .param("pn", 2)
            .param("keyword", "a b");
        assert_eq!(
            request.full_url().unwrap().as_str(),
            "https://api.example.com/x?rid=0&pn=2&keyword=a+b"
        );
    }

    #[tokio::test]
    async fn merges_defaults_session_and_request_state() {
        let (base, captured) = serve_once("200 OK", "{}").await;
        let client = client();
        let mut session = client.session();
        session.set_cookie("b", "2");
        session.set_header("x-signature", "first");

        let request = Request::get(format!("{}/list", base))
            .param("pn", 3)
            .header("X-Signature", "override");
        let response = client.request(&session, &request).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "{}");

        let raw = captured.await.unwrap().to_ascii_lowercase();
        assert!(raw.starts_with("get /list?pn=3 http/1.1"));
        assert!(raw.contains("x-default: yes"));
        assert!(raw.contains("x-signature: override"));
        assert!(raw.contains("cookie: a=1; b=2"));
        assert!(raw.contains("user-agent: mozilla/5.0"));
    }

    #[tokio::test]
    async fn non_success_status_is_a_distinct_retryable_error() {
        let (base, _captured) = serve_once("503 Service Unavailable", "busy").await;
        let client = client();
        let err = client
            .request(&client.session(), &Request::get(base))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Status { status: 503, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn malformed_urls_are_not_retryable() {
        let client = client();
        let err = client
            .request(&client.session(), &Request::get("not a url"))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::InvalidRequest(_)));
        assert!(!err.is_retryable());
    }
}
