//! Process configuration, read once at start-up.

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use serde::Deserialize;

use crate::{crawler::Pacing, error::ConfigError, http::Headers, retry::RetryPolicy};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Proxies {
    pub http: Option<String>,
    pub https: Option<String>,
    pub all: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub workdir: PathBuf,
    pub debug: bool,
    pub log_level: String,
    pub retry: RetryPolicy,
    pub proxies: Proxies,
    pub default_headers: Headers,
    pub batch_size: usize,
    pub page_sleep: Option<Pacing>,
    pub bilibili_sess_data: Option<String>,
    pub xhs_cookies: Option<String>,
    pub xhs_headers: Headers,
    pub xhs_sign_command: Option<String>,
    pub media_command: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            debug: false,
            log_level: "info".to_string(),
            retry: RetryPolicy::default(),
            proxies: Proxies::default(),
            default_headers: Headers::new(),
            batch_size: 100,
            page_sleep: None,
            bilibili_sess_data: None,
            xhs_cookies: None,
            xhs_headers: Headers::new(),
            xhs_sign_command: None,
            media_command: None,
        }
    }
}

impl Settings {
    /// Load `.env` from `WORKDIR` (or the current directory) if present, then
    /// read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let workdir = env::var("WORKDIR")
            .map(PathBuf::from)
            .or_else(|_| env::current_dir())
            .unwrap_or_else(|_| PathBuf::from("."));
        if dotenvy::from_path(workdir.join(".env")).is_err() {
            let _ = dotenvy::dotenv();
        }
        let mut settings = Self::from_lookup(|name| env::var(name).ok())?;
        if env::var("WORKDIR").is_err() {
            settings.workdir = workdir;
        }
        Ok(settings)
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let debug = parse_or(&var, "DEBUG", false, parse_bool)?;
        let log_level = var("LOG_LEVEL")
            .unwrap_or_else(|| if debug { "debug" } else { "info" }.to_string());

        let max_attempts = parse_or(&var, "REQUEST_MAX_RETRIES", 10u32, parse_number)?;
        let interval = parse_or(&var, "REQUEST_RETRY_INTERVAL", 30u64, parse_number)?;
        let step = parse_or(&var, "REQUEST_RETRY_STEP", 10u64, parse_number)?;

        Ok(Self {
            workdir: var("WORKDIR").map(PathBuf::from).unwrap_or(defaults.workdir),
            debug,
            log_level,
            retry: RetryPolicy::new(
                max_attempts,
                Duration::from_secs(interval),
                Duration::from_secs(step),
            ),
            proxies: parse_or(&var, "HTTP_PROXIES", Proxies::default(), parse_json)?,
            default_headers: parse_or(&var, "HTTP_HEADERS", Headers::new(), parse_json)?,
            batch_size: parse_or(&var, "INSERT_BATCH_SIZE", 100usize, parse_number)?.max(1),
            page_sleep: var("PAGE_SLEEP")
                .map(|raw| Pacing::from_str(&raw))
                .transpose()
                .map_err(|reason| ConfigError::Invalid {
                    name: "PAGE_SLEEP",
                    reason,
                })?,
            bilibili_sess_data: var("BILIBILI_SESS_DATA"),
            xhs_cookies: var("XHS_COOKIES"),
            xhs_headers: parse_or(&var, "XHS_HEADERS", Headers::new(), parse_json)?,
            xhs_sign_command: var("XHS_SIGN_COMMAND"),
            media_command: var("MEDIA_COMMAND"),
        })
    }

    /// Directory holding one SQLite file per platform.
    pub fn db_dir(&self) -> PathBuf {
        self.workdir.join(".db")
    }
}

fn parse_or<T, V, P>(var: &V, name: &'static str, default: T, parse: P) -> Result<T, ConfigError>
where
    V: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Result<T, String>,
{
    match var(name) {
        Some(raw) => parse(raw.trim()).map_err(|reason| ConfigError::Invalid { name, reason }),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("'{}' is not a boolean", other)),
    }
}

fn parse_number<T>(raw: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|err| format!("'{}': {}", raw, err))
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, String> {
    serde_json::from_str(raw).map_err(|err| err.to_string())
}
