//! WBI request signing for bilibili's `wbi` endpoints.
//!
//! The mixin key is a fixed permutation of the two image keys the `nav`
//! endpoint hands out. A signed query carries `wts` (unix seconds) and
//! `w_rid = md5(sorted query + mixin key)`.

use crate::error::ExtractError;

use super::models::NavResponse;

pub const NAV_URL: &str = "https://api.bilibili.com/x/web-interface/nav";

const MIXIN_KEY_ENC_TAB: [usize; 64] = [
    46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42, 19, 29,
    28, 14, 39, 12, 38, 41, 13, 37, 48, 7, 16, 24, 55, 40, 61, 26, 17, 0, 1, 60, 51, 30, 4, 22, 25,
    54, 21, 56, 59, 6, 63, 57, 62, 11, 36, 20, 34, 44, 52,
];

/// File stem of the last path segment: `.../7cd08494.png` gives `7cd08494`.
pub fn key_from_url(url: &str) -> &str {
    let name = url.rsplit('/').next().unwrap_or(url);
    name.split('.').next().unwrap_or(name)
}

pub fn mixin_key(img_key: &str, sub_key: &str) -> String {
    let raw: Vec<char> = img_key.chars().chain(sub_key.chars()).collect();
    MIXIN_KEY_ENC_TAB
        .iter()
        .filter_map(|&index| raw.get(index))
        .take(32)
        .collect()
}

/// Mixin key from a `nav` response body.
pub fn mixin_key_from_nav(body: &str) -> Result<String, ExtractError> {
    let nav: NavResponse = serde_json::from_str(body).map_err(|err| ExtractError::Malformed {
        what: "nav response",
        reason: err.to_string(),
    })?;
    let wbi = nav
        .data
        .and_then(|data| data.wbi_img)
        .ok_or(ExtractError::Missing { what: "wbi_img" })?;
    Ok(mixin_key(key_from_url(&wbi.img_url), key_from_url(&wbi.sub_url)))
}

/// Add `wts`, sort by name and append `w_rid`.
pub fn sign(mut params: Vec<(String, String)>, mixin_key: &str, wts: i64) -> Vec<(String, String)> {
    params.retain(|(name, _)| name != "wts" && name != "w_rid");
    params.push(("wts".to_string(), wts.to_string()));
    params.sort_by(|a, b| a.0.cmp(&b.0));
    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish();
    let w_rid = format!("{:x}", md5::compute(format!("{}{}", query, mixin_key)));
    params.push(("w_rid".to_string(), w_rid));
    params
}
