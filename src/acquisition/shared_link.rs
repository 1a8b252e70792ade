//! Shared-link source for Google-Drive-style file hosts.
//!
//! Large files are not served directly: the host answers the first request
//! with an HTML "can't scan this file for viruses" page. The page (or a
//! `download_warning` cookie) carries the token needed to confirm the
//! download, so the source sniffs the first response and, when it is HTML,
//! re-issues the request with the confirmation parameters.

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use super::source::{http_client, ArtifactSource, FetchError};
use crate::error::AcquireError;

pub const DEFAULT_DOWNLOAD_BASE: &str = "https://drive.google.com/uc";

/// How many leading bytes are inspected when sniffing for HTML.
const SNIFF_LEN: usize = 512;

pub struct SharedLinkSource {
    http: Client,
    download_url: Url,
}

struct Fetched {
    url: Url,
    bytes: Vec<u8>,
    html: bool,
    cookies: Vec<String>,
}

impl SharedLinkSource {
    /// `link` may be a share URL (`/file/d/<id>/view`, `?id=<id>`), a bare
    /// file id, or any other direct download URL.
    pub fn new(link: &str, timeout: Duration) -> Result<Self, AcquireError> {
        Self::with_base(link, DEFAULT_DOWNLOAD_BASE, timeout)
    }

    /// Same as [`new`](Self::new) with the download endpoint overridden.
    pub fn with_base(link: &str, base: &str, timeout: Duration) -> Result<Self, AcquireError> {
        let download_url = resolve_download_url(link, base)?;
        Ok(SharedLinkSource {
            http: http_client(timeout)?,
            download_url,
        })
    }

    async fn get(&self, url: Url, cookies: &[String]) -> Result<Fetched, FetchError> {
        let mut req = self.http.get(url);
        if !cookies.is_empty() {
            req = req.header(COOKIE, cookies.join("; "));
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::from_status(status, &body));
        }

        let url = resp.url().clone();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let cookies = resp
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|c| c.split(';').next())
            .map(|c| c.trim().to_string())
            .collect();
        let bytes = resp.bytes().await?.to_vec();
        let html = looks_like_html(content_type.as_deref(), &bytes);
        Ok(Fetched {
            url,
            bytes,
            html,
            cookies,
        })
    }
}

#[async_trait]
impl ArtifactSource for SharedLinkSource {
    fn name(&self) -> &str {
        "shared-link"
    }

    async fn fetch(&self) -> Result<Vec<u8>, FetchError> {
        let first = self.get(self.download_url.clone(), &[]).await?;
        if !first.html {
            return Ok(first.bytes);
        }

        let page = String::from_utf8_lossy(&first.bytes);
        let confirm_url = confirmation_url(&first.url, &page, &first.cookies).ok_or_else(|| {
            FetchError::Fatal(
                "share host returned an HTML page without a download confirmation; \
                 check that the link is public"
                    .to_string(),
            )
        })?;

        info!("Share host asked for download confirmation; retrying confirmed request");
        debug!("Confirmation URL: {}", confirm_url);
        let second = self.get(confirm_url, &first.cookies).await?;
        if second.html {
            return Err(FetchError::Fatal(
                "share host returned HTML again after confirmation (file private or over quota?)"
                    .to_string(),
            ));
        }
        Ok(second.bytes)
    }
}

/// Extract a Drive file id from a share link or accept a bare id.
pub fn extract_file_id(link: &str) -> Option<String> {
    let link = link.trim();
    let is_id = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    };

    if !link.contains("://") {
        return is_id(link).then(|| link.to_string());
    }

    let url = Url::parse(link).ok()?;
    if let Some((_, id)) = url.query_pairs().find(|(k, _)| k == "id") {
        return is_id(id.as_ref()).then(|| id.into_owned());
    }
    let segments: Vec<&str> = url.path_segments()?.collect();
    segments
        .windows(2)
        .find(|w| w[0] == "d")
        .map(|w| w[1])
        .filter(|id| is_id(*id))
        .map(str::to_string)
}

fn resolve_download_url(link: &str, base: &str) -> Result<Url, AcquireError> {
    if let Some(id) = extract_file_id(link) {
        let mut url = Url::parse(base)
            .map_err(|e| AcquireError::Configuration(format!("invalid download base: {e}")))?;
        url.query_pairs_mut()
            .append_pair("export", "download")
            .append_pair("id", &id);
        return Ok(url);
    }

    match Url::parse(link.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(url),
        _ => Err(AcquireError::Configuration(format!(
            "'{}' is neither a share link, a file id nor an http(s) URL",
            link
        ))),
    }
}

pub fn looks_like_html(content_type: Option<&str>, body: &[u8]) -> bool {
    if content_type.is_some_and(|ct| ct.trim_start().to_ascii_lowercase().starts_with("text/html"))
    {
        return true;
    }
    let head = &body[..body.len().min(SNIFF_LEN)];
    let head = String::from_utf8_lossy(head).trim_start().to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

/// Build the follow-up request from an interstitial page.
///
/// Preference order: the page's download form (action + hidden inputs), then a
/// `confirm=` token in any link, then a `download_warning*` cookie.
pub fn confirmation_url(current: &Url, page: &str, cookies: &[String]) -> Option<Url> {
    let page = page.replace("&amp;", "&");

    if let Some(action) = form_action(&page) {
        let inputs = hidden_inputs(&page);
        if inputs.iter().any(|(name, _)| name == "confirm") {
            let mut url = current.join(&action).ok()?;
            url.query_pairs_mut()
                .clear()
                .extend_pairs(inputs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            return Some(url);
        }
    }

    let token = query_token(&page, "confirm=").or_else(|| {
        cookies.iter().find_map(|c| {
            let (name, value) = c.split_once('=')?;
            name.starts_with("download_warning").then(|| value.to_string())
        })
    })?;
    let uuid = query_token(&page, "uuid=");

    let mut url = current.clone();
    let kept: Vec<(String, String)> = current
        .query_pairs()
        .filter(|(k, _)| k != "confirm" && k != "uuid")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut query = url.query_pairs_mut();
        query.clear().extend_pairs(kept);
        query.append_pair("confirm", &token);
        if let Some(uuid) = &uuid {
            query.append_pair("uuid", uuid);
        }
    }
    Some(url)
}

/// Value following `marker` up to the first non-token character.
fn query_token(page: &str, marker: &str) -> Option<String> {
    let start = page.find(marker)? + marker.len();
    let token: String = page[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    (!token.is_empty()).then_some(token)
}

fn attribute(tag: &str, name: &str) -> Option<String> {
    let marker = format!("{name}=\"");
    let start = tag.find(&marker)? + marker.len();
    let end = tag[start..].find('"')? + start;
    Some(tag[start..end].to_string())
}

fn form_action(page: &str) -> Option<String> {
    let start = page.find("<form")?;
    let end = page[start..].find('>')? + start;
    attribute(&page[start..end], "action")
}

fn hidden_inputs(page: &str) -> Vec<(String, String)> {
    page.split("<input")
        .skip(1)
        .filter_map(|rest| {
            let tag = &rest[..rest.find('>')?];
            if !tag.contains("type=\"hidden\"") {
                return None;
            }
            Some((attribute(tag, "name")?, attribute(tag, "value").unwrap_or_default()))
        })
        .collect()
}
