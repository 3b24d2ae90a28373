//! Static assets and the not-found fallback chain.
use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::{
    http::{status, EdgeResponse, CONTENT_TYPE_TEXT},
    Result,
};

/// Page served when a requested asset does not exist.
pub const NOT_FOUND_PATH: &str = "/404.html";

const INDEX: &str = "index.html";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub body: Vec<u8>,
    pub content_type: &'static str,
}

impl Asset {
    /// Content type is derived from the extension of `path`.
    pub fn new(path: &str, body: impl Into<Vec<u8>>) -> Self {
        Asset {
            body: body.into(),
            content_type: content_type_for(path),
        }
    }
}

/// Where static files come from.
pub trait AssetSource {
    /// `path` is a normalized key as returned by [`normalize_path()`]. `Ok(None)` means the asset
    /// does not exist.
    fn fetch(&self, path: &str) -> Result<Option<Asset>>;
}

impl<T: AssetSource + ?Sized> AssetSource for &T {
    fn fetch(&self, path: &str) -> Result<Option<Asset>> {
        (**self).fetch(path)
    }
}

/// Assets held in memory, keyed by normalized path.
#[derive(Debug, Clone, Default)]
pub struct StaticAssets {
    files: HashMap<String, Vec<u8>>,
}

impl StaticAssets {
    pub fn new() -> Self {
        StaticAssets::default()
    }

    /// Adds a file. `path` may be given with or without the leading `/`.
    pub fn with_file(mut self, path: &str, body: impl Into<Vec<u8>>) -> Self {
        if let Some(key) = normalize_path(path) {
            self.files.insert(key, body.into());
        }
        self
    }
}

impl AssetSource for StaticAssets {
    fn fetch(&self, path: &str) -> Result<Option<Asset>> {
        let body = self.files.get(path).cloned();
        Ok(body.map(|body| Asset::new(path, body)))
    }
}

/// Maps a request path to an asset key: the leading `/` is dropped and directory paths get
/// `index.html` appended. Paths containing a `..` segment have no asset.
pub fn normalize_path(path: &str) -> Option<String> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    if path.split('/').any(|segment| segment == "..") {
        return None;
    }
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') {
        Some(format!("{trimmed}{INDEX}"))
    } else {
        Some(trimmed.to_owned())
    }
}

pub fn content_type_for(path: &str) -> &'static str {
    let extension = path
        .rsplit_once('.')
        .map(|(_, extension)| extension.to_ascii_lowercase());
    match extension.as_deref() {
        Some("html" | "htm") => "text/html;charset=UTF-8",
        Some("css") => "text/css;charset=UTF-8",
        Some("js" | "mjs") => "application/javascript;charset=UTF-8",
        Some("json") => "application/json",
        Some("txt") => CONTENT_TYPE_TEXT,
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("woff2") => "font/woff2",
        Some("woff") => "font/woff",
        _ => "application/octet-stream",
    }
}

/// Strong entity tag: quoted url-safe base64 of the SHA-256 of `body`.
pub fn etag(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("\"{}\"", base64_url::encode(&hasher.finalize()))
}

/// `true` if an `If-None-Match` header value matches `etag`. Weak validators compare equal.
fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    if_none_match.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || candidate.strip_prefix("W/").unwrap_or(candidate) == etag
    })
}

/// Serves the asset at `path`, falling back to the not-found chain.
///
/// A matching `If-None-Match` yields `304 Not Modified`. Only the primary asset is revalidated;
/// fallback pages are always sent in full.
pub fn serve_with_fallback(
    source: &dyn AssetSource,
    path: &str,
    if_none_match: Option<&str>,
    not_found_path: &str,
) -> EdgeResponse {
    let asset = match normalize_path(path).map(|key| source.fetch(&key)) {
        Some(Ok(asset)) => asset,
        Some(Err(err)) => {
            log::warn!(target: "edge_flags", path = path; "asset lookup failed: {err}");
            None
        }
        None => None,
    };

    let Some(asset) = asset else {
        return not_found(source, not_found_path);
    };

    let tag = etag(&asset.body);
    if if_none_match.map_or(false, |header| etag_matches(header, &tag)) {
        return EdgeResponse::from_status(status::NOT_MODIFIED).with_header("etag", tag);
    }

    EdgeResponse::from_status(status::OK)
        .with_header("content-type", asset.content_type)
        .with_header("etag", tag)
        .with_body(asset.body)
}

/// The not-found page from `source`, or a plain-text body when that page is missing too.
pub fn not_found(source: &dyn AssetSource, not_found_path: &str) -> EdgeResponse {
    let page = normalize_path(not_found_path)
        .map(|key| source.fetch(&key))
        .transpose();
    match page {
        Ok(Some(Some(asset))) => EdgeResponse::from_status(status::NOT_FOUND)
            .with_header("content-type", asset.content_type)
            .with_body(asset.body),
        Ok(_) => EdgeResponse::from_status(status::NOT_FOUND).with_body_text_plain("Not Found"),
        Err(err) => {
            log::warn!(target: "edge_flags", "not-found page lookup failed: {err}");
            EdgeResponse::from_status(status::NOT_FOUND).with_body_text_plain("Not Found")
        }
    }
}
