//! Platform-neutral request and response types.
//!
//! The platform binary converts its own request into an [`EdgeRequest`] and turns the
//! [`EdgeResponse`] back into a platform response. Only the parts of a request the pipeline
//! looks at are carried.
use crate::context::GeoInfo;

/// Cookie carrying the visitor id across requests.
pub const VISITOR_COOKIE: &str = "fs_visitor_id";

pub mod status {
    pub const OK: u16 = 200;
    pub const NOT_MODIFIED: u16 = 304;
    pub const BAD_REQUEST: u16 = 400;
    pub const NOT_FOUND: u16 = 404;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
}

pub const CONTENT_TYPE_HTML: &str = "text/html;charset=UTF-8";
pub const CONTENT_TYPE_TEXT: &str = "text/plain;charset=UTF-8";

#[derive(Debug, Clone)]
pub struct EdgeRequest {
    pub method: String,
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: Option<String>,
    pub accept: Option<String>,
    pub cookie: Option<String>,
    pub if_none_match: Option<String>,
    /// Client location as resolved by the platform.
    pub geo: Option<GeoInfo>,
}

impl EdgeRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        EdgeRequest {
            method: method.into(),
            path: path.into(),
            query: None,
            accept: None,
            cookie: None,
            if_none_match: None,
            geo: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        EdgeRequest::new("GET", path)
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Sets one of the headers the pipeline reads. Other headers are ignored.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        let value = Some(value.into());
        if name.eq_ignore_ascii_case("accept") {
            self.accept = value;
        } else if name.eq_ignore_ascii_case("cookie") {
            self.cookie = value;
        } else if name.eq_ignore_ascii_case("if-none-match") {
            self.if_none_match = value;
        }
        self
    }

    pub fn with_geo(mut self, geo: GeoInfo) -> Self {
        self.geo = Some(geo);
        self
    }

    /// `true` if the `Accept` header lists `text/html`.
    pub fn accepts_html(&self) -> bool {
        self.accept.as_deref().map_or(false, |accept| {
            accept.split(',').any(|item| {
                let media = item.split(';').next().unwrap_or_default();
                media.trim().eq_ignore_ascii_case("text/html")
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl EdgeResponse {
    pub fn from_status(status: u16) -> Self {
        EdgeResponse {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Appends a header. Repeated names are kept, as `Set-Cookie` requires.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_body_text_plain(self, body: &str) -> Self {
        self.with_header("content-type", CONTENT_TYPE_TEXT)
            .with_body(body)
    }

    pub fn with_body_html(self, body: impl Into<String>) -> Self {
        self.with_header("content-type", CONTENT_TYPE_HTML)
            .with_body(body.into())
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// First value of the header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn into_parts(self) -> (u16, Vec<(String, String)>, Vec<u8>) {
        (self.status, self.headers, self.body)
    }
}
