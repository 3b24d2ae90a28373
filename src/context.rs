//! Per-request visitor context: identity, cookies, query parameters, targeting and location.
use std::collections::{BTreeMap, HashMap};

use eppo_core::{AttributeValue, Attributes};
use serde::{Deserialize, Serialize};

use crate::{
    http::{EdgeRequest, VISITOR_COOKIE},
    Error, Result,
};

/// Query parameter overriding the visitor id.
pub const VISITOR_ID_PARAM: &str = "visitorId";
/// Query parameter carrying a JSON object of targeting attributes.
pub const CONTEXT_PARAM: &str = "context";

const MAX_VISITOR_ID_LEN: usize = 128;

/// A single targeting attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Boolean(bool),
    Number(f64),
    String(String),
    Null,
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        ContextValue::String(value.to_owned())
    }
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        ContextValue::String(value)
    }
}

impl From<f64> for ContextValue {
    fn from(value: f64) -> Self {
        ContextValue::Number(value)
    }
}

impl From<bool> for ContextValue {
    fn from(value: bool) -> Self {
        ContextValue::Boolean(value)
    }
}

/// Targeting attributes of a visitor, ordered by name.
pub type TargetingContext = BTreeMap<String, ContextValue>;

/// Converts targeting attributes for the decision engine. Null attributes are left out, which the
/// engine treats the same as a null value.
pub fn to_attributes(context: &TargetingContext) -> Attributes {
    context
        .iter()
        .filter_map(|(key, value)| {
            let value: AttributeValue = match value {
                ContextValue::Boolean(b) => (*b).into(),
                ContextValue::Number(n) => (*n).into(),
                ContextValue::String(s) => s.as_str().into(),
                ContextValue::Null => return None,
            };
            Some((key.clone().into(), value))
        })
        .collect()
}

/// Client location resolved by the hosting platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

impl GeoInfo {
    fn fields(&self) -> [(&'static str, Option<&String>); 3] {
        [
            ("country", self.country.as_ref()),
            ("region", self.region.as_ref()),
            ("city", self.city.as_ref()),
        ]
    }
}

/// Everything the pipeline needs to know about one request. Dropped once the response is sent.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub path: String,
    /// Visitor id from the `visitorId` query parameter, else from the visitor cookie.
    pub visitor_id: Option<String>,
    pub cookies: HashMap<String, String>,
    pub query: HashMap<String, String>,
    /// Targeting attributes from the `context` query parameter, completed with location.
    pub targeting: TargetingContext,
    pub geo: Option<GeoInfo>,
    pub accepts_html: bool,
}

impl RequestContext {
    /// Extracts the visitor context from `request`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidVisitorId`] if the `visitorId` query parameter is not a valid id.
    /// - [`Error::InvalidContext`] if the `context` query parameter is not a flat JSON object.
    ///
    /// A malformed visitor cookie is not an error; it is ignored.
    pub fn parse(request: &EdgeRequest) -> Result<RequestContext> {
        let cookies = request
            .cookie
            .as_deref()
            .map(parse_cookies)
            .unwrap_or_default();
        let query = request
            .query
            .as_deref()
            .map(parse_query)
            .unwrap_or_default();

        let visitor_id = match query.get(VISITOR_ID_PARAM) {
            Some(id) => {
                validate_visitor_id(id)?;
                Some(id.clone())
            }
            None => cookies
                .get(VISITOR_COOKIE)
                .filter(|id| match validate_visitor_id(id) {
                    Ok(()) => true,
                    Err(_) => {
                        log::warn!(target: "edge_flags", "ignoring malformed {VISITOR_COOKIE} cookie");
                        false
                    }
                })
                .cloned(),
        };

        let mut targeting = match query.get(CONTEXT_PARAM) {
            Some(raw) => parse_targeting(raw)?,
            None => TargetingContext::new(),
        };
        if let Some(geo) = &request.geo {
            merge_geo(&mut targeting, geo);
        }

        Ok(RequestContext {
            path: request.path.clone(),
            visitor_id,
            cookies,
            query,
            targeting,
            geo: request.geo.clone(),
            accepts_html: request.accepts_html(),
        })
    }
}

/// Parses a `Cookie` header. The first occurrence of a name wins.
pub fn parse_cookies(header: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for pair in header.split(';') {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        cookies
            .entry(name.to_owned())
            .or_insert_with(|| value.to_owned());
    }
    cookies
}

/// Parses a URL-encoded query string. The first occurrence of a name wins.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
        params
            .entry(name.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    params
}

/// Parses the `context` parameter: a JSON object whose values are strings, finite numbers,
/// booleans or null. A blank parameter is an empty context.
pub fn parse_targeting(raw: &str) -> Result<TargetingContext> {
    if raw.trim().is_empty() {
        return Ok(TargetingContext::new());
    }
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|err| Error::InvalidContext(err.to_string()))?;
    let serde_json::Value::Object(map) = value else {
        return Err(Error::InvalidContext("expected a JSON object".to_owned()));
    };

    map.into_iter()
        .map(|(key, value)| -> Result<(String, ContextValue)> {
            let attribute = match value {
                serde_json::Value::Null => ContextValue::Null,
                serde_json::Value::Bool(b) => b.into(),
                serde_json::Value::String(s) => s.into(),
                serde_json::Value::Number(n) => n
                    .as_f64()
                    .ok_or_else(|| Error::InvalidContext(format!("`{key}` is out of range")))?
                    .into(),
                serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                    return Err(Error::InvalidContext(format!(
                        "`{key}` must be a string, number, boolean or null"
                    )))
                }
            };
            Ok((key, attribute))
        })
        .collect()
}

/// Checks that `id` can be used as a cache key and a cookie value.
pub fn validate_visitor_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_VISITOR_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'~' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidVisitorId)
    }
}

/// Location fills `country`, `region` and `city` unless the request already targets them.
fn merge_geo(targeting: &mut TargetingContext, geo: &GeoInfo) {
    for (key, value) in geo.fields() {
        if let Some(value) = value {
            targeting
                .entry(key.to_owned())
                .or_insert_with(|| value.clone().into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookies_are_split_and_trimmed() {
        let cookies = parse_cookies(r#"theme=dark; fs_visitor_id=abc123 ;quoted="x y"; broken"#);
        assert_eq!(cookies.get("theme").map(String::as_str), Some("dark"));
        assert_eq!(
            cookies.get(VISITOR_COOKIE).map(String::as_str),
            Some("abc123")
        );
        assert_eq!(cookies.get("quoted").map(String::as_str), Some("x y"));
        assert!(!cookies.contains_key("broken"));
    }

    #[test]
    fn first_cookie_wins() {
        let cookies = parse_cookies("fs_visitor_id=first; fs_visitor_id=second");
        assert_eq!(
            cookies.get(VISITOR_COOKIE).map(String::as_str),
            Some("first")
        );
    }

    #[test]
    fn query_visitor_id_overrides_cookie() {
        let request = EdgeRequest::get("/")
            .with_query("visitorId=from-query")
            .with_header("cookie", "fs_visitor_id=from-cookie");
        let context = RequestContext::parse(&request).unwrap();
        assert_eq!(context.visitor_id.as_deref(), Some("from-query"));
    }

    #[test]
    fn cookie_visitor_id_is_used() {
        let request = EdgeRequest::get("/").with_header("cookie", "fs_visitor_id=abc123");
        let context = RequestContext::parse(&request).unwrap();
        assert_eq!(context.visitor_id.as_deref(), Some("abc123"));
    }

    #[test]
    fn malformed_cookie_is_ignored() {
        let request = EdgeRequest::get("/").with_header("cookie", "fs_visitor_id=<script>");
        let context = RequestContext::parse(&request).unwrap();
        assert_eq!(context.visitor_id, None);
    }

    #[test]
    fn malformed_query_visitor_id_is_rejected() {
        let request = EdgeRequest::get("/").with_query("visitorId=");
        assert!(matches!(
            RequestContext::parse(&request),
            Err(Error::InvalidVisitorId)
        ));

        let long = "a".repeat(MAX_VISITOR_ID_LEN + 1);
        assert!(validate_visitor_id(&long).is_err());
        assert!(validate_visitor_id("a b").is_err());
        assert!(validate_visitor_id("visitor_1.2-x~y").is_ok());
    }

    #[test]
    fn targeting_is_typed() {
        let attributes =
            parse_targeting(r#"{"plan":"pro","age":42,"beta":true,"nickname":null}"#).unwrap();
        assert_eq!(attributes.get("plan"), Some(&ContextValue::from("pro")));
        assert_eq!(attributes.get("age"), Some(&ContextValue::Number(42.0)));
        assert_eq!(attributes.get("beta"), Some(&ContextValue::Boolean(true)));
        assert_eq!(attributes.get("nickname"), Some(&ContextValue::Null));
    }

    #[test]
    fn invalid_targeting_is_an_error() {
        assert!(matches!(
            parse_targeting("{not json"),
            Err(Error::InvalidContext(_))
        ));
        assert!(matches!(
            parse_targeting("[1, 2]"),
            Err(Error::InvalidContext(_))
        ));
        assert!(matches!(
            parse_targeting(r#"{"nested":{"a":1}}"#),
            Err(Error::InvalidContext(_))
        ));
        assert!(parse_targeting("  ").unwrap().is_empty());
    }

    #[test]
    fn context_parameter_is_url_decoded() {
        let request = EdgeRequest::get("/").with_query("context=%7B%22plan%22%3A%22pro%22%7D");
        let context = RequestContext::parse(&request).unwrap();
        assert_eq!(
            context.targeting.get("plan"),
            Some(&ContextValue::from("pro"))
        );
    }

    #[test]
    fn geo_does_not_override_explicit_context() {
        let request = EdgeRequest::get("/")
            .with_query(r#"context={"country":"DE"}"#)
            .with_geo(GeoInfo {
                country: Some("FR".to_owned()),
                region: None,
                city: Some("Paris".to_owned()),
            });
        let context = RequestContext::parse(&request).unwrap();
        assert_eq!(
            context.targeting.get("country"),
            Some(&ContextValue::from("DE"))
        );
        assert_eq!(
            context.targeting.get("city"),
            Some(&ContextValue::from("Paris"))
        );
        assert!(!context.targeting.contains_key("region"));
    }
}
