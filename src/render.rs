//! Response composer: turns a resolved flag into an HTML page.
use std::str::FromStr;

use crate::{context::GeoInfo, http::VISITOR_COOKIE, log_buffer::LogBuffer, Error, FlagValue};

/// How the HTML body is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderStrategy {
    /// Fixed page built in code.
    #[default]
    Inline,
    /// The requested HTML asset with `{{token}}` placeholders filled in.
    Template,
}

impl FromStr for RenderStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(RenderStrategy::Inline),
            "template" => Ok(RenderStrategy::Template),
            _ => Err(Error::InvalidConfiguration("unknown render strategy")),
        }
    }
}

/// Values available to a page.
#[derive(Debug, Clone, Copy)]
pub struct PageValues<'a> {
    pub flag_value: &'a FlagValue,
    pub visitor_id: &'a str,
    pub geo: Option<&'a GeoInfo>,
    /// Shown on the page when present.
    pub logs: Option<&'a LogBuffer>,
}

impl PageValues<'_> {
    /// Unescaped value of a template token.
    fn token(&self, name: &str) -> Option<String> {
        let geo = |field: fn(&GeoInfo) -> &Option<String>| {
            self.geo
                .and_then(|geo| field(geo).clone())
                .unwrap_or_default()
        };
        Some(match name {
            "flagValue" => self.flag_value.to_string(),
            "visitorId" => self.visitor_id.to_owned(),
            "country" => geo(|g| &g.country),
            "region" => geo(|g| &g.region),
            "city" => geo(|g| &g.city),
            "logs" => self.logs.map(LogBuffer::to_text).unwrap_or_default(),
            _ => return None,
        })
    }
}

/// The built-in page.
pub fn render_inline(values: &PageValues<'_>) -> String {
    let mut html = format!(
        r#"<!DOCTYPE html>
<body>
  <h1>Hello World</h1>
  <p>This is my edge worker using for the visitorID : <span style="color: red;">{}</span> the flag <span style="color: red;">{}</span>.</p>
"#,
        escape_html(values.visitor_id),
        escape_html(&values.flag_value.to_string()),
    );

    if let Some(geo) = values.geo {
        let place: Vec<&str> = [&geo.city, &geo.region, &geo.country]
            .into_iter()
            .filter_map(|part| part.as_deref())
            .collect();
        if !place.is_empty() {
            html.push_str(&format!(
                "  <p>Location: {}</p>\n",
                escape_html(&place.join(", "))
            ));
        }
    }

    if let Some(logs) = values.logs.filter(|logs| !logs.is_empty()) {
        html.push_str(&format!("  <pre>{}</pre>\n", escape_html(&logs.to_text())));
    }

    html.push_str("</body>");
    html
}

/// Replaces `{{name}}` tokens in `template`. Whitespace inside the braces is ignored, unknown
/// tokens are kept as they are, and substituted values are HTML-escaped.
pub fn render_template(template: &str, values: &PageValues<'_>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        let Some(len) = rest[open + 2..].find("}}") else {
            break;
        };
        let close = open + 2 + len;
        // The last `{{` before the closing braces opens the token.
        let start = rest[..close].rfind("{{").unwrap_or(open);
        let end = close + 2;
        let name = rest[start + 2..close].trim();

        output.push_str(&rest[..start]);
        match values.token(name) {
            Some(value) => output.push_str(&escape_html(&value)),
            None => output.push_str(&rest[start..end]),
        }
        rest = &rest[end..];
    }

    output.push_str(rest);
    output
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// `Set-Cookie` value binding the visitor id for the session.
///
/// The id is written as is; ids handed out by [`crate::Visitor::visitor_id()`] are always safe.
pub fn visitor_cookie(visitor_id: &str) -> String {
    format!("{VISITOR_COOKIE}={visitor_id}; Path=/; SameSite=Lax")
}
