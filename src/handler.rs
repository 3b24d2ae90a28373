//! Request dispatcher.
//!
//! Routes one request to the health check, to plain static asset serving, or to the visitor
//! pipeline for HTML pages. The handler never fails: every error becomes a response.
use crate::{
    assets::{self, AssetSource, NOT_FOUND_PATH},
    context::RequestContext,
    hit::Hit,
    http::{status, EdgeRequest, EdgeResponse},
    log_buffer::LogBuffer,
    render::{self, PageValues, RenderStrategy},
    visitor::{Visitor, VisitorOptions},
    Client, Error, FlagValue, Result,
};

const HEALTH_PATH: &str = "/health";

/// Settings of the HTML pipeline.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Flag rendered into the page.
    pub flag_key: String,
    /// Value shown when the flag does not resolve.
    pub default_value: FlagValue,
    pub render: RenderStrategy,
    pub not_found_path: String,
    /// Show the request log on the page.
    pub render_logs: bool,
    pub log_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            flag_key: "js".to_owned(),
            default_value: FlagValue::from("default-value"),
            render: RenderStrategy::Inline,
            not_found_path: NOT_FOUND_PATH.to_owned(),
            render_logs: false,
            log_capacity: 64,
        }
    }
}

/// Outcome of [`EdgeApp::handle()`].
///
/// The response should be sent to the client first; [`Handled::finish()`] then completes the
/// deferred work (visitor cache write and hit delivery) so that it does not delay the response.
#[must_use = "call `finish()` once the response is sent"]
pub struct Handled<'c> {
    pub response: EdgeResponse,
    pending: Option<Visitor<'c>>,
}

impl<'c> Handled<'c> {
    fn immediate(response: EdgeResponse) -> Self {
        Handled {
            response,
            pending: None,
        }
    }

    /// `true` if deferred work is pending.
    pub fn has_pending_work(&self) -> bool {
        self.pending.is_some()
    }

    /// Splits off the response, keeping the deferred work.
    pub fn take_response(&mut self) -> EdgeResponse {
        std::mem::replace(&mut self.response, EdgeResponse::from_status(status::OK))
    }

    pub fn finish(self) {
        if let Some(visitor) = self.pending {
            visitor.close();
        }
    }
}

pub struct EdgeApp<'c, A> {
    client: &'c Client,
    assets: A,
    config: AppConfig,
}

impl<'c, A: AssetSource> EdgeApp<'c, A> {
    pub fn new(client: &'c Client, assets: A, config: AppConfig) -> Self {
        EdgeApp {
            client,
            assets,
            config,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn handle(&self, request: &EdgeRequest) -> Handled<'c> {
        if request.method.eq_ignore_ascii_case("GET") && request.path == HEALTH_PATH {
            return Handled::immediate(
                EdgeResponse::from_status(status::OK).with_body_text_plain("OK"),
            );
        }

        if !request.accepts_html() {
            return Handled::immediate(assets::serve_with_fallback(
                &self.assets,
                &request.path,
                request.if_none_match.as_deref(),
                &self.config.not_found_path,
            ));
        }

        self.handle_page(request)
    }

    fn handle_page(&self, request: &EdgeRequest) -> Handled<'c> {
        let mut logs = LogBuffer::with_capacity(self.config.log_capacity);

        let context = match RequestContext::parse(request) {
            Ok(context) => context,
            Err(err) => {
                logs.warn(format!("rejecting request: {err}"));
                return Handled::immediate(
                    EdgeResponse::from_status(status::BAD_REQUEST)
                        .with_body_text_plain(&err.to_string()),
                );
            }
        };

        let options = VisitorOptions {
            visitor_id: context.visitor_id.clone(),
            context: context.targeting.clone(),
            has_consented: true,
        };
        let mut visitor = match self.client.new_visitor(options) {
            Ok(visitor) => visitor,
            Err(err) => {
                logs.error(format!("cannot create visitor: {err}"));
                return Handled::immediate(self.not_found());
            }
        };
        let cookie = render::visitor_cookie(visitor.visitor_id());
        logs.info(format!("visitor {}", visitor.visitor_id()));

        if let Err(err) = visitor.fetch_flags() {
            logs.error(format!("flags unavailable: {err}"));
            return Handled {
                response: self.not_found().with_header("set-cookie", cookie),
                pending: Some(visitor),
            };
        }

        let flag_value = visitor
            .get_flag(&self.config.flag_key, self.config.default_value.clone())
            .value(true);
        logs.info(format!("flag {} = {flag_value}", self.config.flag_key));
        visitor.send_hit(Hit::page(context.path.clone()));

        let values = PageValues {
            flag_value: &flag_value,
            visitor_id: visitor.visitor_id(),
            geo: context.geo.as_ref(),
            logs: self.config.render_logs.then_some(&logs),
        };
        let response = match self.render(&context.path, &values) {
            Ok(html) => EdgeResponse::from_status(status::OK).with_body_html(html),
            Err(err) => {
                log::warn!(target: "edge_flags", "page rendering failed: {err}");
                self.not_found()
            }
        };

        Handled {
            response: response.with_header("set-cookie", cookie),
            pending: Some(visitor),
        }
    }

    fn render(&self, path: &str, values: &PageValues<'_>) -> Result<String> {
        match self.config.render {
            RenderStrategy::Inline => Ok(render::render_inline(values)),
            RenderStrategy::Template => {
                let key = assets::normalize_path(path)
                    .ok_or_else(|| Error::Asset(format!("no template for {path}")))?;
                let asset = self
                    .assets
                    .fetch(&key)?
                    .ok_or_else(|| Error::Asset(format!("template {key} not found")))?;
                let template = String::from_utf8(asset.body)
                    .map_err(|_| Error::Asset(format!("template {key} is not UTF-8")))?;
                Ok(render::render_template(&template, values))
            }
        }
    }

    fn not_found(&self) -> EdgeResponse {
        assets::not_found(&self.assets, &self.config.not_found_path)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{assets::StaticAssets, hit::HitRecord, ClientConfig, InMemoryVisitorCache};

    const BUCKETING: &str = r#"{
        "createdAt": "2024-07-18T00:00:00Z",
        "format": "SERVER",
        "environment": {"name": "Test"},
        "flags": {
            "js": {
                "key": "js",
                "enabled": true,
                "variationType": "STRING",
                "variations": {"on": {"key": "on", "value": "flag-on"}},
                "allocations": [
                    {"key": "everyone", "splits": [{"variationKey": "on", "shards": []}], "doLog": true}
                ],
                "totalShards": 10000
            }
        }
    }"#;

    fn client(hits: Arc<Mutex<Vec<HitRecord>>>) -> Client {
        ClientConfig::from_credentials("env", "key")
            .bucketing(BUCKETING)
            .visitor_cache(InMemoryVisitorCache::new())
            .hit_logger(move |hit: HitRecord| hits.lock().unwrap().push(hit))
            .to_client()
            .unwrap()
    }

    fn html(path: &str) -> EdgeRequest {
        EdgeRequest::get(path).with_header("accept", "text/html,application/xhtml+xml")
    }

    #[test]
    fn health_check() {
        let client = client(Default::default());
        let app = EdgeApp::new(&client, StaticAssets::new(), AppConfig::default());

        let handled = app.handle(&EdgeRequest::get("/health"));
        assert!(!handled.has_pending_work());
        assert_eq!(handled.response.status(), status::OK);
        assert_eq!(handled.response.body_text(), "OK");
    }

    #[test]
    fn page_hits_are_delivered_on_finish() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let client = client(hits.clone());
        let app = EdgeApp::new(&client, StaticAssets::new(), AppConfig::default());

        let handled = app.handle(&html("/landing").with_header("cookie", "fs_visitor_id=abc123"));
        assert_eq!(handled.response.status(), status::OK);
        assert!(hits.lock().unwrap().is_empty());

        handled.finish();
        let hits = hits.lock().unwrap();
        assert!(hits.iter().all(|hit| hit.visitor_id == "abc123"));
        assert!(hits.iter().any(|hit| hit.hit == Hit::page("/landing")));
        assert!(hits.iter().any(|hit| is_exposure(&hit.hit, "js")));
    }

    fn is_exposure(hit: &Hit, key: &str) -> bool {
        matches!(hit, Hit::Exposure { flag_key, .. } if flag_key == key)
    }

    #[test]
    fn unknown_flag_renders_default() {
        let client = client(Default::default());
        let config = AppConfig {
            flag_key: "missing".to_owned(),
            ..AppConfig::default()
        };
        let app = EdgeApp::new(&client, StaticAssets::new(), config);

        let handled = app.handle(&html("/"));
        assert!(handled.response.body_text().contains("default-value"));
    }

    #[test]
    fn missing_template_falls_back_with_cookie() {
        let client = client(Default::default());
        let config = AppConfig {
            render: RenderStrategy::Template,
            ..AppConfig::default()
        };
        let app = EdgeApp::new(&client, StaticAssets::new(), config);

        let request = html("/absent.html").with_header("cookie", "fs_visitor_id=abc123");
        let handled = app.handle(&request);
        assert_eq!(handled.response.status(), status::NOT_FOUND);
        assert_eq!(handled.response.body_text(), "Not Found");
        assert_eq!(
            handled.response.header("set-cookie"),
            Some("fs_visitor_id=abc123; Path=/; SameSite=Lax")
        );
    }

    #[test]
    fn logs_are_rendered_on_request() {
        let client = client(Default::default());
        let config = AppConfig {
            render_logs: true,
            ..AppConfig::default()
        };
        let app = EdgeApp::new(&client, StaticAssets::new(), config);

        let handled = app.handle(&html("/").with_header("cookie", "fs_visitor_id=abc123"));
        assert!(handled.response.body_text().contains("visitor abc123"));
    }

    #[test]
    fn closed_client_serves_not_found() {
        let client = client(Default::default());
        client.close();
        let app = EdgeApp::new(&client, StaticAssets::new(), AppConfig::default());

        let handled = app.handle(&html("/"));
        assert_eq!(handled.response.status(), status::NOT_FOUND);
        assert!(handled.response.header("set-cookie").is_none());
    }
}
