mod settings;
mod stores;

use edge_flags::{Client, EdgeApp, EdgeRequest, EdgeResponse, GeoInfo};
use fastly::http::StatusCode;
use fastly::{Error, Request, Response};

use settings::Settings;
use stores::{KvAssetSource, ASSET_STORE};

/// Bucketing dataset deployed with the service.
const BUCKETING: &[u8] = include_bytes!("../bucketing.json");

fn main() -> Result<(), Error> {
    let req = Request::from_client();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            init_logger(log::LevelFilter::Info);
            log::error!(target: "edge_flags", "failed to load settings: {e}");
            internal_error().send_to_client();
            return Ok(());
        }
    };
    init_logger(settings.log_level);

    let client = match Client::start(settings.client_config(BUCKETING)) {
        Ok(client) => client,
        Err(e) => {
            log::error!(target: "edge_flags", "failed to start client: {e}");
            internal_error().send_to_client();
            return Ok(());
        }
    };

    let app = EdgeApp::new(client, KvAssetSource::new(ASSET_STORE), settings.app);
    let mut handled = app.handle(&edge_request(&req));

    // The cache write and hit delivery run after the client has its response.
    into_response(handled.take_response()).send_to_client();
    handled.finish();
    Ok(())
}

fn init_logger(level: log::LevelFilter) {
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .target(env_logger::Target::Stderr)
        .try_init();
}

fn edge_request(req: &Request) -> EdgeRequest {
    let mut request = EdgeRequest::new(req.get_method_str(), req.get_path());
    if let Some(query) = req.get_query_str() {
        request = request.with_query(query);
    }
    for name in ["accept", "cookie", "if-none-match"] {
        if let Some(value) = req.get_header_str(name) {
            request = request.with_header(name, value);
        }
    }
    if let Some(geo) = req.get_client_ip_addr().and_then(fastly::geo::geo_lookup) {
        request = request.with_geo(GeoInfo {
            country: non_empty(geo.country_code()),
            region: geo.region().and_then(non_empty),
            city: non_empty(geo.city()),
        });
    }
    request
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_owned())
}

fn into_response(response: EdgeResponse) -> Response {
    let (status, headers, body) = response.into_parts();
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut response = Response::from_status(status);
    for (name, value) in &headers {
        response.append_header(name.as_str(), value.as_str());
    }
    response.set_body(body);
    response
}

fn internal_error() -> Response {
    Response::from_status(StatusCode::INTERNAL_SERVER_ERROR)
        .with_body_text_plain("Internal Server Error")
}
