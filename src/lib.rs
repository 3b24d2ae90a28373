//! Feature flag decisions for edge workers.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that resolves feature flags for [`Visitor`]s. A visitor
//! is one end-user session, identified by a stable visitor id and carrying a targeting context.
//! Flags are evaluated against a bucketing dataset supplied at startup, and the resulting
//! assignments can be kept in a [`VisitorCache`] so that a visitor sees the same values on later
//! requests.
//!
//! On top of the client, [`EdgeApp`] serves HTTP requests: HTML pages get the flag value rendered
//! into them together with a `fs_visitor_id` cookie, everything else is served from an
//! [`AssetSource`] with a not-found fallback.
//!
//! A [`HitLogger`] should be provided to deliver tracking hits to your analytics storage.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Flag resolution is not critical enough to fail a request: [`EdgeApp::handle()`] turns every
//! error into a response and [`Flag::value()`] falls back to the default. The returned errors are
//! still valuable for debugging.
//!
//! # Logging
//!
//! The crate uses the [`log`](https://docs.rs/log/latest/log/) crate with structured key-value
//! fields. Records are emitted under the `edge_flags` target, hits under `edge_flags::hits`.
//!
//! # Examples
//! ```
//! # use edge_flags::{AppConfig, Client, ClientConfig, EdgeApp, EdgeRequest, StaticAssets};
//! # let bucketing = r#"{"createdAt":"2024-07-18T00:00:00Z","format":"SERVER","environment":{"name":"Test"},"flags":{}}"#;
//! let client = ClientConfig::from_credentials("env-id", "api-key")
//!     .bucketing(bucketing)
//!     .to_client()?;
//! let app = EdgeApp::new(&client, StaticAssets::new(), AppConfig::default());
//!
//! let handled = app.handle(&EdgeRequest::get("/").with_header("accept", "text/html"));
//! assert_eq!(handled.response.status(), 200);
//! // Send the response, then:
//! handled.finish();
//! # Ok::<(), edge_flags::Error>(())
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

mod assets;
mod client;
mod config;
mod context;
mod error;
mod flag;
mod handler;
mod hit;
pub mod http;
mod log_buffer;
mod render;
mod visitor;
mod visitor_cache;

pub use assets::{
    content_type_for, etag, normalize_path, not_found, serve_with_fallback, Asset, AssetSource,
    StaticAssets, NOT_FOUND_PATH,
};
pub use client::{Client, ClientStatus};
pub use config::{ClientConfig, DecisionMode};
pub use context::{ContextValue, GeoInfo, RequestContext, TargetingContext};
pub use error::{Error, Result};
pub use flag::{Flag, FlagMetadata, FlagValue};
pub use handler::{AppConfig, EdgeApp, Handled};
pub use hit::{EventCategory, Hit, HitLogger, HitRecord, LogHitLogger};
pub use http::{EdgeRequest, EdgeResponse, VISITOR_COOKIE};
pub use log_buffer::{LogBuffer, LogLine};
pub use render::{
    escape_html, render_inline, render_template, visitor_cookie, PageValues, RenderStrategy,
};
pub use visitor::{Visitor, VisitorOptions};
pub use visitor_cache::{
    CachedAssignment, InMemoryVisitorCache, KeyValueStore, KvVisitorCache, VisitorCache,
    VisitorCacheRecord, RECORD_VERSION,
};
