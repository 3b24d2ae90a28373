//! Tracking hits and the sink they are delivered to.
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A tracking event reported for a visitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Hit {
    /// A web page was viewed.
    #[serde(rename_all = "camelCase")]
    Page { document_location: String },
    /// An application screen was viewed.
    #[serde(rename_all = "camelCase")]
    Screen { document_location: String },
    /// A custom event.
    #[serde(rename_all = "camelCase")]
    Event {
        category: EventCategory,
        action: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<u64>,
    },
    /// The visitor saw the value of a flag. Queued by the client, not by callers.
    #[serde(rename_all = "camelCase")]
    Exposure {
        flag_key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        allocation_key: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        variation_key: Option<String>,
    },
}

impl Hit {
    pub fn page(document_location: impl Into<String>) -> Hit {
        Hit::Page {
            document_location: document_location.into(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Hit::Page { .. } => "PAGE",
            Hit::Screen { .. } => "SCREEN",
            Hit::Event { .. } => "EVENT",
            Hit::Exposure { .. } => "EXPOSURE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventCategory {
    ActionTracking,
    UserEngagement,
}

/// A hit together with who sent it and when.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HitRecord {
    pub environment_id: String,
    pub visitor_id: String,
    #[serde(flatten)]
    pub hit: Hit,
    pub timestamp: DateTime<Utc>,
}

/// A trait for delivering hits to your analytics storage.
///
/// # Errors
///
/// This method should not return errors and should not panic. Errors that occur during delivery
/// should be handled internally within the implementation.
///
/// # Notes
///
/// Hits are delivered when a visitor is closed, which normally happens after the response has
/// been sent to the client.
pub trait HitLogger {
    fn log_hit(&self, hit: HitRecord);
}

pub(crate) struct NoopHitLogger;
impl HitLogger for NoopHitLogger {
    fn log_hit(&self, _hit: HitRecord) {}
}

impl<T: Fn(HitRecord)> HitLogger for T {
    fn log_hit(&self, hit: HitRecord) {
        self(hit);
    }
}

/// Writes every hit as a structured `log` record at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHitLogger;

impl HitLogger for LogHitLogger {
    fn log_hit(&self, hit: HitRecord) {
        match serde_json::to_string(&hit) {
            Ok(payload) => log::info!(
                target: "edge_flags::hits",
                environment_id = hit.environment_id.as_str(),
                visitor_id = hit.visitor_id.as_str(),
                hit_type = hit.hit.kind();
                "{payload}"
            ),
            Err(err) => log::warn!(target: "edge_flags::hits", "failed to encode hit: {err:?}"),
        }
    }
}
