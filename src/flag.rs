//! Resolved flag values and the per-visitor flag handle.
use std::fmt;

use eppo_core::ufc::AssignmentValue;
use serde::{Deserialize, Serialize};

use crate::visitor::Visitor;

/// A value resolved for a flag.
///
/// # Serialization
///
/// Serialized as a two-field object with `type` and `value`, so that integers and floating-point
/// numbers survive a trip through the visitor cache unchanged:
/// ```json
/// {"type":"STRING","value":"blue"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagValue {
    /// A string value.
    String(String),
    /// An integer value.
    Integer(i64),
    /// A numeric value (floating-point).
    Numeric(f64),
    /// A boolean value.
    Boolean(bool),
    /// Arbitrary JSON value.
    Json(serde_json::Value),
}

impl FlagValue {
    /// Converts `self` to the kind of `template`, or `None` if the kinds differ.
    ///
    /// Numbers convert between integer and floating-point. A floating-point value becomes an
    /// integer only when it has no fractional part and fits an `i64`.
    pub fn cast_like(&self, template: &FlagValue) -> Option<FlagValue> {
        match (template, self) {
            (FlagValue::String(_), FlagValue::String(_))
            | (FlagValue::Integer(_), FlagValue::Integer(_))
            | (FlagValue::Numeric(_), FlagValue::Numeric(_))
            | (FlagValue::Boolean(_), FlagValue::Boolean(_))
            | (FlagValue::Json(_), FlagValue::Json(_)) => Some(self.clone()),
            (FlagValue::Numeric(_), FlagValue::Integer(i)) => {
                Some(FlagValue::Numeric(*i as f64))
            }
            (FlagValue::Integer(_), FlagValue::Numeric(f))
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 =>
            {
                Some(FlagValue::Integer(*f as i64))
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FlagValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

/// Textual rendering used when a value is substituted into a page.
impl fmt::Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagValue::String(s) => f.write_str(s),
            FlagValue::Integer(i) => write!(f, "{i}"),
            FlagValue::Numeric(n) => write!(f, "{n}"),
            FlagValue::Boolean(b) => write!(f, "{b}"),
            FlagValue::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<AssignmentValue> for FlagValue {
    fn from(value: AssignmentValue) -> Self {
        match value {
            AssignmentValue::String(s) => FlagValue::String(s.to_string()),
            AssignmentValue::Integer(i) => FlagValue::Integer(i),
            AssignmentValue::Numeric(n) => FlagValue::Numeric(n),
            AssignmentValue::Boolean(b) => FlagValue::Boolean(b),
            AssignmentValue::Json { parsed, .. } => FlagValue::Json(parsed.as_ref().clone()),
        }
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        FlagValue::String(value.to_owned())
    }
}

impl From<String> for FlagValue {
    fn from(value: String) -> Self {
        FlagValue::String(value)
    }
}

impl From<i64> for FlagValue {
    fn from(value: i64) -> Self {
        FlagValue::Integer(value)
    }
}

impl From<f64> for FlagValue {
    fn from(value: f64) -> Self {
        FlagValue::Numeric(value)
    }
}

impl From<bool> for FlagValue {
    fn from(value: bool) -> Self {
        FlagValue::Boolean(value)
    }
}

/// Where a resolved flag came from and which split produced it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlagMetadata {
    pub allocation_key: Option<String>,
    pub variation_key: Option<String>,
    /// `true` when the value was served from the visitor cache instead of being evaluated.
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedFlag {
    pub value: FlagValue,
    pub metadata: FlagMetadata,
}

/// Handle to a single flag of a [`Visitor`].
///
/// Obtained from [`Visitor::get_flag()`]. Reading the value does not by itself report an
/// exposure unless asked to.
pub struct Flag<'a, 'c> {
    visitor: &'a mut Visitor<'c>,
    key: String,
    default: FlagValue,
}

impl<'a, 'c> Flag<'a, 'c> {
    pub(crate) fn new(visitor: &'a mut Visitor<'c>, key: String, default: FlagValue) -> Self {
        Flag {
            visitor,
            key,
            default,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the resolved value, or the default if the flag is unknown for this visitor or its
    /// value cannot be converted to the kind of the default. The returned value always has the
    /// default's kind.
    ///
    /// When `visitor_exposed` is `true` and a resolved value is returned, an exposure hit is
    /// queued for the visitor.
    pub fn value(&mut self, visitor_exposed: bool) -> FlagValue {
        match self.resolved() {
            Some((value, _)) => {
                if visitor_exposed {
                    self.visitor_exposed();
                }
                value
            }
            None => self.default.clone(),
        }
    }

    /// `true` if the decision engine produced a usable value for this visitor.
    pub fn exists(&self) -> bool {
        self.resolved().is_some()
    }

    pub fn metadata(&self) -> FlagMetadata {
        self.resolved()
            .map(|(_, metadata)| metadata)
            .unwrap_or_default()
    }

    /// Reports that the visitor has seen this flag.
    pub fn visitor_exposed(&mut self) {
        if let Some((_, metadata)) = self.resolved() {
            self.visitor.queue_exposure(&self.key, metadata);
        } else {
            log::debug!(target: "edge_flags", flag_key = self.key.as_str(); "not exposing unresolved flag");
        }
    }

    fn resolved(&self) -> Option<(FlagValue, FlagMetadata)> {
        let resolved = self.visitor.resolved_flag(&self.key)?;
        let value = resolved.value.cast_like(&self.default)?;
        Some((value, resolved.metadata.clone()))
    }
}
