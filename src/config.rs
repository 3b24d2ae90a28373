use std::fmt;

use crate::{
    hit::{HitLogger, NoopHitLogger},
    visitor_cache::VisitorCache,
    Client, Error, Result,
};

/// How flag values are decided for a visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecisionMode {
    /// Flags are evaluated from the bucketing dataset on every fetch. Cached assignments are only
    /// used for flags the dataset cannot evaluate.
    #[default]
    Bucketing,
    /// Cached assignments win over evaluation, so a returning visitor keeps its values across
    /// bucketing dataset updates. Flags without a cached assignment are evaluated.
    Edge,
}

impl std::str::FromStr for DecisionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bucketing" | "local" => Ok(DecisionMode::Bucketing),
            "edge" | "bucketing_edge" => Ok(DecisionMode::Edge),
            _ => Err(Error::InvalidConfiguration("unknown decision mode")),
        }
    }
}

/// Configuration for [`Client`].
///
/// # Examples
/// ```
/// # use edge_flags::{ClientConfig, DecisionMode, HitRecord, InMemoryVisitorCache};
/// let config = ClientConfig::from_credentials("env-id", "api-key")
///     .bucketing(br#"{"createdAt":"2024-07-18T00:00:00Z","environment":{"name":"Test"},"flags":{}}"#.to_vec())
///     .decision_mode(DecisionMode::Edge)
///     .visitor_cache(InMemoryVisitorCache::new())
///     .hit_logger(|hit: HitRecord| println!("{:?}", hit));
/// ```
pub struct ClientConfig {
    pub(crate) environment_id: String,
    pub(crate) api_key: String,
    pub(crate) bucketing: Option<Vec<u8>>,
    pub(crate) decision_mode: DecisionMode,
    pub(crate) visitor_cache: Option<Box<dyn VisitorCache + Send + Sync>>,
    pub(crate) hit_logger: Box<dyn HitLogger + Send + Sync>,
}

impl ClientConfig {
    /// Create a configuration for the given environment. Both values are required and are checked
    /// when the client is built.
    pub fn from_credentials(environment_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        ClientConfig {
            environment_id: environment_id.into(),
            api_key: api_key.into(),
            bucketing: None,
            decision_mode: DecisionMode::default(),
            visitor_cache: None,
            hit_logger: Box::new(NoopHitLogger),
        }
    }

    /// Bucketing dataset (Universal Flag Configuration JSON) used to evaluate flags.
    pub fn bucketing(mut self, bucketing: impl Into<Vec<u8>>) -> Self {
        self.bucketing = Some(bucketing.into());
        self
    }

    pub fn decision_mode(mut self, decision_mode: DecisionMode) -> Self {
        self.decision_mode = decision_mode;
        self
    }

    /// Persist visitor state between requests. Without a cache every request starts fresh.
    pub fn visitor_cache(
        mut self,
        visitor_cache: impl VisitorCache + Send + Sync + 'static,
    ) -> Self {
        self.visitor_cache = Some(Box::new(visitor_cache));
        self
    }

    /// Set hit logger to deliver tracking hits to your analytics storage.
    pub fn hit_logger(mut self, hit_logger: impl HitLogger + Send + Sync + 'static) -> Self {
        self.hit_logger = Box::new(hit_logger);
        self
    }

    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    /// Check required values.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfiguration`] if the environment id or API key is blank.
    /// - [`Error::MissingBucketing`] if no bucketing dataset was given.
    pub fn validate(&self) -> Result<()> {
        if self.environment_id.trim().is_empty() {
            return Err(Error::InvalidConfiguration("environment id is required"));
        }
        if self.api_key.trim().is_empty() {
            return Err(Error::InvalidConfiguration("api key is required"));
        }
        if self.bucketing.is_none() {
            return Err(Error::MissingBucketing);
        }
        Ok(())
    }

    /// Create a new [`Client`] using the specified configuration.
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("environment_id", &self.environment_id)
            .field("api_key", &"<redacted>")
            .field("bucketing_bytes", &self.bucketing.as_ref().map(Vec::len))
            .field("decision_mode", &self.decision_mode)
            .field("visitor_cache", &self.visitor_cache.is_some())
            .finish_non_exhaustive()
    }
}
