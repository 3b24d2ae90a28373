use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
};

use eppo_core::{
    configuration_store::ConfigurationStore,
    eval::{Evaluator, EvaluatorConfig},
    ufc::UniversalFlagConfig,
    Attributes, Configuration, SdkMetadata, Str,
};

use crate::{
    flag::{FlagMetadata, ResolvedFlag},
    hit::{HitLogger, HitRecord},
    visitor::{Visitor, VisitorOptions},
    visitor_cache::VisitorCache,
    ClientConfig, DecisionMode, Error, Result,
};

const SDK_NAME: &str = "edge-flags";
const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

static CLIENT: OnceLock<Client> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// Visitors can be created.
    Ready,
    /// [`Client::close()`] was called.
    Closed,
}

/// Flag decision client.
///
/// The client compiles the bucketing dataset once and evaluates flags for [`Visitor`]s created
/// from it. An edge worker normally holds a single process-wide client created with
/// [`Client::start()`]; [`Client::new()`] builds an independent one.
///
/// # Examples
/// ```no_run
/// # use edge_flags::{Client, ClientConfig, VisitorOptions};
/// # fn run() -> edge_flags::Result<()> {
/// let client = Client::start(
///     ClientConfig::from_credentials("env-id", "api-key")
///         .bucketing(std::fs::read("bucketing.json").unwrap()),
/// )?;
/// let mut visitor = client.new_visitor(VisitorOptions::default())?;
/// visitor.fetch_flags()?;
/// let value = visitor.get_flag("js", "default-value").value(true);
/// visitor.close();
/// # Ok(())
/// # }
/// ```
pub struct Client {
    environment_id: String,
    decision_mode: DecisionMode,
    evaluator: Evaluator,
    flag_keys: Vec<String>,
    visitor_cache: Option<Box<dyn VisitorCache + Send + Sync>>,
    hit_logger: Box<dyn HitLogger + Send + Sync>,
    closed: AtomicBool,
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfiguration`] or [`Error::MissingBucketing`] if the configuration is
    ///   incomplete.
    /// - [`Error::BucketingParse`] if the bucketing dataset cannot be compiled.
    pub fn new(config: ClientConfig) -> Result<Client> {
        config.validate()?;
        let ClientConfig {
            environment_id,
            bucketing,
            decision_mode,
            visitor_cache,
            hit_logger,
            ..
        } = config;
        let bucketing = bucketing.ok_or(Error::MissingBucketing)?;

        let flags = UniversalFlagConfig::from_json(sdk_metadata(), bucketing)
            .map_err(Error::BucketingParse)?;
        let configuration = Arc::new(Configuration::from_server_response(flags, None));

        let mut flag_keys: Vec<String> = configuration
            .flag_keys()
            .into_iter()
            .map(|key| key.to_string())
            .collect();
        flag_keys.sort();

        let configuration_store = ConfigurationStore::new();
        configuration_store.set_configuration(configuration);

        log::debug!(target: "edge_flags", "client ready with {} flags", flag_keys.len());

        Ok(Client {
            environment_id,
            decision_mode,
            evaluator: Evaluator::new(EvaluatorConfig {
                configuration_store: Arc::new(configuration_store),
                sdk_metadata: sdk_metadata(),
            }),
            flag_keys,
            visitor_cache,
            hit_logger,
            closed: AtomicBool::new(false),
        })
    }

    /// Initialize the process-wide client. Must be called once; later calls fail with
    /// [`Error::AlreadyStarted`] and leave the running client untouched.
    pub fn start(config: ClientConfig) -> Result<&'static Client> {
        let client = Client::new(config)?;
        let mut installed = false;
        let instance = CLIENT.get_or_init(|| {
            installed = true;
            client
        });
        if installed {
            Ok(instance)
        } else {
            Err(Error::AlreadyStarted)
        }
    }

    /// The process-wide client, if [`Client::start()`] succeeded.
    pub fn instance() -> Option<&'static Client> {
        CLIENT.get()
    }

    /// Create a visitor. Flags are not available until [`Visitor::fetch_flags()`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] after [`Client::close()`].
    pub fn new_visitor(&self, options: VisitorOptions) -> Result<Visitor<'_>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ClientClosed);
        }
        Ok(Visitor::new(self, options))
    }

    /// Stop creating visitors. Visitors created earlier still deliver their state when closed.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::debug!(target: "edge_flags", "client closed");
        }
    }

    pub fn status(&self) -> ClientStatus {
        if self.closed.load(Ordering::Acquire) {
            ClientStatus::Closed
        } else {
            ClientStatus::Ready
        }
    }

    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    pub fn decision_mode(&self) -> DecisionMode {
        self.decision_mode
    }

    /// Keys of all flags in the bucketing dataset, sorted.
    pub fn flag_keys(&self) -> &[String] {
        &self.flag_keys
    }

    pub(crate) fn visitor_cache(&self) -> Option<&(dyn VisitorCache + Send + Sync)> {
        self.visitor_cache.as_deref()
    }

    pub(crate) fn deliver(&self, hit: HitRecord) {
        self.hit_logger.log_hit(hit);
    }

    /// Evaluate one flag. `Ok(None)` means the visitor is not eligible for any allocation.
    pub(crate) fn evaluate(
        &self,
        flag_key: &str,
        visitor_id: &str,
        attributes: &Arc<Attributes>,
    ) -> Result<Option<ResolvedFlag>> {
        let subject_key = Str::from(visitor_id.to_owned());
        let assignment = self
            .evaluator
            .get_assignment(flag_key, &subject_key, attributes, None)
            .map_err(Error::Evaluation)?;

        Ok(assignment.map(|assignment| {
            let metadata = assignment
                .event
                .as_ref()
                .map(|event| FlagMetadata {
                    allocation_key: Some(event.base.allocation.to_string()),
                    variation_key: Some(event.base.variation.to_string()),
                    from_cache: false,
                })
                .unwrap_or_default();
            ResolvedFlag {
                value: assignment.value.into(),
                metadata,
            }
        }))
    }
}

fn sdk_metadata() -> SdkMetadata {
    SdkMetadata {
        name: SDK_NAME,
        version: SDK_VERSION,
    }
}
