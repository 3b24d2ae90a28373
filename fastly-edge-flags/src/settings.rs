use std::str::FromStr;

use edge_flags::{
    AppConfig, ClientConfig, DecisionMode, Error, FlagValue, KvVisitorCache, LogHitLogger,
    RenderStrategy, Result,
};
use fastly::{ConfigStore, SecretStore};
use log::LevelFilter;

use crate::stores::{FastlyKvStore, VISITOR_CACHE_STORE};

const SECRET_STORE: &str = "edge_flags_secrets";
const CONFIG_STORE: &str = "edge_flags_config";

/// Service settings read from the Config Store and Secret Store.
pub struct Settings {
    environment_id: String,
    api_key: String,
    decision_mode: DecisionMode,
    visitor_cache: bool,
    pub app: AppConfig,
    pub log_level: LevelFilter,
}

impl Settings {
    pub fn load() -> Result<Settings> {
        let config = ConfigStore::try_open(CONFIG_STORE)
            .map_err(|_| Error::InvalidConfiguration("missing config store"))?;
        let secrets = SecretStore::open(SECRET_STORE)
            .map_err(|_| Error::InvalidConfiguration("missing secret store"))?;

        Settings::from_lookup(
            |key| {
                secrets
                    .get(key)
                    .and_then(|secret| String::from_utf8(secret.plaintext().to_vec()).ok())
            },
            |key| config.get(key),
        )
    }

    fn from_lookup(
        secret: impl Fn(&str) -> Option<String>,
        config: impl Fn(&str) -> Option<String>,
    ) -> Result<Settings> {
        let value = |key: &str| config(key).filter(|value| !value.trim().is_empty());

        let defaults = AppConfig::default();
        let app = AppConfig {
            flag_key: value("FLAG_KEY").unwrap_or(defaults.flag_key),
            default_value: value("FLAG_DEFAULT")
                .map(FlagValue::from)
                .unwrap_or(defaults.default_value),
            render: value("RENDER")
                .map(|render| RenderStrategy::from_str(&render))
                .transpose()?
                .unwrap_or(defaults.render),
            render_logs: value("RENDER_LOGS").map_or(Ok(defaults.render_logs), |v| switch(&v))?,
            ..defaults
        };

        Ok(Settings {
            environment_id: value("ENV_ID").unwrap_or_default(),
            api_key: secret("API_KEY").unwrap_or_default(),
            decision_mode: value("DECISION_MODE")
                .map(|mode| DecisionMode::from_str(&mode))
                .transpose()?
                .unwrap_or_default(),
            visitor_cache: value("VISITOR_CACHE").map_or(Ok(true), |v| switch(&v))?,
            app,
            log_level: value("LOG_LEVEL")
                .and_then(|level| LevelFilter::from_str(&level).ok())
                .unwrap_or(LevelFilter::Info),
        })
    }

    pub fn client_config(&self, bucketing: &[u8]) -> ClientConfig {
        let config = ClientConfig::from_credentials(&self.environment_id, &self.api_key)
            .bucketing(bucketing)
            .decision_mode(self.decision_mode)
            .hit_logger(LogHitLogger);
        if self.visitor_cache {
            config.visitor_cache(KvVisitorCache::new(FastlyKvStore::new(VISITOR_CACHE_STORE)))
        } else {
            config
        }
    }
}

fn switch(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        _ => Err(Error::InvalidConfiguration("expected on or off")),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings> {
        let config: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(
            |key| (key == "API_KEY").then(|| "secret".to_owned()),
            |key| config.get(key).cloned(),
        )
    }

    #[test]
    fn defaults_apply_when_unset() {
        let settings = settings(&[("ENV_ID", "env")]).unwrap();
        assert_eq!(settings.environment_id, "env");
        assert_eq!(settings.api_key, "secret");
        assert_eq!(settings.decision_mode, DecisionMode::Bucketing);
        assert!(settings.visitor_cache);
        assert_eq!(settings.app.flag_key, "js");
        assert_eq!(settings.app.default_value, FlagValue::from("default-value"));
        assert_eq!(settings.app.render, RenderStrategy::Inline);
        assert_eq!(settings.log_level, LevelFilter::Info);
    }

    #[test]
    fn values_are_parsed() {
        let settings = settings(&[
            ("ENV_ID", "env"),
            ("DECISION_MODE", "edge"),
            ("RENDER", "template"),
            ("VISITOR_CACHE", "off"),
            ("FLAG_KEY", "banner"),
            ("FLAG_DEFAULT", "grey"),
            ("RENDER_LOGS", "on"),
            ("LOG_LEVEL", "debug"),
        ])
        .unwrap();
        assert_eq!(settings.decision_mode, DecisionMode::Edge);
        assert_eq!(settings.app.render, RenderStrategy::Template);
        assert!(!settings.visitor_cache);
        assert_eq!(settings.app.flag_key, "banner");
        assert_eq!(settings.app.default_value, FlagValue::from("grey"));
        assert!(settings.app.render_logs);
        assert_eq!(settings.log_level, LevelFilter::Debug);
    }

    #[test]
    fn unknown_values_are_rejected() {
        assert!(settings(&[("DECISION_MODE", "remote")]).is_err());
        assert!(settings(&[("VISITOR_CACHE", "maybe")]).is_err());
    }
}
