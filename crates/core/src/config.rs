//! Startup configuration for the agent controller.
//!
//! The configuration is read once at process start and is immutable
//! afterwards. It carries the desired agent `DeploymentSpec` verbatim, so any
//! field accepted by the `apps/v1` API can be configured.

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::apps::v1::DeploymentSpec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Default bound on a single reconcile invocation.
pub const DEFAULT_RECONCILE_TIMEOUT_SECONDS: u64 = 60;

const MAX_SECRET_NAME_LEN: usize = 253;

const fn default_reconcile_timeout_seconds() -> u64 {
    DEFAULT_RECONCILE_TIMEOUT_SECONDS
}

/// Agent controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Name of the Secret holding the control plane token.
    pub token_secret_name: String,
    /// Upper bound for one reconcile invocation, in seconds.
    #[serde(default = "default_reconcile_timeout_seconds")]
    pub reconcile_timeout_seconds: u64,
    /// Desired spec of the agent Deployment.
    pub deployment: DeploymentSpec,
}

impl AgentConfig {
    /// Create a configuration with the default reconcile timeout.
    pub fn new(token_secret_name: impl Into<String>, deployment: DeploymentSpec) -> Self {
        Self {
            token_secret_name: token_secret_name.into(),
            reconcile_timeout_seconds: DEFAULT_RECONCILE_TIMEOUT_SECONDS,
            deployment,
        }
    }

    /// Load a configuration file. Files ending in `.json` are parsed as JSON,
    /// everything else as YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        debug!(path = %path.display(), json = is_json, "Loading agent configuration");

        if is_json {
            Self::from_json_str(&contents)
        } else {
            Self::from_yaml_str(&contents)
        }
    }

    /// Parse a YAML document.
    ///
    /// # Errors
    ///
    /// Returns `YamlParseFailed` on malformed input.
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| Error::yaml_parse_failed(e.to_string()))
    }

    /// Parse a JSON document.
    ///
    /// # Errors
    ///
    /// Returns `JsonParseFailed` on malformed input.
    pub fn from_json_str(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).map_err(|e| Error::json_parse_failed(e.to_string()))
    }

    /// Override the token secret name when one is given.
    #[must_use]
    pub fn with_token_secret_name(mut self, name: Option<String>) -> Self {
        if let Some(name) = name {
            self.token_secret_name = name;
        }
        self
    }

    /// Override the reconcile timeout when one is given.
    #[must_use]
    pub fn with_reconcile_timeout_seconds(mut self, seconds: Option<u64>) -> Self {
        if let Some(seconds) = seconds {
            self.reconcile_timeout_seconds = seconds;
        }
        self
    }

    /// Reconcile timeout as a `Duration`.
    pub const fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_seconds)
    }

    /// Check the configuration before handing it to the controller.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        validate_secret_name(&self.token_secret_name)?;

        if self.reconcile_timeout_seconds == 0 {
            return Err(Error::invalid_config(
                "reconcileTimeoutSeconds",
                "must be greater than zero",
            ));
        }

        let has_selector = self
            .deployment
            .selector
            .match_labels
            .as_ref()
            .is_some_and(|labels| !labels.is_empty())
            || self
                .deployment
                .selector
                .match_expressions
                .as_ref()
                .is_some_and(|exprs| !exprs.is_empty());
        if !has_selector {
            return Err(Error::invalid_config(
                "deployment.selector",
                "must match at least one label",
            ));
        }

        let has_containers = self
            .deployment
            .template
            .spec
            .as_ref()
            .is_some_and(|spec| !spec.containers.is_empty());
        if !has_containers {
            return Err(Error::invalid_config(
                "deployment.template.spec.containers",
                "must declare at least one container",
            ));
        }

        Ok(())
    }

    /// Validate and return the configuration.
    ///
    /// # Errors
    ///
    /// See [`AgentConfig::validate`].
    pub fn into_validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }
}

/// Secret names are DNS-1123 subdomains.
fn validate_secret_name(name: &str) -> Result<()> {
    const FIELD: &str = "tokenSecretName";

    if name.is_empty() {
        return Err(Error::invalid_config(FIELD, "must not be empty"));
    }
    if name.len() > MAX_SECRET_NAME_LEN {
        return Err(Error::invalid_config(
            FIELD,
            format!("must be at most {MAX_SECRET_NAME_LEN} characters"),
        ));
    }

    let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.';
    if !name.chars().all(allowed) {
        return Err(Error::invalid_config(
            FIELD,
            format!("'{name}' may only contain lowercase alphanumerics, '-' and '.'"),
        ));
    }

    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let bounded = name.chars().next().is_some_and(alnum) && name.chars().last().is_some_and(alnum);
    if !bounded {
        return Err(Error::invalid_config(
            FIELD,
            format!("'{name}' must start and end with an alphanumeric character"),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use super::*;
    use std::io::Write;

    const VALID_YAML: &str = r"
tokenSecretName: upbound-control-plane-token
deployment:
  replicas: 1
  selector:
    matchLabels:
      app: upbound-agent
  template:
    metadata:
      labels:
        app: upbound-agent
    spec:
      containers:
        - name: agent
          image: upbound/uxp-bootstrapper:v1.2.0
          env:
            - name: AGENT_LOG_LEVEL
              value: info
";

    #[test]
    fn parses_yaml_with_default_timeout() {
        let config = AgentConfig::from_yaml_str(VALID_YAML).unwrap();

        assert_eq!(config.token_secret_name, "upbound-control-plane-token");
        assert_eq!(config.reconcile_timeout(), Duration::from_secs(60));
        assert_eq!(config.deployment.replicas, Some(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_malformed_yaml() {
        let result = AgentConfig::from_yaml_str("tokenSecretName: [unterminated");
        assert!(matches!(result, Err(Error::YamlParseFailed { .. })));
    }

    #[test]
    fn loads_json_by_extension() {
        let config = AgentConfig::from_yaml_str(VALID_YAML).unwrap();
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(serde_json::to_string(&config).unwrap().as_bytes())
            .unwrap();

        let loaded = AgentConfig::load(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn load_reports_missing_file() {
        let result = AgentConfig::load("/nonexistent/agent-sync.yaml");
        assert!(matches!(result, Err(Error::FileReadFailed { .. })));
    }

    #[test]
    fn overrides_apply_only_when_present() {
        let config = AgentConfig::from_yaml_str(VALID_YAML)
            .unwrap()
            .with_token_secret_name(None)
            .with_reconcile_timeout_seconds(Some(5));

        assert_eq!(config.token_secret_name, "upbound-control-plane-token");
        assert_eq!(config.reconcile_timeout_seconds, 5);

        let config = config.with_token_secret_name(Some("other-token".to_string()));
        assert_eq!(config.token_secret_name, "other-token");
    }

    #[test]
    fn rejects_invalid_secret_names() {
        let base = AgentConfig::from_yaml_str(VALID_YAML).unwrap();

        for name in ["", "Upper", "-leading", "trailing.", "under_score"] {
            let config = base.clone().with_token_secret_name(Some(name.to_string()));
            assert!(
                matches!(config.validate(), Err(Error::InvalidConfig { .. })),
                "expected '{name}' to be rejected"
            );
        }
    }

    #[test]
    fn rejects_zero_timeout() {
        let config = AgentConfig::from_yaml_str(VALID_YAML)
            .unwrap()
            .with_reconcile_timeout_seconds(Some(0));
        assert!(config.into_validated().is_err());
    }

    #[test]
    fn rejects_template_without_containers() {
        let mut config = AgentConfig::from_yaml_str(VALID_YAML).unwrap();
        if let Some(spec) = config.deployment.template.spec.as_mut() {
            spec.containers.clear();
        }

        match config.validate() {
            Err(Error::InvalidConfig { field, .. }) => {
                assert_eq!(field, "deployment.template.spec.containers");
            }
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn rejects_empty_selector() {
        let mut config = AgentConfig::from_yaml_str(VALID_YAML).unwrap();
        config.deployment.selector.match_labels = None;

        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { field, .. }) if field == "deployment.selector"
        ));
    }
}
