/**
 * Configuration for the dynamic gatherer and its watch controller
 */
use crate::error::{Error, Result};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Maximum number of consecutive failed re-subscriptions before a shard gives up
pub const MAX_WATCH_RESTARTS: u32 = 50;

/// Maximum backoff time in seconds between restart attempts
pub const MAX_BACKOFF_SECONDS: u64 = 60;

/// Initial backoff time in seconds
pub const INITIAL_BACKOFF_SECONDS: u64 = 1;

/// Brief delay before re-subscribing after a stream ended cleanly
pub const RESTART_DELAY_SECONDS: u64 = 1;

/// How long deleted objects stay visible to `fetch`
pub const DEFAULT_TOMBSTONE_RETENTION_SECS: i64 = 300; // 5 minutes

/// How often expired tombstones are pruned
pub const DEFAULT_JANITOR_INTERVAL_SECS: u64 = 30;

/// Tunables of the watch controller that are not part of the config file
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// `None` keeps tombstones for the lifetime of the gatherer
    pub tombstone_retention: Option<TimeDelta>,
    pub janitor_interval: Duration,
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub restart_delay: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            tombstone_retention: Some(TimeDelta::seconds(DEFAULT_TOMBSTONE_RETENTION_SECS)),
            janitor_interval: Duration::from_secs(DEFAULT_JANITOR_INTERVAL_SECS),
            max_restarts: MAX_WATCH_RESTARTS,
            initial_backoff: Duration::from_secs(INITIAL_BACKOFF_SECONDS),
            max_backoff: Duration::from_secs(MAX_BACKOFF_SECONDS),
            restart_delay: Duration::from_secs(RESTART_DELAY_SECONDS),
        }
    }
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(MAX_WATCH_RESTARTS > 0, "MAX_WATCH_RESTARTS must be greater than 0");
    assert!(MAX_BACKOFF_SECONDS > 0, "MAX_BACKOFF_SECONDS must be greater than 0");
    assert!(INITIAL_BACKOFF_SECONDS > 0, "INITIAL_BACKOFF_SECONDS must be greater than 0");
    assert!(INITIAL_BACKOFF_SECONDS <= MAX_BACKOFF_SECONDS, "initial backoff exceeds the maximum");
    assert!(RESTART_DELAY_SECONDS > 0, "RESTART_DELAY_SECONDS must be greater than 0");
    assert!(DEFAULT_TOMBSTONE_RETENTION_SECS > 0, "tombstone retention must be positive");
    assert!(DEFAULT_JANITOR_INTERVAL_SECS > 0, "janitor interval must be greater than 0");
};

/// Identifies the resource type a gatherer watches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersionResource {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub resource: String,
}

impl GroupVersionResource {
    #[must_use]
    pub fn gvr(group: &str, version: &str, resource: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
        }
    }

    /// `group/version`, or just `version` for the core group
    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Resource={}", self.api_version(), self.resource)
    }
}

/// Configuration of one dynamic data gatherer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigDynamic {
    /// Path to a kubeconfig file; empty means infer from the environment
    #[serde(default)]
    pub kubeconfig: String,
    #[serde(default)]
    pub resource_type: GroupVersionResource,
    #[serde(default)]
    pub exclude_namespaces: Vec<String>,
    #[serde(default)]
    pub include_namespaces: Vec<String>,
}

impl ConfigDynamic {
    /// Parse a configuration from YAML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid configuration document
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Read and parse a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Check the invariants a gatherer relies on.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the offending field
    pub fn validate(&self) -> Result<()> {
        if !self.include_namespaces.is_empty() && !self.exclude_namespaces.is_empty() {
            return Err(Error::Config(
                "cannot set excluded and included namespaces".to_string(),
            ));
        }

        if self.resource_type.resource.is_empty() {
            return Err(Error::Config(
                "GroupVersionResource.Resource cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmarshal_dynamic_config() {
        let text = r#"
kubeconfig: "/home/someone/.kube/config"
resource-type:
  group: "g"
  version: "v"
  resource: "r"
exclude-namespaces:
- kube-system
- my-namespace
# invalid together with exclude-namespaces, only checked for loading here
include-namespaces:
- default
"#;

        let cfg = ConfigDynamic::from_yaml(text).unwrap();
        assert_eq!(cfg.kubeconfig, "/home/someone/.kube/config");
        assert_eq!(cfg.resource_type, GroupVersionResource::gvr("g", "v", "r"));
        assert_eq!(cfg.exclude_namespaces, vec!["kube-system", "my-namespace"]);
        assert_eq!(cfg.include_namespaces, vec!["default"]);
    }

    #[test]
    fn test_missing_fields_default_to_empty() {
        let cfg = ConfigDynamic::from_yaml("resource-type:\n  resource: pods\n").unwrap();
        assert!(cfg.kubeconfig.is_empty());
        assert!(cfg.resource_type.group.is_empty());
        assert!(cfg.include_namespaces.is_empty());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_resource() {
        let cfg = ConfigDynamic::default();
        let err = cfg.validate().unwrap_err();
        assert!(
            err.to_string()
                .contains("invalid configuration: GroupVersionResource.Resource cannot be empty")
        );
    }

    #[test]
    fn test_validate_rejects_include_and_exclude() {
        // the namespace conflict is reported even when the resource is also missing
        let cfg = ConfigDynamic {
            include_namespaces: vec!["a".to_string()],
            exclude_namespaces: vec!["b".to_string()],
            ..ConfigDynamic::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("cannot set excluded and included namespaces"));
    }

    #[test]
    fn test_gvr_display() {
        assert_eq!(
            GroupVersionResource::gvr("foobar", "v1", "foos").to_string(),
            "foobar/v1, Resource=foos"
        );
        assert_eq!(GroupVersionResource::gvr("", "v1", "secrets").api_version(), "v1");
    }
}
