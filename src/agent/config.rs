//! Agent configuration tree.
//!
//! Plain structs with defaults, loadable from TOML so deployments can ship a
//! config file alongside the application. Unknown keys are ignored; missing
//! sections fall back to their defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::session::ApplicationType;

/// Top-level configuration handed to `init`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Product the application belongs to; roots the repository path.
    pub product_name: String,
    /// Application name within the product.
    pub application_name: String,
    /// Application version; empty means unknown.
    pub application_version: String,
    /// Optional operator-facing description.
    pub application_description: String,
    /// Deployment environment tag.
    pub environment: String,
    /// Release promotion level tag.
    pub promotion_level: String,
    /// Extra properties copied verbatim into the session summary.
    pub properties: BTreeMap<String, String>,
    /// Fragment file behavior.
    pub session_file: SessionFileConfig,
    /// Publisher behavior.
    pub publisher: PublisherConfig,
    /// In-process event source toggles (external components).
    pub listener: ListenerConfig,
    /// Uploader behavior (external component).
    pub server: ServerConfig,
    /// Packager child-process selection (external component).
    pub packager: PackagerConfig,
}

impl AgentConfig {
    /// Minimal configuration for a product/application pair.
    pub fn new(product_name: impl Into<String>, application_name: impl Into<String>) -> Self {
        Self {
            product_name: product_name.into(),
            application_name: application_name.into(),
            ..Self::default()
        }
    }

    /// Loads a TOML configuration file.
    pub fn load_toml(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|err| AgentError::InvalidArgument(format!("bad config file: {err}")))
    }

    /// Rejects configurations the repository cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.product_name.trim().is_empty() {
            return Err(AgentError::InvalidArgument(
                "product_name must be set".into(),
            ));
        }
        if self.application_name.trim().is_empty() {
            return Err(AgentError::InvalidArgument(
                "application_name must be set".into(),
            ));
        }
        if self.session_file.max_size_mb == 0 {
            return Err(AgentError::InvalidArgument(
                "session_file.max_size_mb must be at least 1".into(),
            ));
        }
        if self.session_file.max_duration_hours == 0 {
            return Err(AgentError::InvalidArgument(
                "session_file.max_duration_hours must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Fragment file and repository options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionFileConfig {
    /// When false, the publisher runs without a repository or writer.
    pub enabled: bool,
    /// Override for the repository base folder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<PathBuf>,
    /// Rotation size threshold in megabytes.
    pub max_size_mb: u32,
    /// Rotation age threshold in hours.
    pub max_duration_hours: u32,
    /// Header heartbeat cadence in seconds.
    pub auto_flush_interval_seconds: u32,
    /// Archive pruning budget in megabytes; 0 disables size pruning.
    pub max_local_disk_usage_mb: u32,
    /// Archive pruning age in days; 0 disables age pruning.
    pub max_local_file_age_days: u32,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            folder: None,
            max_size_mb: 20,
            max_duration_hours: 24,
            auto_flush_interval_seconds: 15,
            max_local_disk_usage_mb: 0,
            max_local_file_age_days: 0,
        }
    }
}

/// Publisher options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Strips user identity fields before packets are enqueued.
    pub enable_anonymous_mode: bool,
    /// Force-tags the session's application type instead of detecting it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_type: Option<ApplicationType>,
}

/// Toggles for the in-process event sources. The sources themselves are
/// external collaborators registered through the monitor seam.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Capture console output.
    pub enable_console: bool,
    /// Capture garbage-collector events.
    pub enable_gc_events: bool,
    /// Capture runtime events.
    pub enable_clr_events: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enable_console: true,
            enable_gc_events: true,
            enable_clr_events: true,
        }
    }
}

/// Uploader options, consumed by the external uploader component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Master switch for server communication.
    pub enabled: bool,
    /// Upload sessions when they end.
    pub auto_send_sessions: bool,
    /// Upload immediately when an error-severity message is recorded.
    pub auto_send_on_error: bool,
    /// Delete local fragments after a confirmed upload.
    pub purge_sent_sessions: bool,
    /// Hosted-service customer name; empty for self-hosted servers.
    pub customer_name: String,
    /// Self-hosted server host name.
    pub host: String,
    /// Self-hosted server port; 0 selects the scheme default.
    pub port: u16,
    /// Use TLS when talking to a self-hosted server.
    pub ssl: bool,
    /// Path prefix on the server.
    pub path: String,
}

/// Packager child-process options, consumed by the external packager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PackagerConfig {
    /// Address packaged sessions are mailed to.
    pub destination_email_address: String,
    /// Sender address for packaged sessions.
    pub from_email_address: String,
    /// Allow the email transport.
    pub allow_email: bool,
    /// Allow the server transport.
    pub allow_server: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = AgentConfig::new("TestP", "TestA");
        config.validate().unwrap();
        assert!(config.session_file.enabled);
        assert_eq!(config.session_file.max_size_mb, 20);
        assert_eq!(config.session_file.max_duration_hours, 24);
    }

    #[test]
    fn missing_product_is_rejected() {
        let config = AgentConfig::new("  ", "TestA");
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip_preserves_options() {
        let mut config = AgentConfig::new("TestP", "TestA");
        config.publisher.enable_anonymous_mode = true;
        config.server.auto_send_sessions = true;
        config
            .properties
            .insert("region".into(), "eu-west".into());
        let text = toml::to_string(&config).unwrap();
        let reparsed: AgentConfig = toml::from_str(&text).unwrap();
        assert!(reparsed.publisher.enable_anonymous_mode);
        assert!(reparsed.server.auto_send_sessions);
        assert_eq!(reparsed.properties.get("region").unwrap(), "eu-west");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let text = r#"
            product_name = "TestP"
            application_name = "TestA"

            [session_file]
            max_size_mb = 5
        "#;
        let config: AgentConfig = toml::from_str(text).unwrap();
        assert_eq!(config.session_file.max_size_mb, 5);
        assert_eq!(config.session_file.max_duration_hours, 24);
        assert!(config.listener.enable_console);
    }
}
