use crate::document::DocumentLayout;
use crate::error::{DiscoveryError, Result};
use crate::plan::{ProbeConfig, TestPlan};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable selecting a discovery run at startup
pub const STARTUP_ENV_VAR: &str = "DISCOVERY_MODE";

/// Configuration of the discovery subsystem
///
/// Every field has a default, so an empty document is a valid configuration.
///
/// ```
/// use zone_discovery::DiscoveryConfig;
///
/// let config = DiscoveryConfig::from_yaml_str("base_topic: spa\nprobe:\n  color_tolerance: 8\n").unwrap();
/// assert_eq!(config.base_topic, "spa");
/// assert_eq!(config.probe.color_tolerance, 8);
/// assert_eq!(config.probe.quick_modes.len(), 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Where findings are persisted
    #[serde(default = "default_document_path")]
    pub document_path: PathBuf,

    /// Prefix of the status, result and control topics
    #[serde(default = "default_base_topic")]
    pub base_topic: String,

    /// How long `stop` waits for the run to wind down before aborting it
    ///
    /// Must exceed the cleanup budget of two command timeouts, so a stopped
    /// zone always gets both its off call and the fallback.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub layout: DocumentLayout,
}

fn default_document_path() -> PathBuf {
    PathBuf::from("/config/discovered_items.yaml")
}

fn default_base_topic() -> String {
    "smarttub-mqtt".to_string()
}

fn default_stop_timeout_ms() -> u64 {
    25_000
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            document_path: default_document_path(),
            base_topic: default_base_topic(),
            stop_timeout_ms: default_stop_timeout_ms(),
            probe: ProbeConfig::default(),
            layout: DocumentLayout::default(),
        }
    }
}

impl DiscoveryConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration from a YAML file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            DiscoveryError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml_str(&text)?;
        tracing::info!("Loaded discovery configuration from {}", path.display());
        Ok(config)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        let probe = &self.probe;
        if probe.full_modes.is_empty() || probe.quick_modes.is_empty() {
            return Err(DiscoveryError::Config("mode lists must not be empty".into()));
        }
        if probe.full_intensity > 100 || probe.brightness_levels.iter().any(|l| *l > 100) {
            return Err(DiscoveryError::Config("intensities are percentages (0-100)".into()));
        }
        if probe.command_timeout_ms == 0 {
            return Err(DiscoveryError::Config("command_timeout_ms must be positive".into()));
        }
        let cleanup_ms = probe.command_timeout_ms.saturating_mul(2);
        if self.stop_timeout_ms <= cleanup_ms {
            return Err(DiscoveryError::Config(format!(
                "stop_timeout_ms ({}) must exceed twice command_timeout_ms ({})",
                self.stop_timeout_ms, cleanup_ms
            )));
        }
        if probe.color_min_verified > 4 {
            return Err(DiscoveryError::Config(format!(
                "color_min_verified is {}, but only 4 reference colors are tested",
                probe.color_min_verified
            )));
        }
        Ok(())
    }
}

/// Discovery run requested at process startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartupDiscovery {
    /// Manual control only
    #[default]
    Off,
    Quick,
    Full,

    /// Re-publish persisted findings without probing
    Persisted,
}

impl StartupDiscovery {
    /// Read the startup choice from `DISCOVERY_MODE`
    pub fn from_env() -> Self {
        match std::env::var(STARTUP_ENV_VAR) {
            Ok(value) => Self::from_value(&value),
            Err(_) => Self::Off,
        }
    }

    /// Parse a `DISCOVERY_MODE` value; unknown values mean `Off`
    pub fn from_value(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "startup_quick" => Self::Quick,
            "startup_full" => Self::Full,
            "startup_yaml" | "startup_persisted" => Self::Persisted,
            "" | "off" => Self::Off,
            other => {
                tracing::warn!("Unknown {} value '{}', discovery stays manual", STARTUP_ENV_VAR, other);
                Self::Off
            }
        }
    }

    pub fn plan(&self) -> Option<TestPlan> {
        match self {
            Self::Off => None,
            Self::Quick => Some(TestPlan::Quick),
            Self::Full => Some(TestPlan::Full),
            Self::Persisted => Some(TestPlan::PersistedOnly),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        assert_eq!(DiscoveryConfig::from_yaml_str("").unwrap(), DiscoveryConfig::default());
        let config = DiscoveryConfig::default();
        assert_eq!(config.stop_timeout(), Duration::from_secs(25));
        assert!(config.stop_timeout() > config.probe.cleanup_budget());
        assert!(config.validate().is_ok());
        assert_eq!(config.layout.zones_key, "lights");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = DiscoveryConfig::from_yaml_str("probe:\n  quick_modes: []\n").unwrap_err();
        assert!(matches!(err, DiscoveryError::Config(_)));

        let err = DiscoveryConfig::from_yaml_str("probe:\n  brightness_levels: [0, 150]\n").unwrap_err();
        assert!(matches!(err, DiscoveryError::Config(_)));

        let err = DiscoveryConfig::from_yaml_str("probe:\n  command_timeout_ms: 0\n").unwrap_err();
        assert!(matches!(err, DiscoveryError::Config(_)));

        let err = DiscoveryConfig::from_yaml_str("stop_timeout_ms: soon\n").unwrap_err();
        assert!(matches!(err, DiscoveryError::Yaml(_)));
    }

    #[test]
    fn stop_timeout_must_cover_both_cleanup_paths() {
        let text = "stop_timeout_ms: 200\nprobe:\n  command_timeout_ms: 200\n";
        let err = DiscoveryConfig::from_yaml_str(text).unwrap_err();
        assert!(err.to_string().contains("twice command_timeout_ms"));

        let text = "stop_timeout_ms: 400\nprobe:\n  command_timeout_ms: 200\n";
        assert!(DiscoveryConfig::from_yaml_str(text).is_err());

        let text = "stop_timeout_ms: 450\nprobe:\n  command_timeout_ms: 200\n";
        let config = DiscoveryConfig::from_yaml_str(text).unwrap();
        assert_eq!(config.probe.cleanup_budget(), Duration::from_millis(400));
    }

    #[test]
    fn startup_values_map_to_plans() {
        assert_eq!(StartupDiscovery::from_value("startup_quick").plan(), Some(TestPlan::Quick));
        assert_eq!(StartupDiscovery::from_value("STARTUP_FULL").plan(), Some(TestPlan::Full));
        assert_eq!(
            StartupDiscovery::from_value("startup_yaml").plan(),
            Some(TestPlan::PersistedOnly)
        );
        assert_eq!(StartupDiscovery::from_value("off").plan(), None);
        assert_eq!(StartupDiscovery::from_value("sometimes"), StartupDiscovery::Off);
    }

    #[tokio::test]
    async fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("discovery.yaml");
        tokio::fs::write(&path, "document_path: /tmp/found.yaml\nlayout:\n  zones_key: zones\n")
            .await
            .unwrap();

        let config = DiscoveryConfig::load(&path).await.unwrap();
        assert_eq!(config.document_path, PathBuf::from("/tmp/found.yaml"));
        assert_eq!(config.layout.zones_key, "zones");
        assert_eq!(config.layout.modes_key, "detected_modes");

        assert!(matches!(
            DiscoveryConfig::load(dir.path().join("missing.yaml")).await,
            Err(DiscoveryError::Config(_))
        ));
    }
}
