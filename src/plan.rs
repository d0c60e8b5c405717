use crate::error::DiscoveryError;
use crate::types::{Intensity, ModeName};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Named discovery plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPlan {
    /// Exhaustive mode set, long settle delay
    Full,

    /// Small representative mode subset, shorter settle delay
    Quick,

    /// No probing; re-publish previously persisted findings
    #[serde(alias = "yaml_only")]
    PersistedOnly,
}

impl TestPlan {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestPlan::Full => "full",
            TestPlan::Quick => "quick",
            TestPlan::PersistedOnly => "persisted_only",
        }
    }

    /// Whether this plan drives the device API at all
    pub fn probes_devices(&self) -> bool {
        !matches!(self, TestPlan::PersistedOnly)
    }
}

impl fmt::Display for TestPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestPlan {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(TestPlan::Full),
            "quick" => Ok(TestPlan::Quick),
            // Older front ends still send the pre-rename value
            "persisted_only" | "yaml_only" => Ok(TestPlan::PersistedOnly),
            other => Err(DiscoveryError::InvalidPlan(other.to_string())),
        }
    }
}

/// Concrete settings a plan resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSettings {
    pub plan: TestPlan,

    /// Modes exercised by the phase-1 sieve, in test order
    pub modes: Vec<ModeName>,

    /// Wait after each control call before trusting a read-back
    pub settle_delay: Duration,
}

/// Tunables of the probing algorithm
///
/// The defaults are the values measured against one lighting fixture family;
/// other hardware may need different canonical intensities or tolerance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_off_mode")]
    pub off_mode: ModeName,

    #[serde(default)]
    pub off_intensity: Intensity,

    #[serde(default = "default_full_intensity")]
    pub full_intensity: Intensity,

    #[serde(default = "default_brightness_levels")]
    pub brightness_levels: Vec<Intensity>,

    /// Mode whose channel levels are sampled once for diagnostics
    #[serde(default = "default_reference_mode")]
    pub reference_mode: ModeName,

    /// Full-color mode that unlocks the color-channel probe
    #[serde(default = "default_color_mode")]
    pub color_mode: ModeName,

    #[serde(default = "default_color_tolerance")]
    pub color_tolerance: u8,

    #[serde(default = "default_color_min_verified")]
    pub color_min_verified: usize,

    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,

    /// Base backoff between read-back attempts; attempt `n` waits `n` times this
    #[serde(default = "default_verify_backoff_ms")]
    pub verify_backoff_ms: u64,

    /// Upper bound for each safe-state cleanup command
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Require the read-back intensity to match, not only the mode
    #[serde(default)]
    pub brightness_must_match: bool,

    #[serde(default = "default_full_modes")]
    pub full_modes: Vec<ModeName>,

    #[serde(default = "default_quick_modes")]
    pub quick_modes: Vec<ModeName>,

    #[serde(default = "default_full_settle_ms")]
    pub full_settle_ms: u64,

    #[serde(default = "default_quick_settle_ms")]
    pub quick_settle_ms: u64,
}

fn default_off_mode() -> ModeName {
    "OFF".to_string()
}

fn default_full_intensity() -> Intensity {
    100
}

fn default_brightness_levels() -> Vec<Intensity> {
    vec![0, 25, 50, 75, 100]
}

fn default_reference_mode() -> ModeName {
    "WHITE".to_string()
}

fn default_color_mode() -> ModeName {
    "FULL_DYNAMIC_RGB".to_string()
}

fn default_color_tolerance() -> u8 {
    5
}

fn default_color_min_verified() -> usize {
    3
}

fn default_verify_attempts() -> u32 {
    3
}

fn default_verify_backoff_ms() -> u64 {
    2_000
}

fn default_command_timeout_ms() -> u64 {
    10_000
}

fn default_full_modes() -> Vec<ModeName> {
    [
        "OFF",
        "PURPLE",
        "ORANGE",
        "RED",
        "YELLOW",
        "GREEN",
        "AQUA",
        "BLUE",
        "WHITE",
        "AMBER",
        "HIGH_SPEED_COLOR_WHEEL",
        "HIGH_SPEED_WHEEL",
        "LOW_SPEED_WHEEL",
        "FULL_DYNAMIC_RGB",
        "AUTO_TIMER_EXTERIOR",
        "PARTY",
        "COLOR_WHEEL",
        "ON",
    ]
    .iter()
    .map(|m| m.to_string())
    .collect()
}

fn default_quick_modes() -> Vec<ModeName> {
    ["OFF", "ON", "PURPLE", "WHITE"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_full_settle_ms() -> u64 {
    20_000
}

fn default_quick_settle_ms() -> u64 {
    10_000
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            off_mode: default_off_mode(),
            off_intensity: 0,
            full_intensity: default_full_intensity(),
            brightness_levels: default_brightness_levels(),
            reference_mode: default_reference_mode(),
            color_mode: default_color_mode(),
            color_tolerance: default_color_tolerance(),
            color_min_verified: default_color_min_verified(),
            verify_attempts: default_verify_attempts(),
            verify_backoff_ms: default_verify_backoff_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            brightness_must_match: false,
            full_modes: default_full_modes(),
            quick_modes: default_quick_modes(),
            full_settle_ms: default_full_settle_ms(),
            quick_settle_ms: default_quick_settle_ms(),
        }
    }
}

impl ProbeConfig {
    /// Resolve a plan into its mode set and settle delay
    pub fn settings_for(&self, plan: TestPlan) -> PlanSettings {
        let (modes, settle_ms) = match plan {
            TestPlan::Full => (self.full_modes.clone(), self.full_settle_ms),
            TestPlan::Quick => (self.quick_modes.clone(), self.quick_settle_ms),
            TestPlan::PersistedOnly => (Vec::new(), 0),
        };
        PlanSettings {
            plan,
            modes,
            settle_delay: Duration::from_millis(settle_ms),
        }
    }

    /// Intensity used by the phase-1 sieve for a mode
    pub fn canonical_intensity(&self, mode: &str) -> Intensity {
        if mode == self.off_mode {
            self.off_intensity
        } else {
            self.full_intensity
        }
    }

    /// Levels tested by the brightness sweep: everything not already proven by the sieve
    pub fn sweep_levels(&self) -> Vec<Intensity> {
        self.brightness_levels
            .iter()
            .copied()
            .filter(|level| *level != self.full_intensity && *level != self.off_intensity)
            .collect()
    }

    pub fn verify_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.verify_backoff_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Longest the safe-state cleanup of one zone can take: the primary off
    /// call and the fallback, each bounded by the command timeout
    pub fn cleanup_budget(&self) -> Duration {
        self.command_timeout() * 2
    }

    /// Zero all delays; used by tests and simulations
    pub fn without_delays(mut self) -> Self {
        self.verify_backoff_ms = 0;
        self.full_settle_ms = 0;
        self.quick_settle_ms = 0;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_plan_names() {
        assert_eq!("full".parse::<TestPlan>().unwrap(), TestPlan::Full);
        assert_eq!("quick".parse::<TestPlan>().unwrap(), TestPlan::Quick);
        assert_eq!(
            "yaml_only".parse::<TestPlan>().unwrap(),
            TestPlan::PersistedOnly
        );
        let err = "bogus".parse::<TestPlan>().unwrap_err();
        assert!(err.to_string().contains("Invalid mode"));
    }

    #[test]
    fn sweep_skips_levels_proven_by_sieve() {
        let config = ProbeConfig::default();
        assert_eq!(config.sweep_levels(), vec![25, 50, 75]);
        assert_eq!(config.canonical_intensity("OFF"), 0);
        assert_eq!(config.canonical_intensity("PURPLE"), 100);
    }

    #[test]
    fn quick_plan_is_a_subset_with_shorter_delay() {
        let config = ProbeConfig::default();
        let quick = config.settings_for(TestPlan::Quick);
        let full = config.settings_for(TestPlan::Full);
        assert_eq!(quick.modes.len(), 4);
        assert!(quick.modes.iter().all(|m| full.modes.contains(m)));
        assert!(quick.settle_delay < full.settle_delay);
        assert!(config.settings_for(TestPlan::PersistedOnly).modes.is_empty());
    }

    #[test]
    fn backoff_grows_per_attempt() {
        let config = ProbeConfig::default();
        assert_eq!(config.verify_backoff(1), Duration::from_secs(2));
        assert_eq!(config.verify_backoff(2), Duration::from_secs(4));
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config: ProbeConfig = serde_yaml::from_str("color_tolerance: 8\n").unwrap();
        assert_eq!(config.color_tolerance, 8);
        assert_eq!(config.off_mode, "OFF");
        assert_eq!(config.full_modes.len(), 18);
    }
}
