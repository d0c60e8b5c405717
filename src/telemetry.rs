//! Fine-grained progress reporting for a probing run.
//!
//! The [`ProbingEngine`](crate::ProbingEngine) reports every control test it
//! issues through a [`ProbeListener`]; the runner turns those reports into
//! [`ProgressState`](crate::ProgressState) updates and keeps one
//! [`ZoneRecord`] per zone it touched.

use crate::types::{DeviceId, Intensity, ModeName, ZoneId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of the per-zone probing algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbePhase {
    /// Phase 1: every plan mode at its canonical intensity
    Sieve,
    /// Phase 2: remaining intensity levels for each candidate mode
    BrightnessSweep,
    /// Phase 3: reference colors in the full-color mode
    ColorProbe,
    /// Final turn-off of the zone
    Cleanup,
}

impl ProbePhase {
    pub fn label(&self) -> &'static str {
        match self {
            ProbePhase::Sieve => "Sieve",
            ProbePhase::BrightnessSweep => "Brightness",
            ProbePhase::ColorProbe => "Color",
            ProbePhase::Cleanup => "Cleanup",
        }
    }
}

/// One control test about to be issued, or just finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeStep {
    pub phase: ProbePhase,
    pub zone_id: ZoneId,
    pub mode: ModeName,
    pub intensity: Option<Intensity>,

    /// Reference color name, phase 3 only
    pub color: Option<String>,

    /// 1-based position within the phase
    pub index: usize,
    pub phase_total: usize,
}

impl fmt::Display for ProbeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} {}", self.phase.label(), self.zone_id, self.mode)?;
        if let Some(intensity) = self.intensity {
            write!(f, " @ {}%", intensity)?;
        }
        if let Some(color) = &self.color {
            write!(f, " {}", color)?;
        }
        write!(f, " ({}/{})", self.index, self.phase_total)
    }
}

/// Receives step reports from the probing engine
///
/// Called synchronously from the probing task, so implementations must not block.
pub trait ProbeListener: Send + Sync {
    fn step_started(&self, _step: &ProbeStep) {}

    fn step_finished(&self, _step: &ProbeStep, _verified: bool) {}
}

/// Listener that ignores every report
pub struct NoopListener;

impl ProbeListener for NoopListener {}

/// Tally of control tests issued against a zone
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    pub total_tests: usize,
    pub successful_tests: usize,
    pub failed_tests: usize,
}

impl TestSummary {
    pub fn record(&mut self, verified: bool) {
        self.total_tests += 1;
        if verified {
            self.successful_tests += 1;
        } else {
            self.failed_tests += 1;
        }
    }
}

/// How the probing of one zone ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneOutcome {
    Probing,
    Completed,
    Failed,
    Stopped,
}

/// Progress log entry for one zone of the current run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneRecord {
    pub device_id: DeviceId,
    pub zone_id: ZoneId,
    pub outcome: ZoneOutcome,
    pub started_at: DateTime<Utc>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub summary: TestSummary,

    #[serde(default)]
    pub error: Option<String>,
}

impl ZoneRecord {
    pub fn started(device_id: impl Into<DeviceId>, zone_id: impl Into<ZoneId>) -> Self {
        Self {
            device_id: device_id.into(),
            zone_id: zone_id.into(),
            outcome: ZoneOutcome::Probing,
            started_at: Utc::now(),
            finished_at: None,
            summary: TestSummary::default(),
            error: None,
        }
    }

    pub fn finish(mut self, outcome: ZoneOutcome, summary: TestSummary, error: Option<String>) -> Self {
        self.outcome = outcome;
        self.summary = summary;
        self.error = error;
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn is_same_zone(&self, other: &ZoneRecord) -> bool {
        self.device_id == other.device_id && self.zone_id == other.zone_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_renders_detail_line() {
        let step = ProbeStep {
            phase: ProbePhase::Sieve,
            zone_id: "zone_1".into(),
            mode: "PURPLE".into(),
            intensity: Some(100),
            color: None,
            index: 3,
            phase_total: 18,
        };
        assert_eq!(step.to_string(), "Sieve: zone_1 PURPLE @ 100% (3/18)");
    }

    #[test]
    fn summary_counts_both_outcomes() {
        let mut summary = TestSummary::default();
        summary.record(true);
        summary.record(false);
        summary.record(true);
        assert_eq!(summary.total_tests, 3);
        assert_eq!(summary.successful_tests, 2);
        assert_eq!(summary.failed_tests, 1);
    }
}
