use crate::plan::TestPlan;
use crate::telemetry::{ProbePhase, TestSummary, ZoneRecord};
use crate::types::{ChannelSample, DeviceId, Intensity, ModeName, Rgb, ZoneId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use uuid::Uuid;

/// Lifecycle status of discovery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

impl DiscoveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryStatus::Idle => "idle",
            DiscoveryStatus::Running => "running",
            DiscoveryStatus::Completed => "completed",
            DiscoveryStatus::Failed => "failed",
        }
    }

    /// Whether a new run may start from this status
    pub fn can_start(&self) -> bool {
        !matches!(self, DiscoveryStatus::Running)
    }
}

/// Progress of the current run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    pub current_device: Option<DeviceId>,
    pub current_zone: Option<ZoneId>,
    pub zones_total: usize,
    pub zones_probed: usize,
    pub steps_total: u64,
    pub steps_probed: u64,

    /// Derived from the step counters, rounded to one decimal
    pub percentage: f64,

    /// Algorithm phase of the zone being probed
    #[serde(default)]
    pub phase: Option<ProbePhase>,

    /// Human-readable description of the current control test
    #[serde(default)]
    pub detail: Option<String>,

    /// One entry per zone touched by this run, in probing order
    #[serde(default)]
    pub zones: Vec<ZoneRecord>,
}

impl ProgressState {
    pub fn calculate_percentage(&self) -> f64 {
        if self.steps_total == 0 {
            return 0.0;
        }
        let ratio = self.steps_probed as f64 / self.steps_total as f64;
        (ratio * 1000.0).round() / 10.0
    }

    fn update_percentage(&mut self) {
        self.percentage = self.calculate_percentage();
    }
}

/// Partial update of [`ProgressState`]
///
/// `None` leaves a field untouched. The nested options on the pointer fields
/// allow clearing them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressPatch {
    pub current_device: Option<Option<DeviceId>>,
    pub current_zone: Option<Option<ZoneId>>,
    pub zones_total: Option<usize>,
    pub zones_probed: Option<usize>,
    pub steps_total: Option<u64>,
    pub steps_probed: Option<u64>,
    pub phase: Option<Option<ProbePhase>>,
    pub detail: Option<Option<String>>,

    /// Inserted, or replaces the record of the same device/zone
    pub zone_record: Option<ZoneRecord>,
}

impl ProgressPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_device(mut self, device: impl Into<DeviceId>) -> Self {
        self.current_device = Some(Some(device.into()));
        self
    }

    pub fn current_zone(mut self, zone: impl Into<ZoneId>) -> Self {
        self.current_zone = Some(Some(zone.into()));
        self
    }

    pub fn clear_pointer(mut self) -> Self {
        self.current_device = Some(None);
        self.current_zone = Some(None);
        self.phase = Some(None);
        self.detail = Some(None);
        self
    }

    pub fn totals(mut self, zones_total: usize, steps_total: u64) -> Self {
        self.zones_total = Some(zones_total);
        self.steps_total = Some(steps_total);
        self
    }

    pub fn zones_probed(mut self, zones: usize) -> Self {
        self.zones_probed = Some(zones);
        self
    }

    pub fn steps_probed(mut self, steps: u64) -> Self {
        self.steps_probed = Some(steps);
        self
    }

    pub fn phase(mut self, phase: ProbePhase) -> Self {
        self.phase = Some(Some(phase));
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(Some(detail.into()));
        self
    }

    pub fn zone_record(mut self, record: ZoneRecord) -> Self {
        self.zone_record = Some(record);
        self
    }

    fn apply_to(self, progress: &mut ProgressState) {
        if let Some(v) = self.current_device {
            progress.current_device = v;
        }
        if let Some(v) = self.current_zone {
            progress.current_zone = v;
        }
        if let Some(v) = self.zones_total {
            progress.zones_total = v;
        }
        if let Some(v) = self.zones_probed {
            progress.zones_probed = v;
        }
        if let Some(v) = self.steps_total {
            progress.steps_total = v;
        }
        if let Some(v) = self.steps_probed {
            progress.steps_probed = v;
        }
        if let Some(v) = self.phase {
            progress.phase = v;
        }
        if let Some(v) = self.detail {
            progress.detail = v;
        }
        if let Some(record) = self.zone_record {
            match progress.zones.iter_mut().find(|r| r.is_same_zone(&record)) {
                Some(existing) => *existing = record,
                None => progress.zones.push(record),
            }
        }
        progress.update_percentage();
    }
}

/// A mode that verified on a zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedMode {
    pub mode: ModeName,

    /// Intensity levels verified at this mode
    #[serde(default)]
    pub brightness: BTreeSet<Intensity>,

    /// Channel levels sampled once for the reference mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_sample: Option<ChannelSample>,
}

impl SupportedMode {
    pub fn new(mode: impl Into<ModeName>) -> Self {
        Self {
            mode: mode.into(),
            brightness: BTreeSet::new(),
            reference_sample: None,
        }
    }
}

/// Outcome of one reference color in the color-channel probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorTest {
    pub name: String,
    pub requested: Rgb,

    #[serde(default)]
    pub realized: Option<Rgb>,

    pub verified: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Color-channel control capability of a zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorCapability {
    /// At least the configured number of reference colors verified
    pub works: bool,
    pub verified_colors: usize,
    pub max_channel_value: u8,
    pub tested: Vec<ColorTest>,
}

/// Everything learned about one zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneFindings {
    pub zone_id: ZoneId,

    #[serde(default)]
    pub zone_index: Option<u32>,

    /// Supported modes in plan order
    #[serde(default)]
    pub supported_modes: Vec<SupportedMode>,

    #[serde(default)]
    pub unsupported_modes: Vec<ModeName>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_capability: Option<ColorCapability>,

    #[serde(default)]
    pub summary: TestSummary,
}

impl ZoneFindings {
    pub fn new(zone_id: impl Into<ZoneId>) -> Self {
        Self {
            zone_id: zone_id.into(),
            zone_index: None,
            supported_modes: Vec::new(),
            unsupported_modes: Vec::new(),
            color_capability: None,
            summary: TestSummary::default(),
        }
    }

    /// Names of the supported modes, in plan order
    pub fn detected_modes(&self) -> Vec<ModeName> {
        self.supported_modes.iter().map(|m| m.mode.clone()).collect()
    }

    pub fn supports(&self, mode: &str) -> bool {
        self.supported_modes.iter().any(|m| m.mode == mode)
    }

    pub fn mode(&self, mode: &str) -> Option<&SupportedMode> {
        self.supported_modes.iter().find(|m| m.mode == mode)
    }
}

/// Findings for all zones of one device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFindings {
    pub zones: Vec<ZoneFindings>,
}

/// Terminal results of a completed run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Results {
    pub devices: BTreeMap<DeviceId, DeviceFindings>,

    /// Where the findings were persisted; `None` if the write failed
    pub document_path: Option<PathBuf>,
    pub total_zones_probed: usize,
    pub total_modes_detected: usize,
}

impl Results {
    /// Build results and their aggregate counts
    pub fn new(devices: BTreeMap<DeviceId, DeviceFindings>, document_path: Option<PathBuf>) -> Self {
        let total_zones_probed = devices.values().map(|d| d.zones.len()).sum();
        let total_modes_detected = devices
            .values()
            .flat_map(|d| d.zones.iter())
            .map(|z| z.supported_modes.len())
            .sum();
        Self {
            devices,
            document_path,
            total_zones_probed,
            total_modes_detected,
        }
    }

    pub fn zone(&self, device_id: &str, zone_id: &str) -> Option<&ZoneFindings> {
        self.devices
            .get(device_id)?
            .zones
            .iter()
            .find(|z| z.zone_id == zone_id)
    }
}

/// Aggregate discovery snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryState {
    pub status: DiscoveryStatus,
    pub plan: Option<TestPlan>,

    /// Identifies the run this snapshot belongs to
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: ProgressState,

    /// Present only when `status` is `Completed`
    pub results: Option<Results>,

    /// Present only when `status` is `Failed`, or as a warning on `Completed`
    pub error: Option<String>,

    /// Informational note (e.g. why a run went back to idle)
    pub message: Option<String>,
}

impl DiscoveryState {
    pub(crate) fn apply(&mut self, patch: StatePatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(plan) = patch.plan {
            self.plan = plan;
        }
        if let Some(run_id) = patch.run_id {
            self.run_id = run_id;
        }
        if let Some(started_at) = patch.started_at {
            self.started_at = started_at;
        }
        if let Some(completed_at) = patch.completed_at {
            self.completed_at = completed_at;
        }
        if patch.reset_progress {
            self.progress = ProgressState::default();
        }
        if let Some(progress) = patch.progress {
            progress.apply_to(&mut self.progress);
        }
        if let Some(results) = patch.results {
            self.results = results;
        }
        if let Some(error) = patch.error {
            self.error = error;
        }
        if let Some(message) = patch.message {
            self.message = message;
        }
        self.normalize();
    }

    fn normalize(&mut self) {
        if self.status != DiscoveryStatus::Completed {
            self.results = None;
        }
        if !matches!(
            self.status,
            DiscoveryStatus::Completed | DiscoveryStatus::Failed
        ) {
            self.error = None;
        }
    }
}

/// Partial update of [`DiscoveryState`]
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub status: Option<DiscoveryStatus>,
    pub plan: Option<Option<TestPlan>>,
    pub run_id: Option<Option<Uuid>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,

    /// Reset progress to zero before applying `progress`
    pub reset_progress: bool,
    pub progress: Option<ProgressPatch>,
    pub results: Option<Option<Results>>,
    pub error: Option<Option<String>>,
    pub message: Option<Option<String>>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: DiscoveryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn plan(mut self, plan: TestPlan) -> Self {
        self.plan = Some(Some(plan));
        self
    }

    pub fn run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(Some(run_id));
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(Some(at));
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(Some(at));
        self
    }

    pub fn clear_completed_at(mut self) -> Self {
        self.completed_at = Some(None);
        self
    }

    pub fn reset_progress(mut self) -> Self {
        self.reset_progress = true;
        self
    }

    pub fn progress(mut self, progress: ProgressPatch) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn results(mut self, results: Results) -> Self {
        self.results = Some(Some(results));
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(Some(message.into()));
        self
    }

    pub fn clear_message(mut self) -> Self {
        self.message = Some(None);
        self
    }
}

impl From<ProgressPatch> for StatePatch {
    fn from(progress: ProgressPatch) -> Self {
        StatePatch::new().progress(progress)
    }
}
