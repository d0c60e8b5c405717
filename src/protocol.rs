use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::plan::TestPlan;
use crate::state::{DeviceFindings, DiscoveryState, DiscoveryStatus, ProgressState, Results};
use crate::telemetry::ProbePhase;
use crate::types::{DeviceId, ZoneId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Progress section of a status message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub percentage: f64,
    pub current_device: Option<DeviceId>,
    pub current_zone: Option<ZoneId>,
    pub zones_total: usize,
    pub zones_probed: usize,
    pub steps_total: u64,
    pub steps_probed: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<ProbePhase>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&ProgressState> for ProgressPayload {
    fn from(progress: &ProgressState) -> Self {
        Self {
            percentage: progress.percentage,
            current_device: progress.current_device.clone(),
            current_zone: progress.current_zone.clone(),
            zones_total: progress.zones_total,
            zones_probed: progress.zones_probed,
            steps_total: progress.steps_total,
            steps_probed: progress.steps_probed,
            phase: progress.phase,
            detail: progress.detail.clone(),
        }
    }
}

/// Message published on the status topic for every state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: DiscoveryStatus,
    pub mode: Option<TestPlan>,
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: ProgressPayload,
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusPayload {
    pub fn from_state(state: &DiscoveryState) -> Self {
        Self {
            status: state.status,
            mode: state.plan,
            run_id: state.run_id,
            started_at: state.started_at,
            completed_at: state.completed_at,
            progress: ProgressPayload::from(&state.progress),
            error: state.error.clone(),
            message: state.message.clone(),
        }
    }
}

/// Message published, retained, on the result topic when a run completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub completed_at: Option<DateTime<Utc>>,
    pub document_path: Option<PathBuf>,
    pub total_zones_probed: usize,
    pub total_modes_detected: usize,
    pub devices: BTreeMap<DeviceId, DeviceFindings>,
}

impl ResultPayload {
    pub fn from_results(results: &Results, state: &DiscoveryState) -> Self {
        Self {
            completed_at: state.completed_at,
            document_path: results.document_path.clone(),
            total_zones_probed: results.total_zones_probed,
            total_modes_detected: results.total_modes_detected,
            devices: results.devices.clone(),
        }
    }
}

/// Action requested on the control topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Start,
    Stop,
    Reset,
}

/// Control message, e.g. `{"action": "start", "mode": "full"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub action: ControlAction,

    /// Plan name for `start`
    #[serde(default = "default_control_mode")]
    pub mode: String,
}

fn default_control_mode() -> String {
    TestPlan::Quick.as_str().to_string()
}

impl ControlRequest {
    pub fn start(plan: TestPlan) -> Self {
        Self {
            action: ControlAction::Start,
            mode: plan.as_str().to_string(),
        }
    }

    pub fn stop() -> Self {
        Self {
            action: ControlAction::Stop,
            mode: default_control_mode(),
        }
    }
}

/// Outcome of a control operation as reported to front ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            error: None,
            message: Some(message.into()),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            message: None,
        }
    }

    /// Map an operation result, using `message` on success
    pub fn from_result<T>(result: Result<T>, message: impl FnOnce(T) -> String) -> Self {
        match result {
            Ok(value) => Self::ok(message(value)),
            Err(e) => Self::failed(e.to_string()),
        }
    }
}

/// Parse a control message and run it against the coordinator
///
/// Malformed messages produce a failed result rather than an error.
pub async fn dispatch_control(coordinator: &Coordinator, payload: &[u8]) -> ActionResult {
    let request: ControlRequest = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Invalid discovery control message: {}", e);
            return ActionResult::failed(format!("Invalid control message: {}", e));
        }
    };

    tracing::info!("Discovery control: {:?} ({})", request.action, request.mode);

    let result = match request.action {
        ControlAction::Start => ActionResult::from_result(
            coordinator.start(&request.mode).await,
            |receipt| format!("Discovery started ({} plan)", receipt.plan),
        ),
        ControlAction::Stop => {
            ActionResult::from_result(coordinator.stop().await, |_| "Discovery stopped".to_string())
        }
        ControlAction::Reset => ActionResult::from_result(coordinator.reset().await, |_| {
            "Discovery state reset".to_string()
        }),
    };

    if let Some(error) = &result.error {
        tracing::warn!("Discovery control {:?} rejected: {}", request.action, error);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiscoveryError;

    #[test]
    fn control_mode_defaults_to_quick() {
        let request: ControlRequest = serde_json::from_str(r#"{"action":"start"}"#).unwrap();
        assert_eq!(request, ControlRequest::start(TestPlan::Quick));

        let request: ControlRequest =
            serde_json::from_str(r#"{"action":"stop","mode":"full"}"#).unwrap();
        assert_eq!(request.action, ControlAction::Stop);
    }

    #[test]
    fn unknown_action_does_not_parse() {
        assert!(serde_json::from_str::<ControlRequest>(r#"{"action":"explode"}"#).is_err());
    }

    #[test]
    fn action_result_omits_empty_fields() {
        let ok = serde_json::to_value(ActionResult::ok("Discovery stopped")).unwrap();
        assert_eq!(ok, serde_json::json!({"success": true, "message": "Discovery stopped"}));

        let failed = ActionResult::from_result::<()>(Err(DiscoveryError::NotRunning), |_| String::new());
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("No discovery running"));
    }

    #[test]
    fn status_payload_uses_wire_names() {
        let state = DiscoveryState::default();
        let json = serde_json::to_value(StatusPayload::from_state(&state)).unwrap();
        assert_eq!(json["status"], "idle");
        assert_eq!(json["progress"]["percentage"], 0.0);
        assert!(json["mode"].is_null());
        assert!(json.get("message").is_none());
    }
}
