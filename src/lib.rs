//! Capability discovery for multi-zone lighting devices
//!
//! This library finds out which operating modes, intensity levels and color
//! channels each zone of a remotely controlled device really supports. It
//! drives every zone through a test plan, reads the zone back after each
//! control call and records what verified. It supports:
//!
//! - Full and quick test plans, plus re-publishing previously persisted findings
//! - A cancellable background run with live progress
//! - Safe-state cleanup of every probed zone, even on failure or stop
//! - Read-merge-write persistence that preserves unrelated document content
//! - State publication to a message bus and control messages from it
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use zone_discovery::{
//!     BusStatePublisher, Coordinator, DiscoveryConfig, StartupDiscovery, YamlDocumentStore,
//! };
//! use zone_discovery::testing::{MemoryPublisher, SimulatedDevice};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DiscoveryConfig::default();
//!
//!     // Any DeviceApiClient implementation; a simulated one here
//!     let device = SimulatedDevice::new().with_zone("spa-1", 1, &["OFF", "ON", "PURPLE"]);
//!     let coordinator = Arc::new(Coordinator::new(
//!         Arc::new(device),
//!         Arc::new(YamlDocumentStore),
//!         config.clone(),
//!     ));
//!
//!     // Publish every state change as JSON
//!     let bus = Arc::new(MemoryPublisher::new());
//!     coordinator.register_publisher(Arc::new(BusStatePublisher::new(bus, &config.base_topic)));
//!
//!     // Honor DISCOVERY_MODE, or start explicitly
//!     if coordinator.boot(StartupDiscovery::from_env()).await.is_none() {
//!         coordinator.start("quick").await?;
//!     }
//!
//!     let mut updates = coordinator.subscribe_state();
//!     while let Ok(state) = updates.recv().await {
//!         println!("{} {}%", state.status.as_str(), state.progress.percentage);
//!         if !coordinator.is_running() {
//!             break;
//!         }
//!     }
//!
//!     println!("{:?}", coordinator.results()?);
//!     coordinator.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Coordinator**: control facade (`start`, `stop`, `status`, `results`, `reset`)
//! - **Runner**: the single background run and its cancellation
//! - **Prober**: the per-zone probing algorithm and cleanup
//! - **Store**: the shared discovery state and its observers
//! - **Document**: persisted findings and the merge
//! - **Publisher / Protocol**: message bus payloads and control messages
//! - **Client**: the device API the library drives

mod client;
mod config;
mod coordinator;
mod document;
mod error;
mod plan;
mod prober;
mod protocol;
mod publisher;
mod runner;
mod state;
mod store;
mod subscription;
mod telemetry;
mod types;

pub mod testing;

// Public exports
pub use client::{DeviceApiClient, DeviceResult};
pub use config::{DiscoveryConfig, StartupDiscovery, STARTUP_ENV_VAR};
pub use coordinator::{Coordinator, StatusSnapshot};
pub use document::{
    findings_from_document, merge_findings, DocumentLayout, DocumentStore, FindingsDocument,
    YamlDocumentStore,
};
pub use error::{DeviceError, DiscoveryError, DocumentError, Result};
pub use plan::{PlanSettings, ProbeConfig, TestPlan};
pub use prober::ProbingEngine;
pub use protocol::{
    dispatch_control, ActionResult, ControlAction, ControlRequest, ProgressPayload,
    ResultPayload, StatusPayload,
};
pub use publisher::{BusStatePublisher, DiscoveryTopics, MessagePublisher, StatePublisher};
pub use runner::{JobRunner, RunReceipt};
pub use state::{
    ColorCapability, ColorTest, DeviceFindings, DiscoveryState, DiscoveryStatus, ProgressPatch,
    ProgressState, Results, StatePatch, SupportedMode, ZoneFindings,
};
pub use store::{observer_fn, StateObserver, StateStore};
pub use subscription::StateReceiver;
pub use telemetry::{
    NoopListener, ProbeListener, ProbePhase, ProbeStep, TestSummary, ZoneOutcome, ZoneRecord,
};
pub use types::{
    ChannelSample, DeviceId, DeviceRef, Intensity, ModeName, Rgb, ZoneCommand, ZoneId, ZoneRef,
    ZoneSnapshot,
};
