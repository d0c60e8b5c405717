use crate::client::DeviceApiClient;
use crate::config::{DiscoveryConfig, StartupDiscovery};
use crate::document::{DocumentStore, FindingsDocument};
use crate::error::{DiscoveryError, Result};
use crate::plan::TestPlan;
use crate::prober::ProbingEngine;
use crate::publisher::StatePublisher;
use crate::runner::{JobRunner, RunReceipt};
use crate::state::{DiscoveryState, DiscoveryStatus, ProgressState, Results};
use crate::store::{StateObserver, StateStore};
use crate::subscription::StateReceiver;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

/// Snapshot returned by [`Coordinator::status`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: DiscoveryStatus,
    pub plan: Option<TestPlan>,
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: ProgressState,
    pub is_running: bool,
    pub error: Option<String>,
    pub message: Option<String>,
}

/// Forwards store notifications to the broadcast channel and the registered publisher
struct Forwarder {
    publisher: RwLock<Option<Arc<dyn StatePublisher>>>,
    updates: broadcast::Sender<DiscoveryState>,
}

impl Forwarder {
    fn publisher(&self) -> Option<Arc<dyn StatePublisher>> {
        self.publisher
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_publisher(&self, publisher: Option<Arc<dyn StatePublisher>>) {
        *self.publisher.write().unwrap_or_else(PoisonError::into_inner) = publisher;
    }
}

#[async_trait]
impl StateObserver for Forwarder {
    async fn on_state_change(&self, state: &DiscoveryState) -> Result<()> {
        // No receivers is fine
        let _ = self.updates.send(state.clone());

        if let Some(publisher) = self.publisher() {
            if let Err(e) = publisher.publish_state(state).await {
                tracing::warn!("Failed to publish discovery state: {}", e);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "publisher"
    }
}

/// Entry point of the discovery subsystem
///
/// Owns the state store and the job runner, and serializes the control
/// operations. Construct one per process and share it as `Arc<Coordinator>`.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use zone_discovery::testing::{MemoryDocumentStore, SimulatedDevice};
/// use zone_discovery::{Coordinator, DiscoveryConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let device = SimulatedDevice::new().with_zone("spa-1", 1, &["OFF", "ON", "WHITE"]);
///     let coordinator = Coordinator::new(
///         Arc::new(device),
///         Arc::new(MemoryDocumentStore::new()),
///         DiscoveryConfig::default(),
///     );
///
///     coordinator.start("quick").await?;
///     let mut updates = coordinator.subscribe_state();
///     while let Ok(state) = updates.recv().await {
///         println!("{}: {}%", state.status.as_str(), state.progress.percentage);
///         if !coordinator.status().is_running {
///             break;
///         }
///     }
///
///     coordinator.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct Coordinator {
    store: Arc<StateStore>,
    runner: JobRunner,
    forwarder: Arc<Forwarder>,
    guard: Mutex<()>,
    shut_down: AtomicBool,
}

impl Coordinator {
    /// Create the coordinator; must be called inside a Tokio runtime
    pub fn new(
        client: Arc<dyn DeviceApiClient>,
        documents: Arc<dyn DocumentStore>,
        config: DiscoveryConfig,
    ) -> Self {
        let store = Arc::new(StateStore::new());
        let (updates, _) = broadcast::channel(100);
        let forwarder = Arc::new(Forwarder {
            publisher: RwLock::new(None),
            updates,
        });
        store.subscribe(forwarder.clone());

        let stop_timeout = config.stop_timeout();
        let document = FindingsDocument::new(documents, config.document_path, config.layout);
        let engine = Arc::new(ProbingEngine::new(client, config.probe));
        let runner = JobRunner::new(store.clone(), engine, document, stop_timeout);

        Self {
            store,
            runner,
            forwarder,
            guard: Mutex::new(()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Start a run with the named plan (`full`, `quick` or `persisted_only`)
    pub async fn start(&self, plan_name: &str) -> Result<RunReceipt> {
        let plan = plan_name.parse::<TestPlan>().inspect_err(|e| {
            tracing::warn!("Discovery start rejected: {}", e);
        })?;
        self.start_plan(plan).await
    }

    pub async fn start_plan(&self, plan: TestPlan) -> Result<RunReceipt> {
        let _guard = self.guard.lock().await;
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(DiscoveryError::ShutDown);
        }
        self.runner.start(plan)
    }

    /// Stop the active run; the state returns to `Idle`
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.guard.lock().await;
        self.runner.stop().await.inspect_err(|e| {
            tracing::warn!("Discovery stop rejected: {}", e);
        })
    }

    pub fn is_running(&self) -> bool {
        self.runner.is_running()
    }

    pub fn status(&self) -> StatusSnapshot {
        let state = self.store.get();
        StatusSnapshot {
            status: state.status,
            plan: state.plan,
            run_id: state.run_id,
            started_at: state.started_at,
            completed_at: state.completed_at,
            progress: state.progress,
            is_running: self.runner.is_running(),
            error: state.error,
            message: state.message,
        }
    }

    /// Results of the last completed run
    pub fn results(&self) -> Result<Results> {
        self.store.get().results.ok_or(DiscoveryError::NotAvailable)
    }

    /// Full copy of the current state
    pub fn state(&self) -> DiscoveryState {
        self.store.get()
    }

    /// Return to `Idle`, discarding results; rejected while a run is active
    pub async fn reset(&self) -> Result<()> {
        let _guard = self.guard.lock().await;
        if self.runner.is_running() {
            tracing::warn!("Discovery reset rejected: run in progress");
            return Err(DiscoveryError::ResetWhileRunning);
        }
        self.store.reset();
        tracing::info!("Discovery state reset");
        Ok(())
    }

    /// Set the callback that receives every state change, replacing any previous one
    pub fn register_publisher(&self, publisher: Arc<dyn StatePublisher>) {
        self.forwarder.set_publisher(Some(publisher));
        tracing::debug!("Discovery state publisher registered");
    }

    /// Push the current state to the registered publisher
    ///
    /// Returns the publisher's error, unlike change notifications.
    pub async fn publish_current(&self) -> Result<()> {
        match self.forwarder.publisher() {
            Some(publisher) => publisher.publish_state(&self.store.get()).await,
            None => {
                tracing::debug!("No discovery state publisher registered");
                Ok(())
            }
        }
    }

    /// Receive every state change from now on
    pub fn subscribe_state(&self) -> StateReceiver {
        StateReceiver::new(self.forwarder.updates.subscribe())
    }

    /// Wait until all state changes so far reached the publisher and subscribers
    pub async fn flush(&self) {
        self.store.flush().await;
    }

    /// Publish the current state, then start the run requested at startup, if any
    pub async fn boot(&self, startup: StartupDiscovery) -> Option<Result<RunReceipt>> {
        if let Err(e) = self.publish_current().await {
            tracing::warn!("Failed to publish initial discovery state: {}", e);
        }

        let Some(plan) = startup.plan() else {
            tracing::info!("Discovery is under manual control");
            return None;
        };
        tracing::info!("Starting {} discovery at startup", plan);
        Some(self.start_plan(plan).await)
    }

    /// Stop any run, deliver pending notifications and detach the publisher
    ///
    /// Later `start` calls fail. Safe to call more than once.
    pub async fn shutdown(&self) {
        let _guard = self.guard.lock().await;
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.runner.is_running() {
            if let Err(e) = self.runner.stop().await {
                tracing::debug!("Stop during shutdown: {}", e);
            }
        }
        self.store.flush().await;
        self.forwarder.set_publisher(None);
        tracing::info!("Discovery coordinator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryDocumentStore, SimulatedDevice};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn coordinator(device: SimulatedDevice) -> Coordinator {
        let mut config = DiscoveryConfig::default();
        config.probe = config.probe.without_delays();
        Coordinator::new(Arc::new(device), Arc::new(MemoryDocumentStore::new()), config)
    }

    async fn settle(coordinator: &Coordinator) {
        while coordinator.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        coordinator.flush().await;
    }

    #[tokio::test]
    async fn invalid_plan_leaves_state_untouched() {
        let coordinator = coordinator(SimulatedDevice::new());
        let err = coordinator.start("bogus").await.unwrap_err();
        assert!(err.to_string().contains("Invalid mode"));
        assert_eq!(coordinator.state(), DiscoveryState::default());
    }

    #[tokio::test]
    async fn results_require_a_completed_run() {
        let coordinator = coordinator(SimulatedDevice::new().with_zone("spa", 1, &["OFF"]));
        assert!(matches!(coordinator.results(), Err(DiscoveryError::NotAvailable)));

        coordinator.start("quick").await.unwrap();
        settle(&coordinator).await;
        assert_eq!(coordinator.results().unwrap().total_zones_probed, 1);

        coordinator.reset().await.unwrap();
        assert!(matches!(coordinator.results(), Err(DiscoveryError::NotAvailable)));
        assert_eq!(coordinator.status().status, DiscoveryStatus::Idle);
    }

    #[tokio::test]
    async fn publisher_is_replaced_not_added() {
        let coordinator = coordinator(SimulatedDevice::new());
        let first = Arc::new(StdMutex::new(0));
        let second = Arc::new(StdMutex::new(0));

        let counter = first.clone();
        coordinator.register_publisher(Arc::new(move |_: &DiscoveryState| -> Result<()> {
            *counter.lock().unwrap() += 1;
            Ok(())
        }));
        let counter = second.clone();
        coordinator.register_publisher(Arc::new(move |_: &DiscoveryState| -> Result<()> {
            *counter.lock().unwrap() += 1;
            Ok(())
        }));

        coordinator.publish_current().await.unwrap();
        assert_eq!(*first.lock().unwrap(), 0);
        assert_eq!(*second.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn failing_publisher_does_not_affect_run() {
        let coordinator = coordinator(SimulatedDevice::new().with_zone("spa", 1, &["OFF", "ON"]));
        coordinator.register_publisher(Arc::new(|_: &DiscoveryState| -> Result<()> {
            Err(DiscoveryError::Publish("broker offline".into()))
        }));

        coordinator.start("quick").await.unwrap();
        settle(&coordinator).await;
        assert_eq!(coordinator.status().status, DiscoveryStatus::Completed);
        assert!(coordinator.publish_current().await.is_err());
    }

    #[tokio::test]
    async fn shutdown_is_safe_without_a_run() {
        let coordinator = coordinator(SimulatedDevice::new());
        coordinator.shutdown().await;
        coordinator.shutdown().await;
        assert!(matches!(
            coordinator.start("quick").await,
            Err(DiscoveryError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn boot_starts_requested_plan() {
        let coordinator = coordinator(SimulatedDevice::new().with_zone("spa", 1, &["OFF"]));
        assert!(coordinator.boot(StartupDiscovery::Off).await.is_none());

        let receipt = coordinator.boot(StartupDiscovery::Quick).await.unwrap().unwrap();
        assert_eq!(receipt.plan, TestPlan::Quick);
        settle(&coordinator).await;
        assert_eq!(coordinator.status().status, DiscoveryStatus::Completed);
    }
}
