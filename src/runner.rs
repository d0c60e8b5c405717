use crate::document::FindingsDocument;
use crate::error::{DiscoveryError, Result};
use crate::plan::{PlanSettings, TestPlan};
use crate::prober::{cancellable, check_cancelled, ProbingEngine};
use crate::state::{DeviceFindings, DiscoveryStatus, ProgressPatch, Results, StatePatch};
use crate::store::StateStore;
use crate::telemetry::{ProbeListener, ProbePhase, ProbeStep, TestSummary, ZoneOutcome, ZoneRecord};
use crate::types::{DeviceId, DeviceRef, ZoneRef};
use chrono::Utc;
use futures_util::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identifies a run accepted by [`JobRunner::start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReceipt {
    pub run_id: Uuid,
    pub plan: TestPlan,
}

struct ActiveRun {
    run_id: Uuid,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs at most one discovery job in the background
///
/// Callers must serialize `start` and `stop`; the
/// [`Coordinator`](crate::Coordinator) does.
pub struct JobRunner {
    store: Arc<StateStore>,
    engine: Arc<ProbingEngine>,
    document: FindingsDocument,
    stop_timeout: Duration,
    active: Mutex<Option<ActiveRun>>,
}

impl JobRunner {
    pub fn new(
        store: Arc<StateStore>,
        engine: Arc<ProbingEngine>,
        document: FindingsDocument,
        stop_timeout: Duration,
    ) -> Self {
        let cleanup_budget = engine.config().cleanup_budget();
        if stop_timeout <= cleanup_budget {
            tracing::warn!(
                "Stop timeout {:?} does not cover the cleanup budget {:?}; a stop may abort zone cleanup",
                stop_timeout,
                cleanup_budget
            );
        }
        Self {
            store,
            engine,
            document,
            stop_timeout,
            active: Mutex::new(None),
        }
    }

    /// Whether a job task is alive
    pub fn is_running(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|run| !run.handle.is_finished())
    }

    /// Mark the state `Running` and spawn the job
    pub fn start(&self, plan: TestPlan) -> Result<RunReceipt> {
        let mut active = self.lock();
        if active.as_ref().is_some_and(|run| !run.handle.is_finished()) {
            tracing::warn!("Discovery start rejected: already running");
            return Err(DiscoveryError::AlreadyRunning);
        }

        let run_id = Uuid::new_v4();
        let settings = self.engine.config().settings_for(plan);
        self.store.update(
            StatePatch::new()
                .status(DiscoveryStatus::Running)
                .plan(plan)
                .run_id(run_id)
                .started_at(Utc::now())
                .clear_completed_at()
                .reset_progress()
                .clear_error()
                .clear_message(),
        );

        let token = CancellationToken::new();
        let job = Job {
            store: self.store.clone(),
            engine: self.engine.clone(),
            document: self.document.clone(),
            settings,
            token: token.clone(),
            run_id,
        };

        tracing::info!("Starting discovery run {} ({} plan)", run_id, plan);
        let handle = tokio::spawn(job.run());
        *active = Some(ActiveRun {
            run_id,
            token,
            handle,
        });

        Ok(RunReceipt { run_id, plan })
    }

    /// Cancel the running job and return the state to `Idle`
    ///
    /// Waits at most the stop timeout for the job to wind down, then aborts it.
    pub async fn stop(&self) -> Result<()> {
        let run = match self.lock().take() {
            Some(run) if !run.handle.is_finished() => run,
            _ => return Err(DiscoveryError::NotRunning),
        };

        tracing::info!("Stopping discovery run {}", run.run_id);
        run.token.cancel();

        let mut handle = run.handle;
        let crashed = match timeout(self.stop_timeout, &mut handle).await {
            Ok(Ok(())) => {
                tracing::debug!("Discovery run {} wound down", run.run_id);
                None
            }
            Ok(Err(e)) if e.is_panic() => {
                let error = DiscoveryError::from_panic(e.into_panic());
                tracing::error!("Discovery run {} panicked: {}", run.run_id, error);
                Some(error)
            }
            Ok(Err(e)) => {
                tracing::warn!("Discovery run {} ended abnormally: {}", run.run_id, e);
                None
            }
            Err(_) => {
                tracing::warn!(
                    "Discovery run {} did not stop within {:?}, aborting",
                    run.run_id,
                    self.stop_timeout
                );
                handle.abort();
                let _ = handle.await;
                None
            }
        };

        let patch = match crashed {
            Some(error) => StatePatch::new()
                .status(DiscoveryStatus::Failed)
                .error(error.to_string())
                .completed_at(Utc::now()),
            None => StatePatch::new()
                .status(DiscoveryStatus::Idle)
                .message("Stopped by user"),
        };
        self.store
            .update(patch.progress(ProgressPatch::new().clear_pointer()));
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// State owned by one spawned run
struct Job {
    store: Arc<StateStore>,
    engine: Arc<ProbingEngine>,
    document: FindingsDocument,
    settings: PlanSettings,
    token: CancellationToken,
    run_id: Uuid,
}

impl Job {
    async fn run(self) {
        let work = async {
            if self.settings.plan.probes_devices() {
                self.probe_all().await
            } else {
                self.load_persisted().await
            }
        };
        let outcome = AssertUnwindSafe(work)
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(DiscoveryError::from_panic(panic)));

        match outcome {
            Ok((results, warning)) => {
                tracing::info!(
                    "Discovery run {} completed: {} zones, {} modes",
                    self.run_id,
                    results.total_zones_probed,
                    results.total_modes_detected
                );
                let mut patch = StatePatch::new()
                    .status(DiscoveryStatus::Completed)
                    .results(results)
                    .completed_at(Utc::now())
                    .progress(ProgressPatch::new().clear_pointer());
                if let Some(warning) = warning {
                    patch = patch.error(warning);
                }
                self.store.update(patch);
            }
            Err(DiscoveryError::Cancelled) => {
                tracing::info!("Discovery run {} cancelled", self.run_id);
            }
            Err(e) => {
                tracing::error!("Discovery run {} failed: {}", self.run_id, e);
                self.store.update(
                    StatePatch::new()
                        .status(DiscoveryStatus::Failed)
                        .error(e.to_string())
                        .completed_at(Utc::now())
                        .progress(ProgressPatch::new().clear_pointer()),
                );
            }
        }
    }

    /// Probe every zone of every device, then persist the findings
    async fn probe_all(&self) -> Result<(Results, Option<String>)> {
        let targets = self.enumerate().await?;

        let modes_per_zone = self.settings.modes.len() as u64;
        let zones_total: usize = targets.iter().map(|(_, zones)| zones.len()).sum();
        self.store.update(
            ProgressPatch::new().totals(zones_total, zones_total as u64 * modes_per_zone),
        );
        tracing::info!(
            "Probing {} zones on {} devices",
            zones_total,
            targets.len()
        );

        let mut devices: BTreeMap<DeviceId, DeviceFindings> = BTreeMap::new();
        let mut zones_done = 0;

        for (device, zones) in &targets {
            for zone in zones {
                check_cancelled(&self.token)?;

                let record = ZoneRecord::started(device.id.clone(), zone.id.clone());
                self.store.update(
                    ProgressPatch::new()
                        .current_device(device.id.clone())
                        .current_zone(zone.id.clone())
                        .zone_record(record.clone()),
                );

                let reporter = ProgressReporter::new(&self.store, zones_done as u64 * modes_per_zone);
                match self
                    .engine
                    .probe_zone(zone, &self.settings, &self.token, &reporter)
                    .await
                {
                    Ok(findings) => {
                        zones_done += 1;
                        self.store.update(
                            ProgressPatch::new()
                                .zone_record(record.finish(
                                    ZoneOutcome::Completed,
                                    findings.summary,
                                    None,
                                ))
                                .zones_probed(zones_done)
                                .steps_probed(zones_done as u64 * modes_per_zone),
                        );
                        devices
                            .entry(device.id.clone())
                            .or_default()
                            .zones
                            .push(findings);
                    }
                    Err(e) => {
                        let outcome = match e {
                            DiscoveryError::Cancelled => ZoneOutcome::Stopped,
                            _ => ZoneOutcome::Failed,
                        };
                        self.store.update(ProgressPatch::new().zone_record(record.finish(
                            outcome,
                            reporter.summary(),
                            Some(e.to_string()),
                        )));
                        return Err(e);
                    }
                }
            }
        }

        let mut results = Results::new(devices, None);
        let warning = match self.document.persist(&results).await {
            Ok(path) => {
                results.document_path = Some(path);
                None
            }
            Err(e) => {
                tracing::error!("Failed to save findings: {}", e);
                Some(format!("Findings not saved: {}", e))
            }
        };

        Ok((results, warning))
    }

    async fn enumerate(&self) -> Result<Vec<(DeviceRef, Vec<ZoneRef>)>> {
        let client = self.engine.client();

        let devices = cancellable(&self.token, client.list_devices()).await??;
        if devices.is_empty() {
            return Err(DiscoveryError::NoDevices);
        }

        let mut targets = Vec::with_capacity(devices.len());
        for device in devices {
            let zones = cancellable(&self.token, client.list_zones(&device)).await??;
            tracing::info!("Device {} has {} zones", device.id, zones.len());
            targets.push((device, zones));
        }
        Ok(targets)
    }

    /// Expose the persisted findings without touching any device
    async fn load_persisted(&self) -> Result<(Results, Option<String>)> {
        let devices = self.document.load().await?;
        let results = Results::new(devices, Some(self.document.path().to_path_buf()));

        self.store.update(
            ProgressPatch::new()
                .totals(results.total_zones_probed, 0)
                .zones_probed(results.total_zones_probed),
        );
        tracing::info!(
            "Loaded {} zones from {}",
            results.total_zones_probed,
            self.document.path().display()
        );
        Ok((results, None))
    }
}

/// Turns probe step reports into progress updates
struct ProgressReporter<'a> {
    store: &'a StateStore,

    /// Steps completed before the current zone
    base_steps: u64,
    state: Mutex<(u64, TestSummary)>,
}

impl<'a> ProgressReporter<'a> {
    fn new(store: &'a StateStore, base_steps: u64) -> Self {
        Self {
            store,
            base_steps,
            state: Mutex::new((0, TestSummary::default())),
        }
    }

    fn summary(&self) -> TestSummary {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).1
    }
}

impl ProbeListener for ProgressReporter<'_> {
    fn step_started(&self, step: &ProbeStep) {
        self.store.update(
            ProgressPatch::new()
                .phase(step.phase)
                .detail(step.to_string()),
        );
    }

    fn step_finished(&self, step: &ProbeStep, verified: bool) {
        if step.phase == ProbePhase::Cleanup {
            return;
        }

        let sieve_done = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.1.record(verified);
            if step.phase == ProbePhase::Sieve {
                state.0 += 1;
            }
            state.0
        };

        if step.phase == ProbePhase::Sieve {
            self.store
                .update(ProgressPatch::new().steps_probed(self.base_steps + sieve_done));
        }
    }
}
