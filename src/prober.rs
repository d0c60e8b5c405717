use crate::client::DeviceApiClient;
use crate::error::{DeviceError, DiscoveryError, Result};
use crate::plan::{PlanSettings, ProbeConfig};
use crate::state::{ColorCapability, ColorTest, SupportedMode, ZoneFindings};
use crate::telemetry::{ProbeListener, ProbePhase, ProbeStep};
use crate::types::{Intensity, Rgb, ZoneCommand, ZoneRef, ZoneSnapshot};
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Reference colors of the color-channel probe, in test order
const REFERENCE_COLORS: [(&str, Rgb); 4] = [
    ("red", Rgb::RED),
    ("green", Rgb::GREEN),
    ("blue", Rgb::BLUE),
    ("white", Rgb::WHITE),
];

/// Outcome of one control test
struct Attempt {
    verified: bool,

    /// Last snapshot read back, matching or not
    last: Option<ZoneSnapshot>,
    error: Option<String>,
}

impl Attempt {
    fn rejected(error: &DeviceError) -> Self {
        Self {
            verified: false,
            last: None,
            error: Some(error.to_string()),
        }
    }
}

/// Determines what a zone supports by driving it and reading the result back
///
/// Probing a zone runs three phases:
///
/// 1. **Sieve**: every plan mode is applied once at its canonical intensity.
///    Modes that verify become candidates.
/// 2. **Brightness sweep**: each candidate other than the off mode is applied
///    at the remaining intensity levels.
/// 3. **Color probe**: if the full-color mode is a candidate, reference colors
///    are applied and read back within a per-channel tolerance.
///
/// The zone is returned to its off state afterwards, whatever happened.
pub struct ProbingEngine {
    client: Arc<dyn DeviceApiClient>,
    config: ProbeConfig,
}

impl ProbingEngine {
    pub fn new(client: Arc<dyn DeviceApiClient>, config: ProbeConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn DeviceApiClient> {
        &self.client
    }

    /// Probe one zone with the given plan
    ///
    /// Unsupported combinations are recorded in the findings. Only a fatal
    /// device error, a panicking client or cancellation ends probing early;
    /// in every case the safe-state cleanup still runs before the error is
    /// returned.
    pub async fn probe_zone(
        &self,
        zone: &ZoneRef,
        settings: &PlanSettings,
        token: &CancellationToken,
        listener: &dyn ProbeListener,
    ) -> Result<ZoneFindings> {
        tracing::info!(
            "Probing zone {} with {} plan ({} modes)",
            zone,
            settings.plan,
            settings.modes.len()
        );

        let outcome = AssertUnwindSafe(self.run_phases(zone, settings, token, listener))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(DiscoveryError::from_panic(panic)));
        self.return_to_safe_state(zone, listener).await;

        match &outcome {
            Ok(findings) => tracing::info!(
                "Zone {} supports {} modes ({} of {} tests passed)",
                zone,
                findings.supported_modes.len(),
                findings.summary.successful_tests,
                findings.summary.total_tests
            ),
            Err(DiscoveryError::Cancelled) => tracing::info!("Probing of zone {} cancelled", zone),
            Err(e) => tracing::error!("Probing of zone {} aborted: {}", zone, e),
        }
        outcome
    }

    async fn run_phases(
        &self,
        zone: &ZoneRef,
        settings: &PlanSettings,
        token: &CancellationToken,
        listener: &dyn ProbeListener,
    ) -> Result<ZoneFindings> {
        let mut findings = ZoneFindings::new(zone.id.clone());
        findings.zone_index = Some(zone.index);

        self.sieve(zone, settings, token, listener, &mut findings)
            .await?;
        self.sweep_brightness(zone, settings, token, listener, &mut findings)
            .await?;

        if findings.supports(&self.config.color_mode) {
            let capability = self
                .probe_colors(zone, settings, token, listener, &mut findings)
                .await?;
            findings.color_capability = Some(capability);
        }

        Ok(findings)
    }

    async fn sieve(
        &self,
        zone: &ZoneRef,
        settings: &PlanSettings,
        token: &CancellationToken,
        listener: &dyn ProbeListener,
        findings: &mut ZoneFindings,
    ) -> Result<()> {
        let total = settings.modes.len();

        for (i, mode) in settings.modes.iter().enumerate() {
            check_cancelled(token)?;

            let intensity = self.config.canonical_intensity(mode);
            let command = ZoneCommand::new(mode.clone()).with_intensity(intensity);
            let step = self.step(ProbePhase::Sieve, zone, &command, None, i + 1, total);

            listener.step_started(&step);
            let attempt = self
                .attempt(zone, &command, settings.settle_delay, token, |snapshot| {
                    self.confirms(snapshot, &command)
                })
                .await?;
            findings.summary.record(attempt.verified);
            listener.step_finished(&step, attempt.verified);

            if attempt.verified {
                let mut supported = SupportedMode::new(mode.clone());
                supported.brightness.insert(intensity);
                if *mode == self.config.reference_mode {
                    supported.reference_sample =
                        attempt.last.as_ref().and_then(ZoneSnapshot::channel_sample);
                }
                findings.supported_modes.push(supported);
            } else {
                tracing::debug!(
                    "Mode {} not supported on {}{}",
                    mode,
                    zone,
                    attempt
                        .error
                        .map(|e| format!(": {}", e))
                        .unwrap_or_default()
                );
                findings.unsupported_modes.push(mode.clone());
            }
        }

        Ok(())
    }

    async fn sweep_brightness(
        &self,
        zone: &ZoneRef,
        settings: &PlanSettings,
        token: &CancellationToken,
        listener: &dyn ProbeListener,
        findings: &mut ZoneFindings,
    ) -> Result<()> {
        let levels = self.config.sweep_levels();
        let dimmable: Vec<usize> = findings
            .supported_modes
            .iter()
            .enumerate()
            .filter(|(_, m)| m.mode != self.config.off_mode)
            .map(|(i, _)| i)
            .collect();
        let total = dimmable.len() * levels.len();
        let mut index = 0;

        for candidate in dimmable {
            for &level in &levels {
                check_cancelled(token)?;
                index += 1;

                let mode = findings.supported_modes[candidate].mode.clone();
                let command = ZoneCommand::new(mode).with_intensity(level);
                let step = self.step(
                    ProbePhase::BrightnessSweep,
                    zone,
                    &command,
                    None,
                    index,
                    total,
                );

                listener.step_started(&step);
                let attempt = self
                    .attempt(zone, &command, settings.settle_delay, token, |snapshot| {
                        self.confirms(snapshot, &command)
                    })
                    .await?;
                findings.summary.record(attempt.verified);
                listener.step_finished(&step, attempt.verified);

                let supported = &mut findings.supported_modes[candidate];
                if attempt.verified {
                    supported.brightness.insert(level);
                    if supported.mode == self.config.reference_mode
                        && supported.reference_sample.is_none()
                    {
                        supported.reference_sample =
                            attempt.last.as_ref().and_then(ZoneSnapshot::channel_sample);
                    }
                }
            }
        }

        for supported in &findings.supported_modes {
            tracing::debug!(
                "Mode {} on {} verified at {}%",
                supported.mode,
                zone,
                describe_levels(supported.brightness.iter().copied())
            );
        }

        Ok(())
    }

    async fn probe_colors(
        &self,
        zone: &ZoneRef,
        settings: &PlanSettings,
        token: &CancellationToken,
        listener: &dyn ProbeListener,
        findings: &mut ZoneFindings,
    ) -> Result<ColorCapability> {
        let tolerance = self.config.color_tolerance;
        let mut tested = Vec::with_capacity(REFERENCE_COLORS.len());
        let mut max_channel_value = 0;

        for (i, (name, requested)) in REFERENCE_COLORS.iter().enumerate() {
            check_cancelled(token)?;

            let command = ZoneCommand::new(self.config.color_mode.clone())
                .with_intensity(self.config.full_intensity)
                .with_color(*requested);
            let step = self.step(
                ProbePhase::ColorProbe,
                zone,
                &command,
                Some(*name),
                i + 1,
                REFERENCE_COLORS.len(),
            );

            listener.step_started(&step);
            let attempt = self
                .attempt(zone, &command, settings.settle_delay, token, |snapshot| {
                    snapshot
                        .color
                        .is_some_and(|realized| realized.matches_within(requested, tolerance))
                })
                .await?;
            findings.summary.record(attempt.verified);
            listener.step_finished(&step, attempt.verified);

            let realized = attempt.last.as_ref().and_then(|s| s.color);
            if let Some(realized) = realized {
                max_channel_value = max_channel_value.max(realized.max_channel());
            }
            tested.push(ColorTest {
                name: name.to_string(),
                requested: *requested,
                realized,
                verified: attempt.verified,
                error: attempt.error,
            });
        }

        let verified_colors = tested.iter().filter(|t| t.verified).count();
        let works = verified_colors >= self.config.color_min_verified;
        tracing::info!(
            "Color control on {}: {} ({}/{} reference colors, max channel {})",
            zone,
            if works { "works" } else { "unreliable" },
            verified_colors,
            tested.len(),
            max_channel_value
        );

        Ok(ColorCapability {
            works,
            verified_colors,
            max_channel_value,
            tested,
        })
    }

    /// Apply a command, wait for it to settle and verify the read-back
    ///
    /// Non-fatal device errors, including calls exceeding the command timeout,
    /// yield an unverified attempt. Fatal errors and cancellation are returned
    /// as errors.
    async fn attempt<F>(
        &self,
        zone: &ZoneRef,
        command: &ZoneCommand,
        settle_delay: Duration,
        token: &CancellationToken,
        verify: F,
    ) -> Result<Attempt>
    where
        F: Fn(&ZoneSnapshot) -> bool,
    {
        let limit = self.config.command_timeout();

        tracing::debug!("Applying {} to {}", command, zone);
        let applied = cancellable(token, timeout(limit, self.client.apply_zone_state(zone, command)))
            .await?
            .unwrap_or(Err(DeviceError::Timeout));
        if let Err(e) = applied {
            if e.is_fatal() {
                return Err(e.into());
            }
            tracing::warn!("Control call {} on {} failed: {}", command, zone, e);
            return Ok(Attempt::rejected(&e));
        }

        pause(token, settle_delay).await?;

        let attempts = self.config.verify_attempts.max(1);
        let mut last = None;
        let mut error = None;

        for attempt in 1..=attempts {
            let read = cancellable(token, timeout(limit, self.client.read_zone_state(zone)))
                .await?
                .unwrap_or(Err(DeviceError::Timeout));
            match read {
                Ok(snapshot) => {
                    if verify(&snapshot) {
                        return Ok(Attempt {
                            verified: true,
                            last: Some(snapshot),
                            error: None,
                        });
                    }
                    tracing::debug!(
                        "Read-back of {} after {} does not match (attempt {}/{}): {:?}",
                        zone,
                        command,
                        attempt,
                        attempts,
                        snapshot
                    );
                    last = Some(snapshot);
                }
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    tracing::debug!(
                        "Reading {} failed (attempt {}/{}): {}",
                        zone,
                        attempt,
                        attempts,
                        e
                    );
                    error = Some(e.to_string());
                }
            }

            if attempt < attempts {
                pause(token, self.config.verify_backoff(attempt)).await?;
            }
        }

        Ok(Attempt {
            verified: false,
            last,
            error,
        })
    }

    /// Whether a read-back confirms a mode command
    fn confirms(&self, snapshot: &ZoneSnapshot, command: &ZoneCommand) -> bool {
        if snapshot.mode.as_deref() != Some(command.mode.as_str()) {
            return false;
        }
        match command.intensity {
            Some(intensity) if self.config.brightness_must_match => {
                snapshot.intensity == Some(intensity)
            }
            _ => true,
        }
    }

    /// Turn the zone off, falling back to the alternate off path
    ///
    /// Ignores cancellation. Each path is bounded by the command timeout, so
    /// the whole cleanup takes at most [`ProbeConfig::cleanup_budget`].
    async fn return_to_safe_state(&self, zone: &ZoneRef, listener: &dyn ProbeListener) -> bool {
        let command = ZoneCommand::new(self.config.off_mode.clone())
            .with_intensity(self.config.off_intensity);
        let step = self.step(ProbePhase::Cleanup, zone, &command, None, 1, 1);
        let limit = self.config.command_timeout();

        listener.step_started(&step);
        let primary = match guarded(limit, self.client.apply_zone_state(zone, &command)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(reason) => Err(reason),
        };

        let turned_off = match primary {
            Ok(()) => {
                tracing::debug!("Zone {} turned off", zone);
                true
            }
            Err(reason) => {
                tracing::warn!(
                    "Failed to turn off {} ({}), trying fallback",
                    zone,
                    reason
                );
                self.force_off(zone, limit).await
            }
        };
        listener.step_finished(&step, turned_off);
        turned_off
    }

    async fn force_off(&self, zone: &ZoneRef, limit: Duration) -> bool {
        match guarded(limit, self.client.force_zone_off(zone, &self.config.off_mode)).await {
            Ok(Ok(())) => {
                tracing::info!("Zone {} turned off via fallback", zone);
                true
            }
            Ok(Err(e)) => {
                tracing::error!("Zone {} could not be returned to a safe state: {}", zone, e);
                false
            }
            Err(reason) => {
                tracing::error!(
                    "Zone {} could not be returned to a safe state: fallback {}",
                    zone,
                    reason
                );
                false
            }
        }
    }

    fn step(
        &self,
        phase: ProbePhase,
        zone: &ZoneRef,
        command: &ZoneCommand,
        color: Option<&str>,
        index: usize,
        phase_total: usize,
    ) -> ProbeStep {
        ProbeStep {
            phase,
            zone_id: zone.id.clone(),
            mode: command.mode.clone(),
            intensity: command.intensity,
            color: color.map(str::to_string),
            index,
            phase_total,
        }
    }
}

pub(crate) fn check_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        return Err(DiscoveryError::Cancelled);
    }
    Ok(())
}

pub(crate) async fn cancellable<F: Future>(token: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        _ = token.cancelled() => Err(DiscoveryError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Run a cleanup call under a time limit, containing panics
async fn guarded<F: Future>(limit: Duration, fut: F) -> std::result::Result<F::Output, String> {
    match timeout(limit, AssertUnwindSafe(fut).catch_unwind()).await {
        Ok(Ok(out)) => Ok(out),
        Ok(Err(panic)) => Err(DiscoveryError::from_panic(panic).to_string()),
        Err(_) => Err(format!("timed out after {:?}", limit)),
    }
}

async fn pause(token: &CancellationToken, duration: Duration) -> Result<()> {
    if duration.is_zero() {
        return check_cancelled(token);
    }
    cancellable(token, sleep(duration)).await
}

/// Intensities a supported mode was verified at, for log output
fn describe_levels(levels: impl IntoIterator<Item = Intensity>) -> String {
    levels
        .into_iter()
        .map(|l| l.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::TestPlan;
    use crate::telemetry::NoopListener;
    use crate::testing::{ColorResponse, DeviceCall, SimulatedDevice};
    use std::sync::Mutex;

    fn engine(device: &Arc<SimulatedDevice>, config: ProbeConfig) -> ProbingEngine {
        ProbingEngine::new(device.clone(), config)
    }

    fn quick(config: &ProbeConfig) -> PlanSettings {
        config.settings_for(TestPlan::Quick)
    }

    #[derive(Default)]
    struct StepLog(Mutex<Vec<(ProbePhase, bool)>>);

    impl ProbeListener for StepLog {
        fn step_finished(&self, step: &ProbeStep, verified: bool) {
            self.0.lock().unwrap().push((step.phase, verified));
        }
    }

    #[tokio::test]
    async fn sieve_keeps_plan_order_and_records_unsupported() {
        let device = Arc::new(SimulatedDevice::new().with_zone("spa", 1, &["WHITE", "OFF", "ON"]));
        let config = ProbeConfig::default().without_delays();
        let engine = engine(&device, config.clone());
        let zone = ZoneRef::new("spa", 1);

        let findings = engine
            .probe_zone(&zone, &quick(&config), &CancellationToken::new(), &NoopListener)
            .await
            .unwrap();

        assert_eq!(findings.detected_modes(), vec!["OFF", "ON", "WHITE"]);
        assert_eq!(findings.unsupported_modes, vec!["PURPLE"]);
        assert!(findings.color_capability.is_none());
    }

    #[tokio::test]
    async fn off_mode_records_only_off_intensity() {
        let device = Arc::new(SimulatedDevice::new().with_zone("spa", 1, &["OFF", "ON"]));
        let config = ProbeConfig::default().without_delays();
        let engine = engine(&device, config.clone());

        let findings = engine
            .probe_zone(
                &ZoneRef::new("spa", 1),
                &quick(&config),
                &CancellationToken::new(),
                &NoopListener,
            )
            .await
            .unwrap();

        let off = findings.mode("OFF").unwrap();
        assert_eq!(off.brightness.iter().copied().collect::<Vec<_>>(), vec![0]);
        let on = findings.mode("ON").unwrap();
        assert_eq!(
            describe_levels(on.brightness.iter().copied()),
            "25,50,75,100"
        );
        // 4 sieve tests + 3 sweep levels for ON
        assert_eq!(findings.summary.total_tests, 7);
    }

    #[tokio::test]
    async fn color_probe_counts_colors_within_tolerance() {
        let device = Arc::new(
            SimulatedDevice::new()
                .with_zone("spa", 1, &["OFF", "FULL_DYNAMIC_RGB"])
                .with_color_response("spa", 1, ColorResponse::Clamp(252)),
        );
        let mut config = ProbeConfig::default().without_delays();
        config.full_modes = vec!["OFF".into(), "FULL_DYNAMIC_RGB".into()];
        let engine = engine(&device, config.clone());

        let findings = engine
            .probe_zone(
                &ZoneRef::new("spa", 1),
                &config.settings_for(TestPlan::Full),
                &CancellationToken::new(),
                &NoopListener,
            )
            .await
            .unwrap();

        let capability = findings.color_capability.unwrap();
        assert!(capability.works);
        assert_eq!(capability.verified_colors, 4);
        assert_eq!(capability.max_channel_value, 252);
    }

    #[tokio::test]
    async fn color_probe_fails_when_channels_are_ignored() {
        let device = Arc::new(
            SimulatedDevice::new()
                .with_zone("spa", 1, &["OFF", "FULL_DYNAMIC_RGB"])
                .with_color_response("spa", 1, ColorResponse::Ignore),
        );
        let mut config = ProbeConfig::default().without_delays();
        config.full_modes = vec!["FULL_DYNAMIC_RGB".into()];
        let engine = engine(&device, config.clone());

        let findings = engine
            .probe_zone(
                &ZoneRef::new("spa", 1),
                &config.settings_for(TestPlan::Full),
                &CancellationToken::new(),
                &NoopListener,
            )
            .await
            .unwrap();

        let capability = findings.color_capability.unwrap();
        assert!(!capability.works);
        assert_eq!(capability.verified_colors, 0);
        assert!(capability.tested.iter().all(|t| t.realized.is_none()));
    }

    #[tokio::test]
    async fn transient_read_failures_are_retried() {
        let device = Arc::new(
            SimulatedDevice::new()
                .with_zone("spa", 1, &["OFF", "ON", "PURPLE", "WHITE"])
                .with_failing_reads("spa", 1, 2),
        );
        let config = ProbeConfig::default().without_delays();
        let engine = engine(&device, config.clone());
        let log = StepLog::default();

        let findings = engine
            .probe_zone(
                &ZoneRef::new("spa", 1),
                &quick(&config),
                &CancellationToken::new(),
                &log,
            )
            .await
            .unwrap();

        assert_eq!(findings.detected_modes().len(), 4);
        assert!(findings.unsupported_modes.is_empty());
        let steps = log.0.lock().unwrap();
        assert_eq!(steps.last(), Some(&(ProbePhase::Cleanup, true)));
    }

    #[tokio::test]
    async fn fatal_error_aborts_but_turns_zone_off() {
        let device = Arc::new(
            SimulatedDevice::new()
                .with_zone("spa", 1, &["OFF", "ON", "PURPLE", "WHITE"])
                .with_fatal_apply("spa", 1, "PURPLE"),
        );
        let config = ProbeConfig::default().without_delays();
        let engine = engine(&device, config.clone());
        let zone = ZoneRef::new("spa", 1);

        let err = engine
            .probe_zone(&zone, &quick(&config), &CancellationToken::new(), &NoopListener)
            .await
            .unwrap_err();

        assert!(matches!(err, DiscoveryError::Device(DeviceError::Fatal(_))));
        let calls = device.calls_for(&zone);
        assert!(calls.last().unwrap().is_off_command("OFF"));
    }

    #[tokio::test]
    async fn failed_off_command_uses_fallback() {
        let device = Arc::new(
            SimulatedDevice::new()
                .with_zone("spa", 1, &["ON"])
                .with_failing_off("spa", 1),
        );
        let config = ProbeConfig::default().without_delays();
        let engine = engine(&device, config.clone());
        let zone = ZoneRef::new("spa", 1);

        engine
            .probe_zone(&zone, &quick(&config), &CancellationToken::new(), &NoopListener)
            .await
            .unwrap();

        assert!(matches!(
            device.calls_for(&zone).last(),
            Some(DeviceCall::ForceOff(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_test() {
        let device = Arc::new(SimulatedDevice::new().with_zone("spa", 1, &["OFF", "ON"]));
        let config = ProbeConfig::default().without_delays();
        let engine = engine(&device, config.clone());
        let zone = ZoneRef::new("spa", 1);
        let token = CancellationToken::new();
        token.cancel();

        let err = engine
            .probe_zone(&zone, &quick(&config), &token, &NoopListener)
            .await
            .unwrap_err();

        assert!(matches!(err, DiscoveryError::Cancelled));
        let calls = device.calls_for(&zone);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].is_off_command("OFF"));
    }

    #[tokio::test]
    async fn strict_brightness_rejects_fixed_intensity_zones() {
        let device = Arc::new(
            SimulatedDevice::new()
                .with_zone("spa", 1, &["OFF", "ON"])
                .with_fixed_intensity("spa", 1, 100),
        );
        let mut config = ProbeConfig::default().without_delays();
        config.brightness_must_match = true;
        config.verify_attempts = 1;
        let engine = engine(&device, config.clone());

        let findings = engine
            .probe_zone(
                &ZoneRef::new("spa", 1),
                &quick(&config),
                &CancellationToken::new(),
                &NoopListener,
            )
            .await
            .unwrap();

        let on = findings.mode("ON").unwrap();
        assert_eq!(on.brightness.iter().copied().collect::<Vec<_>>(), vec![100]);
        // OFF at intensity 0 reads back as 100 on this fixture
        assert!(!findings.supports("OFF"));
    }

    #[tokio::test]
    async fn reference_mode_keeps_its_channel_sample() {
        let device = Arc::new(
            SimulatedDevice::new()
                .with_zone("spa", 1, &["OFF", "ON", "WHITE"])
                .with_mode_color("WHITE", Rgb::new(255, 250, 245))
                .with_mode_color("ON", Rgb::new(255, 180, 90)),
        );
        let config = ProbeConfig::default().without_delays();
        let engine = engine(&device, config.clone());

        let findings = engine
            .probe_zone(
                &ZoneRef::new("spa", 1),
                &quick(&config),
                &CancellationToken::new(),
                &NoopListener,
            )
            .await
            .unwrap();

        let sample = findings.mode("WHITE").unwrap().reference_sample.unwrap();
        assert_eq!((sample.red, sample.green, sample.blue), (255, 250, 245));
        assert_eq!(sample.white, 245);
        assert!(findings.mode("ON").unwrap().reference_sample.is_none());
        assert!(findings.mode("OFF").unwrap().reference_sample.is_none());
    }

    #[tokio::test]
    async fn panicking_client_still_gets_cleanup() {
        let device = Arc::new(
            SimulatedDevice::new()
                .with_zone("spa", 1, &["OFF", "ON", "PURPLE"])
                .with_panicking_apply("spa", 1, "PURPLE"),
        );
        let config = ProbeConfig::default().without_delays();
        let engine = engine(&device, config.clone());
        let zone = ZoneRef::new("spa", 1);
        let log = StepLog::default();

        let err = engine
            .probe_zone(&zone, &quick(&config), &CancellationToken::new(), &log)
            .await
            .unwrap_err();

        assert!(matches!(err, DiscoveryError::Panicked(_)));
        assert!(err.to_string().contains("PURPLE"));
        assert!(device.calls_for(&zone).last().unwrap().is_off_command("OFF"));
        assert_eq!(
            log.0.lock().unwrap().last(),
            Some(&(ProbePhase::Cleanup, true))
        );
    }

    #[tokio::test]
    async fn panicking_off_command_falls_back() {
        let device = Arc::new(
            SimulatedDevice::new()
                .with_zone("spa", 1, &["OFF", "ON"])
                .with_panicking_apply("spa", 1, "OFF"),
        );
        let config = ProbeConfig::default().without_delays();
        let engine = engine(&device, config.clone());
        let zone = ZoneRef::new("spa", 1);

        let err = engine
            .probe_zone(&zone, &quick(&config), &CancellationToken::new(), &NoopListener)
            .await
            .unwrap_err();

        assert!(matches!(err, DiscoveryError::Panicked(_)));
        assert!(matches!(
            device.calls_for(&zone).last(),
            Some(DeviceCall::ForceOff(_))
        ));
        assert_eq!(device.snapshot(&zone).unwrap().mode.as_deref(), Some("OFF"));
    }

    #[tokio::test]
    async fn stalled_off_command_falls_back_after_timeout() {
        let device = Arc::new(
            SimulatedDevice::new()
                .with_zone("spa", 1, &["ON"])
                .with_stalled_off("spa", 1),
        );
        let mut config = ProbeConfig::default().without_delays();
        config.command_timeout_ms = 20;
        let engine = engine(&device, config.clone());
        let zone = ZoneRef::new("spa", 1);

        engine
            .probe_zone(&zone, &quick(&config), &CancellationToken::new(), &NoopListener)
            .await
            .unwrap();

        assert!(matches!(
            device.calls_for(&zone).last(),
            Some(DeviceCall::ForceOff(_))
        ));
        assert_eq!(device.snapshot(&zone).unwrap().mode.as_deref(), Some("OFF"));
    }
}
