//! In-memory collaborators for tests, demos and dry runs.
//!
//! [`SimulatedDevice`] behaves like a device API whose zones accept a fixed
//! set of modes, and records every call it receives. Failures can be injected
//! per zone. [`MemoryPublisher`] and [`MemoryDocumentStore`] capture what the
//! discovery core publishes and persists.

use crate::client::{DeviceApiClient, DeviceResult};
use crate::document::DocumentStore;
use crate::error::{DeviceError, DiscoveryError, DocumentError, Result};
use crate::publisher::MessagePublisher;
use crate::types::{DeviceId, DeviceRef, Intensity, ModeName, Rgb, ZoneCommand, ZoneRef, ZoneSnapshot};
use async_trait::async_trait;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// How a simulated zone realizes requested color channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ColorResponse {
    /// Channels read back exactly as requested
    #[default]
    Exact,

    /// Each channel is capped at the given value
    Clamp(u8),

    /// Channels are never reported
    Ignore,
}

impl ColorResponse {
    fn realize(&self, requested: Rgb) -> Option<Rgb> {
        match self {
            ColorResponse::Exact => Some(requested),
            ColorResponse::Clamp(max) => Some(Rgb::new(
                requested.red.min(*max),
                requested.green.min(*max),
                requested.blue.min(*max),
            )),
            ColorResponse::Ignore => None,
        }
    }
}

/// A call received by a [`SimulatedDevice`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Apply(ZoneRef, ZoneCommand),
    Read(ZoneRef),
    ForceOff(ZoneRef),
}

impl DeviceCall {
    pub fn zone(&self) -> &ZoneRef {
        match self {
            DeviceCall::Apply(zone, _) | DeviceCall::Read(zone) | DeviceCall::ForceOff(zone) => zone,
        }
    }

    /// Whether this call turns the zone off
    pub fn is_off_command(&self, off_mode: &str) -> bool {
        match self {
            DeviceCall::Apply(_, command) => command.mode == off_mode,
            DeviceCall::ForceOff(_) => true,
            DeviceCall::Read(_) => false,
        }
    }
}

/// Holds a zone's first control call until released
#[derive(Clone)]
pub struct ZoneGate {
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

impl ZoneGate {
    fn new() -> Self {
        Self {
            reached: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }

    /// Wait until the gated call arrives
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    /// Let the gated call proceed
    pub fn release(&self) {
        self.release.notify_one();
    }
}

struct SimZone {
    zone: ZoneRef,
    modes: Vec<ModeName>,
    color: ColorResponse,
    fixed_intensity: Option<Intensity>,
    current: ZoneSnapshot,
    failing_reads: u32,
    fatal_apply: Option<ModeName>,
    failing_off: bool,
    hanging_off: bool,
    stalled_off: bool,
    panic_apply: Option<ModeName>,
    gate: Option<ZoneGate>,
}

/// What an apply call does before it touches the zone
struct ApplyScript {
    gate: Option<ZoneGate>,
    hang: bool,
    panic: bool,
}

struct SimState {
    devices: Vec<DeviceRef>,
    zones: Vec<SimZone>,
    calls: Vec<DeviceCall>,
    list_error: Option<DeviceError>,
}

impl SimState {
    fn zone_mut(&mut self, zone: &ZoneRef) -> DeviceResult<&mut SimZone> {
        self.zones
            .iter_mut()
            .find(|z| z.zone.device_id == zone.device_id && z.zone.id == zone.id)
            .ok_or_else(|| DeviceError::ZoneNotFound(zone.id.clone()))
    }
}

/// Device API double with scripted zones
///
/// ```
/// use zone_discovery::testing::SimulatedDevice;
///
/// let device = SimulatedDevice::new()
///     .with_zone("spa-1", 1, &["OFF", "ON", "WHITE"])
///     .with_zone("spa-1", 2, &["OFF", "PURPLE"])
///     .with_failing_reads("spa-1", 2, 1);
/// assert!(device.calls().is_empty());
/// ```
pub struct SimulatedDevice {
    state: Mutex<SimState>,
    off_mode: ModeName,
    mode_colors: BTreeMap<ModeName, Rgb>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                devices: Vec::new(),
                zones: Vec::new(),
                calls: Vec::new(),
                list_error: None,
            }),
            off_mode: "OFF".to_string(),
            mode_colors: BTreeMap::new(),
        }
    }

    /// Add a zone accepting the given modes; the device is created on first use
    pub fn with_zone(self, device_id: impl Into<DeviceId>, index: u32, modes: &[&str]) -> Self {
        let device_id = device_id.into();
        {
            let mut state = self.lock();
            if !state.devices.iter().any(|d| d.id == device_id) {
                state.devices.push(DeviceRef::new(device_id.clone()));
            }
            state.zones.push(SimZone {
                zone: ZoneRef::new(device_id, index),
                modes: modes.iter().map(|m| m.to_string()).collect(),
                color: ColorResponse::default(),
                fixed_intensity: None,
                current: ZoneSnapshot::default(),
                failing_reads: 0,
                fatal_apply: None,
                failing_off: false,
                hanging_off: false,
                stalled_off: false,
                panic_apply: None,
                gate: None,
            });
        }
        self
    }

    /// Color channels reported for a mode applied without explicit channels
    pub fn with_mode_color(mut self, mode: impl Into<ModeName>, color: Rgb) -> Self {
        self.mode_colors.insert(mode.into(), color);
        self
    }

    pub fn with_color_response(self, device_id: &str, index: u32, response: ColorResponse) -> Self {
        self.configure(device_id, index, |zone| zone.color = response)
    }

    /// The zone ignores requested intensities and always reports this one
    pub fn with_fixed_intensity(self, device_id: &str, index: u32, intensity: Intensity) -> Self {
        self.configure(device_id, index, |zone| zone.fixed_intensity = Some(intensity))
    }

    /// The next `count` reads of the zone fail with a transport error
    pub fn with_failing_reads(self, device_id: &str, index: u32, count: u32) -> Self {
        self.configure(device_id, index, |zone| zone.failing_reads = count)
    }

    /// Applying `mode` to the zone fails fatally
    pub fn with_fatal_apply(self, device_id: &str, index: u32, mode: &str) -> Self {
        let mode = mode.to_string();
        self.configure(device_id, index, move |zone| zone.fatal_apply = Some(mode))
    }

    /// Regular off commands to the zone fail; the fallback path works
    pub fn with_failing_off(self, device_id: &str, index: u32) -> Self {
        self.configure(device_id, index, |zone| zone.failing_off = true)
    }

    /// Off commands to the zone, including the fallback, never complete
    pub fn with_hanging_off(self, device_id: &str, index: u32) -> Self {
        self.configure(device_id, index, |zone| zone.hanging_off = true)
    }

    /// Regular off commands to the zone never complete; the fallback path works
    pub fn with_stalled_off(self, device_id: &str, index: u32) -> Self {
        self.configure(device_id, index, |zone| zone.stalled_off = true)
    }

    /// Applying `mode` to the zone panics inside the client
    pub fn with_panicking_apply(self, device_id: &str, index: u32, mode: &str) -> Self {
        let mode = mode.to_string();
        self.configure(device_id, index, move |zone| zone.panic_apply = Some(mode))
    }

    /// Device enumeration fails with the given error
    pub fn with_listing_error(self, error: DeviceError) -> Self {
        self.lock().list_error = Some(error);
        self
    }

    /// Hold the zone's next control call until the returned gate is released
    pub fn gate_next_apply(&self, device_id: &str, index: u32) -> ZoneGate {
        let gate = ZoneGate::new();
        let mut state = self.lock();
        if let Some(zone) = state
            .zones
            .iter_mut()
            .find(|z| z.zone.device_id == device_id && z.zone.index == index)
        {
            zone.gate = Some(gate.clone());
        }
        gate
    }

    /// Every call received so far, in order
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, zone: &ZoneRef) -> Vec<DeviceCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.zone() == zone)
            .cloned()
            .collect()
    }

    /// Current reported state of a zone
    pub fn snapshot(&self, zone: &ZoneRef) -> Option<ZoneSnapshot> {
        self.lock()
            .zone_mut(zone)
            .ok()
            .map(|z| z.current.clone())
    }

    fn configure(self, device_id: &str, index: u32, f: impl FnOnce(&mut SimZone)) -> Self {
        {
            let mut state = self.lock();
            match state
                .zones
                .iter_mut()
                .find(|z| z.zone.device_id == device_id && z.zone.index == index)
            {
                Some(zone) => f(zone),
                None => tracing::warn!("No simulated zone {}/zone_{}", device_id, index),
            }
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_off(&self, command: &ZoneCommand) -> bool {
        command.mode == self.off_mode
    }

    /// Record the call and take the zone's gate, if armed
    fn begin_apply(&self, zone: &ZoneRef, command: &ZoneCommand) -> DeviceResult<ApplyScript> {
        let mut state = self.lock();
        state
            .calls
            .push(DeviceCall::Apply(zone.clone(), command.clone()));
        let is_off = self.is_off(command);
        let sim = state.zone_mut(zone)?;
        Ok(ApplyScript {
            gate: sim.gate.take(),
            hang: is_off && (sim.hanging_off || sim.stalled_off),
            panic: sim.panic_apply.as_deref() == Some(command.mode.as_str()),
        })
    }

    fn finish_apply(&self, zone: &ZoneRef, command: &ZoneCommand) -> DeviceResult<()> {
        let is_off = self.is_off(command);
        let mut state = self.lock();
        let sim = state.zone_mut(zone)?;

        if sim.fatal_apply.as_deref() == Some(command.mode.as_str()) {
            return Err(DeviceError::Fatal("session revoked".into()));
        }
        if is_off && sim.failing_off {
            return Err(DeviceError::Transport("connection reset".into()));
        }
        if !sim.modes.contains(&command.mode) {
            return Err(DeviceError::Rejected(format!(
                "mode {} not supported",
                command.mode
            )));
        }

        sim.current.mode = Some(command.mode.clone());
        sim.current.intensity = sim
            .fixed_intensity
            .or(command.intensity)
            .or(sim.current.intensity);
        sim.current.color = match command.color {
            Some(requested) => sim.color.realize(requested),
            None => self.mode_colors.get(&command.mode).copied(),
        };
        sim.current.white = sim.current.color.map(|c| c.red.min(c.green).min(c.blue));
        Ok(())
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceApiClient for SimulatedDevice {
    async fn list_devices(&self) -> DeviceResult<Vec<DeviceRef>> {
        let state = self.lock();
        match &state.list_error {
            Some(e) => Err(e.clone()),
            None => Ok(state.devices.clone()),
        }
    }

    async fn list_zones(&self, device: &DeviceRef) -> DeviceResult<Vec<ZoneRef>> {
        Ok(self
            .lock()
            .zones
            .iter()
            .filter(|z| z.zone.device_id == device.id)
            .map(|z| z.zone.clone())
            .collect())
    }

    async fn apply_zone_state(&self, zone: &ZoneRef, command: &ZoneCommand) -> DeviceResult<()> {
        let script = self.begin_apply(zone, command)?;
        if let Some(gate) = script.gate {
            gate.reached.notify_one();
            gate.release.notified().await;
        }
        if script.panic {
            panic!("simulated client crashed applying {} to {}", command, zone);
        }
        if script.hang {
            std::future::pending::<()>().await;
        }
        self.finish_apply(zone, command)
    }

    async fn read_zone_state(&self, zone: &ZoneRef) -> DeviceResult<ZoneSnapshot> {
        let mut state = self.lock();
        state.calls.push(DeviceCall::Read(zone.clone()));
        let sim = state.zone_mut(zone)?;
        if sim.failing_reads > 0 {
            sim.failing_reads -= 1;
            return Err(DeviceError::Transport("read timed out".into()));
        }
        Ok(sim.current.clone())
    }

    async fn force_zone_off(&self, zone: &ZoneRef, off_mode: &str) -> DeviceResult<()> {
        let hang = {
            let mut state = self.lock();
            state.calls.push(DeviceCall::ForceOff(zone.clone()));
            state.zone_mut(zone)?.hanging_off
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.lock();
        let sim = state.zone_mut(zone)?;
        sim.current.mode = Some(off_mode.to_string());
        sim.current.color = None;
        sim.current.white = None;
        Ok(())
    }
}

/// A message captured by [`MemoryPublisher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub destination: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl PublishedMessage {
    /// Payload parsed as JSON; `Null` if it is not JSON
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or_default()
    }
}

/// [`MessagePublisher`] that keeps every message in memory
#[derive(Default)]
pub struct MemoryPublisher {
    messages: Mutex<Vec<PublishedMessage>>,
    failing: Mutex<bool>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later publish fail
    pub fn fail_publishes(&self) {
        *self.failing.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn messages_to(&self, destination: &str) -> Vec<PublishedMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.destination == destination)
            .collect()
    }

    /// Last retained message on a destination
    pub fn retained(&self, destination: &str) -> Option<PublishedMessage> {
        self.messages_to(destination)
            .into_iter()
            .filter(|m| m.retain)
            .last()
    }
}

#[async_trait]
impl MessagePublisher for MemoryPublisher {
    async fn publish(&self, destination: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        if *self.failing.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(DiscoveryError::Publish(format!("{} unreachable", destination)));
        }
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PublishedMessage {
                destination: destination.to_string(),
                payload,
                retain,
            });
        Ok(())
    }
}

/// [`DocumentStore`] keeping documents as YAML text in memory
#[derive(Default)]
pub struct MemoryDocumentStore {
    files: Mutex<BTreeMap<PathBuf, String>>,
    writes: Mutex<usize>,
    failing_writes: Mutex<bool>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document with raw text
    pub fn with_text(self, path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), text.into());
        self
    }

    /// Raw text of a document
    pub fn text(&self, path: impl AsRef<Path>) -> Option<String> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path.as_ref())
            .cloned()
    }

    /// Number of successful writes
    pub fn writes(&self) -> usize {
        *self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every later write fail
    pub fn fail_writes(&self) {
        *self
            .failing_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn read_document(&self, path: &Path) -> std::result::Result<Option<Value>, DocumentError> {
        let Some(text) = self.text(path) else {
            return Ok(None);
        };
        match serde_yaml::from_str::<Value>(&text)? {
            Value::Null => Ok(None),
            value => Ok(Some(value)),
        }
    }

    async fn write_document(&self, path: &Path, document: &Value) -> std::result::Result<(), DocumentError> {
        if *self
            .failing_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Err(DocumentError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only file system",
            )));
        }
        let text = serde_yaml::to_string(document)?;
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), text);
        *self.writes.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }
}
