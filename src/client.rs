use crate::error::DeviceError;
use crate::types::{DeviceRef, ZoneCommand, ZoneRef, ZoneSnapshot};
use async_trait::async_trait;

/// Result type for device API calls
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Remote API through which devices and their zones are enumerated and controlled
///
/// The discovery core never talks to hardware directly; a front end supplies an
/// implementation of this trait (a cloud REST client, a local bridge, or the
/// [`SimulatedDevice`](crate::testing::SimulatedDevice) used in tests).
///
/// Errors are classified by [`DeviceError`]: anything but
/// [`DeviceError::Fatal`] only marks the combination under test unsupported.
///
/// # Example
///
/// ```no_run
/// use async_trait::async_trait;
/// use zone_discovery::{
///     DeviceApiClient, DeviceError, DeviceRef, ZoneCommand, ZoneRef, ZoneSnapshot,
/// };
///
/// struct Bridge;
///
/// #[async_trait]
/// impl DeviceApiClient for Bridge {
///     async fn list_devices(&self) -> Result<Vec<DeviceRef>, DeviceError> {
///         Ok(vec![DeviceRef::new("spa-1")])
///     }
///
///     async fn list_zones(&self, device: &DeviceRef) -> Result<Vec<ZoneRef>, DeviceError> {
///         Ok(vec![ZoneRef::new(device.id.clone(), 1)])
///     }
///
///     async fn apply_zone_state(&self, _zone: &ZoneRef, _command: &ZoneCommand) -> Result<(), DeviceError> {
///         Ok(())
///     }
///
///     async fn read_zone_state(&self, _zone: &ZoneRef) -> Result<ZoneSnapshot, DeviceError> {
///         Ok(ZoneSnapshot::default())
///     }
/// }
/// ```
#[async_trait]
pub trait DeviceApiClient: Send + Sync {
    /// Enumerate the devices of the account
    async fn list_devices(&self) -> DeviceResult<Vec<DeviceRef>>;

    /// Enumerate the controllable zones of a device
    async fn list_zones(&self, device: &DeviceRef) -> DeviceResult<Vec<ZoneRef>>;

    /// Issue a control call to one zone
    async fn apply_zone_state(&self, zone: &ZoneRef, command: &ZoneCommand) -> DeviceResult<()>;

    /// Read one zone's current state back
    async fn read_zone_state(&self, zone: &ZoneRef) -> DeviceResult<ZoneSnapshot>;

    /// Fallback turn-off path, used when the regular off command fails
    ///
    /// The default re-issues the off mode without an intensity. Implementations
    /// with a dedicated endpoint (e.g. a mode-only setter) should override it.
    async fn force_zone_off(&self, zone: &ZoneRef, off_mode: &str) -> DeviceResult<()> {
        self.apply_zone_state(zone, &ZoneCommand::new(off_mode)).await
    }
}
