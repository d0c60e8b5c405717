use serde::{Deserialize, Serialize};
use std::fmt;

/// Device identifier
pub type DeviceId = String;

/// Zone identifier (e.g. `zone_1`)
pub type ZoneId = String;

/// Mode name as understood by the device API (e.g. `PURPLE`, `OFF`)
pub type ModeName = String;

/// Intensity in percent (0-100)
pub type Intensity = u8;

/// A device as enumerated by the device API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRef {
    pub id: DeviceId,

    #[serde(default)]
    pub name: Option<String>,
}

impl DeviceRef {
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

/// An addressable zone of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneRef {
    pub device_id: DeviceId,
    pub id: ZoneId,

    /// Numeric zone index used by the device API
    pub index: u32,
}

impl ZoneRef {
    /// Create a zone reference with the conventional `zone_<index>` id
    pub fn new(device_id: impl Into<DeviceId>, index: u32) -> Self {
        Self {
            device_id: device_id.into(),
            id: format!("zone_{}", index),
            index,
        }
    }
}

impl fmt::Display for ZoneRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.id)
    }
}

/// Color channels on a 0-255 scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Rgb {
    pub const RED: Rgb = Rgb::new(255, 0, 0);
    pub const GREEN: Rgb = Rgb::new(0, 255, 0);
    pub const BLUE: Rgb = Rgb::new(0, 0, 255);
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);

    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }

    /// True when every channel is within `tolerance` of `other`
    pub fn matches_within(&self, other: &Rgb, tolerance: u8) -> bool {
        self.red.abs_diff(other.red) <= tolerance
            && self.green.abs_diff(other.green) <= tolerance
            && self.blue.abs_diff(other.blue) <= tolerance
    }

    /// Highest channel value
    pub fn max_channel(&self) -> u8 {
        self.red.max(self.green).max(self.blue)
    }
}

/// A zone's state as read back from the device API
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    #[serde(default)]
    pub mode: Option<ModeName>,

    #[serde(default)]
    pub intensity: Option<Intensity>,

    #[serde(default)]
    pub color: Option<Rgb>,

    /// White channel, for fixtures that report one
    #[serde(default)]
    pub white: Option<u8>,
}

/// Channel-level sample captured for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSample {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub white: u8,
}

impl ZoneSnapshot {
    /// Channel sample of this snapshot, if it carries color information
    pub fn channel_sample(&self) -> Option<ChannelSample> {
        let color = self.color?;
        Some(ChannelSample {
            red: color.red,
            green: color.green,
            blue: color.blue,
            white: self.white.unwrap_or(0),
        })
    }
}

/// Control command applied to one zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneCommand {
    pub mode: ModeName,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub intensity: Option<Intensity>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<Rgb>,
}

impl ZoneCommand {
    /// Create a command selecting the given mode
    pub fn new(mode: impl Into<ModeName>) -> Self {
        Self {
            mode: mode.into(),
            intensity: None,
            color: None,
        }
    }

    /// Set the intensity
    pub fn with_intensity(mut self, intensity: Intensity) -> Self {
        self.intensity = Some(intensity);
        self
    }

    /// Set the color channels
    pub fn with_color(mut self, color: Rgb) -> Self {
        self.color = Some(color);
        self
    }
}

impl fmt::Display for ZoneCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mode)?;
        if let Some(intensity) = self.intensity {
            write!(f, " @ {}%", intensity)?;
        }
        if let Some(c) = self.color {
            write!(f, " rgb({},{},{})", c.red, c.green, c.blue)?;
        }
        Ok(())
    }
}
