//! Normalized records produced by the parsers and stored in registries.
use crate::registry::Keyed;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Independent areas of control. Actions in different domains may run concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Domain {
    #[allow(missing_docs)]
    Wifi,
    #[allow(missing_docs)]
    Bluetooth,
    #[allow(missing_docs)]
    Audio,
    #[allow(missing_docs)]
    Brightness,
    #[allow(missing_docs)]
    Battery,
    /// CPU governor and colour temperature
    Power,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Domain::Wifi => "wifi",
            Domain::Bluetooth => "bluetooth",
            Domain::Audio => "audio",
            Domain::Brightness => "brightness",
            Domain::Battery => "battery",
            Domain::Power => "power",
        };
        f.write_str(name)
    }
}

/// Wifi security, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Security {
    #[allow(missing_docs)]
    Open,
    #[allow(missing_docs)]
    Wep,
    #[allow(missing_docs)]
    Wpa,
    #[allow(missing_docs)]
    Wpa2,
    #[allow(missing_docs)]
    Wpa3,
}

impl Security {
    /// Anything but an open network needs a password.
    pub fn is_secured(self) -> bool {
        self != Security::Open
    }
}

impl fmt::Display for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Security::Open => "Open",
            Security::Wep => "WEP",
            Security::Wpa => "WPA",
            Security::Wpa2 => "WPA2",
            Security::Wpa3 => "WPA3",
        };
        f.write_str(name)
    }
}

/// A visible wifi network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkRecord {
    /// Network name, empty for hidden networks.
    pub ssid: String,
    /// Access point hardware address (empty when unknown).
    pub bssid: String,
    #[allow(missing_docs)]
    pub is_connected: bool,
    #[allow(missing_docs)]
    pub security: Security,
    /// 0 when absent from the tool output.
    pub signal_percent: u8,
}

/// SSID is a best effort identity: several access points may share it.
impl Keyed for NetworkRecord {
    type Key = String;
    fn key(&self) -> String {
        self.ssid.clone()
    }
}

/// A connection profile saved by NetworkManager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedProfile {
    /// Profile name (the SSID for profiles we create).
    pub name: String,
    /// NetworkManager connection type (`802-11-wireless`, `ethernet`, ...).
    pub kind: String,
}

impl SavedProfile {
    /// `true` for wifi profiles.
    pub fn is_wifi(&self) -> bool {
        self.kind == "802-11-wireless" || self.kind.eq_ignore_ascii_case("wifi")
    }
}

impl Keyed for SavedProfile {
    type Key = String;
    fn key(&self) -> String {
        self.name.clone()
    }
}

/// Kind of bluetooth device, guessed from its icon name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum DeviceClass {
    #[allow(missing_docs)]
    Phone,
    #[allow(missing_docs)]
    Computer,
    #[allow(missing_docs)]
    Audio,
    /// Mouse, keyboard, gamepad...
    Input,
    #[default]
    #[allow(missing_docs)]
    Unknown,
}

/// A bluetooth device known to the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BluetoothDeviceRecord {
    #[allow(missing_docs)]
    pub mac_address: String,
    /// Advertised name, the address when there is none.
    pub name: String,
    #[allow(missing_docs)]
    pub is_paired: bool,
    #[allow(missing_docs)]
    pub is_connected: bool,
    #[allow(missing_docs)]
    pub device_class: DeviceClass,
}

impl Keyed for BluetoothDeviceRecord {
    type Key = String;
    fn key(&self) -> String {
        self.mac_address.clone()
    }
}

/// An audio sink (output) or source (input).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioDeviceRecord {
    /// PulseAudio name, usable as argument to `pactl`.
    pub id: String,
    /// Human readable name (falls back to `id`).
    pub display_name: String,
    #[allow(missing_docs)]
    pub volume_percent: u8,
    #[allow(missing_docs)]
    pub muted: bool,
    /// Current default device of its kind.
    pub is_default: bool,
}

/// Speaker side.
pub type AudioSinkRecord = AudioDeviceRecord;
/// Microphone side.
pub type AudioSourceRecord = AudioDeviceRecord;

impl Keyed for AudioDeviceRecord {
    type Key = String;
    fn key(&self) -> String {
        self.id.clone()
    }
}

/// One application playing audio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplicationStreamRecord {
    /// Sink input index, reassigned by the sound server between refreshes.
    pub stream_id: String,
    #[allow(missing_docs)]
    pub app_name: String,
    #[allow(missing_docs)]
    pub media_name: String,
    #[allow(missing_docs)]
    pub volume_percent: u8,
}

/// `stream_id` is not stable, so streams are identified by what they play.
impl Keyed for ApplicationStreamRecord {
    type Key = (String, String);
    fn key(&self) -> (String, String) {
        (self.app_name.clone(), self.media_name.clone())
    }
}

/// Charging state as reported by upower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum BatteryState {
    #[allow(missing_docs)]
    Charging,
    #[allow(missing_docs)]
    Discharging,
    #[allow(missing_docs)]
    Full,
    #[default]
    #[allow(missing_docs)]
    Unknown,
}

/// Metrics of one battery. Missing numeric values are 0, missing text is `"Unknown"`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryRecord {
    /// Last segment of the upower object path (`battery_BAT0`).
    pub device_name: String,
    #[allow(missing_docs)]
    pub charge_percent: u8,
    #[allow(missing_docs)]
    pub state: BatteryState,
    /// As printed by upower (`"2.5 hours"`), `None` when neither charging nor discharging.
    pub time_remaining: Option<String>,
    /// Health: full capacity relative to design capacity.
    pub capacity_percent: f32,
    /// Current energy rate.
    pub power_watts: f32,
    #[allow(missing_docs)]
    pub voltage: f32,
    #[allow(missing_docs)]
    pub model: String,
}

impl Keyed for BatteryRecord {
    type Key = String;
    fn key(&self) -> String {
        self.device_name.clone()
    }
}

/// CPU frequency governor presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerMode {
    #[allow(missing_docs)]
    Performance,
    #[allow(missing_docs)]
    Balanced,
    #[allow(missing_docs)]
    PowerSaver,
}

impl PowerMode {
    /// Governor name given to `cpupower frequency-set -g`.
    pub fn governor(self) -> &'static str {
        match self {
            PowerMode::Performance => "performance",
            PowerMode::Balanced => "schedutil",
            PowerMode::PowerSaver => "powersave",
        }
    }

    /// Inverse of [`PowerMode::governor`].
    pub fn from_governor(governor: &str) -> Option<Self> {
        match governor.trim() {
            "performance" => Some(PowerMode::Performance),
            "schedutil" | "ondemand" => Some(PowerMode::Balanced),
            "powersave" => Some(PowerMode::PowerSaver),
            _ => None,
        }
    }
}

impl std::str::FromStr for PowerMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "performance" => Ok(PowerMode::Performance),
            "balanced" => Ok(PowerMode::Balanced),
            "power-saver" | "powersaver" | "power-saving" => Ok(PowerMode::PowerSaver),
            other => PowerMode::from_governor(other)
                .ok_or_else(|| anyhow::anyhow!("Unknown power mode '{}'", s)),
        }
    }
}

impl fmt::Display for PowerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PowerMode::Performance => "Performance",
            PowerMode::Balanced => "Balanced",
            PowerMode::PowerSaver => "Power Saving",
        };
        f.write_str(name)
    }
}
