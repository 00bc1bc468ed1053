//! Wifi control through NetworkManager's `nmcli`.
pub mod parse;

use crate::command::{CommandRunner, ExternalCommand};
use crate::model::{Domain, NetworkRecord, SavedProfile};
use crate::scan::{run_checked, ScanError, Scanner};
use anyhow::{Context, Result};
use derivative::Derivative;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Program driving this domain.
pub const NMCLI: &str = "nmcli";

/// `nmcli -f IN-USE,...,SECURITY dev wifi list`
pub fn list_command() -> ExternalCommand {
    ExternalCommand::new(NMCLI).args(["-f", parse::LIST_FIELDS, "dev", "wifi", "list"])
}

/// `nmcli -t -f NAME,TYPE connection show [--active]`
pub fn profiles_command(active_only: bool) -> ExternalCommand {
    let cmd = ExternalCommand::new(NMCLI).args(["-t", "-f", "NAME,TYPE", "connection", "show"]);
    if active_only {
        cmd.arg("--active")
    } else {
        cmd
    }
}

/// `nmcli radio wifi`
pub fn radio_command() -> ExternalCommand {
    ExternalCommand::new(NMCLI).args(["radio", "wifi"])
}

/// `nmcli -t -f DEVICE,TYPE device`
pub fn devices_command() -> ExternalCommand {
    ExternalCommand::new(NMCLI).args(["-t", "-f", "DEVICE,TYPE", "device"])
}

/// nmcli truncates long SSIDs in tabular mode.
fn is_truncated(ssid: &str) -> bool {
    ssid.is_empty() || ssid.ends_with('…')
}

/// Lists visible networks.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct WifiScanner {
    #[derivative(Debug = "ignore")]
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl WifiScanner {
    /// Create a scanner spawning nmcli through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }
}

impl Scanner for WifiScanner {
    type Record = NetworkRecord;

    fn domain(&self) -> Domain {
        Domain::Wifi
    }

    fn scan(&self) -> Result<Vec<NetworkRecord>, ScanError> {
        let out = run_checked(&*self.runner, &list_command().timeout(self.timeout))?;
        let mut networks = parse::parse_networks(&out.stdout);
        // The connected row may show a truncated or hidden SSID: use the
        // active profile name instead, as NetworkManager names new profiles
        // after their SSID.
        if let Some(connected) = networks
            .iter_mut()
            .find(|n| n.is_connected && is_truncated(&n.ssid))
        {
            match run_checked(&*self.runner, &profiles_command(true)) {
                Ok(res) => {
                    if let Some(name) = parse::parse_active_wifi(&res.stdout) {
                        debug!("Using active profile name {:?} for connected network", name);
                        connected.ssid = name;
                    }
                }
                Err(e) => debug!("Unable to get active profile: {}", e),
            }
        }
        Ok(parse::dedupe_networks(networks))
    }
}

/// Lists saved NetworkManager profiles.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ProfileScanner {
    #[derivative(Debug = "ignore")]
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl ProfileScanner {
    /// Create a scanner spawning nmcli through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }
}

impl Scanner for ProfileScanner {
    type Record = SavedProfile;

    fn domain(&self) -> Domain {
        Domain::Wifi
    }

    fn scan(&self) -> Result<Vec<SavedProfile>, ScanError> {
        let out = run_checked(&*self.runner, &profiles_command(false).timeout(self.timeout))?;
        Ok(parse::parse_profiles(&out.stdout))
    }
}

/// Is the wifi radio switched on?
pub fn is_radio_enabled(runner: &dyn CommandRunner) -> Result<bool, ScanError> {
    let out = run_checked(runner, &radio_command())?;
    Ok(parse::parse_radio(&out.stdout))
}

/// Name of the first wifi interface, if any.
pub fn wifi_device(runner: &dyn CommandRunner) -> Result<Option<String>, ScanError> {
    let out = run_checked(runner, &devices_command())?;
    Ok(parse::parse_wifi_device(&out.stdout))
}

/// Byte counters of a network interface at one point in time.
#[derive(Debug, Clone, Copy)]
pub struct TrafficSample {
    rx_bytes: u64,
    tx_bytes: u64,
    at: Instant,
}

/// Transfer rate in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrafficRate {
    #[allow(missing_docs)]
    pub rx_per_sec: f64,
    #[allow(missing_docs)]
    pub tx_per_sec: f64,
}

impl TrafficSample {
    /// Read counters of `interface` from sysfs.
    pub fn read(interface: &str) -> Result<Self> {
        Self::read_from(&PathBuf::from("/sys/class/net").join(interface).join("statistics"))
    }

    fn read_from(statistics: &Path) -> Result<Self> {
        let read = |name: &str| -> Result<u64> {
            let path = statistics.join(name);
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Reading {:?}", path))?;
            parse::parse_counter(&content).with_context(|| format!("Parsing {:?}", path))
        };
        Ok(Self {
            rx_bytes: read("rx_bytes")?,
            tx_bytes: read("tx_bytes")?,
            at: Instant::now(),
        })
    }

    /// Rate between `earlier` and `self`. Counter resets count as 0.
    pub fn rate_since(&self, earlier: &TrafficSample) -> TrafficRate {
        let secs = self.at.duration_since(earlier.at).as_secs_f64();
        if secs <= 0.0 {
            return TrafficRate {
                rx_per_sec: 0.0,
                tx_per_sec: 0.0,
            };
        }
        TrafficRate {
            rx_per_sec: self.rx_bytes.saturating_sub(earlier.rx_bytes) as f64 / secs,
            tx_per_sec: self.tx_bytes.saturating_sub(earlier.tx_bytes) as f64 / secs,
        }
    }
}

/// Human readable rate (`1.5 MB/s`).
pub fn format_rate(bytes_per_sec: f64) -> String {
    if bytes_per_sec < 1024.0 {
        format!("{:.0} B/s", bytes_per_sec)
    } else if bytes_per_sec < 1024.0 * 1024.0 {
        format!("{:.1} KB/s", bytes_per_sec / 1024.0)
    } else {
        format!("{:.1} MB/s", bytes_per_sec / (1024.0 * 1024.0))
    }
}
