//! Translate user intents into command sequences.
//!
//! Every [`Action`] becomes one or more [`CommandRunner`] invocations executed
//! strictly in order, stopping at the first failure. Actions changing a
//! connection hold their domain while they run: a second one arriving
//! meanwhile is rejected with [`ActionError::Busy`] instead of interleaving.
use crate::audio::{self, AudioKind, PACTL};
use crate::bluetooth::{self, BLUETOOTHCTL, SYSTEMCTL};
use crate::brightness::{self, BRIGHTNESSCTL};
use crate::command::{CommandError, CommandResult, CommandRunner, ExternalCommand};
use crate::model::{BluetoothDeviceRecord, Domain, PowerMode, SavedProfile};
use crate::power::{self, CPUPOWER, GAMMASTEP, KELVIN_RANGE, PKILL, SUDO};
use crate::registry::DeviceRegistry;
use crate::secret::Secret;
use crate::wifi::{self, NMCLI};
use derivative::Derivative;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Timeout of connection attempts, which routinely outlast other commands.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Something the user wants done.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Activate the saved profile of `ssid`, or create one and activate it.
    ConnectWifi {
        #[allow(missing_docs)]
        ssid: String,
        /// Network advertises WEP/WPA security.
        secured: bool,
        /// Required for a secured network without saved profile.
        password: Option<Secret>,
        /// `false` creates the profile with autoconnect disabled.
        remember: bool,
    },
    /// Deactivate `profile`, or the active wifi connection when `None`.
    DisconnectWifi {
        #[allow(missing_docs)]
        profile: Option<String>,
    },
    /// Delete the saved profile named after `ssid`.
    ForgetWifi {
        #[allow(missing_docs)]
        ssid: String,
    },
    /// Switch the wifi radio on or off.
    SetWifiRadio(bool),
    /// Pair (unless already paired) then connect.
    ConnectBluetooth {
        #[allow(missing_docs)]
        mac: String,
    },
    #[allow(missing_docs)]
    DisconnectBluetooth { mac: String },
    /// Remove the pairing.
    ForgetBluetooth {
        #[allow(missing_docs)]
        mac: String,
    },
    /// Start or stop bluetoothd.
    SetBluetoothService(bool),
    /// Make the adapter pairable, and discoverable for
    /// [`bluetooth::PAIRING_WINDOW`].
    EnablePairingMode,
    /// Set the volume of `device`, or of the default one.
    SetVolume {
        #[allow(missing_docs)]
        kind: AudioKind,
        #[allow(missing_docs)]
        device: Option<String>,
        #[allow(missing_docs)]
        percent: u8,
    },
    /// Mute (`Some(true)`), unmute or toggle (`None`).
    SetMute {
        #[allow(missing_docs)]
        kind: AudioKind,
        #[allow(missing_docs)]
        device: Option<String>,
        #[allow(missing_docs)]
        mute: Option<bool>,
    },
    #[allow(missing_docs)]
    SetDefaultDevice { kind: AudioKind, name: String },
    /// Make the sink following the current default the new default.
    CycleSink,
    /// Volume of the application stream identified by what it plays.
    SetStreamVolume {
        #[allow(missing_docs)]
        app_name: String,
        #[allow(missing_docs)]
        media_name: String,
        #[allow(missing_docs)]
        percent: u8,
    },
    #[allow(missing_docs)]
    SetBrightness(u8),
    /// Change the CPU governor; `password` is the sudo password.
    SetPowerMode {
        #[allow(missing_docs)]
        mode: PowerMode,
        #[allow(missing_docs)]
        password: Secret,
    },
    /// Screen colour temperature in Kelvin.
    SetColorTemperature(u32),
}

impl Action {
    /// Domain affected.
    pub fn domain(&self) -> Domain {
        use Action::*;
        match self {
            ConnectWifi { .. } | DisconnectWifi { .. } | ForgetWifi { .. } | SetWifiRadio(_) => {
                Domain::Wifi
            }
            ConnectBluetooth { .. }
            | DisconnectBluetooth { .. }
            | ForgetBluetooth { .. }
            | SetBluetoothService(_)
            | EnablePairingMode => Domain::Bluetooth,
            SetVolume { .. }
            | SetMute { .. }
            | SetDefaultDevice { .. }
            | CycleSink
            | SetStreamVolume { .. } => Domain::Audio,
            SetBrightness(_) => Domain::Brightness,
            SetPowerMode { .. } | SetColorTemperature(_) => Domain::Power,
        }
    }

    /// Tools needed, the main one first.
    pub fn programs(&self) -> &'static [&'static str] {
        use Action::*;
        match self {
            ConnectWifi { .. } | DisconnectWifi { .. } | ForgetWifi { .. } | SetWifiRadio(_) => {
                &[NMCLI]
            }
            SetBluetoothService(_) => &[SYSTEMCTL],
            ConnectBluetooth { .. } | DisconnectBluetooth { .. } | ForgetBluetooth { .. } => {
                &[BLUETOOTHCTL]
            }
            EnablePairingMode => &[BLUETOOTHCTL, SYSTEMCTL],
            SetVolume { .. }
            | SetMute { .. }
            | SetDefaultDevice { .. }
            | CycleSink
            | SetStreamVolume { .. } => &[PACTL],
            SetBrightness(_) => &[BRIGHTNESSCTL],
            SetPowerMode { .. } => &[CPUPOWER, SUDO],
            SetColorTemperature(_) => &[GAMMASTEP, PKILL],
        }
    }

    /// Main tool of this action.
    pub fn program(&self) -> &'static str {
        self.programs()[0]
    }

    /// Only one such action may run per domain at a time.
    pub fn is_exclusive(&self) -> bool {
        use Action::*;
        matches!(
            self,
            ConnectWifi { .. }
                | DisconnectWifi { .. }
                | ForgetWifi { .. }
                | ConnectBluetooth { .. }
                | DisconnectBluetooth { .. }
                | ForgetBluetooth { .. }
                | SetPowerMode { .. }
        )
    }

    /// Reject arguments the tools would choke on.
    pub fn validate(&self) -> Result<(), ActionError> {
        use Action::*;
        let percent = |p: u8| {
            if p > 100 {
                Err(ActionError::InvalidArgument(format!(
                    "{}% is not a valid percentage",
                    p
                )))
            } else {
                Ok(())
            }
        };
        match self {
            ConnectWifi { ssid, .. } | ForgetWifi { ssid } if ssid.is_empty() => Err(
                ActionError::InvalidArgument("SSID must not be empty".to_owned()),
            ),
            ConnectBluetooth { mac } | DisconnectBluetooth { mac } | ForgetBluetooth { mac }
                if !is_mac_address(mac) =>
            {
                Err(ActionError::InvalidArgument(format!(
                    "'{}' is not a bluetooth address",
                    mac
                )))
            }
            SetVolume { percent: p, .. }
            | SetStreamVolume { percent: p, .. }
            | SetBrightness(p) => percent(*p),
            SetColorTemperature(k) if !KELVIN_RANGE.contains(k) => {
                Err(ActionError::InvalidArgument(format!(
                    "{}K is outside {}..={}K",
                    k,
                    KELVIN_RANGE.start(),
                    KELVIN_RANGE.end()
                )))
            }
            _ => Ok(()),
        }
    }
}

fn is_mac_address(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Why an action did not complete.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The tool is not installed.
    #[error("{0} is missing, please install it")]
    Unavailable(String),
    #[allow(missing_docs)]
    #[error("Unable to launch {program}")]
    Launch {
        #[allow(missing_docs)]
        program: String,
        #[allow(missing_docs)]
        #[source]
        source: std::io::Error,
    },
    /// The tool ran and reported a failure (or timed out).
    #[error("{program} failed: {stderr}")]
    NonZeroExit {
        #[allow(missing_docs)]
        program: String,
        #[allow(missing_docs)]
        code: i32,
        /// Tool's own explanation.
        stderr: String,
    },
    /// Another action of this domain is running.
    #[error("Another {0} action is in progress")]
    Busy(Domain),
    #[allow(missing_docs)]
    #[error("Network '{0}' is secured, a password is required")]
    PasswordRequired(String),
    /// A service the action relies on is stopped.
    #[error("{0} is not running, enable it first")]
    ServiceStopped(String),
    #[allow(missing_docs)]
    #[error("{0} not found")]
    NotFound(String),
    #[allow(missing_docs)]
    #[error("{0}")]
    InvalidArgument(String),
}

impl From<CommandError> for ActionError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Unavailable(program) => ActionError::Unavailable(program),
            CommandError::Launch { program, source } => ActionError::Launch { program, source },
        }
    }
}

impl ActionError {
    fn from_result(cmd: &ExternalCommand, res: &CommandResult) -> Self {
        ActionError::NonZeroExit {
            program: cmd.program().to_owned(),
            code: res.exit_code,
            stderr: res.failure_detail(),
        }
    }
}

/// Releases its domain when dropped.
struct InFlight<'a> {
    domains: &'a Mutex<HashSet<Domain>>,
    domain: Domain,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.domains).remove(&self.domain);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// bluetoothctl often exits with 0 while printing `Failed to ...`.
fn bluez_failure(res: &CommandResult) -> Option<String> {
    res.stdout
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("Failed to"))
        .map(str::to_owned)
}

/// Executes [`Action`]s.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ActionDispatcher {
    #[derivative(Debug = "ignore")]
    runner: Arc<dyn CommandRunner>,
    #[derivative(Debug = "ignore")]
    profiles: Arc<DeviceRegistry<SavedProfile>>,
    #[derivative(Debug = "ignore")]
    bluetooth: Arc<DeviceRegistry<BluetoothDeviceRecord>>,
    in_flight: Mutex<HashSet<Domain>>,
    connect_timeout: Duration,
}

impl ActionDispatcher {
    /// Create a dispatcher reading saved wifi profiles and bluetooth pairing
    /// state from the given registries.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        profiles: Arc<DeviceRegistry<SavedProfile>>,
        bluetooth: Arc<DeviceRegistry<BluetoothDeviceRecord>>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            profiles,
            bluetooth,
            in_flight: Mutex::new(HashSet::new()),
            connect_timeout,
        }
    }

    /// Domains with an exclusive action running.
    pub fn busy_domains(&self) -> Vec<Domain> {
        lock(&self.in_flight).iter().copied().collect()
    }

    fn acquire(&self, domain: Domain) -> Result<InFlight<'_>, ActionError> {
        if !lock(&self.in_flight).insert(domain) {
            warn!("Rejecting {} action, another one is running", domain);
            return Err(ActionError::Busy(domain));
        }
        Ok(InFlight {
            domains: &self.in_flight,
            domain,
        })
    }

    /// Run `action` to completion on the calling thread.
    pub fn execute(&self, action: Action) -> Result<(), ActionError> {
        action.validate()?;
        if let Some(missing) = action
            .programs()
            .iter()
            .find(|p| !self.runner.is_available(p))
        {
            warn!("{} is not available", missing);
            return Err(ActionError::Unavailable((*missing).to_owned()));
        }
        let domain = action.domain();
        let _guard = if action.is_exclusive() {
            Some(self.acquire(domain)?)
        } else {
            None
        };
        debug!("Executing {:?}", action);
        let description = format!("{:?}", action);
        let res = self.dispatch(action);
        match &res {
            Ok(()) => info!("{} action done", domain),
            Err(e) => error!("{} failed: {}", description, e),
        }
        res
    }

    fn dispatch(&self, action: Action) -> Result<(), ActionError> {
        use Action::*;
        match action {
            ConnectWifi {
                ssid,
                secured,
                password,
                remember,
            } => self.connect_wifi(&ssid, secured, password, remember),
            DisconnectWifi { profile } => self.disconnect_wifi(profile),
            ForgetWifi { ssid } => self
                .run(ExternalCommand::new(NMCLI).args(["con", "delete", ssid.as_str()]))
                .map(drop),
            SetWifiRadio(on) => self
                .run(ExternalCommand::new(NMCLI).args(["radio", "wifi", on_off(on)]))
                .map(drop),
            ConnectBluetooth { mac } => self.connect_bluetooth(&mac),
            DisconnectBluetooth { mac } => self.run_bluez(bluetooth::device_command("disconnect", &mac)),
            ForgetBluetooth { mac } => self.run_bluez(bluetooth::device_command("remove", &mac)),
            SetBluetoothService(on) => self
                .run(
                    ExternalCommand::new(SYSTEMCTL)
                        .args([if on { "start" } else { "stop" }, "bluetooth"]),
                )
                .map(drop),
            EnablePairingMode => self.enable_pairing_mode(),
            SetVolume {
                kind,
                device,
                percent,
            } => {
                let target = device.as_deref().unwrap_or_else(|| kind.default_alias());
                self.run(kind.set_volume_command(target, percent)).map(drop)
            }
            SetMute { kind, device, mute } => {
                let target = device.as_deref().unwrap_or_else(|| kind.default_alias());
                self.run(kind.set_mute_command(target, mute)).map(drop)
            }
            SetDefaultDevice { kind, name } => self.run(kind.set_default_command(&name)).map(drop),
            CycleSink => self.cycle_sink(),
            SetStreamVolume {
                app_name,
                media_name,
                percent,
            } => self.set_stream_volume(&app_name, &media_name, percent),
            SetBrightness(percent) => self.run(brightness::set_command(percent)).map(drop),
            SetPowerMode { mode, password } => {
                info!("Switching CPU governor to {}", mode.governor());
                self.run(power::set_governor_command(mode, password)).map(drop)
            }
            SetColorTemperature(kelvin) => self.set_color_temperature(kelvin),
        }
    }

    fn run_unchecked(&self, cmd: &ExternalCommand) -> Result<CommandResult, ActionError> {
        Ok(self.runner.run(cmd)?)
    }

    fn run(&self, cmd: ExternalCommand) -> Result<CommandResult, ActionError> {
        let res = self.run_unchecked(&cmd)?;
        if res.success() {
            Ok(res)
        } else {
            Err(ActionError::from_result(&cmd, &res))
        }
    }

    fn run_bluez(&self, cmd: ExternalCommand) -> Result<(), ActionError> {
        let res = self.run(cmd.timeout(self.connect_timeout))?;
        match bluez_failure(&res) {
            Some(stderr) => Err(ActionError::NonZeroExit {
                program: BLUETOOTHCTL.to_owned(),
                code: res.exit_code,
                stderr,
            }),
            None => Ok(()),
        }
    }

    fn has_saved_profile(&self, name: &str) -> Result<bool, ActionError> {
        let snapshot = self.profiles.get();
        if snapshot.revision() > 0 {
            return Ok(snapshot.contains(&name.to_owned()));
        }
        debug!("Saved profiles not scanned yet, asking nmcli");
        let out = self.run(wifi::profiles_command(false))?;
        Ok(wifi::parse::parse_profiles(&out.stdout)
            .iter()
            .any(|p| p.name == name))
    }

    fn connect_wifi(
        &self,
        ssid: &str,
        secured: bool,
        password: Option<Secret>,
        remember: bool,
    ) -> Result<(), ActionError> {
        let up = ExternalCommand::new(NMCLI)
            .args(["con", "up", ssid])
            .timeout(self.connect_timeout);
        if self.has_saved_profile(ssid)? {
            info!("Activating saved profile {:?}", ssid);
            return self.run(up).map(drop);
        }

        let mut add = ExternalCommand::new(NMCLI).args([
            "con", "add", "type", "wifi", "con-name", ssid, "ssid", ssid,
        ]);
        if secured {
            let password = password
                .filter(|p| !p.is_empty())
                .ok_or_else(|| ActionError::PasswordRequired(ssid.to_owned()))?;
            add = add
                .args(["wifi-sec.key-mgmt", "wpa-psk", "wifi-sec.psk"])
                .secret_arg(password);
        }
        if !remember {
            add = add.args(["connection.autoconnect", "no"]);
        }
        // A timed out `con add` may still have written the profile.
        let res = self
            .run(add.timeout(self.connect_timeout))
            .and_then(|_| self.run(up));
        if res.is_err() {
            warn!("Connection to {:?} failed, removing its new profile", ssid);
            self.remove_profile(ssid);
        }
        res.map(drop)
    }

    /// Best effort: the profile may not exist.
    fn remove_profile(&self, name: &str) {
        let delete = ExternalCommand::new(NMCLI).args(["con", "delete", name]);
        match self.run_unchecked(&delete) {
            Ok(res) if res.success() => debug!("Profile {:?} removed", name),
            Ok(res) => debug!("Profile {:?} not removed: {}", name, res.failure_detail()),
            Err(e) => warn!("Unable to remove profile {:?}: {}", name, e),
        }
    }

    fn disconnect_wifi(&self, profile: Option<String>) -> Result<(), ActionError> {
        let name = match profile {
            Some(name) => name,
            None => {
                let out = self.run(wifi::profiles_command(true))?;
                wifi::parse::parse_active_wifi(&out.stdout)
                    .ok_or_else(|| ActionError::NotFound("Active wifi connection".to_owned()))?
            }
        };
        self.run(ExternalCommand::new(NMCLI).args(["con", "down", name.as_str()]))
            .map(drop)
    }

    fn connect_bluetooth(&self, mac: &str) -> Result<(), ActionError> {
        let paired = self
            .bluetooth
            .get()
            .get(&mac.to_owned())
            .map(|d| d.is_paired)
            .unwrap_or(false);
        if paired {
            debug!("{} already paired", mac);
        } else {
            let pair = bluetooth::device_command("pair", mac).timeout(self.connect_timeout);
            let res = self.run_unchecked(&pair)?;
            let already = res.stdout.contains("AlreadyExists") || res.stderr.contains("AlreadyExists");
            if !already {
                if !res.success() {
                    return Err(ActionError::from_result(&pair, &res));
                }
                if let Some(stderr) = bluez_failure(&res) {
                    return Err(ActionError::NonZeroExit {
                        program: BLUETOOTHCTL.to_owned(),
                        code: res.exit_code,
                        stderr,
                    });
                }
            }
        }
        self.run_bluez(bluetooth::device_command("connect", mac))
    }

    fn enable_pairing_mode(&self) -> Result<(), ActionError> {
        // `is-active` exits with 3 when stopped: read its answer, not its code.
        let status = self.run_unchecked(&bluetooth::service_status_command())?;
        if !bluetooth::parse::parse_service_active(&status.stdout) {
            return Err(ActionError::ServiceStopped("bluetooth".to_owned()));
        }
        self.run_bluez(bluetooth::discoverable_timeout_command(
            bluetooth::PAIRING_WINDOW,
        ))?;
        self.run_bluez(ExternalCommand::new(BLUETOOTHCTL).args(["discoverable", "on"]))?;
        self.run_bluez(ExternalCommand::new(BLUETOOTHCTL).args(["pairable", "on"]))?;
        info!(
            "Discoverable for {}s",
            bluetooth::PAIRING_WINDOW.as_secs()
        );
        Ok(())
    }

    fn cycle_sink(&self) -> Result<(), ActionError> {
        let kind = AudioKind::Sink;
        let out = self.run(kind.list_command())?;
        let sinks: Vec<String> = audio::parse::parse_short_list(&out.stdout)
            .into_iter()
            .map(|(_, name)| name)
            .collect();
        let default = self.run(kind.default_command())?;
        let default = default.stdout.trim();
        let next = match sinks.iter().position(|s| s == default) {
            Some(i) => sinks.get((i + 1) % sinks.len()),
            None => sinks.first(),
        }
        .ok_or_else(|| ActionError::NotFound("Audio sink".to_owned()))?;
        info!("Switching default sink to {}", next);
        self.run(kind.set_default_command(next)).map(drop)
    }

    fn set_stream_volume(&self, app: &str, media: &str, percent: u8) -> Result<(), ActionError> {
        // Indexes change whenever a stream restarts: resolve it right now.
        let out = self.run(audio::streams_command())?;
        let stream = audio::parse::parse_sink_inputs(&out.stdout)
            .into_iter()
            .find(|s| s.app_name == app && s.media_name == media)
            .ok_or_else(|| ActionError::NotFound(format!("Stream '{}' of {}", media, app)))?;
        self.run(audio::set_stream_volume_command(&stream.stream_id, percent))
            .map(drop)
    }

    fn set_color_temperature(&self, kelvin: u32) -> Result<(), ActionError> {
        let stop = power::stop_gammastep_command();
        let res = self.run_unchecked(&stop)?;
        // pkill exits with 1 when nothing matched.
        if !res.success() && res.exit_code != 1 {
            return Err(ActionError::from_result(&stop, &res));
        }
        let pid = self
            .runner
            .spawn_detached(&power::set_temperature_command(kelvin))?;
        debug!("gammastep running as {}", pid);
        Ok(())
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}
