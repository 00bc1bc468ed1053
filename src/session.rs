//! Long lived context tying the runner, registries, coordinators and
//! dispatcher together.
//!
//! Registries are only written from the thread calling
//! [`Session::process_outcomes`] or [`Session::wait_idle`]; everybody else
//! reads snapshots.
use crate::action::{Action, ActionDispatcher, ActionError};
use crate::audio::{AudioDeviceScanner, AudioKind, StreamScanner};
use crate::battery::BatteryScanner;
use crate::bluetooth::BluetoothScanner;
use crate::command::CommandRunner;
use crate::config::AppConfig;
use crate::model::{Domain, PowerMode};
use crate::registry::DeviceRegistry;
use crate::scan::{ScanCoordinator, ScanError, ScanEvent, ScanPhase, Scanner};
use crate::secret::Secret;
use crate::settings::{Cache, Settings};
use crate::wifi::{ProfileScanner, WifiScanner};
use crate::{brightness, power};
use anyhow::Result;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Object safe view of a coordinator, whatever it scans.
trait Refresh: Send + Sync {
    fn domain(&self) -> Domain;
    fn phase(&self) -> ScanPhase;
    fn request_scan(&self);
    fn restart_scan(&self);
    fn trigger(&self);
    fn process_outcomes(&self) -> Vec<ScanEvent>;
    fn wait_current(&self, timeout: Duration) -> Option<ScanEvent>;
}

impl<S: Scanner> Refresh for ScanCoordinator<S> {
    fn domain(&self) -> Domain {
        ScanCoordinator::domain(self)
    }
    fn phase(&self) -> ScanPhase {
        ScanCoordinator::phase(self)
    }
    fn request_scan(&self) {
        ScanCoordinator::request_scan(self);
    }
    fn restart_scan(&self) {
        ScanCoordinator::restart_scan(self);
    }
    fn trigger(&self) {
        ScanCoordinator::trigger(self)
    }
    fn process_outcomes(&self) -> Vec<ScanEvent> {
        ScanCoordinator::process_outcomes(self)
    }
    fn wait_current(&self, timeout: Duration) -> Option<ScanEvent> {
        ScanCoordinator::wait_current(self, timeout)
    }
}

/// Everything one front-end needs.
pub struct Session {
    runner: Arc<dyn CommandRunner>,
    config: AppConfig,
    /// Visible wifi networks.
    pub wifi: ScanCoordinator<WifiScanner>,
    /// Saved NetworkManager profiles.
    pub profiles: ScanCoordinator<ProfileScanner>,
    #[allow(missing_docs)]
    pub bluetooth: ScanCoordinator<BluetoothScanner>,
    #[allow(missing_docs)]
    pub sinks: ScanCoordinator<AudioDeviceScanner>,
    #[allow(missing_docs)]
    pub sources: ScanCoordinator<AudioDeviceScanner>,
    /// Applications playing sound.
    pub streams: ScanCoordinator<StreamScanner>,
    #[allow(missing_docs)]
    pub batteries: ScanCoordinator<BatteryScanner>,
    dispatcher: ActionDispatcher,
    cache: Cache,
    settings: Mutex<Settings>,
}

impl Session {
    /// Build a session and load persisted settings from `config.state_dir`.
    pub fn new(runner: Arc<dyn CommandRunner>, config: AppConfig) -> Result<Self> {
        let cache = Cache::in_dir(&config.state_dir)?;
        let settings = Settings::load(&cache)?;
        let scan = config.scan_timeout;
        let debounce = config.debounce;

        let profiles = ScanCoordinator::new(
            ProfileScanner::new(runner.clone(), scan),
            Arc::new(DeviceRegistry::new()),
            debounce,
        );
        let bluetooth = ScanCoordinator::new(
            BluetoothScanner::new(runner.clone(), config.bluetooth_scan, scan),
            Arc::new(DeviceRegistry::new()),
            debounce,
        );
        let dispatcher = ActionDispatcher::new(
            runner.clone(),
            profiles.registry().clone(),
            bluetooth.registry().clone(),
            config.connect_timeout,
        );
        Ok(Session {
            wifi: ScanCoordinator::new(
                WifiScanner::new(runner.clone(), scan),
                Arc::new(DeviceRegistry::new()),
                debounce,
            ),
            profiles,
            bluetooth,
            sinks: ScanCoordinator::new(
                AudioDeviceScanner::new(runner.clone(), AudioKind::Sink, scan),
                Arc::new(DeviceRegistry::new()),
                debounce,
            ),
            sources: ScanCoordinator::new(
                AudioDeviceScanner::new(runner.clone(), AudioKind::Source, scan),
                Arc::new(DeviceRegistry::new()),
                debounce,
            ),
            streams: ScanCoordinator::new(
                StreamScanner::new(runner.clone(), scan),
                Arc::new(DeviceRegistry::new()),
                debounce,
            ),
            batteries: ScanCoordinator::new(
                BatteryScanner::new(runner.clone(), scan),
                Arc::new(DeviceRegistry::new()),
                debounce,
            ),
            dispatcher,
            cache,
            settings: Mutex::new(settings),
            runner,
            config,
        })
    }

    #[allow(missing_docs)]
    pub fn runner(&self) -> &dyn CommandRunner {
        &*self.runner
    }

    #[allow(missing_docs)]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    #[allow(missing_docs)]
    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    /// Copy of the persisted settings.
    pub fn settings(&self) -> Settings {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Screen brightness, `None` without a backlight.
    pub fn brightness(&self) -> Result<Option<u8>, ScanError> {
        brightness::read_percent(&*self.runner)
    }

    /// Power mode from the active CPU governor, the remembered one when
    /// the governor is unknown or unreadable.
    pub fn power_mode(&self) -> Option<PowerMode> {
        match power::current_mode(Path::new(power::GOVERNOR_PATH)) {
            Ok(Some(mode)) => Some(mode),
            Ok(None) => self.settings().power_mode,
            Err(e) => {
                debug!("{:#}", e);
                self.settings().power_mode
            }
        }
    }

    fn coordinators(&self) -> [&dyn Refresh; 7] {
        [
            &self.wifi,
            &self.profiles,
            &self.bluetooth,
            &self.sinks,
            &self.sources,
            &self.streams,
            &self.batteries,
        ]
    }

    fn of_domain(&self, domain: Domain) -> impl Iterator<Item = &dyn Refresh> {
        self.coordinators()
            .into_iter()
            .filter(move |c| c.domain() == domain)
    }

    /// Scan `domain` now unless a scan is running.
    pub fn refresh(&self, domain: Domain) {
        self.of_domain(domain).for_each(|c| c.request_scan());
    }

    /// Scan every domain now.
    pub fn refresh_all(&self) {
        self.coordinators().iter().for_each(|c| c.request_scan());
    }

    /// Debounced refresh of `domain`, for bursts of change notifications.
    pub fn trigger(&self, domain: Domain) {
        self.of_domain(domain).for_each(|c| c.trigger());
    }

    /// Debounced refresh of every domain.
    pub fn trigger_all(&self) {
        self.coordinators().iter().for_each(|c| c.trigger());
    }

    /// Apply finished scans to the registries.
    pub fn process_outcomes(&self) -> Vec<ScanEvent> {
        self.coordinators()
            .iter()
            .flat_map(|c| c.process_outcomes())
            .collect()
    }

    /// Apply running scans as they finish, giving up after `timeout`.
    pub fn wait_idle(&self, timeout: Duration) -> Vec<ScanEvent> {
        let deadline = Instant::now() + timeout;
        let mut events = self.process_outcomes();
        for c in self.coordinators() {
            if c.phase() == ScanPhase::Scanning {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match c.wait_current(remaining) {
                    Some(event) => events.push(event),
                    None => debug!("{} scan still running", c.domain()),
                }
            }
        }
        events
    }

    /// Build a wifi connection, telling from the last scan whether the
    /// network is secured (assumed when unknown and a password is given).
    pub fn connect_wifi_action(
        &self,
        ssid: &str,
        password: Option<Secret>,
        remember: bool,
    ) -> Action {
        let secured = self
            .wifi
            .registry()
            .get()
            .get(&ssid.to_owned())
            .map(|n| n.security.is_secured())
            .unwrap_or_else(|| password.is_some());
        Action::ConnectWifi {
            ssid: ssid.to_owned(),
            secured,
            password,
            remember,
        }
    }

    /// Execute `action`, then rescan what it changed and remember power
    /// mode and colour temperature.
    pub fn execute(&self, action: Action) -> Result<(), ActionError> {
        let domain = action.domain();
        let remembered = match &action {
            Action::SetPowerMode { mode, .. } => Some((Some(*mode), None)),
            Action::SetColorTemperature(kelvin) => Some((None, Some(*kelvin))),
            _ => None,
        };
        self.dispatcher.execute(action)?;
        // Whatever was scanning started before the change.
        self.of_domain(domain).for_each(|c| c.restart_scan());
        if let Some((mode, gamma)) = remembered {
            let mut settings = self.settings.lock().unwrap_or_else(PoisonError::into_inner);
            let res = match (mode, gamma) {
                (Some(mode), _) => settings.set_power_mode(mode, &self.cache),
                (_, Some(kelvin)) => settings.set_gamma(kelvin, &self.cache),
                _ => Ok(()),
            };
            if let Err(e) = res {
                error!("Unable to save settings: {:#}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::ScriptedRunner;
    use crate::command::CommandResult;
    use crate::model::PowerMode;
    use mktemp::Temp;
    use test_log::test;

    const WIFI: &str = "\
IN-USE  BSSID              SSID   MODE   CHAN  RATE        SIGNAL  BARS  SECURITY
*       AA:BB:CC:DD:EE:01  Home   Infra  6     54 Mbit/s   80      ▂▄▆_  WPA2
        AA:BB:CC:DD:EE:02  Cafe   Infra  11    130 Mbit/s  45      ▂▄__  --
";

    fn fake_system(cmd: &crate::command::ExternalCommand) -> Result<CommandResult, crate::command::CommandError> {
        let argv = cmd.argv();
        let out = match (cmd.program(), argv.as_slice()) {
            ("nmcli", [.., "list"]) => WIFI,
            ("nmcli", [.., "show"]) => "Home:802-11-wireless\n",
            ("bluetoothctl", ["devices"]) => "Device 11:22:33:44:55:66 Pixel\n",
            ("bluetoothctl", ["info", _]) => "\tIcon: phone\n\tPaired: yes\n\tConnected: yes\n",
            ("upower", ["-e"]) => "/org/freedesktop/UPower/devices/battery_BAT0\n",
            ("upower", ["-i", _]) => "  percentage: 64%\n  state: charging\n",
            ("pactl", ["list", "short", "sinks"]) => "0\tspeakers\tm\ts\tRUNNING\n",
            ("pactl", ["get-sink-volume", _]) => "Volume: front-left: 32768 /  50% / -18.06 dB\n",
            _ => "",
        };
        Ok(CommandResult::ok(out))
    }

    fn session(runner: Arc<ScriptedRunner>, dir: &Temp) -> Session {
        let mut config = AppConfig::with_state_dir(dir.to_path_buf());
        config.bluetooth_scan = Duration::ZERO;
        config.debounce = Duration::from_millis(10);
        Session::new(runner, config).unwrap()
    }

    #[test]
    fn refresh_all_fills_every_registry() -> Result<()> {
        let dir = Temp::new_dir()?;
        let s = session(Arc::new(ScriptedRunner::new(fake_system)), &dir);
        s.refresh_all();
        let events = s.wait_idle(Duration::from_secs(5));
        assert_eq!(events.len(), 7, "{:?}", events);

        let wifi = s.wifi.registry().get();
        assert_eq!(wifi.len(), 2);
        assert!(wifi.get(&"Home".to_string()).unwrap().is_connected);
        assert_eq!(s.profiles.registry().get().len(), 1);
        assert_eq!(s.bluetooth.registry().get().len(), 1);
        assert_eq!(s.batteries.registry().get().len(), 1);
        let sinks = s.sinks.registry().get();
        assert_eq!(sinks.get(&"speakers".to_string()).unwrap().volume_percent, 50);
        Ok(())
    }

    #[test]
    fn debounced_triggers_scan_once() -> Result<()> {
        let dir = Temp::new_dir()?;
        let runner = Arc::new(ScriptedRunner::new(fake_system));
        let s = session(runner.clone(), &dir);
        for _ in 0..5 {
            s.trigger(Domain::Battery);
        }
        std::thread::sleep(Duration::from_millis(200));
        s.wait_idle(Duration::from_secs(5));
        let listings = runner
            .calls()
            .iter()
            .filter(|c| c.as_str() == "upower -e")
            .count();
        assert_eq!(listings, 1);
        Ok(())
    }

    #[test]
    fn secured_state_comes_from_last_scan() -> Result<()> {
        let dir = Temp::new_dir()?;
        let s = session(Arc::new(ScriptedRunner::new(fake_system)), &dir);
        s.refresh(Domain::Wifi);
        s.wait_idle(Duration::from_secs(5));
        assert!(matches!(
            s.connect_wifi_action("Home", None, true),
            Action::ConnectWifi { secured: true, .. }
        ));
        assert!(matches!(
            s.connect_wifi_action("Cafe", None, true),
            Action::ConnectWifi { secured: false, .. }
        ));
        assert!(matches!(
            s.connect_wifi_action("Hidden", Some(Secret::new("pw".into())), true),
            Action::ConnectWifi { secured: true, .. }
        ));
        Ok(())
    }

    #[test]
    fn successful_actions_are_remembered_and_rescanned() -> Result<()> {
        let dir = Temp::new_dir()?;
        let runner = Arc::new(ScriptedRunner::new(fake_system));
        let s = session(runner.clone(), &dir);
        s.execute(Action::SetPowerMode {
            mode: PowerMode::Performance,
            password: Secret::new("pw".into()),
        })?;
        s.execute(Action::SetColorTemperature(5000))?;
        assert_eq!(s.settings().power_mode, Some(PowerMode::Performance));
        assert_eq!(s.settings().gamma, Some(5000));

        s.execute(Action::SetVolume {
            kind: AudioKind::Sink,
            device: None,
            percent: 20,
        })?;
        s.wait_idle(Duration::from_secs(5));
        assert!(runner
            .calls()
            .iter()
            .any(|c| c.as_str() == "pactl list sink-inputs"));

        let reloaded = session(runner, &dir);
        assert_eq!(reloaded.settings().gamma, Some(5000));
        Ok(())
    }

    #[test]
    fn failed_actions_change_nothing() -> Result<()> {
        let dir = Temp::new_dir()?;
        let runner = Arc::new(ScriptedRunner::new(|_| {
            Ok(CommandResult::failed(1, "Sorry, try again."))
        }));
        let s = session(runner, &dir);
        assert!(s
            .execute(Action::SetPowerMode {
                mode: PowerMode::PowerSaver,
                password: Secret::new("bad".into()),
            })
            .is_err());
        assert_eq!(s.settings().power_mode, None);
        Ok(())
    }
}
