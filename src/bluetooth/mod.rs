//! Bluetooth control through BlueZ's `bluetoothctl`.
pub mod parse;

use crate::command::{CommandRunner, ExternalCommand};
use crate::model::{BluetoothDeviceRecord, Domain};
use crate::scan::{run_checked, ScanError, Scanner};
use derivative::Derivative;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Program driving this domain.
pub const BLUETOOTHCTL: &str = "bluetoothctl";
/// Service manager used to start and stop bluetoothd.
pub const SYSTEMCTL: &str = "systemctl";

/// `bluetoothctl <verb> <mac>` for pair, connect, disconnect and remove.
pub fn device_command(verb: &str, mac: &str) -> ExternalCommand {
    ExternalCommand::new(BLUETOOTHCTL).args([verb, mac])
}

/// How long the adapter stays discoverable in pairing mode.
pub const PAIRING_WINDOW: Duration = Duration::from_secs(120);

/// `bluetoothctl discoverable-timeout <secs>`, after which bluetoothd turns
/// discoverability back off by itself.
pub fn discoverable_timeout_command(window: Duration) -> ExternalCommand {
    ExternalCommand::new(BLUETOOTHCTL).args([
        "discoverable-timeout".to_owned(),
        window.as_secs().to_string(),
    ])
}

/// `systemctl is-active bluetooth`
pub fn service_status_command() -> ExternalCommand {
    ExternalCommand::new(SYSTEMCTL).args(["is-active", "bluetooth"])
}

/// Lists known and discovered devices.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct BluetoothScanner {
    #[derivative(Debug = "ignore")]
    runner: Arc<dyn CommandRunner>,
    discovery: Duration,
    timeout: Duration,
}

impl BluetoothScanner {
    /// Create a scanner discovering new devices for `discovery` (zero disables
    /// discovery) before listing them.
    pub fn new(runner: Arc<dyn CommandRunner>, discovery: Duration, timeout: Duration) -> Self {
        Self {
            runner,
            discovery,
            timeout,
        }
    }
}

impl Scanner for BluetoothScanner {
    type Record = BluetoothDeviceRecord;

    fn domain(&self) -> Domain {
        Domain::Bluetooth
    }

    fn scan(&self) -> Result<Vec<BluetoothDeviceRecord>, ScanError> {
        if !self.discovery.is_zero() {
            let secs = self.discovery.as_secs().max(1).to_string();
            let discover = ExternalCommand::new(BLUETOOTHCTL)
                .args(["--timeout", secs.as_str(), "scan", "on"])
                .timeout(self.discovery + self.timeout);
            // Discovery failing (no adapter powered) still lets us list known devices.
            if let Err(e) = run_checked(&*self.runner, &discover) {
                warn!("Bluetooth discovery failed: {}", e);
            }
        }
        let listing = ExternalCommand::new(BLUETOOTHCTL)
            .arg("devices")
            .timeout(self.timeout);
        let out = run_checked(&*self.runner, &listing)?;
        let mut res = Vec::new();
        for (mac, name) in parse::parse_devices(&out.stdout) {
            let info = self
                .runner
                .run(&device_command("info", &mac).timeout(self.timeout))?;
            if !info.success() {
                debug!("No info for {}: {}", mac, info.failure_detail());
            }
            res.push(parse::parse_info(&mac, &name, &info.stdout));
        }
        Ok(res)
    }
}

/// Is bluetoothd running?
pub fn is_service_active(runner: &dyn CommandRunner) -> Result<bool, ScanError> {
    // `is-active` exits with 3 when inactive, which is an answer, not a failure.
    let out = runner.run(&service_status_command())?;
    Ok(parse::parse_service_active(&out.stdout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandResult, MockCommandRunner};
    use crate::model::DeviceClass;
    use mockall::Sequence;
    use test_log::test;

    #[test]
    fn scan_discovers_lists_and_queries_each_device() {
        let mut mock = MockCommandRunner::new();
        let mut seq = Sequence::new();
        mock.expect_run()
            .withf(|cmd| cmd.has_args(&["--timeout", "5", "scan", "on"]))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(CommandResult::ok("Discovery started\n")));
        mock.expect_run()
            .withf(|cmd| cmd.has_args(&["devices"]))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(CommandResult::ok(
                    "Device 11:22:33:44:55:66 Pixel\nDevice AA:BB:CC:DD:EE:FF Mouse\n",
                ))
            });
        mock.expect_run()
            .withf(|cmd| cmd.has_args(&["info", "11:22:33:44:55:66"]))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(CommandResult::ok("\tIcon: phone\n\tPaired: yes\n\tConnected: no\n")));
        mock.expect_run()
            .withf(|cmd| cmd.has_args(&["info", "AA:BB:CC:DD:EE:FF"]))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(CommandResult::failed(1, "Device AA:BB:CC:DD:EE:FF not available")));

        let scanner =
            BluetoothScanner::new(Arc::new(mock), Duration::from_secs(5), Duration::from_secs(2));
        let res = scanner.scan().unwrap();
        assert_eq!(res.len(), 2);
        assert_eq!(res[0].device_class, DeviceClass::Phone);
        assert!(res[0].is_paired);
        assert_eq!(res[1].name, "Mouse");
        assert_eq!(res[1].device_class, DeviceClass::Unknown);
    }

    #[test]
    fn scan_without_discovery_only_lists() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .withf(|cmd| cmd.has_args(&["devices"]))
            .times(1)
            .returning(|_| Ok(CommandResult::ok("")));
        let scanner = BluetoothScanner::new(Arc::new(mock), Duration::ZERO, Duration::from_secs(2));
        assert!(scanner.scan().unwrap().is_empty());
    }

    #[test]
    fn inactive_service_is_not_an_error() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .withf(|cmd| cmd.program() == "systemctl")
            .returning(|_| {
                Ok(CommandResult {
                    exit_code: 3,
                    stdout: "inactive\n".into(),
                    stderr: String::new(),
                })
            });
        assert!(!is_service_active(&mock).unwrap());
    }
}
