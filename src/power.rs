//! CPU governor and screen colour temperature.
use crate::command::ExternalCommand;
use crate::model::PowerMode;
use crate::secret::Secret;
use anyhow::{Context, Result};
use std::ops::RangeInclusive;
use std::path::Path;

/// Frequency governor tool, run through sudo.
pub const CPUPOWER: &str = "cpupower";
#[allow(missing_docs)]
pub const SUDO: &str = "sudo";
/// Colour temperature tool.
pub const GAMMASTEP: &str = "gammastep";
#[allow(missing_docs)]
pub const PKILL: &str = "pkill";

/// Governor of the first CPU.
pub const GOVERNOR_PATH: &str = "/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor";

/// Accepted colour temperatures in Kelvin.
pub const KELVIN_RANGE: RangeInclusive<u32> = 2500..=6500;

/// `sudo -S -p "" cpupower frequency-set -g <governor>`, password on stdin.
pub fn set_governor_command(mode: PowerMode, password: Secret) -> ExternalCommand {
    ExternalCommand::new(SUDO)
        .args(["-S", "-p", "", CPUPOWER, "frequency-set", "-g", mode.governor()])
        .stdin_secret(password)
}

/// Mode matching the governor currently in use.
pub fn current_mode(governor_file: &Path) -> Result<Option<PowerMode>> {
    let governor = std::fs::read_to_string(governor_file)
        .with_context(|| format!("Reading {:?}", governor_file))?;
    Ok(PowerMode::from_governor(&governor))
}

/// `pkill -f gammastep`
pub fn stop_gammastep_command() -> ExternalCommand {
    ExternalCommand::new(PKILL).args(["-f", GAMMASTEP])
}

/// `gammastep -O <kelvin>`
pub fn set_temperature_command(kelvin: u32) -> ExternalCommand {
    ExternalCommand::new(GAMMASTEP)
        .arg("-O")
        .arg(kelvin.to_string())
}
