//! Audio control through PulseAudio's `pactl` (also served by PipeWire).
pub mod parse;

use crate::command::{CommandRunner, ExternalCommand};
use crate::model::{ApplicationStreamRecord, AudioDeviceRecord, Domain};
use crate::scan::{run_checked, ScanError, Scanner};
use derivative::Derivative;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Program driving this domain.
pub const PACTL: &str = "pactl";

/// Sinks play sound, sources record it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioKind {
    #[allow(missing_docs)]
    Sink,
    #[allow(missing_docs)]
    Source,
}

impl AudioKind {
    fn noun(self) -> &'static str {
        match self {
            AudioKind::Sink => "sink",
            AudioKind::Source => "source",
        }
    }

    /// `pactl list short sinks|sources`
    pub fn list_command(self) -> ExternalCommand {
        ExternalCommand::new(PACTL)
            .args(["list", "short"])
            .arg(format!("{}s", self.noun()))
    }

    /// `pactl get-default-sink|source`
    pub fn default_command(self) -> ExternalCommand {
        ExternalCommand::new(PACTL).arg(format!("get-default-{}", self.noun()))
    }

    /// `pactl set-default-sink|source <name>`
    pub fn set_default_command(self, name: &str) -> ExternalCommand {
        ExternalCommand::new(PACTL)
            .arg(format!("set-default-{}", self.noun()))
            .arg(name)
    }

    /// `pactl get-sink-volume <name>`
    pub fn volume_command(self, name: &str) -> ExternalCommand {
        ExternalCommand::new(PACTL)
            .arg(format!("get-{}-volume", self.noun()))
            .arg(name)
    }

    /// `pactl set-sink-volume <name> <percent>%`
    pub fn set_volume_command(self, name: &str, percent: u8) -> ExternalCommand {
        ExternalCommand::new(PACTL).args([
            format!("set-{}-volume", self.noun()),
            name.to_owned(),
            format!("{}%", percent.min(100)),
        ])
    }

    /// `pactl get-sink-mute <name>`
    pub fn mute_command(self, name: &str) -> ExternalCommand {
        ExternalCommand::new(PACTL)
            .arg(format!("get-{}-mute", self.noun()))
            .arg(name)
    }

    /// `pactl set-sink-mute <name> toggle|1|0`
    pub fn set_mute_command(self, name: &str, mute: Option<bool>) -> ExternalCommand {
        let value = match mute {
            None => "toggle",
            Some(true) => "1",
            Some(false) => "0",
        };
        ExternalCommand::new(PACTL)
            .arg(format!("set-{}-mute", self.noun()))
            .args([name, value])
    }

    /// Alias pactl accepts for the current default device.
    pub fn default_alias(self) -> &'static str {
        match self {
            AudioKind::Sink => "@DEFAULT_SINK@",
            AudioKind::Source => "@DEFAULT_SOURCE@",
        }
    }
}

impl fmt::Display for AudioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.noun())
    }
}

/// `pactl list sink-inputs`
pub fn streams_command() -> ExternalCommand {
    ExternalCommand::new(PACTL).args(["list", "sink-inputs"])
}

/// `pactl set-sink-input-volume <index> <percent>%`
pub fn set_stream_volume_command(stream_id: &str, percent: u8) -> ExternalCommand {
    ExternalCommand::new(PACTL).args([
        "set-sink-input-volume".to_owned(),
        stream_id.to_owned(),
        format!("{}%", percent.min(100)),
    ])
}

/// Lists sinks or sources with their volume and mute state.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct AudioDeviceScanner {
    #[derivative(Debug = "ignore")]
    runner: Arc<dyn CommandRunner>,
    kind: AudioKind,
    timeout: Duration,
}

impl AudioDeviceScanner {
    #[allow(missing_docs)]
    pub fn new(runner: Arc<dyn CommandRunner>, kind: AudioKind, timeout: Duration) -> Self {
        Self {
            runner,
            kind,
            timeout,
        }
    }

    #[allow(missing_docs)]
    pub fn kind(&self) -> AudioKind {
        self.kind
    }

    /// Output of a per device query, empty when it failed.
    fn query(&self, cmd: ExternalCommand) -> Result<String, ScanError> {
        let cmd = cmd.timeout(self.timeout);
        let res = self.runner.run(&cmd)?;
        if res.success() {
            Ok(res.stdout)
        } else {
            debug!("`{}` failed: {}", cmd, res.failure_detail());
            Ok(String::new())
        }
    }
}

impl Scanner for AudioDeviceScanner {
    type Record = AudioDeviceRecord;

    fn domain(&self) -> Domain {
        Domain::Audio
    }

    fn scan(&self) -> Result<Vec<AudioDeviceRecord>, ScanError> {
        let out = run_checked(&*self.runner, &self.kind.list_command().timeout(self.timeout))?;
        let default = self.query(self.kind.default_command())?;
        let default = default.trim();
        let mut res = Vec::new();
        for (_, name) in parse::parse_short_list(&out.stdout) {
            // Monitors mirror sinks and are not microphones.
            if self.kind == AudioKind::Source && name.ends_with(".monitor") {
                continue;
            }
            let volume = self.query(self.kind.volume_command(&name))?;
            let mute = self.query(self.kind.mute_command(&name))?;
            res.push(AudioDeviceRecord {
                display_name: name.clone(),
                volume_percent: parse::parse_volume(&volume).unwrap_or(0),
                muted: parse::parse_mute(&mute),
                is_default: name == default,
                id: name,
            });
        }
        Ok(res)
    }
}

/// Lists applications currently playing sound.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct StreamScanner {
    #[derivative(Debug = "ignore")]
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl StreamScanner {
    #[allow(missing_docs)]
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }
}

impl Scanner for StreamScanner {
    type Record = ApplicationStreamRecord;

    fn domain(&self) -> Domain {
        Domain::Audio
    }

    fn scan(&self) -> Result<Vec<ApplicationStreamRecord>, ScanError> {
        list_streams(&*self.runner, self.timeout)
    }
}

/// Current application streams, straight from the sound server.
pub fn list_streams(
    runner: &dyn CommandRunner,
    timeout: Duration,
) -> Result<Vec<ApplicationStreamRecord>, ScanError> {
    let out = run_checked(runner, &streams_command().timeout(timeout))?;
    Ok(parse::parse_sink_inputs(&out.stdout))
}

/// Volume of the default device of `kind`.
pub fn default_volume(runner: &dyn CommandRunner, kind: AudioKind) -> Result<Option<u8>, ScanError> {
    let out = run_checked(runner, &kind.volume_command(kind.default_alias()))?;
    Ok(parse::parse_volume(&out.stdout))
}
