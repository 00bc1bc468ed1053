//! Command line, configuration file and their merge.
//!
//! Precedence is defaults, then the TOML configuration file, then command line
//! flags (or their environment variables).
use crate::model::PowerMode;
use anyhow::{bail, Context, Result};
use directories_next::ProjectDirs;
use figment::providers::{Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::PathBuf;
use std::time::Duration;
use structopt::clap::AppSettings;
use structopt::StructOpt;
use tracing::debug;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "bettercontrol", "bettercontrol")
}

/// `$XDG_CONFIG_HOME/bettercontrol/config.toml`
pub fn default_config_file() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join("config.toml"))
}

// Courtesy of structopt_flags crate
/// `-v`/`-q` counters turned into a log level.
#[derive(StructOpt, Debug, Clone, PartialEq)]
pub struct QuietVerbose {
    /// Increase the output's verbosity level
    ///
    /// Pass many times to increase verbosity level, up to 3.
    #[structopt(
        name = "quietverbose",
        long = "verbose",
        short = "v",
        parse(from_occurrences),
        conflicts_with = "quietquiet",
        global = true
    )]
    verbosity_level: u8,

    /// Decrease the output's verbosity level.
    ///
    /// Used once, it will set error log level.
    /// Used twice, will silent the log completely
    #[structopt(
        name = "quietquiet",
        long = "quiet",
        short = "q",
        parse(from_occurrences),
        conflicts_with = "quietverbose",
        global = true
    )]
    quiet_level: u8,
}

impl Default for QuietVerbose {
    fn default() -> Self {
        QuietVerbose {
            verbosity_level: 1,
            quiet_level: 0,
        }
    }
}

impl Serialize for QuietVerbose {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.get_level_filter())
    }
}

fn de_from_str<'de, D>(deserializer: D) -> Result<QuietVerbose, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let (verbosity_level, quiet_level) = match s.to_ascii_lowercase().as_ref() {
        "off" => (0, 2),
        "error" => (0, 1),
        "warn" => (0, 0),
        "info" => (1, 0),
        "debug" => (2, 0),
        _ => (3, 0),
    };
    Ok(QuietVerbose {
        verbosity_level,
        quiet_level,
    })
}

impl QuietVerbose {
    /// Neither `-v` nor `-q` given, so the configuration file decides.
    pub fn is_unset(&self) -> bool {
        self.verbosity_level == 0 && self.quiet_level == 0
    }

    /// Level usable as an `EnvFilter` directive.
    pub fn get_level_filter(&self) -> &'static str {
        let quiet = self.quiet_level.min(2) as i8;
        let verbose = self.verbosity_level.min(3) as i8;
        match verbose - quiet {
            i8::MIN..=-2 => "Off",
            -1 => "Error",
            0 => "Warn",
            1 => "Info",
            2 => "Debug",
            _ => "Trace",
        }
    }
}

fn parse_on_off(s: &str) -> Result<bool> {
    match s.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => Ok(true),
        "off" | "false" | "0" | "no" => Ok(false),
        _ => bail!("Expected 'on' or 'off', got '{}'", s),
    }
}

/// Wifi subcommands.
#[derive(StructOpt, Debug, Clone, PartialEq)]
pub enum WifiCommand {
    /// List visible networks
    List,
    /// Connect to a network, creating its profile if needed
    Connect {
        /// network name
        ssid: String,
        /// read the password from stdin instead of prompting
        #[structopt(long)]
        password_stdin: bool,
        /// do not connect automatically in the future
        #[structopt(long)]
        no_remember: bool,
    },
    /// Disconnect from a network (the active one by default)
    Disconnect {
        /// profile name
        profile: Option<String>,
    },
    /// Delete a saved network profile
    Forget {
        /// profile name
        ssid: String,
    },
    /// Show or switch the wifi radio
    Radio {
        /// on or off
        #[structopt(parse(try_from_str = parse_on_off))]
        state: Option<bool>,
    },
    /// Show current download and upload speed
    Speed {
        /// interface (first wifi device by default)
        interface: Option<String>,
    },
}

/// Bluetooth subcommands.
#[derive(StructOpt, Debug, Clone, PartialEq)]
pub enum BluetoothCommand {
    /// List known and discovered devices
    List,
    /// Pair if needed and connect
    Connect {
        /// device address
        mac: String,
    },
    #[allow(missing_docs)]
    Disconnect {
        /// device address
        mac: String,
    },
    /// Remove a pairing
    Forget {
        /// device address
        mac: String,
    },
    /// Show, start or stop the bluetooth service
    Power {
        /// on or off
        #[structopt(parse(try_from_str = parse_on_off))]
        state: Option<bool>,
    },
    /// Make this computer discoverable and pairable
    PairMode,
}

/// Audio subcommands.
#[derive(StructOpt, Debug, Clone, PartialEq)]
pub enum AudioCommand {
    /// Show outputs, inputs and playing applications
    Status,
    /// Show or set the output volume
    Volume {
        /// percent
        percent: Option<u8>,
        /// output name (default output otherwise)
        #[structopt(long)]
        device: Option<String>,
    },
    /// Show or set the microphone volume
    Mic {
        /// percent
        percent: Option<u8>,
        /// input name (default input otherwise)
        #[structopt(long)]
        device: Option<String>,
    },
    /// Toggle mute of the output (or microphone)
    Mute {
        /// act on the default microphone
        #[structopt(long)]
        mic: bool,
    },
    /// Set the default output, or switch to the next one
    Sink {
        /// output name
        name: Option<String>,
    },
    /// List playing applications or set the volume of one
    App {
        /// application name
        app: Option<String>,
        /// percent
        percent: Option<u8>,
        /// media name, when the application plays several streams
        #[structopt(long)]
        media: Option<String>,
    },
}

/// What to do.
#[derive(StructOpt, Debug, Clone, PartialEq)]
pub enum Command {
    /// Show the state of every domain
    Status,
    /// Wifi networks
    Wifi(WifiCommand),
    /// Bluetooth devices
    Bt(BluetoothCommand),
    /// Volume, outputs and microphones
    Audio(AudioCommand),
    /// Show or set screen brightness
    Brightness {
        /// percent
        percent: Option<u8>,
    },
    /// Show battery metrics
    Battery,
    /// Show or set CPU power mode (performance, balanced, power-saver)
    PowerMode {
        #[allow(missing_docs)]
        mode: Option<PowerMode>,
        /// read the sudo password from stdin instead of prompting
        #[structopt(long)]
        password_stdin: bool,
    },
    /// Show or set the screen colour temperature in Kelvin (2500 to 6500)
    Gamma {
        #[allow(missing_docs)]
        kelvin: Option<u32>,
    },
    /// Check which tools are installed
    Doctor,
    /// Refresh every domain periodically
    Watch {
        /// stop after the first refresh
        #[structopt(long)]
        once: bool,
    },
}

#[derive(StructOpt, Serialize, Deserialize, Debug)]
/// Control wifi, bluetooth, audio, brightness, battery and power settings
///
/// Every setting is read and changed through the usual command line tools
/// (nmcli, bluetoothctl, pactl, brightnessctl, upower, cpupower).
#[structopt(global_settings(&[AppSettings::ColoredHelp, AppSettings::ColorAuto]))]
pub struct Args {
    /// configuration file
    ///
    /// Will use $XDG_CONFIG_HOME/bettercontrol/config.toml if unset.
    #[serde(skip)]
    #[structopt(short, long, env = "BETTERCONTROL_CONFIG", parse(from_os_str))]
    pub config: Option<PathBuf>,

    /// default timeout of a command in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    #[structopt(long, env = "BETTERCONTROL_COMMAND_TIMEOUT")]
    pub command_timeout: Option<u64>,

    /// timeout of scan commands in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    #[structopt(long, env = "BETTERCONTROL_SCAN_TIMEOUT")]
    pub scan_timeout: Option<u64>,

    /// timeout of connection attempts in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    #[structopt(long, env = "BETTERCONTROL_CONNECT_TIMEOUT")]
    pub connect_timeout: Option<u64>,

    /// duration of bluetooth discovery in seconds (0 lists known devices only)
    #[serde(skip_serializing_if = "Option::is_none")]
    #[structopt(long, env = "BETTERCONTROL_BLUETOOTH_SCAN_SECS")]
    pub bluetooth_scan_secs: Option<u64>,

    /// quiet period before a triggered refresh, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    #[structopt(long, env = "BETTERCONTROL_DEBOUNCE_MS")]
    pub debounce_ms: Option<u64>,

    /// delay between refreshes of `watch` in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    #[structopt(long, env = "BETTERCONTROL_REFRESH_DELAY")]
    pub refresh_delay: Option<u64>,

    /// directory for the settings file
    ///
    /// Will use content of XDG_CACHE_HOME if unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[structopt(long, env = "BETTERCONTROL_STATE_DIR", parse(from_os_str))]
    pub state_dir: Option<PathBuf>,

    #[allow(missing_docs)]
    #[structopt(flatten)]
    #[serde(deserialize_with = "de_from_str", skip_serializing_if = "QuietVerbose::is_unset")]
    pub verbose: QuietVerbose,

    #[allow(missing_docs)]
    #[serde(skip)]
    #[structopt(subcommand)]
    pub cmd: Option<Command>,
}

impl Default for Args {
    fn default() -> Args {
        let res = Args {
            config: None,
            command_timeout: Some(10),
            scan_timeout: Some(15),
            connect_timeout: Some(30),
            bluetooth_scan_secs: Some(5),
            debounce_ms: Some(300),
            refresh_delay: Some(5),
            state_dir: project_dirs().map(|d| d.cache_dir().to_owned()),
            verbose: QuietVerbose::default(),
            cmd: None,
        };
        debug!("Args::default : {:#?}", res);
        res
    }
}

/// Validated configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    #[allow(missing_docs)]
    pub command_timeout: Duration,
    #[allow(missing_docs)]
    pub scan_timeout: Duration,
    #[allow(missing_docs)]
    pub connect_timeout: Duration,
    /// Zero disables discovery.
    pub bluetooth_scan: Duration,
    #[allow(missing_docs)]
    pub debounce: Duration,
    #[allow(missing_docs)]
    pub refresh_delay: Duration,
    #[allow(missing_docs)]
    pub state_dir: PathBuf,
}

impl AppConfig {
    /// Defaults with settings stored in `state_dir`.
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        AppConfig {
            command_timeout: Duration::from_secs(10),
            scan_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(30),
            bluetooth_scan: Duration::from_secs(5),
            debounce: Duration::from_millis(300),
            refresh_delay: Duration::from_secs(5),
            state_dir: state_dir.into(),
        }
    }
}

impl Args {
    /// Merge defaults, configuration file and command line parameters.
    pub fn merge_config_and_params(mut self) -> Result<Args> {
        let cmd = self.cmd.take();
        let config_file = self.config.take().or_else(default_config_file);
        let mut figment = Figment::from(Serialized::defaults(Args::default()));
        if let Some(ref file) = config_file {
            debug!("Reading configuration from {:?}", file);
            figment = figment.merge(Toml::file(file));
        }
        let mut res: Args = figment
            .merge(Serialized::defaults(self))
            .extract()
            .context("Merging configuration file and parameters")?;
        debug!("Merged config and parameters : {:#?}", res);
        res.cmd = cmd;
        res.config = config_file;
        Ok(res)
    }

    /// Check every value is defined and sensible.
    pub fn validate(&self) -> Result<AppConfig> {
        let positive = |name: &str, value: Option<u64>| -> Result<u64> {
            match value {
                None => bail!("{} is not defined", name),
                Some(0) => bail!("{} shall be greater than 0", name),
                Some(v) => Ok(v),
            }
        };
        let state_dir = self
            .state_dir
            .clone()
            .context("State directory is not defined")?;
        Ok(AppConfig {
            command_timeout: Duration::from_secs(positive("command_timeout", self.command_timeout)?),
            scan_timeout: Duration::from_secs(positive("scan_timeout", self.scan_timeout)?),
            connect_timeout: Duration::from_secs(positive("connect_timeout", self.connect_timeout)?),
            bluetooth_scan: Duration::from_secs(
                self.bluetooth_scan_secs
                    .context("bluetooth_scan_secs is not defined")?,
            ),
            debounce: Duration::from_millis(self.debounce_ms.context("debounce_ms is not defined")?),
            refresh_delay: Duration::from_secs(positive("refresh_delay", self.refresh_delay)?),
            state_dir,
        })
    }
}
