#![doc = include_str!("../README.md")]
use anyhow::{bail, Context, Result};
use std::io::BufRead;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, info};

use ::lib::audio::{self, AudioKind};
use ::lib::config::{AudioCommand, BluetoothCommand, Command, WifiCommand};
use ::lib::model::{BatteryState, Domain};
use ::lib::{
    battery, bluetooth, brightness, power, setup_tracing, watch_loop, wifi, Action, Args,
    CommandRunner, Secret, Session, ShutdownSignal, SystemCommandRunner,
};

/// Read a password from the terminal, or from the first line of stdin.
fn read_password(prompt: &str, from_stdin: bool) -> Result<Secret> {
    let password = if from_stdin {
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("Reading password from stdin")?;
        line.trim_end_matches(&['\r', '\n'][..]).to_owned()
    } else {
        rpassword::prompt_password(prompt).context("Reading password")?
    };
    Ok(Secret::new(password))
}

/// Scan `domain` and wait for the result.
fn refreshed(session: &Session, domain: Domain) {
    session.refresh(domain);
    let config = session.config();
    session.wait_idle(config.scan_timeout + config.bluetooth_scan);
}

fn print_wifi(session: &Session) {
    let snap = session.wifi.registry().get();
    let networks = snap.sorted_by(|a, b| {
        b.is_connected
            .cmp(&a.is_connected)
            .then(b.signal_percent.cmp(&a.signal_percent))
    });
    let saved = session.profiles.registry().get();
    for n in networks {
        println!(
            "{} {:<32} {:>3}% {:<5} {}",
            if n.is_connected { "*" } else { " " },
            if n.ssid.is_empty() { "<hidden>" } else { &n.ssid },
            n.signal_percent,
            n.security.to_string(),
            if saved.contains(&n.ssid) { "saved" } else { "" }
        );
    }
}

fn print_bluetooth(session: &Session) {
    let snap = session.bluetooth.registry().get();
    for d in snap.sorted_by(|a, b| b.is_connected.cmp(&a.is_connected).then(a.name.cmp(&b.name))) {
        println!(
            "{} {} {:<24} {:?}{}",
            if d.is_connected { "*" } else { " " },
            d.mac_address,
            d.name,
            d.device_class,
            if d.is_paired { " paired" } else { "" }
        );
    }
}

fn print_audio(session: &Session) {
    for (title, coordinator) in [("Outputs", &session.sinks), ("Inputs", &session.sources)] {
        println!("{}:", title);
        let snap = coordinator.registry().get();
        for d in snap.sorted_by(|a, b| a.id.cmp(&b.id)) {
            println!(
                "  {} {:<48} {:>3}%{}",
                if d.is_default { "*" } else { " " },
                d.display_name,
                d.volume_percent,
                if d.muted { " muted" } else { "" }
            );
        }
    }
    let streams = session.streams.registry().get();
    if !streams.is_empty() {
        println!("Applications:");
        for s in streams.sorted_by(|a, b| a.app_name.cmp(&b.app_name)) {
            println!("  {:<24} {:<32} {:>3}%", s.app_name, s.media_name, s.volume_percent);
        }
    }
}

fn print_batteries(session: &Session) {
    let snap = session.batteries.registry().get();
    if snap.is_empty() {
        println!("No battery");
    }
    for b in snap.sorted_by(|a, b| a.device_name.cmp(&b.device_name)) {
        let remaining = match (&b.time_remaining, b.state) {
            (Some(t), BatteryState::Charging) => format!(", full in {}", t),
            (Some(t), _) => format!(", {} left", t),
            _ => String::new(),
        };
        println!(
            "{}: {}% {:?}{} (health {:.0}%, {:.1} W, {:.1} V, {})",
            b.device_name,
            b.charge_percent,
            b.state,
            remaining,
            b.capacity_percent,
            b.power_watts,
            b.voltage,
            b.model
        );
    }
}

fn print_power(session: &Session) {
    match session.power_mode() {
        Some(mode) => println!("Power mode: {}", mode),
        None => println!("Power mode: unknown"),
    }
    match session.settings().gamma {
        Some(kelvin) => println!("Colour temperature: {}K", kelvin),
        None => println!("Colour temperature: not set"),
    }
}

fn print_status(session: &Session) {
    println!("== Wifi");
    print_wifi(session);
    println!("== Bluetooth");
    print_bluetooth(session);
    println!("== Audio");
    print_audio(session);
    println!("== Battery");
    print_batteries(session);
    println!("== Display");
    match session.brightness() {
        Ok(Some(pct)) => println!("Brightness: {}%", pct),
        Ok(None) => println!("Brightness: unavailable"),
        Err(e) => println!("Brightness: {}", e),
    }
    print_power(session);
}

fn run_wifi(session: &Session, cmd: WifiCommand) -> Result<()> {
    match cmd {
        WifiCommand::List => {
            refreshed(session, Domain::Wifi);
            print_wifi(session);
        }
        WifiCommand::Connect {
            ssid,
            password_stdin,
            no_remember,
        } => {
            refreshed(session, Domain::Wifi);
            let known = session.profiles.registry().get().contains(&ssid);
            let secured = session
                .wifi
                .registry()
                .get()
                .get(&ssid)
                .map(|n| n.security.is_secured());
            let password = if !known && secured.unwrap_or(password_stdin) {
                Some(read_password(
                    &format!("Password for {}: ", ssid),
                    password_stdin,
                )?)
            } else {
                None
            };
            session.execute(session.connect_wifi_action(&ssid, password, !no_remember))?;
            println!("Connected to {}", ssid);
        }
        WifiCommand::Disconnect { profile } => {
            session.execute(Action::DisconnectWifi { profile })?
        }
        WifiCommand::Forget { ssid } => session.execute(Action::ForgetWifi { ssid })?,
        WifiCommand::Radio { state: Some(on) } => session.execute(Action::SetWifiRadio(on))?,
        WifiCommand::Radio { state: None } => {
            let on = wifi::is_radio_enabled(session.runner())?;
            println!("Wifi radio is {}", if on { "on" } else { "off" });
        }
        WifiCommand::Speed { interface } => {
            let interface = match interface {
                Some(i) => i,
                None => wifi::wifi_device(session.runner())?.context("No wifi device")?,
            };
            let first = wifi::TrafficSample::read(&interface)?;
            sleep(Duration::from_secs(1));
            let rate = wifi::TrafficSample::read(&interface)?.rate_since(&first);
            println!(
                "{}: down {} up {}",
                interface,
                wifi::format_rate(rate.rx_per_sec),
                wifi::format_rate(rate.tx_per_sec)
            );
        }
    }
    Ok(())
}

fn run_bluetooth(session: &Session, cmd: BluetoothCommand) -> Result<()> {
    match cmd {
        BluetoothCommand::List => {
            refreshed(session, Domain::Bluetooth);
            print_bluetooth(session);
        }
        BluetoothCommand::Connect { mac } => {
            refreshed(session, Domain::Bluetooth);
            session.execute(Action::ConnectBluetooth { mac: mac.clone() })?;
            println!("Connected to {}", mac);
        }
        BluetoothCommand::Disconnect { mac } => {
            session.execute(Action::DisconnectBluetooth { mac })?
        }
        BluetoothCommand::Forget { mac } => session.execute(Action::ForgetBluetooth { mac })?,
        BluetoothCommand::Power { state: Some(on) } => {
            session.execute(Action::SetBluetoothService(on))?
        }
        BluetoothCommand::Power { state: None } => {
            let on = bluetooth::is_service_active(session.runner())?;
            println!("Bluetooth service is {}", if on { "running" } else { "stopped" });
        }
        BluetoothCommand::PairMode => {
            session.execute(Action::EnablePairingMode)?;
            println!("Discoverable and pairable");
        }
    }
    Ok(())
}

fn volume(
    session: &Session,
    kind: AudioKind,
    percent: Option<u8>,
    device: Option<String>,
) -> Result<()> {
    match (percent, device) {
        (Some(percent), device) => session.execute(Action::SetVolume {
            kind,
            device,
            percent,
        })?,
        (None, Some(device)) => {
            refreshed(session, Domain::Audio);
            let registry = match kind {
                AudioKind::Sink => session.sinks.registry(),
                AudioKind::Source => session.sources.registry(),
            };
            let snap = registry.get();
            let d = snap
                .get(&device)
                .with_context(|| format!("No {} named {}", kind, device))?;
            println!("{}%", d.volume_percent);
        }
        (None, None) => match audio::default_volume(session.runner(), kind)? {
            Some(pct) => println!("{}%", pct),
            None => bail!("Unable to read the default {} volume", kind),
        },
    }
    Ok(())
}

fn run_audio(session: &Session, cmd: AudioCommand) -> Result<()> {
    match cmd {
        AudioCommand::Status => {
            refreshed(session, Domain::Audio);
            print_audio(session);
        }
        AudioCommand::Volume { percent, device } => {
            volume(session, AudioKind::Sink, percent, device)?
        }
        AudioCommand::Mic { percent, device } => {
            volume(session, AudioKind::Source, percent, device)?
        }
        AudioCommand::Mute { mic } => session.execute(Action::SetMute {
            kind: if mic { AudioKind::Source } else { AudioKind::Sink },
            device: None,
            mute: None,
        })?,
        AudioCommand::Sink { name: Some(name) } => session.execute(Action::SetDefaultDevice {
            kind: AudioKind::Sink,
            name,
        })?,
        AudioCommand::Sink { name: None } => session.execute(Action::CycleSink)?,
        AudioCommand::App {
            app: Some(app),
            percent: Some(percent),
            media,
        } => {
            let media_name = match media {
                Some(m) => m,
                None => {
                    refreshed(session, Domain::Audio);
                    let snap = session.streams.registry().get();
                    let stream = snap
                        .records()
                        .find(|s| s.app_name == app)
                        .with_context(|| format!("{} is not playing", app))?;
                    stream.media_name.clone()
                }
            };
            session.execute(Action::SetStreamVolume {
                app_name: app,
                media_name,
                percent,
            })?
        }
        AudioCommand::App { .. } => {
            refreshed(session, Domain::Audio);
            for s in session
                .streams
                .registry()
                .get()
                .sorted_by(|a, b| a.app_name.cmp(&b.app_name))
            {
                println!("{:<24} {:<32} {:>3}%", s.app_name, s.media_name, s.volume_percent);
            }
        }
    }
    Ok(())
}

/// Every program the actions and scans may spawn.
const TOOLS: [&str; 10] = [
    wifi::NMCLI,
    bluetooth::BLUETOOTHCTL,
    bluetooth::SYSTEMCTL,
    audio::PACTL,
    brightness::BRIGHTNESSCTL,
    battery::UPOWER,
    power::CPUPOWER,
    power::SUDO,
    power::GAMMASTEP,
    power::PKILL,
];

fn doctor(session: &Session, args: &Args) -> Result<()> {
    let mut missing = 0;
    for tool in TOOLS {
        let found = session.runner().is_available(tool);
        if !found {
            missing += 1;
        }
        println!("{:<14} {}", tool, if found { "ok" } else { "missing" });
    }
    println!();
    println!("# Effective configuration");
    print!(
        "{}",
        toml::to_string(args).context("Serializing configuration")?
    );
    if missing > 0 {
        info!("{} tools missing, related actions will fail", missing);
    }
    Ok(())
}

#[paw::main]
fn main(args: Args) -> Result<()> {
    let args = args.merge_config_and_params()?;
    setup_tracing(&args)?;
    let config = args.validate()?;
    debug!("Configuration: {:#?}", config);
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new(config.command_timeout));
    let session = Session::new(runner, config)?;

    match args.cmd.clone().unwrap_or(Command::Status) {
        Command::Status => {
            session.refresh_all();
            let config = session.config();
            session.wait_idle(config.scan_timeout + config.bluetooth_scan);
            print_status(&session);
        }
        Command::Wifi(cmd) => run_wifi(&session, cmd)?,
        Command::Bt(cmd) => run_bluetooth(&session, cmd)?,
        Command::Audio(cmd) => run_audio(&session, cmd)?,
        Command::Brightness { percent: Some(pct) } => {
            session.execute(Action::SetBrightness(pct))?
        }
        Command::Brightness { percent: None } => match session.brightness()? {
            Some(pct) => println!("{}%", pct),
            None => bail!("No backlight found"),
        },
        Command::Battery => {
            refreshed(&session, Domain::Battery);
            print_batteries(&session);
        }
        Command::PowerMode {
            mode: Some(mode),
            password_stdin,
        } => {
            let password = read_password("[sudo] password: ", password_stdin)?;
            session.execute(Action::SetPowerMode { mode, password })?;
            println!("Power mode: {}", mode);
        }
        Command::PowerMode { mode: None, .. } | Command::Gamma { kelvin: None } => {
            print_power(&session)
        }
        Command::Gamma {
            kelvin: Some(kelvin),
        } => session.execute(Action::SetColorTemperature(kelvin))?,
        Command::Doctor => doctor(&session, &args)?,
        Command::Watch { once } => {
            let shutdown = ShutdownSignal::new();
            watch_loop(&session, &shutdown, once, |session, _events| {
                print_status(session);
                println!();
                Ok(())
            })?;
        }
    }
    Ok(())
}
