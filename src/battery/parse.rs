//! Parse upower output.
use crate::model::{BatteryRecord, BatteryState};

/// Text used for missing categorical values.
pub const UNKNOWN: &str = "Unknown";

/// Battery object paths from `upower -e`.
pub fn parse_battery_paths(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| l.contains("BAT"))
        .map(str::to_owned)
        .collect()
}

fn value<'a>(stdout: &'a str, key: &str) -> Option<&'a str> {
    stdout.lines().find_map(|l| {
        let (k, v) = l.split_once(':')?;
        if k.trim() == key {
            Some(v.trim())
        } else {
            None
        }
    })
}

/// Leading number of `"87.5%"`, `"12.3 W"` or `"11.9 V"`.
fn number(v: &str) -> Option<f32> {
    let end = v
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .unwrap_or(v.len());
    v[..end].parse().ok()
}

fn parse_state(v: &str) -> BatteryState {
    match v {
        "charging" | "pending-charge" => BatteryState::Charging,
        "discharging" | "pending-discharge" => BatteryState::Discharging,
        "fully-charged" => BatteryState::Full,
        _ => BatteryState::Unknown,
    }
}

/// Build a record from `upower -i <path>`.
pub fn parse_battery_info(path: &str, stdout: &str) -> BatteryRecord {
    let num = |key: &str| value(stdout, key).and_then(number).unwrap_or(0.0);
    BatteryRecord {
        device_name: path.rsplit('/').next().unwrap_or(path).to_owned(),
        charge_percent: num("percentage").clamp(0.0, 100.0).round() as u8,
        state: value(stdout, "state").map(parse_state).unwrap_or_default(),
        time_remaining: value(stdout, "time to empty")
            .or_else(|| value(stdout, "time to full"))
            .filter(|v| !v.is_empty())
            .map(str::to_owned),
        capacity_percent: num("capacity"),
        power_watts: num("energy-rate"),
        voltage: num("voltage"),
        model: value(stdout, "model")
            .filter(|v| !v.is_empty())
            .unwrap_or(UNKNOWN)
            .to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    mod should {
        use super::*;
        use test_log::test;

        const INFO: &str = "\
  native-path:          BAT0
  vendor:               SMP
  model:                5B10W13930
  power supply:         yes
  updated:              Sat 17 Oct 2026 10:00:00 CEST (12 seconds ago)
  has history:          yes
  battery
    present:             yes
    rechargeable:        yes
    state:               discharging
    warning-level:       none
    energy:              38.2 Wh
    energy-rate:         7.431 W
    voltage:             11.86 V
    time to empty:       5.1 hours
    percentage:          76%
    capacity:            88.6415%
    technology:          lithium-polymer
";

        #[test]
        fn parse_full_info() {
            let rec = parse_battery_info("/org/freedesktop/UPower/devices/battery_BAT0", INFO);
            assert_eq!(rec.device_name, "battery_BAT0");
            assert_eq!(rec.charge_percent, 76);
            assert_eq!(rec.state, BatteryState::Discharging);
            assert_eq!(rec.time_remaining.as_deref(), Some("5.1 hours"));
            assert!((rec.capacity_percent - 88.6415).abs() < 0.001);
            assert!((rec.power_watts - 7.431).abs() < 0.001);
            assert!((rec.voltage - 11.86).abs() < 0.001);
            assert_eq!(rec.model, "5B10W13930");
        }

        #[test]
        fn default_missing_fields() {
            let rec = parse_battery_info("battery_BAT1", "garbage\n");
            assert_eq!(rec.device_name, "battery_BAT1");
            assert_eq!(rec.charge_percent, 0);
            assert_eq!(rec.state, BatteryState::Unknown);
            assert_eq!(rec.time_remaining, None);
            assert_eq!(rec.model, UNKNOWN);
        }

        #[test]
        fn charging_and_full_states() {
            assert_eq!(parse_state("charging"), BatteryState::Charging);
            assert_eq!(parse_state("fully-charged"), BatteryState::Full);
            assert_eq!(parse_state("empty"), BatteryState::Unknown);
        }

        #[test]
        fn only_batteries_are_listed() {
            let out = "\
/org/freedesktop/UPower/devices/line_power_AC
/org/freedesktop/UPower/devices/battery_BAT0
/org/freedesktop/UPower/devices/mouse_hidpp_battery_0
/org/freedesktop/UPower/devices/DisplayDevice
";
            assert_eq!(
                parse_battery_paths(out),
                ["/org/freedesktop/UPower/devices/battery_BAT0"]
            );
            assert!(parse_battery_paths("").is_empty());
        }
    }
}
