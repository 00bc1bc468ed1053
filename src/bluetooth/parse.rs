//! Parse bluetoothctl and systemctl output.
use crate::model::{BluetoothDeviceRecord, DeviceClass};
use tracing::trace;

/// Map a device `Icon:` value to a [`DeviceClass`].
pub fn classify_icon(icon: &str) -> DeviceClass {
    if icon.contains("phone") && !icon.contains("headphone") {
        DeviceClass::Phone
    } else if icon.contains("computer") {
        DeviceClass::Computer
    } else if icon.contains("audio") || icon.contains("headset") || icon.contains("headphone") {
        DeviceClass::Audio
    } else if icon.contains("input") {
        DeviceClass::Input
    } else {
        DeviceClass::Unknown
    }
}

/// One line of `bluetoothctl devices`: `Device AA:BB:CC:DD:EE:FF Name with spaces`.
///
/// Returns the address and the name (the address when the name is missing).
pub fn parse_device_line(line: &str) -> Option<(String, String)> {
    let mut parts = line.trim().splitn(3, ' ');
    if parts.next()? != "Device" {
        return None;
    }
    let mac = parts.next().filter(|m| m.matches(':').count() == 5)?;
    let name = parts
        .next()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(mac);
    Some((mac.to_owned(), name.to_owned()))
}

/// Parse `bluetoothctl devices`.
pub fn parse_devices(stdout: &str) -> Vec<(String, String)> {
    stdout
        .lines()
        .filter_map(|l| {
            let res = parse_device_line(l);
            if res.is_none() && !l.trim().is_empty() {
                trace!("Skipping bluetooth line {:?}", l);
            }
            res
        })
        .collect()
}

/// Value of `key:` in `bluetoothctl info` output.
fn info_value<'a>(stdout: &'a str, key: &str) -> Option<&'a str> {
    stdout.lines().find_map(|l| {
        let (k, v) = l.trim().split_once(':')?;
        if k.trim() == key {
            Some(v.trim())
        } else {
            None
        }
    })
}

/// Build a record from `bluetoothctl info <mac>`.
///
/// `name` comes from `bluetoothctl devices` and is used when `info` has none.
pub fn parse_info(mac: &str, name: &str, stdout: &str) -> BluetoothDeviceRecord {
    let yes = |key: &str| info_value(stdout, key) == Some("yes");
    BluetoothDeviceRecord {
        mac_address: mac.to_owned(),
        name: info_value(stdout, "Alias")
            .or_else(|| info_value(stdout, "Name"))
            .filter(|n| !n.is_empty())
            .unwrap_or(name)
            .to_owned(),
        is_paired: yes("Paired"),
        is_connected: yes("Connected"),
        device_class: info_value(stdout, "Icon")
            .map(classify_icon)
            .unwrap_or_default(),
    }
}

/// `systemctl is-active bluetooth` prints `active` when running.
pub fn parse_service_active(stdout: &str) -> bool {
    stdout.trim() == "active"
}

#[cfg(test)]
mod tests {
    use super::*;
    mod should {
        use super::*;
        use test_log::test;

        const INFO: &str = "\
Device 00:1B:66:AA:BB:CC (public)
	Name: WH-1000XM4
	Alias: My Headphones
	Class: 0x00240404
	Icon: audio-card
	Paired: yes
	Bonded: yes
	Trusted: yes
	Blocked: no
	Connected: yes
	LegacyPairing: no
	UUID: Audio Sink                (0000110b-0000-1000-8000-00805f9b34fb)
";

        #[test]
        fn parse_audio_device_info() {
            let rec = parse_info("00:1B:66:AA:BB:CC", "WH-1000XM4", INFO);
            assert_eq!(rec.device_class, DeviceClass::Audio);
            assert!(rec.is_connected);
            assert!(rec.is_paired);
            assert_eq!(rec.name, "My Headphones");
        }

        #[test]
        fn default_to_unknown_and_disconnected() {
            let rec = parse_info("AA:AA:AA:AA:AA:AA", "Thing", "Device AA:AA:AA:AA:AA:AA not available\n");
            assert_eq!(rec.device_class, DeviceClass::Unknown);
            assert!(!rec.is_connected);
            assert!(!rec.is_paired);
            assert_eq!(rec.name, "Thing");
        }

        #[test]
        fn classify_icons() {
            assert_eq!(classify_icon("phone"), DeviceClass::Phone);
            assert_eq!(classify_icon("computer"), DeviceClass::Computer);
            assert_eq!(classify_icon("audio-headset"), DeviceClass::Audio);
            assert_eq!(classify_icon("audio-headphones"), DeviceClass::Audio);
            assert_eq!(classify_icon("input-mouse"), DeviceClass::Input);
            assert_eq!(classify_icon("camera-video"), DeviceClass::Unknown);
        }

        #[test]
        fn parse_device_list_and_skip_noise() {
            let out = "\
Device 11:22:33:44:55:66 Pixel 7
Device AA:BB:CC:DD:EE:FF
[CHG] Controller 00:00:00:00:00:00 Discovering: no
Device broken
";
            assert_eq!(
                parse_devices(out),
                vec![
                    ("11:22:33:44:55:66".to_string(), "Pixel 7".to_string()),
                    ("AA:BB:CC:DD:EE:FF".to_string(), "AA:BB:CC:DD:EE:FF".to_string()),
                ]
            );
            assert!(parse_devices("").is_empty());
        }

        #[test]
        fn read_service_state() {
            assert!(parse_service_active("active\n"));
            assert!(!parse_service_active("inactive\n"));
            assert!(!parse_service_active(""));
        }
    }
}
