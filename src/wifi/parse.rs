//! Parse nmcli output.
//!
//! The network list comes from the tabular output of
//! `nmcli -f IN-USE,BSSID,SSID,MODE,CHAN,RATE,SIGNAL,BARS,SECURITY dev wifi list`.
//! Columns are located with the header line, as SSIDs may contain spaces.
//! Lines without a header (or not matching it) fall back to a token based
//! extraction anchored on the BSSID and the MODE column.
use crate::model::{NetworkRecord, SavedProfile, Security};
use std::collections::HashMap;
use tracing::trace;

/// Field list given to `nmcli -f` for the network list.
pub const LIST_FIELDS: &str = "IN-USE,BSSID,SSID,MODE,CHAN,RATE,SIGNAL,BARS,SECURITY";

const MODES: [&str; 5] = ["infra", "infrastructure", "ad-hoc", "adhoc", "mesh"];

/// Classify security, most specific first. No known marker means `Open`.
pub fn classify_security(text: &str) -> Security {
    if text.contains("WPA3") {
        Security::Wpa3
    } else if text.contains("WPA2") {
        Security::Wpa2
    } else if text.contains("WPA") {
        Security::Wpa
    } else if text.contains("WEP") {
        Security::Wep
    } else {
        Security::Open
    }
}

fn parse_signal(s: &str) -> u8 {
    s.trim().parse::<u32>().map(|v| v.min(100) as u8).unwrap_or(0)
}

/// nmcli shows `--` for hidden networks.
fn normalize_ssid(s: &str) -> String {
    let s = s.trim();
    if s == "--" {
        String::new()
    } else {
        s.to_owned()
    }
}

/// Start offsets (in chars) of the header columns.
#[derive(Debug)]
struct Columns {
    starts: Vec<(String, usize)>,
}

impl Columns {
    fn from_header(line: &str) -> Option<Self> {
        let chars: Vec<char> = line.chars().collect();
        let mut starts = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            if chars[i].is_whitespace() {
                i += 1;
                continue;
            }
            let start = i;
            while i < chars.len() && !chars[i].is_whitespace() {
                i += 1;
            }
            starts.push((chars[start..i].iter().collect::<String>(), start));
        }
        let has = |name: &str| starts.iter().any(|(n, _)| n == name);
        if has("SSID") && has("SIGNAL") {
            Some(Self { starts })
        } else {
            None
        }
    }

    fn split(&self, line: &str) -> HashMap<&str, String> {
        let chars: Vec<char> = line.chars().collect();
        let mut res = HashMap::new();
        for (idx, (name, start)) in self.starts.iter().enumerate() {
            let end = self
                .starts
                .get(idx + 1)
                .map(|(_, s)| *s)
                .unwrap_or(chars.len())
                .min(chars.len());
            let value: String = if *start < end {
                chars[*start..end].iter().collect()
            } else {
                String::new()
            };
            res.insert(name.as_str(), value.trim().to_owned());
        }
        res
    }

    fn parse(&self, line: &str) -> Option<NetworkRecord> {
        let fields = self.split(line);
        let bssid = fields.get("BSSID").cloned().unwrap_or_default();
        // Column drift (wide chars in SSID) shows up as a BSSID that is not a MAC.
        if !bssid.is_empty() && bssid.matches(':').count() != 5 {
            return None;
        }
        let security = fields
            .get("SECURITY")
            .map(|s| classify_security(s))
            .unwrap_or_else(|| classify_security(line));
        Some(NetworkRecord {
            ssid: normalize_ssid(fields.get("SSID").map(String::as_str).unwrap_or("")),
            bssid,
            is_connected: fields.get("IN-USE").map(|s| s == "*").unwrap_or(false),
            security,
            signal_percent: fields.get("SIGNAL").map(|s| parse_signal(s)).unwrap_or(0),
        })
    }
}

fn looks_like_mac(s: &str) -> bool {
    s.contains(':') && s.chars().all(|c| c.is_ascii_hexdigit() || c == ':')
}

/// Token based extraction of one network line.
///
/// `* aa:bb:cc AttDomain infrastructure 6 54 Mbit/s 80 WPA2`
fn parse_tokens(line: &str) -> Option<NetworkRecord> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let is_connected = tokens.first() == Some(&"*");
    let rest = if is_connected { &tokens[1..] } else { &tokens[..] };
    let (bssid, rest) = match rest.split_first() {
        Some((b, rest)) if looks_like_mac(b) => (b.to_string(), rest),
        _ => return None,
    };
    if rest.is_empty() {
        return None;
    }
    let mode = rest
        .iter()
        .skip(1)
        .position(|t| MODES.contains(&t.to_ascii_lowercase().as_str()))
        .map(|p| p + 1);
    let (ssid, after_mode) = match mode {
        Some(m) => (rest[..m].join(" "), &rest[m + 1..]),
        None => (rest[0].to_string(), &rest[1..]),
    };
    // CHAN, RATE value, RATE unit, SIGNAL: signal follows the rate unit.
    let signal_percent = after_mode
        .iter()
        .position(|t| t.ends_with("/s"))
        .and_then(|p| after_mode.get(p + 1))
        .map(|s| parse_signal(s))
        .unwrap_or(0);
    Some(NetworkRecord {
        ssid: normalize_ssid(&ssid),
        bssid,
        is_connected,
        security: classify_security(line),
        signal_percent,
    })
}

/// Parse the network list. Never fails, unparseable lines are skipped.
pub fn parse_networks(stdout: &str) -> Vec<NetworkRecord> {
    let mut lines = stdout.lines().filter(|l| !l.trim().is_empty()).peekable();
    let columns = lines.peek().and_then(|l| Columns::from_header(l));
    if columns.is_some() {
        lines.next();
    }
    lines
        .filter_map(|line| {
            let res = columns
                .as_ref()
                .and_then(|c| c.parse(line))
                .or_else(|| parse_tokens(line));
            if res.is_none() {
                trace!("Skipping wifi line {:?}", line);
            }
            res
        })
        .collect()
}

/// Keep one record per SSID: the connected one, else the strongest.
pub fn dedupe_networks(networks: Vec<NetworkRecord>) -> Vec<NetworkRecord> {
    let mut res: Vec<NetworkRecord> = Vec::with_capacity(networks.len());
    for net in networks {
        match res.iter_mut().find(|n| n.ssid == net.ssid) {
            Some(existing) => {
                if (net.is_connected, net.signal_percent)
                    > (existing.is_connected, existing.signal_percent)
                {
                    *existing = net;
                }
            }
            None => res.push(net),
        }
    }
    res
}

/// Split one line of `nmcli -t` output, honouring `\:` and `\\` escapes.
pub fn split_terse(line: &str) -> Vec<String> {
    let mut res = vec![String::new()];
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    if let Some(last) = res.last_mut() {
                        last.push(next);
                    }
                }
            }
            ':' => res.push(String::new()),
            c => {
                if let Some(last) = res.last_mut() {
                    last.push(c);
                }
            }
        }
    }
    res
}

/// Parse `nmcli -t -f NAME,TYPE connection show`.
pub fn parse_profiles(stdout: &str) -> Vec<SavedProfile> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| {
            let mut fields = split_terse(l).into_iter();
            let name = fields.next().filter(|n| !n.is_empty())?;
            let kind = fields.next().unwrap_or_default();
            Some(SavedProfile { name, kind })
        })
        .collect()
}

/// Name of the first wifi profile in `nmcli -t -f NAME,TYPE connection show --active`.
pub fn parse_active_wifi(stdout: &str) -> Option<String> {
    parse_profiles(stdout)
        .into_iter()
        .find(SavedProfile::is_wifi)
        .map(|p| p.name)
}

/// First wifi interface in `nmcli -t -f DEVICE,TYPE device`.
pub fn parse_wifi_device(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|l| {
        let fields = split_terse(l);
        match fields.as_slice() {
            [device, kind, ..] if kind == "wifi" && !device.is_empty() => Some(device.clone()),
            _ => None,
        }
    })
}

/// `nmcli radio wifi` prints `enabled` or `disabled`.
pub fn parse_radio(stdout: &str) -> bool {
    stdout.trim() == "enabled"
}

/// Parse a `/sys/class/net/*/statistics/*_bytes` counter.
pub fn parse_counter(content: &str) -> Option<u64> {
    content.trim().parse().ok()
}
