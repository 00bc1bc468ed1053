//! Parse pactl output.
use crate::model::ApplicationStreamRecord;
use tracing::trace;

/// Application name used when a stream does not advertise one.
pub const UNKNOWN_APPLICATION: &str = "Unknown Application";
/// Media name used when a stream does not advertise one.
pub const UNKNOWN_MEDIA: &str = "Unknown Media";

/// Parse `pactl list short sinks|sources` into `(index, name)` pairs.
///
/// Columns are tab separated: index, name, module, sample spec, state.
pub fn parse_short_list(stdout: &str) -> Vec<(u32, String)> {
    stdout
        .lines()
        .filter_map(|l| {
            let mut cols = l.split('\t');
            let index = cols.next()?.trim().parse().ok()?;
            let name = cols.next()?.trim();
            if name.is_empty() {
                trace!("Skipping pactl line {:?}", l);
                return None;
            }
            Some((index, name.to_owned()))
        })
        .collect()
}

/// First percentage of a `Volume:` line.
///
/// `Volume: front-left: 32768 /  50% / -18.06 dB,   front-right: ...` gives 50.
pub fn parse_volume(stdout: &str) -> Option<u8> {
    stdout
        .split('/')
        .map(str::trim)
        .find_map(|seg| seg.strip_suffix('%')?.trim().parse::<u32>().ok())
        .map(|v| v.min(100) as u8)
}

/// `Mute: yes` / `Mute: no`.
pub fn parse_mute(stdout: &str) -> bool {
    stdout
        .lines()
        .find_map(|l| l.trim().strip_prefix("Mute:"))
        .map(|v| v.trim().eq_ignore_ascii_case("yes"))
        .unwrap_or(false)
}

/// `key = "value"` property line.
fn property<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let (k, v) = line.split_once('=')?;
    if k.trim() == key {
        Some(v.trim().trim_matches('"'))
    } else {
        None
    }
}

/// Parse `pactl list sink-inputs`.
///
/// Missing names default to [`UNKNOWN_APPLICATION`] / [`UNKNOWN_MEDIA`],
/// a missing volume to 0.
pub fn parse_sink_inputs(stdout: &str) -> Vec<ApplicationStreamRecord> {
    stdout
        .split("Sink Input #")
        .skip(1)
        .filter_map(|block| {
            let mut lines = block.lines();
            let stream_id = lines.next()?.trim();
            if stream_id.is_empty() || !stream_id.chars().all(|c| c.is_ascii_digit()) {
                trace!("Skipping sink input block {:?}", stream_id);
                return None;
            }
            let mut rec = ApplicationStreamRecord {
                stream_id: stream_id.to_owned(),
                app_name: UNKNOWN_APPLICATION.to_owned(),
                media_name: UNKNOWN_MEDIA.to_owned(),
                volume_percent: 0,
            };
            let mut volume_seen = false;
            for line in lines {
                if let Some(v) = property(line, "application.name") {
                    rec.app_name = v.to_owned();
                } else if let Some(v) = property(line, "media.name") {
                    rec.media_name = v.to_owned();
                } else if !volume_seen && line.trim_start().starts_with("Volume:") {
                    volume_seen = true;
                    rec.volume_percent = parse_volume(line).unwrap_or(0);
                }
            }
            Some(rec)
        })
        .collect()
}
