//! Values remembered between runs: last power mode and colour temperature.
use crate::model::PowerMode;
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the file inside the state directory.
pub const SETTINGS_FILE: &str = "settings.json";

/// Location of the persisted settings.
#[derive(Debug, Clone)]
pub struct Cache {
    path: PathBuf,
}

impl Cache {
    /// Create a cache at location `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Cache file inside `dir`, creating the directory if needed.
    pub fn in_dir(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("Creating state dir {:?}", dir))?;
        Ok(Self::new(dir.join(SETTINGS_FILE)))
    }

    #[allow(missing_docs)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Persisted settings.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Settings {
    /// Last power mode applied successfully.
    #[serde(default)]
    pub power_mode: Option<PowerMode>,
    /// Last colour temperature in Kelvin.
    #[serde(default)]
    pub gamma: Option<u32>,
    #[serde(default)]
    timestamp: i64,
}

impl Settings {
    /// Read settings from `cache`, defaults when the file does not exist yet.
    pub fn load(cache: &Cache) -> Result<Self> {
        let json = match fs::read_to_string(&cache.path) {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No settings in {:?} yet", cache.path);
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Reading settings file {:?}", cache.path))
            }
        };
        let res: Settings = serde_json::from_str(&json).with_context(|| {
            format!(
                "Unable to deserialize settings file {:?} (try to remove it)",
                &cache.path
            )
        })?;
        debug!("Loaded settings {:?}", res);
        Ok(res)
    }

    /// Remember `mode` and persist.
    pub fn set_power_mode(&mut self, mode: PowerMode, cache: &Cache) -> Result<()> {
        info!("Remembering power mode {}", mode);
        self.power_mode = Some(mode);
        self.save(cache)
    }

    /// Remember `kelvin` and persist.
    pub fn set_gamma(&mut self, kelvin: u32, cache: &Cache) -> Result<()> {
        info!("Remembering colour temperature {}K", kelvin);
        self.gamma = Some(kelvin);
        self.save(cache)
    }

    /// When the settings were last written.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        if self.timestamp == 0 {
            return None;
        }
        Utc.timestamp_opt(self.timestamp, 0).single()
    }

    fn save(&mut self, cache: &Cache) -> Result<()> {
        self.timestamp = Utc::now().timestamp();
        let json = serde_json::to_string_pretty(&self).context("Serializing settings")?;
        // Write aside then rename, so a crash never leaves half a file.
        let tmp = cache.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("Writing to {:?}", tmp))?;
        fs::rename(&tmp, &cache.path)
            .with_context(|| format!("Writing to settings file {:?}", cache.path))?;
        Ok(())
    }
}

#[cfg(test)]
mod should {
    use super::*;
    use mktemp::Temp;
    use test_log::test;

    #[test]
    fn remember_settings() -> Result<()> {
        let temp = Temp::new_dir()?;
        let cache = Cache::in_dir(&temp.to_path_buf())?;
        let mut settings = Settings::load(&cache)?;
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.updated_at(), None);

        settings.set_power_mode(PowerMode::PowerSaver, &cache)?;
        settings.set_gamma(4500, &cache)?;
        let settings = Settings::load(&cache)?;
        assert_eq!(settings.power_mode, Some(PowerMode::PowerSaver));
        assert_eq!(settings.gamma, Some(4500));
        assert!(settings.updated_at().is_some());
        Ok(())
    }

    #[test]
    fn store_power_mode_in_kebab_case() -> Result<()> {
        let temp = Temp::new_dir()?;
        let cache = Cache::in_dir(&temp.to_path_buf())?;
        Settings::default().set_power_mode(PowerMode::PowerSaver, &cache)?;
        let json = fs::read_to_string(cache.path())?;
        assert!(json.contains("\"power-saver\""), "{}", json);
        Ok(())
    }

    #[test]
    fn accept_partial_files() -> Result<()> {
        let temp = Temp::new_dir()?;
        let cache = Cache::in_dir(&temp.to_path_buf())?;
        fs::write(cache.path(), r#"{"gamma": 3500}"#)?;
        let settings = Settings::load(&cache)?;
        assert_eq!(settings.gamma, Some(3500));
        assert_eq!(settings.power_mode, None);
        Ok(())
    }

    #[test]
    fn hint_at_removal_of_corrupt_file() -> Result<()> {
        let temp = Temp::new_dir()?;
        let cache = Cache::in_dir(&temp.to_path_buf())?;
        fs::write(cache.path(), "{not json")?;
        let err = Settings::load(&cache).unwrap_err();
        assert!(format!("{:#}", err).contains("try to remove it"));
        Ok(())
    }
}
