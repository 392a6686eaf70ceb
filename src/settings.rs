//! Persisted controller settings, stored as JSON.

use crate::battery_life::BatteryLifeSettings;
use crate::dynamic_ess::DynamicEssSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings parse error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub battery_life: BatteryLifeSettings,
    pub dynamic_ess: DynamicEssSettings,
}

impl Settings {
    /// Clamp every value into its allowed range.
    pub fn sanitize(&mut self) {
        self.battery_life.sanitize();
        self.dynamic_ess.sanitize();
    }
}

pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load(&self) -> Result<Settings, SettingsError> {
        if !self.path.exists() {
            let settings = Settings::default();
            self.save(&settings)?;
            return Ok(settings);
        }
        let json = std::fs::read_to_string(&self.path)?;
        let mut settings: Settings = serde_json::from_str(&json)?;
        settings.sanitize();
        Ok(settings)
    }

    pub fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(settings)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
