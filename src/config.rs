use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Modbus-TCP address of the GX device
    pub address: SocketAddr,
    pub system_unit: u8,
    pub vebus_unit: u8,
    /// First register of the Hub4 override block
    pub override_register: u16,
    pub settings_path: PathBuf,
    pub poll_interval_secs: u64,
    pub battery_life_interval_secs: u64,
    pub dynamic_ess_interval_secs: u64,
    pub force_charge_interval_secs: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 502)),
            system_unit: 100,
            vebus_unit: 227,
            override_register: 2716,
            settings_path: PathBuf::from("ve_dynamic_ess_settings.json"),
            poll_interval_secs: 5,
            battery_life_interval_secs: 15 * 60,
            dynamic_ess_interval_secs: 5,
            force_charge_interval_secs: crate::battery_life::DEFAULT_FORCE_CHARGE_INTERVAL_SECS,
        }
    }
}

impl Config {
    /// Load from `path`, falling back to defaults when the file is missing.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Config::default());
        }
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file() {
        let dir = TempDir::new().unwrap();
        assert_eq!(Config::load(dir.path().join("nope.json")).unwrap(), Config::default());
    }

    #[test]
    fn partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "address": "10.0.0.5:502", "force_charge_interval_secs": 432000 }"#,
        )
        .unwrap();
        let c = Config::load(&path).unwrap();
        assert_eq!(c.address, "10.0.0.5:502".parse().unwrap());
        assert_eq!(c.force_charge_interval_secs, 5 * 24 * 3600);
        assert_eq!(c.vebus_unit, 227);
        assert_eq!(c.battery_life_interval_secs, 900);
    }
}
