//! Configuration - `config.json` in GOODSLEEP_HOME

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Shortest period a timer is ever armed with
pub(crate) const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Get GOODSLEEP_HOME directory, creating it if needed
pub fn goodsleep_home() -> Result<PathBuf, StorageError> {
    let home = match std::env::var("GOODSLEEP_HOME") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => dirs::home_dir()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no home directory")
            })?
            .join(".goodsleep"),
    };

    if !home.exists() {
        fs::create_dir_all(&home)?;
    }

    Ok(home)
}

/// Tunables of the commissioning engine
///
/// Durations are stored as integer milliseconds. Missing fields take their
/// defaults, so an old config file keeps working.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommissionConfig {
    /// Case-sensitive substring an advertised name must contain
    pub name_pattern: String,
    /// Leading tag of the provisioning command
    pub product_tag: String,
    #[serde(with = "millis")]
    pub scan_window: Duration,
    #[serde(with = "millis")]
    pub scan_tick: Duration,
    pub scan_attempts: u32,
    #[serde(with = "millis")]
    pub status_timeout: Duration,
    #[serde(with = "millis")]
    pub liveness_interval: Duration,
    #[serde(with = "millis")]
    pub liveness_call_timeout: Duration,
    pub five_ghz_threshold_mhz: u32,
    #[serde(with = "millis")]
    pub network_poll_interval: Duration,
    /// Base URL of the device status service
    pub liveness_url: Option<String>,
}

impl Default for CommissionConfig {
    fn default() -> Self {
        Self {
            name_pattern: goodsleep_proto::ble::DEVICE_NAME_PATTERN.to_string(),
            product_tag: goodsleep_proto::PRODUCT_TAG.to_string(),
            scan_window: Duration::from_secs(2),
            scan_tick: Duration::from_millis(500),
            scan_attempts: 3,
            status_timeout: Duration::from_secs(15),
            liveness_interval: Duration::from_secs(5),
            liveness_call_timeout: Duration::from_secs(5),
            five_ghz_threshold_mhz: crate::wifi::DEFAULT_FIVE_GHZ_THRESHOLD_MHZ,
            network_poll_interval: Duration::from_secs(3),
            liveness_url: None,
        }
    }
}

impl CommissionConfig {
    /// Load `<home>/config.json`, writing the defaults there if it is missing
    pub fn load_or_default(home: &Path) -> Result<Self, StorageError> {
        let path = home.join("config.json");
        if path.exists() {
            let data = fs::read_to_string(&path)?;
            let config: Self = serde_json::from_str(&data)?;
            config.validate()?;
            return Ok(config);
        }

        let config = Self::default();
        config.save(home)?;
        log::info!("wrote default configuration to {}", path.display());
        Ok(config)
    }

    /// Reject periods and timeouts of zero, which no timer can run on
    pub fn validate(&self) -> Result<(), StorageError> {
        let periods = [
            ("scan_tick", self.scan_tick),
            ("status_timeout", self.status_timeout),
            ("liveness_interval", self.liveness_interval),
            ("liveness_call_timeout", self.liveness_call_timeout),
            ("network_poll_interval", self.network_poll_interval),
        ];
        match periods.iter().find(|(_, d)| d.is_zero()) {
            Some((name, _)) => Err(StorageError::InvalidConfig(format!("{name} must be greater than zero"))),
            None => Ok(()),
        }
    }

    pub fn save(&self, home: &Path) -> Result<(), StorageError> {
        fs::create_dir_all(home)?;
        fs::write(home.join("config.json"), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where S: Serializer {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where D: Deserializer<'de> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
