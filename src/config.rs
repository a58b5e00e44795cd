//! Runtime configuration of the headset core.
//!
//! Every field has a default, so an empty JSON object (`{}`) is a valid
//! configuration. Durations are stored as plain integers so the file stays
//! readable; use the accessor methods to get [`Duration`]s.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::{self, is_qr_code};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Substring (case-insensitive) a headset's BLE name must contain.
    pub name_prefix: String,
    /// Ask the headset to open its A2DP audio link once BLE is up.
    pub audio_pairing: bool,
    /// Serial number → QR code. Used to register the external name and to
    /// recognise QR-named audio outputs.
    pub qr_codes: HashMap<String, String>,
    /// Scale applied to every accelerometer axis.
    pub accelerometer_scale: f32,

    pub connection_timeout_secs: u64,
    pub oad_transfer_timeout_secs: u64,
    pub a2dp_timeout_secs: u64,
    pub finalize_retry_secs: u64,
    pub external_name_timeout_secs: u64,
    pub battery_poll_interval_secs: u64,
    pub identity_wait_timeout_secs: u64,
    pub identity_poll_step_ms: u64,
    pub oad_block_pacing_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            name_prefix: protocol::BLE_NAME_PREFIX.to_string(),
            audio_pairing: false,
            qr_codes: HashMap::new(),
            accelerometer_scale: 1.0,
            connection_timeout_secs: protocol::CONNECTION_TIMEOUT.as_secs(),
            oad_transfer_timeout_secs: protocol::OAD_TRANSFER_TIMEOUT.as_secs(),
            a2dp_timeout_secs: protocol::A2DP_CONNECTION_TIMEOUT.as_secs(),
            finalize_retry_secs: protocol::FINALIZE_CONNECTION_RETRY.as_secs(),
            external_name_timeout_secs: protocol::EXTERNAL_NAME_TIMEOUT.as_secs(),
            battery_poll_interval_secs: protocol::BATTERY_POLL_INTERVAL.as_secs(),
            identity_wait_timeout_secs: protocol::IDENTITY_WAIT_TIMEOUT.as_secs(),
            identity_poll_step_ms: protocol::IDENTITY_POLL_STEP.as_millis() as u64,
            oad_block_pacing_ms: protocol::OAD_BLOCK_PACING.as_millis() as u64,
        }
    }
}

impl CoreConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid core configuration")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn oad_transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.oad_transfer_timeout_secs)
    }

    pub fn a2dp_timeout(&self) -> Duration {
        Duration::from_secs(self.a2dp_timeout_secs)
    }

    pub fn finalize_retry(&self) -> Duration {
        Duration::from_secs(self.finalize_retry_secs)
    }

    pub fn external_name_timeout(&self) -> Duration {
        Duration::from_secs(self.external_name_timeout_secs)
    }

    pub fn battery_poll_interval(&self) -> Duration {
        Duration::from_secs(self.battery_poll_interval_secs)
    }

    pub fn identity_poll_step(&self) -> Duration {
        Duration::from_millis(self.identity_poll_step_ms.max(1))
    }

    pub fn oad_block_pacing(&self) -> Duration {
        Duration::from_millis(self.oad_block_pacing_ms)
    }

    /// Number of identity poll ticks before giving up.
    pub fn identity_poll_limit(&self) -> u32 {
        let step = self.identity_poll_step_ms.max(1);
        ((self.identity_wait_timeout_secs * 1000) / step).max(1) as u32
    }

    pub fn qr_code_for(&self, serial: &str) -> Option<&str> {
        self.qr_codes.get(serial).map(String::as_str)
    }

    pub fn serial_for_qr_code(&self, qr_code: &str) -> Option<&str> {
        self.qr_codes
            .iter()
            .find(|(_, qr)| qr.as_str() == qr_code)
            .map(|(serial, _)| serial.as_str())
    }

    /// Serial number carried by an audio output name.
    ///
    /// `audio_2100123` and `melo_2100123` carry it after the last `_`; a QR
    /// code name is mapped back through [`CoreConfig::qr_codes`].
    pub fn serial_from_audio_name(&self, name: &str) -> Option<String> {
        let lower = name.to_lowercase();
        if protocol::AUDIO_NAME_PREFIXES.iter().any(|p| lower.starts_with(p)) {
            return name
                .rsplit('_')
                .next()
                .filter(|s| !s.is_empty())
                .map(str::to_owned);
        }
        if is_qr_code(name) {
            return self.serial_for_qr_code(name).map(str::to_owned);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_object_is_default() {
        let config = CoreConfig::from_json_str("{}").unwrap();
        assert_eq!(config, CoreConfig::default());
        assert_eq!(config.connection_timeout(), Duration::from_secs(20));
        assert_eq!(config.identity_poll_limit(), 240);
        assert_eq!(config.oad_block_pacing(), Duration::from_millis(6));
    }

    #[test]
    fn partial_override() {
        let config = CoreConfig::from_json_str(
            r#"{"audio_pairing": true, "qr_codes": {"2100123": "MM10000123"}}"#,
        )
        .unwrap();
        assert!(config.audio_pairing);
        assert_eq!(config.qr_code_for("2100123"), Some("MM10000123"));
        assert_eq!(config.serial_for_qr_code("MM10000123"), Some("2100123"));
        assert_eq!(config.name_prefix, "melo_");
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(CoreConfig::from_json_str("{ nope").is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"connection_timeout_secs": 5}}"#).unwrap();
        let config = CoreConfig::load(file.path()).unwrap();
        assert_eq!(config.connection_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(CoreConfig::load("/definitely/not/here.json").is_err());
    }

    #[test]
    fn audio_names() {
        let mut config = CoreConfig::default();
        config.qr_codes.insert("2100123".into(), "MM10000123".into());
        assert_eq!(config.serial_from_audio_name("audio_2100123"), Some("2100123".into()));
        assert_eq!(config.serial_from_audio_name("melo_2100456"), Some("2100456".into()));
        assert_eq!(config.serial_from_audio_name("MM10000123"), Some("2100123".into()));
        assert_eq!(config.serial_from_audio_name("MM10000999"), None);
        assert_eq!(config.serial_from_audio_name("Speakers"), None);
    }
}
