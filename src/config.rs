//! Pump configuration: serial number, model constants and radio settings.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::PumpError;

/// Model-specific constants used to convert raw pump values to units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpModel {
    /// Smallest bolus increment (U)
    pub bolus_stroke: f64,
    /// Smallest basal rate increment (U/h)
    pub basal_stroke: f64,
    /// Length of one basal time block (min)
    pub basal_time: u32,
    /// Basal profile strokes per unit
    pub bolus_rate: f64,
}

impl Default for PumpModel {
    fn default() -> Self {
        Self {
            bolus_stroke: 0.1,
            basal_stroke: 0.025,
            basal_time: 30,
            bolus_rate: 40.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    pub frequency_mhz: f64,
    pub channel_tx: u8,
    pub channel_rx: u8,
    /// Resends performed by the stick before a radio attempt counts as failed
    pub radio_retries: u8,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            frequency_mhz: 916.665,
            channel_tx: 0,
            channel_rx: 0,
            radio_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpConfig {
    /// Six hex digits printed on the back of the pump
    pub serial: String,
    #[serde(default)]
    pub model: PumpModel,
    #[serde(default)]
    pub radio: RadioConfig,
}

impl PumpConfig {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            model: PumpModel::default(),
            radio: RadioConfig::default(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, PumpError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| PumpError::Config(e.to_string()))?;
        config.serial_bytes()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PumpError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| PumpError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    /// Serial number as the three bytes carried in every frame
    pub fn serial_bytes(&self) -> Result<[u8; 3], PumpError> {
        parse_serial(&self.serial)
    }
}

pub(crate) fn parse_serial(serial: &str) -> Result<[u8; 3], PumpError> {
    if serial.len() != 6 || !serial.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(PumpError::Config(format!(
            "Pump serial must be six hex digits, got '{}'",
            serial
        )));
    }

    let mut bytes = [0u8; 3];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&serial[2 * i..2 * i + 2], 16)
            .map_err(|e| PumpError::Config(e.to_string()))?;
    }
    Ok(bytes)
}
