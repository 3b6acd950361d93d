//! Types for pump operations

use std::fmt;

use serde::Serialize;

/// Blood glucose units configured on the pump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BgUnits {
    #[serde(rename = "mg/dL")]
    MgDl,
    #[serde(rename = "mmol/L")]
    MmolL,
}

impl BgUnits {
    pub(crate) fn from_byte(value: u8) -> Option<Self> {
        match value {
            1 => Some(BgUnits::MgDl),
            2 => Some(BgUnits::MmolL),
            _ => None,
        }
    }
}

/// Carbohydrate units configured on the pump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CarbUnits {
    #[serde(rename = "g")]
    Grams,
    #[serde(rename = "exchange")]
    Exchanges,
}

impl CarbUnits {
    pub(crate) fn from_byte(value: u8) -> Option<Self> {
        match value {
            1 => Some(CarbUnits::Grams),
            2 => Some(CarbUnits::Exchanges),
            _ => None,
        }
    }
}

/// Units of a sensitivity factor schedule (ISF or CSF)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorUnits {
    MgDlPerUnit,
    MmolLPerUnit,
    GramsPerUnit,
    UnitsPerExchange,
}

impl FactorUnits {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactorUnits::MgDlPerUnit => "mg/dL/U",
            FactorUnits::MmolLPerUnit => "mmol/L/U",
            FactorUnits::GramsPerUnit => "g/U",
            FactorUnits::UnitsPerExchange => "U/exchange",
        }
    }
}

/// Temporary basal units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TbUnits {
    #[serde(rename = "U/h")]
    UnitsPerHour,
    #[serde(rename = "%")]
    Percent,
}

impl TbUnits {
    pub(crate) fn index(&self) -> u8 {
        match self {
            TbUnits::UnitsPerHour => 0,
            TbUnits::Percent => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TbUnits::UnitsPerHour => "U/h",
            TbUnits::Percent => "%",
        }
    }
}

/// Physical pump buttons that can be pressed remotely
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Easy,
    Esc,
    Act,
    Up,
    Down,
}

impl Button {
    pub(crate) fn index(&self) -> u8 {
        match self {
            Button::Easy => 0,
            Button::Esc => 1,
            Button::Act => 2,
            Button::Up => 3,
            Button::Down => 4,
        }
    }
}

/// The three basal patterns stored on the pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasalProfileName {
    Standard,
    A,
    B,
}

impl BasalProfileName {
    pub fn as_str(&self) -> &'static str {
        match self {
            BasalProfileName::Standard => "Standard",
            BasalProfileName::A => "A",
            BasalProfileName::B => "B",
        }
    }
}

/// Start time of a schedule entry, in minutes after midnight
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DayTime(pub u32);

impl fmt::Display for DayTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// Pump run state as reported by the status command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpStatus {
    pub normal: bool,
    pub bolusing: bool,
    pub suspended: bool,
}

/// Subset of the pump settings used by the dosing layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PumpSettings {
    /// Duration of insulin action (h)
    #[serde(rename = "DIA")]
    pub dia: u8,
    /// Maximum bolus (U)
    #[serde(rename = "Max Bolus")]
    pub max_bolus: f64,
    /// Maximum basal rate (U/h)
    #[serde(rename = "Max Basal")]
    pub max_basal: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BgTarget {
    pub time: DayTime,
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BgTargets {
    pub units: BgUnits,
    pub targets: Vec<BgTarget>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Factor {
    pub time: DayTime,
    pub value: f64,
}

/// ISF or CSF schedule
#[derive(Debug, Clone, PartialEq)]
pub struct Factors {
    pub units: FactorUnits,
    pub factors: Vec<Factor>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BasalRate {
    pub time: DayTime,
    /// Rate (U/h)
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasalProfile {
    pub name: BasalProfileName,
    pub rates: Vec<BasalRate>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailyTotals {
    pub today: f64,
    pub yesterday: f64,
}

/// Currently running temporary basal
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempBasal {
    pub units: TbUnits,
    pub rate: f64,
    /// Remaining duration (min)
    pub duration: u32,
}

/// Convert bytes to uppercase hex string
pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Pack a value into `n` big-endian bytes
pub(crate) fn pack(value: u32, n: usize) -> Vec<u8> {
    (0..n).rev().map(|i| (value >> (8 * i)) as u8).collect()
}

/// Big-endian unsigned value of up to four bytes
pub(crate) fn unpack(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32)
}

/// Little-endian unsigned value of up to four bytes
pub(crate) fn unpack_le(bytes: &[u8]) -> u32 {
    bytes.iter().rev().fold(0u32, |acc, &b| (acc << 8) | b as u32)
}

pub(crate) fn round_to(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (value * scale).round() / scale
}

/// Printable ASCII view of a payload
pub(crate) fn charify(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}
