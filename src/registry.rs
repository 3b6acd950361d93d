//! Command registry: maps opcodes and symbolic names to commands, and holds
//! the per-command parameter encoders.

use crate::command::{Command, PumpCommand};
use crate::config::PumpModel;
use crate::error::PumpError;
use crate::history;
use crate::packet::{ACK, NAK, PARAMETER_BLOCK_LEN};
use crate::pump::DEFAULT_SESSION_MINUTES;
use crate::stick::{StickArgs, StickCommand, StickOp};
use crate::types::{BasalProfileName, Button, TbUnits, pack};

/// Every pump command known to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PumpCommandId {
    Power,
    PushButton,
    Resume,
    Suspend,
    DeliverBolus,
    SetTbUnits,
    SetAbsoluteTb,
    SetPercentageTb,
    ReadTime,
    ReadModel,
    ReadFirmware,
    ReadBattery,
    ReadReservoir,
    ReadStatus,
    ReadSettings,
    ReadBgUnits,
    ReadCarbUnits,
    ReadBgTargets,
    ReadIsf,
    ReadCsf,
    ReadBasalStandard,
    ReadBasalA,
    ReadBasalB,
    ReadDailyTotals,
    ReadTb,
    ReadHistorySize,
    ReadHistoryPage,
    Ack,
    Nak,
}

/// Execution shape of a pump command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    SimpleGet,
    PhasedSet,
    PhasedGet,
}

const PUMP_COMMANDS: [(PumpCommandId, u8, &str); 29] = [
    (PumpCommandId::Power, 0x5D, "PowerPump"),
    (PumpCommandId::PushButton, 0x5B, "PushPumpButton"),
    (PumpCommandId::Resume, 0x4D, "ResumePump"),
    (PumpCommandId::Suspend, 0x4D, "SuspendPump"),
    (PumpCommandId::DeliverBolus, 0x42, "DeliverPumpBolus"),
    (PumpCommandId::SetTbUnits, 0x68, "SetPumpTBUnits"),
    (PumpCommandId::SetAbsoluteTb, 0x4C, "SetPumpAbsoluteTB"),
    (PumpCommandId::SetPercentageTb, 0x69, "SetPumpPercentageTB"),
    (PumpCommandId::ReadTime, 0x70, "ReadPumpTime"),
    (PumpCommandId::ReadModel, 0x8D, "ReadPumpModel"),
    (PumpCommandId::ReadFirmware, 0x74, "ReadPumpFirmware"),
    (PumpCommandId::ReadBattery, 0x72, "ReadPumpBattery"),
    (PumpCommandId::ReadReservoir, 0x73, "ReadPumpReservoir"),
    (PumpCommandId::ReadStatus, 0xCE, "ReadPumpStatus"),
    (PumpCommandId::ReadSettings, 0xC0, "ReadPumpSettings"),
    (PumpCommandId::ReadBgUnits, 0x89, "ReadPumpBGUnits"),
    (PumpCommandId::ReadCarbUnits, 0x88, "ReadPumpCarbsUnits"),
    (PumpCommandId::ReadBgTargets, 0x9F, "ReadPumpBGTargets"),
    (PumpCommandId::ReadIsf, 0x8B, "ReadPumpISF"),
    (PumpCommandId::ReadCsf, 0x8A, "ReadPumpCSF"),
    (PumpCommandId::ReadBasalStandard, 0x92, "ReadPumpBasalProfileStandard"),
    (PumpCommandId::ReadBasalA, 0x93, "ReadPumpBasalProfileA"),
    (PumpCommandId::ReadBasalB, 0x94, "ReadPumpBasalProfileB"),
    (PumpCommandId::ReadDailyTotals, 0x79, "ReadPumpDailyTotals"),
    (PumpCommandId::ReadTb, 0x98, "ReadPumpTB"),
    (PumpCommandId::ReadHistorySize, 0x9D, "ReadPumpHistorySize"),
    (PumpCommandId::ReadHistoryPage, 0x80, "ReadPumpHistoryPage"),
    (PumpCommandId::Ack, ACK, "PumpACK"),
    (PumpCommandId::Nak, NAK, "PumpNAK"),
];

impl PumpCommandId {
    pub fn all() -> impl Iterator<Item = PumpCommandId> {
        PUMP_COMMANDS.iter().map(|&(id, _, _)| id)
    }

    // Table rows follow the variant order
    fn entry(self) -> (PumpCommandId, u8, &'static str) {
        PUMP_COMMANDS[self as usize]
    }

    pub fn opcode(self) -> u8 {
        self.entry().1
    }

    pub fn name(self) -> &'static str {
        self.entry().2
    }

    /// First registered command with this opcode. `0x4D` is shared by
    /// resume and suspend and resolves to [`PumpCommandId::Resume`].
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        PUMP_COMMANDS
            .iter()
            .find(|&&(_, code, _)| code == opcode)
            .map(|&(id, _, _)| id)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        PUMP_COMMANDS
            .iter()
            .find(|&&(_, _, n)| n == name)
            .map(|&(id, _, _)| id)
    }

    pub fn shape(self) -> Shape {
        match self {
            PumpCommandId::Power
            | PumpCommandId::PushButton
            | PumpCommandId::Resume
            | PumpCommandId::Suspend
            | PumpCommandId::DeliverBolus
            | PumpCommandId::SetTbUnits
            | PumpCommandId::SetAbsoluteTb
            | PumpCommandId::SetPercentageTb => Shape::PhasedSet,
            PumpCommandId::ReadBasalStandard
            | PumpCommandId::ReadBasalA
            | PumpCommandId::ReadBasalB
            | PumpCommandId::ReadHistoryPage => Shape::PhasedGet,
            _ => Shape::SimpleGet,
        }
    }

    pub(crate) fn basal_profile(self) -> Option<BasalProfileName> {
        match self {
            PumpCommandId::ReadBasalStandard => Some(BasalProfileName::Standard),
            PumpCommandId::ReadBasalA => Some(BasalProfileName::A),
            PumpCommandId::ReadBasalB => Some(BasalProfileName::B),
            _ => None,
        }
    }

    pub fn for_basal_profile(name: BasalProfileName) -> Self {
        match name {
            BasalProfileName::Standard => PumpCommandId::ReadBasalStandard,
            BasalProfileName::A => PumpCommandId::ReadBasalA,
            BasalProfileName::B => PumpCommandId::ReadBasalB,
        }
    }
}

/// Identifier of any command, stick or pump level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandId {
    Stick(StickOp),
    Pump(PumpCommandId),
}

impl CommandId {
    pub fn name(self) -> &'static str {
        match self {
            CommandId::Stick(op) => op.name(),
            CommandId::Pump(id) => id.name(),
        }
    }
}

/// Arguments passed to a command's encode step. `None` selects the
/// command's defaults.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandArgs {
    None,
    /// RF session length (min)
    Power { minutes: u32 },
    Button(Button),
    /// Bolus amount (U)
    Bolus { units: f64 },
    TbUnits(TbUnits),
    /// Rate in U/h or %, duration in minutes
    TempBasal { rate: f64, duration: f64 },
    HistoryPage { page: u32 },
    Stick(StickArgs),
}

/// Look up a command by its symbolic name, e.g. `"ReadPumpBattery"`
pub fn lookup(name: &str) -> Option<CommandId> {
    StickOp::from_name(name)
        .map(CommandId::Stick)
        .or_else(|| PumpCommandId::from_name(name).map(CommandId::Pump))
}

/// Look up a stick command by its numeric code
pub fn lookup_stick(code: u8) -> Option<CommandId> {
    StickOp::from_code(code).map(CommandId::Stick)
}

/// Look up a pump command by its two-hex-digit opcode, e.g. `"5D"`
pub fn lookup_pump(opcode: &str) -> Option<CommandId> {
    let code = u8::from_str_radix(opcode, 16).ok()?;
    PumpCommandId::from_opcode(code).map(CommandId::Pump)
}

/// Construct a fresh command ready to run
pub fn build(id: CommandId, radio_retries: u8) -> Command {
    match id {
        CommandId::Stick(op) => Command::Stick(StickCommand::new(op)),
        CommandId::Pump(id) => {
            Command::Pump(Box::new(PumpCommand::new(id).with_radio_retries(radio_retries)))
        }
    }
}

/// Parameter bytes for a pump command
pub(crate) fn encode_params(
    id: PumpCommandId,
    model: &PumpModel,
    args: &CommandArgs,
) -> Result<Vec<u8>, PumpError> {
    match (id, args) {
        (PumpCommandId::Power, CommandArgs::None) => encode_power(DEFAULT_SESSION_MINUTES),
        (PumpCommandId::Power, CommandArgs::Power { minutes }) => encode_power(*minutes),
        (PumpCommandId::PushButton, CommandArgs::None) => Ok(parameter_block(&[Button::Down.index()])),
        (PumpCommandId::PushButton, CommandArgs::Button(button)) => {
            Ok(parameter_block(&[button.index()]))
        }
        (PumpCommandId::Resume, CommandArgs::None) => Ok(parameter_block(&[0x00])),
        (PumpCommandId::Suspend, CommandArgs::None) => Ok(parameter_block(&[0x01])),
        (PumpCommandId::DeliverBolus, CommandArgs::None) => encode_bolus(0.0),
        (PumpCommandId::DeliverBolus, CommandArgs::Bolus { units }) => encode_bolus(*units),
        (PumpCommandId::SetTbUnits, CommandArgs::None) => {
            Ok(parameter_block(&[TbUnits::UnitsPerHour.index()]))
        }
        (PumpCommandId::SetTbUnits, CommandArgs::TbUnits(units)) => {
            Ok(parameter_block(&[units.index()]))
        }
        (PumpCommandId::SetAbsoluteTb, CommandArgs::None) => encode_absolute_tb(model, 0.0, 0.0),
        (PumpCommandId::SetAbsoluteTb, CommandArgs::TempBasal { rate, duration }) => {
            encode_absolute_tb(model, *rate, *duration)
        }
        (PumpCommandId::SetPercentageTb, CommandArgs::None) => {
            encode_percentage_tb(model, 0.0, 0.0)
        }
        (PumpCommandId::SetPercentageTb, CommandArgs::TempBasal { rate, duration }) => {
            encode_percentage_tb(model, *rate, *duration)
        }
        (PumpCommandId::ReadHistoryPage, CommandArgs::None) => history::encode_page(0),
        (PumpCommandId::ReadHistoryPage, CommandArgs::HistoryPage { page }) => {
            history::encode_page(*page)
        }
        (id, CommandArgs::None) if id.shape() != Shape::PhasedSet => Ok(vec![0x00]),
        (id, args) => Err(PumpError::InvalidParameter(format!(
            "{} does not take {:?}",
            id.name(),
            args
        ))),
    }
}

/// 65-byte block: data length, data, zero padding
pub(crate) fn parameter_block(data: &[u8]) -> Vec<u8> {
    let mut block = vec![0u8; PARAMETER_BLOCK_LEN];
    block[0] = data.len() as u8;
    block[1..=data.len()].copy_from_slice(data);
    block
}

fn within_range(value: i64, min: i64, max: i64, what: &str) -> Result<(), PumpError> {
    if value < min || value > max {
        return Err(PumpError::InvalidParameter(format!(
            "Invalid {}: {} (expected {}..={})",
            what, value, min, max
        )));
    }
    Ok(())
}

fn finite(value: f64, what: &str) -> Result<f64, PumpError> {
    if !value.is_finite() || value < 0.0 {
        return Err(PumpError::InvalidParameter(format!("Invalid {}: {}", what, value)));
    }
    Ok(value)
}

fn encode_power(minutes: u32) -> Result<Vec<u8>, PumpError> {
    within_range(minutes as i64, 0, 30, "RF session length")?;
    Ok(parameter_block(&[0x01, minutes as u8]))
}

fn encode_bolus(units: f64) -> Result<Vec<u8>, PumpError> {
    // Strokes of 0.1 U, truncated; the epsilon absorbs float error (2.3 -> 23)
    let strokes = (finite(units, "bolus")? * 10.0 + 1e-9).trunc() as i64;
    within_range(strokes, 0, 250, "bolus")?;
    Ok(parameter_block(&[strokes as u8]))
}

fn encode_duration(model: &PumpModel, duration: f64) -> Result<u8, PumpError> {
    let blocks = (finite(duration, "TB duration")? / model.basal_time as f64).round() as i64;
    within_range(blocks, 0, 48, "TB duration")?;
    Ok(blocks as u8)
}

fn encode_absolute_tb(model: &PumpModel, rate: f64, duration: f64) -> Result<Vec<u8>, PumpError> {
    let strokes = (finite(rate, "TB rate")? / model.basal_stroke).round() as i64;
    within_range(strokes, 0, 1400, "TB rate")?;
    let blocks = encode_duration(model, duration)?;

    let mut data = pack(strokes as u32, 2);
    data.push(blocks);
    Ok(parameter_block(&data))
}

fn encode_percentage_tb(
    model: &PumpModel,
    rate: f64,
    duration: f64,
) -> Result<Vec<u8>, PumpError> {
    let percent = finite(rate, "TB rate")?.round() as i64;
    within_range(percent, 0, 200, "TB rate")?;
    let blocks = encode_duration(model, duration)?;
    Ok(parameter_block(&[percent as u8, blocks]))
}
