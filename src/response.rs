//! Typed responses and the two decode stages that produce them.
//!
//! [`extract_payload`] pulls the raw bytes out of the received packets
//! without interpreting them. [`interpret_payload`] turns those bytes into a
//! [`Response`] using the pump model's stroke and time constants.

use chrono::{Local, NaiveDate, NaiveDateTime};
use log::info;
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::config::PumpModel;
use crate::error::{PacketError, PumpError};
use crate::history;
use crate::packet::Packet;
use crate::registry::PumpCommandId;
use crate::report::Reporter;
use crate::stick::StickResponse;
use crate::types::{
    BasalProfile, BasalRate, BgTarget, BgTargets, BgUnits, CarbUnits, DailyTotals, DayTime, Factor,
    FactorUnits, Factors, PumpSettings, PumpStatus, TbUnits, TempBasal, charify, round_to, unpack,
    unpack_le,
};

const PUMP_REPORT: &str = "pump.json";
const HISTORY_REPORT: &str = "history.json";

const TIME_FORMAT: &str = "%Y.%m.%d - %H:%M:%S";

/// Uninitialized basal profile marker
const EMPTY_BASAL_ENTRY: [u8; 3] = [0, 0, 63];

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// The pump acknowledged a set command
    Ack,
    /// Raw payload of an ACK/NAK exchange
    Chunk(Vec<u8>),
    Time(NaiveDateTime),
    Model(u32),
    Firmware(String),
    /// Battery voltage (V)
    Battery(f64),
    /// Remaining insulin (U)
    Reservoir(f64),
    Status(PumpStatus),
    Settings(PumpSettings),
    BgUnits(BgUnits),
    CarbUnits(CarbUnits),
    BgTargets(BgTargets),
    Isf(Factors),
    Csf(Factors),
    BasalProfile(BasalProfile),
    DailyTotals(DailyTotals),
    TempBasal(TempBasal),
    HistorySize(u32),
    HistoryPage(Vec<u8>),
    Stick(StickResponse),
}

/// Raw reply bytes handed from extraction to interpretation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub bytes: Vec<u8>,
    pub size: usize,
}

/// Where the payload of a reply lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extraction {
    /// Last received packet only
    Last,
    /// Every packet after the given number of prelude replies, in order
    Concatenate { skip: usize },
}

pub fn extract_payload(rx: &[Packet], extraction: Extraction) -> Result<Payload, PumpError> {
    match extraction {
        Extraction::Last => {
            let packet = rx
                .last()
                .ok_or_else(|| PumpError::UnsuccessfulCommand("no reply received".into()))?;
            Ok(Payload {
                bytes: packet.payload.clone(),
                size: packet.size,
            })
        }
        Extraction::Concatenate { skip } => {
            let bytes: Vec<u8> = rx
                .iter()
                .skip(skip)
                .flat_map(|packet| packet.payload.iter().copied())
                .collect();
            let size = bytes.len();
            Ok(Payload { bytes, size })
        }
    }
}

/// Success criterion of every set command: last reply is exactly `06 00`
pub fn check_ack(rx: &[Packet], name: &str) -> Result<(), PumpError> {
    match rx.last() {
        Some(packet) if packet.is_ack() => Ok(()),
        Some(packet) => Err(PumpError::UnsuccessfulCommand(format!(
            "{}: expected ACK, got {}",
            name, packet
        ))),
        None => Err(PumpError::UnsuccessfulCommand(format!("{}: no reply", name))),
    }
}

pub fn interpret_payload(
    id: PumpCommandId,
    payload: &Payload,
    model: &PumpModel,
) -> Result<Response, PumpError> {
    let p = &payload.bytes;
    let at = |i: usize| -> Result<u8, PumpError> {
        p.get(i).copied().ok_or_else(|| short(id, i + 1, p.len()))
    };
    let span = |a: usize, b: usize| -> Result<&[u8], PumpError> {
        p.get(a..b).ok_or_else(|| short(id, b, p.len()))
    };

    let response = match id {
        PumpCommandId::ReadTime => {
            let [h, m, s] = [at(0)?, at(1)?, at(2)?];
            let year = unpack(span(3, 5)?) as i32;
            let [month, day] = [at(5)?, at(6)?];
            let time = NaiveDate::from_ymd_opt(year, month as u32, day as u32)
                .and_then(|d| d.and_hms_opt(h as u32, m as u32, s as u32))
                .ok_or_else(|| {
                    PumpError::InvalidPacket(PacketError::MalformedFrame(format!(
                        "invalid pump time {:02X?}",
                        &p[..7]
                    )))
                })?;
            Response::Time(time)
        }
        PumpCommandId::ReadModel => {
            let text = charify(span(1, 4)?);
            let model = text.parse::<u32>().map_err(|_| {
                PumpError::InvalidPacket(PacketError::MalformedFrame(format!(
                    "invalid pump model '{}'",
                    text
                )))
            })?;
            Response::Model(model)
        }
        PumpCommandId::ReadFirmware => {
            Response::Firmware(format!(
                "{} {}",
                charify(span(0, 8)?),
                charify(span(8, 11)?)
            ))
        }
        PumpCommandId::ReadBattery => {
            Response::Battery(round_to(unpack(span(1, 3)?) as f64 / 100.0, 2))
        }
        PumpCommandId::ReadReservoir => Response::Reservoir(round_to(
            unpack(span(0, 2)?) as f64 * model.bolus_stroke,
            1,
        )),
        PumpCommandId::ReadStatus => Response::Status(PumpStatus {
            normal: at(0)? == 3,
            bolusing: at(1)? == 1,
            suspended: at(2)? == 1,
        }),
        PumpCommandId::ReadSettings => Response::Settings(PumpSettings {
            dia: at(17)?,
            max_bolus: at(5)? as f64 * model.bolus_stroke,
            max_basal: unpack(span(6, 8)?) as f64 * model.basal_stroke,
        }),
        PumpCommandId::ReadBgUnits => Response::BgUnits(
            BgUnits::from_byte(at(0)?).ok_or_else(|| unexpected("BG units", p[0]))?,
        ),
        PumpCommandId::ReadCarbUnits => Response::CarbUnits(
            CarbUnits::from_byte(at(0)?).ok_or_else(|| unexpected("carb units", p[0]))?,
        ),
        PumpCommandId::ReadBgTargets => Response::BgTargets(bg_targets(payload, model)?),
        PumpCommandId::ReadIsf => {
            let units = match at(0)? {
                1 => FactorUnits::MgDlPerUnit,
                2 => FactorUnits::MmolLPerUnit,
                other => return Err(unexpected("ISF units", other)),
            };
            Response::Isf(factors(payload, model, units)?)
        }
        PumpCommandId::ReadCsf => {
            let units = match at(0)? {
                1 => FactorUnits::GramsPerUnit,
                2 => FactorUnits::UnitsPerExchange,
                other => return Err(unexpected("CSF units", other)),
            };
            Response::Csf(factors(payload, model, units)?)
        }
        PumpCommandId::ReadBasalStandard | PumpCommandId::ReadBasalA | PumpCommandId::ReadBasalB => {
            let name = id
                .basal_profile()
                .ok_or_else(|| PumpError::InvalidParameter(id.name().into()))?;
            Response::BasalProfile(BasalProfile {
                name,
                rates: basal_rates(p, model),
            })
        }
        PumpCommandId::ReadDailyTotals => Response::DailyTotals(DailyTotals {
            today: round_to(unpack(span(0, 2)?) as f64 * model.bolus_stroke, 2),
            yesterday: round_to(unpack(span(2, 4)?) as f64 * model.bolus_stroke, 2),
        }),
        PumpCommandId::ReadTb => {
            let (units, rate) = match at(0)? {
                0 => (
                    TbUnits::UnitsPerHour,
                    round_to(unpack(span(2, 4)?) as f64 * model.basal_stroke, 2),
                ),
                1 => (TbUnits::Percent, at(1)? as f64),
                other => return Err(unexpected("TB units", other)),
            };
            Response::TempBasal(TempBasal {
                units,
                rate,
                duration: unpack(span(4, 6)?),
            })
        }
        PumpCommandId::ReadHistorySize => Response::HistorySize(
            history::page_count(p).ok_or_else(|| short(id, 4, p.len()))?,
        ),
        PumpCommandId::ReadHistoryPage => Response::HistoryPage(history::verify_page(p)?),
        PumpCommandId::Ack | PumpCommandId::Nak => Response::Chunk(p.clone()),
        PumpCommandId::Power
        | PumpCommandId::PushButton
        | PumpCommandId::Resume
        | PumpCommandId::Suspend
        | PumpCommandId::DeliverBolus
        | PumpCommandId::SetTbUnits
        | PumpCommandId::SetAbsoluteTb
        | PumpCommandId::SetPercentageTb => Response::Ack,
    };

    Ok(response)
}

fn short(id: PumpCommandId, needed: usize, got: usize) -> PumpError {
    PumpError::InvalidPacket(PacketError::MalformedFrame(format!(
        "{} payload too short: need {} bytes, got {}",
        id.name(),
        needed,
        got
    )))
}

fn unexpected(field: &'static str, value: u8) -> PumpError {
    PumpError::InvalidPacket(PacketError::UnexpectedValue { field, value })
}

fn bg_targets(payload: &Payload, model: &PumpModel) -> Result<BgTargets, PumpError> {
    const ENTRY: usize = 3;
    let p = &payload.bytes;

    let units = p
        .first()
        .copied()
        .ok_or_else(|| short(PumpCommandId::ReadBgTargets, 1, 0))?;
    let (units, divisor) = match units {
        1 => (BgUnits::MgDl, 1.0),
        2 => (BgUnits::MmolL, 10.0),
        other => return Err(unexpected("BG units", other)),
    };

    let count = payload.size.saturating_sub(1) / ENTRY;
    let mut targets = Vec::with_capacity(count);
    for entry in p[1..].chunks_exact(ENTRY).take(count) {
        targets.push(BgTarget {
            time: DayTime(entry[0] as u32 * model.basal_time),
            low: entry[1] as f64 / divisor,
            high: entry[2] as f64 / divisor,
        });
    }

    Ok(BgTargets { units, targets })
}

fn factors(payload: &Payload, model: &PumpModel, units: FactorUnits) -> Result<Factors, PumpError> {
    const ENTRY: usize = 2;
    let p = &payload.bytes;

    // Schedules with one decimal are flagged by a leading 2
    let divisor = if p[0] == 2 { 10.0 } else { 1.0 };

    let count = payload.size.saturating_sub(1) / ENTRY;
    let mut factors = Vec::with_capacity(count);
    for entry in p[1..].chunks_exact(ENTRY).take(count) {
        // Low six bits: time block; high two bits: factor MSBs
        let time = (entry[0] % 64) as u32 * model.basal_time;
        let value = unpack(&[entry[0] / 64, entry[1]]) as f64 / divisor;
        factors.push(Factor {
            time: DayTime(time),
            value,
        });
    }

    Ok(Factors { units, factors })
}

fn basal_rates(payload: &[u8], model: &PumpModel) -> Vec<BasalRate> {
    let mut rates = Vec::new();

    for (i, entry) in payload.chunks(3).enumerate() {
        if i == 0 && entry == EMPTY_BASAL_ENTRY {
            break;
        }
        if entry.len() != 3 || entry.iter().all(|&b| b == 0) {
            break;
        }
        rates.push(BasalRate {
            time: DayTime(entry[2] as u32 * model.basal_time),
            rate: unpack_le(&entry[0..2]) as f64 / model.bolus_rate,
        });
    }

    rates
}

/// Store phase: persist a decoded response through the reporter
pub fn store_response(
    id: PumpCommandId,
    response: &Response,
    reporter: &mut dyn Reporter,
) -> Result<(), PumpError> {
    let now = Local::now().format(TIME_FORMAT).to_string();

    match response {
        Response::Ack if id == PumpCommandId::Power => {
            info!("Adding pump's last power up to '{}'", PUMP_REPORT);
            reporter.add(PUMP_REPORT, &[], entries([("Power", json!(now))]), true)
        }
        Response::Model(model) => {
            info!("Adding pump's model to '{}'", PUMP_REPORT);
            reporter.add(
                PUMP_REPORT,
                &["Properties"],
                entries([("Model", json!(model))]),
                true,
            )
        }
        Response::Firmware(firmware) => {
            info!("Adding pump's firmware to '{}'", PUMP_REPORT);
            reporter.add(
                PUMP_REPORT,
                &["Properties"],
                entries([("Firmware", json!(firmware))]),
                true,
            )
        }
        Response::Battery(level) => {
            info!("Adding pump's battery level to '{}'", HISTORY_REPORT);
            reporter.add(
                HISTORY_REPORT,
                &["Pump", "Battery Levels"],
                entries([(now.as_str(), json!(level))]),
                false,
            )
        }
        Response::Reservoir(level) => {
            info!("Adding pump's reservoir level to '{}'", HISTORY_REPORT);
            reporter.add(
                HISTORY_REPORT,
                &["Pump", "Reservoir Levels"],
                entries([(now.as_str(), json!(level))]),
                false,
            )
        }
        Response::Settings(settings) => {
            info!("Adding pump's settings to '{}'", PUMP_REPORT);
            let settings = to_json(settings)?;
            reporter.add(PUMP_REPORT, &[], entries([("Settings", settings)]), true)
        }
        Response::BgUnits(units) => {
            info!("Adding pump's BG units to '{}'", PUMP_REPORT);
            reporter.add(
                PUMP_REPORT,
                &["Units"],
                entries([("BG", to_json(units)?)]),
                true,
            )
        }
        Response::CarbUnits(units) => {
            info!("Adding pump's carb units to '{}'", PUMP_REPORT);
            reporter.add(
                PUMP_REPORT,
                &["Units"],
                entries([("Carbs", to_json(units)?)]),
                true,
            )
        }
        Response::BgTargets(targets) => {
            info!("Adding pump's BG targets to '{}'", PUMP_REPORT);
            reporter.add(
                PUMP_REPORT,
                &["Units"],
                entries([("BG", to_json(&targets.units)?)]),
                true,
            )?;
            let schedule: Map<String, Value> = targets
                .targets
                .iter()
                .map(|t| (t.time.to_string(), json!([t.low, t.high])))
                .collect();
            reporter.add(
                PUMP_REPORT,
                &[],
                entries([("BG Targets", Value::Object(schedule))]),
                true,
            )
        }
        Response::Isf(isf) => {
            info!("Adding pump's ISF(s) to '{}'", PUMP_REPORT);
            let bg = isf.units.as_str().trim_end_matches("/U");
            reporter.add(PUMP_REPORT, &["Units"], entries([("BG", json!(bg))]), true)?;
            reporter.add(
                PUMP_REPORT,
                &[],
                entries([("ISF", factor_schedule(isf))]),
                true,
            )
        }
        Response::Csf(csf) => {
            info!("Adding pump's CSF(s) to '{}'", PUMP_REPORT);
            reporter.add(
                PUMP_REPORT,
                &[],
                entries([("CSF", factor_schedule(csf))]),
                true,
            )?;
            let carbs = match csf.units {
                FactorUnits::UnitsPerExchange => CarbUnits::Exchanges,
                _ => CarbUnits::Grams,
            };
            reporter.add(
                PUMP_REPORT,
                &["Units"],
                entries([("Carbs", to_json(&carbs)?)]),
                true,
            )
        }
        Response::BasalProfile(profile) => {
            let key = format!("Basal Profile ({})", profile.name.as_str());
            info!("Adding pump's basal profile '{}' to '{}'", profile.name.as_str(), PUMP_REPORT);
            let schedule: Map<String, Value> = profile
                .rates
                .iter()
                .map(|r| (r.time.to_string(), json!(r.rate)))
                .collect();
            reporter.add(
                PUMP_REPORT,
                &[],
                entries([(key.as_str(), Value::Object(schedule))]),
                true,
            )
        }
        Response::TempBasal(tb) => {
            info!("Adding pump's TB units to '{}'", PUMP_REPORT);
            reporter.add(
                PUMP_REPORT,
                &["Units"],
                entries([("TB", to_json(&tb.units)?)]),
                true,
            )
        }
        _ => Ok(()),
    }
}

fn to_json(value: &impl Serialize) -> Result<Value, PumpError> {
    serde_json::to_value(value).map_err(|e| PumpError::Report(e.to_string()))
}

fn factor_schedule(factors: &Factors) -> Value {
    Value::Object(
        factors
            .factors
            .iter()
            .map(|f| (f.time.to_string(), json!(f.value)))
            .collect(),
    )
}

fn entries<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}
