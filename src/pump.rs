//! High-level pump API.

use chrono::NaiveDateTime;
use log::info;

use crate::command::Command;
use crate::config::{PumpConfig, PumpModel, RadioConfig};
use crate::error::PumpError;
use crate::history::HISTORY_PAGES;
use crate::registry::{self, CommandArgs, CommandId, PumpCommandId};
use crate::report::Reporter;
use crate::response::Response;
use crate::stick::Stick;
use crate::transport::StickTransport;
use crate::types::{
    BasalProfile, BasalProfileName, BgTargets, BgUnits, Button, CarbUnits, DailyTotals, Factors,
    PumpSettings, PumpStatus, TbUnits, TempBasal,
};

/// Default length of the RF session opened by [`Pump::power_up`] (min)
pub const DEFAULT_SESSION_MINUTES: u32 = 10;

/// A pump reachable through a radio stick
pub struct Pump<T: StickTransport> {
    stick: Stick<T>,
    serial: [u8; 3],
    model: PumpModel,
    radio: RadioConfig,
    reporter: Option<Box<dyn Reporter>>,
}

impl<T: StickTransport> Pump<T> {
    pub fn new(stick: Stick<T>, config: &PumpConfig) -> Result<Self, PumpError> {
        Ok(Self {
            stick,
            serial: config.serial_bytes()?,
            model: config.model,
            radio: config.radio,
            reporter: None,
        })
    }

    /// Persist every decoded response through `reporter`
    pub fn with_reporter(mut self, reporter: impl Reporter + 'static) -> Self {
        self.reporter = Some(Box::new(reporter));
        self
    }

    pub fn serial(&self) -> [u8; 3] {
        self.serial
    }

    pub fn model(&self) -> &PumpModel {
        &self.model
    }

    pub fn radio(&self) -> &RadioConfig {
        &self.radio
    }

    pub fn stick(&self) -> &Stick<T> {
        &self.stick
    }

    pub fn stick_mut(&mut self) -> &mut Stick<T> {
        &mut self.stick
    }

    pub fn reporter_mut(&mut self) -> Option<&mut (dyn Reporter + 'static)> {
        self.reporter.as_deref_mut()
    }

    pub fn into_stick(self) -> Stick<T> {
        self.stick
    }

    /// Tune the stick to the configured pump frequency
    pub fn tune(&mut self) -> Result<(), PumpError> {
        let frequency = self.radio.frequency_mhz;
        self.stick.tune(frequency)
    }

    /// Fresh command for `id`, configured for this pump
    pub fn command(&self, id: CommandId) -> Command {
        registry::build(id, self.radio.radio_retries)
    }

    pub fn run(&mut self, id: CommandId, args: &CommandArgs) -> Result<Response, PumpError> {
        let mut command = self.command(id);
        command.run(self, args)
    }

    fn pump(&mut self, id: PumpCommandId, args: CommandArgs) -> Result<Response, PumpError> {
        self.run(CommandId::Pump(id), &args)
    }

    fn set(&mut self, id: PumpCommandId, args: CommandArgs) -> Result<(), PumpError> {
        match self.pump(id, args)? {
            Response::Ack => Ok(()),
            other => Err(unexpected(id, &other)),
        }
    }

    /// Wake the pump and open an RF session of `minutes`
    pub fn power_up(&mut self, minutes: u32) -> Result<(), PumpError> {
        info!("Powering up pump for {} min", minutes);
        self.set(PumpCommandId::Power, CommandArgs::Power { minutes })
    }

    pub fn read_time(&mut self) -> Result<NaiveDateTime, PumpError> {
        let id = PumpCommandId::ReadTime;
        match self.pump(id, CommandArgs::None)? {
            Response::Time(time) => Ok(time),
            other => Err(unexpected(id, &other)),
        }
    }

    pub fn read_model(&mut self) -> Result<u32, PumpError> {
        let id = PumpCommandId::ReadModel;
        match self.pump(id, CommandArgs::None)? {
            Response::Model(model) => Ok(model),
            other => Err(unexpected(id, &other)),
        }
    }

    pub fn read_firmware(&mut self) -> Result<String, PumpError> {
        let id = PumpCommandId::ReadFirmware;
        match self.pump(id, CommandArgs::None)? {
            Response::Firmware(firmware) => Ok(firmware),
            other => Err(unexpected(id, &other)),
        }
    }

    /// Battery voltage (V)
    pub fn read_battery(&mut self) -> Result<f64, PumpError> {
        let id = PumpCommandId::ReadBattery;
        match self.pump(id, CommandArgs::None)? {
            Response::Battery(level) => Ok(level),
            other => Err(unexpected(id, &other)),
        }
    }

    /// Insulin left in the reservoir (U)
    pub fn read_reservoir(&mut self) -> Result<f64, PumpError> {
        let id = PumpCommandId::ReadReservoir;
        match self.pump(id, CommandArgs::None)? {
            Response::Reservoir(level) => Ok(level),
            other => Err(unexpected(id, &other)),
        }
    }

    pub fn read_status(&mut self) -> Result<PumpStatus, PumpError> {
        let id = PumpCommandId::ReadStatus;
        match self.pump(id, CommandArgs::None)? {
            Response::Status(status) => Ok(status),
            other => Err(unexpected(id, &other)),
        }
    }

    pub fn read_settings(&mut self) -> Result<PumpSettings, PumpError> {
        let id = PumpCommandId::ReadSettings;
        match self.pump(id, CommandArgs::None)? {
            Response::Settings(settings) => Ok(settings),
            other => Err(unexpected(id, &other)),
        }
    }

    pub fn read_bg_units(&mut self) -> Result<BgUnits, PumpError> {
        let id = PumpCommandId::ReadBgUnits;
        match self.pump(id, CommandArgs::None)? {
            Response::BgUnits(units) => Ok(units),
            other => Err(unexpected(id, &other)),
        }
    }

    pub fn read_carb_units(&mut self) -> Result<CarbUnits, PumpError> {
        let id = PumpCommandId::ReadCarbUnits;
        match self.pump(id, CommandArgs::None)? {
            Response::CarbUnits(units) => Ok(units),
            other => Err(unexpected(id, &other)),
        }
    }

    pub fn read_bg_targets(&mut self) -> Result<BgTargets, PumpError> {
        let id = PumpCommandId::ReadBgTargets;
        match self.pump(id, CommandArgs::None)? {
            Response::BgTargets(targets) => Ok(targets),
            other => Err(unexpected(id, &other)),
        }
    }

    /// Insulin sensitivity factors
    pub fn read_isf(&mut self) -> Result<Factors, PumpError> {
        let id = PumpCommandId::ReadIsf;
        match self.pump(id, CommandArgs::None)? {
            Response::Isf(isf) => Ok(isf),
            other => Err(unexpected(id, &other)),
        }
    }

    /// Carb sensitivity factors
    pub fn read_csf(&mut self) -> Result<Factors, PumpError> {
        let id = PumpCommandId::ReadCsf;
        match self.pump(id, CommandArgs::None)? {
            Response::Csf(csf) => Ok(csf),
            other => Err(unexpected(id, &other)),
        }
    }

    pub fn read_basal_profile(&mut self, name: BasalProfileName) -> Result<BasalProfile, PumpError> {
        let id = PumpCommandId::for_basal_profile(name);
        match self.pump(id, CommandArgs::None)? {
            Response::BasalProfile(profile) => Ok(profile),
            other => Err(unexpected(id, &other)),
        }
    }

    pub fn read_daily_totals(&mut self) -> Result<DailyTotals, PumpError> {
        let id = PumpCommandId::ReadDailyTotals;
        match self.pump(id, CommandArgs::None)? {
            Response::DailyTotals(totals) => Ok(totals),
            other => Err(unexpected(id, &other)),
        }
    }

    pub fn read_temp_basal(&mut self) -> Result<TempBasal, PumpError> {
        let id = PumpCommandId::ReadTb;
        match self.pump(id, CommandArgs::None)? {
            Response::TempBasal(tb) => Ok(tb),
            other => Err(unexpected(id, &other)),
        }
    }

    /// Number of history pages in use
    pub fn read_history_size(&mut self) -> Result<u32, PumpError> {
        let id = PumpCommandId::ReadHistorySize;
        match self.pump(id, CommandArgs::None)? {
            Response::HistorySize(size) => Ok(size),
            other => Err(unexpected(id, &other)),
        }
    }

    /// One CRC-checked history page, newest first (page 0)
    pub fn read_history_page(&mut self, page: u32) -> Result<Vec<u8>, PumpError> {
        let id = PumpCommandId::ReadHistoryPage;
        match self.pump(id, CommandArgs::HistoryPage { page })? {
            Response::HistoryPage(data) => Ok(data),
            other => Err(unexpected(id, &other)),
        }
    }

    /// Read pages `0..pages` in order
    pub fn read_history(&mut self, pages: u32) -> Result<Vec<Vec<u8>>, PumpError> {
        let pages = pages.min(HISTORY_PAGES);
        let mut history = Vec::with_capacity(pages as usize);
        for page in 0..pages {
            info!("Reading history page {}/{}", page + 1, pages);
            history.push(self.read_history_page(page)?);
        }
        Ok(history)
    }

    pub fn push_button(&mut self, button: Button) -> Result<(), PumpError> {
        self.set(PumpCommandId::PushButton, CommandArgs::Button(button))
    }

    pub fn suspend(&mut self) -> Result<(), PumpError> {
        self.set(PumpCommandId::Suspend, CommandArgs::None)
    }

    pub fn resume(&mut self) -> Result<(), PumpError> {
        self.set(PumpCommandId::Resume, CommandArgs::None)
    }

    pub fn deliver_bolus(&mut self, units: f64) -> Result<(), PumpError> {
        info!("Delivering bolus of {} U", units);
        self.set(PumpCommandId::DeliverBolus, CommandArgs::Bolus { units })
    }

    pub fn set_temp_basal_units(&mut self, units: TbUnits) -> Result<(), PumpError> {
        self.set(PumpCommandId::SetTbUnits, CommandArgs::TbUnits(units))
    }

    /// Absolute TB: `rate` in U/h for `duration` minutes
    pub fn set_absolute_temp_basal(&mut self, rate: f64, duration: f64) -> Result<(), PumpError> {
        self.set(
            PumpCommandId::SetAbsoluteTb,
            CommandArgs::TempBasal { rate, duration },
        )
    }

    /// Percentage TB: `rate` in % for `duration` minutes
    pub fn set_percentage_temp_basal(&mut self, rate: f64, duration: f64) -> Result<(), PumpError> {
        self.set(
            PumpCommandId::SetPercentageTb,
            CommandArgs::TempBasal { rate, duration },
        )
    }

    /// Switch the TB units, then set the TB itself
    pub fn set_temp_basal(
        &mut self,
        units: TbUnits,
        rate: f64,
        duration: f64,
    ) -> Result<(), PumpError> {
        info!("Setting TB of {} {} for {} min", rate, units.as_str(), duration);
        self.set_temp_basal_units(units)?;
        match units {
            TbUnits::UnitsPerHour => self.set_absolute_temp_basal(rate, duration),
            TbUnits::Percent => self.set_percentage_temp_basal(rate, duration),
        }
    }

    pub fn cancel_temp_basal(&mut self) -> Result<(), PumpError> {
        info!("Canceling TB");
        self.set_temp_basal(TbUnits::UnitsPerHour, 0.0, 0.0)
    }
}

fn unexpected(id: PumpCommandId, response: &Response) -> PumpError {
    PumpError::UnsuccessfulCommand(format!("{}: unexpected response {:?}", id.name(), response))
}
