//! USB radio stick and its command set.
//!
//! The stick runs a small firmware that accepts one-byte command codes
//! followed by command-specific arguments. Radio commands answer with
//! `[rssi, number, data..., EOP]`, or with a single status byte when the
//! radio exchange failed.

use log::{debug, error, warn};
use std::time::{Duration, Instant};

use crate::command::CommandState;
use crate::error::PumpError;
use crate::transport::StickTransport;
use crate::types::{bytes_to_hex, charify, pack};

/// End-of-packet byte terminating every radio reply
pub const EOP: u8 = 0x00;

const STICK_TIMEOUT_MARGIN_MS: u32 = 500;
const DEFAULT_READ_TIMEOUT_MS: u32 = 1000;
const READ_CHUNK: usize = 64;
// rssi and packet number ahead of the encoded frame
const RX_PREFIX_LEN: usize = 2;
const CRYSTAL_MHZ: f64 = 24.0;

// Single-byte radio status replies
const ERROR_RX_TIMEOUT: u8 = 0xAA;
const ERROR_CMD_INTERRUPTED: u8 = 0xBB;
const ERROR_ZERO_DATA: u8 = 0xCC;

/// Radio registers exposed by the stick firmware, in address order
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioRegister {
    Sync1,
    Sync0,
    PktLen,
    PktCtrl1,
    PktCtrl0,
    Addr,
    ChanNr,
    FsCtrl1,
    FsCtrl0,
    Freq2,
    Freq1,
    Freq0,
    MdmCfg4,
    MdmCfg3,
    MdmCfg2,
    MdmCfg1,
    MdmCfg0,
    Deviatn,
    Mcsm2,
    Mcsm1,
    Mcsm0,
    FocCfg,
    BsCfg,
    AgcCtrl2,
    AgcCtrl1,
    AgcCtrl0,
    Frend1,
    Frend0,
    FsCal3,
    FsCal2,
    FsCal1,
    FsCal0,
    Test1,
    Test0,
    PaTable1,
    PaTable0,
}

const REGISTER_NAMES: [&str; 36] = [
    "SYNC1", "SYNC0", "PKTLEN", "PKTCTRL1", "PKTCTRL0", "ADDR", "CHANNR", "FSCTRL1", "FSCTRL0",
    "FREQ2", "FREQ1", "FREQ0", "MDMCFG4", "MDMCFG3", "MDMCFG2", "MDMCFG1", "MDMCFG0", "DEVIATN",
    "MCSM2", "MCSM1", "MCSM0", "FOCCFG", "BSCFG", "AGCCTRL2", "AGCCTRL1", "AGCCTRL0", "FREND1",
    "FREND0", "FSCAL3", "FSCAL2", "FSCAL1", "FSCAL0", "TEST1", "TEST0", "PA_TABLE1", "PA_TABLE0",
];

impl RadioRegister {
    pub const ALL: [RadioRegister; 36] = [
        RadioRegister::Sync1,
        RadioRegister::Sync0,
        RadioRegister::PktLen,
        RadioRegister::PktCtrl1,
        RadioRegister::PktCtrl0,
        RadioRegister::Addr,
        RadioRegister::ChanNr,
        RadioRegister::FsCtrl1,
        RadioRegister::FsCtrl0,
        RadioRegister::Freq2,
        RadioRegister::Freq1,
        RadioRegister::Freq0,
        RadioRegister::MdmCfg4,
        RadioRegister::MdmCfg3,
        RadioRegister::MdmCfg2,
        RadioRegister::MdmCfg1,
        RadioRegister::MdmCfg0,
        RadioRegister::Deviatn,
        RadioRegister::Mcsm2,
        RadioRegister::Mcsm1,
        RadioRegister::Mcsm0,
        RadioRegister::FocCfg,
        RadioRegister::BsCfg,
        RadioRegister::AgcCtrl2,
        RadioRegister::AgcCtrl1,
        RadioRegister::AgcCtrl0,
        RadioRegister::Frend1,
        RadioRegister::Frend0,
        RadioRegister::FsCal3,
        RadioRegister::FsCal2,
        RadioRegister::FsCal1,
        RadioRegister::FsCal0,
        RadioRegister::Test1,
        RadioRegister::Test0,
        RadioRegister::PaTable1,
        RadioRegister::PaTable0,
    ];

    /// Index of the register in the firmware's register table
    pub fn address(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        REGISTER_NAMES[self as usize]
    }

    pub fn from_name(name: &str) -> Option<Self> {
        REGISTER_NAMES
            .iter()
            .position(|&n| n.eq_ignore_ascii_case(name))
            .map(|i| Self::ALL[i])
    }
}

/// Stick command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StickOp {
    ReadName,
    ReadAuthor,
    ReadRadioRegister,
    WriteRadioRegister,
    ReadRadio,
    WriteRadio,
    WriteReadRadio,
    SwitchLed,
}

impl StickOp {
    pub const ALL: [StickOp; 8] = [
        StickOp::ReadName,
        StickOp::ReadAuthor,
        StickOp::ReadRadioRegister,
        StickOp::WriteRadioRegister,
        StickOp::ReadRadio,
        StickOp::WriteRadio,
        StickOp::WriteReadRadio,
        StickOp::SwitchLed,
    ];

    pub fn code(self) -> u8 {
        match self {
            StickOp::ReadName => 0,
            StickOp::ReadAuthor => 1,
            StickOp::ReadRadioRegister => 10,
            StickOp::WriteRadioRegister => 11,
            StickOp::ReadRadio => 20,
            StickOp::WriteRadio => 21,
            StickOp::WriteReadRadio => 22,
            StickOp::SwitchLed => 30,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StickOp::ReadName => "ReadStickName",
            StickOp::ReadAuthor => "ReadStickAuthor",
            StickOp::ReadRadioRegister => "ReadStickRadioRegister",
            StickOp::WriteRadioRegister => "WriteStickRadioRegister",
            StickOp::ReadRadio => "ReadStickRadio",
            StickOp::WriteRadio => "WriteStickRadio",
            StickOp::WriteReadRadio => "WriteReadStickRadio",
            StickOp::SwitchLed => "SwitchStickLED",
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.code() == code)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    fn has_reply(self) -> bool {
        !matches!(
            self,
            StickOp::WriteRadioRegister | StickOp::WriteRadio | StickOp::SwitchLed
        )
    }
}

/// Parameters of a send-then-listen radio exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioExchange {
    /// Per-attempt listen timeout (ms)
    pub timeout_ms: u32,
    /// Low-level resend count handled by the stick firmware
    pub retry: u8,
    pub repeat: u8,
    pub delay_ms: u32,
    pub channel_tx: u8,
    pub channel_rx: u8,
}

impl Default for RadioExchange {
    fn default() -> Self {
        Self {
            timeout_ms: 250,
            retry: 3,
            repeat: 1,
            delay_ms: 0,
            channel_tx: 0,
            channel_rx: 0,
        }
    }
}

impl RadioExchange {
    /// How long to wait on the USB side before giving up on the stick:
    /// every radio attempt plus a fixed margin.
    pub fn stick_timeout_ms(&self) -> u32 {
        (self.retry as u32 + 1)
            .saturating_mul(self.timeout_ms)
            .saturating_add(STICK_TIMEOUT_MARGIN_MS)
    }
}

/// Arguments of a stick command
#[derive(Debug, Clone, PartialEq)]
pub enum StickArgs {
    None,
    Register(RadioRegister),
    RegisterWrite(RadioRegister, u8),
    ReadRadio {
        timeout_ms: u32,
        channel: u8,
    },
    WriteRadio {
        data: Vec<u8>,
        repeat: u8,
        delay_ms: u32,
        channel: u8,
    },
    WriteReadRadio {
        data: Vec<u8>,
        exchange: RadioExchange,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StickResponse {
    Text(String),
    Register(u8),
    /// Radio frame without its EOP byte
    Radio(Vec<u8>),
    Written,
}

/// One exchange with the stick
#[derive(Debug, Clone)]
pub struct StickCommand {
    op: StickOp,
    tx: Vec<u8>,
    rx: Vec<u8>,
    timeout_ms: u32,
    radio: bool,
    response: Option<StickResponse>,
    state: CommandState,
}

impl StickCommand {
    pub fn new(op: StickOp) -> Self {
        Self {
            op,
            tx: Vec::new(),
            rx: Vec::new(),
            timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            radio: false,
            response: None,
            state: CommandState::Idle,
        }
    }

    pub fn op(&self) -> StickOp {
        self.op
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    pub fn response(&self) -> Option<&StickResponse> {
        self.response.as_ref()
    }

    /// Bytes written to the stick by the last run
    pub fn tx(&self) -> &[u8] {
        &self.tx
    }

    /// Bytes received from the stick by the last run
    pub fn rx(&self) -> &[u8] {
        &self.rx
    }

    /// Total USB-side timeout of the last encoded exchange
    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    pub fn reset(&mut self) {
        self.tx.clear();
        self.rx.clear();
        self.timeout_ms = DEFAULT_READ_TIMEOUT_MS;
        self.radio = false;
        self.response = None;
        self.state = CommandState::Idle;
    }

    pub fn run<T: StickTransport>(
        &mut self,
        stick: &mut Stick<T>,
        args: &StickArgs,
    ) -> Result<&StickResponse, PumpError> {
        self.reset();

        match self.exchange(stick, args) {
            Ok(response) => {
                self.response = Some(response);
                self.state = CommandState::Idle;
                self.response
                    .as_ref()
                    .ok_or_else(|| PumpError::UnsuccessfulCommand(self.op.name().into()))
            }
            Err(e) => {
                self.state = CommandState::Failed;
                Err(e)
            }
        }
    }

    fn exchange<T: StickTransport>(
        &mut self,
        stick: &mut Stick<T>,
        args: &StickArgs,
    ) -> Result<StickResponse, PumpError> {
        self.encode(args)?;
        self.state = CommandState::Encoded;

        stick.clear_input()?;
        stick.write(&self.tx)?;
        self.state = CommandState::Sent;

        if self.op.has_reply() {
            let mut rx = stick.read(self.timeout_ms, self.radio)?;
            if self.radio {
                // Drop EOP
                rx.pop();
            }
            self.rx = rx;
            self.state = CommandState::Received;
        }

        let response = self.decode()?;
        self.state = CommandState::Decoded;
        Ok(response)
    }

    fn encode(&mut self, args: &StickArgs) -> Result<(), PumpError> {
        let mut tx = vec![self.op.code()];

        match (self.op, args) {
            (StickOp::ReadName | StickOp::ReadAuthor | StickOp::SwitchLed, StickArgs::None) => {}
            (StickOp::ReadRadioRegister, StickArgs::Register(register)) => {
                tx.push(register.address());
            }
            (StickOp::WriteRadioRegister, StickArgs::RegisterWrite(register, value)) => {
                tx.push(register.address());
                tx.push(*value);
            }
            (StickOp::ReadRadio, StickArgs::None) => {
                self.encode_read_radio(&mut tx, 250, 0);
            }
            (StickOp::ReadRadio, StickArgs::ReadRadio { timeout_ms, channel }) => {
                self.encode_read_radio(&mut tx, *timeout_ms, *channel);
            }
            (
                StickOp::WriteRadio,
                StickArgs::WriteRadio {
                    data,
                    delay_ms,
                    channel,
                    ..
                },
            ) => {
                // the firmware takes no repeat count here
                tx.push(*channel);
                tx.extend(pack(*delay_ms, 4));
                tx.extend_from_slice(data);
                tx.push(EOP);
            }
            (StickOp::WriteReadRadio, StickArgs::WriteReadRadio { data, exchange }) => {
                tx.push(exchange.channel_tx);
                tx.push(exchange.repeat);
                tx.extend(pack(exchange.delay_ms, 4));
                tx.push(exchange.channel_rx);
                tx.extend(pack(exchange.timeout_ms, 4));
                tx.push(exchange.retry);
                tx.extend_from_slice(data);
                tx.push(EOP);
                self.timeout_ms = exchange.stick_timeout_ms();
                self.radio = true;
            }
            (op, args) => {
                return Err(PumpError::InvalidParameter(format!(
                    "{} does not take {:?}",
                    op.name(),
                    args
                )));
            }
        }

        self.tx = tx;
        Ok(())
    }

    fn encode_read_radio(&mut self, tx: &mut Vec<u8>, timeout_ms: u32, channel: u8) {
        tx.push(channel);
        tx.extend(pack(timeout_ms, 4));
        self.timeout_ms = timeout_ms.saturating_add(STICK_TIMEOUT_MARGIN_MS);
        self.radio = true;
    }

    fn decode(&self) -> Result<StickResponse, PumpError> {
        match self.op {
            StickOp::ReadName | StickOp::ReadAuthor => {
                let text = charify(&self.rx);
                debug!("{}: {}", self.op.name(), text);
                Ok(StickResponse::Text(text))
            }
            StickOp::ReadRadioRegister => match self.rx.first() {
                Some(&value) => Ok(StickResponse::Register(value)),
                None => Err(PumpError::RadioError("empty register reply".into())),
            },
            StickOp::ReadRadio | StickOp::WriteReadRadio => {
                Ok(StickResponse::Radio(self.rx.clone()))
            }
            StickOp::WriteRadioRegister | StickOp::WriteRadio | StickOp::SwitchLed => {
                Ok(StickResponse::Written)
            }
        }
    }
}

/// Owner of the transport; all traffic to the pump goes through here.
pub struct Stick<T: StickTransport> {
    transport: T,
}

impl<T: StickTransport> Stick<T> {
    /// Create a new stick instance with the given transport
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), PumpError> {
        debug!("Stick TX: {}", bytes_to_hex(data));
        let written = self
            .transport
            .write(data)
            .map_err(|e| PumpError::Transport(format!("{:?}", e)))?;
        if written != data.len() {
            return Err(PumpError::Transport(format!(
                "short write: {} of {} bytes",
                written,
                data.len()
            )));
        }
        Ok(())
    }

    /// Read a reply. In radio mode, keep reading until the EOP byte shows up
    /// and translate the firmware's single-byte status replies into errors.
    ///
    /// EOP only counts once the `[rssi, number]` prefix is in. A status reply
    /// is recognised as a lone first chunk, so a transport that hands over an
    /// RSSI of `0xAA`, `0xBB` or `0xCC` on its own is read as that status.
    pub fn read(&mut self, timeout_ms: u32, radio: bool) -> Result<Vec<u8>, PumpError> {
        let start = Instant::now();
        let deadline = Duration::from_millis(timeout_ms as u64);
        let mut data = Vec::new();

        loop {
            let remaining = deadline.saturating_sub(start.elapsed()).as_millis() as u32;
            let mut chunk = [0u8; READ_CHUNK];
            let n = self
                .transport
                .read(&mut chunk, remaining.max(1))
                .map_err(|e| {
                    error!("Stick read error: {:?}", e);
                    PumpError::Transport(format!("{:?}", e))
                })?;

            if n == 0 {
                warn!("No reply from stick within {} ms", timeout_ms);
                return Err(PumpError::RadioTimeout);
            }

            data.extend_from_slice(&chunk[..n]);

            if !radio {
                break;
            }

            if data.len() == 1 {
                match data[0] {
                    ERROR_RX_TIMEOUT => return Err(PumpError::RadioTimeout),
                    ERROR_CMD_INTERRUPTED => {
                        return Err(PumpError::RadioError("command interrupted".into()));
                    }
                    ERROR_ZERO_DATA => return Err(PumpError::RadioError("zero data".into())),
                    _ => {}
                }
            }

            if data.len() > RX_PREFIX_LEN && data.last() == Some(&EOP) {
                break;
            }

            if start.elapsed() >= deadline {
                return Err(PumpError::RadioTimeout);
            }
        }

        debug!("Stick RX: {}", bytes_to_hex(&data));
        Ok(data)
    }

    pub(crate) fn clear_input(&mut self) -> Result<(), PumpError> {
        self.transport
            .clear_input()
            .map_err(|e| PumpError::Transport(format!("{:?}", e)))
    }

    fn run(&mut self, op: StickOp, args: &StickArgs) -> Result<StickResponse, PumpError> {
        let mut cmd = StickCommand::new(op);
        cmd.run(self, args).cloned()
    }

    pub fn name(&mut self) -> Result<String, PumpError> {
        match self.run(StickOp::ReadName, &StickArgs::None)? {
            StickResponse::Text(name) => Ok(name),
            other => Err(unexpected(StickOp::ReadName, other)),
        }
    }

    pub fn author(&mut self) -> Result<String, PumpError> {
        match self.run(StickOp::ReadAuthor, &StickArgs::None)? {
            StickResponse::Text(author) => Ok(author),
            other => Err(unexpected(StickOp::ReadAuthor, other)),
        }
    }

    pub fn read_register(&mut self, register: RadioRegister) -> Result<u8, PumpError> {
        match self.run(StickOp::ReadRadioRegister, &StickArgs::Register(register))? {
            StickResponse::Register(value) => {
                debug!("{}: {}", register.name(), value);
                Ok(value)
            }
            other => Err(unexpected(StickOp::ReadRadioRegister, other)),
        }
    }

    pub fn write_register(&mut self, register: RadioRegister, value: u8) -> Result<(), PumpError> {
        self.run(
            StickOp::WriteRadioRegister,
            &StickArgs::RegisterWrite(register, value),
        )?;
        Ok(())
    }

    pub fn switch_led(&mut self) -> Result<(), PumpError> {
        self.run(StickOp::SwitchLed, &StickArgs::None)?;
        Ok(())
    }

    /// Tune the radio to the given frequency (MHz)
    pub fn tune(&mut self, frequency_mhz: f64) -> Result<(), PumpError> {
        if !(300.0..=1000.0).contains(&frequency_mhz) {
            return Err(PumpError::InvalidParameter(format!(
                "Frequency out of range: {} MHz",
                frequency_mhz
            )));
        }

        let value = (frequency_mhz * 65536.0 / CRYSTAL_MHZ).round() as u32;
        debug!("Tuning radio to {} MHz (0x{:06X})", frequency_mhz, value);
        self.write_register(RadioRegister::Freq2, (value >> 16) as u8)?;
        self.write_register(RadioRegister::Freq1, (value >> 8) as u8)?;
        self.write_register(RadioRegister::Freq0, value as u8)
    }

    /// Listen for one radio frame
    pub fn radio_read(&mut self, timeout_ms: u32, channel: u8) -> Result<Vec<u8>, PumpError> {
        match self.run(StickOp::ReadRadio, &StickArgs::ReadRadio { timeout_ms, channel })? {
            StickResponse::Radio(data) => Ok(data),
            other => Err(unexpected(StickOp::ReadRadio, other)),
        }
    }

    /// Transmit one radio frame without waiting for a reply
    pub fn radio_write(
        &mut self,
        data: &[u8],
        repeat: u8,
        delay_ms: u32,
        channel: u8,
    ) -> Result<(), PumpError> {
        self.run(
            StickOp::WriteRadio,
            &StickArgs::WriteRadio {
                data: data.to_vec(),
                repeat,
                delay_ms,
                channel,
            },
        )?;
        Ok(())
    }

    /// Transmit one radio frame and wait for the reply
    pub fn radio_write_read(
        &mut self,
        data: &[u8],
        exchange: &RadioExchange,
    ) -> Result<Vec<u8>, PumpError> {
        let args = StickArgs::WriteReadRadio {
            data: data.to_vec(),
            exchange: *exchange,
        };
        match self.run(StickOp::WriteReadRadio, &args)? {
            StickResponse::Radio(data) => Ok(data),
            other => Err(unexpected(StickOp::WriteReadRadio, other)),
        }
    }
}

fn unexpected(op: StickOp, response: StickResponse) -> PumpError {
    PumpError::UnsuccessfulCommand(format!("{}: unexpected reply {:?}", op.name(), response))
}
