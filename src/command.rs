//! Command engine.
//!
//! Every pump command runs through the same phases:
//!
//! ```text
//! reset -> encode -> [prelude] -> send/receive -> [postlude] -> decode -> store
//! ```
//!
//! Simple commands skip the bracketed phases. Phased ("big") commands wake
//! the pump with an Init sub-command first, then collect any remaining
//! frames of the reply with ACK sub-commands, and ask for a resend with NAK
//! sub-commands when a frame is lost or garbled.

use log::{debug, info, warn};

use crate::error::PumpError;
use crate::history;
use crate::packet::{Packet, PacketKind};
use crate::pump::Pump;
use crate::registry::{CommandArgs, CommandId, PumpCommandId, Shape, encode_params};
use crate::response::{Extraction, Response, check_ack, extract_payload, interpret_payload, store_response};
use crate::stick::{RadioExchange, StickArgs, StickCommand};
use crate::transport::StickTransport;

const PUMP_TIMEOUT_MS: u32 = 250;
const BIG_TIMEOUT_MS: u32 = 150;
const DEFAULT_RADIO_RETRIES: u8 = 3;
const POWER_WAKE_ATTEMPTS: usize = 50;
const BIG_NAK_RETRIES: usize = 10;

/// Lifecycle of a command invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Idle,
    Encoded,
    Sent,
    Received,
    Decoded,
    Stored,
    Failed,
}

/// Number of Init, ACK and NAK sub-commands a phased command may run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseCounts {
    pub init: usize,
    pub ack: usize,
    pub nak: usize,
}

/// How the Init prelude is repeated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakePolicy {
    /// Run Init exactly `init` times, failing on the first error
    Repeat,
    /// Run Init up to `init` times until the pump answers
    UntilResponse,
}

/// Prelude, postlude and NAK retry bound to a phased command
#[derive(Debug, Clone)]
pub struct PhasedExecution {
    counts: PhaseCounts,
    wake: WakePolicy,
    init: Box<PumpCommand>,
    ack: Box<PumpCommand>,
    nak: Box<PumpCommand>,
}

impl PhasedExecution {
    fn new(id: PumpCommandId, counts: PhaseCounts, wake: WakePolicy, timeout_ms: u32) -> Self {
        Self {
            counts,
            wake,
            init: Box::new(PumpCommand::init(id)),
            ack: Box::new(PumpCommand::new(PumpCommandId::Ack).with_timeout(timeout_ms)),
            nak: Box::new(PumpCommand::new(PumpCommandId::Nak).with_timeout(timeout_ms)),
        }
    }

    pub fn counts(&self) -> PhaseCounts {
        self.counts
    }

    pub fn wake(&self) -> WakePolicy {
        self.wake
    }

    fn set_radio_retries(&mut self, retries: u8) {
        for sub in [&mut self.init, &mut self.ack, &mut self.nak] {
            sub.radio_retries = retries;
        }
    }

    fn prelude<T: StickTransport>(
        &mut self,
        pump: &mut Pump<T>,
        rx: &mut Vec<Packet>,
    ) -> Result<(), PumpError> {
        match self.wake {
            WakePolicy::Repeat => {
                for _ in 0..self.counts.init {
                    self.init.run(pump, &CommandArgs::None)?;
                    rx.extend(self.init.rx.last().cloned());
                }
                Ok(())
            }
            WakePolicy::UntilResponse => {
                for attempt in 1..=self.counts.init {
                    let outcome = self.init.run(pump, &CommandArgs::None).map(|_| ());
                    match outcome {
                        Ok(()) => {
                            debug!("Pump answered after {} attempt(s)", attempt);
                            rx.extend(self.init.rx.last().cloned());
                            return Ok(());
                        }
                        Err(e) if e.is_recoverable() => {
                            debug!("No answer to wake-up {}/{}: {}", attempt, self.counts.init, e);
                        }
                        Err(e) => return Err(e),
                    }
                }
                warn!("Pump did not answer {} wake-up attempts", self.counts.init);
                Err(PumpError::NoPumpResponse)
            }
        }
    }

    fn postlude<T: StickTransport>(
        &mut self,
        pump: &mut Pump<T>,
        rx: &mut Vec<Packet>,
    ) -> Result<(), PumpError> {
        for i in 1..=self.counts.ack {
            let outcome = self.ack.run(pump, &CommandArgs::None).map(|_| ());
            match outcome {
                Ok(()) => rx.extend(self.ack.rx.last().cloned()),
                Err(e) => self.recover(pump, rx, e)?,
            }
            debug!("Collected frame {}/{}", i, self.counts.ack);
        }
        Ok(())
    }

    /// Either retry with NAKs or give the error back
    fn recover<T: StickTransport>(
        &mut self,
        pump: &mut Pump<T>,
        rx: &mut Vec<Packet>,
        e: PumpError,
    ) -> Result<(), PumpError> {
        if !e.is_recoverable() || self.counts.nak == 0 {
            return Err(e);
        }
        warn!("Lost frame: {}", e);
        self.retry(pump, rx)
    }

    fn retry<T: StickTransport>(
        &mut self,
        pump: &mut Pump<T>,
        rx: &mut Vec<Packet>,
    ) -> Result<(), PumpError> {
        for i in 1..=self.counts.nak {
            info!("Retrying (NAK): {}/{}", i, self.counts.nak);
            let outcome = self.nak.run(pump, &CommandArgs::None).map(|_| ());
            match outcome {
                Ok(()) => {
                    rx.extend(self.nak.rx.last().cloned());
                    return Ok(());
                }
                Err(e) if e.is_recoverable() => warn!("NAK {} failed: {}", i, e),
                Err(e) => return Err(e),
            }
        }
        Err(PumpError::UnsuccessfulCommand(format!(
            "no valid frame after {} NAK(s)",
            self.counts.nak
        )))
    }
}

#[derive(Debug, Clone)]
pub enum CommandKind {
    SimpleSet,
    SimpleGet,
    Phased(PhasedExecution),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Main,
    /// Wake-up sub-command of a phased command
    Init,
}

/// One pump command and the frames of its last invocation
#[derive(Debug, Clone)]
pub struct PumpCommand {
    id: PumpCommandId,
    opcode: u8,
    kind: CommandKind,
    reply: PacketKind,
    role: Role,
    timeout_ms: u32,
    radio_retries: u8,
    params: Vec<u8>,
    tx: Vec<Packet>,
    rx: Vec<Packet>,
    prelude_len: usize,
    response: Option<Response>,
    state: CommandState,
}

impl PumpCommand {
    pub fn new(id: PumpCommandId) -> Self {
        let (kind, reply, timeout_ms) = match id.shape() {
            Shape::SimpleGet => {
                let reply = match id {
                    PumpCommandId::Ack | PumpCommandId::Nak => PacketKind::Big,
                    _ => PacketKind::Data,
                };
                (CommandKind::SimpleGet, reply, PUMP_TIMEOUT_MS)
            }
            Shape::PhasedSet => {
                let (counts, wake) = match id {
                    PumpCommandId::Power => (
                        PhaseCounts {
                            init: POWER_WAKE_ATTEMPTS,
                            ack: 0,
                            nak: 0,
                        },
                        WakePolicy::UntilResponse,
                    ),
                    _ => (
                        PhaseCounts {
                            init: 1,
                            ack: 0,
                            nak: 0,
                        },
                        WakePolicy::Repeat,
                    ),
                };
                let phased = PhasedExecution::new(id, counts, wake, PUMP_TIMEOUT_MS);
                (CommandKind::Phased(phased), PacketKind::Status, PUMP_TIMEOUT_MS)
            }
            Shape::PhasedGet => {
                let counts = match id {
                    PumpCommandId::ReadHistoryPage => history::phase_counts(),
                    _ => PhaseCounts {
                        init: 0,
                        ack: 1,
                        nak: BIG_NAK_RETRIES,
                    },
                };
                let phased = PhasedExecution::new(id, counts, WakePolicy::Repeat, BIG_TIMEOUT_MS);
                (CommandKind::Phased(phased), PacketKind::Big, BIG_TIMEOUT_MS)
            }
        };

        Self {
            id,
            opcode: id.opcode(),
            kind,
            reply,
            role: Role::Main,
            timeout_ms,
            radio_retries: DEFAULT_RADIO_RETRIES,
            params: Vec::new(),
            tx: Vec::new(),
            rx: Vec::new(),
            prelude_len: 0,
            response: None,
            state: CommandState::Idle,
        }
    }

    /// Init sub-command: same opcode as its parent, `[0x00]` parameters
    /// and a status reply.
    fn init(id: PumpCommandId) -> Self {
        Self {
            kind: CommandKind::SimpleSet,
            reply: PacketKind::Status,
            role: Role::Init,
            ..Self::new(PumpCommandId::Ack)
        }
        .with_opcode(id)
    }

    fn with_opcode(mut self, id: PumpCommandId) -> Self {
        self.id = id;
        self.opcode = id.opcode();
        self
    }

    fn with_timeout(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_radio_retries(mut self, retries: u8) -> Self {
        self.radio_retries = retries;
        if let CommandKind::Phased(phased) = &mut self.kind {
            phased.set_radio_retries(retries);
        }
        self
    }

    pub fn id(&self) -> PumpCommandId {
        self.id
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    /// Per-attempt radio listen timeout (ms)
    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    pub fn counts(&self) -> Option<PhaseCounts> {
        match &self.kind {
            CommandKind::Phased(phased) => Some(phased.counts),
            _ => None,
        }
    }

    /// Frames sent by the core phase of the last run
    pub fn tx(&self) -> &[Packet] {
        &self.tx
    }

    /// Every frame received by the last run, prelude and postlude included
    pub fn rx(&self) -> &[Packet] {
        &self.rx
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn reset(&mut self) {
        self.params.clear();
        self.tx.clear();
        self.rx.clear();
        self.prelude_len = 0;
        self.response = None;
        self.state = CommandState::Idle;
    }

    pub fn run<T: StickTransport>(
        &mut self,
        pump: &mut Pump<T>,
        args: &CommandArgs,
    ) -> Result<&Response, PumpError> {
        self.reset();

        match self.execute(pump, args) {
            Ok(response) => {
                if self.role == Role::Main {
                    info!("{} done", self.id.name());
                }
                self.state = CommandState::Idle;
                let response = self.response.insert(response);
                Ok(&*response)
            }
            Err(e) => {
                self.state = CommandState::Failed;
                Err(e)
            }
        }
    }

    fn execute<T: StickTransport>(
        &mut self,
        pump: &mut Pump<T>,
        args: &CommandArgs,
    ) -> Result<Response, PumpError> {
        self.encode(pump, args)?;

        if let CommandKind::Phased(phased) = &mut self.kind {
            phased.prelude(pump, &mut self.rx)?;
        }
        self.prelude_len = self.rx.len();

        if let Err(e) = self.exchange(pump) {
            match &mut self.kind {
                CommandKind::Phased(phased) => phased.recover(pump, &mut self.rx, e)?,
                _ => return Err(e),
            }
        }

        if let CommandKind::Phased(phased) = &mut self.kind {
            phased.postlude(pump, &mut self.rx)?;
        }

        let response = self.decode(pump)?;
        self.state = CommandState::Decoded;

        self.store(pump, &response)?;
        Ok(response)
    }

    fn encode<T: StickTransport>(
        &mut self,
        pump: &Pump<T>,
        args: &CommandArgs,
    ) -> Result<(), PumpError> {
        self.params = match self.role {
            Role::Init => vec![0x00],
            Role::Main => encode_params(self.id, pump.model(), args)?,
        };
        self.state = CommandState::Encoded;
        Ok(())
    }

    /// Send the core frame and wait for one reply frame
    fn exchange<T: StickTransport>(&mut self, pump: &mut Pump<T>) -> Result<(), PumpError> {
        let packet = Packet::to_pump(pump.serial(), self.opcode, &self.params);
        let radio = pump.radio();
        let exchange = RadioExchange {
            timeout_ms: self.timeout_ms,
            retry: self.radio_retries,
            channel_tx: radio.channel_tx,
            channel_rx: radio.channel_rx,
            ..RadioExchange::default()
        };

        debug!("Pump TX: {}", packet);
        let encoded = packet.encoded();
        self.tx.push(packet);
        let raw = pump.stick_mut().radio_write_read(&encoded, &exchange)?;
        self.state = CommandState::Sent;

        let reply = Packet::from_pump(&raw, self.reply)?;
        debug!("Pump RX: {}", reply);
        self.rx.push(reply);
        self.state = CommandState::Received;
        Ok(())
    }

    fn decode<T: StickTransport>(&self, pump: &Pump<T>) -> Result<Response, PumpError> {
        match (&self.kind, self.role) {
            (CommandKind::SimpleSet, _) | (_, Role::Init) => {
                check_ack(&self.rx, self.id.name())?;
                Ok(Response::Ack)
            }
            (CommandKind::Phased(_), Role::Main) if self.id.shape() == Shape::PhasedSet => {
                check_ack(&self.rx, self.id.name())?;
                Ok(Response::Ack)
            }
            (CommandKind::SimpleGet, Role::Main) => {
                let payload = extract_payload(&self.rx, Extraction::Last)?;
                interpret_payload(self.id, &payload, pump.model())
            }
            (CommandKind::Phased(_), Role::Main) => {
                let extraction = Extraction::Concatenate {
                    skip: self.prelude_len,
                };
                let payload = extract_payload(&self.rx, extraction)?;
                interpret_payload(self.id, &payload, pump.model())
            }
        }
    }

    fn store<T: StickTransport>(
        &mut self,
        pump: &mut Pump<T>,
        response: &Response,
    ) -> Result<(), PumpError> {
        if self.role != Role::Main {
            return Ok(());
        }
        if let Some(reporter) = pump.reporter_mut() {
            store_response(self.id, response, reporter)?;
            self.state = CommandState::Stored;
        }
        Ok(())
    }
}

/// A stick or pump command, as built by the registry
#[derive(Debug, Clone)]
pub enum Command {
    Stick(StickCommand),
    Pump(Box<PumpCommand>),
}

impl Command {
    pub fn id(&self) -> CommandId {
        match self {
            Command::Stick(cmd) => CommandId::Stick(cmd.op()),
            Command::Pump(cmd) => CommandId::Pump(cmd.id()),
        }
    }

    pub fn state(&self) -> CommandState {
        match self {
            Command::Stick(cmd) => cmd.state(),
            Command::Pump(cmd) => cmd.state(),
        }
    }

    pub fn run<T: StickTransport>(
        &mut self,
        pump: &mut Pump<T>,
        args: &CommandArgs,
    ) -> Result<Response, PumpError> {
        match self {
            Command::Stick(cmd) => {
                let none = StickArgs::None;
                let stick_args = match args {
                    CommandArgs::Stick(stick_args) => stick_args,
                    CommandArgs::None => &none,
                    other => {
                        return Err(PumpError::InvalidParameter(format!(
                            "{} does not take {:?}",
                            cmd.op().name(),
                            other
                        )));
                    }
                };
                let response = cmd.run(pump.stick_mut(), stick_args)?;
                Ok(Response::Stick(response.clone()))
            }
            Command::Pump(cmd) => cmd.run(pump, args).cloned(),
        }
    }
}
