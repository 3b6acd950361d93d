//! Driver for Medtronic MiniMed insulin pumps, spoken to over the air
//! through a CC1111 based USB radio stick.
//!
//! # Features
//!
//! - `serial` - Serial port transport for sticks enumerating as USB CDC devices
//!
//! # Example
//!
//! ```ignore
//! use minimed_rf::{Pump, PumpConfig, SerialTransport, Stick};
//!
//! let config = PumpConfig::from_file("pump.json")?;
//! let transport = SerialTransport::new("/dev/ttyACM0", 115200)?;
//! let mut pump = Pump::new(Stick::new(transport), &config)?;
//!
//! pump.tune()?;
//! pump.power_up(10)?;
//! println!("Battery: {} V", pump.read_battery()?);
//! ```

mod command;
mod config;
mod crc;
mod error;
mod history;
mod packet;
mod pump;
mod registry;
mod report;
mod response;
mod stick;
mod transport;
mod types;

#[cfg(feature = "serial")]
mod serial;

// Re-exports
pub use command::{Command, CommandKind, CommandState, PhaseCounts, PhasedExecution, PumpCommand, WakePolicy};
pub use config::{PumpConfig, PumpModel, RadioConfig};
pub use crc::{crc8, crc16};
pub use error::{PacketError, PumpError};
pub use history::{HISTORY_PAGES, PAGE_ACKS, verify_page};
pub use packet::{Packet, PacketKind, decode_4b6b, encode_4b6b, encode_frame};
pub use pump::{DEFAULT_SESSION_MINUTES, Pump};
pub use registry::{CommandArgs, CommandId, PumpCommandId, Shape, build, lookup, lookup_pump, lookup_stick};
pub use report::{JsonReporter, MemoryReporter, Reporter};
pub use response::{
    Extraction, Payload, Response, check_ack, extract_payload, interpret_payload, store_response,
};
pub use stick::{
    EOP, RadioExchange, RadioRegister, Stick, StickArgs, StickCommand, StickOp, StickResponse,
};
pub use transport::StickTransport;
pub use types::{
    BasalProfile, BasalProfileName, BasalRate, BgTarget, BgTargets, BgUnits, Button, CarbUnits,
    DailyTotals, DayTime, Factor, FactorUnits, Factors, PumpSettings, PumpStatus, TbUnits,
    TempBasal,
};

#[cfg(feature = "serial")]
pub use serial::{STICK_PID, STICK_VID, SerialTransport};

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use serde_json::{Map, Value, json};
    use std::cell::RefCell;
    use std::collections::{HashSet, VecDeque};
    use std::rc::Rc;

    const SERIAL: [u8; 3] = [0x12, 0x34, 0x56];

    // Stick status byte for "nothing heard on the radio"
    const NO_RADIO_REPLY: u8 = 0xAA;

    /// Mock transport replaying scripted stick replies, one per read, and
    /// recording every write
    struct MockTransport {
        replies: VecDeque<Vec<u8>>,
        written: Vec<Vec<u8>>,
    }

    impl MockTransport {
        fn new(replies: Vec<Vec<u8>>) -> Self {
            Self {
                replies: replies.into(),
                written: Vec::new(),
            }
        }
    }

    impl StickTransport for MockTransport {
        type Error = std::io::Error;

        fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error> {
            self.written.push(data.to_vec());
            Ok(data.len())
        }

        fn read(&mut self, buf: &mut [u8], _timeout_ms: u32) -> Result<usize, Self::Error> {
            let Some(reply) = self.replies.pop_front() else {
                return Ok(0);
            };
            let len = reply.len().min(buf.len());
            buf[..len].copy_from_slice(&reply[..len]);
            if len < reply.len() {
                self.replies.push_front(reply[len..].to_vec());
            }
            Ok(len)
        }

        fn clear_input(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    /// Reporter sharing its storage with the test
    #[derive(Clone, Default)]
    struct SharedReporter(Rc<RefCell<MemoryReporter>>);

    impl Reporter for SharedReporter {
        fn add(
            &mut self,
            report: &str,
            path: &[&str],
            entries: Map<String, Value>,
            overwrite: bool,
        ) -> Result<(), PumpError> {
            self.0.borrow_mut().add(report, path, entries, overwrite)
        }
    }

    fn pump_with(replies: Vec<Vec<u8>>) -> Pump<MockTransport> {
        let config = PumpConfig::new("123456");
        Pump::new(Stick::new(MockTransport::new(replies)), &config).unwrap()
    }

    /// Radio frame from the pump as relayed by the stick
    fn radio(opcode: u8, body: &[u8]) -> Vec<u8> {
        let mut raw = vec![0x4A, 0x01];
        raw.extend(encode_4b6b(&encode_frame(SERIAL, opcode, body)));
        raw.push(EOP);
        raw
    }

    fn ack() -> Vec<u8> {
        radio(0x06, &[0x00])
    }

    fn data(opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut body = vec![payload.len() as u8];
        body.extend_from_slice(payload);
        radio(opcode, &body)
    }

    fn big(opcode: u8, sequence: u8, chunk: &[u8]) -> Vec<u8> {
        let mut body = vec![sequence];
        body.extend_from_slice(chunk);
        body.resize(65, 0);
        radio(opcode, &body)
    }

    fn timeout() -> Vec<u8> {
        vec![NO_RADIO_REPLY]
    }

    /// Decoded pump frames sent through WriteReadStickRadio
    fn sent_frames(pump: &Pump<MockTransport>) -> Vec<Vec<u8>> {
        pump.stick()
            .transport()
            .written
            .iter()
            .filter(|w| w[0] == StickOp::WriteReadRadio.code())
            .map(|w| decode_4b6b(&w[13..w.len() - 1]).unwrap())
            .collect()
    }

    fn decode(id: PumpCommandId, bytes: &[u8]) -> Result<Response, PumpError> {
        let payload = Payload {
            bytes: bytes.to_vec(),
            size: bytes.len(),
        };
        interpret_payload(id, &payload, &PumpModel::default())
    }

    // ===================
    // checksum tests
    // ===================

    #[test]
    fn test_crc8_check_value() {
        assert_eq!(crc8(b"123456789"), 0xEA);
        assert_eq!(crc8(&[]), 0x00);
    }

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x29B1);
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_crc16_detects_single_bit_flips() {
        let page: Vec<u8> = (0..1022).map(|i| (i * 7 % 256) as u8).collect();
        let crc = crc16(&page);
        for i in (0..page.len()).step_by(31).chain([page.len() - 1]) {
            for bit in 0..8 {
                let mut corrupted = page.clone();
                corrupted[i] ^= 1 << bit;
                assert_ne!(crc16(&corrupted), crc, "byte {} bit {}", i, bit);
            }
        }
    }

    #[test]
    fn test_crc8_detects_single_bit_flips() {
        let frame = encode_frame(SERIAL, 0x72, &[0x00]);
        let crc = crc8(&frame[..frame.len() - 1]);
        for i in 0..frame.len() - 1 {
            for bit in 0..8 {
                let mut corrupted = frame[..frame.len() - 1].to_vec();
                corrupted[i] ^= 1 << bit;
                assert_ne!(crc8(&corrupted), crc);
            }
        }
    }

    // ===================
    // frame codec tests
    // ===================

    #[test]
    fn test_4b6b_known_vector() {
        assert_eq!(encode_4b6b(&[0xA7]), [0xA9, 0x65]);
        assert_eq!(decode_4b6b(&[0xA9, 0x65]).unwrap(), [0xA7]);
    }

    #[test]
    fn test_4b6b_round_trip_even_and_odd_lengths() {
        let even = encode_frame(SERIAL, 0x06, &[0x00, 0x01]);
        let odd = encode_frame(SERIAL, 0x06, &[0x00]);
        assert_eq!(even.len() % 2, 0);
        assert_eq!(odd.len() % 2, 1);
        assert_eq!(decode_4b6b(&encode_4b6b(&even)).unwrap(), even);
        assert_eq!(decode_4b6b(&encode_4b6b(&odd)).unwrap(), odd);
    }

    #[test]
    fn test_4b6b_invalid_symbol() {
        assert_eq!(decode_4b6b(&[0xFF]), Err(PacketError::InvalidEncoding(0x3F)));
    }

    #[test]
    fn test_encode_frame_layout() {
        let frame = encode_frame(SERIAL, 0x5D, &[0x00]);
        assert_eq!(&frame[..6], [0xA7, 0x12, 0x34, 0x56, 0x5D, 0x00]);
        assert_eq!(frame[6], crc8(&frame[..6]));
    }

    #[test]
    fn test_packet_from_pump_status() {
        let mut raw = ack();
        raw.pop();
        let packet = Packet::from_pump(&raw, PacketKind::Status).unwrap();
        assert!(packet.is_ack());
        assert_eq!(packet.serial, SERIAL);
        assert_eq!(packet.rssi, Some(0x4A));
        assert_eq!(packet.number, Some(0x01));
        assert_eq!(packet.encoded(), raw[2..]);
    }

    #[test]
    fn test_packet_checksum_mismatch() {
        let mut frame = encode_frame(SERIAL, 0x06, &[0x00]);
        let good = *frame.last().unwrap();
        *frame.last_mut().unwrap() ^= 0x01;

        let result = Packet::parse(&frame, PacketKind::Status);
        assert_eq!(
            result,
            Err(PacketError::ChecksumMismatch {
                expected: good ^ 0x01,
                computed: good,
            })
        );
    }

    #[test]
    fn test_packet_data_size_exceeds_body() {
        let frame = encode_frame(SERIAL, 0x72, &[0x05, 0x01, 0x02]);
        assert!(matches!(
            Packet::parse(&frame, PacketKind::Data),
            Err(PacketError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_packet_data_payload_uses_declared_size() {
        let frame = encode_frame(SERIAL, 0x72, &[0x02, 0x01, 0x02, 0x03]);
        let packet = Packet::parse(&frame, PacketKind::Data).unwrap();
        assert_eq!(packet.payload, [0x01, 0x02]);
        assert_eq!(packet.size, 2);
    }

    #[test]
    fn test_packet_big_requires_full_body() {
        let frame = encode_frame(SERIAL, 0x80, &[0x01; 10]);
        assert!(matches!(
            Packet::parse(&frame, PacketKind::Big),
            Err(PacketError::MalformedFrame(_))
        ));

        let mut body = vec![0x85];
        body.extend([0x11; 64]);
        let packet = Packet::parse(&encode_frame(SERIAL, 0x80, &body), PacketKind::Big).unwrap();
        assert_eq!(packet.sequence, Some(0x85));
        assert!(packet.is_last());
        assert_eq!(packet.payload, [0x11; 64]);
    }

    #[test]
    fn test_packet_empty_status_rejected() {
        let frame = encode_frame(SERIAL, 0x06, &[]);
        assert!(matches!(
            Packet::parse(&frame, PacketKind::Status),
            Err(PacketError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_packet_wrong_recipient() {
        let mut frame = encode_frame(SERIAL, 0x06, &[0x00]);
        frame[0] = 0xA8;
        assert!(matches!(
            Packet::parse(&frame, PacketKind::Status),
            Err(PacketError::MalformedFrame(_))
        ));
    }

    // ===================
    // stick tests
    // ===================

    #[test]
    fn test_stick_timeout_formula() {
        assert_eq!(RadioExchange::default().stick_timeout_ms(), 1500);

        let exchange = RadioExchange {
            timeout_ms: 150,
            retry: 0,
            ..RadioExchange::default()
        };
        assert_eq!(exchange.stick_timeout_ms(), 650);
    }

    #[test]
    fn test_stick_timeout_saturates() {
        let exchange = RadioExchange {
            timeout_ms: 2_000_000_000,
            retry: 3,
            ..RadioExchange::default()
        };
        assert_eq!(exchange.stick_timeout_ms(), u32::MAX);

        let mut cmd = StickCommand::new(StickOp::ReadRadio);
        let mut stick = Stick::new(MockTransport::new(vec![]));
        let args = StickArgs::ReadRadio {
            timeout_ms: u32::MAX,
            channel: 0,
        };
        assert_eq!(cmd.run(&mut stick, &args), Err(PumpError::RadioTimeout));
        assert_eq!(cmd.timeout_ms(), u32::MAX);
        assert_eq!(cmd.tx(), [20, 0, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_stick_name() {
        let mut transport = MockTransport::new(vec![b"GNU".to_vec()]);
        let mut stick = Stick::new(&mut transport);
        assert_eq!(stick.name().unwrap(), "GNU");
        assert_eq!(transport.written, [vec![0x00]]);
    }

    #[test]
    fn test_stick_write_read_radio_wire_format() {
        let mut stick = Stick::new(MockTransport::new(vec![vec![0x40, 0x02, 0x55, EOP]]));
        let reply = stick
            .radio_write_read(&[0xAB, 0xCD], &RadioExchange::default())
            .unwrap();

        assert_eq!(reply, [0x40, 0x02, 0x55]);
        assert_eq!(
            stick.transport().written[0],
            [22, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0xFA, 3, 0xAB, 0xCD, 0]
        );
    }

    #[test]
    fn test_stick_write_radio_wire_format() {
        let mut stick = Stick::new(MockTransport::new(vec![]));
        stick.radio_write(&[0x01], 2, 10, 0).unwrap();
        assert_eq!(stick.transport().written[0], [21, 0, 0, 0, 0, 10, 0x01, 0]);
    }

    #[test]
    fn test_stick_read_radio_command_timeout() {
        let mut cmd = StickCommand::new(StickOp::ReadRadio);
        let mut stick = Stick::new(MockTransport::new(vec![vec![0x40, 0x02, 0x55, EOP]]));
        let args = StickArgs::ReadRadio {
            timeout_ms: 1000,
            channel: 2,
        };

        let response = cmd.run(&mut stick, &args).unwrap();
        assert_eq!(*response, StickResponse::Radio(vec![0x40, 0x02, 0x55]));
        assert_eq!(cmd.timeout_ms(), 1500);
        assert_eq!(cmd.tx(), [20, 2, 0, 0, 0x03, 0xE8]);
    }

    #[test]
    fn test_stick_radio_error_bytes() {
        let mut stick = Stick::new(MockTransport::new(vec![
            vec![0xAA],
            vec![0xBB],
            vec![0xCC],
        ]));
        let exchange = RadioExchange::default();

        assert_eq!(
            stick.radio_write_read(&[0x01], &exchange),
            Err(PumpError::RadioTimeout)
        );
        assert!(matches!(
            stick.radio_write_read(&[0x01], &exchange),
            Err(PumpError::RadioError(_))
        ));
        assert!(matches!(
            stick.radio_write_read(&[0x01], &exchange),
            Err(PumpError::RadioError(_))
        ));
    }

    #[test]
    fn test_stick_radio_prefix_is_not_eop() {
        let mut stick = Stick::new(MockTransport::new(vec![
            vec![0x00],
            vec![EOP],
            vec![0x55, 0x56, EOP],
        ]));
        let data = stick
            .radio_write_read(&[0x01], &RadioExchange::default())
            .unwrap();
        assert_eq!(data, [0x00, EOP, 0x55, 0x56]);
    }

    #[test]
    fn test_stick_silence_is_radio_timeout() {
        let mut stick = Stick::new(MockTransport::new(vec![]));
        assert_eq!(
            stick.radio_write_read(&[0x01], &RadioExchange::default()),
            Err(PumpError::RadioTimeout)
        );
    }

    #[test]
    fn test_stick_register_access() {
        let mut stick = Stick::new(MockTransport::new(vec![vec![0x5D]]));
        assert_eq!(stick.read_register(RadioRegister::Freq2).unwrap(), 0x5D);
        stick.write_register(RadioRegister::ChanNr, 2).unwrap();

        let written = &stick.transport().written;
        assert_eq!(written[0], [10, 9]);
        assert_eq!(written[1], [11, 6, 2]);
        assert_eq!(RadioRegister::from_name("freq0"), Some(RadioRegister::Freq0));
    }

    #[test]
    fn test_stick_tune() {
        let mut stick = Stick::new(MockTransport::new(vec![]));
        stick.tune(916.665).unwrap();
        assert_eq!(
            stick.transport().written,
            [vec![11, 9, 0x26], vec![11, 10, 0x31], vec![11, 11, 0xC3]]
        );
        assert!(matches!(stick.tune(100.0), Err(PumpError::InvalidParameter(_))));
    }

    #[test]
    fn test_stick_command_rejects_wrong_args() {
        let mut cmd = StickCommand::new(StickOp::ReadRadioRegister);
        let mut stick = Stick::new(MockTransport::new(vec![]));
        assert!(matches!(
            cmd.run(&mut stick, &StickArgs::None),
            Err(PumpError::InvalidParameter(_))
        ));
        assert_eq!(cmd.state(), CommandState::Failed);
        assert!(stick.transport().written.is_empty());
    }

    // ===================
    // registry tests
    // ===================

    #[test]
    fn test_lookup_by_name() {
        assert_eq!(
            lookup("ReadPumpBattery"),
            Some(CommandId::Pump(PumpCommandId::ReadBattery))
        );
        assert_eq!(
            lookup("WriteReadStickRadio"),
            Some(CommandId::Stick(StickOp::WriteReadRadio))
        );
        assert_eq!(lookup("ReadPumpNothing"), None);
    }

    #[test]
    fn test_lookup_by_code() {
        assert_eq!(lookup_stick(22), Some(CommandId::Stick(StickOp::WriteReadRadio)));
        assert_eq!(lookup_stick(99), None);
        assert_eq!(lookup_pump("5D"), Some(CommandId::Pump(PumpCommandId::Power)));
        assert_eq!(lookup_pump("4D"), Some(CommandId::Pump(PumpCommandId::Resume)));
        assert_eq!(lookup_pump("ZZ"), None);
    }

    #[test]
    fn test_registry_names_unique() {
        let names: HashSet<_> = PumpCommandId::all().map(|id| id.name()).collect();
        assert_eq!(names.len(), PumpCommandId::all().count());
        for id in PumpCommandId::all() {
            assert_eq!(PumpCommandId::from_name(id.name()), Some(id));
        }
    }

    #[test]
    fn test_command_shapes() {
        assert_eq!(PumpCommandId::Power.shape(), Shape::PhasedSet);
        assert_eq!(PumpCommandId::ReadBasalA.shape(), Shape::PhasedGet);
        assert_eq!(PumpCommandId::ReadHistoryPage.shape(), Shape::PhasedGet);
        assert_eq!(PumpCommandId::ReadTime.shape(), Shape::SimpleGet);

        let history = PumpCommand::new(PumpCommandId::ReadHistoryPage);
        assert_eq!(
            history.counts(),
            Some(PhaseCounts {
                init: 0,
                ack: 15,
                nak: 10
            })
        );
        assert_eq!(history.timeout_ms(), 150);

        let bolus = PumpCommand::new(PumpCommandId::DeliverBolus);
        assert_eq!(
            bolus.counts(),
            Some(PhaseCounts {
                init: 1,
                ack: 0,
                nak: 0
            })
        );
        assert_eq!(bolus.timeout_ms(), 250);
        assert_eq!(PumpCommand::new(PumpCommandId::ReadBattery).counts(), None);
    }

    // ===================
    // parameter encoding tests
    // ===================

    #[test]
    fn test_power_frame() {
        let mut pump = pump_with(vec![ack(), ack()]);
        pump.power_up(10).unwrap();

        let frames = sent_frames(&pump);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][4..6], [0x5D, 0x00]);
        assert_eq!(frames[1][4], 0x5D);
        assert_eq!(frames[1][5..8], [0x02, 0x01, 0x0A]);
        assert!(frames[1][8..70].iter().all(|&b| b == 0));
        assert_eq!(frames[1].len(), 5 + 65 + 1);
    }

    #[test]
    fn test_power_session_too_long() {
        let mut pump = pump_with(vec![]);
        assert!(matches!(pump.power_up(31), Err(PumpError::InvalidParameter(_))));
        assert!(pump.stick().transport().written.is_empty());
    }

    #[test]
    fn test_bolus_encoding() {
        let mut pump = pump_with(vec![ack(), ack(), ack(), ack()]);
        pump.deliver_bolus(2.5).unwrap();
        pump.deliver_bolus(2.3).unwrap();

        let frames = sent_frames(&pump);
        assert_eq!(frames[1][4..7], [0x42, 0x01, 25]);
        assert_eq!(frames[3][4..7], [0x42, 0x01, 23]);
    }

    #[test]
    fn test_bolus_out_of_range() {
        let mut pump = pump_with(vec![]);
        assert!(matches!(pump.deliver_bolus(26.0), Err(PumpError::InvalidParameter(_))));
        assert!(matches!(pump.deliver_bolus(-1.0), Err(PumpError::InvalidParameter(_))));
        assert!(matches!(
            pump.deliver_bolus(f64::NAN),
            Err(PumpError::InvalidParameter(_))
        ));
        assert!(pump.stick().transport().written.is_empty());
    }

    #[test]
    fn test_set_temp_basal_absolute() {
        let mut pump = pump_with(vec![ack(), ack(), ack(), ack()]);
        pump.set_temp_basal(TbUnits::UnitsPerHour, 1.2, 60.0).unwrap();

        let frames = sent_frames(&pump);
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[1][4..7], [0x68, 0x01, 0x00]);
        assert_eq!(frames[3][4..9], [0x4C, 0x03, 0x00, 0x30, 0x02]);
    }

    #[test]
    fn test_set_temp_basal_percentage() {
        let mut pump = pump_with(vec![ack(), ack(), ack(), ack()]);
        pump.set_temp_basal(TbUnits::Percent, 150.0, 90.0).unwrap();

        let frames = sent_frames(&pump);
        assert_eq!(frames[1][4..7], [0x68, 0x01, 0x01]);
        assert_eq!(frames[3][4..8], [0x69, 0x02, 150, 3]);
    }

    #[test]
    fn test_cancel_temp_basal() {
        let mut pump = pump_with(vec![ack(), ack(), ack(), ack()]);
        pump.cancel_temp_basal().unwrap();

        let frames = sent_frames(&pump);
        assert_eq!(frames[3][4..9], [0x4C, 0x03, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_temp_basal_out_of_range() {
        let mut pump = pump_with(vec![]);
        assert!(matches!(
            pump.set_absolute_temp_basal(35.1, 30.0),
            Err(PumpError::InvalidParameter(_))
        ));
        assert!(matches!(
            pump.set_percentage_temp_basal(201.0, 30.0),
            Err(PumpError::InvalidParameter(_))
        ));
        assert!(matches!(
            pump.set_percentage_temp_basal(100.0, 24.5 * 60.0),
            Err(PumpError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_suspend_and_resume_share_opcode() {
        let mut pump = pump_with(vec![ack(), ack(), ack(), ack()]);
        pump.suspend().unwrap();
        pump.resume().unwrap();

        let frames = sent_frames(&pump);
        assert_eq!(frames[1][4..7], [0x4D, 0x01, 0x01]);
        assert_eq!(frames[3][4..7], [0x4D, 0x01, 0x00]);
    }

    #[test]
    fn test_push_button() {
        let mut pump = pump_with(vec![ack(), ack()]);
        pump.push_button(Button::Act).unwrap();
        assert_eq!(sent_frames(&pump)[1][4..7], [0x5B, 0x01, 0x02]);
    }

    // ===================
    // command engine tests
    // ===================

    #[test]
    fn test_simple_get_battery() {
        let mut pump = pump_with(vec![data(0x72, &[0x00, 0x02, 0x58])]);
        assert_abs_diff_eq!(pump.read_battery().unwrap(), 6.0, epsilon = 1e-9);

        let frames = sent_frames(&pump);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][4..6], [0x72, 0x00]);
        assert_eq!(pump.stick().transport().written[0][12], 3);
    }

    #[test]
    fn test_simple_get_timeout_propagates() {
        let mut pump = pump_with(vec![]);
        assert_eq!(pump.read_battery(), Err(PumpError::RadioTimeout));
        assert_eq!(sent_frames(&pump).len(), 1);
    }

    #[test]
    fn test_command_state_transitions() {
        let mut pump = pump_with(vec![data(0x72, &[0x00, 0x02, 0x58])]);
        let mut cmd = pump.command(CommandId::Pump(PumpCommandId::ReadBattery));
        assert_eq!(cmd.state(), CommandState::Idle);

        let response = cmd.run(&mut pump, &CommandArgs::None).unwrap();
        assert_eq!(response, Response::Battery(6.0));
        assert_eq!(cmd.state(), CommandState::Idle);

        let Command::Pump(pump_cmd) = &cmd else {
            panic!("expected a pump command");
        };
        assert_eq!(pump_cmd.tx().len(), 1);
        assert_eq!(pump_cmd.rx().len(), 1);

        assert!(cmd.run(&mut pump, &CommandArgs::None).is_err());
        assert_eq!(cmd.state(), CommandState::Failed);
    }

    #[test]
    fn test_set_rejected_by_pump() {
        let mut pump = pump_with(vec![ack(), radio(0x15, &[0x00])]);
        assert!(matches!(pump.suspend(), Err(PumpError::UnsuccessfulCommand(_))));
    }

    #[test]
    fn test_set_error_status_rejected() {
        let mut pump = pump_with(vec![ack(), radio(0x06, &[0x01])]);
        assert!(matches!(pump.suspend(), Err(PumpError::UnsuccessfulCommand(_))));
    }

    #[test]
    fn test_set_without_nak_budget_reraises() {
        let mut pump = pump_with(vec![ack()]);
        assert_eq!(pump.suspend(), Err(PumpError::RadioTimeout));
        assert_eq!(sent_frames(&pump).len(), 2);
    }

    #[test]
    fn test_power_wakes_after_silence() {
        let mut pump = pump_with(vec![timeout(), timeout(), timeout(), ack(), ack()]);
        pump.power_up(10).unwrap();

        let frames = sent_frames(&pump);
        assert_eq!(frames.len(), 5);
        assert!(frames[..4].iter().all(|f| f[4..6] == [0x5D, 0x00]));
    }

    #[test]
    fn test_power_no_pump_response() {
        let mut pump = pump_with(vec![]);
        assert_eq!(pump.power_up(10), Err(PumpError::NoPumpResponse));
        assert_eq!(sent_frames(&pump).len(), 50);
    }

    #[test]
    fn test_power_garbled_wake_is_retried() {
        let mut garbled = ack();
        garbled[3] ^= 0xFF;
        let mut pump = pump_with(vec![garbled, ack(), ack()]);
        pump.power_up(5).unwrap();
        assert_eq!(sent_frames(&pump).len(), 3);
    }

    fn basal_chunk() -> Vec<u8> {
        // 1.0 U/h from 00:00, 2.0 U/h from 08:00
        vec![0x28, 0x00, 0x00, 0x50, 0x00, 0x10]
    }

    #[test]
    fn test_basal_profile_concatenates_frames() {
        let mut pump = pump_with(vec![
            big(0x92, 0x01, &basal_chunk()),
            big(0x92, 0x82, &[]),
        ]);
        let profile = pump.read_basal_profile(BasalProfileName::Standard).unwrap();

        assert_eq!(profile.name, BasalProfileName::Standard);
        assert_eq!(profile.rates.len(), 2);
        assert_eq!(profile.rates[0].time, DayTime(0));
        assert_abs_diff_eq!(profile.rates[0].rate, 1.0, epsilon = 1e-9);
        assert_eq!(profile.rates[1].time, DayTime(480));
        assert_abs_diff_eq!(profile.rates[1].rate, 2.0, epsilon = 1e-9);

        let frames = sent_frames(&pump);
        let opcodes: Vec<u8> = frames.iter().map(|f| f[4]).collect();
        assert_eq!(opcodes, [0x92, 0x06]);
        // Phased gets listen 150 ms per attempt
        assert_eq!(pump.stick().transport().written[0][8..12], [0, 0, 0, 150]);
    }

    #[test]
    fn test_nak_recovers_lost_frame() {
        let mut pump = pump_with(vec![
            big(0x93, 0x01, &basal_chunk()),
            timeout(),
            big(0x93, 0x82, &[]),
        ]);
        let profile = pump.read_basal_profile(BasalProfileName::A).unwrap();
        assert_eq!(profile.rates.len(), 2);

        let opcodes: Vec<u8> = sent_frames(&pump).iter().map(|f| f[4]).collect();
        assert_eq!(opcodes, [0x93, 0x06, 0x15]);
    }

    #[test]
    fn test_nak_recovers_lost_core_frame() {
        let mut pump = pump_with(vec![timeout(), timeout(), big(0x94, 0x01, &basal_chunk()), big(0x94, 0x82, &[])]);
        let profile = pump.read_basal_profile(BasalProfileName::B).unwrap();
        assert_eq!(profile.rates.len(), 2);

        let opcodes: Vec<u8> = sent_frames(&pump).iter().map(|f| f[4]).collect();
        assert_eq!(opcodes, [0x94, 0x15, 0x15, 0x06]);
    }

    #[test]
    fn test_nak_budget_exhausted() {
        let mut pump = pump_with(vec![big(0x92, 0x01, &basal_chunk())]);
        let result = pump.read_basal_profile(BasalProfileName::Standard);
        assert!(matches!(result, Err(PumpError::UnsuccessfulCommand(_))));

        // Core, one ACK, then exactly ten NAKs
        let opcodes: Vec<u8> = sent_frames(&pump).iter().map(|f| f[4]).collect();
        assert_eq!(opcodes.len(), 12);
        assert_eq!(opcodes[..2], [0x92, 0x06]);
        assert!(opcodes[2..].iter().all(|&op| op == 0x15));
    }

    #[test]
    fn test_empty_basal_profile() {
        let mut pump = pump_with(vec![
            big(0x92, 0x01, &[0x00, 0x00, 0x3F]),
            big(0x92, 0x82, &[]),
        ]);
        let profile = pump.read_basal_profile(BasalProfileName::Standard).unwrap();
        assert!(profile.rates.is_empty());
    }

    // ===================
    // history tests
    // ===================

    fn history_page(corrupt: Option<usize>) -> (Vec<u8>, Vec<Vec<u8>>) {
        let mut page: Vec<u8> = (0..1022).map(|i| (i % 251) as u8).collect();
        let crc = crc16(&page);
        page.extend(crc.to_be_bytes());
        if let Some(i) = corrupt {
            page[i] ^= 0x01;
        }

        let replies = page
            .chunks(64)
            .enumerate()
            .map(|(i, chunk)| {
                let last = if i == 15 { 0x80 } else { 0x00 };
                big(0x80, (i as u8 + 1) | last, chunk)
            })
            .collect();
        (page, replies)
    }

    #[test]
    fn test_read_history_page() {
        let (page, replies) = history_page(None);
        let mut pump = pump_with(replies);

        let data = pump.read_history_page(3).unwrap();
        assert_eq!(data, page[..1022]);

        let frames = sent_frames(&pump);
        assert_eq!(frames.len(), 16);
        assert_eq!(frames[0][4..7], [0x80, 0x01, 0x03]);
        assert!(frames[1..].iter().all(|f| f[4] == 0x06));
    }

    #[test]
    fn test_history_page_bad_crc() {
        let (page, replies) = history_page(Some(1023));
        let mut pump = pump_with(replies);

        let expected = u16::from_be_bytes([page[1022], page[1023]]);
        let computed = crc16(&page[..1022]);
        assert_eq!(
            pump.read_history_page(0),
            Err(PumpError::HistoryPageBadCrc { expected, computed })
        );
    }

    #[test]
    fn test_history_page_corrupted_data_byte() {
        let (clean, _) = history_page(None);
        let (page, replies) = history_page(Some(500));
        let mut pump = pump_with(replies);

        let expected = crc16(&clean[..1022]);
        let computed = crc16(&page[..1022]);
        assert_ne!(expected, computed);
        assert_eq!(
            pump.read_history_page(0),
            Err(PumpError::HistoryPageBadCrc { expected, computed })
        );
    }

    #[test]
    fn test_history_page_out_of_range() {
        let mut pump = pump_with(vec![]);
        assert!(matches!(
            pump.read_history_page(HISTORY_PAGES),
            Err(PumpError::InvalidParameter(_))
        ));
        assert!(pump.stick().transport().written.is_empty());
    }

    #[test]
    fn test_verify_page() {
        let mut page = vec![0x01, 0x02, 0x03];
        page.extend(crc16(&page).to_be_bytes());
        assert_eq!(verify_page(&page).unwrap(), [0x01, 0x02, 0x03]);
    }

    // ===================
    // decode tests
    // ===================

    #[test]
    fn test_decode_time() {
        let response = decode(PumpCommandId::ReadTime, &[13, 45, 10, 0x07, 0xE2, 3, 14]).unwrap();
        let expected = chrono::NaiveDate::from_ymd_opt(2018, 3, 14)
            .unwrap()
            .and_hms_opt(13, 45, 10)
            .unwrap();
        assert_eq!(response, Response::Time(expected));
    }

    #[test]
    fn test_decode_invalid_time() {
        let result = decode(PumpCommandId::ReadTime, &[25, 0, 0, 0x07, 0xE2, 3, 14]);
        assert!(matches!(result, Err(PumpError::InvalidPacket(_))));
    }

    #[test]
    fn test_decode_model_and_firmware() {
        assert_eq!(
            decode(PumpCommandId::ReadModel, &[0x03, b'5', b'2', b'2']).unwrap(),
            Response::Model(522)
        );
        assert_eq!(
            decode(PumpCommandId::ReadFirmware, b"VER 2.4A1.1").unwrap(),
            Response::Firmware("VER 2.4A 1.1".into())
        );
    }

    #[test]
    fn test_decode_reservoir_and_totals() {
        let Response::Reservoir(level) = decode(PumpCommandId::ReadReservoir, &[0x05, 0xDC]).unwrap()
        else {
            panic!("expected reservoir");
        };
        assert_abs_diff_eq!(level, 150.0, epsilon = 1e-9);

        let Response::DailyTotals(totals) =
            decode(PumpCommandId::ReadDailyTotals, &[0x01, 0x2C, 0x00, 0xC8]).unwrap()
        else {
            panic!("expected daily totals");
        };
        assert_abs_diff_eq!(totals.today, 30.0, epsilon = 1e-9);
        assert_abs_diff_eq!(totals.yesterday, 20.0, epsilon = 1e-9);
    }

    #[test]
    fn test_decode_status() {
        assert_eq!(
            decode(PumpCommandId::ReadStatus, &[0x03, 0x00, 0x01]).unwrap(),
            Response::Status(PumpStatus {
                normal: true,
                bolusing: false,
                suspended: true,
            })
        );
    }

    #[test]
    fn test_decode_settings() {
        let mut payload = [0u8; 18];
        payload[5] = 100;
        payload[6] = 0x00;
        payload[7] = 0x50;
        payload[17] = 6;

        let Response::Settings(settings) = decode(PumpCommandId::ReadSettings, &payload).unwrap()
        else {
            panic!("expected settings");
        };
        assert_eq!(settings.dia, 6);
        assert_abs_diff_eq!(settings.max_bolus, 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(settings.max_basal, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_decode_short_payload() {
        assert!(matches!(
            decode(PumpCommandId::ReadSettings, &[0u8; 10]),
            Err(PumpError::InvalidPacket(PacketError::MalformedFrame(_)))
        ));
    }

    #[test]
    fn test_decode_units() {
        assert_eq!(
            decode(PumpCommandId::ReadBgUnits, &[2]).unwrap(),
            Response::BgUnits(BgUnits::MmolL)
        );
        assert_eq!(
            decode(PumpCommandId::ReadCarbUnits, &[1]).unwrap(),
            Response::CarbUnits(CarbUnits::Grams)
        );
        assert_eq!(
            decode(PumpCommandId::ReadBgUnits, &[3]),
            Err(PumpError::InvalidPacket(PacketError::UnexpectedValue {
                field: "BG units",
                value: 3,
            }))
        );
    }

    #[test]
    fn test_decode_bg_targets_mmol() {
        let Response::BgTargets(targets) =
            decode(PumpCommandId::ReadBgTargets, &[2, 0, 45, 60, 16, 50, 70]).unwrap()
        else {
            panic!("expected BG targets");
        };
        assert_eq!(targets.units, BgUnits::MmolL);
        assert_eq!(targets.targets.len(), 2);
        assert_abs_diff_eq!(targets.targets[0].low, 4.5, epsilon = 1e-9);
        assert_abs_diff_eq!(targets.targets[0].high, 6.0, epsilon = 1e-9);
        assert_eq!(targets.targets[1].time, DayTime(480));
        assert_eq!(targets.targets[1].time.to_string(), "08:00");
    }

    #[test]
    fn test_decode_isf() {
        let Response::Isf(isf) =
            decode(PumpCommandId::ReadIsf, &[1, 0x00, 50, 0x10, 40]).unwrap()
        else {
            panic!("expected ISF");
        };
        assert_eq!(isf.units, FactorUnits::MgDlPerUnit);
        assert_eq!(isf.factors.len(), 2);
        assert_eq!(isf.factors[1].time, DayTime(480));
        assert_abs_diff_eq!(isf.factors[0].value, 50.0, epsilon = 1e-9);
        assert_abs_diff_eq!(isf.factors[1].value, 40.0, epsilon = 1e-9);
    }

    #[test]
    fn test_decode_factor_high_bits() {
        // 0x41: time block 1, value MSBs 1
        let Response::Isf(isf) = decode(PumpCommandId::ReadIsf, &[2, 0x41, 0x2C]).unwrap() else {
            panic!("expected ISF");
        };
        assert_eq!(isf.units, FactorUnits::MmolLPerUnit);
        assert_eq!(isf.factors[0].time, DayTime(30));
        assert_abs_diff_eq!(isf.factors[0].value, 30.0, epsilon = 1e-9);
    }

    #[test]
    fn test_decode_csf_units() {
        let Response::Csf(csf) = decode(PumpCommandId::ReadCsf, &[2, 0x00, 12]).unwrap() else {
            panic!("expected CSF");
        };
        assert_eq!(csf.units, FactorUnits::UnitsPerExchange);
        assert_abs_diff_eq!(csf.factors[0].value, 1.2, epsilon = 1e-9);
        assert!(matches!(
            decode(PumpCommandId::ReadCsf, &[7, 0, 12]),
            Err(PumpError::InvalidPacket(PacketError::UnexpectedValue { .. }))
        ));
    }

    #[test]
    fn test_decode_temp_basal() {
        assert_eq!(
            decode(PumpCommandId::ReadTb, &[0, 0, 0x00, 0x28, 0x00, 0x1E]).unwrap(),
            Response::TempBasal(TempBasal {
                units: TbUnits::UnitsPerHour,
                rate: 1.0,
                duration: 30,
            })
        );
        assert_eq!(
            decode(PumpCommandId::ReadTb, &[1, 150, 0, 0, 0x00, 0x3C]).unwrap(),
            Response::TempBasal(TempBasal {
                units: TbUnits::Percent,
                rate: 150.0,
                duration: 60,
            })
        );
    }

    #[test]
    fn test_decode_history_size() {
        assert_eq!(
            decode(PumpCommandId::ReadHistorySize, &[0, 0, 0, 5]).unwrap(),
            Response::HistorySize(6)
        );
        assert_eq!(
            decode(PumpCommandId::ReadHistorySize, &[0, 0, 0, 40]).unwrap(),
            Response::HistorySize(HISTORY_PAGES)
        );
    }

    #[test]
    fn test_extract_payload_concatenates_after_prelude() {
        let first = Packet::parse(&encode_frame(SERIAL, 0x06, &[0x00]), PacketKind::Status).unwrap();
        let mut body = vec![0x01];
        body.extend([0xAA; 64]);
        let second = Packet::parse(&encode_frame(SERIAL, 0x92, &body), PacketKind::Big).unwrap();
        body[0] = 0x82;
        body[1..].fill(0xBB);
        let third = Packet::parse(&encode_frame(SERIAL, 0x92, &body), PacketKind::Big).unwrap();

        let rx = [first, second, third];
        let payload = extract_payload(&rx, Extraction::Concatenate { skip: 1 }).unwrap();
        assert_eq!(payload.size, 128);
        assert_eq!(payload.bytes[..64], [0xAA; 64]);
        assert_eq!(payload.bytes[64..], [0xBB; 64]);

        let last = extract_payload(&rx, Extraction::Last).unwrap();
        assert_eq!(last.bytes, [0xBB; 64]);
    }

    // ===================
    // report tests
    // ===================

    #[test]
    fn test_reporter_keeps_existing_entries() {
        let mut reporter = MemoryReporter::new();
        let first: Map<String, Value> = [("a".to_string(), json!(1))].into_iter().collect();
        let second: Map<String, Value> = [("a".to_string(), json!(2)), ("b".to_string(), json!(3))]
            .into_iter()
            .collect();

        reporter.add("r.json", &["X", "Y"], first, false).unwrap();
        reporter.add("r.json", &["X", "Y"], second.clone(), false).unwrap();
        assert_eq!(reporter.report("r.json").unwrap()["X"]["Y"], json!({"a": 1, "b": 3}));

        reporter.add("r.json", &["X", "Y"], second, true).unwrap();
        assert_eq!(reporter.report("r.json").unwrap()["X"]["Y"], json!({"a": 2, "b": 3}));
    }

    #[test]
    fn test_reporter_rejects_non_object_path() {
        let mut reporter = MemoryReporter::new();
        let leaf: Map<String, Value> = [("a".to_string(), json!(1))].into_iter().collect();
        reporter.add("r.json", &[], leaf.clone(), true).unwrap();
        assert!(matches!(
            reporter.add("r.json", &["a", "b"], leaf, true),
            Err(PumpError::Report(_))
        ));
    }

    #[test]
    fn test_store_phase_writes_reports() {
        let shared = SharedReporter::default();
        let mut pump = pump_with(vec![
            data(0x8D, &[0x03, b'5', b'2', b'2']),
            data(0x72, &[0x00, 0x02, 0x58]),
        ])
        .with_reporter(shared.clone());

        assert_eq!(pump.read_model().unwrap(), 522);
        assert_abs_diff_eq!(pump.read_battery().unwrap(), 6.0, epsilon = 1e-9);

        let reports = shared.0.borrow();
        assert_eq!(reports.report("pump.json").unwrap()["Properties"]["Model"], json!(522));
        let levels = reports.report("history.json").unwrap()["Pump"]["Battery Levels"]
            .as_object()
            .unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels.values().next(), Some(&json!(6.0)));
    }

    #[test]
    fn test_store_phase_serializes_settings_and_units() {
        let mut reporter = MemoryReporter::new();
        let settings = PumpSettings {
            dia: 4,
            max_bolus: 10.0,
            max_basal: 2.5,
        };
        let tb = TempBasal {
            units: TbUnits::Percent,
            rate: 50.0,
            duration: 30,
        };

        store_response(PumpCommandId::ReadSettings, &Response::Settings(settings), &mut reporter)
            .unwrap();
        store_response(
            PumpCommandId::ReadBgUnits,
            &Response::BgUnits(BgUnits::MmolL),
            &mut reporter,
        )
        .unwrap();
        store_response(
            PumpCommandId::ReadCarbUnits,
            &Response::CarbUnits(CarbUnits::Exchanges),
            &mut reporter,
        )
        .unwrap();
        store_response(PumpCommandId::ReadTb, &Response::TempBasal(tb), &mut reporter).unwrap();

        let pump = reporter.report("pump.json").unwrap();
        assert_eq!(
            pump["Settings"],
            json!({"DIA": 4, "Max Bolus": 10.0, "Max Basal": 2.5})
        );
        assert_eq!(
            pump["Units"],
            json!({"BG": "mmol/L", "Carbs": "exchange", "TB": "%"})
        );
    }

    #[test]
    fn test_store_phase_skipped_on_failure() {
        let shared = SharedReporter::default();
        let mut pump = pump_with(vec![]).with_reporter(shared.clone());
        assert!(pump.read_model().is_err());
        assert!(shared.0.borrow().report("pump.json").is_none());
    }

    #[test]
    fn test_json_reporter_round_trip() {
        let dir = std::env::temp_dir().join(format!("minimed-rf-{}", std::process::id()));
        let mut reporter = JsonReporter::new(&dir);
        let entries: Map<String, Value> = [("Model".to_string(), json!(722))].into_iter().collect();

        reporter.add("pump.json", &["Properties"], entries, true).unwrap();
        let loaded = reporter.load("pump.json").unwrap();
        assert_eq!(loaded["Properties"]["Model"], json!(722));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    // ===================
    // config tests
    // ===================

    #[test]
    fn test_config_defaults() {
        let config = PumpConfig::from_json(r#"{"serial": "123456"}"#).unwrap();
        assert_eq!(config.serial_bytes().unwrap(), SERIAL);
        assert_eq!(config.model, PumpModel::default());
        assert_eq!(config.radio.radio_retries, 3);
        assert_abs_diff_eq!(config.radio.frequency_mhz, 916.665, epsilon = 1e-9);
    }

    #[test]
    fn test_config_overrides() {
        let config = PumpConfig::from_json(
            r#"{"serial": "ABCDEF", "model": {"basal_stroke": 0.05}, "radio": {"channel_rx": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.serial_bytes().unwrap(), [0xAB, 0xCD, 0xEF]);
        assert_abs_diff_eq!(config.model.basal_stroke, 0.05, epsilon = 1e-9);
        assert_abs_diff_eq!(config.model.bolus_stroke, 0.1, epsilon = 1e-9);
        assert_eq!(config.radio.channel_rx, 2);
    }

    #[test]
    fn test_config_invalid_serial() {
        assert!(matches!(
            PumpConfig::from_json(r#"{"serial": "12345G"}"#),
            Err(PumpError::Config(_))
        ));
        assert!(matches!(
            PumpConfig::from_json(r#"{"serial": "1234"}"#),
            Err(PumpError::Config(_))
        ));
        assert!(matches!(PumpConfig::from_json("{"), Err(PumpError::Config(_))));
    }

    // ===================
    // dispatch tests
    // ===================

    #[test]
    fn test_run_stick_command_by_name() {
        let mut pump = pump_with(vec![b"Loic".to_vec()]);
        let id = lookup("ReadStickAuthor").unwrap();
        let response = pump.run(id, &CommandArgs::None).unwrap();
        assert!(matches!(response, Response::Stick(StickResponse::Text(_))));
    }

    #[test]
    fn test_run_pump_command_by_opcode() {
        let mut pump = pump_with(vec![data(0xCE, &[0x03, 0x00, 0x00])]);
        let id = lookup_pump("CE").unwrap();
        let response = pump.run(id, &CommandArgs::None).unwrap();
        assert_eq!(
            response,
            Response::Status(PumpStatus {
                normal: true,
                bolusing: false,
                suspended: false,
            })
        );
    }

    #[test]
    fn test_wrong_args_rejected() {
        let mut pump = pump_with(vec![]);
        let result = pump.run(
            CommandId::Pump(PumpCommandId::ReadBattery),
            &CommandArgs::Bolus { units: 1.0 },
        );
        assert!(matches!(result, Err(PumpError::InvalidParameter(_))));
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(PumpError::RadioTimeout.is_recoverable());
        assert!(PumpError::RadioError("zero data".into()).is_recoverable());
        assert!(PumpError::InvalidPacket(PacketError::InvalidEncoding(0)).is_recoverable());
        assert!(!PumpError::NoPumpResponse.is_recoverable());
        assert!(!PumpError::UnsuccessfulCommand(String::new()).is_recoverable());
    }
}
