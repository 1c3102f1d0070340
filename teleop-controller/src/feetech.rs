//! Feetech STS/SCS serial bus protocol.
//!
//! Just enough of the protocol to drive an SO-100/SO-101 arm: ping, single
//! register read, single register write and sync write of one register
//! across many servos.

use std::io::{Read, Write};
use std::time::Duration;
use thiserror::Error;

pub const HEADER: [u8; 2] = [0xFF, 0xFF];
pub const BROADCAST_ID: u8 = 0xFE;

pub const INSTR_PING: u8 = 0x01;
pub const INSTR_READ: u8 = 0x02;
pub const INSTR_WRITE: u8 = 0x03;
pub const INSTR_SYNC_WRITE: u8 = 0x83;

pub const TORQUE_ENABLE: u8 = 40;
pub const GOAL_POSITION: u8 = 42;
pub const LOCK: u8 = 55;
pub const PRESENT_POSITION: u8 = 56;

pub const DEFAULT_BAUD_RATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(50);

/// Bytes skipped while hunting for a status header before giving up
const MAX_SYNC_BYTES: usize = 64;

#[derive(Error, Debug)]
pub enum FeetechError {
    #[error("serial port error")]
    Io(#[from] std::io::Error),
    #[error("failed to open serial port")]
    Open(#[from] serialport::Error),
    #[error("failed to clear serial input")]
    ClearInput(#[source] serialport::Error),
    #[error("no status packet header found")]
    NoHeader,
    #[error("status packet checksum mismatch, expected {expected:#04x} got {found:#04x}")]
    Checksum { expected: u8, found: u8 },
    #[error("status packet from servo {found} while talking to {expected}")]
    UnexpectedId { expected: u8, found: u8 },
    #[error("servo {id} reported error flags {flags:#04x}")]
    ServoError { id: u8, flags: u8 },
    #[error("status packet too short")]
    ShortResponse,
}

type Result<T> = std::result::Result<T, FeetechError>;

pub fn checksum(data: &[u8]) -> u8 {
    let mut sum: u8 = 0;
    for &byte in data {
        sum = sum.wrapping_add(byte);
    }
    !sum
}

pub fn encode_packet(id: u8, instruction: u8, params: &[u8]) -> Vec<u8> {
    let length = (params.len() + 2) as u8;
    let mut packet = Vec::with_capacity(6 + params.len());
    packet.extend_from_slice(&HEADER);
    packet.push(id);
    packet.push(length);
    packet.push(instruction);
    packet.extend_from_slice(params);
    packet.push(checksum(&packet[2..]));
    packet
}

/// Sync write of a two byte register on many servos, answered by nobody
pub fn encode_sync_write_u16(address: u8, values: &[(u8, u16)]) -> Vec<u8> {
    let mut params = Vec::with_capacity(2 + values.len() * 3);
    params.push(address);
    params.push(2);
    for (id, value) in values {
        params.push(*id);
        params.extend_from_slice(&value.to_le_bytes());
    }
    encode_packet(BROADCAST_ID, INSTR_SYNC_WRITE, &params)
}

/// Byte stream a bus talks over
pub trait BusPort: Read + Write {
    /// Drop whatever arrived but was not read yet
    fn clear_input(&mut self) -> Result<()>;
}

impl BusPort for Box<dyn serialport::SerialPort> {
    fn clear_input(&mut self) -> Result<()> {
        self.clear(serialport::ClearBuffer::Input)
            .map_err(FeetechError::ClearInput)
    }
}

/// A single Feetech bus behind any byte stream
///
/// The bus is owned by exactly one driver. It is not shared or locked.
pub struct FeetechBus<P> {
    port: P,
}

impl FeetechBus<Box<dyn serialport::SerialPort>> {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(DEFAULT_TIMEOUT)
            .open()?;
        Ok(Self::new(port))
    }
}

impl<P: BusPort> FeetechBus<P> {
    pub fn new(port: P) -> Self {
        Self { port }
    }

    pub fn into_inner(self) -> P {
        self.port
    }

    /// Late answers to an earlier request must not be taken for the next one
    fn transmit(&mut self, packet: &[u8]) -> Result<()> {
        self.port.clear_input()?;
        self.port.write_all(packet)?;
        self.port.flush()?;
        Ok(())
    }

    fn send(&mut self, id: u8, instruction: u8, params: &[u8]) -> Result<()> {
        self.transmit(&encode_packet(id, instruction, params))
    }

    fn read_status(&mut self, expected_id: u8) -> Result<Vec<u8>> {
        let mut previous = 0u8;
        let mut skipped = 0;
        loop {
            let mut byte = [0u8; 1];
            self.port.read_exact(&mut byte)?;
            if previous == 0xFF && byte[0] == 0xFF {
                break;
            }
            previous = byte[0];
            skipped += 1;
            if skipped > MAX_SYNC_BYTES {
                return Err(FeetechError::NoHeader);
            }
        }
        let mut byte = [0xFFu8; 1];
        // 0xFF is never a valid id, extra header bytes are padding
        while byte[0] == 0xFF {
            self.port.read_exact(&mut byte)?;
            skipped += 1;
            if skipped > MAX_SYNC_BYTES {
                return Err(FeetechError::NoHeader);
            }
        }
        let id = byte[0];
        self.port.read_exact(&mut byte)?;
        let length = byte[0];
        if length < 2 {
            return Err(FeetechError::ShortResponse);
        }
        // error flags, params, checksum
        let mut rest = vec![0u8; length as usize];
        self.port.read_exact(&mut rest)?;

        let found = rest[rest.len() - 1];
        let mut summed = vec![id, length];
        summed.extend_from_slice(&rest[..rest.len() - 1]);
        let expected = checksum(&summed);
        if expected != found {
            return Err(FeetechError::Checksum { expected, found });
        }
        if id != expected_id {
            return Err(FeetechError::UnexpectedId {
                expected: expected_id,
                found: id,
            });
        }
        let flags = rest[0];
        if flags != 0 {
            return Err(FeetechError::ServoError { id, flags });
        }
        Ok(rest[1..rest.len() - 1].to_vec())
    }

    pub fn ping(&mut self, id: u8) -> Result<()> {
        self.send(id, INSTR_PING, &[])?;
        self.read_status(id)?;
        Ok(())
    }

    pub fn read_u16(&mut self, id: u8, address: u8) -> Result<u16> {
        self.send(id, INSTR_READ, &[address, 2])?;
        let data = self.read_status(id)?;
        if data.len() < 2 {
            return Err(FeetechError::ShortResponse);
        }
        Ok(u16::from_le_bytes([data[0], data[1]]))
    }

    pub fn write_u8(&mut self, id: u8, address: u8, value: u8) -> Result<()> {
        self.send(id, INSTR_WRITE, &[address, value])?;
        self.read_status(id)?;
        Ok(())
    }

    pub fn sync_write_u16(&mut self, address: u8, values: &[(u8, u16)]) -> Result<()> {
        self.transmit(&encode_sync_write_u16(address, values))
    }

    pub fn set_torque(&mut self, id: u8, enabled: bool) -> Result<()> {
        self.write_u8(id, TORQUE_ENABLE, enabled as u8)?;
        self.write_u8(id, LOCK, enabled as u8)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    pub(crate) fn status_packet(id: u8, flags: u8, params: &[u8]) -> Vec<u8> {
        let mut packet = vec![0xFF, 0xFF, id, (params.len() + 2) as u8, flags];
        packet.extend_from_slice(params);
        packet.push(checksum(&packet[2..]));
        packet
    }

    /// In memory serial port
    ///
    /// Records writes. Each addressed packet written releases the next queued
    /// reply into `responses`, the bytes waiting to be read.
    #[derive(Default)]
    pub(crate) struct LoopbackPort {
        pub written: Vec<u8>,
        pub responses: VecDeque<u8>,
        pub replies: VecDeque<Vec<u8>>,
    }

    impl LoopbackPort {
        pub fn respond(&mut self, id: u8, flags: u8, params: &[u8]) {
            self.replies.push_back(status_packet(id, flags, params));
        }

        /// Bytes already sitting in the input buffer
        pub fn leftover(&mut self, bytes: &[u8]) {
            self.responses.extend(bytes);
        }
    }

    impl BusPort for LoopbackPort {
        fn clear_input(&mut self) -> Result<()> {
            self.responses.clear();
            Ok(())
        }
    }

    impl Read for LoopbackPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.responses.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no response"));
            }
            let mut count = 0;
            while count < buf.len() {
                match self.responses.pop_front() {
                    Some(byte) => {
                        buf[count] = byte;
                        count += 1;
                    }
                    None => break,
                }
            }
            Ok(count)
        }
    }

    impl Write for LoopbackPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            if buf.len() > 2 && buf[2] != BROADCAST_ID {
                if let Some(reply) = self.replies.pop_front() {
                    self.responses.extend(reply);
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn checksum_matches_reference_packet() {
        // ping servo 1 from the STS3215 manual
        assert_eq!(encode_packet(1, INSTR_PING, &[]), vec![0xFF, 0xFF, 0x01, 0x02, 0x01, 0xFB]);
    }

    #[test]
    fn read_packet_layout() {
        let packet = encode_packet(3, INSTR_READ, &[PRESENT_POSITION, 2]);
        assert_eq!(&packet[..5], &[0xFF, 0xFF, 3, 4, INSTR_READ]);
        assert_eq!(&packet[5..7], &[PRESENT_POSITION, 2]);
        assert_eq!(packet[7], checksum(&packet[2..7]));
    }

    #[test]
    fn sync_write_packs_all_servos() {
        let packet = encode_sync_write_u16(GOAL_POSITION, &[(1, 0x0800), (2, 0x0102)]);
        assert_eq!(packet[2], BROADCAST_ID);
        assert_eq!(packet[3] as usize, packet.len() - 4);
        assert_eq!(packet[4], INSTR_SYNC_WRITE);
        assert_eq!(&packet[5..7], &[GOAL_POSITION, 2]);
        assert_eq!(&packet[7..13], &[1, 0x00, 0x08, 2, 0x02, 0x01]);
    }

    #[test]
    fn read_u16_decodes_little_endian() {
        let mut port = LoopbackPort::default();
        port.respond(4, 0, &[0x34, 0x12]);
        let mut bus = FeetechBus::new(port);
        assert_eq!(bus.read_u16(4, PRESENT_POSITION).unwrap(), 0x1234);
        let port = bus.into_inner();
        assert_eq!(port.written, encode_packet(4, INSTR_READ, &[PRESENT_POSITION, 2]));
    }

    #[test]
    fn garbage_before_header_is_skipped() {
        let mut port = LoopbackPort::default();
        let mut reply = vec![0x00, 0x13, 0xFF];
        reply.extend(status_packet(1, 0, &[0x00, 0x08]));
        port.replies.push_back(reply);
        let mut bus = FeetechBus::new(port);
        assert_eq!(bus.read_u16(1, PRESENT_POSITION).unwrap(), 0x0800);
    }

    #[test]
    fn corrupt_checksum_is_reported() {
        let mut port = LoopbackPort::default();
        let mut reply = status_packet(1, 0, &[0x00, 0x08]);
        let last = reply.len() - 1;
        reply[last] ^= 0x55;
        port.replies.push_back(reply);
        let mut bus = FeetechBus::new(port);
        assert!(matches!(
            bus.read_u16(1, PRESENT_POSITION),
            Err(FeetechError::Checksum { .. })
        ));
    }

    #[test]
    fn stale_reply_is_discarded_before_request() {
        let mut port = LoopbackPort::default();
        // answer to an earlier read that timed out
        port.leftover(&status_packet(1, 0, &[0x00, 0x04]));
        port.respond(1, 0, &[0x00, 0x08]);
        port.respond(2, 0, &[0x00, 0x02]);
        let mut bus = FeetechBus::new(port);
        assert_eq!(bus.read_u16(1, PRESENT_POSITION).unwrap(), 0x0800);
        assert_eq!(bus.read_u16(2, PRESENT_POSITION).unwrap(), 0x0200);
    }

    #[test]
    fn sync_write_clears_input_and_expects_no_reply() {
        let mut port = LoopbackPort::default();
        port.leftover(&status_packet(3, 0, &[]));
        port.respond(1, 0, &[0x00, 0x08]);
        let mut bus = FeetechBus::new(port);
        bus.sync_write_u16(GOAL_POSITION, &[(1, 0x0800)]).unwrap();
        assert_eq!(bus.read_u16(1, PRESENT_POSITION).unwrap(), 0x0800);
    }

    #[test]
    fn servo_error_flags_are_reported() {
        let mut port = LoopbackPort::default();
        port.respond(2, 0x20, &[]);
        let mut bus = FeetechBus::new(port);
        assert!(matches!(
            bus.ping(2),
            Err(FeetechError::ServoError { id: 2, flags: 0x20 })
        ));
    }

    #[test]
    fn answer_from_wrong_servo_is_rejected() {
        let mut port = LoopbackPort::default();
        port.respond(5, 0, &[]);
        let mut bus = FeetechBus::new(port);
        assert!(matches!(
            bus.ping(2),
            Err(FeetechError::UnexpectedId { expected: 2, found: 5 })
        ));
    }

    #[test]
    fn silent_servo_times_out() {
        let mut bus = FeetechBus::new(LoopbackPort::default());
        assert!(matches!(bus.ping(1), Err(FeetechError::Io(_))));
    }

    #[test]
    fn torque_toggles_enable_and_lock() {
        let mut port = LoopbackPort::default();
        port.respond(1, 0, &[]);
        port.respond(1, 0, &[]);
        let mut bus = FeetechBus::new(port);
        bus.set_torque(1, true).unwrap();
        let port = bus.into_inner();
        let mut expected = encode_packet(1, INSTR_WRITE, &[TORQUE_ENABLE, 1]);
        expected.extend(encode_packet(1, INSTR_WRITE, &[LOCK, 1]));
        assert_eq!(port.written, expected);
    }
}
