//! Mailbox protocol codec.
//!
//! The mailbox is the headset's control channel. Every frame is one opcode
//! byte followed by an opcode-specific payload:
//!
//! ```text
//! byte 0     : opcode
//! bytes 1..N : payload
//! ```
//!
//! Requests and responses are correlated by opcode only; there is never more
//! than one exchange in flight. On Indus5 the same framing also carries
//! identity fields, battery level and EEG / accelerometer data frames.
//!
//! Decoding is split in two steps: [`decode`] turns bytes into a
//! [`MailboxMessage`], and [`MailboxMessage::interpret`] turns that into a
//! typed [`MailboxEvent`]. Both fail with a [`DecodeError`] that the caller
//! logs and drops.

use crate::error::{AudioError, DecodeError, HeadsetError, OadError};

// ── Opcodes ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    SetAdsConfig = 0x00,
    SetAudioConfig = 0x01,
    SetProductName = 0x02,
    StartOtaTransfer = 0x03,
    LeadOff = 0x04,
    OtaMode = 0x05,
    OtaIndexReset = 0x06,
    OtaStatus = 0x07,
    SystemGetStatus = 0x08,
    SystemReboot = 0x09,
    SetA2dpName = 0x0A,
    SetNotchFilter = 0x0B,
    SetSerialNumber = 0x10,
    A2dpConnection = 0x11,
    SetBandpassFilter = 0x12,
    SetAmplifierGain = 0x13,
    GetEegConfig = 0x14,
    ToggleP300 = 0x15,
    EnableDcOffset = 0x16,
    BatteryLevel = 0x20,
    SerialNumber = 0x22,
    DeviceId = 0x23,
    StartEeg = 0x24,
    StopEeg = 0x25,
    FirmwareVersion = 0x27,
    HardwareVersion = 0x28,
    MtuSize = 0x29,
    StartIms = 0x2A,
    StopIms = 0x2B,
    EegDataFrame = 0x40,
    ImsDataFrame = 0x50,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        use Opcode::*;
        let op = match byte {
            0x00 => SetAdsConfig,
            0x01 => SetAudioConfig,
            0x02 => SetProductName,
            0x03 => StartOtaTransfer,
            0x04 => LeadOff,
            0x05 => OtaMode,
            0x06 => OtaIndexReset,
            0x07 => OtaStatus,
            0x08 => SystemGetStatus,
            0x09 => SystemReboot,
            0x0A => SetA2dpName,
            0x0B => SetNotchFilter,
            0x10 => SetSerialNumber,
            0x11 => A2dpConnection,
            0x12 => SetBandpassFilter,
            0x13 => SetAmplifierGain,
            0x14 => GetEegConfig,
            0x15 => ToggleP300,
            0x16 => EnableDcOffset,
            0x20 => BatteryLevel,
            0x22 => SerialNumber,
            0x23 => DeviceId,
            0x24 => StartEeg,
            0x25 => StopEeg,
            0x27 => FirmwareVersion,
            0x28 => HardwareVersion,
            0x29 => MtuSize,
            0x2A => StartIms,
            0x2B => StopIms,
            0x40 => EegDataFrame,
            0x50 => ImsDataFrame,
            _ => return None,
        };
        Some(op)
    }

    pub fn byte(self) -> u8 {
        self as u8
    }
}

// ── A2DP status ───────────────────────────────────────────────────────────────

/// Bitmask carried by an A2DP connection response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct A2dpStatus(pub u8);

impl A2dpStatus {
    pub const IN_PROGRESS: u8 = 0x01;
    pub const BAD_ADDRESS: u8 = 0x02;
    pub const ALREADY_CONNECTED: u8 = 0x04;
    pub const TIMEOUT: u8 = 0x08;
    pub const LINK_KEY_INVALID: u8 = 0x10;
    pub const SUCCESS: u8 = 0x80;

    pub fn contains(&self, bit: u8) -> bool {
        self.0 & bit == bit
    }

    /// Classify the response. `Success` is only reported when its bit is set;
    /// failure bits are checked in a fixed priority order.
    pub fn outcome(&self) -> A2dpOutcome {
        if self.contains(Self::SUCCESS) {
            return A2dpOutcome::Connected;
        }
        let failure: Option<HeadsetError> = if self.contains(Self::BAD_ADDRESS) {
            Some(OadError::BadAddress.into())
        } else if self.contains(Self::ALREADY_CONNECTED) {
            Some(AudioError::AlreadyConnected.into())
        } else if self.contains(Self::LINK_KEY_INVALID) {
            Some(AudioError::Unpaired.into())
        } else if self.contains(Self::TIMEOUT) {
            Some(AudioError::ConnectionTimeout.into())
        } else {
            None
        };

        match failure {
            Some(error) => A2dpOutcome::Failed(error),
            None if self.contains(Self::IN_PROGRESS) => A2dpOutcome::InProgress,
            None => A2dpOutcome::Failed(AudioError::UnknownFailure(self.0).into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum A2dpOutcome {
    Connected,
    InProgress,
    Failed(HeadsetError),
}

// ── Messages ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxMessage {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Split a raw mailbox frame into opcode and payload.
pub fn decode(bytes: &[u8]) -> Result<MailboxMessage, DecodeError> {
    let (&first, payload) = bytes.split_first().ok_or(DecodeError::Empty)?;
    let opcode = Opcode::from_byte(first).ok_or(DecodeError::UnknownOpcode(first))?;
    Ok(MailboxMessage {
        opcode,
        payload: payload.to_vec(),
    })
}

/// Typed view of a headset → host mailbox frame.
#[derive(Debug, Clone, PartialEq)]
pub enum MailboxEvent {
    OtaMode { ready: bool },
    OtaIndexReset { block: u16 },
    OtaStatus { success: bool },
    A2dpConnection(A2dpStatus),
    /// Acknowledgement of an external-name write.
    ExternalNameSet,
    BatteryLevel(u8),
    SerialNumber(String),
    /// The headset answers `DeviceId` with its product name.
    ProductName(String),
    FirmwareVersion(String),
    HardwareVersion(String),
    MtuSize(u8),
    EegStarted,
    EegStopped,
    ImsStarted,
    ImsStopped,
    EegFrame(Vec<u8>),
    ImsFrame(Vec<u8>),
    /// Recognised opcode with nothing for the host to act on.
    Acknowledged(Opcode),
}

impl MailboxMessage {
    fn byte(&self, index: usize) -> Result<u8, DecodeError> {
        self.payload.get(index).copied().ok_or(DecodeError::Truncated {
            got: self.payload.len() + 1,
            need: index + 2,
        })
    }

    pub fn interpret(&self) -> Result<MailboxEvent, DecodeError> {
        let event = match self.opcode {
            Opcode::OtaMode => MailboxEvent::OtaMode {
                ready: self.byte(0)? == 0x01,
            },
            Opcode::OtaIndexReset => MailboxEvent::OtaIndexReset {
                block: u16::from_le_bytes([self.byte(0)?, self.byte(1)?]),
            },
            Opcode::OtaStatus => MailboxEvent::OtaStatus {
                success: self.byte(0)? == 0x01,
            },
            Opcode::A2dpConnection => MailboxEvent::A2dpConnection(A2dpStatus(self.byte(0)?)),
            Opcode::SetA2dpName | Opcode::SetSerialNumber => MailboxEvent::ExternalNameSet,
            Opcode::BatteryLevel => MailboxEvent::BatteryLevel(self.byte(0)?),
            Opcode::SerialNumber => MailboxEvent::SerialNumber(ascii(&self.payload)?),
            Opcode::DeviceId => MailboxEvent::ProductName(ascii(&self.payload)?),
            Opcode::FirmwareVersion => MailboxEvent::FirmwareVersion(ascii(&self.payload)?),
            Opcode::HardwareVersion => MailboxEvent::HardwareVersion(ascii(&self.payload)?),
            Opcode::MtuSize => MailboxEvent::MtuSize(self.byte(0)?),
            Opcode::StartEeg => MailboxEvent::EegStarted,
            Opcode::StopEeg => MailboxEvent::EegStopped,
            Opcode::StartIms => MailboxEvent::ImsStarted,
            Opcode::StopIms => MailboxEvent::ImsStopped,
            Opcode::EegDataFrame => MailboxEvent::EegFrame(self.payload.clone()),
            Opcode::ImsDataFrame => MailboxEvent::ImsFrame(self.payload.clone()),
            other => MailboxEvent::Acknowledged(other),
        };
        Ok(event)
    }
}

/// Decode an ASCII identity field, dropping NUL padding.
pub fn ascii(bytes: &[u8]) -> Result<String, DecodeError> {
    if !bytes.is_ascii() {
        return Err(DecodeError::NotAscii);
    }
    let text: String = bytes.iter().map(|&b| b as char).collect();
    Ok(text.trim_end_matches('\0').trim().to_owned())
}

// ── Encoders ──────────────────────────────────────────────────────────────────

/// `[opcode] + payload`.
pub fn encode(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(opcode.byte());
    frame.extend_from_slice(payload);
    frame
}

/// A payload-less request (battery level, identity fields, start/stop EEG…).
pub fn request(opcode: Opcode) -> Vec<u8> {
    encode(opcode, &[])
}

/// OTA handshake: embedded firmware version bytes and total block count.
///
/// `[0x03, fw[0], fw[1], blocks_lo, blocks_hi]`
pub fn start_ota_transfer(firmware_version: [u8; 2], block_count: u16) -> Vec<u8> {
    let [lo, hi] = block_count.to_le_bytes();
    encode(
        Opcode::StartOtaTransfer,
        &[firmware_version[0], firmware_version[1], lo, hi],
    )
}

/// Ask the headset to open the A2DP link to the host.
pub fn a2dp_connect_request() -> Vec<u8> {
    encode(Opcode::A2dpConnection, &[0x25, 0xA2])
}

/// Register the external (QR code) name of the headset.
pub fn external_name(name: &str) -> Vec<u8> {
    let mut payload = vec![0xAB, 0x21];
    payload.extend_from_slice(name.as_bytes());
    encode(Opcode::SetA2dpName, &payload)
}

pub fn mtu_request(size: u8) -> Vec<u8> {
    encode(Opcode::MtuSize, &[size])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_splits_opcode_and_payload() {
        let msg = decode(&[0x07, 0x01]).unwrap();
        assert_eq!(msg.opcode, Opcode::OtaStatus);
        assert_eq!(msg.payload, vec![0x01]);
        assert_eq!(msg.interpret().unwrap(), MailboxEvent::OtaStatus { success: true });
    }

    #[test]
    fn unknown_opcode_is_an_error_not_a_panic() {
        assert_eq!(decode(&[0x77, 1, 2]), Err(DecodeError::UnknownOpcode(0x77)));
        assert_eq!(decode(&[]), Err(DecodeError::Empty));
    }

    #[test]
    fn truncated_payload() {
        let msg = decode(&[0x06, 0x05]).unwrap();
        assert!(matches!(msg.interpret(), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn index_reset_is_little_endian() {
        let msg = decode(&[0x06, 0x34, 0x12]).unwrap();
        assert_eq!(msg.interpret().unwrap(), MailboxEvent::OtaIndexReset { block: 0x1234 });
    }

    #[test]
    fn ota_mode_ready_flag() {
        let ready = decode(&[0x05, 0x01]).unwrap().interpret().unwrap();
        let refused = decode(&[0x05, 0x00]).unwrap().interpret().unwrap();
        assert_eq!(ready, MailboxEvent::OtaMode { ready: true });
        assert_eq!(refused, MailboxEvent::OtaMode { ready: false });
    }

    #[test]
    fn identity_fields_are_ascii() {
        let msg = decode(b"\x27\x31\x2e\x37\x2e\x34\0").unwrap();
        assert_eq!(msg.interpret().unwrap(), MailboxEvent::FirmwareVersion("1.7.4".into()));
        let bad = decode(&[0x22, 0xFF]).unwrap();
        assert_eq!(bad.interpret(), Err(DecodeError::NotAscii));
    }

    #[test]
    fn a2dp_outcomes() {
        assert_eq!(A2dpStatus(0x80).outcome(), A2dpOutcome::Connected);
        assert_eq!(A2dpStatus(0x81).outcome(), A2dpOutcome::Connected);
        assert_eq!(A2dpStatus(0x01).outcome(), A2dpOutcome::InProgress);
        assert_eq!(
            A2dpStatus(0x02 | 0x04).outcome(),
            A2dpOutcome::Failed(OadError::BadAddress.into())
        );
        assert_eq!(
            A2dpStatus(0x04 | 0x10).outcome(),
            A2dpOutcome::Failed(AudioError::AlreadyConnected.into())
        );
        assert_eq!(
            A2dpStatus(0x10 | 0x08).outcome(),
            A2dpOutcome::Failed(AudioError::Unpaired.into())
        );
        assert_eq!(
            A2dpStatus(0x08).outcome(),
            A2dpOutcome::Failed(AudioError::ConnectionTimeout.into())
        );
        assert_eq!(
            A2dpStatus(0x20).outcome(),
            A2dpOutcome::Failed(AudioError::UnknownFailure(0x20).into())
        );
        assert_eq!(
            A2dpStatus(0x00).outcome(),
            A2dpOutcome::Failed(AudioError::UnknownFailure(0).into())
        );
    }

    #[test]
    fn encoders() {
        assert_eq!(start_ota_transfer([0x07, 0x01], 56), vec![0x03, 0x07, 0x01, 56, 0]);
        assert_eq!(start_ota_transfer([0, 0], 0x0102), vec![0x03, 0, 0, 0x02, 0x01]);
        assert_eq!(a2dp_connect_request(), vec![0x11, 0x25, 0xA2]);
        assert_eq!(external_name("MM1"), vec![0x0A, 0xAB, 0x21, b'M', b'M', b'1']);
        assert_eq!(request(Opcode::BatteryLevel), vec![0x20]);
        assert_eq!(mtu_request(0x47), vec![0x29, 0x47]);
    }

    #[test]
    fn external_name_ack_accepts_both_opcodes() {
        for op in [0x0A, 0x10] {
            let msg = decode(&[op]).unwrap();
            assert_eq!(msg.interpret().unwrap(), MailboxEvent::ExternalNameSet);
        }
    }
}
