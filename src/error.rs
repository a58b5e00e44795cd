//! Error taxonomy for the headset core.
//!
//! Every condition a caller can observe is a [`HeadsetError`]. Each kind keeps
//! the numeric code the headset SDKs have always reported, so logs and support
//! tooling can match on [`HeadsetError::code`] instead of on message text.
//!
//! Frame-level decode problems are [`DecodeError`]s. They never reach the
//! caller: the offending frame is logged and dropped.

use thiserror::Error;

// ── Caller-visible errors ─────────────────────────────────────────────────────

/// Top-level error delivered through connection and OAD events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeadsetError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Oad(#[from] OadError),
    #[error(transparent)]
    Firmware(#[from] FirmwareError),
    #[error(transparent)]
    Audio(#[from] AudioError),
}

impl HeadsetError {
    /// Stable numeric code of the error kind.
    pub fn code(&self) -> u16 {
        match self {
            HeadsetError::Link(e) => e.code(),
            HeadsetError::Identity(e) => e.code(),
            HeadsetError::Oad(e) => e.code(),
            HeadsetError::Firmware(e) => e.code(),
            HeadsetError::Audio(e) => e.code(),
        }
    }
}

/// BLE link failures. All are recoverable by calling `connect` again.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    #[error("connection with the headset was lost")]
    ConnectionLost,
    #[error("Bluetooth is powered off")]
    BluetoothPoweredOff,
    #[error("Bluetooth Low Energy was powered off while connected")]
    BlePoweredOff,
    #[error("pairing with the headset was denied")]
    PairingDenied,
    #[error("timed out while connecting to the headset")]
    ConnectionTimeout,
}

impl LinkError {
    pub fn code(&self) -> u16 {
        match self {
            LinkError::ConnectionLost => 911,
            LinkError::ConnectionTimeout => 918,
            LinkError::BluetoothPoweredOff => 919,
            LinkError::BlePoweredOff => 920,
            LinkError::PairingDenied => 921,
        }
    }
}

/// Failures while establishing the device identity of the current session.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityError {
    #[error("device information is unavailable")]
    InfoUnavailable,
    #[error("no headset is connected")]
    NotConnected,
    #[error("timed out while retrieving device information")]
    RetrieveInfoTimeout,
}

impl IdentityError {
    pub fn code(&self) -> u16 {
        match self {
            IdentityError::InfoUnavailable => 909,
            IdentityError::NotConnected => 916,
            IdentityError::RetrieveInfoTimeout => 917,
        }
    }
}

/// Firmware transfer failures. All of them disable OAD.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OadError {
    #[error("could not reconnect to the headset after the firmware transfer")]
    ReconnectionAfterTransferFailed,
    #[error("firmware transfer timed out")]
    TransferTimeout,
    #[error("headset refused to prepare the firmware transfer")]
    TransferPreparationFailed,
    #[error("firmware transfer was interrupted")]
    TransferInterrupted,
    #[error("headset reported a bad Bluetooth device address")]
    BadAddress,
}

impl OadError {
    pub fn code(&self) -> u16 {
        match self {
            OadError::ReconnectionAfterTransferFailed => 908,
            OadError::TransferTimeout => 912,
            OadError::TransferPreparationFailed => 913,
            OadError::TransferInterrupted => 914,
            OadError::BadAddress => 925,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareError {
    #[error("firmware is already up to date")]
    AlreadyUpToDate,
    #[error("firmware version does not match the transferred image")]
    VersionInvalidAfterUpdate,
}

impl FirmwareError {
    pub fn code(&self) -> u16 {
        match self {
            FirmwareError::AlreadyUpToDate => 910,
            FirmwareError::VersionInvalidAfterUpdate => 915,
        }
    }
}

/// A2DP audio pairing failures. Reported without tearing down the BLE link.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioError {
    #[error("headset audio is not paired with this host")]
    Unpaired,
    #[error("headset audio is already connected to another host")]
    AlreadyConnected,
    #[error("timed out while connecting headset audio")]
    ConnectionTimeout,
    #[error("headset audio connection failed (status {0:#04x})")]
    UnknownFailure(u8),
}

impl AudioError {
    pub fn code(&self) -> u16 {
        match self {
            AudioError::Unpaired => 922,
            AudioError::AlreadyConnected => 923,
            AudioError::ConnectionTimeout => 924,
            AudioError::UnknownFailure(_) => 926,
        }
    }
}

// ── Decode errors (logged, never surfaced) ────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("frame too short: got {got} bytes, need {need}")]
    Truncated { got: usize, need: usize },
    #[error("unknown mailbox opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("battery byte {0} outside the decoding table")]
    BatteryOutOfRange(u8),
    #[error("payload is not ASCII text")]
    NotAscii,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(HeadsetError::from(OadError::ReconnectionAfterTransferFailed).code(), 908);
        assert_eq!(HeadsetError::from(IdentityError::RetrieveInfoTimeout).code(), 917);
        assert_eq!(HeadsetError::from(LinkError::PairingDenied).code(), 921);
        assert_eq!(HeadsetError::from(FirmwareError::AlreadyUpToDate).code(), 910);
        assert_eq!(HeadsetError::from(AudioError::ConnectionTimeout).code(), 924);
        assert_eq!(HeadsetError::from(OadError::BadAddress).code(), 925);
    }

    #[test]
    fn display_is_transparent() {
        let e = HeadsetError::from(LinkError::ConnectionTimeout);
        assert_eq!(e.to_string(), "timed out while connecting to the headset");
    }
}
