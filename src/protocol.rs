//! GATT UUIDs, hardware profiles, and protocol constants for melomind headsets.
//!
//! Two GATT layouts exist in the field:
//!
//! | Framing | Hardware | Services |
//! |---|---|---|
//! | [`Framing::Dedicated`] | Indus2, Indus3 | `0xB2A0` brain service + `0x180A` device information |
//! | [`Framing::Multiplexed`] | Indus5 | one "transparent" service with an rx/tx characteristic pair |
//!
//! With dedicated framing each data stream has its own characteristic. With
//! multiplexed framing every command, response and data frame travels through
//! the mailbox as an opcode-prefixed frame (see [`crate::mailbox`]).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::version::FirmwareVersion;

// ── UUID helpers ──────────────────────────────────────────────────────────────

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Expand a 16-bit SIG-style short UUID onto the Bluetooth base UUID.
pub const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

// ── Services ──────────────────────────────────────────────────────────────────

/// Vendor service carrying EEG, battery, status, mailbox and OAD (Indus2/3).
pub const BRAIN_SERVICE: Uuid = short_uuid(0xB2A0);

/// Standard Device Information service (Indus2/3).
pub const DEVICE_INFO_SERVICE: Uuid = short_uuid(0x180A);

/// Microchip "transparent UART" service used by Indus5.
pub const TRANSPARENT_SERVICE: Uuid = Uuid::from_u128(0x49535343_fe7d_4ae5_8fa9_9fafd205e455);

// ── Characteristics (Indus2/3) ────────────────────────────────────────────────

pub const BRAIN_ACTIVITY_CHARACTERISTIC: Uuid = short_uuid(0xB2A5);
pub const DEVICE_STATE_CHARACTERISTIC: Uuid = short_uuid(0xB2A2);
pub const HEADSET_STATUS_CHARACTERISTIC: Uuid = short_uuid(0xB2A3);
pub const MAILBOX_CHARACTERISTIC: Uuid = short_uuid(0xB2A4);
pub const OAD_TRANSFER_CHARACTERISTIC: Uuid = short_uuid(0xB2A6);

pub const PRODUCT_NAME_CHARACTERISTIC: Uuid = short_uuid(0x2A24);
pub const SERIAL_NUMBER_CHARACTERISTIC: Uuid = short_uuid(0x2A25);
pub const FIRMWARE_REVISION_CHARACTERISTIC: Uuid = short_uuid(0x2A26);
pub const HARDWARE_REVISION_CHARACTERISTIC: Uuid = short_uuid(0x2A27);

// ── Characteristics (Indus5) ──────────────────────────────────────────────────

/// Headset → host notifications.
pub const MAILBOX_RX_CHARACTERISTIC: Uuid = Uuid::from_u128(0x49535343_1e4d_4bd9_ba61_23c647249616);
/// Host → headset writes.
pub const MAILBOX_TX_CHARACTERISTIC: Uuid = Uuid::from_u128(0x49535343_8841_43f4_a8d4_ecbe34729bb3);

// ── GATT roles ────────────────────────────────────────────────────────────────

/// Logical purpose of a characteristic, independent of its UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GattRole {
    /// Raw EEG stream (notify).
    Telemetry,
    /// Saturation status byte pair (notify).
    HeadsetStatus,
    /// Battery level byte (read).
    DeviceState,
    /// Mailbox frames coming from the headset (notify).
    MailboxNotify,
    /// Mailbox frames going to the headset (write).
    MailboxWrite,
    /// Firmware blocks (write without response).
    OadTransfer,
    ProductName,
    SerialNumber,
    HardwareRevision,
    FirmwareRevision,
}

impl GattRole {
    /// The four device-information roles, in read order.
    pub const IDENTITY: [GattRole; 4] = [
        GattRole::ProductName,
        GattRole::SerialNumber,
        GattRole::HardwareRevision,
        GattRole::FirmwareRevision,
    ];
}

/// How commands and data are carried over GATT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Framing {
    /// One characteristic per stream (Indus2/3).
    Dedicated,
    /// Everything multiplexed through the mailbox rx/tx pair (Indus5).
    Multiplexed,
}

impl Framing {
    /// Pick the framing from the services a peripheral exposes or advertises.
    pub fn detect(services: &[Uuid]) -> Option<Framing> {
        if services.contains(&TRANSPARENT_SERVICE) {
            Some(Framing::Multiplexed)
        } else if services.contains(&BRAIN_SERVICE) {
            Some(Framing::Dedicated)
        } else {
            None
        }
    }

    /// UUID → role table. Roles listed first win when two roles share a UUID
    /// (the Indus2/3 mailbox is both notified and written).
    pub fn layout(&self) -> &'static [(GattRole, Uuid)] {
        match self {
            Framing::Dedicated => &[
                (GattRole::Telemetry, BRAIN_ACTIVITY_CHARACTERISTIC),
                (GattRole::HeadsetStatus, HEADSET_STATUS_CHARACTERISTIC),
                (GattRole::DeviceState, DEVICE_STATE_CHARACTERISTIC),
                (GattRole::MailboxNotify, MAILBOX_CHARACTERISTIC),
                (GattRole::MailboxWrite, MAILBOX_CHARACTERISTIC),
                (GattRole::OadTransfer, OAD_TRANSFER_CHARACTERISTIC),
                (GattRole::ProductName, PRODUCT_NAME_CHARACTERISTIC),
                (GattRole::SerialNumber, SERIAL_NUMBER_CHARACTERISTIC),
                (GattRole::HardwareRevision, HARDWARE_REVISION_CHARACTERISTIC),
                (GattRole::FirmwareRevision, FIRMWARE_REVISION_CHARACTERISTIC),
            ],
            Framing::Multiplexed => &[
                (GattRole::MailboxNotify, MAILBOX_RX_CHARACTERISTIC),
                (GattRole::MailboxWrite, MAILBOX_TX_CHARACTERISTIC),
                (GattRole::OadTransfer, MAILBOX_TX_CHARACTERISTIC),
            ],
        }
    }

    pub fn role_of(&self, uuid: Uuid) -> Option<GattRole> {
        self.layout().iter().find(|(_, u)| *u == uuid).map(|(r, _)| *r)
    }

    pub fn uuid_of(&self, role: GattRole) -> Option<Uuid> {
        self.layout().iter().find(|(r, _)| *r == role).map(|(_, u)| *u)
    }

    /// Roles that must be discovered before the session can finalize.
    pub fn required_roles(&self) -> &'static [GattRole] {
        match self {
            Framing::Dedicated => &[
                GattRole::MailboxNotify,
                GattRole::DeviceState,
                GattRole::ProductName,
                GattRole::SerialNumber,
                GattRole::HardwareRevision,
                GattRole::FirmwareRevision,
            ],
            Framing::Multiplexed => &[GattRole::MailboxNotify, GattRole::MailboxWrite],
        }
    }

    /// Services to filter scans on.
    pub fn scan_services() -> Vec<Uuid> {
        vec![BRAIN_SERVICE, TRANSPARENT_SERVICE]
    }
}

// ── Electrodes & hardware profiles ────────────────────────────────────────────

/// 10-20 system electrode locations used by melomind headsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Electrode {
    P3,
    P4,
    Af3,
    Af4,
    /// Reference (left mastoid).
    M1,
    /// Ground (right mastoid).
    M2,
}

impl Electrode {
    pub fn label(&self) -> &'static str {
        match self {
            Electrode::P3 => "P3",
            Electrode::P4 => "P4",
            Electrode::Af3 => "AF3",
            Electrode::Af4 => "AF4",
            Electrode::M1 => "M1",
            Electrode::M2 => "M2",
        }
    }
}

/// Sample rate of every melomind profile, in Hz.
pub const SAMPLE_RATE: usize = 250;

/// Samples per channel in one EEG packet.
pub const PACKET_LENGTH: usize = 250;

/// Bytes per raw sample on the wire.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Hardware revision of the connected headset.
///
/// Selected once per session: the framing is known from service discovery,
/// the exact revision from the hardware version string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareProfile {
    Indus2,
    Indus3,
    Indus5,
}

impl HardwareProfile {
    /// Map a reported hardware revision (`"1.0.0"`, `"1.1.0"`, `"2.0.0"`,
    /// `"2.1.0"`) to a profile.
    pub fn from_hardware_version(text: &str) -> Option<Self> {
        match FirmwareVersion::parse(text) {
            v if v == FirmwareVersion::new(1, 0, 0) => Some(HardwareProfile::Indus2),
            v if v == FirmwareVersion::new(1, 1, 0) => Some(HardwareProfile::Indus3),
            v if v == FirmwareVersion::new(2, 0, 0) || v == FirmwareVersion::new(2, 1, 0) => {
                Some(HardwareProfile::Indus5)
            }
            _ => None,
        }
    }

    /// Best guess before the hardware version is known.
    pub fn default_for(framing: Framing) -> Self {
        match framing {
            Framing::Dedicated => HardwareProfile::Indus2,
            Framing::Multiplexed => HardwareProfile::Indus5,
        }
    }

    pub fn framing(&self) -> Framing {
        match self {
            HardwareProfile::Indus2 | HardwareProfile::Indus3 => Framing::Dedicated,
            HardwareProfile::Indus5 => Framing::Multiplexed,
        }
    }

    /// Acquisition electrodes in channel order.
    pub fn electrodes(&self) -> &'static [Electrode] {
        match self {
            HardwareProfile::Indus2 | HardwareProfile::Indus3 => &[Electrode::P3, Electrode::P4],
            HardwareProfile::Indus5 => &[Electrode::P3, Electrode::P4, Electrode::Af3, Electrode::Af4],
        }
    }

    pub fn reference(&self) -> Electrode {
        Electrode::M1
    }

    pub fn ground(&self) -> Electrode {
        Electrode::M2
    }

    pub fn channel_count(&self) -> usize {
        self.electrodes().len()
    }

    /// Size in bytes of one complete EEG packet.
    pub fn packet_bytes(&self) -> usize {
        PACKET_LENGTH * self.channel_count() * BYTES_PER_SAMPLE
    }

    /// File-name prefix of this profile's firmware binaries.
    pub fn firmware_prefix(&self) -> &'static str {
        match self {
            HardwareProfile::Indus2 => "mm-ota-",
            HardwareProfile::Indus3 => "mm-ota-i3-",
            HardwareProfile::Indus5 => "mm-ota-i5-",
        }
    }
}

// ── Naming ────────────────────────────────────────────────────────────────────

/// Every melomind advertises a BLE name containing this (case-insensitive).
pub const BLE_NAME_PREFIX: &str = "melo_";

/// Audio (A2DP) output names. `melo_` is used by older firmware.
pub const AUDIO_NAME_PREFIXES: [&str; 2] = ["audio_", "melo_"];

/// Product name of a headset that has not yet been registered.
pub const DEFAULT_PRODUCT_NAME: &str = "melomind";

pub const QR_CODE_PREFIXES: [&str; 3] = ["MM10", "MM1B2", "MM1B3"];
pub const QR_CODE_LENGTH: usize = 10;

pub fn is_qr_code(text: &str) -> bool {
    text.len() == QR_CODE_LENGTH && QR_CODE_PREFIXES.iter().any(|p| text.starts_with(p))
}

// ── Firmware gates ────────────────────────────────────────────────────────────

/// First firmware able to initiate the A2DP connection itself.
pub const A2DP_FROM_HEADSET_VERSION: FirmwareVersion = FirmwareVersion::new(1, 6, 7);

/// First firmware accepting an external (QR code) name.
pub const REGISTER_EXTERNAL_NAME_VERSION: FirmwareVersion = FirmwareVersion::new(1, 7, 1);

// ── Default timings ───────────────────────────────────────────────────────────

pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(20);
pub const OAD_TRANSFER_TIMEOUT: Duration = Duration::from_secs(600);
pub const A2DP_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
pub const FINALIZE_CONNECTION_RETRY: Duration = Duration::from_secs(2);
pub const EXTERNAL_NAME_TIMEOUT: Duration = Duration::from_secs(10);
pub const BATTERY_POLL_INTERVAL: Duration = Duration::from_secs(120);
pub const BATTERY_WARMUP_DELAY: Duration = Duration::from_secs(5);
pub const IDENTITY_WAIT_TIMEOUT: Duration = Duration::from_secs(120);
pub const IDENTITY_POLL_STEP: Duration = Duration::from_millis(500);
pub const OAD_BLOCK_PACING: Duration = Duration::from_millis(6);
