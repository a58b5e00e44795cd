use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::HeadsetError;
use crate::protocol::{Electrode, HardwareProfile};
use crate::version::FirmwareVersion;

// ── Connection state ──────────────────────────────────────────────────────────

/// Lifecycle of the BLE session, owned by the connection supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    /// Identity is being read, battery requested, external name registered.
    Finalizing,
    Ready,
    Disconnecting,
}

// ── Device identity ───────────────────────────────────────────────────────────

/// The four device-information fields of the connected headset.
///
/// Every field stays `None` until the headset reports it. The session only
/// reaches [`ConnectionState::Ready`] once [`DeviceIdentity::is_complete`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub product_name: Option<String>,
    pub serial_number: Option<String>,
    pub hardware_version: Option<String>,
    pub firmware_version: Option<String>,
}

impl DeviceIdentity {
    pub fn is_complete(&self) -> bool {
        self.product_name.is_some()
            && self.serial_number.is_some()
            && self.hardware_version.is_some()
            && self.firmware_version.is_some()
    }

    /// Parsed firmware version, `0.0.0` when unknown.
    pub fn firmware(&self) -> FirmwareVersion {
        self.firmware_version
            .as_deref()
            .map(FirmwareVersion::parse)
            .unwrap_or_default()
    }

    /// Hardware profile implied by the hardware version, if recognised.
    pub fn profile(&self) -> Option<HardwareProfile> {
        self.hardware_version
            .as_deref()
            .and_then(HardwareProfile::from_hardware_version)
    }

    /// `true` when the firmware is at least `gate`.
    pub fn firmware_at_least(&self, gate: FirmwareVersion) -> bool {
        self.firmware() >= gate
    }
}

// ── EEG ───────────────────────────────────────────────────────────────────────

/// One decoded EEG packet.
///
/// Created by the acquisition pipeline, optionally annotated by the quality
/// gateway, then handed to the caller unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EegPacket {
    /// Monotonic packet counter for this stream, lost packets included.
    pub sequence: u64,
    /// Wall-clock time the packet was assembled, in ms since the Unix epoch.
    pub timestamp_ms: u64,
    /// Electrode of each channel, in channel order.
    pub electrodes: Vec<Electrode>,
    /// Samples in volts, one `Vec` per channel. Lost samples are `NaN`.
    pub channels: Vec<Vec<f32>>,
    /// Per-channel quality scores, when quality checking is enabled.
    pub qualities: Option<Vec<f32>>,
    /// Per-channel corrected samples, when quality checking is enabled.
    pub modified_channels: Option<Vec<Vec<f32>>>,
}

impl EegPacket {
    pub fn channel(&self, electrode: Electrode) -> Option<&[f32]> {
        let index = self.electrodes.iter().position(|&e| e == electrode)?;
        self.channels.get(index).map(Vec::as_slice)
    }

    pub fn electrode_index(&self) -> HashMap<Electrode, usize> {
        self.electrodes.iter().enumerate().map(|(i, &e)| (e, i)).collect()
    }

    pub fn nan_count(&self) -> usize {
        self.channels.iter().flatten().filter(|v| v.is_nan()).count()
    }

    /// Channel-major flattening: all samples of channel 0, then channel 1…
    pub fn flattened(&self) -> Vec<f32> {
        self.channels.iter().flatten().copied().collect()
    }
}

/// A single 3-axis accelerometer sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XyzSample {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Everything the core reports to its host, delivered on one channel.
#[derive(Debug, Clone, PartialEq)]
pub enum HeadsetEvent {
    Connection(ConnectionEvent),
    Oad(OadEvent),
    Acquisition(AcquisitionEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// Session is ready; identity is complete.
    Established(DeviceIdentity),
    /// A connection attempt failed. The supervisor is back to `Idle`.
    Failed(HeadsetError),
    /// An established link dropped. The supervisor is back to `Idle`.
    Lost(HeadsetError),
    /// Battery level in percent.
    BatteryLevel(f32),
    /// A newer firmware image is available for this headset.
    UpdateAvailable(FirmwareVersion),
    /// The headset's audio output became the active route.
    AudioConnected(String),
    AudioDisconnected,
    /// Audio pairing failed; the BLE link is left untouched.
    AudioFailed(HeadsetError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OadEvent {
    /// Overall progress in `[0.0, 1.0]`.
    Progress(f32),
    /// The headset accepted the transfer; blocks start flowing.
    ReadyToUpdate,
    /// Every block was accepted; the headset is about to reboot.
    Completed,
    /// The headset rebooted. Bluetooth must be cycled on the host so the
    /// headset can be found again.
    RebootRequired,
    /// Bluetooth came back after the reboot; reconnection is under way.
    RadioRestarted,
    Failed(HeadsetError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionEvent {
    Packet(EegPacket),
    /// Electrode saturation: 0 none, 1 left, 2 right, 3 both.
    Saturation(u8),
    Accelerometer(Vec<XyzSample>),
}

impl From<ConnectionEvent> for HeadsetEvent {
    fn from(e: ConnectionEvent) -> Self {
        HeadsetEvent::Connection(e)
    }
}

impl From<OadEvent> for HeadsetEvent {
    fn from(e: OadEvent) -> Self {
        HeadsetEvent::Oad(e)
    }
}

impl From<AcquisitionEvent> for HeadsetEvent {
    fn from(e: AcquisitionEvent) -> Self {
        HeadsetEvent::Acquisition(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            product_name: Some("melomind".into()),
            serial_number: Some("2100123".into()),
            hardware_version: Some("1.1.0".into()),
            firmware_version: Some("1.7.1".into()),
        }
    }

    #[test]
    fn identity_completeness() {
        let mut id = identity();
        assert!(id.is_complete());
        id.serial_number = None;
        assert!(!id.is_complete());
    }

    #[test]
    fn identity_derivations() {
        let id = identity();
        assert_eq!(id.profile(), Some(HardwareProfile::Indus3));
        assert!(id.firmware_at_least(FirmwareVersion::new(1, 6, 7)));
        assert!(!id.firmware_at_least(FirmwareVersion::new(1, 7, 2)));
    }

    #[test]
    fn packet_channel_lookup() {
        let packet = EegPacket {
            sequence: 0,
            timestamp_ms: 0,
            electrodes: vec![Electrode::P3, Electrode::P4],
            channels: vec![vec![1.0, f32::NAN], vec![3.0, 4.0]],
            qualities: None,
            modified_channels: None,
        };
        assert_eq!(packet.channel(Electrode::P4), Some(&[3.0, 4.0][..]));
        assert_eq!(packet.channel(Electrode::Af3), None);
        assert_eq!(packet.nan_count(), 1);
        assert_eq!(packet.flattened().len(), 4);
        assert_eq!(packet.electrode_index()[&Electrode::P4], 1);
    }
}
