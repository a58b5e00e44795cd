//! Over-the-air firmware download (OAD).
//!
//! A firmware image is cut into 18-byte blocks, each sent as
//!
//! ```text
//! [index_lo, index_hi, payload[0..18]]
//! ```
//!
//! with the last block padded with `0xFF`. The headset drives the transfer
//! through mailbox frames: it accepts or refuses the handshake (`OtaMode`),
//! may ask for a resend from any block (`OtaIndexReset`), and finally reports
//! the outcome (`OtaStatus`). After a successful transfer it reboots; the
//! session is verified once it reconnects with the new firmware version.
//!
//! [`OadEngine`] holds the transfer state. It performs no I/O: the connection
//! supervisor feeds it mailbox events and the driver pulls blocks from it at
//! a fixed pace.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::error::{FirmwareError, OadError};
use crate::mailbox;
use crate::types::DeviceIdentity;
use crate::version::{version_from_binary_name, FirmwareVersion};

/// Payload bytes per block.
pub const OAD_BLOCK_SIZE: usize = 18;

/// Offset of the 2-byte embedded firmware version in an image.
pub const FIRMWARE_VERSION_OFFSET: usize = 0x27C;

/// The block count travels as a `u16` in the start frame.
pub const MAX_OAD_BLOCKS: usize = u16::MAX as usize;

const PROGRESS_START: f32 = 0.1;
const PROGRESS_SPAN: f32 = 0.8;

// ── State ─────────────────────────────────────────────────────────────────────

/// OAD session state. Variants are ordered along the happy path, so
/// `state > OadState::Completed` means "the headset already rebooted".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum OadState {
    #[default]
    Disabled,
    Started,
    Ready,
    InProgress,
    Completed,
    RebootRequired,
    Reconnected,
}

impl OadState {
    pub fn is_in_flight(&self) -> bool {
        *self != OadState::Disabled
    }
}

// ── Firmware images ───────────────────────────────────────────────────────────

/// Raw firmware bytes and the version they install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    bytes: Vec<u8>,
    version: FirmwareVersion,
}

impl FirmwareImage {
    pub fn from_bytes(bytes: Vec<u8>, version: FirmwareVersion) -> Self {
        Self { bytes, version }
    }

    pub fn version(&self) -> FirmwareVersion {
        self.version
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Version bytes embedded in the image, `[0, 0]` for images too short to
    /// carry them.
    pub fn version_bytes(&self) -> [u8; 2] {
        match self.bytes.get(FIRMWARE_VERSION_OFFSET..FIRMWARE_VERSION_OFFSET + 2) {
            Some(b) => [b[0], b[1]],
            None => [0, 0],
        }
    }

    /// `ceil(len / 18)`.
    pub fn block_count(&self) -> usize {
        self.bytes.len().div_ceil(OAD_BLOCK_SIZE)
    }

    /// Wire form of block `index`, or `None` past the end or past what a
    /// `u16` index can address.
    pub fn block(&self, index: usize) -> Option<Vec<u8>> {
        let [lo, hi] = u16::try_from(index).ok()?.to_le_bytes();
        let start = index.checked_mul(OAD_BLOCK_SIZE)?;
        if start >= self.bytes.len() {
            return None;
        }
        let end = (start + OAD_BLOCK_SIZE).min(self.bytes.len());

        let mut block = Vec::with_capacity(2 + OAD_BLOCK_SIZE);
        block.push(lo);
        block.push(hi);
        block.extend_from_slice(&self.bytes[start..end]);
        block.resize(2 + OAD_BLOCK_SIZE, 0xFF);
        Some(block)
    }

    /// Mailbox frame announcing this image: embedded version + block count.
    /// `None` when the image has more than [`MAX_OAD_BLOCKS`] blocks.
    pub fn start_frame(&self) -> Option<Vec<u8>> {
        let blocks = u16::try_from(self.block_count()).ok()?;
        Some(mailbox::start_ota_transfer(self.version_bytes(), blocks))
    }
}

// ── Firmware sources ──────────────────────────────────────────────────────────

/// Supplies the firmware image to install on a given headset.
pub trait FirmwareSource: Send + Sync {
    fn locate_firmware(&self, identity: &DeviceIdentity) -> Option<FirmwareImage>;
}

/// Always offers the same image, whatever the headset.
#[derive(Debug, Clone, Default)]
pub struct StaticFirmwareSource {
    image: Option<FirmwareImage>,
}

impl StaticFirmwareSource {
    pub fn new(image: FirmwareImage) -> Self {
        Self { image: Some(image) }
    }
}

impl FirmwareSource for StaticFirmwareSource {
    fn locate_firmware(&self, _identity: &DeviceIdentity) -> Option<FirmwareImage> {
        self.image.clone()
    }
}

/// Scans a directory of `mm-ota[-iN]-x_y_z.bin` files and offers the highest
/// version matching the headset's hardware profile.
#[derive(Debug, Clone)]
pub struct DirectoryFirmwareSource {
    dir: PathBuf,
}

impl DirectoryFirmwareSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Highest version available for `prefix`, with its path.
    pub fn best_for_prefix(&self, prefix: &str) -> Option<(PathBuf, FirmwareVersion)> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot list firmware directory {}: {e}", self.dir.display());
                return None;
            }
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let version = version_from_binary_name(&name, prefix)?;
                Some((entry.path(), version))
            })
            .max_by_key(|(_, version)| *version)
    }
}

impl FirmwareSource for DirectoryFirmwareSource {
    fn locate_firmware(&self, identity: &DeviceIdentity) -> Option<FirmwareImage> {
        let profile = identity.profile()?;
        let (path, version) = self.best_for_prefix(profile.firmware_prefix())?;
        match fs::read(&path) {
            Ok(bytes) => {
                debug!("Firmware {version} for {profile:?} at {}", path.display());
                Some(FirmwareImage::from_bytes(bytes, version))
            }
            Err(e) => {
                warn!("Cannot read firmware {}: {e}", path.display());
                None
            }
        }
    }
}

// ── Transfer engine ───────────────────────────────────────────────────────────

/// One pacing step of the send loop.
#[derive(Debug, Clone, PartialEq)]
pub enum OadStep {
    /// Write `block`; report `progress` when present.
    Send { block: Vec<u8>, progress: Option<f32> },
    /// Nothing left to send, or the transfer is no longer in progress.
    Finished,
}

#[derive(Debug, Default)]
pub struct OadEngine {
    state: OadState,
    image: Option<FirmwareImage>,
    target: Option<FirmwareVersion>,
    cursor: usize,
    last_percent: Option<u32>,
    sending: bool,
}

impl OadEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> OadState {
        self.state
    }

    pub fn set_state(&mut self, state: OadState) {
        if self.state != state {
            debug!("OAD state {:?} → {state:?}", self.state);
            self.state = state;
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.state.is_in_flight()
    }

    /// Version the current (or last) transfer installs.
    pub fn target_version(&self) -> Option<FirmwareVersion> {
        self.target
    }

    pub fn block_count(&self) -> usize {
        self.image.as_ref().map_or(0, FirmwareImage::block_count)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// `true` while the driver's send loop is pulling blocks.
    pub fn is_sending(&self) -> bool {
        self.sending
    }

    /// Load `image` and enter `Started`. Returns the handshake frame.
    pub fn start(&mut self, image: FirmwareImage) -> Result<Vec<u8>, OadError> {
        info!(
            "OAD: {} bytes, {} blocks, target {}",
            image.len(),
            image.block_count(),
            image.version()
        );
        let Some(frame) = image.start_frame() else {
            warn!("OAD: {} blocks exceed the limit of {MAX_OAD_BLOCKS}", image.block_count());
            self.disable();
            return Err(OadError::TransferPreparationFailed);
        };
        self.target = Some(image.version());
        self.image = Some(image);
        self.cursor = 0;
        self.last_percent = None;
        self.sending = false;
        self.set_state(OadState::Started);
        Ok(frame)
    }

    /// Headset answered the handshake. Returns `true` when the send loop
    /// should start.
    pub fn on_ota_mode(&mut self, ready: bool) -> bool {
        if ready && self.image.is_some() {
            self.cursor = 0;
            self.last_percent = None;
            self.sending = true;
            self.set_state(OadState::InProgress);
            true
        } else {
            self.disable();
            false
        }
    }

    /// Next block to write. Stops as soon as the state leaves `InProgress`.
    pub fn next_step(&mut self) -> OadStep {
        let count = self.block_count();
        if self.state != OadState::InProgress || self.cursor >= count {
            self.sending = false;
            return OadStep::Finished;
        }
        let Some(block) = self.image.as_ref().and_then(|img| img.block(self.cursor)) else {
            self.sending = false;
            return OadStep::Finished;
        };

        let percent = (self.cursor * 100 / count) as u32;
        let progress = if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            Some(percent as f32 * PROGRESS_SPAN / 100.0 + PROGRESS_START)
        } else {
            None
        };

        self.cursor += 1;
        OadStep::Send { block, progress }
    }

    /// Headset asked for a resend from `block`. Returns `true` when the send
    /// loop had already finished and must be restarted.
    pub fn on_index_reset(&mut self, block: u16) -> bool {
        debug!("OAD: index reset to block {block}");
        self.cursor = block as usize;
        if !self.sending && self.state == OadState::InProgress {
            self.sending = true;
            true
        } else {
            false
        }
    }

    /// Headset reported the transfer outcome. Returns `success`.
    pub fn on_status(&mut self, success: bool) -> bool {
        self.sending = false;
        if success {
            self.set_state(OadState::Completed);
        } else {
            self.disable();
        }
        success
    }

    /// Compare the firmware reported after the reboot with the target, then
    /// disable OAD either way.
    pub fn verify(&mut self, reported: FirmwareVersion) -> Result<(), FirmwareError> {
        let target = self.target;
        self.disable();
        match target {
            Some(t) if t == reported => Ok(()),
            _ => Err(FirmwareError::VersionInvalidAfterUpdate),
        }
    }

    /// `true` when the reported firmware equals the target version.
    pub fn matches_target(&self, reported: FirmwareVersion) -> bool {
        self.target == Some(reported)
    }

    pub fn disable(&mut self) {
        self.sending = false;
        self.set_state(OadState::Disabled);
    }
}
