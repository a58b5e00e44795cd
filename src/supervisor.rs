//! Connection supervisor.
//!
//! [`ConnectionSupervisor`] owns the whole session: scan filtering, service
//! discovery, identity retrieval, the finalization handshake, battery
//! polling, firmware updates and audio-pairing correlation. It performs no
//! I/O. The driver feeds it [`LinkEvent`]s, timer expiries and host commands,
//! then drains the resulting [`Action`]s and carries them out:
//!
//! ```text
//!  btleplug ──LinkEvent──▶ ┌──────────────────────┐ ──Action::Link──▶ btleplug
//!  timers ───TimerId─────▶ │ ConnectionSupervisor │ ──StartTimer────▶ timers
//!  host ─────commands────▶ └──────────────────────┘ ──Emit──────────▶ host
//! ```
//!
//! Because every decision happens in one `&mut self` call, events are
//! processed one at a time and never interleave.

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::acquisition::{EegAcquisition, LostFramePolicy};
use crate::config::CoreConfig;
use crate::error::{AudioError, FirmwareError, HeadsetError, IdentityError, LinkError, OadError};
use crate::mailbox::{self, A2dpOutcome, MailboxEvent, Opcode};
use crate::oad::{FirmwareImage, FirmwareSource, OadEngine, OadState, OadStep};
use crate::parse;
use crate::protocol::{
    Framing, GattRole, HardwareProfile, A2DP_FROM_HEADSET_VERSION, BATTERY_WARMUP_DELAY,
    BLE_NAME_PREFIX, DEFAULT_PRODUCT_NAME, REGISTER_EXTERNAL_NAME_VERSION,
};
use crate::quality::QualityScorer;
use crate::recording::{RecordHandle, SessionRecorder, SessionSink};
use crate::timers::{TimerId, TimerSpec};
use crate::types::{
    AcquisitionEvent, ConnectionEvent, ConnectionState, DeviceIdentity, EegPacket, HeadsetEvent,
    OadEvent,
};

/// MTU requested from Indus5 headsets once their identity is known.
const INDUS5_MTU: u8 = 0x47;

const POWER_HISTORY_LEN: usize = 3;

// ── Link model ────────────────────────────────────────────────────────────────

/// Something the BLE stack reported.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The adapter was switched on (`true`) or off.
    PowerChanged(bool),
    /// A peripheral was seen while scanning.
    Discovered {
        id: String,
        name: Option<String>,
        services: Vec<Uuid>,
    },
    Connected,
    /// The connection attempt itself failed.
    ConnectFailed,
    Disconnected,
    ServicesDiscovered(Vec<Uuid>),
    /// Characteristics of one service. One event per discovered service.
    CharacteristicsDiscovered {
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    /// A notification or a read response.
    ValueUpdated { characteristic: Uuid, value: Vec<u8> },
}

/// Something the driver must do on the BLE stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    StartScan { services: Vec<Uuid> },
    StopScan,
    Connect(String),
    Disconnect,
    /// Discover services, then characteristics of every service.
    DiscoverServices,
    Read(Uuid),
    Write {
        characteristic: Uuid,
        bytes: Vec<u8>,
        with_response: bool,
    },
    SetNotify { characteristic: Uuid, enabled: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Link(LinkCommand),
    StartTimer(TimerId, TimerSpec),
    StopTimer(TimerId),
    StopAllTimers,
    Emit(HeadsetEvent),
    /// Start pulling blocks with [`ConnectionSupervisor::next_oad_step`].
    StartOadSendLoop,
}

// ── Power history ─────────────────────────────────────────────────────────────

/// The last three distinct adapter power states, oldest first.
///
/// A full `[on, off, on]` history after a completed transfer means the user
/// cycled Bluetooth to reset the radio's device cache.
#[derive(Debug, Clone, Default)]
pub struct PowerHistory {
    states: VecDeque<bool>,
}

impl PowerHistory {
    /// Append `on` unless it repeats the latest state. Returns whether the
    /// history changed.
    pub fn record(&mut self, on: bool) -> bool {
        if self.states.back() == Some(&on) {
            return false;
        }
        self.states.push_back(on);
        if self.states.len() > POWER_HISTORY_LEN {
            self.states.pop_front();
        }
        true
    }

    pub fn last(&self) -> Option<bool> {
        self.states.back().copied()
    }

    pub fn is_on(&self) -> bool {
        self.last() == Some(true)
    }

    pub fn is_off(&self) -> bool {
        self.last() == Some(false)
    }

    pub fn is_full(&self) -> bool {
        self.states.len() == POWER_HISTORY_LEN
    }

    pub fn has_no_history(&self) -> bool {
        self.states.is_empty()
    }
}

// ── Supervisor ────────────────────────────────────────────────────────────────

pub struct ConnectionSupervisor {
    config: CoreConfig,
    state: ConnectionState,
    power: PowerHistory,

    /// BLE name the session is bound to. Empty until the first matching
    /// headset is seen when connecting to "any".
    target_name: String,
    linked: bool,
    framing: Option<Framing>,
    profile: HardwareProfile,
    characteristics: HashMap<GattRole, Uuid>,
    pending_services: HashSet<Uuid>,

    identity: DeviceIdentity,
    identity_ticks: u32,
    identity_reported: bool,
    finalize_battery_seen: bool,
    external_name_pending: bool,
    a2dp_pending: bool,
    audio_connected: bool,
    mtu: Option<u8>,
    battery: Option<f32>,

    oad: OadEngine,
    firmware_source: Option<Box<dyn FirmwareSource>>,
    acquisition: EegAcquisition,
    recorder: SessionRecorder,

    timers: HashMap<TimerId, TimerSpec>,
    outbox: VecDeque<Action>,
}

impl ConnectionSupervisor {
    pub fn new(config: CoreConfig) -> Self {
        let profile = HardwareProfile::Indus2;
        Self {
            config,
            state: ConnectionState::Idle,
            power: PowerHistory::default(),
            target_name: String::new(),
            linked: false,
            framing: None,
            profile,
            characteristics: HashMap::new(),
            pending_services: HashSet::new(),
            identity: DeviceIdentity::default(),
            identity_ticks: 0,
            identity_reported: false,
            finalize_battery_seen: false,
            external_name_pending: false,
            a2dp_pending: false,
            audio_connected: false,
            mtu: None,
            battery: None,
            oad: OadEngine::new(),
            firmware_source: None,
            acquisition: EegAcquisition::new(profile),
            recorder: SessionRecorder::new(),
            timers: HashMap::new(),
            outbox: VecDeque::new(),
        }
    }

    pub fn with_firmware_source(mut self, source: Box<dyn FirmwareSource>) -> Self {
        self.firmware_source = Some(source);
        self
    }

    pub fn with_lost_frame_policy(mut self, policy: LostFramePolicy) -> Self {
        self.acquisition = EegAcquisition::with_policy(self.profile, policy);
        self
    }

    pub fn set_quality_scorer(&mut self, scorer: Box<dyn QualityScorer>) {
        self.acquisition.quality_mut().set_scorer(scorer);
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn oad_state(&self) -> OadState {
        self.oad.state()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn profile(&self) -> HardwareProfile {
        self.profile
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn mtu(&self) -> Option<u8> {
        self.mtu
    }

    pub fn battery(&self) -> Option<f32> {
        self.battery
    }

    pub fn is_streaming(&self) -> bool {
        self.acquisition.is_streaming()
    }

    pub fn recorder(&self) -> &SessionRecorder {
        &self.recorder
    }

    pub fn is_timer_running(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    /// Take every action produced so far, in order.
    pub fn drain_actions(&mut self) -> Vec<Action> {
        self.outbox.drain(..).collect()
    }

    // ── Host commands ─────────────────────────────────────────────────────────

    /// Start a session with the headset named `target`, or with the first
    /// melomind seen when `None`.
    pub fn connect(&mut self, target: Option<&str>) {
        if self.oad.state() == OadState::Reconnected && self.power.is_on() {
            info!("Rescanning for {} after firmware update", self.target_name);
            self.stop_timer(TimerId::Connection);
            self.scan();
            return;
        }

        if self.linked || self.state != ConnectionState::Idle {
            self.teardown_link();
        }
        self.reset_session();
        self.target_name = target.unwrap_or_default().to_owned();
        info!(
            "Connecting to {}",
            if self.target_name.is_empty() { "any headset" } else { self.target_name.as_str() }
        );

        self.start_timer(TimerId::Connection, TimerSpec::once(self.config.connection_timeout()));
        if self.power.is_off() {
            info!("Bluetooth is off, waiting for it before scanning");
            return;
        }
        self.scan();
    }

    /// End the session.
    pub fn disconnect(&mut self) {
        info!("Disconnect requested");
        if self.oad.is_in_flight() {
            self.oad.disable();
        }
        self.teardown_link();
    }

    pub fn read_battery(&mut self) -> Result<(), HeadsetError> {
        if !self.linked {
            return Err(IdentityError::NotConnected.into());
        }
        self.request_battery();
        Ok(())
    }

    /// Start EEG acquisition, optionally scoring every packet.
    pub fn start_stream(&mut self, use_quality_checker: bool) -> Result<(), HeadsetError> {
        if !self.linked || self.state != ConnectionState::Ready {
            return Err(IdentityError::NotConnected.into());
        }
        self.acquisition.start(use_quality_checker);
        match self.profile.framing() {
            Framing::Dedicated => {
                self.set_notify(GattRole::Telemetry, true);
                self.set_notify(GattRole::HeadsetStatus, true);
            }
            Framing::Multiplexed => self.write(GattRole::MailboxWrite, mailbox::request(Opcode::StartEeg), true),
        }
        Ok(())
    }

    pub fn stop_stream(&mut self) {
        if !self.acquisition.is_streaming() {
            return;
        }
        self.acquisition.stop();
        if !self.linked {
            return;
        }
        match self.profile.framing() {
            Framing::Dedicated => {
                self.set_notify(GattRole::Telemetry, false);
                self.set_notify(GattRole::HeadsetStatus, false);
            }
            Framing::Multiplexed => self.write(GattRole::MailboxWrite, mailbox::request(Opcode::StopEeg), true),
        }
    }

    pub fn start_accelerometer(&mut self) -> Result<(), HeadsetError> {
        self.toggle_accelerometer(Opcode::StartIms)
    }

    pub fn stop_accelerometer(&mut self) -> Result<(), HeadsetError> {
        self.toggle_accelerometer(Opcode::StopIms)
    }

    fn toggle_accelerometer(&mut self, opcode: Opcode) -> Result<(), HeadsetError> {
        if !self.linked || self.state != ConnectionState::Ready {
            return Err(IdentityError::NotConnected.into());
        }
        if self.profile != HardwareProfile::Indus5 {
            warn!("{:?} has no accelerometer", self.profile);
            return Ok(());
        }
        self.write(GattRole::MailboxWrite, mailbox::request(opcode), true);
        Ok(())
    }

    pub fn start_recording(&mut self) {
        self.recorder.start();
    }

    pub fn stop_recording(&mut self) {
        self.recorder.stop();
    }

    pub fn export_recording<S: SessionSink>(&mut self, sink: &mut S) -> Result<RecordHandle, S::Error> {
        self.recorder.export(sink, &self.identity)
    }

    /// Update to the newest image the firmware source offers.
    pub fn start_firmware_update(&mut self) -> Result<(), HeadsetError> {
        let image = self
            .firmware_source
            .as_ref()
            .and_then(|source| source.locate_firmware(&self.identity));
        self.begin_firmware_update(image)
    }

    /// Update to `image`.
    pub fn start_firmware_update_with(&mut self, image: FirmwareImage) -> Result<(), HeadsetError> {
        self.begin_firmware_update(Some(image))
    }

    fn begin_firmware_update(&mut self, image: Option<FirmwareImage>) -> Result<(), HeadsetError> {
        if !self.linked || self.state != ConnectionState::Ready {
            return Err(IdentityError::NotConnected.into());
        }
        if !self.identity.is_complete() {
            return Err(IdentityError::InfoUnavailable.into());
        }
        let current = self.identity.firmware();
        let Some(image) = image.filter(|image| image.version() > current) else {
            info!("Firmware {current} is up to date");
            self.oad.disable();
            return Err(FirmwareError::AlreadyUpToDate.into());
        };

        let frame = self.oad.start(image)?;
        if self.acquisition.is_streaming() {
            self.stop_stream();
        }
        self.start_timer(TimerId::OadTransfer, TimerSpec::once(self.config.oad_transfer_timeout()));
        self.stop_battery_polling();
        self.set_notify(GattRole::MailboxNotify, true);
        self.write(GattRole::MailboxWrite, frame, true);
        self.emit(OadEvent::Progress(0.05));
        self.oad.set_state(OadState::Ready);
        Ok(())
    }

    /// Next OAD block write for the send loop, or `None` once the loop must
    /// stop.
    pub fn next_oad_step(&mut self) -> Option<LinkCommand> {
        let step = self.oad.next_step();
        if !self.linked {
            return None;
        }
        match step {
            OadStep::Send { block, progress } => {
                if let Some(progress) = progress {
                    self.emit(OadEvent::Progress(progress));
                }
                let Some(&characteristic) = self.characteristics.get(&GattRole::OadTransfer) else {
                    warn!("No OAD transfer characteristic");
                    return None;
                };
                Some(LinkCommand::Write {
                    characteristic,
                    bytes: block,
                    with_response: false,
                })
            }
            OadStep::Finished => None,
        }
    }

    /// The system audio output changed from `previous` to `current`.
    pub fn on_audio_route_change(&mut self, current: Option<&str>, previous: Option<&str>) {
        let serial = current.and_then(|name| self.config.serial_from_audio_name(name));
        let previous_serial = previous.and_then(|name| self.config.serial_from_audio_name(name));
        let (Some(name), Some(serial)) = (current, serial.filter(|s| Some(s) != previous_serial.as_ref())) else {
            debug!("Audio output no longer a melomind");
            self.audio_connected = false;
            self.emit(ConnectionEvent::AudioDisconnected);
            return;
        };

        self.audio_connected = true;
        self.emit(ConnectionEvent::AudioConnected(name.to_owned()));
        let ble_name = format!("{BLE_NAME_PREFIX}{serial}");

        if !self.linked {
            self.connect(Some(&ble_name));
            return;
        }

        if !self.oad.is_in_flight() {
            if !self.target_name.eq_ignore_ascii_case(&ble_name) {
                info!("Audio moved to {ble_name}, switching headset");
                self.connect(Some(&ble_name));
                return;
            }
            self.stop_timer(TimerId::A2dpConnection);
            if self.a2dp_pending {
                self.a2dp_pending = false;
                self.establish();
            }
        } else if self.oad.state() == OadState::Reconnected {
            self.stop_timer(TimerId::A2dpConnection);
            self.a2dp_pending = false;
            self.verify_updated_firmware();
            self.establish();
        }
    }

    // ── Link events ───────────────────────────────────────────────────────────

    pub fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::PowerChanged(on) => self.on_power_changed(on),
            LinkEvent::Discovered { id, name, services } => self.on_discovered(id, name, &services),
            LinkEvent::Connected => self.on_connected(),
            LinkEvent::ConnectFailed => {
                if self.state == ConnectionState::Connecting {
                    self.on_disconnected();
                }
            }
            LinkEvent::Disconnected => {
                // A failed attempt arrives as ConnectFailed, so an unlinked
                // Disconnected belongs to a link that was already released.
                if !self.linked && self.state != ConnectionState::Disconnecting {
                    debug!("Ignoring disconnection of a released link in {:?}", self.state);
                    return;
                }
                self.on_disconnected();
            }
            LinkEvent::ServicesDiscovered(services) => self.on_services(services),
            LinkEvent::CharacteristicsDiscovered { service, characteristics } => {
                self.on_characteristics(service, &characteristics)
            }
            LinkEvent::ValueUpdated { characteristic, value } => self.on_value(characteristic, &value),
        }
    }

    fn on_power_changed(&mut self, on: bool) {
        if !self.power.record(on) {
            return;
        }
        info!("Bluetooth powered {}", if on { "on" } else { "off" });

        if on {
            if self.is_timer_running(TimerId::Connection) && self.state == ConnectionState::Idle {
                self.scan();
            }
        } else if !self.oad.is_in_flight() {
            let attached = self.linked || self.state != ConnectionState::Idle;
            if self.linked {
                self.emit(ConnectionEvent::Lost(LinkError::BlePoweredOff.into()));
            } else if attached || self.is_timer_running(TimerId::Connection) {
                self.emit(ConnectionEvent::Failed(LinkError::BluetoothPoweredOff.into()));
            }
            if attached || self.is_timer_running(TimerId::Connection) {
                self.drop_link(ConnectionState::Idle);
            }
        } else if self.oad.state() != OadState::RebootRequired {
            if self.linked {
                self.link(LinkCommand::Disconnect);
            }
            if self.oad.state() > OadState::Completed {
                self.oad.set_state(OadState::Reconnected);
                self.emit(OadEvent::Failed(OadError::ReconnectionAfterTransferFailed.into()));
            } else {
                self.oad.disable();
                self.emit(OadEvent::Failed(LinkError::ConnectionLost.into()));
            }
            self.drop_link(ConnectionState::Idle);
        }

        if self.power.is_full() && self.power.is_on() && self.oad.state() == OadState::RebootRequired {
            info!("Radio restarted after firmware update");
            self.emit(OadEvent::RadioRestarted);
            if self.target_name.is_empty() {
                self.oad.disable();
                self.emit(OadEvent::Failed(OadError::ReconnectionAfterTransferFailed.into()));
                return;
            }
            self.identity = DeviceIdentity::default();
            self.oad.set_state(OadState::Reconnected);
            self.scan();
        }
    }

    fn on_discovered(&mut self, id: String, name: Option<String>, services: &[Uuid]) {
        if self.state != ConnectionState::Scanning {
            return;
        }
        let Some(name) = name else { return };
        let Some(framing) = Framing::detect(services) else { return };
        if !name.to_lowercase().starts_with(&self.config.name_prefix.to_lowercase()) {
            return;
        }
        if !self.is_timer_running(TimerId::Connection) && self.oad.state() < OadState::Started {
            return;
        }

        if self.target_name.is_empty() {
            info!("Bound to {name}");
            self.target_name = name.clone();
        }
        if !self.target_name.eq_ignore_ascii_case(&name) {
            debug!("Ignoring {name}, looking for {}", self.target_name);
            return;
        }

        info!("Found {name} ({id})");
        self.framing = Some(framing);
        self.link(LinkCommand::StopScan);
        self.link(LinkCommand::Connect(id));
        self.set_state(ConnectionState::Connecting);
    }

    fn on_connected(&mut self) {
        if self.state != ConnectionState::Connecting {
            debug!("Ignoring connection in {:?}", self.state);
            return;
        }
        self.linked = true;
        self.identity = DeviceIdentity::default();
        self.characteristics.clear();
        self.link(LinkCommand::DiscoverServices);
        self.set_state(ConnectionState::DiscoveringServices);
    }

    fn on_services(&mut self, services: Vec<Uuid>) {
        if self.state != ConnectionState::DiscoveringServices {
            return;
        }
        let Some(framing) = Framing::detect(&services).or(self.framing) else {
            warn!("Headset exposes none of the known services");
            self.fail_connection(IdentityError::InfoUnavailable.into());
            self.teardown_link();
            return;
        };
        self.framing = Some(framing);
        self.profile = HardwareProfile::default_for(framing);
        self.pending_services = services.into_iter().collect();
        self.set_state(ConnectionState::DiscoveringCharacteristics);
        if self.pending_services.is_empty() {
            self.on_discovery_complete();
        }
    }

    fn on_characteristics(&mut self, service: Uuid, characteristics: &[Uuid]) {
        if self.state != ConnectionState::DiscoveringCharacteristics {
            return;
        }
        let Some(framing) = self.framing else { return };
        for uuid in characteristics {
            for (role, _) in framing.layout().iter().filter(|(_, u)| u == uuid) {
                self.characteristics.insert(*role, *uuid);
            }
        }
        self.pending_services.remove(&service);
        if self.pending_services.is_empty() {
            self.on_discovery_complete();
        }
    }

    fn on_discovery_complete(&mut self) {
        let Some(framing) = self.framing else { return };
        let missing: Vec<GattRole> = framing
            .required_roles()
            .iter()
            .copied()
            .filter(|role| !self.characteristics.contains_key(role))
            .collect();
        if !missing.is_empty() {
            warn!("Missing characteristics: {missing:?}");
            self.fail_connection(IdentityError::InfoUnavailable.into());
            self.teardown_link();
            return;
        }

        self.set_state(ConnectionState::Finalizing);
        self.identity = DeviceIdentity::default();
        self.identity_ticks = 0;
        self.identity_reported = false;
        self.finalize_battery_seen = false;
        self.set_notify(GattRole::MailboxNotify, true);
        self.request_identity(framing);
        self.start_timer(TimerId::IdentityPoll, TimerSpec::every(self.config.identity_poll_step()));
    }

    fn on_disconnected(&mut self) {
        if self.state == ConnectionState::Disconnecting {
            self.linked = false;
            self.set_state(ConnectionState::Idle);
            return;
        }
        if !self.linked && self.state != ConnectionState::Connecting {
            debug!("Ignoring disconnection in {:?}", self.state);
            return;
        }
        self.linked = false;

        if self.oad.is_in_flight() {
            if self.oad.state() == OadState::Completed {
                info!("Headset rebooting into new firmware");
                self.emit(OadEvent::Progress(0.95));
                self.emit(OadEvent::RebootRequired);
                self.oad.set_state(OadState::RebootRequired);
                self.drop_link(ConnectionState::Idle);
                return;
            }
            warn!("Link lost during firmware update ({:?})", self.oad.state());
            self.oad.disable();
            self.emit(OadEvent::Failed(OadError::ReconnectionAfterTransferFailed.into()));
        } else if self.is_timer_running(TimerId::Connection) {
            self.emit(ConnectionEvent::Failed(LinkError::PairingDenied.into()));
        } else {
            self.emit(ConnectionEvent::Lost(LinkError::ConnectionLost.into()));
        }
        self.drop_link(ConnectionState::Idle);
    }

    // ── Values ────────────────────────────────────────────────────────────────

    fn on_value(&mut self, characteristic: Uuid, value: &[u8]) {
        let Some(framing) = self.framing else { return };
        match framing.role_of(characteristic) {
            Some(GattRole::Telemetry) => self.on_telemetry(value),
            Some(GattRole::HeadsetStatus) => match parse::decode_headset_status(value) {
                Ok(Some(saturation)) => self.emit(AcquisitionEvent::Saturation(saturation)),
                Ok(None) => {}
                Err(e) => warn!("Dropping headset status: {e}"),
            },
            Some(GattRole::DeviceState) => match value.first() {
                Some(&raw) => self.on_battery(raw),
                None => warn!("Empty device state"),
            },
            Some(GattRole::MailboxNotify | GattRole::MailboxWrite) => self.on_mailbox(value),
            Some(role @ (GattRole::ProductName
            | GattRole::SerialNumber
            | GattRole::HardwareRevision
            | GattRole::FirmwareRevision)) => match mailbox::ascii(value) {
                Ok(text) => self.set_identity_field(role, text),
                Err(e) => warn!("Dropping {role:?}: {e}"),
            },
            Some(GattRole::OadTransfer) | None => debug!("Unhandled value on {characteristic}"),
        }
    }

    fn on_telemetry(&mut self, data: &[u8]) {
        for packet in self.acquisition.on_telemetry(data) {
            self.publish_packet(packet);
        }
    }

    fn publish_packet(&mut self, packet: EegPacket) {
        self.recorder.record(&packet);
        self.emit(AcquisitionEvent::Packet(packet));
    }

    fn on_mailbox(&mut self, bytes: &[u8]) {
        let event = match mailbox::decode(bytes).and_then(|message| message.interpret()) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping mailbox frame {bytes:02X?}: {e}");
                return;
            }
        };

        match event {
            MailboxEvent::OtaMode { ready } => self.on_ota_mode(ready),
            MailboxEvent::OtaIndexReset { block } => {
                if self.oad.on_index_reset(block) {
                    self.outbox.push_back(Action::StartOadSendLoop);
                }
            }
            MailboxEvent::OtaStatus { success } => self.on_ota_status(success),
            MailboxEvent::A2dpConnection(status) => self.on_a2dp(status.outcome()),
            MailboxEvent::ExternalNameSet => {
                if self.external_name_pending {
                    self.external_name_pending = false;
                    self.stop_timer(TimerId::ExternalName);
                    self.finalize();
                }
            }
            MailboxEvent::BatteryLevel(raw) => self.on_battery(raw),
            MailboxEvent::ProductName(text) => self.set_identity_field(GattRole::ProductName, text),
            MailboxEvent::SerialNumber(text) => self.set_identity_field(GattRole::SerialNumber, text),
            MailboxEvent::HardwareVersion(text) => self.set_identity_field(GattRole::HardwareRevision, text),
            MailboxEvent::FirmwareVersion(text) => self.set_identity_field(GattRole::FirmwareRevision, text),
            MailboxEvent::MtuSize(0) => error!("Headset refused the MTU change"),
            MailboxEvent::MtuSize(size) => {
                debug!("MTU set to {size}");
                self.mtu = Some(size);
            }
            MailboxEvent::EegFrame(payload) => self.on_telemetry(&payload),
            MailboxEvent::ImsFrame(payload) => {
                let samples = parse::decode_ims_frame(&payload, self.config.accelerometer_scale);
                if !samples.is_empty() {
                    self.emit(AcquisitionEvent::Accelerometer(samples));
                }
            }
            MailboxEvent::EegStarted
            | MailboxEvent::EegStopped
            | MailboxEvent::ImsStarted
            | MailboxEvent::ImsStopped
            | MailboxEvent::Acknowledged(_) => debug!("Mailbox: {event:?}"),
        }
    }

    fn on_battery(&mut self, raw: u8) {
        let level = match parse::decode_battery(self.profile, raw) {
            Ok(level) => level,
            Err(e) => {
                warn!("Dropping battery level: {e}");
                return;
            }
        };
        self.battery = Some(level);
        self.emit(ConnectionEvent::BatteryLevel(level));

        if self.state != ConnectionState::Finalizing || !self.identity_reported || self.finalize_battery_seen {
            return;
        }
        self.finalize_battery_seen = true;
        self.stop_timer(TimerId::FinalizeConnection);

        if let Some(qr_code) = self.external_name_to_register() {
            info!("Registering external name {qr_code}");
            self.set_notify(GattRole::MailboxNotify, true);
            self.write(GattRole::MailboxWrite, mailbox::external_name(&qr_code), true);
            self.external_name_pending = true;
            self.start_timer(TimerId::ExternalName, TimerSpec::once(self.config.external_name_timeout()));
            return;
        }
        self.finalize();
    }

    fn external_name_to_register(&self) -> Option<String> {
        if self.identity.product_name.as_deref() != Some(DEFAULT_PRODUCT_NAME)
            || !self.identity.firmware_at_least(REGISTER_EXTERNAL_NAME_VERSION)
        {
            return None;
        }
        let serial = self.identity.serial_number.as_deref()?;
        self.config.qr_code_for(serial).map(str::to_owned)
    }

    // ── Identity and finalization ─────────────────────────────────────────────

    fn request_identity(&mut self, framing: Framing) {
        match framing {
            Framing::Dedicated => {
                for role in GattRole::IDENTITY {
                    self.read(role);
                }
            }
            Framing::Multiplexed => {
                for opcode in [
                    Opcode::DeviceId,
                    Opcode::SerialNumber,
                    Opcode::HardwareVersion,
                    Opcode::FirmwareVersion,
                ] {
                    self.write(GattRole::MailboxWrite, mailbox::request(opcode), true);
                }
            }
        }
    }

    fn set_identity_field(&mut self, role: GattRole, text: String) {
        debug!("{role:?}: {text}");
        let field = match role {
            GattRole::ProductName => &mut self.identity.product_name,
            GattRole::SerialNumber => &mut self.identity.serial_number,
            GattRole::HardwareRevision => &mut self.identity.hardware_version,
            GattRole::FirmwareRevision => &mut self.identity.firmware_version,
            _ => return,
        };
        *field = Some(text);

        if self.state == ConnectionState::Finalizing && !self.identity_reported && self.identity.is_complete() {
            self.on_identity_complete();
        }
    }

    fn on_identity_complete(&mut self) {
        self.identity_reported = true;
        self.stop_timer(TimerId::IdentityPoll);

        let Some(profile) = self.identity.profile() else {
            warn!("Unknown hardware version {:?}", self.identity.hardware_version);
            self.fail_connection(IdentityError::InfoUnavailable.into());
            self.teardown_link();
            return;
        };
        if Some(profile.framing()) != self.framing {
            warn!("{profile:?} reported over {:?} framing", self.framing);
        }
        info!(
            "Identity: {:?} serial {:?} firmware {}",
            profile,
            self.identity.serial_number,
            self.identity.firmware()
        );
        self.profile = profile;
        self.acquisition.configure(profile);

        if !self.oad.is_in_flight() {
            self.check_for_update();
        }
        if profile == HardwareProfile::Indus5 {
            self.write(GattRole::MailboxWrite, mailbox::mtu_request(INDUS5_MTU), true);
        }
        self.request_battery();
        self.start_timer(TimerId::FinalizeConnection, TimerSpec::once(self.config.finalize_retry()));
    }

    fn check_for_update(&mut self) {
        let available = self
            .firmware_source
            .as_ref()
            .and_then(|source| source.locate_firmware(&self.identity))
            .map(|image| image.version());
        if let Some(version) = available.filter(|v| *v > self.identity.firmware()) {
            info!("Firmware {version} available");
            self.emit(ConnectionEvent::UpdateAvailable(version));
        }
    }

    fn finalize(&mut self) {
        self.stop_timer(TimerId::FinalizeConnection);
        if !self.linked {
            self.emit(ConnectionEvent::Failed(IdentityError::NotConnected.into()));
            return;
        }
        self.stop_timer(TimerId::Connection);

        if self.should_request_audio() {
            info!("Requesting audio connection from headset");
            self.write(GattRole::MailboxWrite, mailbox::a2dp_connect_request(), true);
            self.a2dp_pending = true;
            self.start_timer(TimerId::A2dpConnection, TimerSpec::once(self.config.a2dp_timeout()));
            return;
        }
        if self.oad.is_in_flight() {
            self.verify_updated_firmware();
        }
        self.establish();
    }

    fn should_request_audio(&self) -> bool {
        self.config.audio_pairing
            && !self.audio_connected
            && self.identity.firmware_at_least(A2DP_FROM_HEADSET_VERSION)
    }

    fn verify_updated_firmware(&mut self) {
        match self.oad.verify(self.identity.firmware()) {
            Ok(()) => {
                info!("Firmware updated to {}", self.identity.firmware());
                self.emit(OadEvent::Progress(1.0));
            }
            Err(e) => {
                warn!("Firmware {} after update does not match", self.identity.firmware());
                self.emit(OadEvent::Failed(e.into()));
            }
        }
    }

    fn establish(&mut self) {
        if self.state == ConnectionState::Ready {
            return;
        }
        self.set_state(ConnectionState::Ready);
        self.emit(ConnectionEvent::Established(self.identity.clone()));
        self.start_battery_polling();
    }

    fn on_a2dp(&mut self, outcome: A2dpOutcome) {
        match outcome {
            A2dpOutcome::Connected => {
                info!("Headset audio connected");
                self.stop_timer(TimerId::A2dpConnection);
                self.audio_connected = true;
                if self.a2dp_pending {
                    self.a2dp_pending = false;
                    if self.oad.is_in_flight() {
                        self.verify_updated_firmware();
                    }
                    self.establish();
                }
            }
            A2dpOutcome::InProgress => debug!("Headset audio connection in progress"),
            A2dpOutcome::Failed(error) => {
                self.stop_timer(TimerId::A2dpConnection);
                if self.oad.is_in_flight() {
                    self.oad.disable();
                    self.emit(OadEvent::Failed(error));
                    self.teardown_link();
                    return;
                }
                warn!("Headset audio connection failed: {error}");
                self.emit(ConnectionEvent::AudioFailed(error));
                if self.a2dp_pending {
                    self.a2dp_pending = false;
                    self.establish();
                }
            }
        }
    }

    // ── Firmware update ───────────────────────────────────────────────────────

    fn on_ota_mode(&mut self, ready: bool) {
        if self.oad.state() != OadState::Ready {
            debug!("Ignoring OTA mode in {:?}", self.oad.state());
            return;
        }
        if self.oad.on_ota_mode(ready) {
            info!("Headset ready for {} blocks", self.oad.block_count());
            self.emit(OadEvent::ReadyToUpdate);
            self.outbox.push_back(Action::StartOadSendLoop);
        } else {
            self.fail_oad(OadError::TransferPreparationFailed.into());
        }
    }

    fn on_ota_status(&mut self, success: bool) {
        if self.oad.state() != OadState::InProgress {
            debug!("Ignoring OTA status in {:?}", self.oad.state());
            return;
        }
        if self.oad.on_status(success) {
            info!("Firmware transfer complete");
            self.stop_timer(TimerId::OadTransfer);
            self.emit(OadEvent::Progress(0.9));
            self.emit(OadEvent::Completed);
        } else {
            self.fail_oad(OadError::TransferInterrupted.into());
        }
    }

    /// Abort the transfer and fall back to a normal session.
    fn fail_oad(&mut self, error: HeadsetError) {
        warn!("Firmware update failed: {error}");
        self.oad.disable();
        self.stop_timer(TimerId::OadTransfer);
        self.emit(OadEvent::Failed(error));
        if self.state == ConnectionState::Ready {
            self.start_battery_polling();
        }
    }

    // ── Timers ────────────────────────────────────────────────────────────────

    /// A timer started through [`Action::StartTimer`] fired. Expiries of
    /// timers this supervisor no longer runs are ignored.
    pub fn on_timer_expired(&mut self, id: TimerId) {
        let Some(spec) = self.timers.get(&id).copied() else {
            debug!("Ignoring stale {id:?} expiry");
            return;
        };
        if spec.period.is_none() {
            self.timers.remove(&id);
        }

        match id {
            TimerId::Connection => {
                warn!("Connection timed out in {:?}", self.state);
                self.link(LinkCommand::StopScan);
                self.fail_connection(LinkError::ConnectionTimeout.into());
                self.teardown_link();
            }
            TimerId::OadTransfer => {
                if self.oad.is_in_flight() && self.oad.state() < OadState::Completed {
                    self.fail_oad(OadError::TransferTimeout.into());
                }
            }
            TimerId::A2dpConnection => {
                if self.a2dp_pending {
                    self.a2dp_pending = false;
                    self.emit(ConnectionEvent::AudioFailed(AudioError::ConnectionTimeout.into()));
                    if self.oad.is_in_flight() {
                        self.verify_updated_firmware();
                    }
                    self.establish();
                }
            }
            TimerId::FinalizeConnection => {
                if self.state == ConnectionState::Finalizing && !self.finalize_battery_seen {
                    debug!("Retrying battery read");
                    self.request_battery();
                    self.start_timer(TimerId::FinalizeConnection, spec);
                }
            }
            TimerId::ExternalName => {
                if self.external_name_pending {
                    warn!("External name not acknowledged");
                    self.external_name_pending = false;
                    self.finalize();
                }
            }
            TimerId::BatteryWarmup | TimerId::BatteryPoll => {
                if self.state == ConnectionState::Ready && !self.oad.is_in_flight() {
                    self.request_battery();
                }
            }
            TimerId::IdentityPoll => {
                if self.state != ConnectionState::Finalizing || self.identity_reported {
                    self.stop_timer(TimerId::IdentityPoll);
                    return;
                }
                self.identity_ticks += 1;
                if self.identity_ticks >= self.config.identity_poll_limit() {
                    warn!("Identity incomplete after {} polls: {:?}", self.identity_ticks, self.identity);
                    self.fail_connection(IdentityError::RetrieveInfoTimeout.into());
                    self.teardown_link();
                }
            }
        }
    }

    fn start_battery_polling(&mut self) {
        let interval = self.config.battery_poll_interval();
        self.start_timer(TimerId::BatteryWarmup, TimerSpec::once(BATTERY_WARMUP_DELAY));
        self.start_timer(
            TimerId::BatteryPoll,
            TimerSpec::repeating(interval.saturating_sub(BATTERY_WARMUP_DELAY), interval),
        );
    }

    fn stop_battery_polling(&mut self) {
        self.stop_timer(TimerId::BatteryWarmup);
        self.stop_timer(TimerId::BatteryPoll);
    }

    fn start_timer(&mut self, id: TimerId, spec: TimerSpec) {
        self.timers.insert(id, spec);
        self.outbox.push_back(Action::StartTimer(id, spec));
    }

    fn stop_timer(&mut self, id: TimerId) {
        if self.timers.remove(&id).is_some() {
            self.outbox.push_back(Action::StopTimer(id));
        }
    }

    fn stop_all_timers(&mut self) {
        self.timers.clear();
        self.outbox.push_back(Action::StopAllTimers);
    }

    // ── Session plumbing ──────────────────────────────────────────────────────

    fn scan(&mut self) {
        self.set_state(ConnectionState::Scanning);
        self.link(LinkCommand::StartScan {
            services: Framing::scan_services(),
        });
    }

    fn reset_session(&mut self) {
        self.oad.disable();
        self.framing = None;
        self.characteristics.clear();
        self.pending_services.clear();
        self.identity = DeviceIdentity::default();
        self.identity_ticks = 0;
        self.identity_reported = false;
        self.finalize_battery_seen = false;
        self.external_name_pending = false;
        self.a2dp_pending = false;
        self.audio_connected = false;
        self.mtu = None;
        self.battery = None;
        self.acquisition.stop();
    }

    /// Report a session failure through the OAD channel when a transfer is
    /// in flight, through the connection channel otherwise.
    fn fail_connection(&mut self, error: HeadsetError) {
        if self.oad.is_in_flight() {
            self.oad.disable();
            self.emit(OadEvent::Failed(error));
        } else {
            self.emit(ConnectionEvent::Failed(error));
        }
    }

    /// Forget the link after it went away on its own.
    fn drop_link(&mut self, next: ConnectionState) {
        self.stop_all_timers();
        self.linked = false;
        self.external_name_pending = false;
        self.a2dp_pending = false;
        self.acquisition.stop();
        self.set_state(next);
    }

    /// Actively close the link.
    fn teardown_link(&mut self) {
        let active = self.linked
            || matches!(
                self.state,
                ConnectionState::Connecting
                    | ConnectionState::DiscoveringServices
                    | ConnectionState::DiscoveringCharacteristics
                    | ConnectionState::Finalizing
                    | ConnectionState::Ready
            );
        self.link(LinkCommand::StopScan);
        if active {
            self.link(LinkCommand::Disconnect);
            self.drop_link(ConnectionState::Disconnecting);
        } else {
            self.drop_link(ConnectionState::Idle);
        }
    }

    fn request_battery(&mut self) {
        match self.profile.framing() {
            Framing::Dedicated => self.read(GattRole::DeviceState),
            Framing::Multiplexed => self.write(GattRole::MailboxWrite, mailbox::request(Opcode::BatteryLevel), true),
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("State {:?} → {state:?}", self.state);
            self.state = state;
            self.emit(ConnectionEvent::StateChanged(state));
        }
    }

    fn emit(&mut self, event: impl Into<HeadsetEvent>) {
        self.outbox.push_back(Action::Emit(event.into()));
    }

    fn link(&mut self, command: LinkCommand) {
        self.outbox.push_back(Action::Link(command));
    }

    fn uuid_for(&self, role: GattRole) -> Option<Uuid> {
        let uuid = self.characteristics.get(&role).copied();
        if uuid.is_none() {
            warn!("No characteristic for {role:?}");
        }
        uuid
    }

    fn read(&mut self, role: GattRole) {
        if let Some(uuid) = self.uuid_for(role) {
            self.link(LinkCommand::Read(uuid));
        }
    }

    fn write(&mut self, role: GattRole, bytes: Vec<u8>, with_response: bool) {
        if let Some(characteristic) = self.uuid_for(role) {
            self.link(LinkCommand::Write {
                characteristic,
                bytes,
                with_response,
            });
        }
    }

    fn set_notify(&mut self, role: GattRole, enabled: bool) {
        if let Some(characteristic) = self.uuid_for(role) {
            self.link(LinkCommand::SetNotify { characteristic, enabled });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::*;

    fn events(actions: &[Action]) -> Vec<HeadsetEvent> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Emit(HeadsetEvent::Connection(ConnectionEvent::StateChanged(_))) => None,
                Action::Emit(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    fn links(actions: &[Action]) -> Vec<LinkCommand> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Link(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    fn value(characteristic: Uuid, bytes: &[u8]) -> LinkEvent {
        LinkEvent::ValueUpdated {
            characteristic,
            value: bytes.to_vec(),
        }
    }

    /// Drive a dedicated-framing headset up to the point where its identity
    /// has been read.
    fn identified(sup: &mut ConnectionSupervisor, firmware: &str) {
        sup.on_link_event(LinkEvent::PowerChanged(true));
        sup.connect(None);
        sup.on_link_event(LinkEvent::Discovered {
            id: "dev-1".into(),
            name: Some("melo_2100123".into()),
            services: vec![BRAIN_SERVICE],
        });
        sup.on_link_event(LinkEvent::Connected);
        sup.on_link_event(LinkEvent::ServicesDiscovered(vec![BRAIN_SERVICE, DEVICE_INFO_SERVICE]));
        sup.on_link_event(LinkEvent::CharacteristicsDiscovered {
            service: BRAIN_SERVICE,
            characteristics: vec![
                BRAIN_ACTIVITY_CHARACTERISTIC,
                DEVICE_STATE_CHARACTERISTIC,
                HEADSET_STATUS_CHARACTERISTIC,
                MAILBOX_CHARACTERISTIC,
                OAD_TRANSFER_CHARACTERISTIC,
            ],
        });
        sup.on_link_event(LinkEvent::CharacteristicsDiscovered {
            service: DEVICE_INFO_SERVICE,
            characteristics: vec![
                PRODUCT_NAME_CHARACTERISTIC,
                SERIAL_NUMBER_CHARACTERISTIC,
                HARDWARE_REVISION_CHARACTERISTIC,
                FIRMWARE_REVISION_CHARACTERISTIC,
            ],
        });
        sup.on_link_event(value(PRODUCT_NAME_CHARACTERISTIC, b"melomind"));
        sup.on_link_event(value(SERIAL_NUMBER_CHARACTERISTIC, b"2100123"));
        sup.on_link_event(value(HARDWARE_REVISION_CHARACTERISTIC, b"1.0.0"));
        sup.on_link_event(value(FIRMWARE_REVISION_CHARACTERISTIC, firmware.as_bytes()));
    }

    #[test]
    fn power_history_keeps_three_distinct_states() {
        let mut history = PowerHistory::default();
        assert!(history.has_no_history());
        assert!(history.record(true));
        assert!(!history.record(true));
        history.record(false);
        history.record(true);
        assert!(history.is_full());
        assert!(history.is_on());
        history.record(false);
        assert!(history.is_full());
        assert!(history.is_off());
    }

    #[test]
    fn dedicated_connect_reaches_ready() {
        let mut sup = ConnectionSupervisor::new(CoreConfig::default());
        identified(&mut sup, "1.6.2");
        assert_eq!(sup.state(), ConnectionState::Finalizing);
        assert!(sup.identity().is_complete());
        sup.on_link_event(value(DEVICE_STATE_CHARACTERISTIC, &[3]));

        assert_eq!(sup.state(), ConnectionState::Ready);
        assert_eq!(sup.target_name(), "melo_2100123");
        let actions = sup.drain_actions();
        let emitted = events(&actions);
        assert!(emitted.contains(&ConnectionEvent::BatteryLevel(50.0).into()));
        assert!(matches!(
            emitted.last(),
            Some(HeadsetEvent::Connection(ConnectionEvent::Established(id)))
                if id.serial_number.as_deref() == Some("2100123")
        ));
        assert!(sup.is_timer_running(TimerId::BatteryPoll));
        assert!(sup.is_timer_running(TimerId::BatteryWarmup));
        assert!(!sup.is_timer_running(TimerId::Connection));
        assert!(links(&actions).contains(&LinkCommand::Read(SERIAL_NUMBER_CHARACTERISTIC)));
    }

    #[test]
    fn scan_filter_requires_name_and_service() {
        let mut sup = ConnectionSupervisor::new(CoreConfig::default());
        sup.on_link_event(LinkEvent::PowerChanged(true));
        sup.connect(Some("melo_9"));
        sup.drain_actions();

        for (name, services) in [
            ("melo_9", vec![]),
            ("muse-1234", vec![BRAIN_SERVICE]),
            ("melo_8", vec![BRAIN_SERVICE]),
            ("hello_melo_9", vec![BRAIN_SERVICE]),
        ] {
            sup.on_link_event(LinkEvent::Discovered {
                id: "x".into(),
                name: Some(name.into()),
                services,
            });
        }
        assert_eq!(sup.state(), ConnectionState::Scanning);
        assert!(links(&sup.drain_actions()).is_empty());

        sup.on_link_event(LinkEvent::Discovered {
            id: "y".into(),
            name: Some("MELO_9".into()),
            services: vec![TRANSPARENT_SERVICE],
        });
        assert_eq!(
            links(&sup.drain_actions()),
            vec![LinkCommand::StopScan, LinkCommand::Connect("y".into())]
        );
    }

    #[test]
    fn identity_poll_gives_up() {
        let mut sup = ConnectionSupervisor::new(CoreConfig {
            identity_wait_timeout_secs: 1,
            identity_poll_step_ms: 500,
            ..CoreConfig::default()
        });
        sup.on_link_event(LinkEvent::PowerChanged(true));
        sup.connect(None);
        sup.on_link_event(LinkEvent::Discovered {
            id: "dev".into(),
            name: Some("melo_1".into()),
            services: vec![TRANSPARENT_SERVICE],
        });
        sup.on_link_event(LinkEvent::Connected);
        sup.on_link_event(LinkEvent::ServicesDiscovered(vec![TRANSPARENT_SERVICE]));
        sup.on_link_event(LinkEvent::CharacteristicsDiscovered {
            service: TRANSPARENT_SERVICE,
            characteristics: vec![MAILBOX_RX_CHARACTERISTIC, MAILBOX_TX_CHARACTERISTIC],
        });
        assert_eq!(sup.state(), ConnectionState::Finalizing);
        sup.drain_actions();

        sup.on_timer_expired(TimerId::IdentityPoll);
        assert_eq!(sup.state(), ConnectionState::Finalizing);
        sup.on_timer_expired(TimerId::IdentityPoll);
        let actions = sup.drain_actions();
        assert_eq!(
            events(&actions),
            vec![ConnectionEvent::Failed(IdentityError::RetrieveInfoTimeout.into()).into()]
        );
        assert!(links(&actions).contains(&LinkCommand::Disconnect));
        assert_eq!(sup.state(), ConnectionState::Disconnecting);

        sup.on_link_event(LinkEvent::Disconnected);
        assert_eq!(sup.state(), ConnectionState::Idle);
        assert!(events(&sup.drain_actions()).is_empty());
    }

    #[test]
    fn any_headset_binds_only_to_prefixed_names() {
        let mut sup = ConnectionSupervisor::new(CoreConfig::default());
        sup.on_link_event(LinkEvent::PowerChanged(true));
        sup.connect(None);
        sup.drain_actions();

        sup.on_link_event(LinkEvent::Discovered {
            id: "x".into(),
            name: Some("hello_melo_x".into()),
            services: vec![BRAIN_SERVICE],
        });
        assert_eq!(sup.state(), ConnectionState::Scanning);
        assert!(links(&sup.drain_actions()).is_empty());

        sup.on_link_event(LinkEvent::Discovered {
            id: "y".into(),
            name: Some("Melo_2100123".into()),
            services: vec![BRAIN_SERVICE],
        });
        assert_eq!(
            links(&sup.drain_actions()),
            vec![LinkCommand::StopScan, LinkCommand::Connect("y".into())]
        );
        assert_eq!(sup.state(), ConnectionState::Connecting);
    }

    #[test]
    fn stale_timer_expiry_is_ignored() {
        let mut sup = ConnectionSupervisor::new(CoreConfig::default());
        sup.on_timer_expired(TimerId::Connection);
        assert!(sup.drain_actions().is_empty());
    }

    #[test]
    fn connection_timeout_fails_once() {
        let mut sup = ConnectionSupervisor::new(CoreConfig::default());
        sup.on_link_event(LinkEvent::PowerChanged(true));
        sup.connect(None);
        sup.drain_actions();
        sup.on_timer_expired(TimerId::Connection);
        let actions = sup.drain_actions();
        assert_eq!(
            events(&actions),
            vec![ConnectionEvent::Failed(LinkError::ConnectionTimeout.into()).into()]
        );
        assert_eq!(sup.state(), ConnectionState::Idle);
        sup.on_timer_expired(TimerId::Connection);
        assert!(sup.drain_actions().is_empty());
    }

    #[test]
    fn external_name_registered_before_ready() {
        let mut config = CoreConfig::default();
        config.qr_codes.insert("2100123".into(), "MM10000123".into());
        let mut sup = ConnectionSupervisor::new(config);
        identified(&mut sup, "1.7.1");
        sup.on_link_event(value(DEVICE_STATE_CHARACTERISTIC, &[6]));
        assert_eq!(sup.state(), ConnectionState::Finalizing);
        let actions = sup.drain_actions();
        assert!(links(&actions).contains(&LinkCommand::Write {
            characteristic: MAILBOX_CHARACTERISTIC,
            bytes: mailbox::external_name("MM10000123"),
            with_response: true,
        }));

        sup.on_link_event(value(MAILBOX_CHARACTERISTIC, &[Opcode::SetA2dpName.byte()]));
        assert_eq!(sup.state(), ConnectionState::Ready);
        assert!(!sup.is_timer_running(TimerId::ExternalName));
    }

    #[test]
    fn battery_poll_reads_device_state() {
        let mut sup = ConnectionSupervisor::new(CoreConfig::default());
        identified(&mut sup, "1.6.2");
        sup.on_link_event(value(DEVICE_STATE_CHARACTERISTIC, &[6]));
        sup.drain_actions();

        sup.on_timer_expired(TimerId::BatteryPoll);
        assert_eq!(
            links(&sup.drain_actions()),
            vec![LinkCommand::Read(DEVICE_STATE_CHARACTERISTIC)]
        );
        assert!(sup.is_timer_running(TimerId::BatteryPoll));
        sup.on_timer_expired(TimerId::BatteryWarmup);
        assert!(!sup.is_timer_running(TimerId::BatteryWarmup));
    }

    #[test]
    fn malformed_mailbox_frame_is_dropped() {
        let mut sup = ConnectionSupervisor::new(CoreConfig::default());
        identified(&mut sup, "1.6.2");
        sup.drain_actions();
        sup.on_link_event(value(MAILBOX_CHARACTERISTIC, &[0xEE, 1, 2]));
        sup.on_link_event(value(MAILBOX_CHARACTERISTIC, &[]));
        assert!(sup.drain_actions().is_empty());
        assert_eq!(sup.state(), ConnectionState::Finalizing);
    }
}
