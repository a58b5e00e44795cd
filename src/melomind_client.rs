use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use uuid::Uuid;

use crate::acquisition::LostFramePolicy;
use crate::config::CoreConfig;
use crate::error::HeadsetError;
use crate::oad::{DirectoryFirmwareSource, FirmwareSource};
use crate::quality::QualityScorer;
use crate::recording::{RecordHandle, SessionSink};
use crate::supervisor::{Action, ConnectionSupervisor, LinkCommand, LinkEvent};
use crate::timers::{TimerExpiry, TimerScheduler};
use crate::types::{ConnectionState, DeviceIdentity, HeadsetEvent};

// ── MelomindClientConfig ──────────────────────────────────────────────────────

/// Configuration for [`MelomindClient`].
#[derive(Debug, Clone)]
pub struct MelomindClientConfig {
    /// Session behaviour: timeouts, name filter, audio pairing, QR codes.
    pub core: CoreConfig,
    /// Hard limit on a single BLE `connect()` call. Default: `10`.
    pub connect_timeout_secs: u64,
    /// Hard limit on service discovery. Default: `15`.
    pub discover_timeout_secs: u64,
    /// Directory holding `mm-ota*.bin` firmware images. Without it no
    /// update is ever offered.
    pub firmware_dir: Option<PathBuf>,
    pub lost_frame_policy: LostFramePolicy,
}

impl Default for MelomindClientConfig {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            connect_timeout_secs: 10,
            discover_timeout_secs: 15,
            firmware_dir: None,
            lost_frame_policy: LostFramePolicy::default(),
        }
    }
}

// ── MelomindClient ────────────────────────────────────────────────────────────

/// BLE client for melomind headsets.
///
/// [`MelomindClient::start`] opens the first Bluetooth adapter and spawns a
/// driver task that owns the [`ConnectionSupervisor`]. The task turns
/// btleplug events into [`LinkEvent`]s, runs the supervisor's timers and
/// carries out its [`LinkCommand`]s. Everything the host needs to know
/// arrives on the returned event channel; everything it wants done goes
/// through the [`MelomindHandle`].
pub struct MelomindClient {
    config: MelomindClientConfig,
    firmware_source: Option<Box<dyn FirmwareSource>>,
    quality_scorer: Option<Box<dyn QualityScorer>>,
}

impl MelomindClient {
    pub fn new(config: MelomindClientConfig) -> Self {
        Self {
            config,
            firmware_source: None,
            quality_scorer: None,
        }
    }

    /// Offer firmware from `source` instead of [`MelomindClientConfig::firmware_dir`].
    pub fn with_firmware_source(mut self, source: Box<dyn FirmwareSource>) -> Self {
        self.firmware_source = Some(source);
        self
    }

    pub fn with_quality_scorer(mut self, scorer: Box<dyn QualityScorer>) -> Self {
        self.quality_scorer = Some(scorer);
        self
    }

    pub async fn start(self) -> Result<(mpsc::Receiver<HeadsetEvent>, MelomindHandle)> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;

        // CoreBluetooth starts in an "unknown" state and silently ignores
        // scans until it reports poweredOn.
        #[cfg(target_os = "macos")]
        {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                match adapter.adapter_state().await {
                    Ok(CentralState::PoweredOn) => break,
                    Ok(_) if tokio::time::Instant::now() >= deadline => break,
                    Ok(state) => debug!("macOS: adapter state = {state:?}, waiting…"),
                    Err(_) => break,
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }

        let powered = match adapter.adapter_state().await {
            Ok(state) => Some(state == CentralState::PoweredOn),
            Err(e) => {
                warn!("Cannot read adapter state: {e}");
                None
            }
        };
        let central_events = adapter.events().await?;

        let mut supervisor = ConnectionSupervisor::new(self.config.core.clone())
            .with_lost_frame_policy(self.config.lost_frame_policy);
        if let Some(source) = self.firmware_source {
            supervisor = supervisor.with_firmware_source(source);
        } else if let Some(dir) = &self.config.firmware_dir {
            info!("Firmware images from {}", dir.display());
            supervisor = supervisor.with_firmware_source(Box::new(DirectoryFirmwareSource::new(dir)));
        }
        if let Some(scorer) = self.quality_scorer {
            supervisor.set_quality_scorer(scorer);
        }
        if let Some(on) = powered {
            supervisor.on_link_event(LinkEvent::PowerChanged(on));
        }

        let (event_tx, event_rx) = mpsc::channel::<HeadsetEvent>(256);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        let (link_tx, link_rx) = mpsc::unbounded_channel::<LinkReport>();
        let (timers, timer_rx) = TimerScheduler::new();

        let driver = Driver {
            config: self.config,
            adapter,
            supervisor,
            timers,
            peripherals: HashMap::new(),
            current: None,
            link: 0,
            notifications: None,
            oad_ticker: None,
            event_tx,
            link_tx,
        };
        tokio::spawn(driver.run(cmd_rx, link_rx, timer_rx, central_events));

        Ok((event_rx, MelomindHandle { tx: cmd_tx }))
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

enum Request {
    Connect(Option<String>),
    Disconnect,
    StartStream { quality: bool },
    StopStream,
    ReadBattery,
    StartFirmwareUpdate,
    StartAccelerometer,
    StopAccelerometer,
    StartRecording,
    StopRecording,
    AudioRouteChanged {
        current: Option<String>,
        previous: Option<String>,
    },
}

type SupervisorFn = Box<dyn FnOnce(&mut ConnectionSupervisor) + Send>;

enum Command {
    Request(Request, oneshot::Sender<Result<(), HeadsetError>>),
    /// Run a closure against the supervisor (queries, exports).
    With(SupervisorFn),
    Shutdown,
}

// ── MelomindHandle ────────────────────────────────────────────────────────────

/// Command side of a running [`MelomindClient`]. Cheap to clone.
#[derive(Clone)]
pub struct MelomindHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl MelomindHandle {
    async fn call(&self, request: Request) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Request(request, reply))
            .map_err(|_| anyhow!("driver task stopped"))?;
        rx.await.map_err(|_| anyhow!("driver task stopped"))??;
        Ok(())
    }

    async fn with<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ConnectionSupervisor) -> T + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::With(Box::new(move |supervisor: &mut ConnectionSupervisor| {
                let _ = reply.send(f(supervisor));
            })))
            .map_err(|_| anyhow!("driver task stopped"))?;
        rx.await.map_err(|_| anyhow!("driver task stopped"))
    }

    /// Connect to the headset advertising `name`, or to the first melomind
    /// found when `None`. Progress arrives as events.
    pub async fn connect(&self, name: Option<&str>) -> Result<()> {
        self.call(Request::Connect(name.map(str::to_owned))).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.call(Request::Disconnect).await
    }

    /// Start EEG streaming, scoring packets when `quality` is set and a
    /// scorer is installed.
    pub async fn start_stream(&self, quality: bool) -> Result<()> {
        self.call(Request::StartStream { quality }).await
    }

    pub async fn stop_stream(&self) -> Result<()> {
        self.call(Request::StopStream).await
    }

    pub async fn read_battery(&self) -> Result<()> {
        self.call(Request::ReadBattery).await
    }

    /// Install the newest firmware from the configured directory.
    pub async fn start_firmware_update(&self) -> Result<()> {
        self.call(Request::StartFirmwareUpdate).await
    }

    pub async fn start_accelerometer(&self) -> Result<()> {
        self.call(Request::StartAccelerometer).await
    }

    pub async fn stop_accelerometer(&self) -> Result<()> {
        self.call(Request::StopAccelerometer).await
    }

    pub async fn start_recording(&self) -> Result<()> {
        self.call(Request::StartRecording).await
    }

    pub async fn stop_recording(&self) -> Result<()> {
        self.call(Request::StopRecording).await
    }

    /// Report a change of the system audio output.
    pub async fn audio_route_changed(&self, current: Option<&str>, previous: Option<&str>) -> Result<()> {
        self.call(Request::AudioRouteChanged {
            current: current.map(str::to_owned),
            previous: previous.map(str::to_owned),
        })
        .await
    }

    pub async fn state(&self) -> Result<ConnectionState> {
        self.with(|supervisor| supervisor.state()).await
    }

    pub async fn identity(&self) -> Result<DeviceIdentity> {
        self.with(|supervisor| supervisor.identity().clone()).await
    }

    /// Hand the recorded packets to `sink`.
    pub async fn export_recording<S>(&self, mut sink: S) -> Result<RecordHandle>
    where
        S: SessionSink + Send + 'static,
    {
        let handle = self.with(move |supervisor| supervisor.export_recording(&mut sink)).await??;
        Ok(handle)
    }

    /// Disconnect and stop the driver task.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

// ── Driver ────────────────────────────────────────────────────────────────────

/// A link event produced by a spawned task, tagged with the link it
/// belongs to.
struct LinkReport {
    link: u64,
    event: LinkEvent,
}

#[derive(Clone)]
struct LinkReporter {
    link: u64,
    tx: mpsc::UnboundedSender<LinkReport>,
}

impl LinkReporter {
    /// `false` once the driver is gone.
    fn send(&self, event: LinkEvent) -> bool {
        self.tx.send(LinkReport { link: self.link, event }).is_ok()
    }
}

impl LinkReport {
    /// The event, unless it comes from a link older than `current`.
    fn accept(self, current: u64) -> Option<LinkEvent> {
        if self.link != current {
            debug!("Dropping {:?} from released link #{}", self.event, self.link);
            return None;
        }
        Some(self.event)
    }
}

struct Driver {
    config: MelomindClientConfig,
    adapter: Adapter,
    supervisor: ConnectionSupervisor,
    timers: TimerScheduler,
    /// Peripherals seen while scanning, by platform id.
    peripherals: HashMap<String, Peripheral>,
    current: Option<Peripheral>,
    /// Bumped on every connect and disconnect. Reports from older links are
    /// dropped.
    link: u64,
    notifications: Option<JoinHandle<()>>,
    oad_ticker: Option<Interval>,
    event_tx: mpsc::Sender<HeadsetEvent>,
    link_tx: mpsc::UnboundedSender<LinkReport>,
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut link_rx: mpsc::UnboundedReceiver<LinkReport>,
        mut timer_rx: mpsc::UnboundedReceiver<TimerExpiry>,
        mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    ) {
        info!("Driver started");
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Request(request, reply)) => {
                        let _ = reply.send(self.on_request(request));
                    }
                    Some(Command::With(f)) => f(&mut self.supervisor),
                    Some(Command::Shutdown) | None => {
                        self.supervisor.disconnect();
                        self.flush().await;
                        break;
                    }
                },
                Some(event) = central_events.next() => self.on_central_event(event).await,
                Some(report) = link_rx.recv() => self.on_link_report(report),
                Some(expiry) = timer_rx.recv() => {
                    if let Some(id) = self.timers.accept(expiry) {
                        self.supervisor.on_timer_expired(id);
                    }
                }
                _ = next_tick(&mut self.oad_ticker) => self.send_next_block().await,
            }
            self.flush().await;
        }

        self.timers.stop_all();
        if let Some(task) = self.notifications.take() {
            task.abort();
        }
        info!("Driver stopped");
    }

    fn on_link_report(&mut self, report: LinkReport) {
        if let Some(event) = report.accept(self.link) {
            self.supervisor.on_link_event(event);
        }
    }

    fn reporter(&self) -> LinkReporter {
        LinkReporter {
            link: self.link,
            tx: self.link_tx.clone(),
        }
    }

    fn on_request(&mut self, request: Request) -> Result<(), HeadsetError> {
        let supervisor = &mut self.supervisor;
        match request {
            Request::Connect(name) => supervisor.connect(name.as_deref()),
            Request::Disconnect => supervisor.disconnect(),
            Request::StartStream { quality } => return supervisor.start_stream(quality),
            Request::StopStream => supervisor.stop_stream(),
            Request::ReadBattery => return supervisor.read_battery(),
            Request::StartFirmwareUpdate => return supervisor.start_firmware_update(),
            Request::StartAccelerometer => return supervisor.start_accelerometer(),
            Request::StopAccelerometer => return supervisor.stop_accelerometer(),
            Request::StartRecording => supervisor.start_recording(),
            Request::StopRecording => supervisor.stop_recording(),
            Request::AudioRouteChanged { current, previous } => {
                supervisor.on_audio_route_change(current.as_deref(), previous.as_deref())
            }
        }
        Ok(())
    }

    /// Carry out every pending supervisor action, including the ones the
    /// actions themselves produce.
    async fn flush(&mut self) {
        loop {
            let actions = self.supervisor.drain_actions();
            if actions.is_empty() {
                return;
            }
            for action in actions {
                self.execute(action).await;
            }
        }
    }

    async fn execute(&mut self, action: Action) {
        match action {
            Action::Link(command) => {
                let description = format!("{command:?}");
                if let Err(e) = self.run_link(command).await {
                    warn!("{description} failed: {e}");
                }
            }
            Action::StartTimer(id, spec) => self.timers.start(id, spec),
            Action::StopTimer(id) => {
                self.timers.stop(id);
            }
            Action::StopAllTimers => self.timers.stop_all(),
            Action::Emit(event) => {
                if self.event_tx.send(event).await.is_err() {
                    debug!("Event receiver dropped");
                }
            }
            Action::StartOadSendLoop => {
                let mut ticker = interval(self.config.core.oad_block_pacing().max(Duration::from_millis(1)));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.oad_ticker = Some(ticker);
            }
        }
    }

    async fn send_next_block(&mut self) {
        match self.supervisor.next_oad_step() {
            Some(command) => {
                if let Err(e) = self.run_link(command).await {
                    warn!("OAD block write failed: {e}");
                }
            }
            None => {
                debug!("OAD send loop finished");
                self.oad_ticker = None;
            }
        }
    }

    // ── btleplug → LinkEvent ──────────────────────────────────────────────────

    async fn on_central_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if self.supervisor.state() != ConnectionState::Scanning {
                    return;
                }
                let Ok(peripheral) = self.adapter.peripheral(&id).await else { return };
                let Ok(Some(props)) = peripheral.properties().await else { return };
                let key = id.to_string();
                self.peripherals.insert(key.clone(), peripheral);
                self.supervisor.on_link_event(LinkEvent::Discovered {
                    id: key,
                    name: props.local_name,
                    services: props.services,
                });
            }
            CentralEvent::DeviceDisconnected(id) => {
                if self.current.as_ref().is_some_and(|p| p.id() == id) {
                    info!("Device {id:?} disconnected");
                    self.release_peripheral();
                    self.supervisor.on_link_event(LinkEvent::Disconnected);
                }
            }
            CentralEvent::StateUpdate(state) => {
                self.supervisor
                    .on_link_event(LinkEvent::PowerChanged(state == CentralState::PoweredOn));
            }
            _ => {}
        }
    }

    fn release_peripheral(&mut self) {
        self.current = None;
        self.oad_ticker = None;
        if let Some(task) = self.notifications.take() {
            task.abort();
        }
    }

    // ── LinkCommand → btleplug ────────────────────────────────────────────────

    fn peripheral(&self) -> Result<&Peripheral> {
        self.current.as_ref().ok_or_else(|| anyhow!("no connected peripheral"))
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral()?
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| anyhow!("Characteristic {uuid} not found"))
    }

    async fn run_link(&mut self, command: LinkCommand) -> Result<()> {
        match command {
            LinkCommand::StartScan { services } => {
                self.peripherals.clear();
                self.adapter.start_scan(ScanFilter { services }).await?;
            }
            LinkCommand::StopScan => self.adapter.stop_scan().await?,
            LinkCommand::Connect(id) => {
                let peripheral = self
                    .peripherals
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| anyhow!("unknown peripheral {id}"))?;
                self.current = Some(peripheral.clone());
                self.link += 1;
                let reporter = self.reporter();
                let limit = Duration::from_secs(self.config.connect_timeout_secs);
                // BlueZ's Device1.Connect can block forever when the device
                // is out of range.
                tokio::spawn(async move {
                    let event = match tokio::time::timeout(limit, peripheral.connect()).await {
                        Ok(Ok(())) => LinkEvent::Connected,
                        Ok(Err(e)) => {
                            warn!("connect() failed: {e}");
                            LinkEvent::ConnectFailed
                        }
                        Err(_) => {
                            warn!("connect() timed out after {limit:?}");
                            LinkEvent::ConnectFailed
                        }
                    };
                    reporter.send(event);
                });
            }
            LinkCommand::Disconnect => {
                let Some(peripheral) = self.current.clone() else {
                    self.supervisor.on_link_event(LinkEvent::Disconnected);
                    return Ok(());
                };
                self.release_peripheral();
                // A connect issued before this completes makes the report stale.
                self.link += 1;
                let reporter = self.reporter();
                tokio::spawn(async move {
                    if let Err(e) = peripheral.disconnect().await {
                        warn!("disconnect() failed: {e}");
                    }
                    reporter.send(LinkEvent::Disconnected);
                });
            }
            LinkCommand::DiscoverServices => {
                let peripheral = self.peripheral()?.clone();
                let reporter = self.reporter();
                let limit = Duration::from_secs(self.config.discover_timeout_secs);
                let forwarder = spawn_notification_forwarder(peripheral.clone(), reporter.clone());
                self.notifications = Some(forwarder);
                tokio::spawn(async move {
                    // BlueZ reports the connection before its GATT cache is
                    // populated.
                    #[cfg(target_os = "linux")]
                    tokio::time::sleep(Duration::from_millis(600)).await;

                    match tokio::time::timeout(limit, peripheral.discover_services()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("discover_services() failed: {e}"),
                        Err(_) => warn!("discover_services() timed out after {limit:?}"),
                    }
                    let services = peripheral.services();
                    reporter.send(LinkEvent::ServicesDiscovered(
                        services.iter().map(|s| s.uuid).collect(),
                    ));
                    for service in services {
                        reporter.send(LinkEvent::CharacteristicsDiscovered {
                            service: service.uuid,
                            characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
                        });
                    }
                });
            }
            LinkCommand::Read(uuid) => {
                // Awaited in place so the response reaches the supervisor
                // before any notification queued after it.
                let characteristic = self.characteristic(uuid)?;
                let peripheral = self.peripheral()?.clone();
                let value = peripheral.read(&characteristic).await?;
                self.supervisor.on_link_event(LinkEvent::ValueUpdated {
                    characteristic: uuid,
                    value,
                });
            }
            LinkCommand::Write {
                characteristic,
                bytes,
                with_response,
            } => {
                let target = self.characteristic(characteristic)?;
                let write_type = if with_response {
                    WriteType::WithResponse
                } else {
                    WriteType::WithoutResponse
                };
                let peripheral = self.peripheral()?.clone();
                peripheral.write(&target, &bytes, write_type).await?;
            }
            LinkCommand::SetNotify { characteristic, enabled } => {
                let target = self.characteristic(characteristic)?;
                let peripheral = self.peripheral()?.clone();
                if enabled {
                    peripheral.subscribe(&target).await?;
                } else {
                    peripheral.unsubscribe(&target).await?;
                }
            }
        }
        Ok(())
    }
}

/// Forward every notification of `peripheral` to the supervisor.
fn spawn_notification_forwarder(
    peripheral: Peripheral,
    reporter: LinkReporter,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut notifications = match peripheral.notifications().await {
            Ok(n) => n,
            Err(e) => {
                warn!("Could not get notifications stream: {e}");
                return;
            }
        };
        let mut count: u64 = 0;
        while let Some(notification) = notifications.next().await {
            count += 1;
            if count <= 5 || count % 500 == 0 {
                info!(
                    "Notification #{count} uuid={} len={}",
                    notification.uuid,
                    notification.value.len()
                );
            } else {
                debug!("Notification uuid={} len={}", notification.uuid, notification.value.len());
            }
            let event = LinkEvent::ValueUpdated {
                characteristic: notification.uuid,
                value: notification.value,
            };
            if !reporter.send(event) {
                break;
            }
        }
        debug!("Notification stream closed");
    })
}
