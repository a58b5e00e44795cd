//! # melomind-rs
//!
//! Async Rust core for melomind EEG headsets over Bluetooth Low Energy:
//! connection supervision, the mailbox control protocol, over-the-air
//! firmware updates and EEG acquisition.
//!
//! ## Supported hardware
//!
//! | Hardware | Framing | EEG ch | Accelerometer | Notes |
//! |---|---|---|---|---|
//! | Indus2 | dedicated characteristics | 2 (P3, P4) | ✗ | hardware version `1.0.0` |
//! | Indus3 | dedicated characteristics | 2 (P3, P4) | ✗ | hardware version `1.1.0` |
//! | Indus5 | mailbox-multiplexed | 4 (P3, P4, AF3, AF4) | ✓ | hardware version `2.x` |
//!
//! The framing is detected from the services a headset exposes; the exact
//! hardware profile from the hardware version it reports.
//!
//! ## Quick start
//!
//! ```no_run
//! use melomind_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (mut rx, handle) = MelomindClient::new(MelomindClientConfig::default()).start().await?;
//!     handle.connect(None).await?;
//!
//!     while let Some(event) = rx.recv().await {
//!         match event {
//!             HeadsetEvent::Connection(ConnectionEvent::Established(_)) => handle.start_stream(false).await?,
//!             HeadsetEvent::Acquisition(AcquisitionEvent::Packet(p)) => println!("{:?}", p.channels),
//!             HeadsetEvent::Connection(ConnectionEvent::Lost(_)) => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`melomind_client`] | btleplug driver and the [`melomind_client::MelomindHandle`] command API |
//! | [`supervisor`] | Sans-I/O session state machine: scan → ready, battery, OAD, audio pairing |
//! | [`timers`] | Keyed, cancellable timers driving the supervisor |
//! | [`mailbox`] | Opcode-framed control channel codec |
//! | [`oad`] | Firmware images, firmware sources and the block transfer engine |
//! | [`acquisition`] | Telemetry reassembly into fixed-size EEG packets with loss accounting |
//! | [`quality`] | Hook-up of an external signal-quality scorer |
//! | [`recording`] | In-memory session journal and its sinks |
//! | [`parse`] | Sample, battery, status and accelerometer decoders |
//! | [`protocol`] | GATT UUIDs, hardware profiles and protocol constants |
//! | [`types`] | Connection state, device identity, EEG packets and events |
//! | [`config`] | JSON-loadable runtime configuration |
//! | [`error`] | Typed, coded headset errors |
//! | [`version`] | Firmware version parsing and ordering |

pub mod acquisition;
pub mod config;
pub mod error;
pub mod mailbox;
pub mod melomind_client;
pub mod oad;
pub mod parse;
pub mod protocol;
pub mod quality;
pub mod recording;
pub mod supervisor;
pub mod timers;
pub mod types;
pub mod version;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Client ────────────────────────────────────────────────────────────────
    pub use crate::melomind_client::{MelomindClient, MelomindClientConfig, MelomindHandle};
    pub use crate::config::CoreConfig;

    // ── Events and data types ─────────────────────────────────────────────────
    pub use crate::types::{
        AcquisitionEvent, ConnectionEvent, ConnectionState, DeviceIdentity, EegPacket, HeadsetEvent,
        OadEvent, XyzSample,
    };
    pub use crate::error::HeadsetError;
    pub use crate::version::FirmwareVersion;

    // ── Extension points ──────────────────────────────────────────────────────
    pub use crate::oad::{FirmwareImage, FirmwareSource};
    pub use crate::quality::QualityScorer;
    pub use crate::recording::{JsonFileSink, RecordHandle, SessionSink};

    // ── Protocol constants ────────────────────────────────────────────────────
    pub use crate::protocol::{Electrode, HardwareProfile, PACKET_LENGTH, SAMPLE_RATE};
}
