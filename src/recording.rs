//! In-memory journal of a recording session.
//!
//! Packets are only kept while recording is on. Persisting them is up to the
//! host through a [`SessionSink`]; [`JsonFileSink`] writes one JSON file per
//! session.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use log::info;
use serde::Serialize;

use crate::parse::now_ms;
use crate::types::{DeviceIdentity, EegPacket};

/// Opaque identifier returned by a sink for a stored session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordHandle(pub String);

/// Host-side persistence of recorded sessions.
pub trait SessionSink {
    type Error: std::error::Error + Send + Sync + 'static;

    fn store(&mut self, packets: &[EegPacket], identity: &DeviceIdentity) -> Result<RecordHandle, Self::Error>;
}

#[derive(Debug, Default)]
pub struct SessionRecorder {
    recording: bool,
    packets: Vec<EegPacket>,
}

impl SessionRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.recording = true;
    }

    pub fn stop(&mut self) {
        self.recording = false;
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn record(&mut self, packet: &EegPacket) {
        if self.recording {
            self.packets.push(packet.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn packets(&self) -> &[EegPacket] {
        &self.packets
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }

    /// Hand the journal to `sink`. The journal is cleared only when the sink
    /// accepts it.
    pub fn export<S: SessionSink>(&mut self, sink: &mut S, identity: &DeviceIdentity) -> Result<RecordHandle, S::Error> {
        let handle = sink.store(&self.packets, identity)?;
        info!("Exported {} packets as {:?}", self.packets.len(), handle);
        self.packets.clear();
        Ok(handle)
    }
}

// ── JSON files ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct SessionFile<'a> {
    identity: &'a DeviceIdentity,
    packets: &'a [EegPacket],
}

/// Writes each session to `<dir>/session-<unix ms>.json`. Lost samples are
/// written as `null`.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl SessionSink for JsonFileSink {
    type Error = io::Error;

    fn store(&mut self, packets: &[EegPacket], identity: &DeviceIdentity) -> Result<RecordHandle, io::Error> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("session-{}.json", now_ms()));
        let mut writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer(&mut writer, &SessionFile { identity, packets })?;
        writer.flush()?;
        Ok(RecordHandle(path.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Electrode;

    #[derive(Debug, thiserror::Error)]
    #[error("disk full")]
    struct DiskFull;

    struct MemorySink {
        stored: Vec<(usize, Option<String>)>,
        fail: bool,
    }

    impl SessionSink for MemorySink {
        type Error = DiskFull;

        fn store(&mut self, packets: &[EegPacket], identity: &DeviceIdentity) -> Result<RecordHandle, DiskFull> {
            if self.fail {
                return Err(DiskFull);
            }
            self.stored.push((packets.len(), identity.serial_number.clone()));
            Ok(RecordHandle(format!("record-{}", self.stored.len())))
        }
    }

    fn packet(sequence: u64) -> EegPacket {
        EegPacket {
            sequence,
            timestamp_ms: 0,
            electrodes: vec![Electrode::P3],
            channels: vec![vec![0.0]],
            qualities: None,
            modified_channels: None,
        }
    }

    #[test]
    fn only_records_while_on() {
        let mut recorder = SessionRecorder::new();
        recorder.record(&packet(0));
        recorder.start();
        recorder.record(&packet(1));
        recorder.record(&packet(2));
        recorder.stop();
        recorder.record(&packet(3));
        assert_eq!(recorder.len(), 2);
        assert_eq!(recorder.packets()[0].sequence, 1);
    }

    #[test]
    fn export_clears_on_success_only() {
        let mut recorder = SessionRecorder::new();
        recorder.start();
        recorder.record(&packet(0));
        let identity = DeviceIdentity {
            serial_number: Some("2100123".into()),
            ..Default::default()
        };

        let mut failing = MemorySink { stored: vec![], fail: true };
        assert!(recorder.export(&mut failing, &identity).is_err());
        assert_eq!(recorder.len(), 1);

        let mut sink = MemorySink { stored: vec![], fail: false };
        let handle = recorder.export(&mut sink, &identity).unwrap();
        assert_eq!(handle, RecordHandle("record-1".into()));
        assert_eq!(sink.stored, vec![(1, Some("2100123".into()))]);
        assert!(recorder.is_empty());
    }

    #[test]
    fn json_sink_writes_identity_and_packets() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = SessionRecorder::new();
        recorder.start();
        let mut lost = packet(4);
        lost.channels = vec![vec![f32::NAN, 1.5]];
        recorder.record(&lost);

        let identity = DeviceIdentity {
            serial_number: Some("2100123".into()),
            ..Default::default()
        };
        let mut sink = JsonFileSink::new(dir.path().join("sessions"));
        let handle = recorder.export(&mut sink, &identity).unwrap();

        let text = std::fs::read_to_string(&handle.0).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["identity"]["serial_number"], "2100123");
        assert_eq!(json["packets"][0]["sequence"], 4);
        assert!(json["packets"][0]["channels"][0][0].is_null());
        assert_eq!(json["packets"][0]["channels"][0][1], 1.5);
    }
}
