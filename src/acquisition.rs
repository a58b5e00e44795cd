//! EEG acquisition: from telemetry notifications to decoded packets.
//!
//! ```text
//! notification ─► SequenceTracker ─► AcquisitionBuffer ─► decode ─► QualityGateway ─► EegPacket
//!                  (gap → lost frames)  (fixed-size blocks)
//! ```
//!
//! Every telemetry notification is `[index_hi, index_lo, payload…]`. Missing
//! indices are replaced by frames of `0xFF` bytes flagged as lost, so that
//! packet timing stays consistent; lost samples decode to `NaN`.

use log::{debug, info, warn};

use crate::error::DecodeError;
use crate::parse::{decode_eeg_block, now_ms, split_telemetry};
use crate::protocol::HardwareProfile;
use crate::quality::QualityGateway;
use crate::types::EegPacket;

/// Filler byte of a synthesised frame.
const LOST_BYTE: u8 = 0xFF;

// ── Sequence tracking ────────────────────────────────────────────────────────

/// How many frames to synthesise for a gap between two indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LostFramePolicy {
    /// `gap` frames.
    #[default]
    Gap,
    /// `gap - 1` frames: one per index actually missing.
    MissedOnly,
}

/// Tracks the 16-bit device packet index and counts lost frames.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    previous: Option<u16>,
    policy: LostFramePolicy,
}

impl SequenceTracker {
    pub fn new(policy: LostFramePolicy) -> Self {
        Self {
            previous: None,
            policy,
        }
    }

    pub fn previous(&self) -> Option<u16> {
        self.previous
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }

    /// Record `index` and return the number of frames to synthesise before it.
    pub fn observe(&mut self, index: u16) -> usize {
        let previous = self.previous.unwrap_or(index.wrapping_sub(1));
        self.previous = Some(index);

        let gap = index.wrapping_sub(previous);
        if gap == 1 {
            return 0;
        }
        // 0: duplicate; ≥ 0x8000: the counter went backwards.
        if gap == 0 || gap >= 0x8000 {
            debug!("Packet index {previous} → {index}, nothing to synthesise");
            return 0;
        }
        match self.policy {
            LostFramePolicy::Gap => gap as usize,
            LostFramePolicy::MissedOnly => gap as usize - 1,
        }
    }
}

// ── Acquisition buffer ───────────────────────────────────────────────────────

/// A complete raw packet and the lost flag of each of its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEegBlock {
    pub bytes: Vec<u8>,
    pub lost: Vec<bool>,
}

impl RawEegBlock {
    pub fn lost_bytes(&self) -> usize {
        self.lost.iter().filter(|&&l| l).count()
    }
}

/// Accumulates telemetry payloads into fixed-size packets.
#[derive(Debug, Clone)]
pub struct AcquisitionBuffer {
    capacity: usize,
    pending: Vec<u8>,
    lost: Vec<bool>,
    tracker: SequenceTracker,
}

impl AcquisitionBuffer {
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, LostFramePolicy::default())
    }

    pub fn with_policy(capacity: usize, policy: LostFramePolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            pending: Vec::with_capacity(capacity * 2),
            lost: Vec::with_capacity(capacity * 2),
            tracker: SequenceTracker::new(policy),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.lost.clear();
        self.tracker.reset();
    }

    /// Add one telemetry notification. Returns the number of lost frames
    /// synthesised ahead of it.
    pub fn add(&mut self, notification: &[u8]) -> Result<usize, DecodeError> {
        let (index, payload) = split_telemetry(notification)?;
        let missing = self.tracker.observe(index);
        if missing > 0 {
            info!("Lost {missing} telemetry frame(s) before index {index}");
            let filler = missing * payload.len();
            self.pending.resize(self.pending.len() + filler, LOST_BYTE);
            self.lost.resize(self.lost.len() + filler, true);
        }
        self.pending.extend_from_slice(payload);
        self.lost.resize(self.pending.len(), false);
        Ok(missing)
    }

    /// Take one packet of exactly `capacity` bytes, keeping the remainder.
    pub fn take_completed_packet(&mut self) -> Option<RawEegBlock> {
        if self.pending.len() < self.capacity {
            return None;
        }
        let bytes: Vec<u8> = self.pending.drain(..self.capacity).collect();
        let lost: Vec<bool> = self.lost.drain(..self.capacity).collect();
        Some(RawEegBlock { bytes, lost })
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// Telemetry → [`EegPacket`] pipeline for one hardware profile.
pub struct EegAcquisition {
    profile: HardwareProfile,
    buffer: AcquisitionBuffer,
    quality: QualityGateway,
    sequence: u64,
    streaming: bool,
}

impl EegAcquisition {
    pub fn new(profile: HardwareProfile) -> Self {
        Self::with_policy(profile, LostFramePolicy::default())
    }

    pub fn with_policy(profile: HardwareProfile, policy: LostFramePolicy) -> Self {
        Self {
            profile,
            buffer: AcquisitionBuffer::with_policy(profile.packet_bytes(), policy),
            quality: QualityGateway::new(),
            sequence: 0,
            streaming: false,
        }
    }

    pub fn profile(&self) -> HardwareProfile {
        self.profile
    }

    pub fn quality_mut(&mut self) -> &mut QualityGateway {
        &mut self.quality
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Switch profile (channel geometry), discarding buffered bytes.
    pub fn configure(&mut self, profile: HardwareProfile) {
        if profile != self.profile || self.buffer.capacity() != profile.packet_bytes() {
            debug!("Acquisition configured for {profile:?}");
        }
        let policy = self.buffer.tracker.policy;
        self.profile = profile;
        self.buffer = AcquisitionBuffer::with_policy(profile.packet_bytes(), policy);
    }

    pub fn start(&mut self, use_quality_checker: bool) {
        self.buffer.reset();
        self.sequence = 0;
        self.quality.set_enabled(use_quality_checker);
        self.streaming = true;
    }

    pub fn stop(&mut self) {
        self.streaming = false;
        self.quality.set_enabled(false);
        self.buffer.reset();
    }

    /// Feed one notification; returns the packets it completed (usually
    /// zero or one, more after a long gap).
    pub fn on_telemetry(&mut self, notification: &[u8]) -> Vec<EegPacket> {
        if !self.streaming {
            return Vec::new();
        }
        if let Err(e) = self.buffer.add(notification) {
            warn!("Dropping telemetry frame: {e}");
            return Vec::new();
        }

        let mut packets = Vec::new();
        while let Some(block) = self.buffer.take_completed_packet() {
            let packet = self.decode(&block);
            packets.push(self.quality.attach(packet));
        }
        packets
    }

    fn decode(&mut self, block: &RawEegBlock) -> EegPacket {
        let channels = decode_eeg_block(&block.bytes, &block.lost, self.profile.channel_count());
        let packet = EegPacket {
            sequence: self.sequence,
            timestamp_ms: now_ms(),
            electrodes: self.profile.electrodes().to_vec(),
            channels,
            qualities: None,
            modified_channels: None,
        };
        self.sequence += 1;
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed every notification, taking at most one packet per add, then
    /// drain whatever is left.
    fn usable_packets(notifications: &[Vec<u8>], buffer: &mut AcquisitionBuffer) -> Vec<Option<Vec<u8>>> {
        let mut out = Vec::new();
        for n in notifications {
            buffer.add(n).unwrap();
            out.push(buffer.take_completed_packet().map(|b| b.bytes));
        }
        while let Some(block) = buffer.take_completed_packet() {
            out.push(Some(block.bytes));
        }
        out
    }

    fn sample_set() -> Vec<Vec<u8>> {
        vec![
            vec![0, 0, 1, 1, 1],
            vec![0, 1, 2, 2, 2],
            vec![0, 2, 3, 3, 3],
            vec![0, 3, 4, 4, 4],
            vec![0, 4, 5, 5, 5],
        ]
    }

    fn lost_set() -> Vec<Vec<u8>> {
        vec![
            vec![0, 0, 1, 1, 1],
            vec![0, 1, 2, 2, 2],
            vec![0, 2, 3, 3, 3],
            vec![0, 3, 4, 4, 4],
            vec![0, 5, 6, 6, 6],
        ]
    }

    fn oracle(capacity: usize) -> AcquisitionBuffer {
        AcquisitionBuffer::with_policy(capacity, LostFramePolicy::MissedOnly)
    }

    #[test]
    fn sample_set_by_3() {
        let out = usable_packets(&sample_set(), &mut oracle(3));
        assert_eq!(
            out,
            vec![
                Some(vec![1, 1, 1]),
                Some(vec![2, 2, 2]),
                Some(vec![3, 3, 3]),
                Some(vec![4, 4, 4]),
                Some(vec![5, 5, 5]),
            ]
        );
    }

    #[test]
    fn sample_set_by_4() {
        let out = usable_packets(&sample_set(), &mut oracle(4));
        assert_eq!(
            out,
            vec![
                None,
                Some(vec![1, 1, 1, 2]),
                Some(vec![2, 2, 3, 3]),
                Some(vec![3, 4, 4, 4]),
                None,
            ]
        );
    }

    #[test]
    fn sample_set_by_6() {
        let out = usable_packets(&sample_set(), &mut oracle(6));
        assert_eq!(
            out,
            vec![
                None,
                Some(vec![1, 1, 1, 2, 2, 2]),
                None,
                Some(vec![3, 3, 3, 4, 4, 4]),
                None,
            ]
        );
    }

    #[test]
    fn lost_set_by_3() {
        let out = usable_packets(&lost_set(), &mut oracle(3));
        assert_eq!(
            out,
            vec![
                Some(vec![1, 1, 1]),
                Some(vec![2, 2, 2]),
                Some(vec![3, 3, 3]),
                Some(vec![4, 4, 4]),
                Some(vec![0xFF, 0xFF, 0xFF]),
                Some(vec![6, 6, 6]),
            ]
        );
    }

    #[test]
    fn lost_set_by_4() {
        let out = usable_packets(&lost_set(), &mut oracle(4));
        assert_eq!(
            out,
            vec![
                None,
                Some(vec![1, 1, 1, 2]),
                Some(vec![2, 2, 3, 3]),
                Some(vec![3, 4, 4, 4]),
                Some(vec![0xFF, 0xFF, 0xFF, 6]),
            ]
        );
    }

    #[test]
    fn lost_set_by_6() {
        let out = usable_packets(&lost_set(), &mut oracle(6));
        assert_eq!(
            out,
            vec![
                None,
                Some(vec![1, 1, 1, 2, 2, 2]),
                None,
                Some(vec![3, 3, 3, 4, 4, 4]),
                Some(vec![0xFF, 0xFF, 0xFF, 6, 6, 6]),
            ]
        );
    }

    #[test]
    fn realistic_set_by_40() {
        let saturated: Vec<u8> = [127u8, 255].repeat(20);
        let low: Vec<u8> = [128u8, 0].repeat(20);

        let mut first = vec![0, 0, 3, 234, 3, 234, 110, 19, 110, 19];
        first.extend([127u8, 255].repeat(16));
        let mut third = vec![0, 2];
        third.extend([127u8, 255].repeat(6));
        third.extend([98, 62, 98, 62, 6, 108, 6, 108, 201, 215, 201, 215, 175, 5, 175, 5, 140, 8, 140, 8]);
        third.extend([128u8, 0].repeat(4));

        let notifications = vec![
            first.clone(),
            [vec![0, 1], saturated.clone()].concat(),
            third.clone(),
            [vec![0, 3], low.clone()].concat(),
        ];
        assert!(notifications.iter().all(|n| n.len() == 42));

        let out = usable_packets(&notifications, &mut oracle(40));
        assert_eq!(
            out,
            vec![
                Some(first[2..].to_vec()),
                Some(saturated),
                Some(third[2..].to_vec()),
                Some(low),
            ]
        );
    }

    #[test]
    fn realistic_set_with_wide_gap() {
        let a: Vec<u8> = vec![
            6, 30, 0, 2, 4, 194, 0, 2, 4, 214, 0, 2, 4, 219, 0, 2, 4, 252, 0, 2, 5, 52, 0, 2, 5, 84, 0, 2,
            5, 74, 0, 2, 5, 33, 0, 2, 5, 7, 0, 2, 4, 249,
        ];
        let b: Vec<u8> = vec![
            6, 31, 0, 2, 4, 194, 0, 2, 4, 81, 0, 2, 3, 201, 0, 2, 3, 104, 0, 2, 3, 58, 0, 2, 3, 8, 0, 2, 2,
            181, 0, 2, 2, 75, 0, 2, 1, 244, 0, 2, 1, 179,
        ];
        let c: Vec<u8> = vec![
            6, 39, 255, 255, 255, 19, 255, 255, 254, 226, 255, 255, 254, 145, 255, 255, 254, 86, 255, 255,
            254, 69, 255, 255, 254, 52, 255, 255, 254, 12, 255, 255, 253, 214, 255, 255, 253, 188, 255,
            255, 253, 200,
        ];
        let out = usable_packets(&[a.clone(), b.clone(), c.clone()], &mut oracle(40));

        let mut expected = vec![Some(a[2..].to_vec()), Some(b[2..].to_vec())];
        expected.extend(std::iter::repeat(Some(vec![0xFF; 40])).take(7));
        expected.push(Some(c[2..].to_vec()));
        assert_eq!(out, expected);
    }

    #[test]
    fn gap_policy_counts() {
        let mut legacy = SequenceTracker::new(LostFramePolicy::Gap);
        assert_eq!(legacy.observe(0), 0);
        assert_eq!(legacy.observe(2), 2);

        let mut missed = SequenceTracker::new(LostFramePolicy::MissedOnly);
        assert_eq!(missed.observe(0), 0);
        assert_eq!(missed.observe(2), 1);

        let mut steady = SequenceTracker::default();
        assert_eq!([0, 1, 2].map(|i| steady.observe(i)), [0, 0, 0]);
    }

    #[test]
    fn index_wraps_and_backward_jumps_are_ignored() {
        let mut tracker = SequenceTracker::default();
        tracker.observe(u16::MAX);
        assert_eq!(tracker.observe(0), 0);
        assert_eq!(tracker.observe(500), 500);
        assert_eq!(tracker.observe(3), 0);
        assert_eq!(tracker.observe(3), 0);
        assert_eq!(tracker.previous(), Some(3));
    }

    #[test]
    fn lost_frames_are_flagged() {
        let mut buffer = AcquisitionBuffer::new(8);
        buffer.add(&[0, 0, 1, 2]).unwrap();
        assert_eq!(buffer.add(&[0, 2, 3, 4]).unwrap(), 2);
        let block = buffer.take_completed_packet().unwrap();
        assert_eq!(block.bytes, vec![1, 2, 0xFF, 0xFF, 0xFF, 0xFF, 3, 4]);
        assert_eq!(block.lost_bytes(), 4);
        assert!(!block.lost[0] && block.lost[2] && !block.lost[6]);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn truncated_notification_is_rejected() {
        let mut buffer = AcquisitionBuffer::new(4);
        assert!(buffer.add(&[7]).is_err());
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn pipeline_emits_packets_with_nan_for_lost_samples() {
        let mut acq = EegAcquisition::new(HardwareProfile::Indus2);
        assert!(acq.on_telemetry(&[0, 0, 0, 1]).is_empty());

        acq.start(false);
        // 1000-byte packet: 25 notifications of 40 bytes, index 3 missing
        // and synthesised as two frames.
        let payload = vec![0x00, 0x10].repeat(20);
        let mut packets = Vec::new();
        for index in [0u16, 1, 2, 4] {
            let mut n = index.to_be_bytes().to_vec();
            n.extend(&payload);
            packets.extend(acq.on_telemetry(&n));
        }
        assert!(packets.is_empty());
        for index in 5u16..24 {
            let mut n = index.to_be_bytes().to_vec();
            n.extend(&payload);
            packets.extend(acq.on_telemetry(&n));
        }
        assert_eq!(packets.len(), 1);
        let packet = &packets[0];
        assert_eq!(packet.channels.len(), 2);
        assert_eq!(packet.channels[0].len(), 250);
        // Two lost frames of 20 samples each.
        assert_eq!(packet.nan_count(), 40);
        assert_eq!(packet.sequence, 0);
        assert!(packet.qualities.is_none());
    }

    #[test]
    fn reconfigure_changes_geometry() {
        let mut acq = EegAcquisition::new(HardwareProfile::Indus2);
        acq.configure(HardwareProfile::Indus5);
        acq.start(false);
        let mut n = vec![0, 0];
        n.extend(vec![0u8; 2000]);
        let packets = acq.on_telemetry(&n);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].channels.len(), 4);
        assert_eq!(packets[0].electrodes.len(), 4);
    }
}
