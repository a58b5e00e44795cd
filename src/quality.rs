//! Hook-up of the external signal-quality scorer.
//!
//! The scoring algorithm lives outside this crate. [`QualityGateway`] only
//! reshapes packets for it and copies its results back onto the packet.

use log::{debug, warn};

use crate::protocol::{PACKET_LENGTH, SAMPLE_RATE};
use crate::types::EegPacket;

/// External per-channel quality scorer.
pub trait QualityScorer: Send {
    /// Score one packet. `samples` is channel-major: all samples of channel
    /// 0, then channel 1, … Returns one score per channel.
    fn compute_quality(
        &mut self,
        samples: &[f32],
        channel_count: usize,
        sample_rate: usize,
        packet_length: usize,
    ) -> Vec<f32>;

    /// Corrected samples for the packet last passed to
    /// [`QualityScorer::compute_quality`], one `Vec` per channel.
    fn corrected_values(&mut self) -> Vec<Vec<f32>>;
}

#[derive(Default)]
pub struct QualityGateway {
    scorer: Option<Box<dyn QualityScorer>>,
    enabled: bool,
}

impl QualityGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scorer(scorer: Box<dyn QualityScorer>) -> Self {
        Self {
            scorer: Some(scorer),
            enabled: false,
        }
    }

    pub fn set_scorer(&mut self, scorer: Box<dyn QualityScorer>) {
        self.scorer = Some(scorer);
    }

    pub fn has_scorer(&self) -> bool {
        self.scorer.is_some()
    }

    /// Turn scoring on or off for the session. Returns whether scoring is
    /// actually active: enabling without a scorer leaves packets untouched.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        if enabled && self.scorer.is_none() {
            warn!("Quality checking requested but no scorer is installed");
        }
        self.enabled = enabled && self.scorer.is_some();
        self.enabled
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Annotate `packet` with qualities and corrected samples. Pass-through
    /// when disabled.
    pub fn attach(&mut self, mut packet: EegPacket) -> EegPacket {
        if !self.enabled {
            return packet;
        }
        let Some(scorer) = self.scorer.as_mut() else {
            return packet;
        };

        let channel_count = packet.channels.len();
        let nan_count = packet.nan_count();
        if nan_count > 0 {
            debug!("Packet {} carries {nan_count} lost samples", packet.sequence);
        }

        let qualities = scorer.compute_quality(
            &packet.flattened(),
            channel_count,
            SAMPLE_RATE,
            PACKET_LENGTH,
        );
        if qualities.len() < channel_count {
            warn!(
                "Scorer returned {} qualities for {channel_count} channels",
                qualities.len()
            );
        }

        let corrected = scorer
            .corrected_values()
            .into_iter()
            .map(|mut channel| {
                channel.truncate(SAMPLE_RATE.min(channel.len()));
                channel
            })
            .collect();

        packet.qualities = Some(qualities);
        packet.modified_channels = Some(corrected);
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Electrode;

    /// Scores each channel with its mean and returns the channels doubled.
    struct MeanScorer {
        last: Vec<Vec<f32>>,
    }

    impl QualityScorer for MeanScorer {
        fn compute_quality(
            &mut self,
            samples: &[f32],
            channel_count: usize,
            _sample_rate: usize,
            _packet_length: usize,
        ) -> Vec<f32> {
            let per = samples.len() / channel_count;
            self.last = samples
                .chunks(per)
                .map(|c| c.iter().map(|v| v * 2.0).collect())
                .collect();
            samples
                .chunks(per)
                .map(|c| c.iter().sum::<f32>() / c.len() as f32)
                .collect()
        }

        fn corrected_values(&mut self) -> Vec<Vec<f32>> {
            std::mem::take(&mut self.last)
        }
    }

    fn packet() -> EegPacket {
        EegPacket {
            sequence: 7,
            timestamp_ms: 0,
            electrodes: vec![Electrode::P3, Electrode::P4],
            channels: vec![vec![1.0, 3.0], vec![2.0, 4.0]],
            qualities: None,
            modified_channels: None,
        }
    }

    #[test]
    fn disabled_passes_through() {
        let mut gateway = QualityGateway::with_scorer(Box::new(MeanScorer { last: vec![] }));
        let out = gateway.attach(packet());
        assert_eq!(out, packet());
    }

    #[test]
    fn enabling_without_scorer_stays_off() {
        let mut gateway = QualityGateway::new();
        assert!(!gateway.set_enabled(true));
        assert_eq!(gateway.attach(packet()), packet());
    }

    #[test]
    fn enabled_writes_back_results() {
        let mut gateway = QualityGateway::with_scorer(Box::new(MeanScorer { last: vec![] }));
        assert!(gateway.set_enabled(true));
        let out = gateway.attach(packet());
        assert_eq!(out.qualities, Some(vec![2.0, 3.0]));
        assert_eq!(
            out.modified_channels,
            Some(vec![vec![2.0, 6.0], vec![4.0, 8.0]])
        );
        assert_eq!(out.channels, packet().channels);
    }
}
