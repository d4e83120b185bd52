//! Voice activity detection using energy-based analysis.
//!
//! Uses RMS energy thresholding with a hangover window to emit speech
//! segment boundaries. The trait seam leaves room for a model-based
//! detector without touching the coordinator.

use crate::config::VadConfig;
use crate::pipeline::messages::{AudioFrame, VadEvent};
use tracing::info;

/// Classifies audio frames as speech/non-speech and emits segment
/// boundaries.
pub trait VoiceActivityDetector: Send {
    /// Process one frame, returning at most one event.
    fn process(&mut self, frame: &AudioFrame) -> Option<VadEvent>;

    /// Reset detector state (e.g. after a session restart).
    fn reset(&mut self);
}

/// Energy-based voice activity detector.
pub struct EnergyVad {
    threshold: f32,
    hangover_frames: u32,
    in_speech: bool,
    silence_count: u32,
}

impl EnergyVad {
    /// Create a new detector from configuration.
    pub fn new(config: &VadConfig) -> Self {
        info!(
            "VAD initialized: threshold={}, hangover={} frames",
            config.threshold, config.hangover_frames
        );
        Self {
            threshold: config.threshold,
            hangover_frames: config.hangover_frames,
            in_speech: false,
            silence_count: 0,
        }
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn process(&mut self, frame: &AudioFrame) -> Option<VadEvent> {
        let energy = compute_rms_energy(&frame.samples());
        let is_speech = energy > self.threshold;

        if is_speech {
            self.silence_count = 0;
            if !self.in_speech {
                self.in_speech = true;
                return Some(VadEvent::SpeechStart {
                    at: frame.captured_at,
                });
            }
        } else if self.in_speech {
            self.silence_count += 1;
            if self.silence_count >= self.hangover_frames {
                self.in_speech = false;
                self.silence_count = 0;
                return Some(VadEvent::SpeechEnd {
                    at: frame.captured_at,
                });
            }
        }

        Some(VadEvent::Frame { is_speech })
    }

    fn reset(&mut self) {
        self.in_speech = false;
        self.silence_count = 0;
    }
}

/// Compute RMS energy of audio samples.
fn compute_rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::time::Instant;

    fn frame(amplitude: i16) -> AudioFrame {
        let payload = std::iter::repeat(amplitude.to_le_bytes())
            .take(160)
            .flatten()
            .collect();
        AudioFrame {
            captured_at: Instant::now(),
            sample_rate: 16_000,
            channels: 1,
            payload,
        }
    }

    fn loud() -> AudioFrame {
        frame(8_000)
    }

    fn quiet() -> AudioFrame {
        frame(10)
    }

    fn vad(hangover_frames: u32) -> EnergyVad {
        EnergyVad::new(&VadConfig {
            threshold: 0.01,
            hangover_frames,
        })
    }

    #[test]
    fn speech_start_on_first_loud_frame() {
        let mut vad = vad(2);
        assert!(matches!(
            vad.process(&loud()),
            Some(VadEvent::SpeechStart { .. })
        ));
        // Continued speech is a plain frame classification.
        assert_eq!(vad.process(&loud()), Some(VadEvent::Frame { is_speech: true }));
    }

    #[test]
    fn speech_end_after_hangover() {
        let mut vad = vad(2);
        vad.process(&loud());
        assert_eq!(
            vad.process(&quiet()),
            Some(VadEvent::Frame { is_speech: false })
        );
        assert!(matches!(
            vad.process(&quiet()),
            Some(VadEvent::SpeechEnd { .. })
        ));
    }

    #[test]
    fn brief_dip_does_not_end_segment() {
        let mut vad = vad(3);
        vad.process(&loud());
        vad.process(&quiet());
        vad.process(&loud());
        vad.process(&quiet());
        vad.process(&quiet());
        // Third consecutive quiet frame closes the segment.
        assert!(matches!(
            vad.process(&quiet()),
            Some(VadEvent::SpeechEnd { .. })
        ));
    }

    #[test]
    fn silence_never_starts_a_segment() {
        let mut vad = vad(2);
        for _ in 0..10 {
            assert_eq!(
                vad.process(&quiet()),
                Some(VadEvent::Frame { is_speech: false })
            );
        }
    }

    #[test]
    fn reset_clears_segment_state() {
        let mut vad = vad(5);
        vad.process(&loud());
        vad.reset();
        assert!(matches!(
            vad.process(&loud()),
            Some(VadEvent::SpeechStart { .. })
        ));
    }

    #[test]
    fn rms_of_empty_is_zero() {
        assert_eq!(compute_rms_energy(&[]), 0.0);
    }
}
