//! Configuration types for the voice session.

use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for one voice session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Turn-taking behavior.
    pub turn: TurnConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Streaming transcription bridge settings.
    pub transcription: TranscriptionConfig,
    /// Response generation settings.
    pub generation: GenerationConfig,
}

impl SessionConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| SessionError::ConfigurationInvalid(format!("parse error: {e}")))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<Self> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| SessionError::ConfigurationInvalid(format!("serialize error: {e}")))?;
        std::fs::write(path, text)?;
        Ok(self.clone())
    }

    /// Validate the configuration before the session opens.
    ///
    /// Called once at session start; a failure here means the event loop
    /// is never entered.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ConfigurationInvalid`] naming the first
    /// offending field.
    pub fn validate(&self) -> Result<()> {
        if self.turn.silence_timeout_ms == 0 {
            return Err(SessionError::ConfigurationInvalid(
                "turn.silence_timeout_ms must be > 0".into(),
            ));
        }
        if self.turn.max_history_turns == 0 {
            return Err(SessionError::ConfigurationInvalid(
                "turn.max_history_turns must be > 0".into(),
            ));
        }
        if self.transcription.audio_buffer_depth_frames == 0 {
            return Err(SessionError::ConfigurationInvalid(
                "transcription.audio_buffer_depth_frames must be > 0".into(),
            ));
        }
        if self.transcription.reconnect_max_attempts == 0 {
            return Err(SessionError::ConfigurationInvalid(
                "transcription.reconnect_max_attempts must be > 0".into(),
            ));
        }
        if self.transcription.reconnect_backoff_base_ms == 0 {
            return Err(SessionError::ConfigurationInvalid(
                "transcription.reconnect_backoff_base_ms must be > 0".into(),
            ));
        }
        if self.transcription.reconnect_backoff_cap_ms < self.transcription.reconnect_backoff_base_ms
        {
            return Err(SessionError::ConfigurationInvalid(
                "transcription.reconnect_backoff_cap_ms must be >= backoff base".into(),
            ));
        }
        if self.generation.request_timeout_ms == 0 {
            return Err(SessionError::ConfigurationInvalid(
                "generation.request_timeout_ms must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.vad.threshold) {
            return Err(SessionError::ConfigurationInvalid(
                "vad.threshold must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Turn-taking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Silence duration in ms after which a user turn with at least one
    /// final transcript fragment commits automatically.
    pub silence_timeout_ms: u64,
    /// Maximum number of committed turns sent to the language model per
    /// generation request. Session history itself is unbounded.
    pub max_history_turns: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            silence_timeout_ms: 800,
            max_history_turns: 32,
        }
    }
}

impl TurnConfig {
    /// Silence timeout as a [`Duration`].
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS energy threshold for speech detection, for samples in \[-1, 1\].
    ///
    /// Typical values:
    ///   - 0.005: very sensitive (picks up quiet speech and some noise)
    ///   - 0.01:  normal sensitivity (default)
    ///   - 0.02:  reduced sensitivity (noisy environments)
    pub threshold: f32,
    /// Consecutive non-speech frames required before SpeechEnd is emitted.
    pub hangover_frames: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            hangover_frames: 25,
        }
    }
}

/// Streaming transcription bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    /// Jitter buffer depth in frames. When full, the oldest frame is
    /// dropped and a buffer-overrun warning is signaled.
    pub audio_buffer_depth_frames: usize,
    /// Replay buffer depth in frames while the recognizer connection is
    /// down (default 500 frames ~= 10 s of 20 ms frames).
    pub reconnect_buffer_frames: usize,
    /// Base reconnection backoff in ms.
    pub reconnect_backoff_base_ms: u64,
    /// Reconnection backoff cap in ms.
    pub reconnect_backoff_cap_ms: u64,
    /// Maximum reconnection attempts before the bridge gives up.
    pub reconnect_max_attempts: u32,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            audio_buffer_depth_frames: 50,
            reconnect_buffer_frames: 500,
            reconnect_backoff_base_ms: 500,
            reconnect_backoff_cap_ms: 8_000,
            reconnect_max_attempts: 5,
        }
    }
}

impl TranscriptionConfig {
    /// Backoff delay for the given attempt (1-based), exponential with cap.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .reconnect_backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.reconnect_backoff_cap_ms);
        Duration::from_millis(delay)
    }
}

/// Response generation and synthesis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// System instruction passed verbatim to the language model with every
    /// generation request.
    pub system_instruction: String,
    /// Deadline in ms for opening a generation or synthesis stream.
    pub request_timeout_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            system_instruction: String::new(),
            request_timeout_ms: 10_000,
        }
    }
}

impl GenerationConfig {
    /// Stream-open deadline as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
