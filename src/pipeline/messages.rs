//! Message types passed between pipeline stages.

use crate::session::Turn;
use std::time::Instant;

/// A fixed-duration chunk of PCM audio from the live call.
///
/// Payload is 16-bit little-endian PCM. Frames are forwarded to the
/// transcription bridge and discarded; nothing retains them.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Timestamp when this frame was captured.
    pub captured_at: Instant,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of channels (1 = mono).
    pub channels: u16,
    /// Raw sample bytes (16-bit little-endian PCM).
    pub payload: Vec<u8>,
}

impl AudioFrame {
    /// Decode the payload into f32 samples in \[-1, 1\].
    pub fn samples(&self) -> Vec<f32> {
        self.payload
            .chunks_exact(2)
            .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / f32::from(i16::MAX))
            .collect()
    }
}

/// A voice-activity classification produced per frame. Ephemeral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// Speech activity began.
    SpeechStart {
        /// Capture timestamp of the triggering frame.
        at: Instant,
    },
    /// Speech activity ended (hangover elapsed).
    SpeechEnd {
        /// Capture timestamp of the frame that closed the segment.
        at: Instant,
    },
    /// Per-frame classification with no boundary change.
    Frame {
        /// Whether the frame was classified as speech.
        is_speech: bool,
    },
}

/// A transcription result from the recognizer.
///
/// Sequence numbers are strictly non-decreasing per session; a final
/// event supersedes all partials sharing its sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    /// The transcribed text.
    pub text: String,
    /// Whether this result is settled (vs. a revisable partial).
    pub is_final: bool,
    /// Recognizer confidence in \[0, 1\].
    pub confidence: f32,
    /// BCP-47 language tag, when the recognizer reports one.
    pub language: Option<String>,
    /// Session-monotonic sequence number.
    pub sequence: u64,
}

/// One {role, text} entry of a generation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Who produced the text.
    pub role: ChatRole,
    /// The utterance text.
    pub text: String,
}

/// Speaker role as seen by the language model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    /// The human caller.
    User,
    /// The voice agent.
    Assistant,
}

/// Everything the language model needs for one response attempt.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// System instruction, passed verbatim from configuration.
    pub system_instruction: String,
    /// Ordered committed conversation history.
    pub messages: Vec<ChatMessage>,
}

/// An incremental text delta from the language model.
///
/// Consumers must discard any chunk whose generation does not match the
/// session's current generation token.
#[derive(Debug, Clone)]
pub struct ResponseChunk {
    /// Generation token this chunk belongs to.
    pub generation: u64,
    /// Incremental response text (empty on the final marker).
    pub delta: String,
    /// Whether this is the last chunk of the response.
    pub is_final: bool,
}

/// Declared sample format of synthesized audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of channels (1 = mono).
    pub channels: u16,
}

/// Synthesized audio ready for playback. Same stale-token discard rule
/// as [`ResponseChunk`].
#[derive(Debug, Clone)]
pub struct AudioOutputChunk {
    /// Generation token this chunk belongs to.
    pub generation: u64,
    /// Raw sample bytes in the stream's declared format.
    pub payload: Vec<u8>,
    /// Whether this is the last chunk of the response.
    pub is_final: bool,
}

/// Merged event stream drained by the turn coordinator.
///
/// Every producer task feeds this fan-in channel so all state
/// transitions happen on a single consumer, race-free without locks.
#[derive(Debug)]
pub enum PipelineEvent {
    /// Voice-activity boundary or frame classification.
    Vad(VadEvent),
    /// Partial or final transcript from the transcription bridge.
    Transcript(TranscriptEvent),
    /// Text delta from the response generator.
    Response(ResponseChunk),
    /// Synthesis stream opened; carries the declared sample format.
    SynthesisReady {
        /// Generation token the stream belongs to.
        generation: u64,
        /// Declared output format.
        format: AudioFormat,
    },
    /// The playback path accepted the first chunk of a generation.
    PlaybackStarted {
        /// Generation token that started playing.
        generation: u64,
    },
    /// The playback path consumed the final chunk of a generation.
    PlaybackFinished {
        /// Generation token that finished playing.
        generation: u64,
    },
    /// Response generation failed (already translated at the bridge).
    GenerationFailed {
        /// Generation token of the failed attempt.
        generation: u64,
        /// Human-readable cause.
        reason: String,
    },
    /// Speech synthesis failed (already translated at the bridge).
    SynthesisFailed {
        /// Generation token of the failed attempt.
        generation: u64,
        /// Human-readable cause.
        reason: String,
    },
    /// The transcription bridge exhausted its reconnection budget.
    TranscriptionLost,
    /// The jitter or replay buffer dropped frames.
    BufferOverrun {
        /// Number of frames dropped since the last report.
        dropped: u64,
    },
    /// The audio source ran out of frames (call ended).
    AudioEnded,
}

/// Session-level notifications broadcast to the external caller.
///
/// Sent best-effort; a slow or absent subscriber never blocks the
/// audio path.
#[derive(Debug, Clone)]
pub enum SessionNotice {
    /// A turn was appended to history.
    TurnCommitted(Turn),
    /// An in-flight turn was cancelled (barge-in or abandonment); it was
    /// not appended to history.
    TurnCancelled(Turn),
    /// Generation or synthesis failed; the session stays open and keeps
    /// listening.
    AgentResponseFailed {
        /// Human-readable cause.
        reason: String,
    },
    /// The recognizer is gone for good; the current user turn was
    /// abandoned.
    TranscriptionUnavailable,
    /// Audio frames were dropped to preserve liveness.
    BufferOverrun {
        /// Number of frames dropped since the last report.
        dropped: u64,
    },
}
