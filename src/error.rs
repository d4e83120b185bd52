//! Error types for the voice session.

/// Top-level error type for the voice-interaction orchestrator.
///
/// Bridge-level transport failures are translated into one of these
/// variants at the bridge boundary; the coordinator never surfaces raw
/// transport errors to its caller.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The recognizer connection could not be re-established within the
    /// configured retry budget. The current user turn is abandoned.
    #[error("transcription unavailable: {0}")]
    TranscriptionUnavailable(String),

    /// Response generation or speech synthesis failed. The committed user
    /// turn stays in history and the session keeps listening.
    #[error("agent response failed: {0}")]
    AgentResponseFailed(String),

    /// Invalid or missing configuration. Raised before the event loop
    /// starts; the session never opens.
    #[error("configuration invalid: {0}")]
    ConfigurationInvalid(String),

    /// Audio source or playback sink error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Transcription stream error (bridge internal, pre-translation).
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Language model stream error (bridge internal, pre-translation).
    #[error("generation error: {0}")]
    Generation(String),

    /// Speech synthesis stream error (bridge internal, pre-translation).
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Channel send/receive error between pipeline stages.
    #[error("channel error: {0}")]
    Channel(String),

    /// An external bridge call exceeded its deadline.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SessionError>;
