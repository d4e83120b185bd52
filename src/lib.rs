//! Parley: realtime voice interaction orchestration.
//!
//! This crate coordinates a low-latency conversation loop:
//! Audio capture → VAD → streaming transcription → response generation →
//! speech synthesis → playback
//!
//! # Architecture
//!
//! The pipeline is built from independent stages connected by async
//! channels, all funneling into one merged event stream drained by a
//! single consumer, the [`TurnCoordinator`]:
//! - **Audio capture**: frames from an [`audio::AudioSource`]
//! - **VAD**: speech boundary detection ([`vad::VoiceActivityDetector`])
//! - **Transcription**: bidirectional streaming recognition with
//!   reconnect and replay ([`stt::TranscriptionBridge`])
//! - **Generation**: incremental language-model responses ([`llm`])
//! - **Synthesis**: pipelined text-to-speech ([`tts`])
//! - **Playback**: ordered, interruptible output ([`audio::PlaybackSink`])
//!
//! Barge-in works through a monotonically increasing generation token:
//! every chunk of async work carries the token it was started under, and
//! stale chunks are discarded at both emission and consumption points.

pub mod audio;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod session;
pub mod stt;
pub mod testing;
pub mod tts;
pub mod vad;

pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use pipeline::coordinator::{Collaborators, CoordinatorState, TurnCoordinator};
pub use pipeline::messages::{PipelineEvent, SessionNotice};
pub use session::{SessionContext, Speaker, Turn, TurnStatus};
