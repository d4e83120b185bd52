//! Audio I/O seams: frame source and playback sink.
//!
//! Concrete device or transport bindings (cpal, WebRTC tracks, telephony
//! media streams) live outside this crate and implement these traits.

use crate::error::Result;
use crate::pipeline::messages::{AudioFormat, AudioFrame, AudioOutputChunk};
use async_trait::async_trait;

/// Supplies the continuous sequence of PCM frames from the live call.
#[async_trait]
pub trait AudioSource: Send {
    /// Next captured frame, or `None` when the call has ended.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying capture fails.
    async fn next_frame(&mut self) -> Result<Option<AudioFrame>>;

    /// Release the capture resources.
    ///
    /// # Errors
    ///
    /// Returns an error when teardown fails.
    async fn close(&mut self) -> Result<()>;
}

/// Accepts synthesized audio for playback, in production order.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Announce the sample format of the upcoming chunks. Called once per
    /// response generation, before the first [`play`](Self::play).
    ///
    /// # Errors
    ///
    /// Returns an error when the sink cannot handle the format.
    async fn play_format(&self, format: AudioFormat) -> Result<()>;

    /// Play one chunk. Chunks arrive in the order they were produced
    /// within a generation.
    ///
    /// # Errors
    ///
    /// Returns an error when the device or transport fails.
    async fn play(&self, chunk: AudioOutputChunk) -> Result<()>;

    /// Stop playback immediately, discarding anything queued (barge-in).
    ///
    /// # Errors
    ///
    /// Returns an error when the stop cannot be delivered.
    async fn interrupt(&self) -> Result<()>;
}
