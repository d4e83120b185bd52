//! Speech synthesis bridge.
//!
//! Converts the generator's text deltas into audio chunks via an
//! external synthesis service, pipelined so audio for a prefix of the
//! response starts before the full text is known. Output chunks carry
//! the generation token; cancellation stops both the upstream text
//! consumption and the in-flight synthesis request.

use crate::error::{Result, SessionError};
use crate::pipeline::messages::{AudioFormat, AudioOutputChunk, PipelineEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A live synthesis stream with its declared output format.
pub struct SynthesisStream {
    /// Sample format of every audio payload on this stream.
    pub format: AudioFormat,
    /// Synthesized audio payloads, in synthesis order. Channel closure
    /// marks clean completion; an `Err` item marks stream failure.
    pub audio: mpsc::Receiver<Result<Vec<u8>>>,
}

/// External speech synthesizer reached over a cancellable stream pair.
#[async_trait::async_trait]
pub trait SpeechSynthesisService: Send + Sync {
    /// Start an incremental synthesis session.
    ///
    /// The service consumes text deltas from `text` (channel closure
    /// marks end of input) and produces audio on the returned stream.
    /// When `cancel` fires, the service must close its underlying
    /// request, not merely stop reading.
    ///
    /// # Errors
    ///
    /// Returns an error when the session cannot be started.
    async fn synthesize(
        &self,
        text: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) -> Result<SynthesisStream>;
}

/// Drive one synthesis attempt.
///
/// Token-tagged audio chunks go straight into `audio_tx` (the playback
/// path), never through the coordinator's fan-in channel, so a full
/// playback buffer backpressures synthesis instead of the event loop.
/// Control events (stream-open, failures) go to `events_tx`. Failures
/// surface as [`PipelineEvent::SynthesisFailed`]; the coordinator
/// translates them for the caller.
pub async fn run_synthesis(
    service: Arc<dyn SpeechSynthesisService>,
    text_rx: mpsc::Receiver<String>,
    generation: u64,
    deadline: Duration,
    cancel: CancellationToken,
    events_tx: mpsc::Sender<PipelineEvent>,
    audio_tx: mpsc::Sender<AudioOutputChunk>,
) {
    let opened = tokio::time::timeout(deadline, service.synthesize(text_rx, cancel.clone()))
        .await
        .map_err(|_| SessionError::DeadlineExceeded("synthesis stream open".into()))
        .and_then(|r| r);

    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            let _ = events_tx
                .send(PipelineEvent::SynthesisFailed {
                    generation,
                    reason: e.to_string(),
                })
                .await;
            return;
        }
    };

    info!(
        "synthesis stream open (token {generation}, {} Hz)",
        stream.format.sample_rate
    );
    let _ = events_tx
        .send(PipelineEvent::SynthesisReady {
            generation,
            format: stream.format,
        })
        .await;

    loop {
        tokio::select! {
            // Cancellation wins over an already-buffered payload, so no
            // chunk is ever emitted after the token fires.
            biased;
            () = cancel.cancelled() => {
                debug!("synthesis {generation} cancelled");
                return;
            }
            audio = stream.audio.recv() => match audio {
                Some(Ok(payload)) => {
                    let chunk = AudioOutputChunk {
                        generation,
                        payload,
                        is_final: false,
                    };
                    if !forward_chunk(&audio_tx, chunk, &cancel).await {
                        return;
                    }
                }
                Some(Err(e)) => {
                    let _ = events_tx
                        .send(PipelineEvent::SynthesisFailed {
                            generation,
                            reason: e.to_string(),
                        })
                        .await;
                    return;
                }
                None => {
                    let chunk = AudioOutputChunk {
                        generation,
                        payload: Vec::new(),
                        is_final: true,
                    };
                    let _ = forward_chunk(&audio_tx, chunk, &cancel).await;
                    debug!("synthesis {generation} complete");
                    return;
                }
            }
        }
    }
}

/// Send one chunk to the playback path, staying cancellable while the
/// bounded channel is full. Returns `false` when the stream should stop.
async fn forward_chunk(
    audio_tx: &mpsc::Sender<AudioOutputChunk>,
    chunk: AudioOutputChunk,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = audio_tx.send(chunk) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::testing::FakeSynthesizer;

    #[tokio::test(start_paused = true)]
    async fn pipelined_text_becomes_tagged_audio() {
        let service = FakeSynthesizer::new();
        let (text_tx, text_rx) = mpsc::channel(16);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (audio_tx, mut audio_rx) = mpsc::channel(16);
        let handle = tokio::spawn(run_synthesis(
            service.clone(),
            text_rx,
            4,
            Duration::from_secs(1),
            CancellationToken::new(),
            events_tx,
            audio_tx,
        ));

        text_tx.send("Hello ".to_owned()).await.unwrap();

        match events_rx.recv().await.unwrap() {
            PipelineEvent::SynthesisReady { generation, format } => {
                assert_eq!(generation, 4);
                assert_eq!(format.sample_rate, 24_000);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // First audio arrives before the text stream is complete.
        let chunk = audio_rx.recv().await.unwrap();
        assert_eq!(chunk.generation, 4);
        assert_eq!(chunk.payload, b"Hello ".to_vec());
        assert!(!chunk.is_final);

        text_tx.send("world.".to_owned()).await.unwrap();
        drop(text_tx);

        assert_eq!(audio_rx.recv().await.unwrap().payload, b"world.".to_vec());
        assert!(audio_rx.recv().await.unwrap().is_final);
        handle.await.unwrap();
        assert_eq!(service.received_text(), vec!["Hello ", "world."]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_audio_without_final_marker() {
        let service = FakeSynthesizer::new();
        let cancel = CancellationToken::new();
        let (text_tx, text_rx) = mpsc::channel(16);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (audio_tx, mut audio_rx) = mpsc::channel(16);
        let handle = tokio::spawn(run_synthesis(
            service,
            text_rx,
            5,
            Duration::from_secs(1),
            cancel.clone(),
            events_tx,
            audio_tx,
        ));

        // Skip the ready event.
        match events_rx.recv().await.unwrap() {
            PipelineEvent::SynthesisReady { .. } => {}
            other => panic!("unexpected event {other:?}"),
        }

        text_tx.send("cut ".to_owned()).await.unwrap();
        assert!(!audio_rx.recv().await.unwrap().is_final);

        cancel.cancel();
        handle.await.unwrap();
        // No further chunks, no final marker.
        assert!(audio_rx.recv().await.is_none());
        assert!(events_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn synthesis_error_surfaces_as_failure_event() {
        let service = FakeSynthesizer::failing_after(1);
        let (text_tx, text_rx) = mpsc::channel(16);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (audio_tx, mut audio_rx) = mpsc::channel(16);
        let handle = tokio::spawn(run_synthesis(
            service,
            text_rx,
            6,
            Duration::from_secs(1),
            CancellationToken::new(),
            events_tx,
            audio_tx,
        ));

        text_tx.send("ok".to_owned()).await.unwrap();
        text_tx.send("boom".to_owned()).await.unwrap();

        let mut saw_failure = false;
        while let Some(ev) = events_rx.recv().await {
            if let PipelineEvent::SynthesisFailed { generation, .. } = ev {
                assert_eq!(generation, 6);
                saw_failure = true;
            }
        }
        assert!(saw_failure);
        // The error ends the stream without a final marker.
        assert!(audio_rx.recv().await.unwrap().payload == b"ok".to_vec());
        assert!(audio_rx.recv().await.is_none());
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn full_playback_channel_stays_cancellable() {
        // A one-slot audio channel that nobody drains: the forward path
        // must still observe cancellation instead of wedging.
        let service = FakeSynthesizer::new();
        let cancel = CancellationToken::new();
        let (text_tx, text_rx) = mpsc::channel(16);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (audio_tx, audio_rx) = mpsc::channel(1);
        let handle = tokio::spawn(run_synthesis(
            service,
            text_rx,
            7,
            Duration::from_secs(1),
            cancel.clone(),
            events_tx,
            audio_tx,
        ));

        match events_rx.recv().await.unwrap() {
            PipelineEvent::SynthesisReady { .. } => {}
            other => panic!("unexpected event {other:?}"),
        }

        // Fills the single slot, then a second chunk blocks on send.
        text_tx.send("one".to_owned()).await.unwrap();
        text_tx.send("two".to_owned()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        cancel.cancel();
        handle.await.unwrap();
        drop(audio_rx);
    }
}
