//! Streaming transcription bridge.
//!
//! Maintains a persistent bidirectional connection to an external
//! recognizer: audio frames go out as they arrive, partial and final
//! transcript events come back. The bridge owns the liveness policy —
//! a small jitter buffer that drops oldest frames under pressure, and
//! exponential-backoff reconnection with replay of audio buffered while
//! the connection was down. Audio continuity is preferred over
//! completeness for live speech.

use crate::config::TranscriptionConfig;
use crate::error::Result;
use crate::pipeline::messages::{AudioFrame, PipelineEvent, TranscriptEvent};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Factory for recognizer connections.
#[async_trait]
pub trait TranscriptionService: Send + Sync {
    /// Open a fresh bidirectional stream to the recognizer.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection cannot be established.
    async fn connect(&self) -> Result<TranscriptionConnection>;
}

/// One live recognizer connection, split into its two directions.
pub struct TranscriptionConnection {
    /// Outbound audio half.
    pub sink: Box<dyn TranscriptionSink>,
    /// Inbound transcript events. An `Err` item or channel closure means
    /// the connection was lost.
    pub events: mpsc::Receiver<Result<TranscriptEvent>>,
}

/// Outbound half of a recognizer connection.
#[async_trait]
pub trait TranscriptionSink: Send {
    /// Forward one audio frame.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection is broken.
    async fn send_frame(&mut self, frame: &AudioFrame) -> Result<()>;

    /// Close the outbound stream, letting the recognizer finalize any
    /// in-progress result.
    ///
    /// # Errors
    ///
    /// Returns an error when teardown fails.
    async fn close(&mut self) -> Result<()>;
}

/// Bridges the audio frame stream to the recognizer and emits a
/// session-monotonic transcript event sequence.
pub struct TranscriptionBridge {
    config: TranscriptionConfig,
    service: Arc<dyn TranscriptionService>,
    /// Frames waiting to be sent (jitter buffer; replay buffer during
    /// reconnection).
    buffer: VecDeque<AudioFrame>,
    /// Frames dropped since the last overrun report.
    dropped: u64,
    /// Rebase offset applied to incoming sequence numbers.
    seq_base: u64,
    /// Highest sequence number emitted so far.
    last_seq: u64,
    /// Latest partial not yet superseded by a final.
    pending_partial: Option<TranscriptEvent>,
    /// Whether the inbound frame channel has closed.
    audio_done: bool,
}

impl TranscriptionBridge {
    /// Create a bridge over the given recognizer service.
    pub fn new(config: TranscriptionConfig, service: Arc<dyn TranscriptionService>) -> Self {
        Self {
            config,
            service,
            buffer: VecDeque::new(),
            dropped: 0,
            seq_base: 0,
            last_seq: 0,
            pending_partial: None,
            audio_done: false,
        }
    }

    /// Run the bridge until the audio stream ends, the session is
    /// cancelled, or the reconnection budget is exhausted.
    ///
    /// Transcript events, overrun warnings, and the terminal
    /// [`PipelineEvent::TranscriptionLost`] all flow into `events_tx`.
    pub async fn run(
        mut self,
        mut frame_rx: mpsc::Receiver<AudioFrame>,
        events_tx: mpsc::Sender<PipelineEvent>,
        cancel: CancellationToken,
    ) {
        let Some(mut conn) = self.connect_with_retry(&mut frame_rx, &cancel).await else {
            if !cancel.is_cancelled() {
                let _ = events_tx.send(PipelineEvent::TranscriptionLost).await;
            }
            return;
        };
        info!("transcription bridge connected");

        loop {
            let audio_open = !self.audio_done;
            tokio::select! {
                () = cancel.cancelled() => {
                    self.flush_partial(&events_tx).await;
                    let _ = conn.sink.close().await;
                    return;
                }
                maybe = frame_rx.recv(), if audio_open => {
                    match maybe {
                        Some(frame) => {
                            self.buffer_frame(frame, self.config.audio_buffer_depth_frames);
                            if !self.drain_frames(&mut conn).await {
                                match self.connect_with_retry(&mut frame_rx, &cancel).await {
                                    Some(next) => conn = next,
                                    None => {
                                        if !cancel.is_cancelled() {
                                            let _ = events_tx
                                                .send(PipelineEvent::TranscriptionLost)
                                                .await;
                                        }
                                        return;
                                    }
                                }
                            }
                            self.report_overrun(&events_tx).await;
                        }
                        None => {
                            self.audio_done = true;
                            let _ = conn.sink.close().await;
                        }
                    }
                }
                ev = conn.events.recv() => {
                    match ev {
                        Some(Ok(ev)) => self.forward(ev, &events_tx).await,
                        Some(Err(e)) => {
                            warn!("transcription connection lost: {e}");
                            match self.connect_with_retry(&mut frame_rx, &cancel).await {
                                Some(next) => conn = next,
                                None => {
                                    if !cancel.is_cancelled() {
                                        let _ = events_tx
                                            .send(PipelineEvent::TranscriptionLost)
                                            .await;
                                    }
                                    return;
                                }
                            }
                        }
                        None => {
                            // Clean end of the inbound stream. After the audio
                            // is done this is normal teardown; otherwise treat
                            // it as a connection loss.
                            if self.audio_done {
                                self.flush_partial(&events_tx).await;
                                return;
                            }
                            warn!("transcription event stream ended unexpectedly");
                            match self.connect_with_retry(&mut frame_rx, &cancel).await {
                                Some(next) => conn = next,
                                None => {
                                    if !cancel.is_cancelled() {
                                        let _ = events_tx
                                            .send(PipelineEvent::TranscriptionLost)
                                            .await;
                                    }
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Push a frame, dropping the oldest when `cap` is exceeded.
    fn buffer_frame(&mut self, frame: AudioFrame, cap: usize) {
        if self.buffer.len() >= cap {
            let _ = self.buffer.pop_front();
            self.dropped += 1;
        }
        self.buffer.push_back(frame);
    }

    /// Send every buffered frame. Returns `false` when the connection
    /// broke; the unsent frames stay buffered for replay.
    async fn drain_frames(&mut self, conn: &mut TranscriptionConnection) -> bool {
        while let Some(frame) = self.buffer.front() {
            match conn.sink.send_frame(frame).await {
                Ok(()) => {
                    let _ = self.buffer.pop_front();
                }
                Err(e) => {
                    warn!("frame send failed: {e}");
                    return false;
                }
            }
        }
        true
    }

    async fn report_overrun(&mut self, events_tx: &mpsc::Sender<PipelineEvent>) {
        if self.dropped > 0 {
            warn!("audio buffer overrun: dropped {} frames", self.dropped);
            let _ = events_tx
                .send(PipelineEvent::BufferOverrun {
                    dropped: self.dropped,
                })
                .await;
            self.dropped = 0;
        }
    }

    /// Rebase, clamp, and forward one transcript event.
    async fn forward(&mut self, ev: TranscriptEvent, events_tx: &mpsc::Sender<PipelineEvent>) {
        let sequence = (self.seq_base + ev.sequence).max(self.last_seq);
        self.last_seq = sequence;
        let ev = TranscriptEvent {
            confidence: ev.confidence.clamp(0.0, 1.0),
            sequence,
            ..ev
        };
        if ev.is_final {
            // A final supersedes any partial in its sequence region.
            if self
                .pending_partial
                .as_ref()
                .is_some_and(|p| p.sequence <= sequence)
            {
                self.pending_partial = None;
            }
        } else {
            self.pending_partial = Some(ev.clone());
        }
        let _ = events_tx.send(PipelineEvent::Transcript(ev)).await;
    }

    /// Emit any unsuperseded partial as a terminal final event.
    async fn flush_partial(&mut self, events_tx: &mpsc::Sender<PipelineEvent>) {
        if let Some(partial) = self.pending_partial.take() {
            debug!("flushing final partial: {:?}", partial.text);
            let _ = events_tx
                .send(PipelineEvent::Transcript(TranscriptEvent {
                    is_final: true,
                    ..partial
                }))
                .await;
        }
    }

    /// Connect with exponential backoff, buffering incoming audio into
    /// the replay window while waiting. Returns `None` when cancelled or
    /// when the attempt budget is exhausted.
    async fn connect_with_retry(
        &mut self,
        frame_rx: &mut mpsc::Receiver<AudioFrame>,
        cancel: &CancellationToken,
    ) -> Option<TranscriptionConnection> {
        for attempt in 1..=self.config.reconnect_max_attempts {
            match self.service.connect().await {
                Ok(mut conn) => {
                    // Fresh connections may restart sequence numbering;
                    // rebase so session sequence numbers never decrease.
                    self.seq_base = self.last_seq + 1;
                    if self.drain_frames(&mut conn).await {
                        if attempt > 1 {
                            info!("transcription reconnected on attempt {attempt}");
                        }
                        return Some(conn);
                    }
                    warn!("connection dropped during replay (attempt {attempt})");
                }
                Err(e) => {
                    warn!(
                        "transcription connect attempt {attempt}/{} failed: {e}",
                        self.config.reconnect_max_attempts
                    );
                }
            }
            if attempt == self.config.reconnect_max_attempts {
                break;
            }
            if !self
                .backoff_wait(self.config.backoff_for_attempt(attempt), frame_rx, cancel)
                .await
            {
                return None;
            }
        }
        warn!(
            "transcription unavailable after {} attempts",
            self.config.reconnect_max_attempts
        );
        None
    }

    /// Sleep through one backoff period while buffering incoming frames
    /// into the bounded replay window. Returns `false` when cancelled.
    async fn backoff_wait(
        &mut self,
        delay: std::time::Duration,
        frame_rx: &mut mpsc::Receiver<AudioFrame>,
        cancel: &CancellationToken,
    ) -> bool {
        let wait = tokio::time::sleep(delay);
        tokio::pin!(wait);
        loop {
            let audio_open = !self.audio_done;
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = &mut wait => return true,
                maybe = frame_rx.recv(), if audio_open => {
                    match maybe {
                        Some(frame) => {
                            self.buffer_frame(frame, self.config.reconnect_buffer_frames);
                        }
                        None => self.audio_done = true,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::testing::{
        pcm_frame, transcript, ConnectionScript, FakeTranscriptionService, TranscriptStep,
    };
    use std::time::Duration;

    fn config() -> TranscriptionConfig {
        TranscriptionConfig {
            audio_buffer_depth_frames: 4,
            reconnect_buffer_frames: 8,
            reconnect_backoff_base_ms: 10,
            reconnect_backoff_cap_ms: 40,
            reconnect_max_attempts: 5,
            ..TranscriptionConfig::default()
        }
    }

    async fn next_transcript(rx: &mut mpsc::Receiver<PipelineEvent>) -> TranscriptEvent {
        loop {
            match rx.recv().await.unwrap() {
                PipelineEvent::Transcript(ev) => return ev,
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_events_and_frames() {
        let service = FakeTranscriptionService::new(vec![ConnectionScript::Serve(vec![
            TranscriptStep::Event(transcript(0, "hel", false)),
            TranscriptStep::Event(transcript(0, "hello", true)),
            TranscriptStep::Hold,
        ])]);
        let bridge = TranscriptionBridge::new(config(), service.clone());
        let (frame_tx, frame_rx) = mpsc::channel(16);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(bridge.run(frame_rx, events_tx, cancel.clone()));

        frame_tx.send(pcm_frame(100)).await.unwrap();
        let partial = next_transcript(&mut events_rx).await;
        assert!(!partial.is_final);
        let fin = next_transcript(&mut events_rx).await;
        assert_eq!(fin.text, "hello");
        assert!(fin.is_final);
        assert!(fin.sequence >= partial.sequence);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(service.frames_for_connection(0).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_overflow_drops_oldest_and_warns() {
        // A connection that refuses frames never drains the buffer, so
        // pushing past the cap must drop the oldest frames. Use a serve
        // script that holds but a sink that stays writable; instead we
        // overflow by never spawning a drain: send frames while the
        // bridge is reconnecting after a refused first connection.
        let service = FakeTranscriptionService::new(vec![
            ConnectionScript::Refuse,
            ConnectionScript::Serve(vec![TranscriptStep::Hold]),
        ]);
        let bridge = TranscriptionBridge::new(
            TranscriptionConfig {
                reconnect_buffer_frames: 2,
                ..config()
            },
            service.clone(),
        );
        let (frame_tx, frame_rx) = mpsc::channel(16);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(bridge.run(frame_rx, events_tx, cancel.clone()));

        // These arrive during the backoff window; cap is 2.
        for _ in 0..5 {
            frame_tx.send(pcm_frame(100)).await.unwrap();
        }
        // After reconnection the surviving 2 frames are replayed and the
        // next frame triggers the overrun report.
        tokio::time::sleep(Duration::from_millis(50)).await;
        frame_tx.send(pcm_frame(100)).await.unwrap();

        let mut saw_overrun = false;
        for _ in 0..4 {
            match tokio::time::timeout(Duration::from_secs(1), events_rx.recv()).await {
                Ok(Some(PipelineEvent::BufferOverrun { dropped })) => {
                    assert_eq!(dropped, 3);
                    saw_overrun = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_overrun);
        assert_eq!(service.frames_for_connection(0).len(), 3);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_and_rebases_sequences() {
        let service = FakeTranscriptionService::new(vec![
            ConnectionScript::Serve(vec![
                TranscriptStep::Event(transcript(3, "first", true)),
                TranscriptStep::Fail("socket closed".into()),
            ]),
            ConnectionScript::Refuse,
            ConnectionScript::Serve(vec![
                // Numbering restarts at zero on the new connection.
                TranscriptStep::Event(transcript(0, "second", true)),
                TranscriptStep::Hold,
            ]),
        ]);
        let bridge = TranscriptionBridge::new(config(), service.clone());
        let (frame_tx, frame_rx) = mpsc::channel(16);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(bridge.run(frame_rx, events_tx, cancel.clone()));

        frame_tx.send(pcm_frame(100)).await.unwrap();
        let first = next_transcript(&mut events_rx).await;
        assert_eq!(first.text, "first");

        // Frames sent while the connection is down are replayed.
        frame_tx.send(pcm_frame(100)).await.unwrap();
        frame_tx.send(pcm_frame(100)).await.unwrap();
        let second = next_transcript(&mut events_rx).await;
        assert_eq!(second.text, "second");
        assert!(second.sequence > first.sequence);
        assert_eq!(service.connection_count(), 2);
        assert!(!service.frames_for_connection(1).is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_signal_transcription_lost() {
        let service = FakeTranscriptionService::new(vec![
            ConnectionScript::Refuse,
            ConnectionScript::Refuse,
            ConnectionScript::Refuse,
            ConnectionScript::Refuse,
            ConnectionScript::Refuse,
        ]);
        let bridge = TranscriptionBridge::new(config(), service.clone());
        let (_frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(16);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(bridge.run(frame_rx, events_tx, cancel));

        match tokio::time::timeout(Duration::from_secs(60), events_rx.recv()).await {
            Ok(Some(PipelineEvent::TranscriptionLost)) => {}
            other => panic!("expected TranscriptionLost, got {other:?}"),
        }
        assert_eq!(service.attempt_count(), 5);
        assert_eq!(service.connection_count(), 0);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn close_flushes_pending_partial_as_final() {
        let service = FakeTranscriptionService::new(vec![ConnectionScript::Serve(vec![
            TranscriptStep::Event(transcript(0, "half a sent", false)),
            TranscriptStep::Hold,
        ])]);
        let bridge = TranscriptionBridge::new(config(), service);
        let (frame_tx, frame_rx) = mpsc::channel(16);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(bridge.run(frame_rx, events_tx, cancel.clone()));

        frame_tx.send(pcm_frame(100)).await.unwrap();
        let partial = next_transcript(&mut events_rx).await;
        assert!(!partial.is_final);

        cancel.cancel();
        let flushed = next_transcript(&mut events_rx).await;
        assert_eq!(flushed.text, "half a sent");
        assert!(flushed.is_final);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn confidence_is_clamped() {
        let mut ev = transcript(0, "x", true);
        ev.confidence = 1.7;
        let service = FakeTranscriptionService::new(vec![ConnectionScript::Serve(vec![
            TranscriptStep::Event(ev),
            TranscriptStep::Hold,
        ])]);
        let bridge = TranscriptionBridge::new(config(), service);
        let (frame_tx, frame_rx) = mpsc::channel(16);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(bridge.run(frame_rx, events_tx, cancel.clone()));

        frame_tx.send(pcm_frame(100)).await.unwrap();
        let ev = next_transcript(&mut events_rx).await;
        assert!((ev.confidence - 1.0).abs() < f32::EPSILON);
        cancel.cancel();
        handle.await.unwrap();
    }
}
