//! Scripted in-memory collaborators for tests.
//!
//! Every external interface has a fake here driven by an explicit event
//! script — no fixed delays standing in for real work, no fabricated
//! results. Unit tests and the integration suite share these.

use crate::audio::{AudioSource, PlaybackSink};
use crate::error::{Result, SessionError};
use crate::llm::LanguageModelService;
use crate::pipeline::messages::{
    AudioFormat, AudioFrame, AudioOutputChunk, GenerationRequest, TranscriptEvent, VadEvent,
};
use crate::stt::{TranscriptionConnection, TranscriptionService, TranscriptionSink};
use crate::tts::{SpeechSynthesisService, SynthesisStream};
use crate::vad::VoiceActivityDetector;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Build a mono 16 kHz PCM frame with every sample at `amplitude`.
pub fn pcm_frame(amplitude: i16) -> AudioFrame {
    let payload = std::iter::repeat(amplitude.to_le_bytes())
        .take(320)
        .flatten()
        .collect();
    AudioFrame {
        captured_at: Instant::now(),
        sample_rate: 16_000,
        channels: 1,
        payload,
    }
}

/// Build a transcript event with nominal confidence and language.
pub fn transcript(sequence: u64, text: &str, is_final: bool) -> TranscriptEvent {
    TranscriptEvent {
        text: text.to_owned(),
        is_final,
        confidence: 0.9,
        language: Some("en".to_owned()),
        sequence,
    }
}

/// A `SpeechStart` boundary stamped now.
pub fn speech_start() -> VadEvent {
    VadEvent::SpeechStart { at: Instant::now() }
}

/// A `SpeechEnd` boundary stamped now.
pub fn speech_end() -> VadEvent {
    VadEvent::SpeechEnd { at: Instant::now() }
}

// ── transcription ────────────────────────────────────────────────

/// What one `connect()` call should do.
pub enum ConnectionScript {
    /// Refuse the connection.
    Refuse,
    /// Accept and play the given inbound script.
    Serve(Vec<TranscriptStep>),
}

/// One step of a served connection's inbound event script.
pub enum TranscriptStep {
    /// Emit a transcript event.
    Event(TranscriptEvent),
    /// Pause the script.
    WaitMs(u64),
    /// Emit a stream error (connection loss) and stop.
    Fail(String),
    /// End the inbound stream cleanly.
    End,
    /// Keep the connection open until the bridge drops it.
    Hold,
}

/// Scripted recognizer. Each `connect()` consumes the next script;
/// exhausted scripts serve an idle open connection.
pub struct FakeTranscriptionService {
    scripts: Mutex<VecDeque<ConnectionScript>>,
    attempts: AtomicUsize,
    frames: Mutex<Vec<Arc<Mutex<Vec<AudioFrame>>>>>,
}

impl FakeTranscriptionService {
    /// Create the service with one script per expected `connect()` call.
    pub fn new(scripts: Vec<ConnectionScript>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            attempts: AtomicUsize::new(0),
            frames: Mutex::new(Vec::new()),
        })
    }

    /// Number of `connect()` calls made (including refused ones).
    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Number of connections actually established.
    pub fn connection_count(&self) -> usize {
        self.frames.lock().map(|f| f.len()).unwrap_or(0)
    }

    /// Frames received by the n-th established connection.
    pub fn frames_for_connection(&self, index: usize) -> Vec<AudioFrame> {
        self.frames
            .lock()
            .ok()
            .and_then(|f| f.get(index).cloned())
            .map(|f| f.lock().map(|v| v.clone()).unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TranscriptionService for FakeTranscriptionService {
    async fn connect(&self) -> Result<TranscriptionConnection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .map_err(|_| SessionError::Transcription("script lock poisoned".into()))?
            .pop_front()
            .unwrap_or(ConnectionScript::Serve(vec![TranscriptStep::Hold]));

        let steps = match script {
            ConnectionScript::Refuse => {
                return Err(SessionError::Transcription("connection refused".into()));
            }
            ConnectionScript::Serve(steps) => steps,
        };

        let received = Arc::new(Mutex::new(Vec::new()));
        if let Ok(mut all) = self.frames.lock() {
            all.push(Arc::clone(&received));
        }

        let (event_tx, event_rx) = mpsc::channel::<Result<TranscriptEvent>>(32);
        tokio::spawn(async move {
            for step in steps {
                match step {
                    TranscriptStep::Event(ev) => {
                        if event_tx.send(Ok(ev)).await.is_err() {
                            return;
                        }
                    }
                    TranscriptStep::WaitMs(ms) => {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                    TranscriptStep::Fail(reason) => {
                        let _ = event_tx.send(Err(SessionError::Transcription(reason))).await;
                        return;
                    }
                    TranscriptStep::End => return,
                    TranscriptStep::Hold => {
                        event_tx.closed().await;
                        return;
                    }
                }
            }
        });

        Ok(TranscriptionConnection {
            sink: Box::new(RecordingSink { received }),
            events: event_rx,
        })
    }
}

struct RecordingSink {
    received: Arc<Mutex<Vec<AudioFrame>>>,
}

#[async_trait]
impl TranscriptionSink for RecordingSink {
    async fn send_frame(&mut self, frame: &AudioFrame) -> Result<()> {
        self.received
            .lock()
            .map_err(|_| SessionError::Transcription("frame lock poisoned".into()))?
            .push(frame.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

// ── language model ───────────────────────────────────────────────

/// One step of a scripted generation stream.
pub enum LlmStep {
    /// Emit a text delta.
    Delta(String),
    /// Pause the stream (cancellable).
    WaitMs(u64),
    /// Emit a stream error and stop.
    Fail(String),
    /// Keep the stream open until cancelled or dropped.
    Hold,
}

/// Scripted language model. Each `stream_response` call consumes the
/// next script; exhausted scripts complete immediately with no deltas.
pub struct FakeLanguageModel {
    scripts: Mutex<VecDeque<Vec<LlmStep>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    open_delay: Duration,
}

impl FakeLanguageModel {
    /// Create the model with one script per expected call.
    pub fn new(scripts: Vec<Vec<LlmStep>>) -> Arc<Self> {
        Self::new_with_open_delay(scripts, Duration::ZERO)
    }

    /// Same, but `stream_response` stalls before opening the stream.
    pub fn new_with_open_delay(scripts: Vec<Vec<LlmStep>>, open_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            open_delay,
        })
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModelService for FakeLanguageModel {
    async fn stream_response(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let steps = self
            .scripts
            .lock()
            .map_err(|_| SessionError::Generation("script lock poisoned".into()))?
            .pop_front()
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel::<Result<String>>(32);
        tokio::spawn(async move {
            for step in steps {
                if cancel.is_cancelled() {
                    return;
                }
                match step {
                    LlmStep::Delta(delta) => {
                        if tx.send(Ok(delta)).await.is_err() {
                            return;
                        }
                    }
                    LlmStep::WaitMs(ms) => {
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            () = tokio::time::sleep(Duration::from_millis(ms)) => {}
                        }
                    }
                    LlmStep::Fail(reason) => {
                        let _ = tx.send(Err(SessionError::Generation(reason))).await;
                        return;
                    }
                    LlmStep::Hold => {
                        tokio::select! {
                            () = cancel.cancelled() => {}
                            () = tx.closed() => {}
                        }
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}

// ── synthesis ────────────────────────────────────────────────────

/// Scripted synthesizer: every text delta becomes one audio chunk whose
/// payload is the delta's UTF-8 bytes, at 24 kHz mono.
pub struct FakeSynthesizer {
    received: Arc<Mutex<Vec<String>>>,
    /// Deltas beyond this count produce a stream error.
    fail_after: Option<usize>,
}

impl FakeSynthesizer {
    /// A synthesizer that never fails.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            received: Arc::new(Mutex::new(Vec::new())),
            fail_after: None,
        })
    }

    /// A synthesizer that fails on the delta after the n-th.
    pub fn failing_after(n: usize) -> Arc<Self> {
        Arc::new(Self {
            received: Arc::new(Mutex::new(Vec::new())),
            fail_after: Some(n),
        })
    }

    /// Every text delta received so far, across all calls.
    pub fn received_text(&self) -> Vec<String> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SpeechSynthesisService for FakeSynthesizer {
    async fn synthesize(
        &self,
        mut text: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) -> Result<SynthesisStream> {
        let (audio_tx, audio_rx) = mpsc::channel::<Result<Vec<u8>>>(32);
        let received = Arc::clone(&self.received);
        let fail_after = self.fail_after;

        tokio::spawn(async move {
            let mut count = 0usize;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    maybe = text.recv() => match maybe {
                        Some(delta) => {
                            if let Ok(mut r) = received.lock() {
                                r.push(delta.clone());
                            }
                            count += 1;
                            if fail_after.is_some_and(|n| count > n) {
                                let _ = audio_tx
                                    .send(Err(SessionError::Synthesis(
                                        "synthesis backend error".into(),
                                    )))
                                    .await;
                                return;
                            }
                            if audio_tx.send(Ok(delta.into_bytes())).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    }
                }
            }
        });

        Ok(SynthesisStream {
            format: AudioFormat {
                sample_rate: 24_000,
                channels: 1,
            },
            audio: audio_rx,
        })
    }
}

// ── playback ─────────────────────────────────────────────────────

/// One recorded playback interaction.
#[derive(Debug, Clone)]
pub enum PlaybackCall {
    /// `play_format` with the declared format.
    Format(AudioFormat),
    /// `play` with a chunk.
    Chunk(AudioOutputChunk),
    /// `interrupt`.
    Interrupt,
}

/// Records every playback interaction for assertions.
#[derive(Default)]
pub struct FakePlayback {
    calls: Mutex<Vec<PlaybackCall>>,
}

impl FakePlayback {
    /// Fresh recording sink.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All interactions, in order.
    pub fn calls(&self) -> Vec<PlaybackCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Only the played chunks, in order.
    pub fn played(&self) -> Vec<AudioOutputChunk> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                PlaybackCall::Chunk(chunk) => Some(chunk),
                _ => None,
            })
            .collect()
    }

    /// Number of `interrupt` calls.
    pub fn interrupts(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, PlaybackCall::Interrupt))
            .count()
    }
}

#[async_trait]
impl PlaybackSink for FakePlayback {
    async fn play_format(&self, format: AudioFormat) -> Result<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(PlaybackCall::Format(format));
        }
        Ok(())
    }

    async fn play(&self, chunk: AudioOutputChunk) -> Result<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(PlaybackCall::Chunk(chunk));
        }
        Ok(())
    }

    async fn interrupt(&self) -> Result<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(PlaybackCall::Interrupt);
        }
        Ok(())
    }
}

// ── audio source and VAD ─────────────────────────────────────────

/// One step of a scripted audio capture.
pub enum AudioStep {
    /// Yield a frame.
    Frame(AudioFrame),
    /// Pause capture.
    WaitMs(u64),
}

/// Scripted audio source. After the script, either reports end-of-call
/// or holds open forever.
pub struct ScriptedAudioSource {
    steps: VecDeque<AudioStep>,
    hold_at_end: bool,
}

impl ScriptedAudioSource {
    /// Source that ends the call after the script.
    pub fn new(steps: Vec<AudioStep>) -> Self {
        Self {
            steps: steps.into(),
            hold_at_end: false,
        }
    }

    /// Source that stays open (silent) after the script.
    pub fn holding(steps: Vec<AudioStep>) -> Self {
        Self {
            steps: steps.into(),
            hold_at_end: true,
        }
    }
}

#[async_trait]
impl AudioSource for ScriptedAudioSource {
    async fn next_frame(&mut self) -> Result<Option<AudioFrame>> {
        loop {
            match self.steps.pop_front() {
                Some(AudioStep::Frame(frame)) => return Ok(Some(frame)),
                Some(AudioStep::WaitMs(ms)) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                None => {
                    if self.hold_at_end {
                        std::future::pending::<()>().await;
                    }
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// VAD that replays a fixed event script, one entry per frame.
pub struct ScriptedVad {
    events: VecDeque<Option<VadEvent>>,
}

impl ScriptedVad {
    /// One script entry is consumed per processed frame; afterwards
    /// every frame classifies as non-speech.
    pub fn new(events: Vec<Option<VadEvent>>) -> Self {
        Self {
            events: events.into(),
        }
    }
}

impl VoiceActivityDetector for ScriptedVad {
    fn process(&mut self, _frame: &AudioFrame) -> Option<VadEvent> {
        self.events
            .pop_front()
            .unwrap_or(Some(VadEvent::Frame { is_speech: false }))
    }

    fn reset(&mut self) {
        self.events.clear();
    }
}
