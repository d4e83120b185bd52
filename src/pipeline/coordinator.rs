//! Turn coordinator: the event loop that wires all bridges together.
//!
//! Every asynchronous producer (VAD boundaries, transcript events,
//! generator chunks, playback lifecycle) feeds one fan-in channel, and
//! a single consumer drains it. All state transitions are therefore
//! sequential and race-free without locking. Synthesized audio bypasses
//! the fan-in channel entirely, flowing straight from the synthesis
//! task to the playback task so a saturated audio path backpressures
//! synthesis, never the event loop.
//! Interruption is modeled as a generation token carried by every unit
//! of async work and checked at both emission and consumption points.

use crate::audio::{AudioSource, PlaybackSink};
use crate::config::SessionConfig;
use crate::error::Result;
use crate::llm::{run_generation, LanguageModelService};
use crate::pipeline::messages::{
    AudioFrame, AudioOutputChunk, GenerationRequest, PipelineEvent, SessionNotice,
    TranscriptEvent, VadEvent,
};
use crate::session::{SessionContext, Speaker};
use crate::stt::{TranscriptionBridge, TranscriptionService};
use crate::tts::{run_synthesis, SpeechSynthesisService};
use crate::vad::VoiceActivityDetector;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Channel buffer sizes.
const EVENT_CHANNEL_SIZE: usize = 64;
const FRAME_CHANNEL_SIZE: usize = 64;
const TEXT_CHANNEL_SIZE: usize = 32;
const PLAYBACK_CHANNEL_SIZE: usize = 32;
const NOTICE_CHANNEL_SIZE: usize = 64;

/// Coordinator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Waiting for user speech.
    Idle,
    /// User is speaking; transcripts accumulate.
    ListeningToUser,
    /// User turn just committed (transient).
    UserTurnCommitted,
    /// Language model is producing text, no audio yet.
    GeneratingResponse,
    /// First text delta arrived; synthesis runs pipelined.
    SynthesizingSpeech,
    /// Synthesized audio is flowing to the playback sink.
    PlayingResponse,
    /// Barge-in detected; in-flight response being torn down (transient).
    Interrupted,
}

/// External collaborators for one session.
///
/// Concrete transport and credential handling live behind these seams.
pub struct Collaborators {
    /// Live call audio frames.
    pub audio_source: Box<dyn AudioSource>,
    /// Per-frame speech classification.
    pub vad: Box<dyn VoiceActivityDetector>,
    /// Streaming recognizer.
    pub transcription: Arc<dyn TranscriptionService>,
    /// Response generator.
    pub language_model: Arc<dyn LanguageModelService>,
    /// Speech synthesizer.
    pub synthesis: Arc<dyn SpeechSynthesisService>,
    /// Playback output.
    pub playback: Arc<dyn PlaybackSink>,
}

/// Orchestrates one voice session: capture → VAD → transcription →
/// generation → synthesis → playback, with barge-in.
pub struct TurnCoordinator {
    config: SessionConfig,
    collaborators: Collaborators,
    cancel: CancellationToken,
    notice_tx: broadcast::Sender<SessionNotice>,
}

impl TurnCoordinator {
    /// Create a coordinator for one session.
    pub fn new(config: SessionConfig, collaborators: Collaborators) -> Self {
        let (notice_tx, _) = broadcast::channel(NOTICE_CHANNEL_SIZE);
        Self {
            config,
            collaborators,
            cancel: CancellationToken::new(),
            notice_tx,
        }
    }

    /// Subscribe to session notices (committed turns, warnings, failures).
    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notice_tx.subscribe()
    }

    /// Cancellation token for external shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the session until the call ends or the token is cancelled.
    ///
    /// Returns the final session context with the committed history.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::SessionError::ConfigurationInvalid`] before
    /// the event loop starts when the configuration is unusable. Runtime
    /// bridge failures do not end the session; they surface as notices.
    pub async fn run(self) -> Result<SessionContext> {
        self.config.validate()?;
        info!("voice session starting");

        let cancel = self.cancel.clone();
        let (events_tx, mut events_rx) = mpsc::channel::<PipelineEvent>(EVENT_CHANNEL_SIZE);
        let (frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(FRAME_CHANNEL_SIZE);
        let (playback_tx, playback_rx) = mpsc::channel::<AudioOutputChunk>(PLAYBACK_CHANNEL_SIZE);
        let current_generation = Arc::new(AtomicU64::new(0));

        tokio::spawn(run_audio_pump(
            self.collaborators.audio_source,
            self.collaborators.vad,
            frame_tx,
            events_tx.clone(),
            cancel.clone(),
        ));

        let bridge = TranscriptionBridge::new(
            self.config.transcription.clone(),
            Arc::clone(&self.collaborators.transcription),
        );
        tokio::spawn(bridge.run(frame_rx, events_tx.clone(), cancel.clone()));

        tokio::spawn(run_playback(
            Arc::clone(&self.collaborators.playback),
            playback_rx,
            Arc::clone(&current_generation),
            events_tx.clone(),
            cancel.clone(),
        ));

        let mut turn_loop = EventLoop {
            config: self.config,
            ctx: SessionContext::new(),
            state: CoordinatorState::Idle,
            finals: Vec::new(),
            partial: None,
            speech_ended: false,
            commit_deadline: None,
            agent_text: String::new(),
            generation_cancel: None,
            current_generation,
            language_model: self.collaborators.language_model,
            synthesis: self.collaborators.synthesis,
            playback: self.collaborators.playback,
            events_tx,
            playback_tx,
            notice_tx: self.notice_tx,
            cancel: cancel.clone(),
            end_after_current: false,
        };

        let outcome: Result<()> = loop {
            let deadline = turn_loop.commit_deadline;
            tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                () = tokio::time::sleep_until(
                    deadline.unwrap_or_else(far_future)
                ), if deadline.is_some() => {
                    if let Err(e) = turn_loop.handle_silence_timeout().await {
                        break Err(e);
                    }
                }
                maybe = events_rx.recv() => match maybe {
                    Some(ev) => match turn_loop.handle(ev).await {
                        Ok(true) => {}
                        Ok(false) => break Ok(()),
                        Err(e) => break Err(e),
                    },
                    None => break Ok(()),
                }
            }
        };

        // Stops the pump, bridge, and playback tasks on every exit path.
        cancel.cancel();
        info!(
            "voice session ended ({} committed turns)",
            turn_loop.ctx.history().len()
        );
        outcome.map(|()| turn_loop.ctx)
    }
}

fn far_future() -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_secs(3600)
}

/// All mutable state of the single-consumer event loop.
struct EventLoop {
    config: SessionConfig,
    ctx: SessionContext,
    state: CoordinatorState,
    /// Final transcript fragments of the current user turn, in order.
    finals: Vec<String>,
    /// Latest unsettled partial, superseded by finals.
    partial: Option<String>,
    /// Whether VAD has closed the current speech segment.
    speech_ended: bool,
    /// When armed, the user turn commits at this instant.
    commit_deadline: Option<tokio::time::Instant>,
    /// Accumulated agent response text for the in-flight generation.
    agent_text: String,
    /// Child token cancelling the in-flight generation and synthesis.
    generation_cancel: Option<CancellationToken>,
    /// Shared with the playback path for stale-chunk rejection.
    current_generation: Arc<AtomicU64>,
    language_model: Arc<dyn LanguageModelService>,
    synthesis: Arc<dyn SpeechSynthesisService>,
    playback: Arc<dyn PlaybackSink>,
    events_tx: mpsc::Sender<PipelineEvent>,
    /// Cloned into each generation's synthesis task; the event loop
    /// itself never sends on it.
    playback_tx: mpsc::Sender<AudioOutputChunk>,
    notice_tx: broadcast::Sender<SessionNotice>,
    cancel: CancellationToken,
    /// Set when the audio source ended; the loop exits on return to Idle.
    end_after_current: bool,
}

impl EventLoop {
    /// Process one merged event. Returns `false` when the loop should end.
    async fn handle(&mut self, ev: PipelineEvent) -> Result<bool> {
        match ev {
            PipelineEvent::Vad(VadEvent::SpeechStart { at }) => {
                self.on_speech_start(at).await?;
            }
            PipelineEvent::Vad(VadEvent::SpeechEnd { .. }) => {
                self.speech_ended = true;
                // A final received mid-speech may already have armed the
                // timer; the silence window runs from that final.
                if self.state == CoordinatorState::ListeningToUser
                    && !self.finals.is_empty()
                    && self.commit_deadline.is_none()
                {
                    self.arm_commit_timer();
                }
            }
            PipelineEvent::Vad(VadEvent::Frame { .. }) => {}
            PipelineEvent::Transcript(ev) => self.on_transcript(ev).await?,
            PipelineEvent::Response(chunk) => {
                if chunk.generation != self.ctx.generation() {
                    debug!("discarding stale response chunk (token {})", chunk.generation);
                } else if !chunk.delta.is_empty() {
                    self.agent_text.push_str(&chunk.delta);
                    if self.state == CoordinatorState::GeneratingResponse {
                        debug!("first response delta; synthesis pipelined");
                        self.state = CoordinatorState::SynthesizingSpeech;
                    }
                }
            }
            PipelineEvent::SynthesisReady { generation, format } => {
                if generation == self.ctx.generation() {
                    if let Err(e) = self.playback.play_format(format).await {
                        self.fail_response(format!("playback format rejected: {e}"))
                            .await;
                    }
                }
            }
            PipelineEvent::PlaybackStarted { generation } => {
                if generation == self.ctx.generation()
                    && self.state == CoordinatorState::SynthesizingSpeech
                {
                    self.state = CoordinatorState::PlayingResponse;
                }
            }
            PipelineEvent::PlaybackFinished { generation } => {
                if generation == self.ctx.generation() {
                    let text = self.agent_text.clone();
                    self.agent_text.clear();
                    self.generation_cancel = None;
                    self.state = CoordinatorState::Idle;
                    if text.trim().is_empty() {
                        // The model produced nothing; drop the turn
                        // rather than committing empty text.
                        if let Some(turn) = self.ctx.cancel_in_flight(Instant::now()) {
                            warn!("agent turn {} produced no text; dropped", turn.id);
                            self.notify(SessionNotice::TurnCancelled(turn));
                        }
                    } else {
                        self.ctx.set_in_flight_text(&text);
                        let turn = self.ctx.commit_in_flight(Instant::now())?;
                        info!("agent turn committed ({} chars)", turn.text.len());
                        self.notify(SessionNotice::TurnCommitted(turn));
                    }
                }
            }
            PipelineEvent::GenerationFailed { generation, reason }
            | PipelineEvent::SynthesisFailed { generation, reason } => {
                if generation == self.ctx.generation() {
                    self.fail_response(reason).await;
                }
            }
            PipelineEvent::TranscriptionLost => {
                warn!("transcription unavailable; abandoning current user turn");
                self.notify(SessionNotice::TranscriptionUnavailable);
                if self.state == CoordinatorState::ListeningToUser {
                    self.abandon_user_turn();
                }
            }
            PipelineEvent::BufferOverrun { dropped } => {
                self.notify(SessionNotice::BufferOverrun { dropped });
            }
            PipelineEvent::AudioEnded => {
                info!("audio source ended; finishing session");
                self.end_after_current = true;
                if self.state == CoordinatorState::ListeningToUser {
                    // No further frames means no SpeechEnd will arrive.
                    self.speech_ended = true;
                    if self.finals.is_empty() && self.partial.is_none() {
                        self.abandon_user_turn();
                    } else {
                        // Give the recognizer's flushed final a grace window.
                        self.arm_commit_timer();
                    }
                }
            }
        }
        Ok(!(self.end_after_current && self.state == CoordinatorState::Idle))
    }

    async fn on_speech_start(&mut self, at: Instant) -> Result<()> {
        self.commit_deadline = None;
        self.speech_ended = false;
        match self.state {
            CoordinatorState::Idle => {
                info!("user speech started");
                self.ctx.begin_turn(Speaker::User, at)?;
                self.state = CoordinatorState::ListeningToUser;
            }
            CoordinatorState::ListeningToUser => {}
            CoordinatorState::GeneratingResponse
            | CoordinatorState::SynthesizingSpeech
            | CoordinatorState::PlayingResponse => {
                self.state = CoordinatorState::Interrupted;
                self.interrupt_response().await;
                self.ctx.begin_turn(Speaker::User, at)?;
                self.state = CoordinatorState::ListeningToUser;
            }
            CoordinatorState::UserTurnCommitted | CoordinatorState::Interrupted => {}
        }
        Ok(())
    }

    async fn on_transcript(&mut self, ev: TranscriptEvent) -> Result<()> {
        if self.state != CoordinatorState::ListeningToUser {
            debug!(
                "dropping transcript outside listening state: {:?}",
                ev.text
            );
            return Ok(());
        }
        if ev.is_final {
            if !ev.text.trim().is_empty() {
                self.finals.push(ev.text);
            }
            self.partial = None;
            if self.finals.is_empty() {
                return Ok(());
            }
            if self.speech_ended {
                // Tie-break: a final after speech end wins over any
                // pending silence timer.
                self.commit_user_turn().await?;
            } else {
                self.arm_commit_timer();
            }
        } else {
            self.partial = Some(ev.text);
        }
        Ok(())
    }

    /// Silence timer fired: commit the user turn with what we have.
    ///
    /// Only a real non-speech period counts; if VAD still reports active
    /// speech the timer is held and the next SpeechEnd re-arms it.
    async fn handle_silence_timeout(&mut self) -> Result<()> {
        self.commit_deadline = None;
        if self.state != CoordinatorState::ListeningToUser {
            return Ok(());
        }
        if !self.speech_ended {
            debug!("silence timer fired during active speech; holding");
            return Ok(());
        }
        info!("silence timeout; committing user turn");
        self.commit_user_turn().await
    }

    fn arm_commit_timer(&mut self) {
        self.commit_deadline =
            Some(tokio::time::Instant::now() + self.config.turn.silence_timeout());
    }

    /// Commit the user turn and kick off pipelined generation/synthesis.
    async fn commit_user_turn(&mut self) -> Result<()> {
        self.commit_deadline = None;
        let utterance = if self.finals.is_empty() {
            self.partial.take().unwrap_or_default()
        } else {
            self.finals.join(" ")
        };
        let utterance = utterance.trim().to_owned();
        self.finals.clear();
        self.partial = None;

        if utterance.is_empty() {
            self.abandon_user_turn();
            return Ok(());
        }

        self.state = CoordinatorState::UserTurnCommitted;
        self.ctx.set_in_flight_text(&utterance);
        let turn = self.ctx.commit_in_flight(Instant::now())?;
        info!("user turn committed: {:?}", turn.text);
        self.notify(SessionNotice::TurnCommitted(turn));

        let token = self.ctx.bump_generation();
        self.current_generation.store(token, Ordering::SeqCst);
        let generation_cancel = self.cancel.child_token();
        self.generation_cancel = Some(generation_cancel.clone());

        let request = GenerationRequest {
            system_instruction: self.config.generation.system_instruction.clone(),
            messages: self.ctx.chat_messages(self.config.turn.max_history_turns),
        };
        let (text_tx, text_rx) = mpsc::channel::<String>(TEXT_CHANNEL_SIZE);
        tokio::spawn(run_generation(
            Arc::clone(&self.language_model),
            request,
            token,
            self.config.generation.request_timeout(),
            generation_cancel.clone(),
            self.events_tx.clone(),
            text_tx,
        ));
        tokio::spawn(run_synthesis(
            Arc::clone(&self.synthesis),
            text_rx,
            token,
            self.config.generation.request_timeout(),
            generation_cancel,
            self.events_tx.clone(),
            self.playback_tx.clone(),
        ));

        self.agent_text.clear();
        self.ctx.begin_turn(Speaker::Agent, Instant::now())?;
        self.state = CoordinatorState::GeneratingResponse;
        Ok(())
    }

    /// Barge-in: invalidate the in-flight response and stop playback.
    async fn interrupt_response(&mut self) {
        let token = self.ctx.bump_generation();
        self.current_generation.store(token, Ordering::SeqCst);
        if let Some(cancel) = self.generation_cancel.take() {
            cancel.cancel();
        }
        if let Err(e) = self.playback.interrupt().await {
            warn!("playback interrupt failed: {e}");
        }
        let text = self.agent_text.clone();
        self.ctx.set_in_flight_text(&text);
        if let Some(turn) = self.ctx.cancel_in_flight(Instant::now()) {
            info!("barge-in: cancelled agent turn {} (token now {token})", turn.id);
            self.notify(SessionNotice::TurnCancelled(turn));
        }
        self.agent_text.clear();
    }

    /// Generation or synthesis failed: tear down, notify, keep listening.
    async fn fail_response(&mut self, reason: String) {
        warn!("agent response failed: {reason}");
        let token = self.ctx.bump_generation();
        self.current_generation.store(token, Ordering::SeqCst);
        if let Some(cancel) = self.generation_cancel.take() {
            cancel.cancel();
        }
        if let Err(e) = self.playback.interrupt().await {
            warn!("playback interrupt failed: {e}");
        }
        let text = self.agent_text.clone();
        self.ctx.set_in_flight_text(&text);
        if let Some(turn) = self.ctx.cancel_in_flight(Instant::now()) {
            self.notify(SessionNotice::TurnCancelled(turn));
        }
        self.agent_text.clear();
        self.notify(SessionNotice::AgentResponseFailed { reason });
        self.state = CoordinatorState::Idle;
    }

    /// Drop the in-flight user turn without committing it.
    fn abandon_user_turn(&mut self) {
        self.commit_deadline = None;
        self.finals.clear();
        self.partial = None;
        if let Some(turn) = self.ctx.cancel_in_flight(Instant::now()) {
            self.notify(SessionNotice::TurnCancelled(turn));
        }
        self.state = CoordinatorState::Idle;
    }

    fn notify(&self, notice: SessionNotice) {
        // Nobody listening is fine; notices are best-effort.
        let _ = self.notice_tx.send(notice);
    }
}

/// Capture task: reads frames, classifies them, and forwards them.
///
/// Boundary events go to the merged event stream; per-frame
/// classifications stay local so they cannot flood the coordinator.
async fn run_audio_pump(
    mut source: Box<dyn AudioSource>,
    mut vad: Box<dyn VoiceActivityDetector>,
    frame_tx: mpsc::Sender<AudioFrame>,
    events_tx: mpsc::Sender<PipelineEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            next = source.next_frame() => match next {
                Ok(Some(frame)) => {
                    if let Some(ev) = vad.process(&frame) {
                        if !matches!(ev, VadEvent::Frame { .. })
                            && events_tx.send(PipelineEvent::Vad(ev)).await.is_err()
                        {
                            break;
                        }
                    }
                    if frame_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = events_tx.send(PipelineEvent::AudioEnded).await;
                    break;
                }
                Err(e) => {
                    error!("audio capture failed: {e}");
                    let _ = events_tx.send(PipelineEvent::AudioEnded).await;
                    break;
                }
            }
        }
    }
    let _ = source.close().await;
}

/// Playback task: forwards current-generation chunks to the sink, in
/// order, and reports completion of each generation's final chunk.
///
/// The stale-token check here is the consumption-side half of the
/// belt-and-suspenders discard rule.
async fn run_playback(
    sink: Arc<dyn PlaybackSink>,
    mut rx: mpsc::Receiver<AudioOutputChunk>,
    current_generation: Arc<AtomicU64>,
    events_tx: mpsc::Sender<PipelineEvent>,
    cancel: CancellationToken,
) {
    let mut started: Option<u64> = None;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            maybe = rx.recv() => match maybe {
                Some(chunk) => {
                    let generation = chunk.generation;
                    if generation != current_generation.load(Ordering::SeqCst) {
                        debug!("playback discarding stale chunk (token {generation})");
                        continue;
                    }
                    if started != Some(generation) {
                        started = Some(generation);
                        if events_tx
                            .send(PipelineEvent::PlaybackStarted { generation })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    let is_final = chunk.is_final;
                    if !chunk.payload.is_empty() {
                        if let Err(e) = sink.play(chunk).await {
                            error!("playback failed: {e}");
                            let _ = events_tx
                                .send(PipelineEvent::SynthesisFailed {
                                    generation,
                                    reason: format!("playback: {e}"),
                                })
                                .await;
                            continue;
                        }
                    }
                    if is_final
                        && events_tx
                            .send(PipelineEvent::PlaybackFinished { generation })
                            .await
                            .is_err()
                    {
                        break;
                    }
                }
                None => break,
            }
        }
    }
}
