//! Response generation bridge.
//!
//! Streams incremental text deltas from an external language model,
//! tagging every chunk with the generation token so stale output from an
//! interrupted attempt is discarded downstream. Cancellation is observed
//! every streaming step; a fresh attempt always means a fresh call.

use crate::error::{Result, SessionError};
use crate::pipeline::messages::{GenerationRequest, PipelineEvent, ResponseChunk};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// External language model reached over a cancellable delta stream.
#[async_trait::async_trait]
pub trait LanguageModelService: Send + Sync {
    /// Start one response generation.
    ///
    /// The returned receiver yields text deltas until the response is
    /// complete (channel closes) or an error item arrives. The service
    /// must close its underlying network request when `cancel` fires,
    /// not merely stop being read.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be started.
    async fn stream_response(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Result<String>>>;
}

/// Drive one response generation attempt.
///
/// Text deltas are forwarded twice: as token-tagged [`ResponseChunk`]s
/// into the merged event stream, and as plain deltas into the synthesis
/// bridge's text channel (pipelined synthesis). Dropping `synth_tx` after
/// the last delta tells the synthesis stream the text is complete.
///
/// Failures never propagate as panics or raw errors; they surface as a
/// [`PipelineEvent::GenerationFailed`] for the coordinator to translate.
pub async fn run_generation(
    service: Arc<dyn LanguageModelService>,
    request: GenerationRequest,
    generation: u64,
    deadline: Duration,
    cancel: CancellationToken,
    events_tx: mpsc::Sender<PipelineEvent>,
    synth_tx: mpsc::Sender<String>,
) {
    info!("starting response generation (token {generation})");

    let opened = tokio::time::timeout(
        deadline,
        service.stream_response(request, cancel.clone()),
    )
    .await
    .map_err(|_| SessionError::DeadlineExceeded("language model stream open".into()))
    .and_then(|r| r);

    let mut delta_rx = match opened {
        Ok(rx) => rx,
        Err(e) => {
            let _ = events_tx
                .send(PipelineEvent::GenerationFailed {
                    generation,
                    reason: e.to_string(),
                })
                .await;
            return;
        }
    };

    loop {
        tokio::select! {
            // Cancellation wins over an already-buffered delta, so no
            // chunk is ever emitted after the token fires.
            biased;
            () = cancel.cancelled() => {
                // Dropping the receiver plus the fired token closes the
                // underlying request; nothing more is emitted here.
                debug!("generation {generation} cancelled");
                return;
            }
            delta = delta_rx.recv() => match delta {
                Some(Ok(delta)) => {
                    if delta.is_empty() {
                        continue;
                    }
                    if synth_tx.send(delta.clone()).await.is_err() {
                        debug!("synthesis input closed; stopping generation {generation}");
                        return;
                    }
                    let chunk = ResponseChunk {
                        generation,
                        delta,
                        is_final: false,
                    };
                    if events_tx.send(PipelineEvent::Response(chunk)).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    let _ = events_tx
                        .send(PipelineEvent::GenerationFailed {
                            generation,
                            reason: e.to_string(),
                        })
                        .await;
                    return;
                }
                None => {
                    // Clean completion: final marker, then close the
                    // synthesis text stream.
                    drop(synth_tx);
                    let _ = events_tx
                        .send(PipelineEvent::Response(ResponseChunk {
                            generation,
                            delta: String::new(),
                            is_final: true,
                        }))
                        .await;
                    info!("response generation {generation} complete");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::pipeline::messages::ChatMessage;
    use crate::pipeline::messages::ChatRole;
    use crate::testing::{FakeLanguageModel, LlmStep};

    fn request() -> GenerationRequest {
        GenerationRequest {
            system_instruction: "be brief".into(),
            messages: vec![ChatMessage {
                role: ChatRole::User,
                text: "hello".into(),
            }],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn streams_tagged_chunks_and_final_marker() {
        let service = FakeLanguageModel::new(vec![vec![
            LlmStep::Delta("Hi ".into()),
            LlmStep::Delta("there.".into()),
        ]]);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (synth_tx, mut synth_rx) = mpsc::channel(16);
        run_generation(
            service.clone(),
            request(),
            7,
            Duration::from_secs(1),
            CancellationToken::new(),
            events_tx,
            synth_tx,
        )
        .await;

        let mut deltas = Vec::new();
        let mut finals = 0;
        while let Some(ev) = events_rx.recv().await {
            match ev {
                PipelineEvent::Response(chunk) => {
                    assert_eq!(chunk.generation, 7);
                    if chunk.is_final {
                        finals += 1;
                    } else {
                        deltas.push(chunk.delta);
                    }
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(deltas.join(""), "Hi there.");
        assert_eq!(finals, 1);

        // Pipelined copy for synthesis, closed after the last delta.
        assert_eq!(synth_rx.recv().await.unwrap(), "Hi ");
        assert_eq!(synth_rx.recv().await.unwrap(), "there.");
        assert!(synth_rx.recv().await.is_none());

        assert_eq!(service.requests().len(), 1);
        assert_eq!(service.requests()[0].system_instruction, "be brief");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_stream_without_final_marker() {
        let service = FakeLanguageModel::new(vec![vec![
            LlmStep::Delta("Hi ".into()),
            LlmStep::WaitMs(10_000),
            LlmStep::Delta("never".into()),
        ]]);
        let cancel = CancellationToken::new();
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (synth_tx, _synth_rx) = mpsc::channel(16);
        let handle = tokio::spawn(run_generation(
            service,
            request(),
            1,
            Duration::from_secs(1),
            cancel.clone(),
            events_tx,
            synth_tx,
        ));

        match events_rx.recv().await.unwrap() {
            PipelineEvent::Response(chunk) => assert_eq!(chunk.delta, "Hi "),
            other => panic!("unexpected event {other:?}"),
        }
        cancel.cancel();
        handle.await.unwrap();
        // No further chunks, no final marker.
        assert!(events_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stream_error_surfaces_as_generation_failed() {
        let service = FakeLanguageModel::new(vec![vec![
            LlmStep::Delta("Hi".into()),
            LlmStep::Fail("model overloaded".into()),
        ]]);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (synth_tx, _synth_rx) = mpsc::channel(16);
        run_generation(
            service,
            request(),
            2,
            Duration::from_secs(1),
            CancellationToken::new(),
            events_tx,
            synth_tx,
        )
        .await;

        let mut saw_failure = false;
        while let Some(ev) = events_rx.recv().await {
            if let PipelineEvent::GenerationFailed { generation, reason } = ev {
                assert_eq!(generation, 2);
                assert!(reason.contains("model overloaded"));
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test(start_paused = true)]
    async fn open_deadline_is_a_failure() {
        let service = FakeLanguageModel::new_with_open_delay(
            vec![vec![LlmStep::Delta("late".into())]],
            Duration::from_secs(5),
        );
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (synth_tx, _synth_rx) = mpsc::channel(16);
        run_generation(
            service,
            request(),
            3,
            Duration::from_millis(100),
            CancellationToken::new(),
            events_tx,
            synth_tx,
        )
        .await;

        match events_rx.recv().await.unwrap() {
            PipelineEvent::GenerationFailed { reason, .. } => {
                assert!(reason.contains("deadline"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
