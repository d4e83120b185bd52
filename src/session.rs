//! Conversation history and turn state for one voice session.
//!
//! Only the turn coordinator mutates a [`SessionContext`]; because the
//! coordinator is a single-threaded event-loop consumer, no locking is
//! needed. Readers get consistent snapshots via [`SessionContext::snapshot`].

use crate::error::{Result, SessionError};
use crate::pipeline::messages::{ChatMessage, ChatRole};
use std::time::Instant;

/// Who produced an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    /// The human caller.
    User,
    /// The voice agent.
    Agent,
}

/// Lifecycle state of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// Created on speech/generation start; text still accumulating.
    Pending,
    /// Complete and immutable; appended to history.
    Committed,
    /// Interrupted or abandoned before completion; never enters history.
    Cancelled,
}

/// One complete utterance attributable to a single speaker.
#[derive(Debug, Clone)]
pub struct Turn {
    /// Session-monotonic turn identifier.
    pub id: u64,
    /// Who spoke.
    pub speaker: Speaker,
    /// Utterance text (partial until the turn leaves `Pending`).
    pub text: String,
    /// Lifecycle state.
    pub status: TurnStatus,
    /// When speech or generation started.
    pub started_at: Instant,
    /// When the turn reached a terminal state.
    pub ended_at: Option<Instant>,
}

/// Mutable conversation state shared by the pipeline stages.
///
/// Holds the ordered committed history, the single in-flight turn, and
/// the generation token that invalidates stale async work.
#[derive(Debug)]
pub struct SessionContext {
    history: Vec<Turn>,
    in_flight: Option<Turn>,
    generation: u64,
    next_turn_id: u64,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    /// Create an empty session.
    pub fn new() -> Self {
        Self {
            history: Vec::new(),
            in_flight: None,
            generation: 0,
            next_turn_id: 0,
        }
    }

    /// Current generation token.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Increment and return the generation token. Tokens strictly
    /// increase and are never reused.
    pub fn bump_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Begin a new in-flight turn.
    ///
    /// # Errors
    ///
    /// Returns an error if a turn is already in flight; at most one turn
    /// may be non-terminal at any instant.
    pub fn begin_turn(&mut self, speaker: Speaker, started_at: Instant) -> Result<&Turn> {
        if self.in_flight.is_some() {
            return Err(SessionError::Channel(
                "a turn is already in flight".into(),
            ));
        }
        let turn = Turn {
            id: self.next_turn_id,
            speaker,
            text: String::new(),
            status: TurnStatus::Pending,
            started_at,
            ended_at: None,
        };
        self.next_turn_id += 1;
        Ok(self.in_flight.insert(turn))
    }

    /// The current in-flight turn, if any.
    pub fn in_flight(&self) -> Option<&Turn> {
        self.in_flight.as_ref()
    }

    /// Replace the in-flight turn's accumulated text.
    ///
    /// No-op when nothing is in flight.
    pub fn set_in_flight_text(&mut self, text: &str) {
        if let Some(turn) = self.in_flight.as_mut() {
            text.clone_into(&mut turn.text);
        }
    }

    /// Commit the in-flight turn: mark it `Committed`, append it to
    /// history, and return a clone.
    ///
    /// # Errors
    ///
    /// Returns an error if no turn is in flight.
    pub fn commit_in_flight(&mut self, ended_at: Instant) -> Result<Turn> {
        let mut turn = self
            .in_flight
            .take()
            .ok_or_else(|| SessionError::Channel("no turn in flight to commit".into()))?;
        turn.status = TurnStatus::Committed;
        turn.ended_at = Some(ended_at);
        self.history.push(turn.clone());
        Ok(turn)
    }

    /// Cancel the in-flight turn and return it. The turn does not enter
    /// history.
    pub fn cancel_in_flight(&mut self, ended_at: Instant) -> Option<Turn> {
        let mut turn = self.in_flight.take()?;
        turn.status = TurnStatus::Cancelled;
        turn.ended_at = Some(ended_at);
        Some(turn)
    }

    /// Committed turns, oldest first.
    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    /// Consistent clone of the committed history. In-flight text never
    /// appears here.
    pub fn snapshot(&self) -> Vec<Turn> {
        self.history.clone()
    }

    /// Build the message list for a generation request, capped to the
    /// most recent `max_turns` committed turns.
    pub fn chat_messages(&self, max_turns: usize) -> Vec<ChatMessage> {
        let start = self.history.len().saturating_sub(max_turns);
        self.history[start..]
            .iter()
            .map(|turn| ChatMessage {
                role: match turn.speaker {
                    Speaker::User => ChatRole::User,
                    Speaker::Agent => ChatRole::Assistant,
                },
                text: turn.text.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn at_most_one_turn_in_flight() {
        let mut ctx = SessionContext::new();
        ctx.begin_turn(Speaker::User, now()).unwrap();
        assert!(ctx.begin_turn(Speaker::Agent, now()).is_err());
    }

    #[test]
    fn commit_appends_to_history() {
        let mut ctx = SessionContext::new();
        ctx.begin_turn(Speaker::User, now()).unwrap();
        ctx.set_in_flight_text("hello");
        let turn = ctx.commit_in_flight(now()).unwrap();
        assert_eq!(turn.status, TurnStatus::Committed);
        assert_eq!(ctx.history().len(), 1);
        assert_eq!(ctx.history()[0].text, "hello");
        assert!(ctx.in_flight().is_none());
    }

    #[test]
    fn cancelled_turn_never_enters_history() {
        let mut ctx = SessionContext::new();
        ctx.begin_turn(Speaker::Agent, now()).unwrap();
        ctx.set_in_flight_text("partial response");
        let turn = ctx.cancel_in_flight(now()).unwrap();
        assert_eq!(turn.status, TurnStatus::Cancelled);
        assert!(ctx.history().is_empty());
    }

    #[test]
    fn committed_turns_are_immutable_snapshots() {
        let mut ctx = SessionContext::new();
        ctx.begin_turn(Speaker::User, now()).unwrap();
        ctx.set_in_flight_text("first");
        ctx.commit_in_flight(now()).unwrap();

        // Mutating later in-flight text must not touch history.
        ctx.begin_turn(Speaker::Agent, now()).unwrap();
        ctx.set_in_flight_text("second");
        assert_eq!(ctx.history()[0].text, "first");

        let snap = ctx.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].text, "first");
    }

    #[test]
    fn generation_token_strictly_increases() {
        let mut ctx = SessionContext::new();
        let a = ctx.bump_generation();
        let b = ctx.bump_generation();
        let c = ctx.bump_generation();
        assert!(a < b && b < c);
    }

    #[test]
    fn turn_ids_are_monotonic() {
        let mut ctx = SessionContext::new();
        ctx.begin_turn(Speaker::User, now()).unwrap();
        let first = ctx.commit_in_flight(now()).unwrap().id;
        ctx.begin_turn(Speaker::Agent, now()).unwrap();
        let second = ctx.cancel_in_flight(now()).unwrap().id;
        assert!(second > first);
    }

    #[test]
    fn chat_messages_cap_history() {
        let mut ctx = SessionContext::new();
        for i in 0..5 {
            let speaker = if i % 2 == 0 { Speaker::User } else { Speaker::Agent };
            ctx.begin_turn(speaker, now()).unwrap();
            ctx.set_in_flight_text(&format!("turn {i}"));
            ctx.commit_in_flight(now()).unwrap();
        }
        let messages = ctx.chat_messages(2);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "turn 3");
        assert_eq!(messages[1].text, "turn 4");
        assert_eq!(messages[1].role, ChatRole::User);
    }
}
