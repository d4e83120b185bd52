//! Realtime pipeline: message types and the turn coordinator.

pub mod coordinator;
pub mod messages;

pub use coordinator::{Collaborators, CoordinatorState, TurnCoordinator};
pub use messages::{PipelineEvent, SessionNotice};
