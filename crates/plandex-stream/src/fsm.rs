use plandex_core::PlanStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamState {
    Replying,
    Describing,
    Finished,
    Aborted,
    Canceled,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamEvent {
    Describe,
    Resume,
    Finish,
    Abort,
    Cancel,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid stream transition: {event:?} while {from:?}")]
pub struct InvalidTransition {
    pub from: StreamState,
    pub event: StreamEvent,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamState::Finished | StreamState::Aborted | StreamState::Canceled | StreamState::Error
        )
    }

    /// Aborted, canceled and failed streams must not be followed by a commit.
    pub fn suppresses_commit(&self) -> bool {
        matches!(
            self,
            StreamState::Aborted | StreamState::Canceled | StreamState::Error
        )
    }

    pub fn plan_status(&self) -> PlanStatus {
        match self {
            StreamState::Replying => PlanStatus::Replying,
            StreamState::Describing => PlanStatus::Describing,
            StreamState::Finished => PlanStatus::Finished,
            StreamState::Aborted | StreamState::Canceled => PlanStatus::Stopped,
            StreamState::Error => PlanStatus::Error,
        }
    }

    /// State to resume from when joining a stream the server reports as `status`.
    pub fn from_plan_status(status: PlanStatus) -> Option<StreamState> {
        match status {
            PlanStatus::Replying | PlanStatus::MissingFile => Some(StreamState::Replying),
            PlanStatus::Describing | PlanStatus::Building => Some(StreamState::Describing),
            PlanStatus::Finished => Some(StreamState::Finished),
            PlanStatus::Stopped => Some(StreamState::Aborted),
            PlanStatus::Error => Some(StreamState::Error),
            PlanStatus::Draft => None,
        }
    }
}

impl StreamEvent {
    /// The state this event leads to whenever it is accepted.
    pub fn target(&self) -> StreamState {
        match self {
            StreamEvent::Describe => StreamState::Describing,
            StreamEvent::Resume => StreamState::Replying,
            StreamEvent::Finish => StreamState::Finished,
            StreamEvent::Abort => StreamState::Aborted,
            StreamEvent::Cancel => StreamState::Canceled,
            StreamEvent::Error => StreamState::Error,
        }
    }
}

pub fn step(state: StreamState, event: StreamEvent) -> Result<StreamState, InvalidTransition> {
    use StreamEvent as E;
    use StreamState as S;
    let allowed = matches!(
        (state, event),
        (S::Replying, E::Describe)
            | (S::Describing, E::Resume)
            | (S::Replying | S::Describing, E::Finish)
            | (S::Replying | S::Describing, E::Abort)
            | (S::Replying | S::Describing, E::Cancel)
            | (S::Replying | S::Describing, E::Error)
    );
    if allowed {
        Ok(event.target())
    } else {
        Err(InvalidTransition { from: state, event })
    }
}
