use crate::task::error::{TaskError, TaskResult};
use crate::task::types::TaskStatus;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskEvent {
    Queue,
    Start,
    Pause,
    Resume,
    Complete,
    Fail,
    Cancel,
}

/// Who is applying a transition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Actor {
    Orchestrator,
    Worker,
    Collector,
    User,
}

struct Transition {
    from: TaskStatus,
    event: TaskEvent,
    to: TaskStatus,
    actors: &'static [Actor],
}

const EXECUTORS: &[Actor] = &[Actor::Worker, Actor::Collector];

const TRANSITIONS: &[Transition] = &[
    Transition {
        from: TaskStatus::Pending,
        event: TaskEvent::Queue,
        to: TaskStatus::Queued,
        actors: &[Actor::Orchestrator],
    },
    Transition {
        from: TaskStatus::Queued,
        event: TaskEvent::Start,
        to: TaskStatus::Running,
        actors: EXECUTORS,
    },
    Transition {
        from: TaskStatus::Running,
        event: TaskEvent::Pause,
        to: TaskStatus::Paused,
        actors: &[Actor::Worker],
    },
    Transition {
        from: TaskStatus::Paused,
        event: TaskEvent::Resume,
        to: TaskStatus::Running,
        actors: EXECUTORS,
    },
    Transition {
        from: TaskStatus::Running,
        event: TaskEvent::Complete,
        to: TaskStatus::Completed,
        actors: EXECUTORS,
    },
    Transition {
        from: TaskStatus::Running,
        event: TaskEvent::Fail,
        to: TaskStatus::Failed,
        actors: EXECUTORS,
    },
];

/// Cancel is accepted from every non-terminal status. The collector only
/// cancels an aggregate whose children all ended cancelled.
const CANCELLERS: &[Actor] = &[Actor::User, Actor::Orchestrator, Actor::Collector];

/// Central transition table for [`TaskStatus`].
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Resolve the status reached by applying `event` as `actor`.
    pub fn next(
        task_id: i64,
        from: TaskStatus,
        event: TaskEvent,
        actor: Actor,
    ) -> TaskResult<TaskStatus> {
        if event == TaskEvent::Cancel {
            if !CANCELLERS.contains(&actor) {
                return Err(TaskError::Unauthorized { actor, event });
            }
            if from.is_terminal() {
                return Err(TaskError::InvalidTransition {
                    task_id,
                    from,
                    event,
                });
            }
            return Ok(TaskStatus::Cancelled);
        }

        let transition = TRANSITIONS
            .iter()
            .find(|t| t.from == from && t.event == event)
            .ok_or(TaskError::InvalidTransition {
                task_id,
                from,
                event,
            })?;

        if !transition.actors.contains(&actor) {
            return Err(TaskError::Unauthorized { actor, event });
        }
        Ok(transition.to)
    }

    /// Event that moves a task in `from` back to RUNNING, if any
    pub fn resume_event(from: TaskStatus) -> Option<TaskEvent> {
        match from {
            TaskStatus::Queued => Some(TaskEvent::Start),
            TaskStatus::Paused => Some(TaskEvent::Resume),
            _ => None,
        }
    }
}
