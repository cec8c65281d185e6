//! Event state machine interface and its in-memory implementation

use std::sync::{PoisonError, RwLock};
use tracing::info;

use crate::error::{EventError, Result};
use crate::state::EventState;

/// The external state machine driving a quiz run.
///
/// Implementations validate every normal transition against
/// [`EventState::successors`]; `jump_to_state` is the only way around the
/// graph and is reserved for recovery.
pub trait EventStateMachine: Send + Sync {
    fn current_state(&self) -> EventState;

    /// Current progress index (1-based, 0 before the first question).
    fn question_number(&self) -> u32;

    fn total_questions(&self) -> u32;

    fn can_transition_to(&self, next: EventState) -> bool;

    /// Move along the graph. Entering `question_active` advances the
    /// progress index to the next question.
    fn transition_to(&self, next: EventState) -> Result<()>;

    /// Force the machine into `state` regardless of the graph.
    fn jump_to_state(&self, state: EventState);

    /// Set the progress index; must be within `0..=total_questions`.
    fn set_question_number(&self, number: u32) -> Result<()>;

    /// Advance the progress index by one and return the new value.
    fn next_question(&self) -> Result<u32>;

    fn available_actions(&self) -> Vec<EventState>;
}

#[derive(Debug, Clone)]
struct MachineState {
    state: EventState,
    question_number: u32,
    total_questions: u32,
}

/// Thread-safe state machine holding everything in memory.
pub struct InMemoryStateMachine {
    inner: RwLock<MachineState>,
}

impl InMemoryStateMachine {
    /// Create a machine in `waiting` for a quiz of `total_questions`.
    pub fn new(total_questions: u32) -> Self {
        Self {
            inner: RwLock::new(MachineState {
                state: EventState::Waiting,
                question_number: 0,
                total_questions,
            }),
        }
    }

    fn read(&self) -> MachineState {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Test hook: set the progress index without range validation.
    pub fn force_question_number(&self, number: u32) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.question_number = number;
    }
}

impl EventStateMachine for InMemoryStateMachine {
    fn current_state(&self) -> EventState {
        self.read().state
    }

    fn question_number(&self) -> u32 {
        self.read().question_number
    }

    fn total_questions(&self) -> u32 {
        self.read().total_questions
    }

    fn can_transition_to(&self, next: EventState) -> bool {
        self.read().state.can_transition_to(next)
    }

    fn transition_to(&self, next: EventState) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let from = inner.state;
        if !from.can_transition_to(next) {
            return Err(EventError::InvalidTransition { from, to: next });
        }

        if next == EventState::QuestionActive {
            let number = inner.question_number + 1;
            if number > inner.total_questions {
                return Err(EventError::QuestionOutOfRange {
                    number,
                    total: inner.total_questions,
                });
            }
            inner.question_number = number;
        }

        inner.state = next;
        info!("Event state {} -> {} (question {})", from, next, inner.question_number);
        Ok(())
    }

    fn jump_to_state(&self, state: EventState) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        info!("Event state forced {} -> {}", inner.state, state);
        inner.state = state;
    }

    fn set_question_number(&self, number: u32) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if number > inner.total_questions {
            return Err(EventError::QuestionOutOfRange {
                number,
                total: inner.total_questions,
            });
        }
        inner.question_number = number;
        Ok(())
    }

    fn next_question(&self) -> Result<u32> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let number = inner.question_number + 1;
        if number > inner.total_questions {
            return Err(EventError::QuestionOutOfRange {
                number,
                total: inner.total_questions,
            });
        }
        inner.question_number = number;
        Ok(number)
    }

    fn available_actions(&self) -> Vec<EventState> {
        let inner = self.read();
        inner
            .state
            .successors()
            .iter()
            .copied()
            .filter(|next| {
                *next != EventState::QuestionActive
                    || inner.question_number < inner.total_questions
            })
            .collect()
    }
}
