//! Quiz run states and the fixed transition graph between them.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::EventError;

/// Every state a quiz run can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    Waiting,
    Started,
    TitleDisplay,
    TeamAssignment,
    QuestionActive,
    CountdownActive,
    AnswerStats,
    AnswerReveal,
    Results,
    Celebration,
    Finished,
}

impl EventState {
    pub const ALL: [EventState; 11] = [
        EventState::Waiting,
        EventState::Started,
        EventState::TitleDisplay,
        EventState::TeamAssignment,
        EventState::QuestionActive,
        EventState::CountdownActive,
        EventState::AnswerStats,
        EventState::AnswerReveal,
        EventState::Results,
        EventState::Celebration,
        EventState::Finished,
    ];

    /// Wire label of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Waiting => "waiting",
            EventState::Started => "started",
            EventState::TitleDisplay => "title_display",
            EventState::TeamAssignment => "team_assignment",
            EventState::QuestionActive => "question_active",
            EventState::CountdownActive => "countdown_active",
            EventState::AnswerStats => "answer_stats",
            EventState::AnswerReveal => "answer_reveal",
            EventState::Results => "results",
            EventState::Celebration => "celebration",
            EventState::Finished => "finished",
        }
    }

    /// States reachable from `self` through a normal transition.
    pub fn successors(&self) -> &'static [EventState] {
        use EventState::*;
        match self {
            Waiting => &[Started],
            Started => &[TitleDisplay, TeamAssignment, QuestionActive],
            TitleDisplay => &[TeamAssignment, QuestionActive],
            TeamAssignment => &[TitleDisplay, QuestionActive],
            QuestionActive => &[CountdownActive, AnswerStats],
            CountdownActive => &[AnswerStats],
            AnswerStats => &[AnswerReveal],
            AnswerReveal => &[QuestionActive, Results],
            Results => &[Celebration, Finished],
            Celebration => &[Finished],
            Finished => &[],
        }
    }

    pub fn can_transition_to(&self, next: EventState) -> bool {
        self.successors().contains(&next)
    }

    /// States in which a question is on screen and the progress index must
    /// point at a real question.
    pub fn is_question_phase(&self) -> bool {
        matches!(
            self,
            EventState::QuestionActive
                | EventState::CountdownActive
                | EventState::AnswerStats
                | EventState::AnswerReveal
        )
    }
}

impl Default for EventState {
    fn default() -> Self {
        EventState::Waiting
    }
}

impl std::fmt::Display for EventState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventState {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        EventState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == needle)
            .ok_or_else(|| EventError::UnknownState(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_round_trip_through_from_str() {
        for state in EventState::ALL {
            assert_eq!(state.as_str().parse::<EventState>().unwrap(), state);
        }
        assert!(matches!(
            "intermission".parse::<EventState>(),
            Err(EventError::UnknownState(_))
        ));
    }

    #[test]
    fn test_serde_uses_snake_case_labels() {
        let json = serde_json::to_string(&EventState::QuestionActive).unwrap();
        assert_eq!(json, "\"question_active\"");
    }

    #[test]
    fn test_graph_edges() {
        assert!(EventState::Waiting.can_transition_to(EventState::Started));
        assert!(!EventState::Waiting.can_transition_to(EventState::QuestionActive));
        assert!(EventState::AnswerReveal.can_transition_to(EventState::QuestionActive));
        assert!(EventState::Finished.successors().is_empty());
    }

    #[test]
    fn test_every_state_except_finished_has_a_way_forward() {
        for state in EventState::ALL {
            if state != EventState::Finished {
                assert!(!state.successors().is_empty(), "{state} is a dead end");
            }
        }
    }
}
