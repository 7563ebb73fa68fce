//! Transaction Pipeline State Definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline states
///
/// ```text
/// Created → PreProcessing → Processing → PostProcessing → Completed
///                 │               │
///                 └───────────────┴──► Failed | Cancelled
/// ```
///
/// Terminal: COMPLETED, FAILED, CANCELLED. Compensation after FAILED or
/// CANCELLED is an action, not a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Created,
    /// Validation, authentication, authorization, business rules
    PreProcessing,
    /// Execution hook and token minting
    Processing,
    /// Audit, events, post hooks. Outcome is already fixed.
    PostProcessing,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Completed | TransactionState::Failed | TransactionState::Cancelled
        )
    }

    /// Steps in this state may still be aborted by cancellation
    #[inline]
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            TransactionState::Created
                | TransactionState::PreProcessing
                | TransactionState::Processing
        )
    }

    /// One-directional transition table
    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, next),
            (Created, PreProcessing)
                | (Created, Failed)
                | (Created, Cancelled)
                | (PreProcessing, Processing)
                | (PreProcessing, Failed)
                | (PreProcessing, Cancelled)
                | (Processing, PostProcessing)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (PostProcessing, Completed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Created => "CREATED",
            TransactionState::PreProcessing => "PRE_PROCESSING",
            TransactionState::Processing => "PROCESSING",
            TransactionState::PostProcessing => "POST_PROCESSING",
            TransactionState::Completed => "COMPLETED",
            TransactionState::Failed => "FAILED",
            TransactionState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransactionState::*;

    const ALL: [TransactionState; 7] = [
        Created,
        PreProcessing,
        Processing,
        PostProcessing,
        Completed,
        Failed,
        Cancelled,
    ];

    #[test]
    fn test_terminal_states() {
        assert!(Completed.is_terminal());
        assert!(Failed.is_terminal());
        assert!(Cancelled.is_terminal());

        assert!(!Created.is_terminal());
        assert!(!PreProcessing.is_terminal());
        assert!(!Processing.is_terminal());
        assert!(!PostProcessing.is_terminal());
    }

    #[test]
    fn test_terminal_states_have_no_exit() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_happy_path() {
        assert!(Created.can_transition_to(PreProcessing));
        assert!(PreProcessing.can_transition_to(Processing));
        assert!(Processing.can_transition_to(PostProcessing));
        assert!(PostProcessing.can_transition_to(Completed));
    }

    #[test]
    fn test_no_backward_or_skipping() {
        assert!(!Processing.can_transition_to(PreProcessing));
        assert!(!PostProcessing.can_transition_to(Processing));
        assert!(!Created.can_transition_to(Processing));
        assert!(!PreProcessing.can_transition_to(Completed));
    }

    #[test]
    fn test_post_processing_cannot_fail() {
        assert!(!PostProcessing.can_transition_to(Failed));
        assert!(!PostProcessing.can_transition_to(Cancelled));
        assert!(!PostProcessing.is_cancellable());
    }

    #[test]
    fn test_display_and_serde() {
        assert_eq!(PreProcessing.to_string(), "PRE_PROCESSING");
        assert_eq!(
            serde_json::to_string(&PostProcessing).unwrap(),
            "\"POST_PROCESSING\""
        );
        for state in ALL {
            assert_eq!(
                serde_json::to_value(state).unwrap(),
                serde_json::Value::String(state.as_str().to_string())
            );
        }
    }
}
