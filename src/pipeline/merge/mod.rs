pub mod engine;
pub mod refetch;
pub mod session;

pub use engine::{MergeEngine, MergeOutcome};
pub use refetch::{refetch_and_replace, ConversationFetcher, RefetchPolicy};
pub use session::{ConversationSession, Delivery, SessionHandle, SessionView};

use serde::Serialize;
use thiserror::Error;

/// Failure reported by the conversation-fetch collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Conversation fetch failed: {0}")]
    Unavailable(String),
}

/// Why the session gave up on obtaining safe content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MustRefreshReason {
    AttemptsExhausted,
    TimedOut,
}

impl std::fmt::Display for MustRefreshReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AttemptsExhausted => write!(f, "attempts exhausted"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// Terminal: safe content could not be obtained. The UI shows a
    /// "please refresh" notice and keeps the last safe sequence.
    #[error("Conversation must be refreshed after {attempts} refetch attempt(s): {reason}")]
    MustRefresh {
        attempts: u32,
        reason: MustRefreshReason,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Conversation session is closed")]
    Closed,
}
