use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::MessageRole;

/// One turn in a conversation.
///
/// `raw_content` is what the source delivered and is kept for audit only.
/// `display_content` is the derived, render-safe text and is the only value
/// bound to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: Option<String>,
    pub role: MessageRole,
    pub raw_content: String,
    #[serde(default)]
    pub display_content: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    pub turn_index: u64,
    /// Assigned by the client when the turn was sent; survives the server echo.
    #[serde(default)]
    pub client_turn_id: Option<Uuid>,
}

impl Message {
    /// A message whose display text has not been derived yet.
    /// The merge engine derives it before the message can be stored.
    pub fn new(role: MessageRole, raw_content: impl Into<String>, turn_index: u64) -> Self {
        let raw_content = raw_content.into();
        Self {
            id: None,
            role,
            display_content: raw_content.clone(),
            raw_content,
            metadata: None,
            created_at: None,
            turn_index,
            client_turn_id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn with_client_turn_id(mut self, client_turn_id: Uuid) -> Self {
        self.client_turn_id = Some(client_turn_id);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_assistant(&self) -> bool {
        self.role == MessageRole::Assistant
    }

    /// Identity used to recognise redeliveries of the same logical turn.
    ///
    /// Preference order: server id, then `(role, created_at, turn_index)`,
    /// then the client turn id, then `(role, turn_index)` as a last resort.
    /// Content never participates: two distinct turns may share text.
    pub fn dedup_key(&self) -> DedupKey {
        if let Some(id) = self.id.as_deref().filter(|id| !id.trim().is_empty()) {
            return DedupKey::Id(id.to_string());
        }
        if let Some(created_at) = self.created_at {
            return DedupKey::Turn {
                role: self.role,
                created_at,
                turn_index: self.turn_index,
            };
        }
        if let Some(client_turn_id) = self.client_turn_id {
            return DedupKey::ClientTurn(client_turn_id);
        }
        DedupKey::Position {
            role: self.role,
            turn_index: self.turn_index,
        }
    }
}

/// The identifier that says two deliveries are the same conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DedupKey {
    Id(String),
    Turn {
        role: MessageRole,
        created_at: DateTime<Utc>,
        turn_index: u64,
    },
    ClientTurn(Uuid),
    Position {
        role: MessageRole,
        turn_index: u64,
    },
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id:{id}"),
            Self::Turn {
                role,
                created_at,
                turn_index,
            } => write!(f, "turn:{role}:{}:{turn_index}", created_at.timestamp_millis()),
            Self::ClientTurn(id) => write!(f, "client:{id}"),
            Self::Position { role, turn_index } => write!(f, "pos:{role}:{turn_index}"),
        }
    }
}
