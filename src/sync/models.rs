//! Sync Data Models
//!
//! Structures shared by the write path, the mutation queue and the reconciler.
//!
//! - Mutation: closed set of writes that can be deferred and replayed
//! - QueueItem: a persisted mutation awaiting replay
//! - FailedMutation: a mutation dropped after a permanent replay failure
//! - SyncStatus: snapshot for indicator banners

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const ARTICLES_COLLECTION: &str = "articles";
pub const PROFILES_COLLECTION: &str = "profiles";

/// Field map carried by create/update mutations
pub type Fields = Map<String, Value>;

// ============================================================================
// Mutations
// ============================================================================

/// Action tag stored alongside each queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationAction {
    CreateArticle,
    UpdateArticle,
    DeleteArticle,
    UpdateProfile,
}

impl MutationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateArticle => "CreateArticle",
            Self::UpdateArticle => "UpdateArticle",
            Self::DeleteArticle => "DeleteArticle",
            Self::UpdateProfile => "UpdateProfile",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CreateArticle" => Some(Self::CreateArticle),
            "UpdateArticle" => Some(Self::UpdateArticle),
            "DeleteArticle" => Some(Self::DeleteArticle),
            "UpdateProfile" => Some(Self::UpdateProfile),
            _ => None,
        }
    }

    /// Remote collection the action writes to
    pub fn collection(&self) -> &'static str {
        match self {
            Self::CreateArticle | Self::UpdateArticle | Self::DeleteArticle => ARTICLES_COLLECTION,
            Self::UpdateProfile => PROFILES_COLLECTION,
        }
    }
}

impl std::fmt::Display for MutationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write against the remote store
///
/// Serialized adjacently tagged so the `action` column and the `payload`
/// column of the queue map one-to-one onto the enum.
///
/// Creates carry a client-chosen id. Later writes queued against the same
/// article target that id, so they stay valid when the create is replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload")]
pub enum Mutation {
    CreateArticle {
        #[serde(default = "new_entity_id")]
        id: String,
        data: Fields,
    },
    UpdateArticle { id: String, changes: Fields },
    DeleteArticle { id: String },
    UpdateProfile { uid: String, changes: Fields },
}

impl Mutation {
    pub fn action(&self) -> MutationAction {
        match self {
            Self::CreateArticle { .. } => MutationAction::CreateArticle,
            Self::UpdateArticle { .. } => MutationAction::UpdateArticle,
            Self::DeleteArticle { .. } => MutationAction::DeleteArticle,
            Self::UpdateProfile { .. } => MutationAction::UpdateProfile,
        }
    }

    pub fn collection(&self) -> &'static str {
        self.action().collection()
    }

    /// Build a create with a fresh client-chosen id
    pub fn create_article(data: Fields) -> Self {
        Self::CreateArticle {
            id: new_entity_id(),
            data,
        }
    }

    /// Id of the entity being written
    pub fn entity_id(&self) -> &str {
        match self {
            Self::CreateArticle { id, .. }
            | Self::UpdateArticle { id, .. }
            | Self::DeleteArticle { id } => id,
            Self::UpdateProfile { uid, .. } => uid,
        }
    }

    /// Payload as stored in the queue (everything except the action tag)
    pub fn payload(&self) -> Result<Value, MutationDecodeError> {
        let mut tagged = serde_json::to_value(self).map_err(|e| MutationDecodeError::InvalidPayload {
            action: self.action().as_str().to_string(),
            reason: e.to_string(),
        })?;

        Ok(tagged
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    /// Rebuild a mutation from its stored action tag and payload
    pub fn from_parts(action: &str, payload: Value) -> Result<Self, MutationDecodeError> {
        if MutationAction::parse(action).is_none() {
            return Err(MutationDecodeError::UnknownAction(action.to_string()));
        }

        let mut tagged = Map::new();
        tagged.insert("action".to_string(), Value::String(action.to_string()));
        tagged.insert("payload".to_string(), payload);

        serde_json::from_value(Value::Object(tagged)).map_err(|e| {
            MutationDecodeError::InvalidPayload {
                action: action.to_string(),
                reason: e.to_string(),
            }
        })
    }
}

/// Ids are assigned on the client so a create queued offline can be
/// referenced by later writes before the server has seen it.
pub fn new_entity_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MutationDecodeError {
    #[error("Unknown mutation action: {0}")]
    UnknownAction(String),

    #[error("Invalid payload for {action}: {reason}")]
    InvalidPayload { action: String, reason: String },
}

// ============================================================================
// Queue Records
// ============================================================================

/// A pending mutation awaiting replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Monotonic queue id, also the replay order
    pub id: i64,
    /// Idempotency key sent with every replay of this item
    pub client_id: String,
    /// Action tag as stored; decoded lazily so a corrupt row only fails itself
    pub action: String,
    /// Raw JSON payload
    pub payload: String,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn mutation(&self) -> Result<Mutation, MutationDecodeError> {
        let payload: Value = serde_json::from_str(&self.payload).map_err(|e| {
            MutationDecodeError::InvalidPayload {
                action: self.action.clone(),
                reason: e.to_string(),
            }
        })?;

        Mutation::from_parts(&self.action, payload)
    }

    pub fn action_kind(&self) -> Option<MutationAction> {
        MutationAction::parse(&self.action)
    }
}

/// A mutation removed from the queue after a permanent failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedMutation {
    pub id: i64,
    /// Queue id the item had when it failed
    pub queue_id: i64,
    pub client_id: String,
    pub action: String,
    pub payload: String,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
}

// ============================================================================
// Results & Status
// ============================================================================

/// Acknowledgement of a mutation applied by the remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAck {
    pub action: MutationAction,
    /// Id of the written entity
    pub entity_id: String,
}

/// Result of submitting a mutation through the write path
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Applied(RemoteAck),
    Queued(QueueItem),
}

impl WriteOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued(_))
    }
}

/// Snapshot of the offline sync subsystem for UI indicators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub online: bool,
    pub syncing: bool,
    pub pending: usize,
    pub failed: usize,
    pub last_errors: Vec<String>,
    pub last_completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_action_parse() {
        for action in [
            MutationAction::CreateArticle,
            MutationAction::UpdateArticle,
            MutationAction::DeleteArticle,
            MutationAction::UpdateProfile,
        ] {
            assert_eq!(MutationAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(MutationAction::parse("PublishArticle"), None);
        assert_eq!(MutationAction::UpdateProfile.collection(), PROFILES_COLLECTION);
    }

    #[test]
    fn test_mutation_parts() {
        let mutation = Mutation::UpdateArticle {
            id: "a1".to_string(),
            changes: fields(json!({"title": "New"})),
        };

        let payload = mutation.payload().unwrap();
        assert_eq!(payload, json!({"id": "a1", "changes": {"title": "New"}}));

        let rebuilt = Mutation::from_parts("UpdateArticle", payload).unwrap();
        assert_eq!(rebuilt, mutation);
        assert_eq!(rebuilt.entity_id(), "a1");
    }

    #[test]
    fn test_create_keeps_client_id() {
        let mutation = Mutation::create_article(fields(json!({"title": "Draft"})));
        let id = mutation.entity_id().to_string();
        assert!(!id.is_empty());

        let payload = mutation.payload().unwrap();
        assert_eq!(payload["id"], json!(id));

        // Decoding the stored payload must not mint a new id
        let rebuilt = Mutation::from_parts("CreateArticle", payload).unwrap();
        assert_eq!(rebuilt.entity_id(), id);

        // A payload without an id is assigned one
        let legacy = Mutation::from_parts("CreateArticle", json!({"data": {"title": "A"}})).unwrap();
        assert!(!legacy.entity_id().is_empty());
    }

    #[test]
    fn test_unknown_action_rejected() {
        let err = Mutation::from_parts("PublishArticle", json!({"id": "a1"})).unwrap_err();
        assert_eq!(err, MutationDecodeError::UnknownAction("PublishArticle".to_string()));
    }

    #[test]
    fn test_invalid_payload_rejected() {
        let err = Mutation::from_parts("DeleteArticle", json!({"title": "X"})).unwrap_err();
        assert!(matches!(err, MutationDecodeError::InvalidPayload { .. }));
    }

    #[test]
    fn test_queue_item_decodes_lazily() {
        let item = QueueItem {
            id: 1,
            client_id: "c1".to_string(),
            action: "CreateArticle".to_string(),
            payload: "{not json".to_string(),
            enqueued_at: Utc::now(),
            retry_count: 0,
            last_error: None,
        };

        assert_eq!(item.action_kind(), Some(MutationAction::CreateArticle));
        assert!(item.mutation().is_err());
    }
}
