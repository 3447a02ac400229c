use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::workflow::step::{SelectionField, WorkflowStep};

pub fn session_key(session_id: &str) -> String {
    format!("renewal_session:{session_id}")
}

pub fn staff_index_key(staff_id: &str) -> String {
    format!("staff_renewal_sessions:{staff_id}")
}

/// Session ids embed the owning employee for traceability.
pub fn new_session_id(staff_id: &str) -> String {
    format!("renewal_{staff_id}_{}", Uuid::new_v4().simple())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSession {
    pub session_id: String,
    pub staff_id: String,
    pub current_step: WorkflowStep,
    #[serde(default)]
    pub customer_selection: Map<String, Value>,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSession {
    pub fn new(staff_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        let staff_id = staff_id.into();
        Self {
            session_id: new_session_id(&staff_id),
            staff_id,
            current_step: WorkflowStep::Init,
            customer_selection: Map::new(),
            chat_history: Vec::new(),
            metadata: Map::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// A present, non-null selection value. Nulled fields read as absent.
    pub fn selection(&self, field: SelectionField) -> Option<&Value> {
        self.customer_selection.get(field.as_str()).filter(|value| !value.is_null())
    }

    pub fn selection_str(&self, field: SelectionField) -> Option<&str> {
        self.selection(field).and_then(Value::as_str)
    }

    pub fn has_selection(&self, field: SelectionField) -> bool {
        self.selection(field).is_some()
    }

    pub fn is_owned_by(&self, staff_id: &str) -> bool {
        self.staff_id == staff_id
    }
}

/// Top-level fields merged by `update_session`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionPatch {
    pub metadata: Map<String, Value>,
    pub chat_history: Option<Vec<ChatMessage>>,
}

impl SessionPatch {
    pub fn metadata(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::default().with_metadata(key, value)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
