//! 实体变更事件

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 实体类型；没有专属集合的类型落入 Other
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityKind {
    Service,
    Form,
    Workflow,
    Registration,
    Other(String),
}

impl From<String> for EntityKind {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "service" | "services" => EntityKind::Service,
            "form" | "forms" => EntityKind::Form,
            "workflow" | "workflows" => EntityKind::Workflow,
            "registration" | "registrations" => EntityKind::Registration,
            _ => EntityKind::Other(s),
        }
    }
}

impl From<EntityKind> for String {
    fn from(kind: EntityKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Service => f.write_str("service"),
            EntityKind::Form => f.write_str("form"),
            EntityKind::Workflow => f.write_str("workflow"),
            EntityKind::Registration => f.write_str("registration"),
            EntityKind::Other(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityAction {
    Created,
    Updated,
    Deleted,
}

/// 推送的实体变更；id 全局唯一，用于去重
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityEvent {
    pub id: String,
    pub entity_kind: EntityKind,
    pub action: EntityAction,
    pub entity_id: String,
    pub scope_id: String,
    #[serde(default)]
    pub actor_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub previous: Option<Value>,
}

impl EntityEvent {
    pub fn new(
        entity_kind: EntityKind,
        action: EntityAction,
        entity_id: impl Into<String>,
        scope_id: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("evt_{}", uuid::Uuid::new_v4()),
            entity_kind,
            action,
            entity_id: entity_id.into(),
            scope_id: scope_id.into(),
            actor_id: None,
            timestamp: Utc::now(),
            payload: None,
            previous: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }
}
