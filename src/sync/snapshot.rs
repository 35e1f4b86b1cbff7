//! 作用域上下文快照：每种实体类型一个按 id 索引的集合 + 单调版本号

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::sync::event::EntityKind;

/// 某个作用域的去重、带版本的实体快照
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextSnapshot {
    pub scope_id: String,
    pub services: HashMap<String, Value>,
    pub forms: HashMap<String, Value>,
    pub workflows: HashMap<String, Value>,
    pub registrations: HashMap<String, Value>,
    /// 每成功应用一条非重复事件 +1，只增不减
    pub version: u64,
    pub last_applied: Option<DateTime<Utc>>,
    /// 应用过没有专属集合的事件，读者应考虑重新拉取
    pub stale: bool,
}

/// 快照摘要（日志 / CLI 输出）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotSummary {
    pub scope_id: String,
    pub version: u64,
    pub services: usize,
    pub forms: usize,
    pub workflows: usize,
    pub registrations: usize,
    pub stale: bool,
}

impl ContextSnapshot {
    pub fn new(scope_id: impl Into<String>) -> Self {
        Self {
            scope_id: scope_id.into(),
            ..Self::default()
        }
    }

    pub fn collection(&self, kind: &EntityKind) -> Option<&HashMap<String, Value>> {
        match kind {
            EntityKind::Service => Some(&self.services),
            EntityKind::Form => Some(&self.forms),
            EntityKind::Workflow => Some(&self.workflows),
            EntityKind::Registration => Some(&self.registrations),
            EntityKind::Other(_) => None,
        }
    }

    pub fn collection_mut(&mut self, kind: &EntityKind) -> Option<&mut HashMap<String, Value>> {
        match kind {
            EntityKind::Service => Some(&mut self.services),
            EntityKind::Form => Some(&mut self.forms),
            EntityKind::Workflow => Some(&mut self.workflows),
            EntityKind::Registration => Some(&mut self.registrations),
            EntityKind::Other(_) => None,
        }
    }

    pub fn get(&self, kind: &EntityKind, id: &str) -> Option<&Value> {
        self.collection(kind).and_then(|c| c.get(id))
    }

    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            scope_id: self.scope_id.clone(),
            version: self.version,
            services: self.services.len(),
            forms: self.forms.len(),
            workflows: self.workflows.len(),
            registrations: self.registrations.len(),
            stale: self.stale,
        }
    }
}
