//! 上下文同步器
//!
//! 每个作用域一个实例，是该作用域快照的唯一写者。apply_event 同步、确定：
//! 已处理过的事件 id 直接忽略；否则记入有界 FIFO 去重集合（满后淘汰最旧的 id），再按动作更新集合并 +1 版本。
//! 事件经 mpsc 通道交给 run_worker 串行消费，快照以 Arc 通过 watch 发布给读者。

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::sync::event::{EntityAction, EntityEvent};
use crate::sync::snapshot::ContextSnapshot;

/// 默认去重容量
pub const DEFAULT_DEDUP_CAPACITY: usize = 1000;

/// 单条事件的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// id 已处理过
    Duplicate,
    /// 事件属于其他作用域，未处理
    ForeignScope,
}

/// 有界 FIFO 去重集合
///
/// 淘汰后同一 id 再次到达会被重新应用；created / deleted 天然幂等，updated 是按字段合并，重放结果一致。
#[derive(Debug, Clone)]
pub struct ProcessedIds {
    order: VecDeque<String>,
    set: HashSet<String>,
    capacity: usize,
}

impl ProcessedIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(4096)),
            set: HashSet::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }

    /// 记录 id；已存在返回 false
    pub fn insert(&mut self, id: &str) -> bool {
        if !self.set.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.set.clear();
    }
}

/// 单作用域同步器
#[derive(Debug, Clone)]
pub struct ContextSynchronizer {
    snapshot: ContextSnapshot,
    processed: ProcessedIds,
}

impl ContextSynchronizer {
    pub fn new(scope_id: impl Into<String>, dedup_capacity: usize) -> Self {
        Self {
            snapshot: ContextSnapshot::new(scope_id),
            processed: ProcessedIds::new(dedup_capacity),
        }
    }

    pub fn scope_id(&self) -> &str {
        &self.snapshot.scope_id
    }

    pub fn snapshot(&self) -> &ContextSnapshot {
        &self.snapshot
    }

    pub fn processed_len(&self) -> usize {
        self.processed.len()
    }

    /// 应用一条事件；重复 id 不产生任何变化
    pub fn apply_event(&mut self, event: &EntityEvent) -> ApplyOutcome {
        if event.scope_id != self.snapshot.scope_id {
            tracing::warn!(
                event_id = %event.id,
                event_scope = %event.scope_id,
                scope = %self.snapshot.scope_id,
                "dropping event for another scope"
            );
            return ApplyOutcome::ForeignScope;
        }
        if !self.processed.insert(&event.id) {
            tracing::debug!(event_id = %event.id, "duplicate event ignored");
            return ApplyOutcome::Duplicate;
        }

        match self.snapshot.collection_mut(&event.entity_kind) {
            Some(collection) => match event.action {
                EntityAction::Created => {
                    // 重投递时不覆盖已有实体
                    if let Some(payload) = &event.payload {
                        collection
                            .entry(event.entity_id.clone())
                            .or_insert_with(|| payload.clone());
                    }
                }
                EntityAction::Updated => {
                    if let (Some(existing), Some(payload)) =
                        (collection.get_mut(&event.entity_id), &event.payload)
                    {
                        shallow_merge(existing, payload);
                    }
                }
                EntityAction::Deleted => {
                    collection.remove(&event.entity_id);
                }
            },
            None => {
                self.snapshot.stale = true;
            }
        }

        self.snapshot.version += 1;
        self.snapshot.last_applied = Some(event.timestamp);
        tracing::debug!(
            event_id = %event.id,
            kind = %event.entity_kind,
            action = ?event.action,
            version = self.snapshot.version,
            "event applied"
        );
        ApplyOutcome::Applied
    }

    /// 丢弃所有集合与去重记录，回到空快照
    pub fn reset(&mut self) {
        let scope_id = std::mem::take(&mut self.snapshot.scope_id);
        self.snapshot = ContextSnapshot::new(scope_id);
        self.processed.clear();
    }
}

/// 对象按顶层字段合并；任一方不是对象时整体替换
fn shallow_merge(existing: &mut Value, patch: &Value) {
    match (existing, patch) {
        (Value::Object(target), Value::Object(fields)) => {
            for (k, v) in fields {
                target.insert(k.clone(), v.clone());
            }
        }
        (existing, patch) => *existing = patch.clone(),
    }
}

/// 同步器通道上的命令
#[derive(Debug, Clone)]
pub enum SyncCommand {
    Apply(EntityEvent),
    Reset,
}

/// 串行消费命令直到通道关闭或取消；每批命令处理完后发布一次快照
pub async fn run_worker(
    mut sync: ContextSynchronizer,
    mut rx: mpsc::Receiver<SyncCommand>,
    snapshot_tx: watch::Sender<Arc<ContextSnapshot>>,
    cancel: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        let mut changed = handle(&mut sync, command);
        while let Ok(command) = rx.try_recv() {
            changed |= handle(&mut sync, command);
        }
        if changed {
            snapshot_tx.send_replace(Arc::new(sync.snapshot().clone()));
        }
    }
    tracing::info!(scope = %sync.scope_id(), version = sync.snapshot().version, "synchronizer stopped");
}

fn handle(sync: &mut ContextSynchronizer, command: SyncCommand) -> bool {
    match command {
        SyncCommand::Apply(event) => sync.apply_event(&event) == ApplyOutcome::Applied,
        SyncCommand::Reset => {
            sync.reset();
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::event::EntityKind;
    use serde_json::json;

    fn created(id: &str, entity: &str, payload: Value) -> EntityEvent {
        EntityEvent::new(EntityKind::Service, EntityAction::Created, entity, "scope-1")
            .with_id(id)
            .with_payload(payload)
    }

    #[test]
    fn test_duplicate_event_is_idempotent() {
        let mut sync = ContextSynchronizer::new("scope-1", DEFAULT_DEDUP_CAPACITY);
        let event = created("e1", "svc-1", json!({ "name": "billing" }));
        assert_eq!(sync.apply_event(&event), ApplyOutcome::Applied);
        let once = sync.snapshot().clone();
        assert_eq!(sync.apply_event(&event), ApplyOutcome::Duplicate);
        let twice = sync.snapshot();
        assert_eq!(once.version, twice.version);
        assert_eq!(once.services, twice.services);
        assert_eq!(once.last_applied, twice.last_applied);
    }

    #[test]
    fn test_version_counts_distinct_events() {
        let mut sync = ContextSynchronizer::new("scope-1", DEFAULT_DEDUP_CAPACITY);
        for i in 0..25 {
            sync.apply_event(&created(&format!("e{i}"), &format!("svc-{i}"), json!({})));
        }
        assert_eq!(sync.snapshot().version, 25);
        assert_eq!(sync.snapshot().services.len(), 25);
    }

    #[test]
    fn test_created_does_not_overwrite_existing() {
        let mut sync = ContextSynchronizer::new("scope-1", DEFAULT_DEDUP_CAPACITY);
        sync.apply_event(&created("e1", "svc-1", json!({ "name": "first" })));
        sync.apply_event(&created("e2", "svc-1", json!({ "name": "second" })));
        assert_eq!(sync.snapshot().services["svc-1"]["name"], "first");
        assert_eq!(sync.snapshot().version, 2);
    }

    #[test]
    fn test_update_shallow_merges_and_ignores_missing() {
        let mut sync = ContextSynchronizer::new("scope-1", DEFAULT_DEDUP_CAPACITY);
        sync.apply_event(&created("e1", "svc-1", json!({ "name": "billing", "replicas": 1 })));
        let update = EntityEvent::new(EntityKind::Service, EntityAction::Updated, "svc-1", "scope-1")
            .with_id("e2")
            .with_payload(json!({ "replicas": 3, "owner": "ops" }));
        sync.apply_event(&update);
        let svc = &sync.snapshot().services["svc-1"];
        assert_eq!(svc["name"], "billing");
        assert_eq!(svc["replicas"], 3);
        assert_eq!(svc["owner"], "ops");

        let missing = EntityEvent::new(EntityKind::Service, EntityAction::Updated, "svc-404", "scope-1")
            .with_id("e3")
            .with_payload(json!({ "x": 1 }));
        assert_eq!(sync.apply_event(&missing), ApplyOutcome::Applied);
        assert!(sync.snapshot().get(&EntityKind::Service, "svc-404").is_none());

        let no_payload = EntityEvent::new(EntityKind::Service, EntityAction::Updated, "svc-1", "scope-1")
            .with_id("e4");
        sync.apply_event(&no_payload);
        assert_eq!(sync.snapshot().services["svc-1"]["replicas"], 3);
        assert_eq!(sync.snapshot().version, 4);
    }

    #[test]
    fn test_delete_removes_entity() {
        let mut sync = ContextSynchronizer::new("scope-1", DEFAULT_DEDUP_CAPACITY);
        sync.apply_event(&created("e1", "svc-1", json!({})));
        let delete = EntityEvent::new(EntityKind::Service, EntityAction::Deleted, "svc-1", "scope-1")
            .with_id("e2");
        sync.apply_event(&delete);
        assert!(sync.snapshot().services.is_empty());
        assert_eq!(sync.snapshot().version, 2);
    }

    #[test]
    fn test_unknown_kind_bumps_version_and_marks_stale() {
        let mut sync = ContextSynchronizer::new("scope-1", DEFAULT_DEDUP_CAPACITY);
        let event = EntityEvent::new(
            EntityKind::Other("audit_log".into()),
            EntityAction::Created,
            "a1",
            "scope-1",
        )
        .with_id("e1")
        .with_payload(json!({}));
        assert_eq!(sync.apply_event(&event), ApplyOutcome::Applied);
        assert_eq!(sync.snapshot().version, 1);
        assert!(sync.snapshot().stale);
        assert!(sync.snapshot().last_applied.is_some());
    }

    #[test]
    fn test_foreign_scope_is_not_recorded() {
        let mut sync = ContextSynchronizer::new("scope-1", DEFAULT_DEDUP_CAPACITY);
        let event = EntityEvent::new(EntityKind::Form, EntityAction::Created, "f1", "scope-2")
            .with_id("e1")
            .with_payload(json!({}));
        assert_eq!(sync.apply_event(&event), ApplyOutcome::ForeignScope);
        assert_eq!(sync.snapshot().version, 0);
        assert_eq!(sync.processed_len(), 0);
    }

    #[test]
    fn test_bounded_dedup_evicts_oldest() {
        let mut sync = ContextSynchronizer::new("scope-1", 1000);
        for i in 0..1001 {
            sync.apply_event(&created(&format!("e{i}"), &format!("svc-{i}"), json!({})));
        }
        assert!(sync.processed_len() <= 1000);
        assert_eq!(sync.snapshot().version, 1001);

        // 最旧的 e0 已被淘汰，重投递会再次应用（已知限制）
        assert_eq!(
            sync.apply_event(&created("e0", "svc-0", json!({}))),
            ApplyOutcome::Applied
        );
        assert_eq!(sync.snapshot().version, 1002);
        assert_eq!(sync.snapshot().services.len(), 1001);
        // 较新的 id 仍被去重
        assert_eq!(
            sync.apply_event(&created("e1000", "svc-1000", json!({}))),
            ApplyOutcome::Duplicate
        );
    }

    #[test]
    fn test_reset_returns_to_empty() {
        let mut sync = ContextSynchronizer::new("scope-1", DEFAULT_DEDUP_CAPACITY);
        let event = created("e1", "svc-1", json!({}));
        sync.apply_event(&event);
        sync.reset();
        assert_eq!(sync.snapshot().version, 0);
        assert!(sync.snapshot().services.is_empty());
        assert_eq!(sync.scope_id(), "scope-1");
        assert_eq!(sync.processed_len(), 0);
        assert_eq!(sync.apply_event(&event), ApplyOutcome::Applied);
    }

    #[tokio::test]
    async fn test_worker_publishes_snapshots() {
        let sync = ContextSynchronizer::new("scope-1", DEFAULT_DEDUP_CAPACITY);
        let (tx, rx) = mpsc::channel(16);
        let (snap_tx, mut snap_rx) = watch::channel(Arc::new(sync.snapshot().clone()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_worker(sync, rx, snap_tx, cancel.clone()));

        let event = created("e1", "svc-1", json!({ "name": "billing" }));
        tx.send(SyncCommand::Apply(event.clone())).await.unwrap();
        tx.send(SyncCommand::Apply(event)).await.unwrap();
        snap_rx.changed().await.unwrap();
        // 等到两条命令都被消费
        drop(tx);
        handle.await.unwrap();
        let snapshot = snap_rx.borrow().clone();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.services["svc-1"]["name"], "billing");
    }
}
