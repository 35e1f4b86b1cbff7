//! 多作用域同步中心
//!
//! 每个作用域独立一套「同步器任务 + 命令通道 + 快照 watch」，作用域之间没有任何共享锁。
//! subscribe 创建快照并启动同步器，unsubscribe 停止并丢弃；reset 也经由同一通道下发，保持单写者顺序。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::SyncSection;
use crate::core::CopilotError;
use crate::sync::event::EntityEvent;
use crate::sync::feed::{EventSource, FeedStatus, FeedSupervisor, ReconnectPolicy};
use crate::sync::snapshot::ContextSnapshot;
use crate::sync::synchronizer::{run_worker, ContextSynchronizer, SyncCommand};

struct ScopeHandle {
    tx: mpsc::Sender<SyncCommand>,
    snapshot_rx: watch::Receiver<Arc<ContextSnapshot>>,
    feed_status: Option<watch::Receiver<FeedStatus>>,
    cancel: CancellationToken,
}

pub struct SyncHub {
    scopes: RwLock<HashMap<String, ScopeHandle>>,
    config: SyncSection,
    cancel: CancellationToken,
}

impl SyncHub {
    pub fn new(config: SyncSection) -> Self {
        Self {
            scopes: RwLock::new(HashMap::new()),
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// 订阅作用域（已订阅则直接返回现有快照接收端）
    pub async fn subscribe(&self, scope_id: &str) -> watch::Receiver<Arc<ContextSnapshot>> {
        let mut scopes = self.scopes.write().await;
        if let Some(handle) = scopes.get(scope_id) {
            return handle.snapshot_rx.clone();
        }

        let sync = ContextSynchronizer::new(scope_id, self.config.dedup_capacity);
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(sync.snapshot().clone()));
        let cancel = self.cancel.child_token();
        tokio::spawn(run_worker(sync, rx, snapshot_tx, cancel.clone()));
        tracing::info!(scope = %scope_id, "scope subscribed");

        scopes.insert(
            scope_id.to_string(),
            ScopeHandle {
                tx,
                snapshot_rx: snapshot_rx.clone(),
                feed_status: None,
                cancel,
            },
        );
        snapshot_rx
    }

    /// 订阅并接入事件源；已有事件源的作用域不会重复接入
    pub async fn subscribe_feed(
        &self,
        scope_id: &str,
        source: Arc<dyn EventSource>,
    ) -> watch::Receiver<Arc<ContextSnapshot>> {
        let snapshot_rx = self.subscribe(scope_id).await;
        let mut scopes = self.scopes.write().await;
        if let Some(handle) = scopes.get_mut(scope_id) {
            if handle.feed_status.is_none() {
                let (supervisor, status_rx) =
                    FeedSupervisor::new(source, ReconnectPolicy::from(&self.config));
                tokio::spawn(supervisor.run(
                    scope_id.to_string(),
                    handle.tx.clone(),
                    handle.cancel.clone(),
                ));
                handle.feed_status = Some(status_rx);
            }
        }
        snapshot_rx
    }

    /// 停止同步器并丢弃快照
    pub async fn unsubscribe(&self, scope_id: &str) -> bool {
        match self.scopes.write().await.remove(scope_id) {
            Some(handle) => {
                handle.cancel.cancel();
                tracing::info!(scope = %scope_id, "scope unsubscribed");
                true
            }
            None => false,
        }
    }

    /// 作用域命令通道的发送端（供外部事件源直接投递）
    pub async fn sender(&self, scope_id: &str) -> Result<mpsc::Sender<SyncCommand>, CopilotError> {
        self.scopes
            .read()
            .await
            .get(scope_id)
            .map(|h| h.tx.clone())
            .ok_or_else(|| CopilotError::ScopeNotSubscribed(scope_id.to_string()))
    }

    /// 手工投递事件（测试或非推送来源）
    pub async fn apply(&self, event: EntityEvent) -> Result<(), CopilotError> {
        let scope_id = event.scope_id.clone();
        let tx = self.sender(&scope_id).await?;
        tx.send(SyncCommand::Apply(event))
            .await
            .map_err(|_| CopilotError::ScopeNotSubscribed(scope_id))
    }

    pub async fn reset(&self, scope_id: &str) -> Result<(), CopilotError> {
        let tx = self.sender(scope_id).await?;
        tx.send(SyncCommand::Reset)
            .await
            .map_err(|_| CopilotError::ScopeNotSubscribed(scope_id.to_string()))
    }

    /// 最新快照（不等待未消费的事件）
    pub async fn snapshot(&self, scope_id: &str) -> Option<Arc<ContextSnapshot>> {
        self.scopes
            .read()
            .await
            .get(scope_id)
            .map(|h| h.snapshot_rx.borrow().clone())
    }

    pub async fn watch(&self, scope_id: &str) -> Option<watch::Receiver<Arc<ContextSnapshot>>> {
        self.scopes
            .read()
            .await
            .get(scope_id)
            .map(|h| h.snapshot_rx.clone())
    }

    pub async fn feed_status(&self, scope_id: &str) -> Option<FeedStatus> {
        self.scopes
            .read()
            .await
            .get(scope_id)
            .and_then(|h| h.feed_status.as_ref())
            .map(|rx| rx.borrow().clone())
    }

    pub async fn scopes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scopes.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// 停止所有作用域
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.scopes.write().await.clear();
    }
}
