//! 人工确认协调器
//!
//! 串行化高风险动作的人工审批：任一时刻最多一个「当前」确认项，其余严格 FIFO 排队。
//! request 返回 ConfirmationTicket，调用方在 ticket 上协作式挂起；resolve 只对当前项生效（忽略过期回调），
//! clear_all 把当前项与队列全部以拒绝结束。展示层通过 watch 订阅当前项与队列长度。

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex};

/// 拒绝原因
pub const REASON_USER_REJECTED: &str = "user_rejected";
pub const REASON_TIMEOUT: &str = "timeout";
pub const REASON_CLEARED: &str = "cleared";
pub const REASON_ABORTED: &str = "aborted";

/// 展示给操作员的风险等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// 确认请求
#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub action_name: String,
    pub description: String,
    pub args: Value,
    pub risk: RiskLevel,
}

/// 排队中的确认项
#[derive(Debug, Clone, Serialize)]
pub struct PendingConfirmation {
    pub id: String,
    pub action_name: String,
    pub description: String,
    /// 请求时的参数快照
    pub args: Value,
    pub risk: RiskLevel,
    /// 到达顺序
    pub seq: u64,
    pub requested_at: DateTime<Utc>,
}

/// 确认结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationOutcome {
    pub id: String,
    pub confirmed: bool,
    pub reason: Option<String>,
}

impl ConfirmationOutcome {
    fn rejected(id: &str, reason: &str) -> Self {
        Self {
            id: id.to_string(),
            confirmed: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// 展示层看到的状态
#[derive(Debug, Clone, Default)]
pub struct ConfirmationView {
    pub current: Option<PendingConfirmation>,
    pub queue_len: usize,
}

/// 调用方持有的等待句柄
#[derive(Debug)]
pub struct ConfirmationTicket {
    pub id: String,
    rx: oneshot::Receiver<ConfirmationOutcome>,
}

impl ConfirmationTicket {
    /// 等待裁决；协调器被丢弃时视为拒绝
    pub async fn wait(&mut self) -> ConfirmationOutcome {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            Err(_) => ConfirmationOutcome::rejected(&self.id, REASON_ABORTED),
        }
    }
}

struct Entry {
    item: PendingConfirmation,
    tx: oneshot::Sender<ConfirmationOutcome>,
}

impl Entry {
    fn finish(self, confirmed: bool, reason: Option<String>) {
        let outcome = ConfirmationOutcome {
            id: self.item.id,
            confirmed,
            reason,
        };
        // 接收端已放弃等待时忽略
        let _ = self.tx.send(outcome);
    }
}

#[derive(Default)]
struct Inner {
    current: Option<Entry>,
    queue: VecDeque<Entry>,
    next_seq: u64,
}

impl Inner {
    fn view(&self) -> ConfirmationView {
        ConfirmationView {
            current: self.current.as_ref().map(|e| e.item.clone()),
            queue_len: self.queue.len(),
        }
    }

    fn promote(&mut self) {
        self.current = self.queue.pop_front();
    }
}

/// 确认协调器：idle（无当前项）⇄ awaiting（有一个当前项）
pub struct ConfirmationCoordinator {
    inner: Mutex<Inner>,
    view_tx: watch::Sender<ConfirmationView>,
}

impl Default for ConfirmationCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmationCoordinator {
    pub fn new() -> Self {
        let (view_tx, _) = watch::channel(ConfirmationView::default());
        Self {
            inner: Mutex::new(Inner::default()),
            view_tx,
        }
    }

    /// 订阅当前项与队列长度
    pub fn subscribe(&self) -> watch::Receiver<ConfirmationView> {
        self.view_tx.subscribe()
    }

    /// 发起确认：空闲时立即成为当前项，否则排到队尾
    pub async fn request(&self, req: ConfirmationRequest) -> ConfirmationTicket {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let item = PendingConfirmation {
            id: format!("confirm_{}", uuid::Uuid::new_v4()),
            action_name: req.action_name,
            description: req.description,
            args: req.args,
            risk: req.risk,
            seq,
            requested_at: Utc::now(),
        };
        let id = item.id.clone();
        tracing::info!(id = %id, action = %item.action_name, risk = ?item.risk, "confirmation requested");

        let entry = Entry { item, tx };
        if inner.current.is_none() {
            inner.current = Some(entry);
        } else {
            inner.queue.push_back(entry);
        }
        self.publish(&inner);

        ConfirmationTicket { id, rx }
    }

    /// 裁决当前项；id 不是当前项时忽略并返回 false
    pub async fn resolve(&self, id: &str, confirmed: bool, reason: Option<String>) -> bool {
        let mut inner = self.inner.lock().await;
        let is_current = inner.current.as_ref().map(|e| e.item.id == id).unwrap_or(false);
        if !is_current {
            tracing::debug!(id = %id, "ignoring resolve for non-current confirmation");
            return false;
        }

        let reason = match (confirmed, reason) {
            (false, None) => Some(REASON_USER_REJECTED.to_string()),
            (_, reason) => reason,
        };
        if let Some(entry) = inner.current.take() {
            tracing::info!(id = %id, confirmed, "confirmation resolved");
            entry.finish(confirmed, reason);
        }
        inner.promote();
        self.publish(&inner);
        true
    }

    /// 等待方放弃（超时 / 会话中止）：当前项按拒绝结束并推进，排队项直接移出
    ///
    /// 这是唯一能让排队项先于当前项结束的途径；resolve 仍只作用于当前项。
    pub async fn withdraw(&self, id: &str, reason: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.current.as_ref().map(|e| e.item.id == id).unwrap_or(false) {
            if let Some(entry) = inner.current.take() {
                entry.finish(false, Some(reason.to_string()));
            }
            inner.promote();
        } else if let Some(pos) = inner.queue.iter().position(|e| e.item.id == id) {
            if let Some(entry) = inner.queue.remove(pos) {
                entry.finish(false, Some(reason.to_string()));
            }
        } else {
            return false;
        }
        tracing::info!(id = %id, reason, "confirmation withdrawn");
        self.publish(&inner);
        true
    }

    /// 全部按拒绝结束，回到 idle；返回被结束的项数
    pub async fn clear_all(&self, reason: &str) -> usize {
        let mut inner = self.inner.lock().await;
        let mut count = 0;
        if let Some(entry) = inner.current.take() {
            entry.finish(false, Some(reason.to_string()));
            count += 1;
        }
        while let Some(entry) = inner.queue.pop_front() {
            entry.finish(false, Some(reason.to_string()));
            count += 1;
        }
        if count > 0 {
            tracing::info!(count, reason, "all confirmations cleared");
        }
        self.publish(&inner);
        count
    }

    pub async fn current(&self) -> Option<PendingConfirmation> {
        self.inner.lock().await.current.as_ref().map(|e| e.item.clone())
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    pub async fn is_idle(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.current.is_none() && inner.queue.is_empty()
    }

    fn publish(&self, inner: &Inner) {
        self.view_tx.send_replace(inner.view());
    }
}
