//! 事件源监管：连接、转发与指数退避重连
//!
//! 传输层由 EventSource 抽象（WebSocket / SSE / 测试桩均可）；FeedSupervisor 把收到的事件转发进同步器通道，
//! 断开后按退避策略重连，连续失败超过上限即标记 Degraded 并退出，不阻塞任何调用方，最后的快照仍可读。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::SyncSection;
use crate::core::{Backoff, Failure};
use crate::sync::event::EntityEvent;
use crate::sync::synchronizer::SyncCommand;

/// 按作用域订阅的事件流
#[async_trait]
pub trait EventSource: Send + Sync {
    /// 建立连接，返回有序（可能含重复）的事件流；流结束表示连接断开
    async fn connect(&self, scope_id: &str) -> Result<mpsc::Receiver<EntityEvent>, Failure>;
}

/// 连接状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// 重连预算耗尽，快照可能已过期
    Degraded,
    Stopped,
}

/// 重连策略：退避 + 最大连续失败次数
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub backoff: Backoff,
    pub max_attempts: u32,
}

impl From<&SyncSection> for ReconnectPolicy {
    fn from(section: &SyncSection) -> Self {
        Self {
            backoff: Backoff::new(section.reconnect_base_delay_ms, section.reconnect_max_delay_ms),
            max_attempts: section.reconnect_max_attempts,
        }
    }
}

pub struct FeedSupervisor {
    source: Arc<dyn EventSource>,
    policy: ReconnectPolicy,
    status_tx: watch::Sender<FeedStatus>,
}

impl FeedSupervisor {
    pub fn new(source: Arc<dyn EventSource>, policy: ReconnectPolicy) -> (Self, watch::Receiver<FeedStatus>) {
        let (status_tx, status_rx) = watch::channel(FeedStatus::Connecting);
        (
            Self {
                source,
                policy,
                status_tx,
            },
            status_rx,
        )
    }

    fn set_status(&self, status: FeedStatus) {
        self.status_tx.send_replace(status);
    }

    /// 运行直到取消、同步器关闭或重连预算耗尽；返回最终状态
    pub async fn run(
        self,
        scope_id: String,
        sink: mpsc::Sender<SyncCommand>,
        cancel: CancellationToken,
    ) -> FeedStatus {
        let mut failures: u32 = 0;
        loop {
            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.finish(FeedStatus::Stopped),
                result = self.source.connect(&scope_id) => result,
            };

            match connected {
                Ok(mut stream) => {
                    failures = 0;
                    self.set_status(FeedStatus::Connected);
                    tracing::info!(scope = %scope_id, "event feed connected");
                    loop {
                        let next = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return self.finish(FeedStatus::Stopped),
                            next = stream.recv() => next,
                        };
                        match next {
                            Some(event) => {
                                if sink.send(SyncCommand::Apply(event)).await.is_err() {
                                    return self.finish(FeedStatus::Stopped);
                                }
                            }
                            None => break,
                        }
                    }
                    tracing::warn!(scope = %scope_id, "event feed closed");
                }
                Err(failure) => {
                    tracing::warn!(scope = %scope_id, error = %failure, "event feed connect failed");
                }
            }

            failures += 1;
            if failures > self.policy.max_attempts {
                tracing::warn!(
                    scope = %scope_id,
                    attempts = failures - 1,
                    "reconnect budget exhausted, snapshot may be stale"
                );
                return self.finish(FeedStatus::Degraded);
            }
            self.set_status(FeedStatus::Reconnecting { attempt: failures });
            let delay = self.policy.backoff.delay(failures - 1);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.finish(FeedStatus::Stopped),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn finish(&self, status: FeedStatus) -> FeedStatus {
        self.set_status(status.clone());
        status
    }
}
