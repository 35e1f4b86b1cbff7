//! 会话监管：会话状态与中止
//!
//! 持有 CancellationToken，会话级中止（用户关闭会话 / 外部 abort）时取消所有挂起的确认等待；
//! SessionState 放在 RwLock 中，供规则求值时读取快照。

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::SessionState;

/// 会话级生命周期管理：取消令牌与会话状态
#[derive(Debug)]
pub struct SessionSupervisor {
    /// 会话中止时触发
    cancel_token: CancellationToken,
    state: Arc<RwLock<SessionState>>,
}

impl SessionSupervisor {
    pub fn new(state: SessionState) -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发会话级中止
    pub fn abort(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 创建子 token（用于单次确认等待）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// 当前会话状态的拷贝（求值期间状态可能继续变化，调用方需容忍）
    pub async fn state(&self) -> SessionState {
        self.state.read().await.clone()
    }

    pub async fn add_cost(&self, cost: f64) {
        self.state.write().await.add_cost(cost);
    }

    pub async fn set_scope(&self, scope_id: Option<String>, published: bool) {
        let mut state = self.state.write().await;
        state.active_scope_id = scope_id;
        state.published = published;
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new(SessionState::default())
    }
}
