//! 会话状态：规则求值时读取的累计成本、活跃作用域、用户与发布标记
//!
//! SessionState 只是数据；并发访问由 SessionSupervisor 的 RwLock 负责。

use serde::{Deserialize, Serialize};

/// 会话级状态（ConstraintContext.session 的来源）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// 本会话累计成本（模型调用费用等，由外部推理循环累加）
    pub session_cost: f64,
    /// 当前操作的作用域（如某个 service 的 id）
    pub active_scope_id: Option<String>,
    pub user_id: Option<String>,
    /// 活跃作用域是否已发布（已发布对象的修改通常更危险）
    pub published: bool,
}

impl SessionState {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn with_scope(mut self, scope_id: impl Into<String>, published: bool) -> Self {
        self.active_scope_id = Some(scope_id.into());
        self.published = published;
        self
    }

    /// 累加成本；负数与 NaN 被忽略，成本只增不减
    pub fn add_cost(&mut self, cost: f64) {
        if cost.is_finite() && cost > 0.0 {
            self.session_cost += cost;
        }
    }
}
