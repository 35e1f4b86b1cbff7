//! 副驾驶会话运行时
//!
//! Copilot 把一个会话需要的组件装配在一起：操作注册表、策略存储、确认协调器、
//! 会话监管、上下文同步中心与操作执行器。所有组件显式构造并由会话持有，没有全局单例。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;

use crate::config::AppConfig;
use crate::confirm::{ConfirmationCoordinator, REASON_ABORTED};
use crate::core::{CopilotError, SessionState, SessionSupervisor};
use crate::policy::{ConstraintResult, PolicySettings, PolicyDocument, PolicyStore};
use crate::sync::{ContextSnapshot, EventSource, SyncHub};
use crate::tools::{
    ActionBackend, ActionCatalogue, ActionExecutor, ActionRegistry, CatalogueDocument, HttpBackend,
};

pub struct Copilot {
    registry: Arc<ActionRegistry>,
    policy: Arc<PolicyStore>,
    confirmations: Arc<ConfirmationCoordinator>,
    supervisor: Arc<SessionSupervisor>,
    sync: Arc<SyncHub>,
    executor: ActionExecutor,
}

/// 按 [tools].base_url 创建 HTTP 后端
pub fn backend_from_config(cfg: &AppConfig) -> Result<Arc<dyn ActionBackend>, CopilotError> {
    let base_url = cfg
        .tools
        .base_url
        .as_deref()
        .ok_or_else(|| CopilotError::ConfigError("tools.base_url is not set".to_string()))?;
    let backend = HttpBackend::new(base_url, cfg.tools.action_timeout_secs)
        .map_err(|e| CopilotError::ConfigError(e.to_string()))?;
    Ok(Arc::new(backend))
}

impl Copilot {
    pub fn new(
        registry: ActionRegistry,
        policy: PolicyStore,
        session: SessionState,
        backend: Arc<dyn ActionBackend>,
        cfg: &AppConfig,
    ) -> Self {
        let registry = Arc::new(registry);
        let policy = Arc::new(policy);
        let confirmations = Arc::new(ConfirmationCoordinator::new());
        let supervisor = Arc::new(SessionSupervisor::new(session));
        let sync = Arc::new(SyncHub::new(cfg.sync.clone()));
        let executor = ActionExecutor::new(
            registry.clone(),
            policy.clone(),
            confirmations.clone(),
            supervisor.clone(),
            backend,
        )
        .with_timeout(Duration::from_secs(cfg.tools.action_timeout_secs))
        .with_confirmation_timeout(Duration::from_secs(cfg.policy.confirmation_timeout_secs))
        .with_recovery(&cfg.recovery)
        .with_sync(sync.clone());

        Self {
            registry,
            policy,
            confirmations,
            supervisor,
            sync,
            executor,
        }
    }

    /// 从配置装配：[app].catalogue_path 生成目录，[app].policy_path 加载策略（缺省时只用 [policy] 设置）
    pub fn from_config(
        cfg: &AppConfig,
        session: SessionState,
        backend: Arc<dyn ActionBackend>,
    ) -> Result<Self, CopilotError> {
        let registry = match &cfg.app.catalogue_path {
            Some(path) => {
                let doc = CatalogueDocument::from_path(path)?;
                ActionRegistry::with_catalogue(ActionCatalogue::generate(&doc)?)
            }
            None => ActionRegistry::new(),
        };
        let defaults = PolicySettings::from(&cfg.policy);
        let policy = match &cfg.app.policy_path {
            Some(path) => PolicyStore::load(path.clone(), defaults)?,
            None => PolicyStore::empty(defaults),
        };
        tracing::info!(
            actions = registry.current().len(),
            rules = policy.current().rules.len(),
            "copilot session ready"
        );
        Ok(Self::new(registry, policy, session, backend, cfg))
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn confirmations(&self) -> &Arc<ConfirmationCoordinator> {
        &self.confirmations
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.supervisor
    }

    pub fn sync(&self) -> &SyncHub {
        &self.sync
    }

    /// 后端目录变化时重新生成；失败时保留旧目录
    pub fn regenerate_catalogue(&self, doc: &CatalogueDocument) -> Result<Arc<ActionCatalogue>, CopilotError> {
        self.registry.regenerate(doc)
    }

    pub fn reload_policy(&self) -> Result<Arc<PolicyDocument>, CopilotError> {
        self.policy.reload()
    }

    pub fn replace_policy(&self, doc: PolicyDocument) {
        self.policy.replace(doc);
    }

    pub async fn evaluate(&self, action: &str, args: &Value) -> Result<ConstraintResult, CopilotError> {
        self.executor.evaluate(action, args).await
    }

    pub async fn invoke(&self, action: &str, args: Value) -> Result<Value, CopilotError> {
        self.executor.invoke(action, args).await
    }

    /// 累计推理成本（计入成本上限）
    pub async fn record_cost(&self, cost: f64) {
        self.supervisor.add_cost(cost).await;
    }

    /// 切换当前作用域并订阅其上下文快照
    pub async fn enter_scope(
        &self,
        scope_id: &str,
        published: bool,
        source: Option<Arc<dyn EventSource>>,
    ) -> watch::Receiver<Arc<ContextSnapshot>> {
        self.supervisor
            .set_scope(Some(scope_id.to_string()), published)
            .await;
        match source {
            Some(source) => self.sync.subscribe_feed(scope_id, source).await,
            None => self.sync.subscribe(scope_id).await,
        }
    }

    /// 离开作用域：停止同步并丢弃快照
    pub async fn leave_scope(&self, scope_id: &str) {
        self.sync.unsubscribe(scope_id).await;
        let state = self.supervisor.state().await;
        if state.active_scope_id.as_deref() == Some(scope_id) {
            self.supervisor.set_scope(None, false).await;
        }
    }

    pub async fn snapshot(&self) -> Option<Arc<ContextSnapshot>> {
        let scope_id = self.supervisor.state().await.active_scope_id?;
        self.sync.snapshot(&scope_id).await
    }

    /// 中止会话：拒绝所有挂起确认、取消会话令牌并停止同步
    pub async fn abort(&self) {
        let cleared = self.confirmations.clear_all(REASON_ABORTED).await;
        self.supervisor.abort();
        self.sync.shutdown().await;
        tracing::info!(cleared, "copilot session aborted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Failure;
    use crate::tools::ActionDescriptor;
    use async_trait::async_trait;
    use serde_json::json;
    use std::io::Write;

    struct EchoBackend;

    #[async_trait]
    impl ActionBackend for EchoBackend {
        async fn invoke(&self, _d: &ActionDescriptor, args: &Value) -> Result<Value, Failure> {
            Ok(args.clone())
        }
    }

    #[test]
    fn test_backend_requires_base_url() {
        let cfg = AppConfig::default();
        assert!(matches!(backend_from_config(&cfg), Err(CopilotError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_from_config_loads_catalogue_and_policy() {
        let mut catalogue = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            catalogue,
            r#"{{"operations": [{{"id": "listForms", "verb": "GET", "path": "/services/{{serviceId}}/forms"}}]}}"#
        )
        .unwrap();
        let mut policy = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            policy,
            r#"
version = "1"

[[rules]]
name = "no-drafts"
condition = "args.status == 'draft'"
action = "block"
message = "Drafts are read-only here"
"#
        )
        .unwrap();

        let mut cfg = AppConfig::default();
        cfg.app.catalogue_path = Some(catalogue.path().to_path_buf());
        cfg.app.policy_path = Some(policy.path().to_path_buf());
        let copilot = Copilot::from_config(&cfg, SessionState::new("u1"), Arc::new(EchoBackend)).unwrap();

        assert_eq!(copilot.registry().current().names(), vec!["listForms"]);
        let out = copilot
            .invoke("listForms", json!({"serviceId": "s1"}))
            .await
            .unwrap();
        assert_eq!(out["serviceId"], "s1");
        let err = copilot
            .invoke("listForms", json!({"serviceId": "s1", "status": "draft"}))
            .await
            .unwrap_err();
        assert!(matches!(err, CopilotError::ActionBlocked { .. }));
    }

    #[tokio::test]
    async fn test_scope_tracking() {
        let cfg = AppConfig::default();
        let copilot = Copilot::new(
            ActionRegistry::new(),
            PolicyStore::empty(PolicySettings::default()),
            SessionState::default(),
            Arc::new(EchoBackend),
            &cfg,
        );
        copilot.enter_scope("svc-1", true, None).await;
        assert_eq!(copilot.snapshot().await.unwrap().scope_id, "svc-1");
        assert!(copilot.supervisor().state().await.published);

        copilot.leave_scope("svc-1").await;
        assert!(copilot.snapshot().await.is_none());
        assert!(copilot.supervisor().state().await.active_scope_id.is_none());
    }
}
