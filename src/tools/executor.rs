//! 操作执行器
//!
//! 每次调用依次经过：目录查找 → 策略求值 → 人工确认（如需）→ 带超时执行 → 失败分类与自动恢复；
//! 无论结果如何都输出一行结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::timeout;

use crate::config::{PolicySection, RecoverySection};
use crate::confirm::{
    ConfirmationCoordinator, ConfirmationOutcome, ConfirmationRequest, REASON_ABORTED, REASON_TIMEOUT,
    REASON_USER_REJECTED,
};
use crate::core::{Backoff, CopilotError, ErrorClassifier, Failure, RecoveryStrategy, SessionSupervisor};
use crate::observability::preview;
use crate::policy::{ConstraintContext, ConstraintResult, PolicyStore};
use crate::sync::SyncHub;
use crate::tools::{ActionDescriptor, ActionRegistry, ActionScope};

/// 实际执行操作的后端（HTTP、测试替身等）
#[async_trait]
pub trait ActionBackend: Send + Sync {
    async fn invoke(&self, descriptor: &ActionDescriptor, args: &Value) -> Result<Value, Failure>;

    /// 冲突后刷新该作用域的本地状态，默认无操作
    async fn refresh(&self, _scope: ActionScope, _scope_id: Option<&str>) -> Result<(), Failure> {
        Ok(())
    }
}

/// 操作执行器：策略门控 + 确认 + 超时 + 自动恢复
pub struct ActionExecutor {
    registry: Arc<ActionRegistry>,
    policy: Arc<PolicyStore>,
    confirmations: Arc<ConfirmationCoordinator>,
    supervisor: Arc<SessionSupervisor>,
    backend: Arc<dyn ActionBackend>,
    /// 提供当前作用域快照给规则；未设置时 `context.snapshot` 为 null
    sync: Option<Arc<SyncHub>>,
    classifier: ErrorClassifier,
    timeout: Duration,
    confirmation_timeout: Duration,
    max_retries: u32,
    backoff: Backoff,
}

impl ActionExecutor {
    pub fn new(
        registry: Arc<ActionRegistry>,
        policy: Arc<PolicyStore>,
        confirmations: Arc<ConfirmationCoordinator>,
        supervisor: Arc<SessionSupervisor>,
        backend: Arc<dyn ActionBackend>,
    ) -> Self {
        let recovery = RecoverySection::default();
        let policy_section = PolicySection::default();
        Self {
            registry,
            policy,
            confirmations,
            supervisor,
            backend,
            sync: None,
            classifier: ErrorClassifier::new(),
            timeout: Duration::from_secs(crate::config::ToolsSection::default().action_timeout_secs),
            confirmation_timeout: Duration::from_secs(policy_section.confirmation_timeout_secs),
            max_retries: recovery.max_retries,
            backoff: Backoff::new(recovery.backoff_base_ms, recovery.backoff_max_ms),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    pub fn with_sync(mut self, sync: Arc<SyncHub>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn with_recovery(mut self, recovery: &RecoverySection) -> Self {
        self.max_retries = recovery.max_retries;
        self.backoff = Backoff::new(recovery.backoff_base_ms, recovery.backoff_max_ms);
        self
    }

    fn descriptor(&self, name: &str) -> Result<ActionDescriptor, CopilotError> {
        self.registry
            .get(name)
            .ok_or_else(|| CopilotError::UnknownAction(name.to_string()))
    }

    async fn decide(&self, descriptor: &ActionDescriptor, args: &Value) -> ConstraintResult {
        let session = self.supervisor.state().await;
        let snapshot = match (&self.sync, session.active_scope_id.as_deref()) {
            (Some(sync), Some(scope_id)) => sync.snapshot(scope_id).await,
            _ => None,
        };
        let policy = self.policy.current();
        let ctx = ConstraintContext::new(descriptor, &session, args).with_snapshot(snapshot.as_deref());
        crate::policy::evaluate(&policy, &ctx)
    }

    /// 只求值不执行（预演）
    pub async fn evaluate(&self, name: &str, args: &Value) -> Result<ConstraintResult, CopilotError> {
        let descriptor = self.descriptor(name)?;
        Ok(self.decide(&descriptor, args).await)
    }

    /// 受治理的调用；成功时返回后端结果
    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value, CopilotError> {
        let start = Instant::now();
        let descriptor = self.descriptor(name)?;
        let mut decision = self.decide(&descriptor, &args).await;
        let mut retries = 0u32;

        let result = match self.gate(&descriptor, &args, &mut decision).await {
            Ok(effective) => self.execute(&descriptor, &effective, &mut retries).await,
            Err(e) => Err(e),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(CopilotError::ActionBlocked { .. }) => "blocked",
            Err(CopilotError::ConfirmationRejected { .. }) => "rejected",
            Err(_) => "failed",
        };
        let audit = serde_json::json!({
            "event": "action_audit",
            "action": descriptor.name,
            "allowed": decision.allowed,
            "decision": decision.action,
            "decisive_rule": decision.decisive_rule,
            "matched_rules": decision.matched_rules,
            "transformed": decision.transformed_args.is_some(),
            "outcome": outcome,
            "retries": retries,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview(&args),
        });
        tracing::info!(audit = %audit.to_string(), "action");

        result
    }

    /// 策略门控：返回实际执行参数，拒绝时返回错误并回填 decision
    async fn gate(
        &self,
        descriptor: &ActionDescriptor,
        args: &Value,
        decision: &mut ConstraintResult,
    ) -> Result<Value, CopilotError> {
        for warning in &decision.warnings {
            tracing::warn!(action = %descriptor.name, warning = %warning, "policy warning");
        }
        if !decision.allowed {
            return Err(CopilotError::ActionBlocked {
                action: descriptor.name.clone(),
                message: decision
                    .message
                    .clone()
                    .unwrap_or_else(|| "blocked by policy".to_string()),
            });
        }

        let effective = decision.effective_args(args);
        if decision.needs_confirmation() {
            let outcome = self.await_confirmation(descriptor, &effective).await;
            *decision = decision
                .clone()
                .resolve_confirmation(outcome.confirmed, outcome.reason.clone());
            if !decision.allowed {
                return Err(CopilotError::ConfirmationRejected {
                    action: descriptor.name.clone(),
                    reason: outcome
                        .reason
                        .unwrap_or_else(|| REASON_USER_REJECTED.to_string()),
                });
            }
        }
        Ok(effective)
    }

    /// 排队等待人工裁决；超时或会话中止时撤回
    async fn await_confirmation(&self, descriptor: &ActionDescriptor, args: &Value) -> ConfirmationOutcome {
        let mut ticket = self
            .confirmations
            .request(ConfirmationRequest {
                action_name: descriptor.name.clone(),
                description: descriptor.description(),
                args: args.clone(),
                risk: descriptor.risk_level(),
            })
            .await;
        let id = ticket.id.clone();
        let cancel = self.supervisor.child_token();

        let settled = tokio::select! {
            outcome = ticket.wait() => Some(outcome),
            _ = tokio::time::sleep(self.confirmation_timeout) => {
                tracing::warn!(action = %descriptor.name, id = %id, "confirmation timed out");
                self.confirmations.withdraw(&id, REASON_TIMEOUT).await;
                None
            }
            _ = cancel.cancelled() => {
                self.confirmations.withdraw(&id, REASON_ABORTED).await;
                None
            }
        };
        // 撤回与人工裁决同时发生时，以先送达票据的结果为准
        match settled {
            Some(outcome) => outcome,
            None => ticket.wait().await,
        }
    }

    /// 带超时执行；可自动恢复的失败按分类策略重试，最多 max_retries 次
    async fn execute(
        &self,
        descriptor: &ActionDescriptor,
        args: &Value,
        retries: &mut u32,
    ) -> Result<Value, CopilotError> {
        loop {
            let failure = match timeout(self.timeout, self.backend.invoke(descriptor, args)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(failure)) => failure,
                Err(_) => Failure::new(format!(
                    "action '{}' timed out after {}ms",
                    descriptor.name,
                    self.timeout.as_millis()
                ))
                .named("TimeoutError"),
            };

            let classified = self.classifier.classify(&failure);
            if !classified.can_auto_heal || *retries >= self.max_retries {
                tracing::warn!(
                    action = %descriptor.name,
                    category = ?classified.category,
                    retries = *retries,
                    "action failed"
                );
                return Err(CopilotError::ExecutionFailed(Box::new(classified)));
            }

            match classified.strategy {
                RecoveryStrategy::ExponentialBackoff => {
                    tokio::time::sleep(self.backoff.delay(*retries)).await;
                }
                RecoveryStrategy::RefreshAndRetry => {
                    let scope_id = self.supervisor.state().await.active_scope_id;
                    if let Err(e) = self.backend.refresh(descriptor.scope, scope_id.as_deref()).await {
                        tracing::warn!(action = %descriptor.name, error = %e, "refresh before retry failed");
                        return Err(CopilotError::ExecutionFailed(Box::new(classified)));
                    }
                }
                RecoveryStrategy::PromptUser | RecoveryStrategy::Abort => {
                    return Err(CopilotError::ExecutionFailed(Box::new(classified)));
                }
            }
            *retries += 1;
            tracing::info!(action = %descriptor.name, attempt = *retries, "retrying action");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SessionState;
    use crate::policy::{PolicyDocument, PolicySettings, RuleAction, RuleConfig};
    use crate::tools::{ActionCatalogue, CatalogueDocument};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyBackend {
        calls: AtomicU32,
        failures: u32,
        status: u16,
    }

    #[async_trait]
    impl ActionBackend for FlakyBackend {
        async fn invoke(&self, d: &ActionDescriptor, args: &Value) -> Result<Value, Failure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(Failure::with_status(self.status, "backend unavailable"));
            }
            Ok(json!({ "action": d.name, "args": args }))
        }
    }

    fn executor(backend: Arc<dyn ActionBackend>, rules: &[RuleConfig]) -> ActionExecutor {
        let doc = CatalogueDocument::from_json_str(
            r#"{"operations": [
                {"id": "getService", "verb": "GET", "path": "/services/{id}"},
                {"id": "updateService", "verb": "PATCH", "path": "/services/{id}"}
            ]}"#,
        )
        .unwrap();
        let registry = ActionRegistry::with_catalogue(ActionCatalogue::generate(&doc).unwrap());
        let policy = PolicyDocument::from_rules(rules, PolicySettings::default()).unwrap();
        ActionExecutor::new(
            Arc::new(registry),
            Arc::new(PolicyStore::new(policy)),
            Arc::new(ConfirmationCoordinator::new()),
            Arc::new(SessionSupervisor::new(SessionState::default())),
            backend,
        )
        .with_recovery(&RecoverySection {
            max_retries: 2,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
        })
    }

    fn flaky(failures: u32, status: u16) -> Arc<FlakyBackend> {
        Arc::new(FlakyBackend {
            calls: AtomicU32::new(0),
            failures,
            status,
        })
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let exec = executor(flaky(0, 500), &[]);
        let err = exec.invoke("dropDatabase", json!({})).await.unwrap_err();
        assert!(matches!(err, CopilotError::UnknownAction(name) if name == "dropDatabase"));
    }

    #[tokio::test]
    async fn test_retryable_failure_retried_until_success() {
        let backend = flaky(2, 503);
        let exec = executor(backend.clone(), &[]);
        let out = exec.invoke("getService", json!({"id": "s1"})).await.unwrap();
        assert_eq!(out["action"], "getService");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let backend = flaky(10, 503);
        let exec = executor(backend.clone(), &[]);
        let err = exec.invoke("getService", json!({"id": "s1"})).await.unwrap_err();
        assert!(matches!(err, CopilotError::ExecutionFailed(_)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_user_fixable_failure_not_retried() {
        let backend = flaky(1, 400);
        let exec = executor(backend.clone(), &[]);
        match exec.invoke("getService", json!({})).await {
            Err(CopilotError::ExecutionFailed(classified)) => {
                assert_eq!(classified.status, Some(400));
                assert!(!classified.can_auto_heal);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transform_rewrites_args_before_execution() {
        let rule = RuleConfig {
            name: "cap-limit".into(),
            condition: "args.limit > 50".into(),
            action: RuleAction::Transform,
            message: String::new(),
            priority: 100,
            enabled: true,
            transform: Some("args.limit = 50".into()),
        };
        let exec = executor(flaky(0, 500), &[rule]);
        let out = exec
            .invoke("getService", json!({"id": "s1", "limit": 500}))
            .await
            .unwrap();
        assert_eq!(out["args"]["limit"], 50);

        let dry = exec.evaluate("getService", &json!({"limit": 500})).await.unwrap();
        assert_eq!(dry.decisive_rule.as_deref(), Some("cap-limit"));
    }

    #[tokio::test]
    async fn test_timeout_becomes_classified_failure() {
        struct SlowBackend;

        #[async_trait]
        impl ActionBackend for SlowBackend {
            async fn invoke(&self, _d: &ActionDescriptor, _args: &Value) -> Result<Value, Failure> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            }
        }

        let exec = executor(Arc::new(SlowBackend), &[])
            .with_timeout(Duration::from_millis(10))
            .with_recovery(&RecoverySection {
                max_retries: 0,
                backoff_base_ms: 1,
                backoff_max_ms: 1,
            });
        match exec.invoke("getService", json!({})).await {
            Err(CopilotError::ExecutionFailed(classified)) => {
                assert_eq!(classified.original.name.as_deref(), Some("TimeoutError"));
                assert!(classified.can_auto_heal);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
