//! 规则求值器
//!
//! evaluate(policy, context) 对启用规则按优先级求值，产出唯一的 ConstraintResult：
//! - 第一个命中的 block / require_confirmation 是决定性规则；
//! - warn 只记录不拦截；
//! - transform 只应用第一个命中的改写，其余命中仅记录；
//! - 条件求值出错视为未命中并记录，不会拦截；
//! - 会话成本超过上限时强制拒绝（fail closed）。

use serde::Serialize;
use serde_json::Value;

use crate::core::SessionState;
use crate::policy::rule::{PolicyDocument, RuleAction};
use crate::sync::ContextSnapshot;
use crate::tools::ActionDescriptor;

/// 求值上下文：描述符 + 会话状态 + 拟调用参数 + 当前作用域快照（只读）
#[derive(Debug, Clone, Copy)]
pub struct ConstraintContext<'a> {
    pub descriptor: &'a ActionDescriptor,
    pub session: &'a SessionState,
    pub args: &'a Value,
    pub snapshot: Option<&'a ContextSnapshot>,
}

impl<'a> ConstraintContext<'a> {
    pub fn new(descriptor: &'a ActionDescriptor, session: &'a SessionState, args: &'a Value) -> Self {
        Self {
            descriptor,
            session,
            args,
            snapshot: None,
        }
    }

    pub fn with_snapshot(mut self, snapshot: Option<&'a ContextSnapshot>) -> Self {
        self.snapshot = snapshot;
        self
    }

    /// 表达式绑定：`tool` / `context` / `args`，快照挂在 `context.snapshot`（未订阅时为 null）
    pub fn bindings(&self) -> Value {
        let mut context = serde_json::json!(self.session);
        if let Value::Object(map) = &mut context {
            map.insert("snapshot".to_string(), serde_json::json!(self.snapshot));
        }
        serde_json::json!({
            "tool": self.descriptor,
            "context": context,
            "args": self.args,
        })
    }
}

/// 人工确认状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum ConfirmationStatus {
    /// 等待 ConfirmationCoordinator 裁决
    Pending,
    Confirmed,
    Rejected(String),
}

/// 条件求值失败的规则（视为未命中）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleFailure {
    pub rule: String,
    pub error: String,
}

/// 一次求值的结果
#[derive(Debug, Clone, Serialize)]
pub struct ConstraintResult {
    pub allowed: bool,
    pub action: Option<RuleAction>,
    pub decisive_rule: Option<String>,
    pub message: Option<String>,
    pub transformed_args: Option<Value>,
    /// 所有条件为真的规则（按求值顺序），与最终结果无关，供审计
    pub matched_rules: Vec<String>,
    pub warnings: Vec<String>,
    pub rule_errors: Vec<RuleFailure>,
    pub confirmation: Option<ConfirmationStatus>,
    pub cost_exceeded: bool,
}

impl ConstraintResult {
    fn allow() -> Self {
        Self {
            allowed: true,
            action: None,
            decisive_rule: None,
            message: None,
            transformed_args: None,
            matched_rules: Vec::new(),
            warnings: Vec::new(),
            rule_errors: Vec::new(),
            confirmation: None,
            cost_exceeded: false,
        }
    }

    /// 是否仍需人工确认后才能执行
    pub fn needs_confirmation(&self) -> bool {
        self.allowed && self.confirmation == Some(ConfirmationStatus::Pending)
    }

    /// 人工裁决后回填：拒绝则 allowed=false
    pub fn resolve_confirmation(mut self, confirmed: bool, reason: Option<String>) -> Self {
        if self.confirmation != Some(ConfirmationStatus::Pending) {
            return self;
        }
        if confirmed {
            self.confirmation = Some(ConfirmationStatus::Confirmed);
        } else {
            let reason = reason.unwrap_or_else(|| "user_rejected".to_string());
            self.allowed = false;
            self.message = Some(format!("Confirmation rejected: {reason}"));
            self.confirmation = Some(ConfirmationStatus::Rejected(reason));
        }
        self
    }

    /// 实际应执行的参数（有改写则用改写结果）
    pub fn effective_args(&self, original: &Value) -> Value {
        self.transformed_args
            .clone()
            .unwrap_or_else(|| original.clone())
    }
}

/// 对策略文档求值
pub fn evaluate(policy: &PolicyDocument, ctx: &ConstraintContext<'_>) -> ConstraintResult {
    let bindings = ctx.bindings();
    let mut result = ConstraintResult::allow();

    let mut decisive: Option<(&str, RuleAction, &str)> = None;
    let mut first_warn: Option<&str> = None;
    let mut transform_rule: Option<&str> = None;

    for rule in policy.ordered_rules() {
        let (Some(condition), None) = (&rule.condition, &rule.compile_error) else {
            result.rule_errors.push(RuleFailure {
                rule: rule.name.clone(),
                error: rule
                    .compile_error
                    .clone()
                    .unwrap_or_else(|| "rule has no condition".to_string()),
            });
            continue;
        };
        let matched = match condition.eval_bool(&bindings) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(rule = %rule.name, error = %e, "rule condition failed to evaluate, treating as non-matching");
                result.rule_errors.push(RuleFailure {
                    rule: rule.name.clone(),
                    error: e.to_string(),
                });
                continue;
            }
        };
        if !matched {
            continue;
        }
        result.matched_rules.push(rule.name.clone());

        match rule.action {
            RuleAction::Block | RuleAction::RequireConfirmation => {
                if decisive.is_none() {
                    decisive = Some((rule.name.as_str(), rule.action, rule.message.as_str()));
                }
            }
            RuleAction::Warn => {
                first_warn.get_or_insert(rule.name.as_str());
                result.warnings.push(rule_message(&rule.name, &rule.message));
            }
            RuleAction::Transform => {
                // 只应用第一个命中的改写
                if transform_rule.is_some() {
                    continue;
                }
                transform_rule = Some(rule.name.as_str());
                let Some(transform) = &rule.transform else {
                    continue;
                };
                match transform.apply(&bindings) {
                    Ok(args) => result.transformed_args = Some(args),
                    Err(e) => {
                        tracing::warn!(rule = %rule.name, error = %e, "transform failed, arguments left unchanged");
                        result.rule_errors.push(RuleFailure {
                            rule: rule.name.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    match decisive {
        Some((name, RuleAction::Block, message)) => {
            result.allowed = false;
            result.action = Some(RuleAction::Block);
            result.decisive_rule = Some(name.to_string());
            result.message = Some(rule_message(name, message));
        }
        Some((name, action, message)) => {
            result.action = Some(action);
            result.decisive_rule = Some(name.to_string());
            result.message = Some(rule_message(name, message));
            if policy.settings.confirmations_enabled {
                result.confirmation = Some(ConfirmationStatus::Pending);
            } else {
                tracing::info!(rule = %name, "confirmations disabled, proceeding without approval");
            }
        }
        None => {
            if let Some(name) = transform_rule {
                result.action = Some(RuleAction::Transform);
                result.decisive_rule = Some(name.to_string());
            } else if let Some(name) = first_warn {
                result.action = Some(RuleAction::Warn);
                result.decisive_rule = Some(name.to_string());
            }
            if !result.warnings.is_empty() {
                result.message = Some(result.warnings.join("; "));
            }
        }
    }

    if let Some(max) = policy.settings.max_session_cost {
        if ctx.session.session_cost > max {
            result.allowed = false;
            result.cost_exceeded = true;
            result.action = Some(RuleAction::Block);
            result.confirmation = None;
            // 结果由成本上限决定，与规则无关
            result.decisive_rule = None;
            result.transformed_args = None;
            result.message = Some(format!(
                "Session cost ceiling exceeded ({:.2} > {:.2})",
                ctx.session.session_cost, max
            ));
        }
    }

    result
}

fn rule_message(name: &str, message: &str) -> String {
    if message.is_empty() {
        format!("Rule '{name}' matched")
    } else {
        message.to_string()
    }
}
