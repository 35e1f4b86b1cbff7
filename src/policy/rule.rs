//! 策略规则与策略文档
//!
//! 策略文档（TOML 或 JSON）= 版本号 + 全局设置 + 规则列表。加载时校验规则名唯一、编译条件与改写表达式（编译失败的规则保留并标记）；
//! PolicyStore 持有当前文档，reload 时整体替换，失败则保留旧文档。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::config::PolicySection;
use crate::core::CopilotError;
use crate::policy::expr::{Expr, Transform};

/// 规则动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Block,
    RequireConfirmation,
    Warn,
    Transform,
}

fn default_priority() -> u32 {
    100
}

fn default_enabled() -> bool {
    true
}

/// 文档中的原始规则
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleConfig {
    pub name: String,
    pub condition: String,
    pub action: RuleAction,
    #[serde(default)]
    pub message: String,
    /// 数值越小优先级越高
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub transform: Option<String>,
}

/// 编译后的规则
///
/// 条件或改写表达式无法编译时规则仍被保留：`compile_error` 记录原因，求值时视为未命中并上报，
/// 一条坏规则不会让整份策略失效。
#[derive(Debug, Clone)]
pub struct ConstraintRule {
    pub name: String,
    /// 编译失败时为 None
    pub condition: Option<Expr>,
    pub condition_source: String,
    pub action: RuleAction,
    pub message: String,
    pub priority: u32,
    pub enabled: bool,
    pub transform: Option<Transform>,
    pub compile_error: Option<String>,
    /// 在文档中的声明顺序，同优先级时用于排序
    pub ordinal: usize,
}

impl ConstraintRule {
    pub fn compile(raw: &RuleConfig, ordinal: usize) -> Self {
        let mut errors = Vec::new();
        let condition = match Expr::parse(&raw.condition) {
            Ok(expr) => Some(expr),
            Err(e) => {
                errors.push(format!("condition: {e}"));
                None
            }
        };
        let transform = match &raw.transform {
            Some(src) => match Transform::parse(src) {
                Ok(t) => Some(t),
                Err(e) => {
                    errors.push(format!("transform: {e}"));
                    None
                }
            },
            None => None,
        };
        if raw.action == RuleAction::Transform && raw.transform.is_none() {
            errors.push("action transform but no transform expression".to_string());
        }

        let compile_error = if errors.is_empty() {
            None
        } else {
            let reason = errors.join("; ");
            tracing::warn!(rule = %raw.name, error = %reason, "rule failed to compile, it will never match");
            Some(reason)
        };
        Self {
            name: raw.name.clone(),
            condition: condition.filter(|_| compile_error.is_none()),
            condition_source: raw.condition.clone(),
            action: raw.action,
            message: raw.message.clone(),
            priority: raw.priority,
            enabled: raw.enabled,
            transform,
            compile_error,
            ordinal,
        }
    }
}

/// 全局设置；文档中的值覆盖 [policy] 配置段
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicySettings {
    /// 会话成本上限，超过即拒绝（fail closed）
    pub max_session_cost: Option<f64>,
    pub confirmations_enabled: bool,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            max_session_cost: None,
            confirmations_enabled: true,
        }
    }
}

impl From<&PolicySection> for PolicySettings {
    fn from(section: &PolicySection) -> Self {
        Self {
            max_session_cost: Some(section.max_session_cost),
            confirmations_enabled: section.confirmations_enabled,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawSettings {
    max_session_cost: Option<f64>,
    confirmations_enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawDocument {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    settings: RawSettings,
    #[serde(default)]
    rules: Vec<RuleConfig>,
}

/// 已编译的策略文档
#[derive(Debug, Clone, Default)]
pub struct PolicyDocument {
    pub version: Option<String>,
    pub settings: PolicySettings,
    pub rules: Vec<ConstraintRule>,
}

impl PolicyDocument {
    pub fn from_rules(
        rules: &[RuleConfig],
        settings: PolicySettings,
    ) -> Result<Self, CopilotError> {
        let mut seen = HashSet::new();
        let mut compiled = Vec::with_capacity(rules.len());
        for (ordinal, raw) in rules.iter().enumerate() {
            if !seen.insert(raw.name.as_str()) {
                return Err(CopilotError::DuplicateRule(raw.name.clone()));
            }
            compiled.push(ConstraintRule::compile(raw, ordinal));
        }
        Ok(Self {
            version: None,
            settings,
            rules: compiled,
        })
    }

    pub fn from_toml_str(text: &str, defaults: PolicySettings) -> Result<Self, CopilotError> {
        let raw: RawDocument =
            toml::from_str(text).map_err(|e| CopilotError::PolicyParse(e.to_string()))?;
        Self::from_raw(raw, defaults)
    }

    pub fn from_json_str(text: &str, defaults: PolicySettings) -> Result<Self, CopilotError> {
        let raw: RawDocument =
            serde_json::from_str(text).map_err(|e| CopilotError::PolicyParse(e.to_string()))?;
        Self::from_raw(raw, defaults)
    }

    /// 按扩展名选择解析器（.json 走 JSON，其余按 TOML）
    pub fn from_path(path: impl AsRef<Path>, defaults: PolicySettings) -> Result<Self, CopilotError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text, defaults),
            _ => Self::from_toml_str(&text, defaults),
        }
    }

    fn from_raw(raw: RawDocument, defaults: PolicySettings) -> Result<Self, CopilotError> {
        let settings = PolicySettings {
            max_session_cost: raw.settings.max_session_cost.or(defaults.max_session_cost),
            confirmations_enabled: raw
                .settings
                .confirmations_enabled
                .unwrap_or(defaults.confirmations_enabled),
        };
        let mut doc = Self::from_rules(&raw.rules, settings)?;
        doc.version = raw.version;
        Ok(doc)
    }

    /// 启用的规则，按优先级升序；同优先级保持声明顺序
    pub fn ordered_rules(&self) -> Vec<&ConstraintRule> {
        let mut rules: Vec<&ConstraintRule> = self.rules.iter().filter(|r| r.enabled).collect();
        rules.sort_by_key(|r| (r.priority, r.ordinal));
        rules
    }
}

/// 策略存储：持有当前文档，支持从文件热重载
#[derive(Debug)]
pub struct PolicyStore {
    current: RwLock<Arc<PolicyDocument>>,
    path: Option<PathBuf>,
    defaults: PolicySettings,
}

impl PolicyStore {
    pub fn new(doc: PolicyDocument) -> Self {
        let defaults = doc.settings;
        Self {
            current: RwLock::new(Arc::new(doc)),
            path: None,
            defaults,
        }
    }

    /// 没有规则，只带全局设置
    pub fn empty(defaults: PolicySettings) -> Self {
        Self {
            current: RwLock::new(Arc::new(PolicyDocument {
                version: None,
                settings: defaults,
                rules: Vec::new(),
            })),
            path: None,
            defaults,
        }
    }

    pub fn load(path: impl Into<PathBuf>, defaults: PolicySettings) -> Result<Self, CopilotError> {
        let path = path.into();
        let doc = PolicyDocument::from_path(&path, defaults)?;
        tracing::info!(
            rules = doc.rules.len(),
            version = doc.version.as_deref().unwrap_or("-"),
            path = %path.display(),
            "policy loaded"
        );
        Ok(Self {
            current: RwLock::new(Arc::new(doc)),
            path: Some(path),
            defaults,
        })
    }

    pub fn current(&self) -> Arc<PolicyDocument> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, doc: PolicyDocument) {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(doc);
    }

    /// 从原路径重新加载；解析失败时保留旧文档并返回错误
    pub fn reload(&self) -> Result<Arc<PolicyDocument>, CopilotError> {
        let Some(path) = &self.path else {
            return Err(CopilotError::ConfigError(
                "policy store was not loaded from a file".to_string(),
            ));
        };
        match PolicyDocument::from_path(path, self.defaults) {
            Ok(doc) => {
                tracing::info!(rules = doc.rules.len(), "policy reloaded");
                self.replace(doc);
                Ok(self.current())
            }
            Err(e) => {
                tracing::warn!(error = %e, "policy reload failed, keeping previous rules");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const POLICY: &str = r#"
version = "7"

[settings]
max_session_cost = 5.0

[[rules]]
name = "confirm-destructive"
condition = "tool.requires_confirmation"
action = "require_confirmation"
message = "Deleting requires approval"
priority = 50

[[rules]]
name = "cap-page-size"
condition = "exists(args.limit) && args.limit > 100"
action = "transform"
transform = "args.limit = 100"

[[rules]]
name = "disabled"
condition = "true"
action = "block"
enabled = false
"#;

    #[test]
    fn test_parse_toml_document() {
        let doc = PolicyDocument::from_toml_str(POLICY, PolicySettings::default()).unwrap();
        assert_eq!(doc.version.as_deref(), Some("7"));
        assert_eq!(doc.settings.max_session_cost, Some(5.0));
        assert!(doc.settings.confirmations_enabled);
        assert_eq!(doc.rules.len(), 3);
        assert_eq!(doc.rules[1].priority, 100);
        assert_eq!(doc.ordered_rules().len(), 2);
        assert_eq!(doc.ordered_rules()[0].name, "confirm-destructive");
    }

    #[test]
    fn test_ties_keep_declaration_order() {
        let rules = vec![
            RuleConfig {
                name: "b".into(),
                condition: "true".into(),
                action: RuleAction::Warn,
                message: String::new(),
                priority: 10,
                enabled: true,
                transform: None,
            },
            RuleConfig {
                name: "a".into(),
                condition: "true".into(),
                action: RuleAction::Warn,
                message: String::new(),
                priority: 10,
                enabled: true,
                transform: None,
            },
        ];
        let doc = PolicyDocument::from_rules(&rules, PolicySettings::default()).unwrap();
        let names: Vec<&str> = doc.ordered_rules().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_duplicate_rule_name_rejected() {
        let text = r#"
[[rules]]
name = "x"
condition = "true"
action = "warn"
[[rules]]
name = "x"
condition = "false"
action = "warn"
"#;
        let err = PolicyDocument::from_toml_str(text, PolicySettings::default()).unwrap_err();
        assert!(matches!(err, CopilotError::DuplicateRule(name) if name == "x"));
    }

    #[test]
    fn test_transform_action_requires_expression() {
        let text = r#"
[[rules]]
name = "t"
condition = "true"
action = "transform"
"#;
        let doc = PolicyDocument::from_toml_str(text, PolicySettings::default()).unwrap();
        assert!(doc.rules[0].compile_error.is_some());
        assert!(doc.rules[0].condition.is_none());
    }

    #[test]
    fn test_malformed_condition_keeps_other_rules() {
        let text = r#"
[[rules]]
name = "broken"
condition = "tool.mutates &&"
action = "block"

[[rules]]
name = "block-deletes"
condition = "tool.verb == 'delete'"
action = "block"
"#;
        let doc = PolicyDocument::from_toml_str(text, PolicySettings::default()).unwrap();
        assert_eq!(doc.rules.len(), 2);
        let broken = &doc.rules[0];
        assert!(broken.condition.is_none());
        assert!(broken.compile_error.as_deref().unwrap().starts_with("condition:"));
        assert!(doc.rules[1].condition.is_some());
        assert!(doc.rules[1].compile_error.is_none());
    }

    #[test]
    fn test_json_document_and_defaults() {
        let defaults = PolicySettings {
            max_session_cost: Some(20.0),
            confirmations_enabled: false,
        };
        let doc = PolicyDocument::from_json_str(
            r#"{ "rules": [{ "name": "w", "condition": "tool.mutates", "action": "warn" }] }"#,
            defaults,
        )
        .unwrap();
        assert_eq!(doc.settings, defaults);
        assert_eq!(doc.rules[0].action, RuleAction::Warn);
    }

    #[test]
    fn test_store_reload_keeps_previous_on_error() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(POLICY.as_bytes()).unwrap();
        let store = PolicyStore::load(file.path(), PolicySettings::default()).unwrap();
        assert_eq!(store.current().rules.len(), 3);

        std::fs::write(file.path(), "[[rules]]\nname = \"only\"\ncondition = \"true\"\naction = \"warn\"\n")
            .unwrap();
        assert_eq!(store.reload().unwrap().rules.len(), 1);

        std::fs::write(file.path(), "not = [valid").unwrap();
        assert!(store.reload().is_err());
        assert_eq!(store.current().rules.len(), 1);
    }
}
