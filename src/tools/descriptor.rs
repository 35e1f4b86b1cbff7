//! 动作描述符
//!
//! 每个后端操作生成一个 ActionDescriptor：名称、动词、路径模板与治理元数据（mutates / requires_confirmation / scope）。
//! 描述符生成后不可变，整个集合只会被整体替换。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::confirm::RiskLevel;
use crate::tools::catalogue::{OperationSpec, ParameterLocation};

/// 操作动词；反序列化同时接受 HTTP 方法名
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    #[serde(alias = "get", alias = "GET", alias = "list")]
    Read,
    #[serde(alias = "post", alias = "POST")]
    Create,
    #[serde(alias = "put", alias = "PUT")]
    Replace,
    #[serde(alias = "patch", alias = "PATCH", alias = "partial_update")]
    Update,
    #[serde(alias = "DELETE", alias = "remove")]
    Delete,
}

impl Verb {
    /// 按 HTTP 方法解析（大小写不敏感）；head / options 等非业务方法返回 None
    pub fn from_method(method: &str) -> Option<Self> {
        match method.to_ascii_lowercase().as_str() {
            "get" => Some(Verb::Read),
            "post" => Some(Verb::Create),
            "put" => Some(Verb::Replace),
            "patch" => Some(Verb::Update),
            "delete" => Some(Verb::Delete),
            _ => None,
        }
    }

    pub fn http_method(self) -> &'static str {
        match self {
            Verb::Read => "GET",
            Verb::Create => "POST",
            Verb::Replace => "PUT",
            Verb::Update => "PATCH",
            Verb::Delete => "DELETE",
        }
    }

    pub fn mutates(self) -> bool {
        !matches!(self, Verb::Read)
    }
}

/// 作用域：一个封闭的小集合，未知路径段归为 Global
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionScope {
    Service,
    Form,
    Workflow,
    Registration,
    Global,
}

impl ActionScope {
    /// 从路径第一个有意义的段推断作用域：跳过空段、`api`、版本号（v1、v2…）与 `{param}` 占位符
    pub fn infer(path: &str) -> Self {
        let segment = path
            .split('/')
            .map(str::trim)
            .find(|s| !s.is_empty() && !is_noise_segment(s));
        match segment.map(|s| s.to_ascii_lowercase()) {
            Some(s) => Self::from_segment(&s),
            None => ActionScope::Global,
        }
    }

    fn from_segment(segment: &str) -> Self {
        match segment {
            "service" | "services" => ActionScope::Service,
            "form" | "forms" => ActionScope::Form,
            "workflow" | "workflows" => ActionScope::Workflow,
            "registration" | "registrations" => ActionScope::Registration,
            _ => ActionScope::Global,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionScope::Service => "service",
            ActionScope::Form => "form",
            ActionScope::Workflow => "workflow",
            ActionScope::Registration => "registration",
            ActionScope::Global => "global",
        }
    }
}

fn is_noise_segment(segment: &str) -> bool {
    if segment.eq_ignore_ascii_case("api") {
        return true;
    }
    if segment.starts_with('{') || segment.starts_with(':') {
        return true;
    }
    let mut chars = segment.chars();
    matches!(chars.next(), Some('v') | Some('V')) && {
        let rest = chars.as_str();
        !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
    }
}

/// 可供推理循环调用的动作，附带治理元数据
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionDescriptor {
    pub name: String,
    pub verb: Verb,
    /// 路径模板，如 /services/{id}
    pub path: String,
    pub summary: Option<String>,
    pub mutates: bool,
    pub requires_confirmation: bool,
    pub scope: ActionScope,
    pub tags: Vec<String>,
    /// 参数 JSON Schema（供 LLM 生成参数）
    pub parameters: Value,
}

impl ActionDescriptor {
    pub fn from_operation(op: &OperationSpec) -> Self {
        Self {
            name: op.id.clone(),
            verb: op.verb,
            path: op.path.clone(),
            summary: op.summary.clone(),
            mutates: op.verb.mutates(),
            requires_confirmation: op.verb == Verb::Delete,
            scope: ActionScope::infer(&op.path),
            tags: op.tags.clone(),
            parameters: parameters_schema(op),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// 确认弹窗展示的风险等级
    pub fn risk_level(&self) -> RiskLevel {
        match self.verb {
            Verb::Delete => RiskLevel::High,
            Verb::Replace | Verb::Update | Verb::Create => RiskLevel::Medium,
            Verb::Read => RiskLevel::Low,
        }
    }

    pub fn description(&self) -> String {
        match &self.summary {
            Some(summary) => summary.clone(),
            None => format!("{} {}", self.verb.http_method(), self.path),
        }
    }
}

/// 由路径 / 查询参数与请求体生成参数 schema；路径参数总是必填
fn parameters_schema(op: &OperationSpec) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();

    for param in &op.parameters {
        let mut schema = param
            .schema
            .clone()
            .unwrap_or_else(|| serde_json::json!({ "type": "string" }));
        if let (Some(desc), Value::Object(map)) = (&param.description, &mut schema) {
            map.entry("description")
                .or_insert_with(|| Value::String(desc.clone()));
        }
        properties.insert(param.name.clone(), schema);
        if param.required || param.location == ParameterLocation::Path {
            required.push(Value::String(param.name.clone()));
        }
    }

    if let Some(body) = &op.body {
        properties.insert("body".to_string(), body.clone());
        if matches!(op.verb, Verb::Create | Verb::Replace) {
            required.push(Value::String("body".to_string()));
        }
    }

    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::catalogue::ParameterSpec;

    fn op(id: &str, verb: Verb, path: &str) -> OperationSpec {
        OperationSpec {
            id: id.to_string(),
            verb,
            path: path.to_string(),
            summary: None,
            tags: vec![],
            parameters: vec![],
            body: None,
        }
    }

    #[test]
    fn test_delete_service_requires_confirmation() {
        let d = ActionDescriptor::from_operation(&op("delete_service", Verb::Delete, "/services/{id}"));
        assert!(d.requires_confirmation);
        assert!(d.mutates);
        assert_eq!(d.scope, ActionScope::Service);
        assert_eq!(d.risk_level(), RiskLevel::High);
    }

    #[test]
    fn test_update_mutates_without_confirmation() {
        let d = ActionDescriptor::from_operation(&op("patch_form", Verb::Update, "/api/v2/forms/{id}"));
        assert!(d.mutates);
        assert!(!d.requires_confirmation);
        assert_eq!(d.scope, ActionScope::Form);
    }

    #[test]
    fn test_read_is_not_mutating() {
        let d = ActionDescriptor::from_operation(&op("list_workflows", Verb::Read, "/workflows"));
        assert!(!d.mutates);
        assert_eq!(d.scope, ActionScope::Workflow);
    }

    #[test]
    fn test_scope_inference() {
        assert_eq!(ActionScope::infer("/registrations"), ActionScope::Registration);
        assert_eq!(ActionScope::infer("/{tenant}/services/x"), ActionScope::Service);
        assert_eq!(ActionScope::infer("/health"), ActionScope::Global);
        assert_eq!(ActionScope::infer("/"), ActionScope::Global);
        assert_eq!(ActionScope::infer("/v1"), ActionScope::Global);
    }

    #[test]
    fn test_verb_accepts_http_methods() {
        let v: Verb = serde_json::from_str("\"post\"").unwrap();
        assert_eq!(v, Verb::Create);
        let v: Verb = serde_json::from_str("\"delete\"").unwrap();
        assert_eq!(v, Verb::Delete);
        assert_eq!(Verb::from_method("PATCH"), Some(Verb::Update));
        assert_eq!(Verb::from_method("options"), None);
    }

    #[test]
    fn test_parameters_schema_marks_path_params_required() {
        let mut operation = op("replace_service", Verb::Replace, "/services/{id}");
        operation.parameters.push(ParameterSpec {
            name: "id".into(),
            location: ParameterLocation::Path,
            required: false,
            description: Some("service id".into()),
            schema: None,
        });
        operation.body = Some(serde_json::json!({ "type": "object" }));
        let d = ActionDescriptor::from_operation(&operation);
        let required = d.parameters["required"].as_array().unwrap();
        assert!(required.contains(&Value::String("id".into())));
        assert!(required.contains(&Value::String("body".into())));
        assert_eq!(d.parameters["properties"]["id"]["description"], "service id");
    }
}
