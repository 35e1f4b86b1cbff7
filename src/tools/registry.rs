//! 动作注册表
//!
//! ActionCatalogue 是一次生成的不可变描述符集合（按名称索引）；ActionRegistry 由会话显式持有，
//! regenerate 时整体替换为新的 Arc<ActionCatalogue>，读者拿到的旧 Arc 不受影响。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::core::CopilotError;
use crate::tools::catalogue::CatalogueDocument;
use crate::tools::descriptor::{ActionDescriptor, ActionScope};

/// 一次生成得到的描述符集合
#[derive(Debug, Clone)]
pub struct ActionCatalogue {
    actions: HashMap<String, ActionDescriptor>,
    version: Option<String>,
    generated_at: DateTime<Utc>,
}

impl Default for ActionCatalogue {
    fn default() -> Self {
        Self {
            actions: HashMap::new(),
            version: None,
            generated_at: Utc::now(),
        }
    }
}

impl ActionCatalogue {
    /// 每个操作生成一个描述符；重复的操作标识是配置错误
    pub fn generate(doc: &CatalogueDocument) -> Result<Self, CopilotError> {
        let mut actions = HashMap::with_capacity(doc.operations.len());
        for op in &doc.operations {
            if actions.contains_key(&op.id) {
                return Err(CopilotError::DuplicateOperation(op.id.clone()));
            }
            actions.insert(op.id.clone(), ActionDescriptor::from_operation(op));
        }
        Ok(Self {
            actions,
            version: doc.version.clone(),
            generated_at: Utc::now(),
        })
    }

    pub fn get(&self, name: &str) -> Option<&ActionDescriptor> {
        self.actions.get(name)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    /// 名称排序后的动作名
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }

    /// 纯过滤：不修改集合，结果按名称排序
    pub fn filter(&self, filter: &ActionFilter) -> Vec<&ActionDescriptor> {
        let mut out: Vec<&ActionDescriptor> =
            self.actions.values().filter(|d| filter.matches(d)).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// 生成供推理循环使用的动作列表 JSON（name / description / parameters）
    pub fn to_schema_json(&self, filter: &ActionFilter) -> String {
        let tools: Vec<serde_json::Value> = self
            .filter(filter)
            .into_iter()
            .map(|d| {
                serde_json::json!({
                    "name": d.name,
                    "description": d.description(),
                    "parameters": d.parameters,
                    "mutates": d.mutates,
                    "requires_confirmation": d.requires_confirmation,
                    "scope": d.scope,
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

/// 过滤条件：作用域、标签、仅变更类、显式排除
#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    pub scope: Option<ActionScope>,
    pub tag: Option<String>,
    pub mutating_only: bool,
    pub exclude: HashSet<String>,
}

impl ActionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn scope(mut self, scope: ActionScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn mutating_only(mut self) -> Self {
        self.mutating_only = true;
        self
    }

    pub fn exclude(mut self, name: impl Into<String>) -> Self {
        self.exclude.insert(name.into());
        self
    }

    pub fn matches(&self, d: &ActionDescriptor) -> bool {
        if self.exclude.contains(&d.name) {
            return false;
        }
        if self.mutating_only && !d.mutates {
            return false;
        }
        if let Some(scope) = self.scope {
            if d.scope != scope {
                return false;
            }
        }
        match &self.tag {
            Some(tag) => d.has_tag(tag),
            None => true,
        }
    }
}

/// 会话持有的注册表：只支持整体替换
#[derive(Debug, Default)]
pub struct ActionRegistry {
    current: RwLock<Arc<ActionCatalogue>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalogue(catalogue: ActionCatalogue) -> Self {
        Self {
            current: RwLock::new(Arc::new(catalogue)),
        }
    }

    /// 当前目录快照
    pub fn current(&self) -> Arc<ActionCatalogue> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn get(&self, name: &str) -> Option<ActionDescriptor> {
        self.current().get(name).cloned()
    }

    /// 重新生成并原子替换；生成失败时保留旧目录
    pub fn regenerate(&self, doc: &CatalogueDocument) -> Result<Arc<ActionCatalogue>, CopilotError> {
        let catalogue = Arc::new(ActionCatalogue::generate(doc)?);
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = catalogue.clone();
        tracing::info!(
            actions = catalogue.len(),
            version = catalogue.version().unwrap_or("-"),
            "action catalogue regenerated"
        );
        Ok(catalogue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::catalogue::OperationSpec;
    use crate::tools::descriptor::Verb;

    fn op(id: &str, verb: Verb, path: &str, tags: &[&str]) -> OperationSpec {
        OperationSpec {
            id: id.to_string(),
            verb,
            path: path.to_string(),
            summary: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            parameters: vec![],
            body: None,
        }
    }

    fn sample_doc() -> CatalogueDocument {
        CatalogueDocument {
            version: Some("1".into()),
            operations: vec![
                op("list_services", Verb::Read, "/services", &["services"]),
                op("delete_service", Verb::Delete, "/services/{id}", &["services", "danger"]),
                op("update_form", Verb::Update, "/forms/{id}", &["forms"]),
                op("health", Verb::Read, "/health", &[]),
            ],
        }
    }

    #[test]
    fn test_generate_one_descriptor_per_operation() {
        let catalogue = ActionCatalogue::generate(&sample_doc()).unwrap();
        assert_eq!(catalogue.len(), 4);
        assert_eq!(catalogue.get("health").unwrap().scope, ActionScope::Global);
        assert_eq!(
            catalogue.names(),
            vec!["delete_service", "health", "list_services", "update_form"]
        );
    }

    #[test]
    fn test_duplicate_operation_is_error() {
        let mut doc = sample_doc();
        doc.operations.push(op("health", Verb::Read, "/healthz", &[]));
        let err = ActionCatalogue::generate(&doc).unwrap_err();
        assert!(matches!(err, CopilotError::DuplicateOperation(name) if name == "health"));
    }

    #[test]
    fn test_filters() {
        let catalogue = ActionCatalogue::generate(&sample_doc()).unwrap();
        let names = |f: &ActionFilter| -> Vec<String> {
            catalogue.filter(f).into_iter().map(|d| d.name.clone()).collect()
        };
        assert_eq!(
            names(&ActionFilter::all().scope(ActionScope::Service)),
            vec!["delete_service", "list_services"]
        );
        assert_eq!(names(&ActionFilter::all().tag("DANGER")), vec!["delete_service"]);
        assert_eq!(
            names(&ActionFilter::all().mutating_only()),
            vec!["delete_service", "update_form"]
        );
        assert_eq!(
            names(&ActionFilter::all().mutating_only().exclude("delete_service")),
            vec!["update_form"]
        );
        assert_eq!(catalogue.len(), 4);
    }

    #[test]
    fn test_regenerate_replaces_whole_catalogue() {
        let registry = ActionRegistry::new();
        assert!(registry.current().is_empty());
        registry.regenerate(&sample_doc()).unwrap();
        let before = registry.current();
        assert_eq!(before.len(), 4);

        let next = CatalogueDocument {
            version: Some("2".into()),
            operations: vec![op("create_workflow", Verb::Create, "/workflows", &[])],
        };
        registry.regenerate(&next).unwrap();
        let after = registry.current();
        assert_eq!(after.len(), 1);
        assert!(after.get("health").is_none());
        // 旧快照保持不变
        assert_eq!(before.len(), 4);
    }

    #[test]
    fn test_failed_regenerate_keeps_previous() {
        let registry = ActionRegistry::new();
        registry.regenerate(&sample_doc()).unwrap();
        let mut bad = sample_doc();
        bad.operations.push(op("health", Verb::Read, "/x", &[]));
        assert!(registry.regenerate(&bad).is_err());
        assert_eq!(registry.current().len(), 4);
    }

    #[test]
    fn test_schema_json_lists_actions() {
        let catalogue = ActionCatalogue::generate(&sample_doc()).unwrap();
        let json = catalogue.to_schema_json(&ActionFilter::all().mutating_only());
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
        assert_eq!(parsed[0]["name"], "delete_service");
        assert_eq!(parsed[0]["requires_confirmation"], true);
    }
}
