//! 操作目录输入
//!
//! 支持两种文档：原生目录（`operations` 列表，JSON 或 TOML）与 OpenAPI 3 风格文档（`paths`）。
//! 两者都被规整为 CatalogueDocument，再由 ActionCatalogue::generate 生成描述符。

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::core::CopilotError;
use crate::tools::descriptor::Verb;

/// 参数位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParameterLocation {
    Path,
    #[default]
    Query,
    Header,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "in", default)]
    pub location: ParameterLocation,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub schema: Option<Value>,
}

/// 单个操作：标识、动词、路径、参数 / 请求体形状
#[derive(Debug, Clone, Deserialize)]
pub struct OperationSpec {
    pub id: String,
    pub verb: Verb,
    pub path: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub body: Option<Value>,
}

/// 规整后的操作目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CatalogueDocument {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub operations: Vec<OperationSpec>,
}

impl CatalogueDocument {
    /// 解析 JSON：带 `paths` 键的按 OpenAPI 处理，否则按原生目录处理
    pub fn from_json_str(text: &str) -> Result<Self, CopilotError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| CopilotError::CatalogueParse(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, CopilotError> {
        let value: Value =
            toml::from_str(text).map_err(|e| CopilotError::CatalogueParse(e.to_string()))?;
        Self::from_value(value)
    }

    /// 按扩展名选择解析器（.toml 走 TOML，其余按 JSON）
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CopilotError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&text),
            _ => Self::from_json_str(&text),
        }
    }

    pub fn from_value(value: Value) -> Result<Self, CopilotError> {
        if value.get("paths").is_some() {
            return Self::from_openapi(&value);
        }
        serde_json::from_value(value).map_err(|e| CopilotError::CatalogueParse(e.to_string()))
    }

    /// OpenAPI 3：paths.<path>.<method> -> 操作；operationId 缺失视为配置错误
    pub fn from_openapi(doc: &Value) -> Result<Self, CopilotError> {
        let paths = doc
            .get("paths")
            .and_then(Value::as_object)
            .ok_or_else(|| CopilotError::CatalogueParse("`paths` must be an object".to_string()))?;

        let mut operations = Vec::new();
        for (path, item) in paths {
            let Some(methods) = item.as_object() else {
                continue;
            };
            // 路径级参数对该路径下所有方法生效
            let shared = parse_parameters(item.get("parameters"))?;

            for (method, op) in methods {
                let Some(verb) = Verb::from_method(method) else {
                    continue;
                };
                let id = op
                    .get("operationId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| CopilotError::MissingOperationId {
                        method: method.to_ascii_uppercase(),
                        path: path.clone(),
                    })?;

                let mut parameters = shared.clone();
                for param in parse_parameters(op.get("parameters"))? {
                    parameters.retain(|p| p.name != param.name);
                    parameters.push(param);
                }

                let tags = op
                    .get("tags")
                    .and_then(Value::as_array)
                    .map(|tags| {
                        tags.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();

                let summary = op
                    .get("summary")
                    .or_else(|| op.get("description"))
                    .and_then(Value::as_str)
                    .map(str::to_string);

                let body = op
                    .pointer("/requestBody/content/application~1json/schema")
                    .cloned();

                operations.push(OperationSpec {
                    id: id.to_string(),
                    verb,
                    path: path.clone(),
                    summary,
                    tags,
                    parameters,
                    body,
                });
            }
        }

        Ok(Self {
            version: doc
                .pointer("/info/version")
                .and_then(Value::as_str)
                .map(str::to_string),
            operations,
        })
    }
}

fn parse_parameters(value: Option<&Value>) -> Result<Vec<ParameterSpec>, CopilotError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(v) => {
            serde_json::from_value(v.clone()).map_err(|e| CopilotError::CatalogueParse(e.to_string()))
        }
    }
}
