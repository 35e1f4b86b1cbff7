//! HTTP 后端：把操作描述符映射为 REST 请求
//!
//! 路径中的 `{param}` 由同名参数填充（并从其余参数中移除）；读取与删除把其余参数作为查询串，
//! 写操作发送 JSON 请求体（优先取 `body` 参数，否则为其余参数整体）。非 2xx 响应转为带状态码的 Failure。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde_json::{Map, Value};

use crate::core::Failure;
use crate::tools::executor::ActionBackend;
use crate::tools::{ActionDescriptor, Verb};

/// 错误响应正文保留的最大字符数
const MAX_ERROR_BODY_CHARS: usize = 500;

/// 客户端构建失败属于配置问题（TLS 后端、代理等），不可重试
fn client_build_failure(err: reqwest::Error) -> Failure {
    Failure::new(format!("failed to build http client: {err}")).named("ConfigError")
}

pub struct HttpBackend {
    client: Client,
    base_url: Url,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, Failure> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Failure::new(format!("invalid base url '{base_url}': {e}")).named("ConfigError"))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(client_build_failure)?;
        Ok(Self { client, base_url })
    }

    /// 生成请求地址，返回未被路径占位符消耗的参数
    fn build_url(&self, descriptor: &ActionDescriptor, args: &Value) -> Result<(Url, Map<String, Value>), Failure> {
        let mut rest = match args {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(Failure::with_status(
                    400,
                    format!("arguments must be an object, got {other}"),
                ))
            }
        };

        let mut segments = Vec::new();
        for segment in descriptor.path.split('/').filter(|s| !s.is_empty()) {
            match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(name) => {
                    let value = rest.remove(name).ok_or_else(|| {
                        Failure::with_status(400, format!("missing path parameter '{name}'"))
                    })?;
                    segments.push(scalar_text(&value));
                }
                None => segments.push(segment.to_string()),
            }
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Failure::new("base url cannot carry a path").named("ConfigError"))?
            .pop_if_empty()
            .extend(segments.iter());
        Ok((url, rest))
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() > MAX_ERROR_BODY_CHARS {
        format!("{}...", text.chars().take(MAX_ERROR_BODY_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

#[async_trait]
impl ActionBackend for HttpBackend {
    async fn invoke(&self, descriptor: &ActionDescriptor, args: &Value) -> Result<Value, Failure> {
        let (url, mut rest) = self.build_url(descriptor, args)?;
        let method = Method::from_bytes(descriptor.verb.http_method().as_bytes())
            .map_err(|e| Failure::new(e.to_string()))?;

        let request = match descriptor.verb {
            Verb::Read | Verb::Delete => {
                let query: Vec<(String, String)> = rest
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), scalar_text(v)))
                    .collect();
                self.client.request(method, url).query(&query)
            }
            Verb::Create | Verb::Replace | Verb::Update => {
                let body = rest.remove("body").unwrap_or(Value::Object(rest));
                self.client.request(method, url).json(&body)
            }
        };

        tracing::debug!(action = %descriptor.name, "sending backend request");
        let resp = request.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(Failure::with_status(status.as_u16(), truncate(&text)));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{CatalogueDocument, OperationSpec};
    use serde_json::json;

    fn descriptor(verb: &str, path: &str) -> ActionDescriptor {
        let doc = CatalogueDocument::from_json_str(
            &json!({"operations": [{"id": "op", "verb": verb, "path": path}]}).to_string(),
        )
        .unwrap();
        let op: &OperationSpec = &doc.operations[0];
        ActionDescriptor::from_operation(op)
    }

    #[test]
    fn test_path_placeholders_filled_and_consumed() {
        let backend = HttpBackend::new("http://localhost:8080/api/", 5).unwrap();
        let d = descriptor("PATCH", "/services/{id}/forms/{formId}");
        let (url, rest) = backend
            .build_url(&d, &json!({"id": "svc 1", "formId": 7, "title": "x"}))
            .unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/api/services/svc%201/forms/7");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest["title"], "x");
    }

    #[test]
    fn test_missing_path_parameter_is_user_fixable() {
        let backend = HttpBackend::new("http://localhost:8080", 5).unwrap();
        let d = descriptor("DELETE", "/services/{id}");
        let err = backend.build_url(&d, &json!({})).unwrap_err();
        assert_eq!(err.status, Some(400));
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(HttpBackend::new("not a url", 5).is_err());
    }

    #[test]
    fn test_client_build_error_surfaces_as_config_failure() {
        let err = Client::new().get("not a url").build().unwrap_err();
        let failure = client_build_failure(err);
        assert_eq!(failure.name.as_deref(), Some("ConfigError"));
        assert!(failure.message.starts_with("failed to build http client"));
        assert_eq!(
            crate::core::ErrorClassifier::new().classify(&failure).category,
            crate::core::FailureCategory::Fatal
        );
    }
}
