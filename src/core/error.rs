//! 副驾驶错误类型与原始失败
//!
//! CopilotError 是库层统一错误；Failure 是后端 / 事件源返回的「不透明失败」，交给 ErrorClassifier 分类。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::recovery::ClassifiedFailure;

/// 副驾驶运行过程中可能出现的错误（配置、目录、策略、确认、执行）
#[derive(Error, Debug)]
pub enum CopilotError {
    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Catalogue parse error: {0}")]
    CatalogueParse(String),

    /// 同一目录中出现重复的操作标识
    #[error("Duplicate operation id: {0}")]
    DuplicateOperation(String),

    #[error("Missing operation id for {method} {path}")]
    MissingOperationId { method: String, path: String },

    #[error("Policy parse error: {0}")]
    PolicyParse(String),

    #[error("Duplicate rule name: {0}")]
    DuplicateRule(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// 被策略规则或成本上限拒绝
    #[error("Action '{action}' blocked: {message}")]
    ActionBlocked { action: String, message: String },

    #[error("Confirmation rejected for '{action}': {reason}")]
    ConfirmationRejected { action: String, reason: String },

    #[error("Action execution failed: {}", .0.message)]
    ExecutionFailed(Box<ClassifiedFailure>),

    #[error("Scope not subscribed: {0}")]
    ScopeNotSubscribed(String),

    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 不透明失败：优先携带状态码，否则依靠 name / message 文本做模式匹配
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Failure {
    /// HTTP 风格的状态码（如 429、409）
    pub status: Option<u16>,
    /// 错误名（如 TimeoutError、AbortError）
    pub name: Option<String>,
    pub message: String,
}

impl Failure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            name: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            name: None,
            message: message.into(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.status, &self.name) {
            (Some(code), _) => write!(f, "[{code}] {}", self.message),
            (None, Some(name)) => write!(f, "{name}: {}", self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

impl From<reqwest::Error> for Failure {
    fn from(err: reqwest::Error) -> Self {
        // 只有请求未送达 / 未完成的错误才按可重试命名；构建、解码、读取正文的错误交给分类器判为 Fatal，
        // 避免重放一个服务端可能已经执行过的写操作
        let name = if err.is_timeout() {
            "TimeoutError"
        } else if err.is_connect() {
            "ConnectionError"
        } else if err.is_request() {
            "NetworkError"
        } else if err.is_decode() {
            "DecodeError"
        } else if err.is_body() {
            "BodyError"
        } else if err.is_builder() {
            "RequestBuildError"
        } else {
            "HttpError"
        };
        Failure {
            status: err.status().map(|s| s.as_u16()),
            name: Some(name.to_string()),
            message: err.to_string(),
        }
    }
}
