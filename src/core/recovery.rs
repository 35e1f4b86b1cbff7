//! 失败分类与恢复策略
//!
//! ErrorClassifier 把任意 Failure 映射为 ClassifiedFailure（类别 + 恢复策略 + 用户提示），
//! 供 ActionExecutor 决定是退避重试、刷新后重试、询问用户还是终止。分类是全函数，从不 panic。

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

use crate::core::Failure;

/// 失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// 瞬时错误，可退避重试
    Retryable,
    /// 并发修改冲突，刷新状态后可重试
    Conflict,
    /// 输入有误，需要人工修正
    UserFixable,
    Fatal,
}

/// 恢复策略（与类别一一对应）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    ExponentialBackoff,
    RefreshAndRetry,
    PromptUser,
    Abort,
}

impl FailureCategory {
    pub fn strategy(self) -> RecoveryStrategy {
        match self {
            FailureCategory::Retryable => RecoveryStrategy::ExponentialBackoff,
            FailureCategory::Conflict => RecoveryStrategy::RefreshAndRetry,
            FailureCategory::UserFixable => RecoveryStrategy::PromptUser,
            FailureCategory::Fatal => RecoveryStrategy::Abort,
        }
    }

    pub fn can_auto_heal(self) -> bool {
        matches!(self, FailureCategory::Retryable | FailureCategory::Conflict)
    }
}

/// 分类结果：原始失败 + 类别 + 策略 + 面向用户的提示
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedFailure {
    pub original: Failure,
    pub status: Option<u16>,
    pub category: FailureCategory,
    pub strategy: RecoveryStrategy,
    pub message: String,
    pub can_auto_heal: bool,
    pub remediation: Option<String>,
}

const NETWORK_PATTERN: &str = r"(?i)econnrefused|connection refused|econnreset|connection reset|enotfound|getaddrinfo|\bdns\b|network|fetch failed|socket hang up|connectionerror";
const TIMEOUT_PATTERN: &str = r"(?i)timeout|timed out|aborterror|\babort(ed)?\b";

const GENERIC_MESSAGE: &str = "The operation failed and cannot be retried safely.";

/// 状态码 -> 类别（未列出的状态码一律 Fatal）
fn category_for_status(code: u16) -> FailureCategory {
    match code {
        429 | 502 | 503 | 504 => FailureCategory::Retryable,
        409 => FailureCategory::Conflict,
        400 | 422 => FailureCategory::UserFixable,
        _ => FailureCategory::Fatal,
    }
}

fn message_for_status(code: u16) -> &'static str {
    match code {
        400 => "The request was rejected because some input is invalid.",
        401 => "The session is not authenticated.",
        403 => "You do not have permission to perform this operation.",
        404 => "The requested resource no longer exists.",
        409 => "Someone else modified this resource at the same time.",
        422 => "The submitted data failed validation.",
        429 => "The backend is rate limiting requests.",
        500 => "The backend hit an internal error.",
        502 | 503 | 504 => "The backend is temporarily unavailable.",
        _ => GENERIC_MESSAGE,
    }
}

fn remediation_for_status(code: u16) -> Option<&'static str> {
    match code {
        400 | 422 => Some("Review the highlighted fields, correct the values and submit again."),
        401 => Some("Sign in again and repeat the request."),
        403 => Some("Ask an administrator for access to this resource."),
        404 => Some("Refresh the entity list; the target may have been deleted."),
        409 => Some("The latest state will be reloaded before the change is reapplied."),
        429 => Some("Requests will be retried after a short wait."),
        _ => None,
    }
}

static NETWORK_RE: OnceLock<Option<Regex>> = OnceLock::new();
static TIMEOUT_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// 常量模式只编译一次；编译失败时视为不命中
fn pattern_matches(cell: &'static OnceLock<Option<Regex>>, pattern: &str, text: &str) -> bool {
    cell.get_or_init(|| Regex::new(pattern).ok())
        .as_ref()
        .is_some_and(|re| re.is_match(text))
}

/// 失败分类器（文本模式为进程级共享的静态正则）
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// 分类：状态码优先；否则匹配 name / message；都不命中则 Fatal
    pub fn classify(&self, failure: &Failure) -> ClassifiedFailure {
        if let Some(code) = failure.status {
            let category = category_for_status(code);
            return self.build(failure, category, message_for_status(code), remediation_for_status(code));
        }

        let text = match &failure.name {
            Some(name) => format!("{name} {}", failure.message),
            None => failure.message.clone(),
        };
        if pattern_matches(&NETWORK_RE, NETWORK_PATTERN, &text) {
            return self.build(
                failure,
                FailureCategory::Retryable,
                "The backend could not be reached.",
                Some("The connection will be retried automatically."),
            );
        }
        if pattern_matches(&TIMEOUT_RE, TIMEOUT_PATTERN, &text) {
            return self.build(
                failure,
                FailureCategory::Retryable,
                "The request timed out.",
                Some("The request will be retried automatically."),
            );
        }

        self.build(failure, FailureCategory::Fatal, GENERIC_MESSAGE, None)
    }

    fn build(
        &self,
        failure: &Failure,
        category: FailureCategory,
        message: &str,
        remediation: Option<&str>,
    ) -> ClassifiedFailure {
        ClassifiedFailure {
            original: failure.clone(),
            status: failure.status,
            category,
            strategy: category.strategy(),
            message: message.to_string(),
            can_auto_heal: category.can_auto_heal(),
            remediation: remediation.map(str::to_string),
        }
    }
}

/// 指数退避：delay = base * 2^attempt，封顶 max
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms.max(base_ms)),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}
