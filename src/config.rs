//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE_COPILOT__*` 覆盖（双下划线表示嵌套，如 `BEE_COPILOT__POLICY__MAX_SESSION_COST=5`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub policy: PolicySection,
    pub sync: SyncSection,
    pub recovery: RecoverySection,
    pub tools: ToolsSection,
}

/// [app] 段：应用名、操作目录与策略文件位置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 操作目录（原生 JSON/TOML 或 OpenAPI 文档）
    pub catalogue_path: Option<PathBuf>,
    /// 策略文件，未设置时只使用 [policy] 段的默认设置
    pub policy_path: Option<PathBuf>,
}

/// [policy] 段：策略文件缺省时的全局设置
#[derive(Debug, Clone, Deserialize)]
pub struct PolicySection {
    #[serde(default = "default_max_session_cost")]
    pub max_session_cost: f64,
    #[serde(default = "default_true")]
    pub confirmations_enabled: bool,
    /// 确认请求无人响应时自动撤回（秒）
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
}

fn default_max_session_cost() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

fn default_confirmation_timeout_secs() -> u64 {
    300
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            max_session_cost: default_max_session_cost(),
            confirmations_enabled: true,
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
        }
    }
}

/// [sync] 段：去重窗口、命令通道容量与事件源重连
#[derive(Debug, Clone, Deserialize)]
pub struct SyncSection {
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// 连续失败超过此次数后进入降级状态
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
}

fn default_dedup_capacity() -> usize {
    1000
}

fn default_channel_capacity() -> usize {
    256
}

fn default_reconnect_base_delay_ms() -> u64 {
    500
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_reconnect_max_attempts() -> u32 {
    10
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            dedup_capacity: default_dedup_capacity(),
            channel_capacity: default_channel_capacity(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
        }
    }
}

/// [recovery] 段：可自动恢复失败的重试次数与退避
#[derive(Debug, Clone, Deserialize)]
pub struct RecoverySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    250
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// [tools] 段：单次操作超时与后端地址
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
    pub base_url: Option<String>,
}

fn default_action_timeout_secs() -> u64 {
    30
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            action_timeout_secs: default_action_timeout_secs(),
            base_url: None,
        }
    }
}

/// 从 config 目录加载配置，环境变量 BEE_COPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEE_COPILOT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEE_COPILOT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（调用方决定是否据此重建策略与执行器）
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
