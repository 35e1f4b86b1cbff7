//! Bee Copilot - 配置型副驾驶的治理内核
//!
//! 模块划分：
//! - **agent**: 会话运行时，装配下列组件
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **confirm**: 人工确认队列（一次只展示一项）
//! - **core**: 错误类型、失败分类与恢复、会话状态与监管
//! - **observability**: 日志初始化与审计辅助
//! - **policy**: 规则表达式、策略文档与求值
//! - **sync**: 实体事件 → 作用域上下文快照
//! - **tools**: 操作目录、描述符、注册表与受治理的执行器

pub mod agent;
pub mod config;
pub mod confirm;
pub mod core;
pub mod observability;
pub mod policy;
pub mod sync;
pub mod tools;

pub use agent::Copilot;
