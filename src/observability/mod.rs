//! 可观测性
//!
//! 默认 info 级别，可用 RUST_LOG 覆盖；操作审计以 `audit` 字段输出一行 JSON。

use serde_json::Value;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// 参数预览上限（字符）
pub const PREVIEW_CHARS: usize = 200;

/// 参数截断预览，用于审计行
pub fn preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() <= PREVIEW_CHARS {
        return s;
    }
    let mut out: String = s.chars().take(PREVIEW_CHARS).collect();
    out.push('…');
    out
}
