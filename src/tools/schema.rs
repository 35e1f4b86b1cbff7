//! 动作调用 JSON Schema 生成（schemars 自动生成）
//!
//! 将「合法 action call」的 JSON 结构交给推理循环注入 prompt，减少参数格式错误。

use schemars::{schema_for, JsonSchema};
use std::collections::HashMap;

/// 动作调用格式：`{"action": "...", "args": {...}}`（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ActionCallFormat {
    /// 动作名，即操作目录中的 operation id，如 delete_service
    pub action: String,
    /// 动作参数：路径参数、查询参数，变更类动作的请求体放在 body 中
    pub args: HashMap<String, serde_json::Value>,
}

/// 返回动作调用的 JSON Schema 字符串
pub fn action_call_schema_json() -> String {
    let schema = schema_for!(ActionCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_mentions_fields() {
        let schema = action_call_schema_json();
        assert!(schema.contains("\"action\""));
        assert!(schema.contains("\"args\""));
    }
}
