//! Echo 工具（Demo / 测试用）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::{Tool, ToolContext, ToolOutcome};

/// Echo 参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct EchoArgs {
    /// 要回显的文本
    pub text: String,
}

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back. Args: {\"text\": \"message\"}"
    }

    fn input_schema(&self) -> Value {
        serde_json::to_value(schemars::schema_for!(EchoArgs))
            .unwrap_or_else(|_| serde_json::json!({"type": "object"}))
    }

    async fn invoke(&self, args: Value, _ctx: &ToolContext) -> ToolOutcome {
        match serde_json::from_value::<EchoArgs>(args) {
            Ok(parsed) => ToolOutcome::ok(parsed.text),
            Err(e) => ToolOutcome::fail(format!("invalid args: {}", e)),
        }
    }
}
