//! 工具注册表
//!
//! Tool 统一为 invoke(args, ctx) -> ToolOutcome，成功与失败都可附带
//! 面向用户的 advice；注册表保持注册顺序（检索同分时按目录序稳定排序）。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 工具调用上下文：标识本次调用属于哪个 Run 的哪一步
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub run_id: String,
    pub step_index: usize,
    pub attempt: u32,
}

/// 工具调用结果：success 标志 + data 或 error，可选 advice（面向用户的指引）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub data: Option<String>,
    pub error: Option<String>,
    pub advice: Option<String>,
}

impl ToolOutcome {
    pub fn ok(data: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data.into()),
            error: None,
            advice: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            advice: None,
        }
    }

    pub fn with_advice(mut self, advice: impl Into<String>) -> Self {
        self.advice = Some(advice.into());
        self
    }
}

/// 工具 trait：名称、描述、参数 schema、检索相关性文本、异步调用
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（计划步骤中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema（参数生成后按此校验）
    /// 默认返回空对象，表示无参数或参数格式不限
    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 检索用的相关性文本，默认与 description 相同
    fn relevance_text(&self) -> String {
        self.description().to_string()
    }

    /// 作用域标签（多租户隔离用）
    fn scope(&self) -> &str {
        "global"
    }

    /// 执行工具
    async fn invoke(&self, args: Value, ctx: &ToolContext) -> ToolOutcome;
}

/// 工具描述符：检索与规划消费的目录条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub input_schema: Value,
    pub relevance_text: String,
    pub scope: String,
}

/// 工具注册表：按注册顺序存储 Arc<dyn Tool>，支持 register / get / descriptors
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；同名工具后注册者覆盖前者的位置
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        if let Some(&idx) = self.by_name.get(&name) {
            self.tools[idx] = Arc::new(tool);
        } else {
            self.by_name.insert(name, self.tools.len());
            self.tools.push(Arc::new(tool));
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.by_name.get(name).map(|&i| self.tools[i].clone())
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 目录快照：按注册顺序返回描述符列表
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .map(|t| ToolDescriptor {
                name: t.name().to_string(),
                input_schema: t.input_schema(),
                relevance_text: t.relevance_text(),
                scope: t.scope().to_string(),
            })
            .collect()
    }
}
