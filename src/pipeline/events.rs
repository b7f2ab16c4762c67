//! Run 过程事件：用于流式展示判定、规划、参数、工具结果、评估与总结

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

/// 单个 Run 的过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// 是否需要工具的判定结果
    Judge {
        needs_tools: bool,
        estimated_operations: u32,
    },
    /// 计划生成完成
    Plan {
        step_count: usize,
        tools: Vec<String>,
    },
    /// 某步参数生成完成
    Args {
        step_index: usize,
        attempt: u32,
        args: serde_json::Value,
    },
    /// 某步某次尝试的工具结果（预览，避免过长）
    ToolResult {
        step_index: usize,
        attempt: u32,
        tool: String,
        success: bool,
        preview: String,
    },
    /// 评估结论
    Evaluate { verdict: String, reason: String },
    /// 最终回复
    Summary { text: String },
    /// 错误
    Error { text: String },
}

pub(crate) fn send_event(tx: &Option<&UnboundedSender<RunEvent>>, ev: RunEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

/// 截断预览文本
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    let p: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        format!("{}...", p)
    } else {
        p
    }
}
