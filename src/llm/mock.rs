//! Mock LLM 客户端（用于测试与离线 Demo，无需 API）

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

/// Mock 客户端：判定提示一律回「无需工具」，其余回显用户最后一条消息，
/// 便于离线跑通 判定 → 总结 的直答链路
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if messages
            .iter()
            .any(|m| m.content.contains("\"needs_tools\""))
        {
            return Ok(
                r#"{"needs_tools": false, "ok": true, "estimated_operations": 0}"#.to_string(),
            );
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(format!("Echo from Mock: {}", last_user))
    }
}

/// 脚本化客户端：按队列依次吐出预置回复，并记录收到的 prompt（测试用）
#[derive(Default)]
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<String>>,
    /// 每次 complete 收到的全部消息拼接（供测试断言上下文内容）
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<&str>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(String::from).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn push_reply(&self, reply: &str) {
        self.replies.lock().unwrap().push_back(reply.to_string());
    }

    /// 收到过的 prompt 快照
    pub fn seen_prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let joined = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts.lock().unwrap().push(joined);

        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| "scripted llm exhausted".to_string())
    }
}
