//! 总结器：组装最终回复
//!
//! 从目标、规划理由与全部结果（含失败步骤的 advice）生成面向用户的回复。
//! 部分成功与完全失败都要诚实说明，绝不沉默：连总结 LLM 都失败时
//! 退回由结果直接拼出的固定格式回复。

use std::sync::Arc;

use crate::llm::{LlmClient, Message};
use crate::pipeline::history::StepResult;
use crate::pipeline::plan::{format_result_line, Plan};

/// 总结器
pub struct Summarizer {
    llm: Arc<dyn LlmClient>,
}

impl Summarizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 生成最终回复；plan 为 None 表示未动用工具（直接按目标作答）
    pub async fn summarize(
        &self,
        objective: &str,
        plan: Option<&Plan>,
        results: &[StepResult],
    ) -> String {
        let system = "You write the final reply to the user.\n\
             Be concise and honest: clearly report what succeeded and what failed,\n\
             include actionable next steps from any advice lines, and never pretend\n\
             a failed step worked.";
        let mut user = format!("Objective:\n{}", objective);
        if let Some(plan) = plan {
            let steps: Vec<String> = plan
                .steps()
                .iter()
                .map(|s| format!("step {} [{}]: {} ({:?})", s.index, s.tool, s.reason, s.status))
                .collect();
            user.push_str(&format!("\n\nPlanned steps:\n{}", steps.join("\n")));
        }
        if !results.is_empty() {
            let lines: Vec<String> = results.iter().map(format_result_line).collect();
            user.push_str(&format!("\n\nResults:\n{}", lines.join("\n")));
        }

        match self
            .llm
            .complete(&[Message::system(system), Message::user(user)])
            .await
        {
            Ok(reply) if !reply.trim().is_empty() => reply.trim().to_string(),
            Ok(_) | Err(_) => fallback_reply(results),
        }
    }
}

/// 总结 LLM 不可用时的兜底回复：直接按结果拼出诚实说明
fn fallback_reply(results: &[StepResult]) -> String {
    let successes: Vec<&StepResult> = results.iter().filter(|r| r.success).collect();
    let failures: Vec<&StepResult> = results.iter().filter(|r| !r.success).collect();

    if results.is_empty() {
        return "I couldn't make progress on this request. Please try again.".to_string();
    }
    let mut parts = Vec::new();
    if !successes.is_empty() {
        let data: Vec<&str> = successes.iter().filter_map(|r| r.data.as_deref()).collect();
        parts.push(format!("Here is what I found: {}", data.join("; ")));
    }
    if !failures.is_empty() {
        let errors: Vec<&str> = failures
            .iter()
            .filter_map(|r| r.error.as_deref())
            .collect();
        parts.push(format!("Some steps failed: {}", errors.join("; ")));
        if let Some(advice) = failures.iter().find_map(|r| r.advice.as_deref()) {
            parts.push(format!("Suggestion: {}", advice));
        }
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;

    struct DeadLlm;

    #[async_trait::async_trait]
    impl LlmClient for DeadLlm {
        async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
            Err("llm down".to_string())
        }
    }

    #[tokio::test]
    async fn test_fallback_is_honest_about_failures() {
        let summarizer = Summarizer::new(Arc::new(DeadLlm));
        let results = vec![
            StepResult::success(0, 1, "18°C in Berlin"),
            StepResult::failure(1, 1, "forecast service unreachable")
                .with_advice(Some("try again in a few minutes".into())),
        ];
        let reply = summarizer.summarize("weather", None, &results).await;
        assert!(reply.contains("18°C in Berlin"));
        assert!(reply.contains("forecast service unreachable"));
        assert!(reply.contains("try again in a few minutes"));
    }

    #[tokio::test]
    async fn test_total_failure_still_produces_a_reply() {
        let summarizer = Summarizer::new(Arc::new(DeadLlm));
        let reply = summarizer.summarize("weather", None, &[]).await;
        assert!(!reply.is_empty());
    }

    #[tokio::test]
    async fn test_uses_llm_reply_when_available() {
        let llm = Arc::new(ScriptedLlm::new(vec!["It is 18°C in Berlin right now."]));
        let summarizer = Summarizer::new(llm);
        let results = vec![StepResult::success(0, 1, "18°C")];
        let reply = summarizer.summarize("weather in Berlin", None, &results).await;
        assert!(reply.contains("18°C"));
    }
}
