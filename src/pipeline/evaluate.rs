//! 评估器：判断已收集结果是否足以回答目标
//!
//! 结论 ∈ Accept / Replan / Fail。Replan 由 Run 状态机用最大重规划轮数约束，
//! 超出强制 Fail。评估自身出错时退为 Accept（宁可诚实总结部分结果，不让 Run 无声失败）。

use std::sync::Arc;

use serde::Deserialize;

use crate::core::AgentError;
use crate::llm::{LlmClient, Message};
use crate::pipeline::history::StepResult;
use crate::pipeline::plan::{format_result_line, extract_json_block, Plan};

/// 评估结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// 结果充分，进入总结
    Accept,
    /// 结果不足，带理由回到规划
    Replan(String),
    /// 无可挽回，终止
    Fail(String),
}

impl Verdict {
    pub fn tag(&self) -> &'static str {
        match self {
            Verdict::Accept => "accept",
            Verdict::Replan(_) => "replan",
            Verdict::Fail(_) => "fail",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Verdict::Accept => "",
            Verdict::Replan(r) | Verdict::Fail(r) => r,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VerdictSpec {
    verdict: String,
    #[serde(default)]
    reason: String,
}

/// 评估器
pub struct Evaluator {
    llm: Arc<dyn LlmClient>,
}

impl Evaluator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 评估本 Run 的全部结果
    pub async fn evaluate(
        &self,
        objective: &str,
        plan: &Plan,
        results: &[StepResult],
    ) -> Result<Verdict, AgentError> {
        let result_lines: Vec<String> = results.iter().map(format_result_line).collect();
        let step_lines: Vec<String> = plan
            .steps()
            .iter()
            .map(|s| format!("step {} [{}]: {:?}", s.index, s.tool, s.status))
            .collect();

        let system = "You judge whether collected tool results are sufficient to answer an objective.\n\
             Reply with ONLY JSON: {\"verdict\": \"accept\"|\"replan\"|\"fail\", \"reason\": \"...\"}.";
        let user = format!(
            "Objective:\n{}\n\nPlanned steps:\n{}\n\nCollected results:\n{}",
            objective,
            step_lines.join("\n"),
            if result_lines.is_empty() {
                "(none)".to_string()
            } else {
                result_lines.join("\n")
            }
        );

        let output = self
            .llm
            .complete(&[Message::system(system), Message::user(user)])
            .await
            .map_err(AgentError::Provider)?;

        let spec = extract_json_block(&output).and_then(|j| {
            serde_json::from_str::<VerdictSpec>(j).map_err(|e| AgentError::JsonParse(e.to_string()))
        });
        match spec {
            Ok(spec) => Ok(match spec.verdict.to_lowercase().as_str() {
                "replan" => Verdict::Replan(spec.reason),
                "fail" => Verdict::Fail(spec.reason),
                _ => Verdict::Accept,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "evaluator output unparsable, accepting partial results");
                Ok(Verdict::Accept)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use crate::pipeline::plan::StepSpec;

    fn plan() -> Plan {
        Plan::from_specs(
            vec![StepSpec {
                tool: "echo".into(),
                reason: "say".into(),
                depends_on: vec![],
            }],
            0,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_parses_replan_with_reason() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            r#"{"verdict": "replan", "reason": "missing the forecast"}"#,
        ]));
        let evaluator = Evaluator::new(llm);
        let v = evaluator.evaluate("obj", &plan(), &[]).await.unwrap();
        assert_eq!(v, Verdict::Replan("missing the forecast".into()));
        assert_eq!(v.tag(), "replan");
    }

    #[tokio::test]
    async fn test_unparsable_output_degrades_to_accept() {
        let llm = Arc::new(ScriptedLlm::new(vec!["looks good to me"]));
        let evaluator = Evaluator::new(llm);
        let v = evaluator.evaluate("obj", &plan(), &[]).await.unwrap();
        assert_eq!(v, Verdict::Accept);
    }
}
