//! 计划：判定 + 步骤 DAG 生成
//!
//! 构造不变量：每步 depends_on 只能引用严格小于自身下标的步骤，
//! 在构造时强制（非法计划拒绝并重新生成），因此步骤图天然无环，
//! 不需要独立的环检测。下标在一个 Run 内单调递增（重规划接着编号）。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::llm::{LlmClient, Message};
use crate::pipeline::history::StepResult;
use crate::retrieval::Ranking;

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// 等待依赖满足
    Pending,
    /// 依赖已满足，等待执行
    Eligible,
    /// 正在执行
    Running,
    /// 成功
    Success,
    /// 重试耗尽后失败
    Failed,
    /// 上游失败导致永不执行
    Blocked,
    /// 被取消（与 Failed 区分）
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Failed | StepStatus::Blocked | StepStatus::Cancelled
        )
    }
}

/// 一个计划步骤：一次计划中的工具调用及其声明的依赖
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Run 内全局下标（0 起，单调分配）
    pub index: usize,
    pub tool: String,
    /// 规划理由（进入总结）
    pub reason: String,
    /// 依赖的步骤下标，均严格小于 index
    pub depends_on: Vec<usize>,
    pub status: StepStatus,
}

/// LLM 输出中的步骤（相对下标，尚未校验）
#[derive(Debug, Clone, Deserialize)]
pub struct StepSpec {
    pub tool: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct PlanSpec {
    steps: Vec<StepSpec>,
}

/// 一段计划（一次规划或重规划产生的步骤序列）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    steps: Vec<PlanStep>,
    /// 本段首步的 Run 内下标
    base_index: usize,
}

impl Plan {
    /// 从 LLM 步骤列表构造；depends_on 为段内相对下标，整体平移 base_index。
    /// 任何自引用 / 前向引用在此处拒绝（Dependency 错误）。
    pub fn from_specs(specs: Vec<StepSpec>, base_index: usize) -> Result<Self, AgentError> {
        let mut steps = Vec::with_capacity(specs.len());
        for (rel, spec) in specs.into_iter().enumerate() {
            for &dep in &spec.depends_on {
                if dep >= rel {
                    return Err(AgentError::Dependency(format!(
                        "step {} depends on {} (must reference an earlier step)",
                        rel, dep
                    )));
                }
            }
            let mut depends_on: Vec<usize> =
                spec.depends_on.iter().map(|&d| d + base_index).collect();
            depends_on.sort_unstable();
            depends_on.dedup();
            steps.push(PlanStep {
                index: base_index + rel,
                tool: spec.tool,
                reason: spec.reason,
                depends_on,
                status: StepStatus::Pending,
            });
        }
        Ok(Self { steps, base_index })
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn steps_mut(&mut self) -> &mut [PlanStep] {
        &mut self.steps
    }

    /// 按 Run 内下标取步骤
    pub fn step(&self, index: usize) -> Option<&PlanStep> {
        index
            .checked_sub(self.base_index)
            .and_then(|rel| self.steps.get(rel))
    }

    pub fn step_mut(&mut self, index: usize) -> Option<&mut PlanStep> {
        index
            .checked_sub(self.base_index)
            .and_then(|rel| self.steps.get_mut(rel))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 下一段计划应使用的起始下标
    pub fn next_index(&self) -> usize {
        self.base_index + self.steps.len()
    }

    /// 合并一段后续计划（段下标必须与 next_index 衔接，重规划时累积全量快照）
    pub fn merge(&mut self, segment: &Plan) {
        debug_assert_eq!(segment.base_index, self.next_index());
        self.steps.extend(segment.steps.iter().cloned());
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.tool.clone()).collect()
    }
}

/// 判定结果：是否需要工具
#[derive(Debug, Clone, Deserialize)]
pub struct Judgement {
    pub needs_tools: bool,
    #[serde(default = "default_true")]
    pub ok: bool,
    #[serde(default)]
    pub estimated_operations: u32,
}

fn default_true() -> bool {
    true
}

/// 从 LLM 输出中提取 JSON 块（```json ... ``` 或首个花括号区间）
pub(crate) fn extract_json_block(output: &str) -> Result<&str, AgentError> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Ok(rest
            .find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or_else(|| rest.trim()));
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => Ok(&trimmed[start..=end]),
        _ => Err(AgentError::JsonParse(format!(
            "no JSON object in output: {}",
            crate::pipeline::events::preview(trimmed, 120)
        ))),
    }
}

/// Planner：判定是否需要工具，并生成步骤 DAG
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    max_plan_attempts: u32,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, max_plan_attempts: u32) -> Self {
        Self {
            llm,
            max_plan_attempts: max_plan_attempts.max(1),
        }
    }

    /// 判定目标是否需要工具
    pub async fn judge(&self, objective: &str, shortlist: &Ranking) -> Result<Judgement, AgentError> {
        let tools = shortlist.names().join(", ");
        let system = "You decide whether external tools are required to satisfy an objective.\n\
             Reply with ONLY a JSON object: {\"needs_tools\": bool, \"ok\": bool, \"estimated_operations\": int}.";
        let user = format!("Objective:\n{}\n\nAvailable tools: [{}]", objective, tools);

        let mut last_err = String::new();
        for _ in 0..self.max_plan_attempts {
            let output = self
                .llm
                .complete(&[Message::system(system), Message::user(&user)])
                .await
                .map_err(AgentError::Provider)?;
            match extract_json_block(&output)
                .and_then(|j| serde_json::from_str::<Judgement>(j).map_err(|e| AgentError::JsonParse(e.to_string())))
            {
                Ok(judgement) => return Ok(judgement),
                Err(e) => last_err = e.to_string(),
            }
        }
        Err(AgentError::JsonParse(format!(
            "judge output unparsable after {} attempts: {}",
            self.max_plan_attempts, last_err
        )))
    }

    /// 生成一段计划。replan_context 为重规划时的既有结果；base_index 延续 Run 内编号。
    /// 非法计划（未知工具 / 前向 / 自引用依赖）拒绝并重新生成，直到尝试耗尽。
    pub async fn plan(
        &self,
        objective: &str,
        shortlist: &Ranking,
        replan_context: Option<&[StepResult]>,
        base_index: usize,
    ) -> Result<Plan, AgentError> {
        let tool_lines: Vec<String> = shortlist
            .tools
            .iter()
            .map(|t| {
                format!(
                    "- {}: {} (schema: {})",
                    t.descriptor.name, t.descriptor.relevance_text, t.descriptor.input_schema
                )
            })
            .collect();

        let mut user = format!(
            "Objective:\n{}\n\nAvailable tools:\n{}\n\n\
             Produce an execution plan as JSON:\n\
             {{\"steps\": [{{\"tool\": \"name\", \"reason\": \"why\", \"depends_on\": [indices]}}]}}\n\
             depends_on lists 0-based indices of earlier steps in THIS plan whose results the step needs.",
            objective,
            tool_lines.join("\n")
        );
        if let Some(results) = replan_context {
            if !results.is_empty() {
                let lines: Vec<String> = results.iter().map(format_result_line).collect();
                user.push_str(&format!(
                    "\n\nPrevious attempt produced these results; plan only the remaining work:\n{}",
                    lines.join("\n")
                ));
            }
        }
        let system = "You are a planning assistant. Reply with ONLY the JSON plan object.";

        let mut feedback: Option<String> = None;
        let mut last_err = AgentError::JsonParse("plan generation not attempted".to_string());
        for _ in 0..self.max_plan_attempts {
            let mut messages = vec![Message::system(system), Message::user(&user)];
            if let Some(fb) = &feedback {
                messages.push(Message::user(format!(
                    "The previous plan was rejected: {}. Produce a corrected JSON plan.",
                    fb
                )));
            }
            let output = self
                .llm
                .complete(&messages)
                .await
                .map_err(AgentError::Provider)?;

            let parsed = extract_json_block(&output).and_then(|j| {
                serde_json::from_str::<PlanSpec>(j).map_err(|e| AgentError::JsonParse(e.to_string()))
            });
            let spec = match parsed {
                Ok(spec) => spec,
                Err(e) => {
                    feedback = Some(e.to_string());
                    last_err = e;
                    continue;
                }
            };

            if let Some(unknown) = spec
                .steps
                .iter()
                .find(|s| !shortlist.tools.iter().any(|t| t.descriptor.name == s.tool))
            {
                let e = AgentError::Validation(format!("unknown tool in plan: {}", unknown.tool));
                feedback = Some(e.to_string());
                last_err = e;
                continue;
            }

            match Plan::from_specs(spec.steps, base_index) {
                Ok(plan) if !plan.is_empty() => return Ok(plan),
                Ok(_) => {
                    let e = AgentError::Validation("plan has no steps".to_string());
                    feedback = Some(e.to_string());
                    last_err = e;
                }
                Err(e) => {
                    feedback = Some(e.to_string());
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

/// 结果行的统一文本格式（规划 / 评估 / 总结共用）
pub(crate) fn format_result_line(r: &StepResult) -> String {
    if r.success {
        format!(
            "step {} attempt {}: ok -> {}",
            r.step_index,
            r.attempt,
            r.data.as_deref().unwrap_or("")
        )
    } else {
        let advice = r
            .advice
            .as_deref()
            .map(|a| format!(" (advice: {})", a))
            .unwrap_or_default();
        format!(
            "step {} attempt {}: failed -> {}{}",
            r.step_index,
            r.attempt,
            r.error.as_deref().unwrap_or("unknown error"),
            advice
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalSection;
    use crate::llm::ScriptedLlm;
    use crate::retrieval::RetrievalPipeline;
    use crate::tools::ToolDescriptor;
    use std::sync::Arc;

    fn spec(tool: &str, deps: Vec<usize>) -> StepSpec {
        StepSpec {
            tool: tool.to_string(),
            reason: String::new(),
            depends_on: deps,
        }
    }

    #[test]
    fn test_plan_rejects_self_reference() {
        let err = Plan::from_specs(vec![spec("a", vec![0])], 0).unwrap_err();
        assert!(matches!(err, AgentError::Dependency(_)));
    }

    #[test]
    fn test_plan_rejects_forward_reference() {
        let err = Plan::from_specs(vec![spec("a", vec![]), spec("b", vec![2])], 0).unwrap_err();
        assert!(matches!(err, AgentError::Dependency(_)));
    }

    #[test]
    fn test_plan_indices_strictly_decreasing_dependencies() {
        let plan = Plan::from_specs(
            vec![spec("a", vec![]), spec("b", vec![0]), spec("c", vec![0, 1])],
            0,
        )
        .unwrap();
        for step in plan.steps() {
            for &dep in &step.depends_on {
                assert!(dep < step.index);
            }
        }
    }

    #[test]
    fn test_plan_base_index_offset() {
        let plan = Plan::from_specs(vec![spec("a", vec![]), spec("b", vec![0])], 5).unwrap();
        assert_eq!(plan.steps()[0].index, 5);
        assert_eq!(plan.steps()[1].depends_on, vec![5]);
        assert_eq!(plan.next_index(), 7);
        assert!(plan.step(5).is_some());
        assert!(plan.step(4).is_none());
    }

    #[test]
    fn test_extract_json_fenced_and_bare() {
        let fenced = "thinking...\n```json\n{\"a\": 1}\n```";
        assert_eq!(extract_json_block(fenced).unwrap(), "{\"a\": 1}");
        let bare = "result {\"a\": 1} trailing";
        assert_eq!(extract_json_block(bare).unwrap(), "{\"a\": 1}");
        assert!(extract_json_block("no json here").is_err());
    }

    async fn shortlist_for(names: &[&str]) -> Ranking {
        // 空目标走恒等路径，目录原样返回
        let catalog: Vec<ToolDescriptor> = names
            .iter()
            .map(|n| ToolDescriptor {
                name: n.to_string(),
                input_schema: serde_json::json!({"type": "object"}),
                relevance_text: n.to_string(),
                scope: "global".to_string(),
            })
            .collect();
        let pipeline = RetrievalPipeline::new(
            Arc::new(crate::llm::HashEmbedder::default()),
            RetrievalSection::default(),
        );
        pipeline.rank("", &catalog).await
    }

    #[tokio::test]
    async fn test_planner_regenerates_after_invalid_plan() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            // 第一次：前向引用，被拒绝
            r#"{"steps": [{"tool": "echo", "reason": "x", "depends_on": [1]}, {"tool": "echo", "reason": "y", "depends_on": []}]}"#,
            // 第二次：合法
            r#"{"steps": [{"tool": "echo", "reason": "x", "depends_on": []}]}"#,
        ]));
        let planner = Planner::new(llm.clone(), 3);
        let shortlist = shortlist_for(&["echo"]).await;
        let plan = planner.plan("say hi", &shortlist, None, 0).await.unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(llm.seen_prompts().len(), 2);
    }

    #[tokio::test]
    async fn test_planner_rejects_unknown_tool_until_exhausted() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            r#"{"steps": [{"tool": "ghost", "reason": "", "depends_on": []}]}"#,
            r#"{"steps": [{"tool": "ghost", "reason": "", "depends_on": []}]}"#,
        ]));
        let planner = Planner::new(llm, 2);
        let shortlist = shortlist_for(&["echo"]).await;
        let err = planner.plan("x", &shortlist, None, 0).await.unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }

    #[tokio::test]
    async fn test_judge_parses_output() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            r#"{"needs_tools": true, "ok": true, "estimated_operations": 2}"#,
        ]));
        let planner = Planner::new(llm, 3);
        let shortlist = shortlist_for(&["echo"]).await;
        let j = planner.judge("look up weather", &shortlist).await.unwrap();
        assert!(j.needs_tools);
        assert_eq!(j.estimated_operations, 2);
    }
}
