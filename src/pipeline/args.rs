//! 参数生成
//!
//! 对每个步骤，从历史日志装配其祖先结果（按预计算的祖先下标集过滤，
//! 绝不按日志顺序取——并行分支交错追加时仍只见祖先），重试时附带本步
//! 先前失败的尝试（include_current_step）。生成的参数按工具 schema 校验，
//! 校验失败视为规划层缺陷：不派发工具，只在限定次数内重生成参数。

use std::sync::Arc;

use serde_json::Value;

use crate::core::AgentError;
use crate::llm::{LlmClient, Message};
use crate::pipeline::history::{ancestor_indices, StepResult};
use crate::pipeline::plan::{format_result_line, extract_json_block, Plan, PlanStep};
use crate::tools::ToolDescriptor;

/// 参数生成器
pub struct ArgumentGenerator {
    llm: Arc<dyn LlmClient>,
    max_args_attempts: u32,
}

impl ArgumentGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, max_args_attempts: u32) -> Self {
        Self {
            llm,
            max_args_attempts: max_args_attempts.max(1),
        }
    }

    /// 为某步生成具体调用参数
    ///
    /// include_current_step=true 时（重试场景），本步此前的失败尝试
    /// 也进入可见上下文，供模型自我纠正。
    pub async fn generate(
        &self,
        objective: &str,
        plan: &Plan,
        step: &PlanStep,
        descriptor: &ToolDescriptor,
        history: &[StepResult],
        include_current_step: bool,
    ) -> Result<Value, AgentError> {
        let context = assemble_context(plan, step, history, include_current_step);

        let system = "You produce tool-call arguments. Reply with ONLY a JSON object matching the tool's input schema.";
        let mut user = format!(
            "Objective:\n{}\n\nTool: {}\nPurpose of this step: {}\nInput schema: {}",
            objective, descriptor.name, step.reason, descriptor.input_schema
        );
        if !context.is_empty() {
            user.push_str(&format!("\n\nResults from dependency steps:\n{}", context));
        }

        let mut feedback: Option<String> = None;
        let mut last_err = String::new();
        for _ in 0..self.max_args_attempts {
            let mut messages = vec![Message::system(system), Message::user(&user)];
            if let Some(fb) = &feedback {
                messages.push(Message::user(format!(
                    "The previous arguments were rejected: {}. Produce corrected JSON arguments.",
                    fb
                )));
            }
            let output = self
                .llm
                .complete(&messages)
                .await
                .map_err(AgentError::Provider)?;

            let args = match extract_json_block(&output)
                .and_then(|j| serde_json::from_str::<Value>(j).map_err(|e| AgentError::JsonParse(e.to_string())))
            {
                Ok(v) => v,
                Err(e) => {
                    last_err = e.to_string();
                    feedback = Some(last_err.clone());
                    continue;
                }
            };

            match validate_args(&descriptor.input_schema, &args) {
                Ok(()) => return Ok(args),
                Err(reason) => {
                    last_err = reason.clone();
                    feedback = Some(reason);
                }
            }
        }
        Err(AgentError::Validation(format!(
            "arguments for tool {} rejected after {} attempts: {}",
            descriptor.name, self.max_args_attempts, last_err
        )))
    }
}

/// 装配某步的可见上下文：仅祖先结果（传递闭包），重试时附带本步先前尝试
pub(crate) fn assemble_context(
    plan: &Plan,
    step: &PlanStep,
    history: &[StepResult],
    include_current_step: bool,
) -> String {
    let ancestors = ancestor_indices(plan, step.index);

    let mut lines: Vec<String> = history
        .iter()
        .filter(|r| ancestors.contains(&r.step_index) && r.success)
        .map(format_result_line)
        .collect();

    if include_current_step {
        let own: Vec<String> = history
            .iter()
            .filter(|r| r.step_index == step.index)
            .map(|r| format!("(this step, prior attempt) {}", format_result_line(r)))
            .collect();
        lines.extend(own);
    }

    lines.join("\n")
}

/// 按 JSON Schema 的实用子集校验参数：顶层类型与 required 属性
pub(crate) fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let schema_type = schema.get("type").and_then(|t| t.as_str());
    match schema_type {
        Some("object") | None => {
            let Some(obj) = args.as_object() else {
                return Err("arguments must be a JSON object".to_string());
            };
            if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
                for key in required.iter().filter_map(|k| k.as_str()) {
                    if !obj.contains_key(key) {
                        return Err(format!("missing required property: {}", key));
                    }
                }
            }
            if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
                for (key, prop_schema) in props {
                    if let (Some(value), Some(expected)) =
                        (obj.get(key), prop_schema.get("type").and_then(|t| t.as_str()))
                    {
                        if !type_matches(expected, value) {
                            return Err(format!("property {} should be {}", key, expected));
                        }
                    }
                }
            }
            Ok(())
        }
        Some(other) => {
            if type_matches(other, args) {
                Ok(())
            } else {
                Err(format!("arguments should be of type {}", other))
            }
        }
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use crate::pipeline::plan::StepSpec;
    use serde_json::json;

    fn diamond_plan() -> Plan {
        // 0 与 1 为独立分支，2 汇聚两者；3 与它们无关
        Plan::from_specs(
            vec![
                StepSpec { tool: "left".into(), reason: String::new(), depends_on: vec![] },
                StepSpec { tool: "right".into(), reason: String::new(), depends_on: vec![] },
                StepSpec { tool: "join".into(), reason: String::new(), depends_on: vec![0, 1] },
                StepSpec { tool: "stray".into(), reason: String::new(), depends_on: vec![] },
            ],
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_context_is_union_of_branches_only() {
        let plan = diamond_plan();
        // 历史按交错顺序追加，且混入无关步骤 3 的结果
        let history = vec![
            StepResult::success(1, 1, "right-data"),
            StepResult::success(3, 1, "stray-data"),
            StepResult::success(0, 1, "left-data"),
        ];
        let join = plan.step(2).unwrap();
        let ctx = assemble_context(&plan, join, &history, false);
        assert!(ctx.contains("left-data"));
        assert!(ctx.contains("right-data"));
        assert!(!ctx.contains("stray-data"));
    }

    #[test]
    fn test_context_includes_own_failures_only_on_retry() {
        let plan = diamond_plan();
        let history = vec![
            StepResult::success(0, 1, "left-data"),
            StepResult::success(1, 1, "right-data"),
            StepResult::failure(2, 1, "join exploded"),
        ];
        let join = plan.step(2).unwrap();

        let without = assemble_context(&plan, join, &history, false);
        assert!(!without.contains("join exploded"));

        let with = assemble_context(&plan, join, &history, true);
        assert!(with.contains("join exploded"));
        assert!(with.contains("prior attempt"));
    }

    #[test]
    fn test_validate_args_required_and_types() {
        let schema = json!({
            "type": "object",
            "properties": {
                "city": {"type": "string"},
                "days": {"type": "integer"}
            },
            "required": ["city"]
        });
        assert!(validate_args(&schema, &json!({"city": "Berlin"})).is_ok());
        assert!(validate_args(&schema, &json!({"days": 3})).is_err());
        assert!(validate_args(&schema, &json!({"city": 42})).is_err());
        assert!(validate_args(&schema, &json!("not an object")).is_err());
    }

    #[tokio::test]
    async fn test_generator_regenerates_on_schema_violation() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            r#"{"days": 3}"#,              // 缺少 required city，被拒
            r#"{"city": "Berlin"}"#,       // 合法
        ]));
        let generator = ArgumentGenerator::new(llm.clone(), 3);
        let plan = Plan::from_specs(
            vec![StepSpec { tool: "weather_lookup".into(), reason: "get weather".into(), depends_on: vec![] }],
            0,
        )
        .unwrap();
        let descriptor = ToolDescriptor {
            name: "weather_lookup".into(),
            input_schema: json!({
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"]
            }),
            relevance_text: "weather".into(),
            scope: "global".into(),
        };
        let args = generator
            .generate("weather in Berlin", &plan, plan.step(0).unwrap(), &descriptor, &[], false)
            .await
            .unwrap();
        assert_eq!(args["city"], "Berlin");
        assert_eq!(llm.seen_prompts().len(), 2);
    }

    #[tokio::test]
    async fn test_generator_gives_up_after_bound() {
        let llm = Arc::new(ScriptedLlm::new(vec![r#"{"days": 1}"#, r#"{"days": 2}"#]));
        let generator = ArgumentGenerator::new(llm, 2);
        let plan = Plan::from_specs(
            vec![StepSpec { tool: "t".into(), reason: String::new(), depends_on: vec![] }],
            0,
        )
        .unwrap();
        let descriptor = ToolDescriptor {
            name: "t".into(),
            input_schema: json!({"type": "object", "required": ["city"]}),
            relevance_text: String::new(),
            scope: "global".into(),
        };
        let err = generator
            .generate("x", &plan, plan.step(0).unwrap(), &descriptor, &[], false)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }
}
