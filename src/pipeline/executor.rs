//! DAG 执行器
//!
//! 依赖满足即就绪，就绪步骤并发执行（Run 内信号量限流）；每次尝试施加
//! 单步超时，失败按指数退避重试并带上先前失败重新生成参数。
//! 写前读不变量：每次尝试的结果先落历史日志，其终态消息后到调度环，
//! 因此依赖方转为就绪时其依赖的结果必然已可读。
//! 步骤重试耗尽转 Failed，其直接与传递依赖方标记 Blocked 永不执行；
//! Run 带着既有部分结果继续进入评估。取消则中止在飞调用并记为 Cancelled。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorSection;
use crate::core::AgentError;
use crate::pipeline::args::ArgumentGenerator;
use crate::pipeline::events::{preview, send_event, RunEvent};
use crate::pipeline::history::{HistoryStore, StepResult};
use crate::pipeline::plan::{Plan, PlanStep, StepStatus};
use crate::tools::{ToolContext, ToolOutcome, ToolRegistry};

const RESULT_PREVIEW_CHARS: usize = 200;

/// DAG 执行器：对一段计划执行到全部步骤终态
pub struct DagExecutor {
    registry: Arc<ToolRegistry>,
    history: Arc<dyn HistoryStore>,
    generator: Arc<ArgumentGenerator>,
    cfg: ExecutorSection,
}

impl DagExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        history: Arc<dyn HistoryStore>,
        generator: Arc<ArgumentGenerator>,
        cfg: ExecutorSection,
    ) -> Self {
        Self {
            registry,
            history,
            generator,
            cfg,
        }
    }

    /// 执行计划段；正常完成（含部分失败）返回 Ok，取消返回 Err(Cancelled)
    pub async fn execute(
        &self,
        run_id: &str,
        objective: &str,
        plan: &mut Plan,
        cancel: &CancellationToken,
        event_tx: Option<UnboundedSender<RunEvent>>,
    ) -> Result<(), AgentError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, StepStatus)>();
        let semaphore = Arc::new(Semaphore::new(self.cfg.max_parallel_steps.max(1)));
        let plan_snapshot = Arc::new(plan.clone());
        let mut running = 0usize;

        loop {
            if !cancel.is_cancelled() {
                promote_eligible(plan);
                for step in plan.steps_mut() {
                    if step.status != StepStatus::Eligible {
                        continue;
                    }
                    step.status = StepStatus::Running;
                    running += 1;
                    self.spawn_step(
                        run_id,
                        objective,
                        plan_snapshot.clone(),
                        step.clone(),
                        semaphore.clone(),
                        cancel.clone(),
                        tx.clone(),
                        event_tx.clone(),
                    );
                }
            }

            if running == 0 {
                if cancel.is_cancelled() {
                    for step in plan.steps_mut() {
                        if !step.status.is_terminal() {
                            step.status = StepStatus::Cancelled;
                        }
                    }
                    return Err(AgentError::Cancelled);
                }
                if plan.steps().iter().all(|s| s.status.is_terminal()) {
                    return Ok(());
                }
                // 不应到达：无在飞、无就绪却有未终态步骤；一律视为被阻塞
                block_unreachable(plan);
                return Ok(());
            }

            if let Some((index, terminal)) = rx.recv().await {
                running -= 1;
                if let Some(step) = plan.step_mut(index) {
                    step.status = terminal;
                }
                if terminal != StepStatus::Success {
                    block_dependents(plan);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_step(
        &self,
        run_id: &str,
        objective: &str,
        plan: Arc<Plan>,
        step: PlanStep,
        semaphore: Arc<Semaphore>,
        cancel: CancellationToken,
        tx: UnboundedSender<(usize, StepStatus)>,
        event_tx: Option<UnboundedSender<RunEvent>>,
    ) {
        let run_id = run_id.to_string();
        let objective = objective.to_string();
        let registry = self.registry.clone();
        let history = self.history.clone();
        let generator = self.generator.clone();
        let cfg = self.cfg.clone();

        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                let _ = tx.send((step.index, StepStatus::Cancelled));
                return;
            };
            let terminal = run_step_attempts(
                &run_id,
                &objective,
                &plan,
                &step,
                registry,
                history,
                generator,
                &cfg,
                &cancel,
                &event_tx,
            )
            .await;
            // 终态消息必须晚于结果落盘（run_step_attempts 内部保证先 append）
            let _ = tx.send((step.index, terminal));
        });
    }
}

/// 将依赖全部成功的 Pending 步骤提升为 Eligible
fn promote_eligible(plan: &mut Plan) {
    let successes: HashSet<usize> = plan
        .steps()
        .iter()
        .filter(|s| s.status == StepStatus::Success)
        .map(|s| s.index)
        .collect();
    for step in plan.steps_mut() {
        if step.status == StepStatus::Pending
            && step.depends_on.iter().all(|d| successes.contains(d))
        {
            step.status = StepStatus::Eligible;
        }
    }
}

/// 将依赖链上游有非成功终态的待执行步骤标记为 Blocked（迭代至不动点，覆盖传递依赖）
fn block_dependents(plan: &mut Plan) {
    loop {
        let dead: HashSet<usize> = plan
            .steps()
            .iter()
            .filter(|s| {
                matches!(
                    s.status,
                    StepStatus::Failed | StepStatus::Blocked | StepStatus::Cancelled
                )
            })
            .map(|s| s.index)
            .collect();
        let mut changed = false;
        for step in plan.steps_mut() {
            if matches!(step.status, StepStatus::Pending | StepStatus::Eligible)
                && step.depends_on.iter().any(|d| dead.contains(d))
            {
                step.status = StepStatus::Blocked;
                changed = true;
            }
        }
        if !changed {
            return;
        }
    }
}

fn block_unreachable(plan: &mut Plan) {
    for step in plan.steps_mut() {
        if !step.status.is_terminal() {
            step.status = StepStatus::Blocked;
        }
    }
}

/// 单步的全部尝试；返回终态。每次尝试的结果都先追加进历史日志。
#[allow(clippy::too_many_arguments)]
async fn run_step_attempts(
    run_id: &str,
    objective: &str,
    plan: &Plan,
    step: &PlanStep,
    registry: Arc<ToolRegistry>,
    history: Arc<dyn HistoryStore>,
    generator: Arc<ArgumentGenerator>,
    cfg: &ExecutorSection,
    cancel: &CancellationToken,
    event_tx: &Option<UnboundedSender<RunEvent>>,
) -> StepStatus {
    let event_ref = event_tx.as_ref();
    let Some(tool) = registry.get(&step.tool) else {
        let record = StepResult::failure(step.index, 1, format!("unknown tool: {}", step.tool));
        append_or_warn(&history, run_id, record).await;
        return StepStatus::Failed;
    };
    let descriptor = crate::tools::ToolDescriptor {
        name: tool.name().to_string(),
        input_schema: tool.input_schema(),
        relevance_text: tool.relevance_text(),
        scope: tool.scope().to_string(),
    };

    let max_attempts = cfg.max_retries + 1;
    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            let record = StepResult::failure(step.index, attempt, AgentError::Cancelled.to_string());
            append_or_warn(&history, run_id, record).await;
            return StepStatus::Cancelled;
        }

        // 重试时带上本步先前失败（include_current_step）
        let visible = history.list(run_id).await.unwrap_or_default();
        let args = match generator
            .generate(objective, plan, step, &descriptor, &visible, attempt > 1)
            .await
        {
            Ok(args) => args,
            Err(e) => {
                // 参数生成失败属规划层缺陷：不派发工具，本步直接终结
                let record = StepResult::failure(step.index, attempt, e.to_string());
                append_or_warn(&history, run_id, record).await;
                send_event(
                    &event_ref,
                    RunEvent::Error {
                        text: format!("step {} argument generation failed: {}", step.index, e),
                    },
                );
                return StepStatus::Failed;
            }
        };
        send_event(
            &event_ref,
            RunEvent::Args {
                step_index: step.index,
                attempt,
                args: args.clone(),
            },
        );

        let ctx = ToolContext {
            run_id: run_id.to_string(),
            step_index: step.index,
            attempt,
        };
        let started = Instant::now();
        let step_timeout = Duration::from_millis(cfg.step_timeout_ms);

        let invoked: Option<Result<ToolOutcome, ()>> = tokio::select! {
            _ = cancel.cancelled() => None,
            result = timeout(step_timeout, tool.invoke(args, &ctx)) => Some(result.map_err(|_| ())),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let (record, outcome_tag) = match invoked {
            None => {
                let record =
                    StepResult::failure(step.index, attempt, AgentError::Cancelled.to_string());
                append_or_warn(&history, run_id, record).await;
                audit(run_id, step, attempt, "cancelled", duration_ms);
                return StepStatus::Cancelled;
            }
            Some(Err(())) => (
                StepResult::failure(
                    step.index,
                    attempt,
                    format!("timeout after {}ms", cfg.step_timeout_ms),
                ),
                "timeout",
            ),
            Some(Ok(outcome)) => {
                if outcome.success {
                    (
                        StepResult::success(
                            step.index,
                            attempt,
                            outcome.data.unwrap_or_default(),
                        )
                        .with_advice(outcome.advice),
                        "ok",
                    )
                } else {
                    (
                        StepResult::failure(
                            step.index,
                            attempt,
                            outcome.error.unwrap_or_else(|| "tool failed".to_string()),
                        )
                        .with_advice(outcome.advice),
                        "error",
                    )
                }
            }
        };

        let succeeded = record.success;
        let result_preview = preview(
            record
                .data
                .as_deref()
                .or(record.error.as_deref())
                .unwrap_or(""),
            RESULT_PREVIEW_CHARS,
        );
        // 先落历史日志，依赖方才可能就绪（写前读）
        append_or_warn(&history, run_id, record).await;
        audit(run_id, step, attempt, outcome_tag, duration_ms);
        send_event(
            &event_ref,
            RunEvent::ToolResult {
                step_index: step.index,
                attempt,
                tool: step.tool.clone(),
                success: succeeded,
                preview: result_preview,
            },
        );

        if succeeded {
            return StepStatus::Success;
        }
        if attempt < max_attempts {
            let delay = cfg.retry_base_delay_ms.saturating_mul(1 << (attempt - 1));
            tokio::time::sleep(Duration::from_millis(delay)).await;
            continue;
        }
    }

    tracing::warn!(run_id, step = step.index, tool = %step.tool, "step exhausted retries");
    StepStatus::Failed
}

async fn append_or_warn(history: &Arc<dyn HistoryStore>, run_id: &str, record: StepResult) {
    if let Err(e) = history.append(run_id, record).await {
        tracing::error!(run_id, error = %e, "failed to append step result");
    }
}

/// 每次工具调用输出一条结构化审计日志（JSON）
fn audit(run_id: &str, step: &PlanStep, attempt: u32, outcome: &str, duration_ms: u64) {
    let line = serde_json::json!({
        "event": "tool_audit",
        "run_id": run_id,
        "step": step.index,
        "tool": step.tool,
        "attempt": attempt,
        "outcome": outcome,
        "duration_ms": duration_ms,
    });
    tracing::info!(audit = %line.to_string(), "tool");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use crate::pipeline::history::MemoryHistory;
    use crate::pipeline::plan::StepSpec;
    use crate::tools::{Tool, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedTool {
        name: &'static str,
        data: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for FixedTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "fixed"
        }
        async fn invoke(&self, _args: Value, _ctx: &ToolContext) -> ToolOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ToolOutcome::ok(self.data)
        }
    }

    struct FailingTool {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        async fn invoke(&self, _args: Value, _ctx: &ToolContext) -> ToolOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ToolOutcome::fail("boom").with_advice("check the upstream service")
        }
    }

    /// 第一次失败、之后成功
    struct FlakyTool {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for FlakyTool {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "fails once"
        }
        async fn invoke(&self, _args: Value, _ctx: &ToolContext) -> ToolOutcome {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                ToolOutcome::fail("transient glitch")
            } else {
                ToolOutcome::ok("recovered")
            }
        }
    }

    fn test_cfg() -> ExecutorSection {
        ExecutorSection {
            step_timeout_ms: 5_000,
            max_retries: 1,
            max_parallel_steps: 3,
            retry_base_delay_ms: 1,
        }
    }

    fn scripted_args(n: usize) -> Arc<ScriptedLlm> {
        Arc::new(ScriptedLlm::new(vec!["{}"; n]))
    }

    fn executor(
        registry: ToolRegistry,
        history: Arc<MemoryHistory>,
        llm: Arc<ScriptedLlm>,
        cfg: ExecutorSection,
    ) -> DagExecutor {
        DagExecutor::new(
            Arc::new(registry),
            history,
            Arc::new(ArgumentGenerator::new(llm, 2)),
            cfg,
        )
    }

    fn plan_of(specs: Vec<(&str, Vec<usize>)>) -> Plan {
        Plan::from_specs(
            specs
                .into_iter()
                .map(|(tool, deps)| StepSpec {
                    tool: tool.to_string(),
                    reason: String::new(),
                    depends_on: deps,
                })
                .collect(),
            0,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_diamond_dag_runs_all_steps() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        for name in ["left", "right", "join"] {
            registry.register(FixedTool {
                name,
                data: "data",
                calls: calls.clone(),
            });
        }
        let history = Arc::new(MemoryHistory::new());
        let exec = executor(registry, history.clone(), scripted_args(3), test_cfg());

        let mut plan = plan_of(vec![("left", vec![]), ("right", vec![]), ("join", vec![0, 1])]);
        exec.execute("r1", "obj", &mut plan, &CancellationToken::new(), None)
            .await
            .unwrap();

        assert!(plan.steps().iter().all(|s| s.status == StepStatus::Success));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(history.list("r1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_step_blocks_transitive_dependents() {
        let broken_calls = Arc::new(AtomicUsize::new(0));
        let ok_calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(FailingTool {
            calls: broken_calls.clone(),
        });
        registry.register(FixedTool {
            name: "after",
            data: "never",
            calls: ok_calls.clone(),
        });
        let history = Arc::new(MemoryHistory::new());
        let cfg = ExecutorSection {
            max_retries: 1,
            ..test_cfg()
        };
        let exec = executor(registry, history.clone(), scripted_args(4), cfg);

        // broken -> after -> after2（传递依赖也须 Blocked）
        let mut plan = plan_of(vec![
            ("broken", vec![]),
            ("after", vec![0]),
            ("after", vec![1]),
        ]);
        exec.execute("r1", "obj", &mut plan, &CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(plan.steps()[0].status, StepStatus::Failed);
        assert_eq!(plan.steps()[1].status, StepStatus::Blocked);
        assert_eq!(plan.steps()[2].status, StepStatus::Blocked);
        // 被阻塞的步骤从未被调用
        assert_eq!(ok_calls.load(Ordering::SeqCst), 0);
        // 失败尝试（含重试）连同 advice 均已落历史
        let results = history.list("r1").await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| r.advice.as_deref() == Some("check the upstream service")));
    }

    #[tokio::test]
    async fn test_retry_sees_prior_failure_in_context() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(FlakyTool {
            calls: calls.clone(),
        });
        let history = Arc::new(MemoryHistory::new());
        let llm = scripted_args(2);
        let exec = executor(registry, history.clone(), llm.clone(), test_cfg());

        let mut plan = plan_of(vec![("flaky", vec![])]);
        exec.execute("r1", "obj", &mut plan, &CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(plan.steps()[0].status, StepStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // 第二次参数生成的上下文必须包含首次失败
        let prompts = llm.seen_prompts();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].contains("transient glitch"));
        assert!(prompts[1].contains("transient glitch"));

        let results = history.list("r1").await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(!results[0].success);
        assert!(results[1].success);
        assert_eq!(results[1].attempt, 2);
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_marks_steps_cancelled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(FixedTool {
            name: "left",
            data: "d",
            calls: calls.clone(),
        });
        let history = Arc::new(MemoryHistory::new());
        let exec = executor(registry, history, scripted_args(1), test_cfg());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut plan = plan_of(vec![("left", vec![])]);
        let err = exec
            .execute("r1", "obj", &mut plan, &cancel, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert_eq!(plan.steps()[0].status, StepStatus::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_step_timeout_counts_as_failure() {
        struct SlowTool;
        #[async_trait]
        impl Tool for SlowTool {
            fn name(&self) -> &str {
                "slow"
            }
            fn description(&self) -> &str {
                "sleeps"
            }
            async fn invoke(&self, _args: Value, _ctx: &ToolContext) -> ToolOutcome {
                tokio::time::sleep(Duration::from_secs(60)).await;
                ToolOutcome::ok("late")
            }
        }
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool);
        let history = Arc::new(MemoryHistory::new());
        let cfg = ExecutorSection {
            step_timeout_ms: 20,
            max_retries: 0,
            ..test_cfg()
        };
        let exec = executor(registry, history.clone(), scripted_args(1), cfg);

        let mut plan = plan_of(vec![("slow", vec![])]);
        exec.execute("r1", "obj", &mut plan, &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(plan.steps()[0].status, StepStatus::Failed);
        let results = history.list("r1").await.unwrap();
        assert!(results[0].error.as_deref().unwrap().contains("timeout"));
    }
}
