//! Run 状态机
//!
//! Created → Judging → (无需工具 → Summarizing)
//!                   | (Planning → Executing → Evaluating → {Summarizing | Replanning→Planning | Failed})
//! 终态：Done / Failed / Cancelled。重规划受 max_replan_cycles 约束，超出强制 Fail。
//! Done 与 Failed 都必须带回复（完全失败也要一句明确说明）；仅 Cancelled 无回复。

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::pipeline::args::ArgumentGenerator;
use crate::pipeline::evaluate::{Evaluator, Verdict};
use crate::pipeline::events::{send_event, RunEvent};
use crate::pipeline::executor::DagExecutor;
use crate::pipeline::history::{HistoryStore, StepResult};
use crate::pipeline::plan::{Plan, Planner};
use crate::pipeline::summary::Summarizer;
use crate::retrieval::RetrievalPipeline;
use crate::tools::ToolRegistry;

/// Run 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Judging,
    Planning,
    Executing,
    Evaluating,
    Summarizing,
    Replanning,
    Done,
    Failed,
    Cancelled,
}

/// 一次 Run 的结果
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    /// Done / Failed 必有回复；Cancelled 为 None
    pub reply: Option<String>,
}

/// Run 管线：持有全部编排组件，对单个目标执行完整状态机
pub struct RunPipeline {
    registry: Arc<ToolRegistry>,
    retrieval: Arc<RetrievalPipeline>,
    planner: Planner,
    executor: DagExecutor,
    evaluator: Evaluator,
    summarizer: Summarizer,
    history: Arc<dyn HistoryStore>,
    max_replan_cycles: u32,
}

impl RunPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ToolRegistry>,
        retrieval: Arc<RetrievalPipeline>,
        planner: Planner,
        generator: ArgumentGenerator,
        evaluator: Evaluator,
        summarizer: Summarizer,
        history: Arc<dyn HistoryStore>,
        executor_cfg: crate::config::ExecutorSection,
        max_replan_cycles: u32,
    ) -> Self {
        let executor = DagExecutor::new(
            registry.clone(),
            history.clone(),
            Arc::new(generator),
            executor_cfg,
        );
        Self {
            registry,
            retrieval,
            planner,
            executor,
            evaluator,
            summarizer,
            history,
            max_replan_cycles,
        }
    }

    /// 对一个目标执行完整 Run
    pub async fn run(
        &self,
        objective: &str,
        cancel: CancellationToken,
        event_tx: Option<UnboundedSender<RunEvent>>,
    ) -> RunOutcome {
        let run_id = uuid::Uuid::new_v4().to_string();
        let event_ref = event_tx.as_ref();
        let mut status = RunStatus::Created;
        tracing::info!(%run_id, objective, "run created");

        // Judging
        status = self.advance(&run_id, status, RunStatus::Judging);
        let catalog = self.registry.descriptors();
        let shortlist = self.retrieval.rank(objective, &catalog).await;
        let judgement = match self.planner.judge(objective, &shortlist).await {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(%run_id, error = %e, "judge failed");
                let reply = self.summarizer.summarize(objective, None, &[]).await;
                return self.finish(&run_id, RunStatus::Failed, Some(reply), event_ref);
            }
        };
        send_event(
            &event_ref,
            RunEvent::Judge {
                needs_tools: judgement.needs_tools,
                estimated_operations: judgement.estimated_operations,
            },
        );
        if cancel.is_cancelled() {
            return self.finish(&run_id, RunStatus::Cancelled, None, event_ref);
        }

        // 无需工具：直接总结作答
        if !judgement.needs_tools {
            let _ = self.advance(&run_id, status, RunStatus::Summarizing);
            let reply = self.summarizer.summarize(objective, None, &[]).await;
            send_event(&event_ref, RunEvent::Summary { text: reply.clone() });
            return self.finish(&run_id, RunStatus::Done, Some(reply), event_ref);
        }

        // 规划 / 执行 / 评估，重规划受限
        let mut combined = Plan::default();
        let mut replan_context: Option<Vec<StepResult>> = None;
        let mut cycle = 0u32;
        loop {
            status = self.advance(&run_id, status, RunStatus::Planning);
            let plan_result = self
                .planner
                .plan(
                    objective,
                    &shortlist,
                    replan_context.as_deref(),
                    combined.next_index(),
                )
                .await;
            let mut segment = match plan_result {
                Ok(plan) => plan,
                Err(e) => {
                    tracing::error!(%run_id, error = %e, "planning failed");
                    let results = self.results(&run_id).await;
                    let reply = self
                        .summarizer
                        .summarize(objective, Some(&combined), &results)
                        .await;
                    return self.finish(&run_id, RunStatus::Failed, Some(reply), event_ref);
                }
            };
            send_event(
                &event_ref,
                RunEvent::Plan {
                    step_count: segment.len(),
                    tools: segment.tool_names(),
                },
            );
            if let Err(e) = self.store_plan(&run_id, &combined, &segment).await {
                tracing::warn!(%run_id, error = %e, "plan snapshot not stored");
            }

            status = self.advance(&run_id, status, RunStatus::Executing);
            let exec_result = self
                .executor
                .execute(&run_id, objective, &mut segment, &cancel, event_tx.clone())
                .await;
            combined.merge(&segment);
            if let Err(e) = self.history.set_plan(&run_id, &combined).await {
                tracing::warn!(%run_id, error = %e, "plan snapshot not stored");
            }
            if let Err(AgentError::Cancelled) = exec_result {
                return self.finish(&run_id, RunStatus::Cancelled, None, event_ref);
            }

            status = self.advance(&run_id, status, RunStatus::Evaluating);
            let results = self.results(&run_id).await;
            let verdict = match self
                .evaluator
                .evaluate(objective, &combined, &results)
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    // 评估器不可用：接受部分结果，交给总结器诚实说明
                    tracing::warn!(%run_id, error = %e, "evaluator unavailable, accepting results");
                    Verdict::Accept
                }
            };
            send_event(
                &event_ref,
                RunEvent::Evaluate {
                    verdict: verdict.tag().to_string(),
                    reason: verdict.reason().to_string(),
                },
            );

            match verdict {
                Verdict::Accept => {
                    let _ = self.advance(&run_id, status, RunStatus::Summarizing);
                    let reply = self
                        .summarizer
                        .summarize(objective, Some(&combined), &results)
                        .await;
                    send_event(&event_ref, RunEvent::Summary { text: reply.clone() });
                    return self.finish(&run_id, RunStatus::Done, Some(reply), event_ref);
                }
                Verdict::Fail(reason) => {
                    tracing::warn!(%run_id, %reason, "run evaluated as failed");
                    let reply = self
                        .summarizer
                        .summarize(objective, Some(&combined), &results)
                        .await;
                    return self.finish(&run_id, RunStatus::Failed, Some(reply), event_ref);
                }
                Verdict::Replan(reason) => {
                    if cycle >= self.max_replan_cycles {
                        tracing::warn!(%run_id, cycle, "replan budget exhausted, forcing fail");
                        let reply = self
                            .summarizer
                            .summarize(objective, Some(&combined), &results)
                            .await;
                        return self.finish(&run_id, RunStatus::Failed, Some(reply), event_ref);
                    }
                    cycle += 1;
                    status = self.advance(&run_id, status, RunStatus::Replanning);
                    tracing::info!(%run_id, cycle, %reason, "replanning");
                    replan_context = Some(results);
                }
            }
            if cancel.is_cancelled() {
                return self.finish(&run_id, RunStatus::Cancelled, None, event_ref);
            }
        }
    }

    fn advance(&self, run_id: &str, from: RunStatus, to: RunStatus) -> RunStatus {
        tracing::debug!(%run_id, ?from, ?to, "run status");
        to
    }

    fn finish(
        &self,
        run_id: &str,
        status: RunStatus,
        reply: Option<String>,
        event_tx: Option<&UnboundedSender<RunEvent>>,
    ) -> RunOutcome {
        if status == RunStatus::Failed {
            if let Some(reply) = &reply {
                send_event(&event_tx, RunEvent::Summary { text: reply.clone() });
            }
        }
        tracing::info!(%run_id, ?status, "run finished");
        RunOutcome {
            run_id: run_id.to_string(),
            status,
            reply,
        }
    }

    async fn results(&self, run_id: &str) -> Vec<StepResult> {
        self.history.list(run_id).await.unwrap_or_default()
    }

    async fn store_plan(
        &self,
        run_id: &str,
        combined: &Plan,
        segment: &Plan,
    ) -> Result<(), AgentError> {
        let mut snapshot = combined.clone();
        snapshot.merge(segment);
        self.history.set_plan(run_id, &snapshot).await
    }
}
