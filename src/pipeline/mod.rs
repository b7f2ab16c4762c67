//! 规划 / 执行 / 评估管线
//!
//! judge 判定是否需要工具；plan 生成步骤 DAG（构造即无环）；
//! executor 依依赖并发执行并带上下文重试；evaluate 决定接受 / 重规划 / 失败；
//! summary 组装最终回复。全程结果经历史日志（追加式）流转。

pub mod args;
pub mod evaluate;
pub mod events;
pub mod executor;
pub mod history;
pub mod plan;
pub mod run;
pub mod summary;

pub use args::ArgumentGenerator;
pub use evaluate::{Evaluator, Verdict};
pub use events::RunEvent;
pub use executor::DagExecutor;
pub use history::{ancestor_indices, HistoryStore, MemoryHistory, SqliteHistory, StepResult};
pub use plan::{Judgement, Plan, PlanStep, Planner, StepSpec, StepStatus};
pub use run::{RunOutcome, RunPipeline, RunStatus};
pub use summary::Summarizer;
