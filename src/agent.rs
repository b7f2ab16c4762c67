//! 无头 Agent 运行时
//!
//! 供各平台接入方调用的无界面逻辑：create_agent_components 从配置构建
//! 检索 / 规划 / 执行 / 评估 / 总结组件，Agent 把入站消息走
//! 捆包 → 回复决策 → Run → 出站回复 的完整链路。
//! Run 结束时释放该发送者的并发名额（守卫随任务落幕）。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::llm::{
    embedding::create_embedder_from_config, LlmClient, MockLlmClient, OpenAiClient,
};
use crate::pipeline::{
    ArgumentGenerator, Evaluator, HistoryStore, MemoryHistory, Planner, RunPipeline, SqliteHistory,
    Summarizer,
};
use crate::retrieval::{HttpReranker, RetrievalPipeline};
use crate::scheduler::{Bundler, Decision, MessageBundle, ReplyScheduler};
use crate::tools::ToolRegistry;
use crate::transport::{InboundMessage, Transport};

/// 预构建的 Agent 组件：调度器与 Run 管线，可多路接入共享
pub struct AgentComponents {
    pub scheduler: Arc<ReplyScheduler>,
    pub pipeline: Arc<RunPipeline>,
}

/// 从配置选择 LLM 后端
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    match cfg.llm.provider.as_str() {
        "mock" => Arc::new(MockLlmClient),
        _ => Arc::new(OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            None,
        )),
    }
}

/// 从配置选择历史日志后端
pub fn create_history_from_config(cfg: &AppConfig) -> Arc<dyn HistoryStore> {
    if cfg.history.backend == "sqlite" {
        if let Some(path) = &cfg.history.path {
            match SqliteHistory::open(path) {
                Ok(store) => return Arc::new(store),
                Err(e) => {
                    tracing::warn!(error = %e, "sqlite history unavailable, using memory store");
                }
            }
        }
    }
    Arc::new(MemoryHistory::new())
}

/// 创建 Agent 组件：检索管线（嵌入 + 可选精排）、规划、执行、评估、总结
pub fn create_agent_components(
    cfg: &AppConfig,
    llm: Arc<dyn LlmClient>,
    registry: ToolRegistry,
) -> AgentComponents {
    let embedder = create_embedder_from_config(
        cfg.llm.base_url.as_deref(),
        &cfg.retrieval.embedding_model,
        None,
    );
    let mut retrieval = RetrievalPipeline::new(embedder, cfg.retrieval.clone());
    if cfg.retrieval.enable_rerank {
        if let (Some(base_url), Some(model)) =
            (&cfg.retrieval.rerank_base_url, &cfg.retrieval.rerank_model)
        {
            retrieval = retrieval.with_reranker(Arc::new(HttpReranker::new(
                base_url,
                model,
                None,
                cfg.retrieval.rerank_timeout_ms,
            )));
        }
    }

    let history = create_history_from_config(cfg);
    let pipeline = RunPipeline::new(
        Arc::new(registry),
        Arc::new(retrieval),
        Planner::new(llm.clone(), cfg.pipeline.max_plan_attempts),
        ArgumentGenerator::new(llm.clone(), cfg.pipeline.max_args_attempts),
        Evaluator::new(llm.clone()),
        Summarizer::new(llm),
        history,
        cfg.executor.clone(),
        cfg.pipeline.max_replan_cycles,
    );

    AgentComponents {
        scheduler: Arc::new(ReplyScheduler::new(cfg.scheduler.clone())),
        pipeline: Arc::new(pipeline),
    }
}

/// Agent：消息入站 → 捆包 → 决策 → Run → 出站回复
pub struct Agent {
    scheduler: Arc<ReplyScheduler>,
    pipeline: Arc<RunPipeline>,
    bundler: Bundler,
    transport: Arc<dyn Transport>,
}

impl Agent {
    pub fn new(
        components: AgentComponents,
        transport: Arc<dyn Transport>,
        bundle_window_ms: i64,
        bundle_max_ms: i64,
    ) -> Self {
        Self {
            scheduler: components.scheduler,
            pipeline: components.pipeline,
            bundler: Bundler::new(bundle_window_ms, bundle_max_ms),
            transport,
        }
    }

    /// 投递一条入站消息；若其触发旧捆包关闭则立即进入决策
    pub async fn on_message(&mut self, msg: InboundMessage) {
        if let Some(bundle) = self.bundler.push(msg) {
            self.dispatch(bundle).await;
        }
    }

    /// 周期推进：关闭到期捆包并决策
    pub async fn tick(&mut self, now_ms: i64) {
        for bundle in self.bundler.poll_expired(now_ms) {
            self.dispatch(bundle).await;
        }
    }

    async fn dispatch(&self, bundle: MessageBundle) {
        match self.scheduler.decide(&bundle).await {
            Decision::Skip { probability, reason } => {
                tracing::debug!(
                    sender = %bundle.sender_id,
                    probability,
                    ?reason,
                    "bundle not answered"
                );
            }
            Decision::Respond { guard, .. } => {
                let pipeline = self.pipeline.clone();
                let transport = self.transport.clone();
                let conversation_id = bundle.conversation_id.clone();
                let objective = bundle.objective();
                tokio::spawn(async move {
                    let outcome = pipeline
                        .run(&objective, CancellationToken::new(), None)
                        .await;
                    if let Some(reply) = outcome.reply {
                        if let Err(e) = transport.send(&conversation_id, &reply).await {
                            tracing::error!(error = %e, "reply delivery failed");
                        }
                    }
                    // Run 终态后释放该发送者的并发名额
                    drop(guard);
                });
            }
        }
    }
}
