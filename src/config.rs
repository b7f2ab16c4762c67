//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__PROVIDER=openai`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub retrieval: RetrievalSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub history: HistorySection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LlmSection::default(),
            scheduler: SchedulerSection::default(),
            retrieval: RetrievalSection::default(),
            executor: ExecutorSection::default(),
            pipeline: PipelineSection::default(),
            history: HistorySection::default(),
        }
    }
}

/// [llm] 段：后端选择
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmSection {
    /// 后端：openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// [scheduler] 段：回复策略与消息捆包
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// 回复概率阈值（sigmoid(desire) 不低于该值才可能回复）
    pub base_reply_threshold: f64,
    /// 两次回复之间的硬性最小间隔（毫秒）
    pub min_reply_interval_ms: i64,
    /// 同一发送者允许同时在跑的 Run 数
    pub max_concurrent_per_sender: u32,
    /// 捆包窗口：与上一条消息间隔在此之内则并入同一捆包（毫秒）
    pub bundle_window_ms: i64,
    /// 捆包最长存活时间，超过即强制关闭（毫秒）
    pub bundle_max_ms: i64,
    /// 欲望值消息量项的增益 k
    pub burst_gain: f64,
    /// 欲望值消息量项的饱和条数 N（w = N 时该项恰为 1.0）
    pub burst_saturation: u32,
    /// 被 @ 提及时附加的欲望偏置
    pub mention_bonus: f64,
    /// 时间衰减项上界
    pub decay_cap: f64,
    /// 时间衰减半程（毫秒）：距上次回复达到该时长时衰减项为 cap 的一半
    pub decay_half_life_ms: i64,
    /// 每次连续忽略附加的欲望增量
    pub ignore_gain: f64,
    /// 连续忽略计数的饱和值（防止永远回复）
    pub ignore_cap: u32,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            base_reply_threshold: 0.65,
            min_reply_interval_ms: 5_000,
            max_concurrent_per_sender: 2,
            bundle_window_ms: 1_500,
            bundle_max_ms: 8_000,
            burst_gain: 1.0,
            burst_saturation: 6,
            mention_bonus: 0.8,
            decay_cap: 1.0,
            decay_half_life_ms: 600_000,
            ignore_gain: 0.15,
            ignore_cap: 6,
        }
    }
}

/// [retrieval] 段：两级工具检索
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalSection {
    /// 粗排保留候选数；0 或负数表示不截断
    pub candidate_k: i64,
    /// 精排保留条数；0 或负数表示保留全部粗排候选
    pub top_n: i64,
    /// 是否启用精排
    pub enable_rerank: bool,
    /// 嵌入模型
    pub embedding_model: String,
    /// Rerank 端点（Cohere 兼容 /rerank）
    pub rerank_base_url: Option<String>,
    pub rerank_model: Option<String>,
    /// Rerank 请求超时（毫秒）
    pub rerank_timeout_ms: u64,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            candidate_k: 8,
            top_n: 4,
            enable_rerank: false,
            embedding_model: "text-embedding-3-small".to_string(),
            rerank_base_url: None,
            rerank_model: None,
            rerank_timeout_ms: 10_000,
        }
    }
}

/// [executor] 段：DAG 执行
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    /// 单步超时（毫秒），独立于工具自身的超时
    pub step_timeout_ms: u64,
    /// 单步最大重试次数（不含首次尝试）
    pub max_retries: u32,
    /// 单个 Run 内并行执行的步数上限
    pub max_parallel_steps: usize,
    /// 指数退避基准延迟（毫秒）
    pub retry_base_delay_ms: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            step_timeout_ms: 30_000,
            max_retries: 2,
            max_parallel_steps: 3,
            retry_base_delay_ms: 500,
        }
    }
}

/// [pipeline] 段：规划 / 重规划边界
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// 最大重规划轮数，超出强制 Fail
    pub max_replan_cycles: u32,
    /// 计划生成最大尝试次数（非法计划拒绝后重新生成）
    pub max_plan_attempts: u32,
    /// 参数生成最大尝试次数（schema 校验失败后重新生成）
    pub max_args_attempts: u32,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_replan_cycles: 2,
            max_plan_attempts: 3,
            max_args_attempts: 3,
        }
    }
}

/// [history] 段：历史日志后端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    /// memory / sqlite
    pub backend: String,
    /// sqlite 文件路径
    pub path: Option<PathBuf>,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            path: None,
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
