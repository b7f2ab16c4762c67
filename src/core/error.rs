//! Agent 错误类型
//!
//! 传播策略：Validation / Dependency 不在调用层重试（触发参数重生成或重新规划）；
//! Provider / Timeout 在配置的次数内本地重试，超出后该步转为 Failed；
//! Rerank 的 Provider 错误永不致命（静默降级为粗排）。

use thiserror::Error;

/// 编排核心可能出现的错误（参数校验、计划依赖、外部调用、超时、取消等）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 参数不符合工具 schema（规划层缺陷，不派发工具）
    #[error("Validation error: {0}")]
    Validation(String),

    /// 计划结构非法（前向 / 自引用依赖）
    #[error("Dependency error: {0}")]
    Dependency(String),

    /// 外部调用失败（嵌入 / Rerank / 工具 / LLM）
    #[error("Provider error: {0}")]
    Provider(String),

    /// 单步超时（独立于底层调用自身的超时）
    #[error("Timeout: {0}")]
    Timeout(String),

    /// 被外部取消（与 Failed 区分）
    #[error("Cancelled")]
    Cancelled,

    /// 重试次数耗尽
    #[error("Exhausted retries: {0}")]
    ExhaustedRetries(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl AgentError {
    /// 是否可在调用层重试（Provider / Timeout）
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::Provider(_) | AgentError::Timeout(_))
    }
}
