//! Hive - Rust 群聊智能体编排核心
//!
//! 模块划分：
//! - **agent**: 无头 Agent 运行时（消息 → 捆包 → 回复决策 → Run → 出站回复）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）、嵌入
//! - **pipeline**: 规划 / 参数生成 / DAG 执行 / 评估 / 总结 与 Run 状态机
//! - **retrieval**: 工具相关性两级检索（粗排余弦 + 可选精排 Rerank）
//! - **scheduler**: 回复策略调度（捆包、欲望值、频控与并发门限）
//! - **tools**: 工具接口、注册表与内置工具
//! - **transport**: 消息收发抽象（外部协作方）

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod retrieval;
pub mod scheduler;
pub mod tools;
pub mod transport;
