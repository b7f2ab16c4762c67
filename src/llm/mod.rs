//! LLM 客户端与嵌入
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient；嵌入走 EmbeddingProvider。

pub mod embedding;
pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

pub use embedding::{EmbeddingProvider, HashEmbedder, OpenAiEmbedder};
pub use message::{Message, Role};
pub use mock::{MockLlmClient, ScriptedLlm};
pub use openai::OpenAiClient;
pub use traits::LlmClient;
