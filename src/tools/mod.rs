//! 工具箱
//!
//! 所有工具实现 Tool trait（name / input_schema / relevance_text / invoke），
//! 由 ToolRegistry 按注册顺序维护目录；调用统一返回 ToolOutcome。

pub mod echo;
pub mod registry;

pub use echo::EchoTool;
pub use registry::{Tool, ToolContext, ToolDescriptor, ToolOutcome, ToolRegistry};
