//! 消息收发抽象（外部协作方）
//!
//! 平台接入方将入站消息转为 InboundMessage 投递给 Agent；
//! 出站回复通过 Transport::send 发回平台。ChannelTransport 供 Demo 与测试使用。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::AgentError;

/// 入站消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// 会话标识（群或单聊）
    pub conversation_id: String,
    /// 发送者标识
    pub sender_id: String,
    /// 消息文本
    pub text: String,
    /// 是否 @ 了本 Agent
    pub mentioned: bool,
    /// 到达时间（毫秒时间戳）
    pub timestamp_ms: i64,
}

impl InboundMessage {
    pub fn new(
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            text: text.into(),
            mentioned: false,
            timestamp_ms,
        }
    }

    pub fn with_mention(mut self) -> Self {
        self.mentioned = true;
        self
    }
}

/// 出站消息
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub conversation_id: String,
    pub content: String,
}

/// 出站通道 trait：平台接入方实现 send
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, conversation_id: &str, content: &str) -> Result<(), AgentError>;
}

/// 通道传输：把出站消息写入 mpsc，供 Demo / 测试消费
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, conversation_id: &str, content: &str) -> Result<(), AgentError> {
        self.tx
            .send(OutboundMessage {
                conversation_id: conversation_id.to_string(),
                content: content.to_string(),
            })
            .map_err(|e| AgentError::Provider(format!("transport closed: {}", e)))
    }
}
