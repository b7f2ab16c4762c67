//! 消息捆包
//!
//! 同一 (会话, 发送者) 在 bundle_window_ms 内的连续消息并入一个捆包作为单个决策单元；
//! 捆包自打开起超过 bundle_max_ms 强制关闭。全部由显式时间戳驱动，不读墙钟。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::transport::InboundMessage;

/// 已关闭的消息捆包：调度器的决策单元，消费后即丢弃
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBundle {
    pub conversation_id: String,
    pub sender_id: String,
    /// 按到达顺序的原始消息
    pub messages: Vec<InboundMessage>,
    /// 窗口打开时间（首条消息时间戳）
    pub opened_at_ms: i64,
    /// 关闭时间（决策时钟）
    pub closed_at_ms: i64,
}

impl MessageBundle {
    /// 捆包内消息数
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// 是否有任一消息 @ 了本 Agent
    pub fn mentioned(&self) -> bool {
        self.messages.iter().any(|m| m.mentioned)
    }

    /// 拼接为 Run 的目标文本
    pub fn objective(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug)]
struct OpenBundle {
    messages: Vec<InboundMessage>,
    opened_at_ms: i64,
    last_activity_ms: i64,
}

impl OpenBundle {
    fn close(self, key: &BundleKey, closed_at_ms: i64) -> MessageBundle {
        MessageBundle {
            conversation_id: key.0.clone(),
            sender_id: key.1.clone(),
            messages: self.messages,
            opened_at_ms: self.opened_at_ms,
            closed_at_ms,
        }
    }
}

type BundleKey = (String, String);

/// 捆包器：维护各 (会话, 发送者) 的打开中捆包
pub struct Bundler {
    window_ms: i64,
    max_ms: i64,
    open: HashMap<BundleKey, OpenBundle>,
}

impl Bundler {
    pub fn new(window_ms: i64, max_ms: i64) -> Self {
        Self {
            window_ms: window_ms.max(0),
            max_ms: max_ms.max(window_ms.max(0)),
            open: HashMap::new(),
        }
    }

    /// 投入一条消息；若其导致旧捆包关闭则返回之
    pub fn push(&mut self, msg: InboundMessage) -> Option<MessageBundle> {
        let key = (msg.conversation_id.clone(), msg.sender_id.clone());
        let now = msg.timestamp_ms;

        if let Some(open) = self.open.get_mut(&key) {
            let window_lapsed = now - open.last_activity_ms > self.window_ms;
            let max_reached = now - open.opened_at_ms >= self.max_ms;
            if !window_lapsed && !max_reached {
                open.messages.push(msg);
                open.last_activity_ms = now;
                return None;
            }
            let closed = self.open.remove(&key).map(|b| b.close(&key, now));
            self.open.insert(
                key,
                OpenBundle {
                    messages: vec![msg],
                    opened_at_ms: now,
                    last_activity_ms: now,
                },
            );
            return closed;
        }

        self.open.insert(
            key,
            OpenBundle {
                messages: vec![msg],
                opened_at_ms: now,
                last_activity_ms: now,
            },
        );
        None
    }

    /// 按当前时间关闭已到期的捆包（窗口静默或达到最长存活）
    pub fn poll_expired(&mut self, now_ms: i64) -> Vec<MessageBundle> {
        let expired: Vec<BundleKey> = self
            .open
            .iter()
            .filter(|(_, b)| {
                now_ms - b.last_activity_ms > self.window_ms || now_ms - b.opened_at_ms >= self.max_ms
            })
            .map(|(k, _)| k.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.open.remove(&key).map(|b| b.close(&key, now_ms)))
            .collect()
    }

    /// 打开中的捆包数
    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}
