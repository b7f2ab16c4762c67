//! 回复策略调度
//!
//! 消费已关闭的捆包，计算欲望值与回复概率，执行三道门限：
//! 概率阈值、最小回复间隔、同发送者并发上限。
//! 状态表按 (会话, 发送者) 分键，每键单写者（外层表锁取 Arc，内层键锁更新）。
//! 决策时钟取捆包的关闭时间，不读墙钟。

pub mod bundle;
pub mod desire;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::SchedulerSection;

pub use bundle::{Bundler, MessageBundle};
pub use desire::DesireState;

/// 跳过原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// 概率未过阈值
    BelowThreshold,
    /// 距上次回复未满最小间隔
    IntervalFloor,
    /// 该发送者在跑 Run 已达上限
    SenderBusy,
}

/// 调度决策
#[derive(Debug)]
pub enum Decision {
    /// 回复：附带概率与在跑计数守卫（Run 结束时释放）
    Respond {
        probability: f64,
        guard: InFlightGuard,
    },
    /// 跳过
    Skip {
        probability: f64,
        reason: SkipReason,
    },
}

impl Decision {
    pub fn is_respond(&self) -> bool {
        matches!(self, Decision::Respond { .. })
    }
}

/// 在跑 Run 计数守卫：Drop 时原子递减对应发送者的计数
#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<std::sync::atomic::AtomicU32>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

type StateKey = (String, String);

/// 回复策略调度器
pub struct ReplyScheduler {
    params: SchedulerSection,
    /// 每键状态表；外层锁仅用于取/建条目，更新在键级锁内完成
    states: Mutex<HashMap<StateKey, Arc<Mutex<DesireState>>>>,
}

impl ReplyScheduler {
    pub fn new(params: SchedulerSection) -> Self {
        Self {
            params,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn params(&self) -> &SchedulerSection {
        &self.params
    }

    async fn entry(&self, key: &StateKey) -> Arc<Mutex<DesireState>> {
        let mut table = self.states.lock().await;
        table
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(DesireState::default())))
            .clone()
    }

    /// 对一个已关闭捆包做回复决策，并更新该键的欲望状态
    pub async fn decide(&self, bundle: &MessageBundle) -> Decision {
        let key = (bundle.conversation_id.clone(), bundle.sender_id.clone());
        let entry = self.entry(&key).await;
        let mut state = entry.lock().await;

        let now = bundle.closed_at_ms;
        let elapsed = state.last_reply_at_ms.map(|t| now - t);

        let desire_value = desire::desire(
            &self.params,
            bundle.message_count(),
            elapsed,
            bundle.mentioned(),
            state.consecutive_ignores,
        );
        let probability = desire::reply_probability(desire_value);

        let skip = |state: &mut DesireState, reason: SkipReason| {
            state.consecutive_ignores = state.consecutive_ignores.saturating_add(1);
            tracing::debug!(
                sender = %bundle.sender_id,
                probability,
                ?reason,
                ignores = state.consecutive_ignores,
                "bundle skipped"
            );
            Decision::Skip {
                probability,
                reason,
            }
        };

        if probability < self.params.base_reply_threshold {
            return skip(&mut state, SkipReason::BelowThreshold);
        }
        // 提及只是欲望偏置，硬性间隔下限不可被其越过
        if let Some(elapsed) = elapsed {
            if elapsed < self.params.min_reply_interval_ms {
                return skip(&mut state, SkipReason::IntervalFloor);
            }
        }
        let in_flight = state.in_flight_runs.load(Ordering::SeqCst);
        if in_flight >= self.params.max_concurrent_per_sender {
            return skip(&mut state, SkipReason::SenderBusy);
        }

        state.consecutive_ignores = 0;
        state.last_reply_at_ms = Some(now);
        state.in_flight_runs.fetch_add(1, Ordering::SeqCst);
        tracing::info!(sender = %bundle.sender_id, probability, "bundle admitted");

        Decision::Respond {
            probability,
            guard: InFlightGuard {
                counter: state.in_flight_runs.clone(),
            },
        }
    }

    /// 某发送者当前在跑 Run 数（测试 / 监控用）
    pub async fn in_flight(&self, conversation_id: &str, sender_id: &str) -> u32 {
        let key = (conversation_id.to_string(), sender_id.to_string());
        let entry = self.entry(&key).await;
        let state = entry.lock().await;
        state.in_flight_runs.load(Ordering::SeqCst)
    }
}
