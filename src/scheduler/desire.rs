//! 欲望值计算
//!
//! desire = ln(1 + k·w) / ln(1 + k·N) + time_decay(距上次回复) + mention_bonus·[被提及] + ignore_boost(连续忽略)
//! probability = sigmoid(desire)。
//! time_decay 单调不减且有界；ignore_boost 单调不减且有界（保证最终会开口，又不会永远回复）。

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use crate::config::SchedulerSection;

/// 每个 (会话, 发送者) 的回复欲望状态；仅由调度器更新（单写者）
#[derive(Debug)]
pub struct DesireState {
    /// 上次回复时间（毫秒时间戳）；None 表示从未回复过
    pub last_reply_at_ms: Option<i64>,
    /// 连续被跳过的捆包数
    pub consecutive_ignores: u32,
    /// 在跑 Run 计数；由 InFlightGuard 在 Run 结束时原子递减
    pub in_flight_runs: Arc<AtomicU32>,
}

impl Default for DesireState {
    fn default() -> Self {
        Self {
            last_reply_at_ms: None,
            consecutive_ignores: 0,
            in_flight_runs: Arc::new(AtomicU32::new(0)),
        }
    }
}

/// 消息量项：ln(1 + k·w) / ln(1 + k·N)，w 为捆包内消息数，N 为饱和条数
fn burst_term(params: &SchedulerSection, message_count: usize) -> f64 {
    let k = params.burst_gain.max(f64::EPSILON);
    let n = params.burst_saturation.max(1) as f64;
    let w = message_count as f64;
    (1.0 + k * w).ln() / (1.0 + k * n).ln()
}

/// 时间衰减项：elapsed / (elapsed + half_life) 缩放到 [0, cap]，单调不减
fn time_decay(params: &SchedulerSection, elapsed_ms: Option<i64>) -> f64 {
    let Some(elapsed) = elapsed_ms else {
        // 从未回复过：取上界，倾向于开口
        return params.decay_cap;
    };
    let elapsed = elapsed.max(0) as f64;
    let half_life = params.decay_half_life_ms.max(1) as f64;
    params.decay_cap * (elapsed / (elapsed + half_life))
}

/// 连续忽略加成：ignore_gain · min(ignores, ignore_cap)
fn ignore_boost(params: &SchedulerSection, consecutive_ignores: u32) -> f64 {
    params.ignore_gain * consecutive_ignores.min(params.ignore_cap) as f64
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// 计算欲望值
pub fn desire(
    params: &SchedulerSection,
    message_count: usize,
    elapsed_since_reply_ms: Option<i64>,
    mentioned: bool,
    consecutive_ignores: u32,
) -> f64 {
    let mut d = burst_term(params, message_count);
    d += time_decay(params, elapsed_since_reply_ms);
    if mentioned {
        d += params.mention_bonus;
    }
    d += ignore_boost(params, consecutive_ignores);
    d
}

/// 欲望值对应的回复概率
pub fn reply_probability(desire_value: f64) -> f64 {
    sigmoid(desire_value)
}
