//! 控制台 Demo：stdin 聊天循环
//!
//! 读取一行即一条入站消息（默认视为 @ 本 Agent），经捆包与回复决策后
//! 跑完整 Run，回复打印到 stdout。未配置 OPENAI_API_KEY 时可用
//! `HIVE__LLM__PROVIDER=mock` 离线体验。

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};

use hive::agent::{create_agent_components, create_llm_from_config, Agent};
use hive::config::{load_config, AppConfig};
use hive::tools::{EchoTool, ToolRegistry};
use hive::transport::{ChannelTransport, InboundMessage};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[tokio::main]
async fn main() -> Result<()> {
    hive::observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "config load failed, using defaults");
        AppConfig::default()
    });

    let llm = create_llm_from_config(&cfg);
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);

    let (transport, mut outbound_rx) = ChannelTransport::new();
    let components = create_agent_components(&cfg, llm, registry);
    let mut agent = Agent::new(
        components,
        Arc::new(transport),
        cfg.scheduler.bundle_window_ms,
        cfg.scheduler.bundle_max_ms,
    );

    println!("hive console demo - type a message, Ctrl-D to exit");
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut tick = tokio::time::interval(std::time::Duration::from_millis(500));

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(text) if !text.trim().is_empty() => {
                        let msg = InboundMessage::new("console", "local", text.trim(), now_ms())
                            .with_mention();
                        agent.on_message(msg).await;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            _ = tick.tick() => {
                agent.tick(now_ms()).await;
            }
            reply = outbound_rx.recv() => {
                if let Some(reply) = reply {
                    println!("hive> {}", reply.content);
                }
            }
        }
    }

    Ok(())
}
