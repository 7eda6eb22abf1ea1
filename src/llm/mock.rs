//! Mock LLM 客户端（用于测试与无 API Key 的演示，无需网络）
//!
//! 默认让所有 Idle 的 Agent 去执行一个固定任务；也可指定固定回复或模拟调用失败。

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

#[derive(Debug, Clone)]
enum MockReply {
    /// 按用户消息里的 CURRENT TEAM STATUS 给每个 Idle Agent 派发 explore
    Explore,
    Fixed(String),
    Fail(String),
}

/// Mock 客户端
#[derive(Debug)]
pub struct MockLlmClient {
    reply: MockReply,
    calls: AtomicUsize,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self {
            reply: MockReply::Explore,
            calls: AtomicUsize::new(0),
        }
    }
}

impl MockLlmClient {
    /// 每次都返回同一段文本
    pub fn fixed(reply: impl Into<String>) -> Self {
        Self {
            reply: MockReply::Fixed(reply.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// 每次调用都失败
    pub fn failing(error: impl Into<String>) -> Self {
        Self {
            reply: MockReply::Fail(error.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// 已被调用次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn explore_plan(messages: &[Message]) -> String {
        let status = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| {
                let rest = m.content.split("CURRENT TEAM STATUS:").nth(1)?;
                let line = rest.lines().map(str::trim).find(|l| !l.is_empty())?;
                serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(line).ok()
            })
            .unwrap_or_default();

        let assignments: serde_json::Map<String, serde_json::Value> = status
            .into_iter()
            .map(|(name, st)| {
                let value = if st.as_str() == Some("Idle") {
                    serde_json::json!({"task": "explore", "purpose": "Scout the surroundings"})
                } else {
                    serde_json::json!("wait")
                };
                (name, value)
            })
            .collect();

        serde_json::json!({
            "thought": "Mock planner: send every idle agent exploring.",
            "assignments": assignments,
        })
        .to_string()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.reply {
            MockReply::Explore => Ok(Self::explore_plan(messages)),
            MockReply::Fixed(text) => Ok(text.clone()),
            MockReply::Fail(err) => Err(err.clone()),
        }
    }
}
