//! AutoCheckpointPolicy：根据消息流判断是否应当自动创建 checkpoint
//!
//! 该组件只做记账和判断，不会回调 TimelineManager；
//! 是否真正创建 checkpoint 由调用方决定。

use std::collections::VecDeque;
use std::time::Instant;

use serde_json::Value;

use super::config::SmartStrategyConfig;
use super::models::CheckpointStrategy;

/// 消息分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// 用户发起的新提示
    UserPrompt,
    /// 助手发起的工具调用
    ToolUse,
    /// 工具调用结果（以 user 消息形式回传）
    ToolResult,
    /// 普通助手输出
    Assistant,
    Other,
}

impl MessageKind {
    pub fn is_tool_event(&self) -> bool {
        matches!(self, Self::ToolUse | Self::ToolResult)
    }
}

/// 解析一行 stream-JSON 消息
///
/// 无法解析的内容归为 [`MessageKind::Other`]。
pub fn classify(message: &str) -> MessageKind {
    match serde_json::from_str::<Value>(message) {
        Ok(value) => classify_value(&value),
        Err(_) => MessageKind::Other,
    }
}

fn classify_value(value: &Value) -> MessageKind {
    let content = value.pointer("/message/content");
    match value.get("type").and_then(Value::as_str) {
        Some("user") => {
            if has_block(content, "tool_result") {
                MessageKind::ToolResult
            } else {
                MessageKind::UserPrompt
            }
        }
        Some("assistant") => {
            if has_block(content, "tool_use") {
                MessageKind::ToolUse
            } else {
                MessageKind::Assistant
            }
        }
        _ => MessageKind::Other,
    }
}

fn has_block(content: Option<&Value>, block_type: &str) -> bool {
    content
        .and_then(Value::as_array)
        .is_some_and(|blocks| {
            blocks
                .iter()
                .any(|b| b.get("type").and_then(Value::as_str) == Some(block_type))
        })
}

fn prompt_text(value: &Value) -> Option<String> {
    match value.pointer("/message/content")? {
        Value::String(text) => Some(text.clone()),
        Value::Array(blocks) => {
            let text: Vec<&str> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            (!text.is_empty()).then(|| text.join("\n"))
        }
        _ => None,
    }
}

fn usage_tokens(value: &Value) -> i64 {
    let usage = value
        .pointer("/message/usage")
        .or_else(|| value.get("usage"));
    let Some(usage) = usage else {
        return 0;
    };

    ["input_tokens", "output_tokens"]
        .iter()
        .filter_map(|key| usage.get(*key).and_then(Value::as_i64))
        .sum()
}

/// 单个会话的自动 checkpoint 状态
#[derive(Debug)]
pub struct AutoCheckpointPolicy {
    smart: SmartStrategyConfig,
    max_tracked: usize,
    recent: VecDeque<String>,
    total_messages: usize,
    total_tokens: i64,
    model_used: Option<String>,
    last_prompt: Option<String>,
    messages_since_checkpoint: usize,
    tool_uses_since_checkpoint: usize,
    last_checkpoint_at: Instant,
}

impl AutoCheckpointPolicy {
    pub fn new(smart: SmartStrategyConfig, max_tracked: usize) -> Self {
        Self {
            smart,
            max_tracked: max_tracked.max(1),
            recent: VecDeque::new(),
            total_messages: 0,
            total_tokens: 0,
            model_used: None,
            last_prompt: None,
            messages_since_checkpoint: 0,
            tool_uses_since_checkpoint: 0,
            last_checkpoint_at: Instant::now(),
        }
    }

    /// 从已持久化的历史恢复计数，重启后的 message_index 与 token 统计不会回退
    pub fn resume_from(&mut self, message_index: i64, total_tokens: i64) {
        self.total_messages = self.total_messages.max(message_index.max(0) as usize);
        self.total_tokens = self.total_tokens.max(total_tokens);
    }

    /// 记录一条消息，更新滚动缓冲与统计
    pub fn track(&mut self, message: &str) -> MessageKind {
        let parsed = serde_json::from_str::<Value>(message).ok();
        let kind = parsed
            .as_ref()
            .map(classify_value)
            .unwrap_or(MessageKind::Other);

        if let Some(value) = &parsed {
            self.total_tokens += usage_tokens(value);
            if let Some(model) = value.pointer("/message/model").and_then(Value::as_str) {
                self.model_used = Some(model.to_string());
            }
            if kind == MessageKind::UserPrompt {
                if let Some(text) = prompt_text(value) {
                    self.last_prompt = Some(text);
                }
            }
        }

        if kind.is_tool_event() {
            self.tool_uses_since_checkpoint += 1;
        }
        self.messages_since_checkpoint += 1;
        self.total_messages += 1;

        self.recent.push_back(message.to_string());
        while self.recent.len() > self.max_tracked {
            self.recent.pop_front();
        }

        kind
    }

    pub fn should_checkpoint(&self, strategy: CheckpointStrategy, message: &str) -> bool {
        self.should_checkpoint_at(strategy, message, Instant::now())
    }

    pub fn should_checkpoint_at(
        &self,
        strategy: CheckpointStrategy,
        message: &str,
        now: Instant,
    ) -> bool {
        let kind = classify(message);
        match strategy {
            CheckpointStrategy::Manual => false,
            CheckpointStrategy::PerPrompt => kind == MessageKind::UserPrompt,
            CheckpointStrategy::PerToolUse => kind.is_tool_event(),
            CheckpointStrategy::Smart => {
                if kind == MessageKind::UserPrompt {
                    return true;
                }
                if self.tool_uses_since_checkpoint >= self.smart.min_tool_uses.max(1) {
                    return true;
                }
                self.messages_since_checkpoint > 0
                    && now.saturating_duration_since(self.last_checkpoint_at) >= self.smart.min_interval
            }
        }
    }

    /// checkpoint 创建成功后重置防抖计数
    pub fn mark_checkpoint_created(&mut self) {
        self.mark_checkpoint_created_at(Instant::now());
    }

    pub fn mark_checkpoint_created_at(&mut self, now: Instant) {
        self.messages_since_checkpoint = 0;
        self.tool_uses_since_checkpoint = 0;
        self.last_prompt = None;
        self.last_checkpoint_at = now;
    }

    pub fn message_count(&self) -> usize {
        self.total_messages
    }

    pub fn total_tokens(&self) -> i64 {
        self.total_tokens
    }

    pub fn model_used(&self) -> Option<&str> {
        self.model_used.as_deref()
    }

    pub fn last_prompt(&self) -> Option<&str> {
        self.last_prompt.as_deref()
    }

    pub fn recent_messages(&self) -> impl Iterator<Item = &str> {
        self.recent.iter().map(String::as_str)
    }
}
