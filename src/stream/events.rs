//! 流事件相关类型
//!
//! 停止原因映射以及消息 ID 生成。

use rand::distributions::Alphanumeric;
use rand::Rng;

/// 停止原因
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StopReason {
    /// 正常结束
    #[default]
    EndTurn,
    /// 达到最大 token 数
    MaxTokens,
    /// 需要工具调用
    ToolUse,
    /// 命中停止序列
    StopSequence,
}

impl StopReason {
    /// 从上游 finish_reason 解析
    pub fn from_finish_reason(reason: &str) -> Self {
        match reason.to_lowercase().as_str() {
            "stop" | "end_turn" => Self::EndTurn,
            "length" | "max_tokens" => Self::MaxTokens,
            "tool_calls" | "function_call" | "tool_use" => Self::ToolUse,
            "stop_sequence" => Self::StopSequence,
            // 内容过滤等：客户端不认识，按正常结束处理
            "content_filter" | "error" => Self::EndTurn,
            _ => {
                tracing::warn!("[STREAM] 未知 finish_reason: {}，按 end_turn 处理", reason);
                Self::EndTurn
            }
        }
    }

    /// Anthropic 格式
    pub fn to_anthropic_str(&self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::MaxTokens => "max_tokens",
            Self::ToolUse => "tool_use",
            Self::StopSequence => "stop_sequence",
        }
    }

    /// 有工具调用块时，"stop" 也视为 tool_use
    pub fn with_tool_use(self, has_tool_use: bool) -> Self {
        match self {
            Self::EndTurn if has_tool_use => Self::ToolUse,
            other => other,
        }
    }
}

/// 生成消息 ID：`msg_<毫秒时间戳>_<随机串>`
pub fn generate_message_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("msg_{}_{}", chrono::Utc::now().timestamp_millis(), suffix)
}

/// 生成工具调用 ID（上游缺失 ID 时使用）
pub fn generate_tool_use_id() -> String {
    format!("toolu_{}", uuid::Uuid::new_v4().simple())
}
