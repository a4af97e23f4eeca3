//! Gemini 适配器
//!
//! OpenRouter 把 Gemini 的 thought signature 放在 `reasoning_details` 中，
//! 类型为 `reasoning.encrypted`，`id` 为对应的工具调用 ID。
//! 后续请求回传该工具结果时需要带上签名，否则 Gemini 会拒绝继续推理。

use serde_json::{json, Value};
use std::collections::HashMap;

use super::{thinking_budget, ModelAdapter, THINKING_KEY};
use crate::models::openai::ChatCompletionRequest;

/// Gemini 2.5 允许的最大 thinking_budget
pub const MAX_GEMINI_BUDGET: u64 = 24576;

/// Gemini 3 切换到 high 的预算阈值
pub const GEMINI3_HIGH_THRESHOLD: u64 = 16000;

const ENCRYPTED_TYPE: &str = "reasoning.encrypted";

/// 从 reasoning_details 数组中提取 (tool_call_id, signature)
///
/// 只提取 `reasoning.encrypted` 条目，`reasoning.text` 等其他类型忽略。
fn extract_encrypted_signatures(details: &Value) -> Vec<(String, String)> {
    let Some(entries) = details.as_array() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter(|d| d.get("type").and_then(Value::as_str) == Some(ENCRYPTED_TYPE))
        .filter_map(|d| {
            let id = d.get("id").and_then(Value::as_str)?;
            let data = d.get("data").and_then(Value::as_str)?;
            if id.is_empty() || data.is_empty() {
                return None;
            }
            Some((id.to_string(), data.to_string()))
        })
        .collect()
}

/// Gemini thought signature 适配器
#[derive(Debug)]
pub struct GeminiAdapter {
    model_id: String,
    /// tool_call_id -> signature
    thought_signatures: HashMap<String, String>,
}

impl GeminiAdapter {
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            thought_signatures: HashMap::new(),
        }
    }

    pub fn get_thought_signature(&self, tool_call_id: &str) -> Option<&str> {
        self.thought_signatures.get(tool_call_id).map(String::as_str)
    }

    /// 工具调用 ID 被去重改名后，签名同时挂到下发给客户端的 ID 上
    ///
    /// `tool_ids` 为 (上游 ID, 下发 ID)。
    pub fn alias_thought_signatures<'a>(
        &mut self,
        tool_ids: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) {
        let aliases: Vec<(String, String)> = tool_ids
            .into_iter()
            .filter(|(upstream, emitted)| upstream != emitted)
            .filter_map(|(upstream, emitted)| {
                let signature = self.thought_signatures.get(upstream)?;
                Some((emitted.to_string(), signature.clone()))
            })
            .collect();
        for (id, signature) in aliases {
            tracing::debug!("[GEMINI_ADAPTER] thought signature 跟随改名: {}", id);
            self.thought_signatures.insert(id, signature);
        }
    }

    /// 取走本次交换捕获的全部签名
    pub fn take_thought_signatures(&mut self) -> HashMap<String, String> {
        std::mem::take(&mut self.thought_signatures)
    }
}

impl ModelAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "GeminiAdapter"
    }

    fn should_handle(model_id: &str) -> bool {
        model_id.contains("gemini") || model_id.contains("google/")
    }

    fn prepare_request(&self, request: &mut ChatCompletionRequest) {
        if let Some(budget) = thinking_budget(request) {
            if self.model_id.contains("gemini-3") {
                let level = if budget >= GEMINI3_HIGH_THRESHOLD {
                    "high"
                } else {
                    "low"
                };
                request
                    .extra
                    .insert("thinking_level".to_string(), json!(level));
                tracing::debug!(
                    "[GEMINI_ADAPTER] 思考预算 {} -> thinking_level: {}",
                    budget,
                    level
                );
            } else {
                let capped = budget.min(MAX_GEMINI_BUDGET);
                request.extra.insert(
                    "thinking_config".to_string(),
                    json!({ "thinking_budget": capped }),
                );
                tracing::debug!(
                    "[GEMINI_ADAPTER] 思考预算 {} -> thinking_config.thinking_budget: {}",
                    budget,
                    capped
                );
            }
        }
        request.extra.remove(THINKING_KEY);
    }

    fn observe_reasoning_details(&mut self, details: &Value) {
        for (id, signature) in extract_encrypted_signatures(details) {
            tracing::debug!("[GEMINI_ADAPTER] 捕获 thought signature: tool_call_id={}", id);
            self.thought_signatures.insert(id, signature);
        }
    }

    fn reset(&mut self) {
        self.thought_signatures.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_budget(model: &str, budget: u64) -> ChatCompletionRequest {
        let mut request = ChatCompletionRequest {
            model: model.to_string(),
            ..Default::default()
        };
        request.extra.insert(
            THINKING_KEY.to_string(),
            json!({"type": "enabled", "budget_tokens": budget}),
        );
        request
    }

    #[test]
    fn test_should_handle() {
        assert!(GeminiAdapter::should_handle("google/gemini-2.5-flash"));
        assert!(GeminiAdapter::should_handle("google/gemini-3-pro-preview"));
        assert!(GeminiAdapter::should_handle("gemini-exp"));
        assert!(!GeminiAdapter::should_handle("openai/gpt-4o"));
    }

    #[test]
    fn test_extracts_only_encrypted_entries() {
        let mut adapter = GeminiAdapter::new("google/gemini-3-pro-preview");
        adapter.observe_reasoning_details(&json!([
            {"type": "reasoning.text", "id": "tool_a", "text": "thinking..."},
            {"type": "reasoning.encrypted", "id": "tool_b", "data": "sig-b"},
            {"type": "reasoning.encrypted", "id": "tool_c"}
        ]));

        assert!(adapter.get_thought_signature("tool_a").is_none());
        assert_eq!(adapter.get_thought_signature("tool_b"), Some("sig-b"));
        assert!(adapter.get_thought_signature("tool_c").is_none());
        assert_eq!(adapter.take_thought_signatures().len(), 1);
    }

    #[test]
    fn test_later_signature_overwrites() {
        let mut adapter = GeminiAdapter::new("google/gemini-2.5-pro");
        adapter.observe_reasoning_details(
            &json!([{"type": "reasoning.encrypted", "id": "t1", "data": "old"}]),
        );
        adapter.observe_reasoning_details(
            &json!([{"type": "reasoning.encrypted", "id": "t1", "data": "new"}]),
        );
        assert_eq!(adapter.get_thought_signature("t1"), Some("new"));
    }

    #[test]
    fn test_reset_clears_signatures() {
        let mut adapter = GeminiAdapter::new("google/gemini-2.5-pro");
        adapter.observe_reasoning_details(
            &json!([{"type": "reasoning.encrypted", "id": "t1", "data": "sig"}]),
        );
        adapter.reset();
        assert!(adapter.take_thought_signatures().is_empty());
    }

    #[test]
    fn test_signatures_follow_renamed_ids() {
        let mut adapter = GeminiAdapter::new("google/gemini-3-pro-preview");
        adapter.observe_reasoning_details(
            &json!([{"type": "reasoning.encrypted", "id": "dup", "data": "sig-dup"}]),
        );
        adapter.alias_thought_signatures([("dup", "dup"), ("dup", "dup_1"), ("other", "other_1")]);

        let taken = adapter.take_thought_signatures();
        assert_eq!(taken.get("dup").map(String::as_str), Some("sig-dup"));
        assert_eq!(taken.get("dup_1").map(String::as_str), Some("sig-dup"));
        assert!(!taken.contains_key("other_1"));
        // 取走后本地不再保留
        assert!(adapter.get_thought_signature("dup").is_none());
    }

    #[test]
    fn test_non_array_details_ignored() {
        assert!(extract_encrypted_signatures(&json!({"type": "reasoning.encrypted"})).is_empty());
        assert!(extract_encrypted_signatures(&Value::Null).is_empty());
    }

    #[test]
    fn test_gemini3_maps_to_thinking_level() {
        let adapter = GeminiAdapter::new("google/gemini-3-pro-preview");

        let mut high = request_with_budget("google/gemini-3-pro-preview", 20000);
        adapter.prepare_request(&mut high);
        assert_eq!(high.extra["thinking_level"], "high");
        assert!(!high.extra.contains_key(THINKING_KEY));

        let mut low = request_with_budget("google/gemini-3-pro-preview", 4000);
        adapter.prepare_request(&mut low);
        assert_eq!(low.extra["thinking_level"], "low");
    }

    #[test]
    fn test_gemini25_budget_is_capped() {
        let adapter = GeminiAdapter::new("google/gemini-2.5-pro");
        let mut request = request_with_budget("google/gemini-2.5-pro", 32000);
        adapter.prepare_request(&mut request);
        assert_eq!(
            request.extra["thinking_config"]["thinking_budget"],
            MAX_GEMINI_BUDGET
        );
        assert!(!request.extra.contains_key(THINKING_KEY));
    }
}
