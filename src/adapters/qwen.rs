//! Qwen 适配器：只重映射思考预算参数

use serde_json::json;

use super::{thinking_budget, ModelAdapter, THINKING_KEY};
use crate::models::openai::ChatCompletionRequest;

#[derive(Debug, Default)]
pub struct QwenAdapter;

impl QwenAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl ModelAdapter for QwenAdapter {
    fn name(&self) -> &'static str {
        "QwenAdapter"
    }

    fn should_handle(model_id: &str) -> bool {
        model_id.contains("qwen") || model_id.contains("alibaba")
    }

    fn prepare_request(&self, request: &mut ChatCompletionRequest) {
        if let Some(budget) = thinking_budget(request) {
            request
                .extra
                .insert("enable_thinking".to_string(), json!(true));
            request
                .extra
                .insert("thinking_budget".to_string(), json!(budget));
            tracing::debug!(
                "[QWEN_ADAPTER] 思考预算 {} -> enable_thinking: true, thinking_budget: {}",
                budget,
                budget
            );
        }
        request.extra.remove(THINKING_KEY);
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_handle() {
        assert!(QwenAdapter::should_handle("qwen/qwen3-coder"));
        assert!(QwenAdapter::should_handle("alibaba/tongyi"));
        assert!(!QwenAdapter::should_handle("deepseek/deepseek-chat"));
    }

    #[test]
    fn test_budget_remapped() {
        let mut request = ChatCompletionRequest::default();
        request.extra.insert(
            THINKING_KEY.to_string(),
            json!({"type": "enabled", "budget_tokens": 2048}),
        );
        QwenAdapter::new().prepare_request(&mut request);

        assert_eq!(request.extra["enable_thinking"], true);
        assert_eq!(request.extra["thinking_budget"], 2048);
        assert!(!request.extra.contains_key(THINKING_KEY));
    }

    #[test]
    fn test_text_untouched() {
        let mut adapter = QwenAdapter::new();
        let result = adapter.process_text_content("<think>x</think>");
        assert_eq!(result.cleaned_text, "<think>x</think>");
        assert!(!result.was_transformed);
    }
}
