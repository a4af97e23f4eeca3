//! 模型适配器
//!
//! 每个模型家族有各自的协议偏差（内联 XML 工具调用、加密推理签名、
//! 推理预算参数名等），适配器负责在不触碰流式状态机的前提下修正这些偏差。
//!
//! 适配器是一个封闭的枚举集合，按模型 ID 顺序匹配，首个命中者生效，
//! 未命中时使用直通的默认适配器。每个流持有独立的适配器实例。

pub mod gemini;
pub mod grok;
pub mod qwen;

use serde_json::Value;
use std::collections::HashMap;

use crate::models::openai::ChatCompletionRequest;

pub use gemini::GeminiAdapter;
pub use grok::GrokAdapter;
pub use qwen::QwenAdapter;

/// 请求中通用思考配置在 `extra` 里的键名，由适配器消费
pub const THINKING_KEY: &str = "thinking";

/// 从文本中提取出的工具调用
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedToolCall {
    pub id: String,
    pub name: String,
    /// 完整的参数对象
    pub arguments: Value,
}

/// 文本处理结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterResult {
    /// 可以直接展示给客户端的文本
    pub cleaned_text: String,
    pub extracted_tool_calls: Vec<ExtractedToolCall>,
    pub was_transformed: bool,
}

impl AdapterResult {
    /// 原样透传
    pub fn passthrough(text: &str) -> Self {
        Self {
            cleaned_text: text.to_string(),
            extracted_tool_calls: Vec::new(),
            was_transformed: false,
        }
    }
}

/// 适配器接口
pub trait ModelAdapter {
    /// 适配器名称（用于日志）
    fn name(&self) -> &'static str;

    /// 是否处理该模型
    fn should_handle(model_id: &str) -> bool
    where
        Self: Sized;

    /// 处理新到达的文本增量
    fn process_text_content(&mut self, new_text: &str) -> AdapterResult {
        AdapterResult::passthrough(new_text)
    }

    /// 流结束时取出缓冲区中残留的文本
    fn flush(&mut self) -> AdapterResult {
        AdapterResult::default()
    }

    /// 调整出站请求（推理参数重映射等）
    fn prepare_request(&self, _request: &mut ChatCompletionRequest) {}

    /// 观察上游的 reasoning_details 元数据
    fn observe_reasoning_details(&mut self, _details: &Value) {}

    /// 清空流内状态
    fn reset(&mut self);
}

/// 默认适配器：不做任何修改
#[derive(Debug, Default)]
pub struct DefaultAdapter;

impl ModelAdapter for DefaultAdapter {
    fn name(&self) -> &'static str {
        "default"
    }

    fn should_handle(_model_id: &str) -> bool {
        true
    }

    fn reset(&mut self) {}
}

/// 适配器封闭集合
#[derive(Debug)]
pub enum Adapter {
    Default(DefaultAdapter),
    Grok(GrokAdapter),
    Gemini(GeminiAdapter),
    Qwen(QwenAdapter),
}

impl Default for Adapter {
    fn default() -> Self {
        Adapter::Default(DefaultAdapter)
    }
}

/// 按模型 ID 选择适配器（首个匹配生效）
pub fn select_adapter(model_id: &str) -> Adapter {
    let adapter = if GrokAdapter::should_handle(model_id) {
        Adapter::Grok(GrokAdapter::new())
    } else if GeminiAdapter::should_handle(model_id) {
        Adapter::Gemini(GeminiAdapter::new(model_id))
    } else if QwenAdapter::should_handle(model_id) {
        Adapter::Qwen(QwenAdapter::new())
    } else {
        Adapter::Default(DefaultAdapter)
    };
    tracing::debug!(
        "[ADAPTER] 模型 {} 使用适配器: {}",
        model_id,
        adapter.name()
    );
    adapter
}

impl Adapter {
    fn inner(&self) -> &dyn ModelAdapter {
        match self {
            Adapter::Default(a) => a,
            Adapter::Grok(a) => a,
            Adapter::Gemini(a) => a,
            Adapter::Qwen(a) => a,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn ModelAdapter {
        match self {
            Adapter::Default(a) => a,
            Adapter::Grok(a) => a,
            Adapter::Gemini(a) => a,
            Adapter::Qwen(a) => a,
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner().name()
    }

    pub fn process_text_content(&mut self, new_text: &str) -> AdapterResult {
        self.inner_mut().process_text_content(new_text)
    }

    pub fn flush(&mut self) -> AdapterResult {
        self.inner_mut().flush()
    }

    pub fn prepare_request(&self, request: &mut ChatCompletionRequest) {
        self.inner().prepare_request(request)
    }

    pub fn observe_reasoning_details(&mut self, details: &Value) {
        self.inner_mut().observe_reasoning_details(details)
    }

    pub fn reset(&mut self) {
        self.inner_mut().reset()
    }

    /// 见 [`GeminiAdapter::alias_thought_signatures`]，其他适配器无操作
    pub fn alias_thought_signatures<'a>(
        &mut self,
        tool_ids: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) {
        if let Adapter::Gemini(a) = self {
            a.alias_thought_signatures(tool_ids);
        }
    }

    /// 取走本次交换捕获的 thought signature（仅 Gemini 非空）
    pub fn take_thought_signatures(&mut self) -> HashMap<String, String> {
        match self {
            Adapter::Gemini(a) => a.take_thought_signatures(),
            _ => HashMap::new(),
        }
    }
}

/// 从请求的通用思考配置中读取预算
pub(crate) fn thinking_budget(request: &ChatCompletionRequest) -> Option<u64> {
    request
        .extra
        .get(THINKING_KEY)
        .and_then(|t| t.get("budget_tokens"))
        .and_then(Value::as_u64)
}
