//! 流式处理层
//!
//! ```text
//! 上游字节流 ──> [SseLineParser] ──> chunk ──> [中间件] ──> [StreamTranslator] ──> Anthropic SSE
//!                                                              ▲
//!                                                   心跳任务 ──┘（共用写锁）
//! ```
//!
//! # 模块结构
//!
//! - `events`: 停止原因、ID 生成
//! - `sse`: Anthropic SSE 帧构造
//! - `parser`: 上游 SSE 行解析
//! - `state_machine`: 流式状态机
//! - `session`: 单次交换的任务驱动（心跳、取消）

pub mod events;
pub mod parser;
pub mod session;
pub mod sse;
pub mod state_machine;

pub use events::{generate_message_id, StopReason};
pub use parser::{SseLineParser, UpstreamEvent};
pub use session::{error_stream, sse_response, StreamSession};
pub use state_machine::{FinishOutcome, StreamPhase, StreamTranslator};
