//! 单次流式交换的驱动
//!
//! 每个请求一个任务：读取上游字节流、驱动状态机、写出下游 SSE。
//! 心跳任务与读取循环共用同一把写锁，保证 SSE 帧不会交错。
//!
//! 客户端断开后（下游 channel 关闭）所有写入变为空操作，心跳停止，不再执行 finalize。

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::parser::{SseLineParser, UpstreamEvent};
use super::state_machine::{FinishOutcome, StreamTranslator};
use crate::middleware::{
    MiddlewareManager, StreamChunkContext, StreamMetadata, THOUGHT_SIGNATURES_KEY,
};

/// 下游 channel 容量
const CHANNEL_CAPACITY: usize = 64;

/// 带取消检查的写出端
struct SseWriter {
    translator: StreamTranslator,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl SseWriter {
    /// 写出帧；已取消时丢弃，发送失败视为客户端断开
    async fn emit(&mut self, frames: Vec<String>) {
        for frame in frames {
            if self.cancel.is_cancelled() {
                return;
            }
            if self.tx.send(Bytes::from(frame)).await.is_err() {
                tracing::info!("[STREAM] 客户端已断开，停止写出");
                self.cancel.cancel();
                return;
            }
        }
    }
}

/// 流式会话
pub struct StreamSession {
    translator: StreamTranslator,
    /// 上游模型 ID（用于筛选中间件）
    model_id: String,
    middleware: Arc<MiddlewareManager>,
    keepalive: Duration,
}

impl StreamSession {
    pub fn new(
        translator: StreamTranslator,
        model_id: impl Into<String>,
        middleware: Arc<MiddlewareManager>,
        keepalive: Duration,
    ) -> Self {
        Self {
            translator,
            model_id: model_id.into(),
            middleware,
            keepalive,
        }
    }

    /// 启动会话任务，返回下游 SSE 字节流
    pub fn spawn<S, E>(self, upstream: S) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let writer = Arc::new(Mutex::new(SseWriter {
            translator: self.translator,
            tx,
            cancel: cancel.clone(),
        }));

        tokio::spawn(run(
            writer,
            Box::pin(upstream),
            self.middleware,
            self.model_id,
            self.keepalive,
            cancel,
        ));

        async_stream::stream! {
            while let Some(bytes) = rx.recv().await {
                yield Ok::<_, Infallible>(bytes);
            }
        }
    }
}

async fn run<S, E>(
    writer: Arc<Mutex<SseWriter>>,
    mut upstream: S,
    middleware: Arc<MiddlewareManager>,
    model_id: String,
    keepalive: Duration,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    {
        let mut w = writer.lock().await;
        let frames = w.translator.start();
        w.emit(frames).await;
    }

    let keepalive_stop = cancel.child_token();
    let keepalive_task = tokio::spawn(keepalive_loop(
        writer.clone(),
        keepalive,
        keepalive_stop.clone(),
    ));

    let mut parser = SseLineParser::new();
    let mut metadata = StreamMetadata::new();
    let mut outcome = FinishOutcome::Normal;

    'read: loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break 'read,
            item = upstream.next() => item,
        };

        let events = match next {
            Some(Ok(bytes)) => parser.feed(&bytes),
            Some(Err(e)) => {
                tracing::error!("[STREAM] 读取上游流失败: {}", e);
                outcome = FinishOutcome::error("api_error", format!("上游流读取失败: {}", e));
                break 'read;
            }
            None => {
                tracing::debug!("[STREAM] 上游流结束");
                if let Some(event) = parser.flush() {
                    handle_event(event, &writer, &middleware, &model_id, &mut metadata).await;
                }
                break 'read;
            }
        };

        for event in events {
            if handle_event(event, &writer, &middleware, &model_id, &mut metadata).await {
                break 'read;
            }
        }
    }

    if !cancel.is_cancelled() {
        let mut w = writer.lock().await;
        let frames = w.translator.finalize(outcome);
        w.emit(frames).await;
    } else {
        tracing::info!("[STREAM] 会话已取消，跳过 finalize");
    }

    let signatures = writer.lock().await.translator.take_thought_signatures();
    if !signatures.is_empty() {
        metadata.insert(THOUGHT_SIGNATURES_KEY.to_string(), json!(signatures));
    }
    middleware.after_stream_complete(&model_id, &metadata).await;

    keepalive_stop.cancel();
    if let Err(e) = keepalive_task.await {
        tracing::warn!("[STREAM] 心跳任务异常退出: {}", e);
    }
}

/// 处理一个上游事件，返回流是否已结束
async fn handle_event(
    event: UpstreamEvent,
    writer: &Arc<Mutex<SseWriter>>,
    middleware: &MiddlewareManager,
    model_id: &str,
    metadata: &mut StreamMetadata,
) -> bool {
    match event {
        UpstreamEvent::Done => {
            let mut w = writer.lock().await;
            let frames = w.translator.finalize(FinishOutcome::Normal);
            w.emit(frames).await;
            true
        }
        UpstreamEvent::Chunk(mut chunk) => {
            {
                let mut ctx = StreamChunkContext {
                    model_id,
                    chunk: &mut chunk,
                    metadata,
                };
                middleware.after_stream_chunk(&mut ctx).await;
            }
            let mut w = writer.lock().await;
            let frames = w.translator.process_chunk(&chunk);
            w.emit(frames).await;
            w.translator.is_finalized()
        }
    }
}

async fn keepalive_loop(writer: Arc<Mutex<SseWriter>>, period: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    // 第一次 tick 立即返回，start() 已经发过 ping
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let mut w = writer.lock().await;
                if w.translator.is_finalized() {
                    break;
                }
                if let Some(ping) = w.translator.tick() {
                    w.emit(vec![ping]).await;
                }
            }
        }
    }
}

/// 构建 SSE 响应
pub fn sse_response<S>(body: S) -> Response
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to build streaming response",
            )
                .into_response()
        })
}

/// 上游在流开始前就失败时：返回一个完整但只含错误的 SSE 流
pub fn error_stream(
    mut translator: StreamTranslator,
    error_type: &str,
    message: &str,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let mut frames = translator.start();
    frames.extend(translator.finalize(FinishOutcome::error(error_type, message)));
    futures::stream::iter(
        frames
            .into_iter()
            .map(|frame| Ok::<_, Infallible>(Bytes::from(frame))),
    )
}
