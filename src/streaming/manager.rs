//! 流式管道
//!
//! 上游字节流 → 行 → 翻译事件 → SSE 帧 / 聚合响应。
//!
//! - [`LineDecoder`]: 跨 chunk 重新切行，单行长度受缓冲区上限约束
//! - [`TimeoutStream`]: 整体超时与 chunk 间空闲超时
//! - [`CancellableStream`]: 取消令牌触发后立即停止读取并释放上游连接
//! - [`TranslatedStream`]: 驱动 [`StreamTranslator`]，出错时补齐收尾事件

use super::converter::{ChunkRenderer, ResponseAggregator};
use super::error::StreamError;
use super::line_parser::TagScheme;
use super::metrics::StreamMetrics;
use super::traits::StreamResponse;
use super::translator::{StreamTranslator, TranslatorEvent};
use crate::models::openai::ChatCompletionResponse;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, info, warn};

// ============================================================================
// 配置
// ============================================================================

/// 流式配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// 单个未结束行的最大字节数
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// 整体超时（毫秒）
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// 两个 chunk 之间的最大等待时间（毫秒）
    #[serde(default = "default_chunk_timeout_ms")]
    pub chunk_timeout_ms: u64,
}

fn default_buffer_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_timeout_ms() -> u64 {
    300_000 // 5 分钟
}

fn default_chunk_timeout_ms() -> u64 {
    60_000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            timeout_ms: default_timeout_ms(),
            chunk_timeout_ms: default_chunk_timeout_ms(),
        }
    }
}

impl StreamConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_chunk_timeout_ms(mut self, chunk_timeout_ms: u64) -> Self {
        self.chunk_timeout_ms = chunk_timeout_ms;
        self
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn chunk_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }
}

// ============================================================================
// 行切分
// ============================================================================

/// 跨 chunk 的行切分器
///
/// 以 `\n` 分行并去掉行尾 `\r`，按 UTF-8 有损解码。
/// 多字节字符被拆在两个 chunk 中也能正确拼回。
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    limit: usize,
}

impl LineDecoder {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
        }
    }

    /// 追加一个 chunk，返回其中完整的行
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            lines.push(decode_line(&line[..line.len() - 1]));
        }
        lines
    }

    /// 尚未结束的行是否超过上限
    pub fn is_overflowed(&self) -> bool {
        self.buffer.len() > self.limit
    }

    /// 取出剩余的未结束行
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(decode_line(&rest))
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

// ============================================================================
// 超时
// ============================================================================

/// 带超时的上游字节流
///
/// 整体超时从第一次轮询开始计时；空闲超时在每个 chunk 到达后重置。
/// 超时后产出一个 `StreamError::Timeout` 并结束。
pub struct TimeoutStream {
    inner: StreamResponse,
    total_timeout: Duration,
    idle_timeout: Duration,
    total: Option<Pin<Box<Sleep>>>,
    idle: Option<Pin<Box<Sleep>>>,
    finished: bool,
}

impl TimeoutStream {
    pub fn new(inner: StreamResponse, config: &StreamConfig) -> Self {
        Self {
            inner,
            total_timeout: config.timeout_duration(),
            idle_timeout: config.chunk_timeout_duration(),
            total: None,
            idle: None,
            finished: false,
        }
    }
}

impl Stream for TimeoutStream {
    type Item = Result<Bytes, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        let total_timeout = this.total_timeout;
        let idle_timeout = this.idle_timeout;
        let total = this
            .total
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(total_timeout)));
        let idle = this
            .idle
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(idle_timeout)));

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(item)) => {
                idle.as_mut().reset(Instant::now() + idle_timeout);
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => {
                if total.as_mut().poll(cx).is_ready() || idle.as_mut().poll(cx).is_ready() {
                    this.finished = true;
                    warn!("[STREAM] 上游响应超时");
                    Poll::Ready(Some(Err(StreamError::Timeout)))
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

// ============================================================================
// 取消
// ============================================================================

/// 可取消的流包装器
///
/// 取消令牌触发后丢弃内部流（释放上游连接），
/// 产出一个 `ClientDisconnected` 错误后结束。
pub struct CancellableStream<S> {
    inner: Option<S>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<S> CancellableStream<S> {
    pub fn new(inner: S, cancel_token: CancellationToken) -> Self {
        Self {
            inner: Some(inner),
            cancelled: Box::pin(cancel_token.cancelled_owned()),
        }
    }
}

impl<S, T> Stream for CancellableStream<S>
where
    S: Stream<Item = Result<T, StreamError>> + Unpin,
{
    type Item = Result<T, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.inner.is_none() {
            return Poll::Ready(None);
        }

        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.inner = None;
            debug!("[STREAM] 取消令牌已触发，停止读取上游");
            return Poll::Ready(Some(Err(StreamError::ClientDisconnected)));
        }

        let polled = match this.inner.as_mut() {
            Some(inner) => Pin::new(inner).poll_next(cx),
            None => Poll::Ready(None),
        };
        if let Poll::Ready(None) = polled {
            this.inner = None;
        }
        polled
    }
}

// ============================================================================
// 翻译流
// ============================================================================

/// 元数据回调（如记录上游返回的 messageId）
pub type MetadataCallback = Box<dyn FnMut(&serde_json::Value) + Send>;

/// 翻译流
///
/// 产出 `Ok(事件)`；上游出错时先产出一个 `Err`，随后仍然产出收尾事件
/// （关闭思考块、finish、terminator），保证调用方不会挂起。
pub struct TranslatedStream {
    source: Option<StreamResponse>,
    decoder: LineDecoder,
    translator: StreamTranslator,
    pending: VecDeque<Result<TranslatorEvent, StreamError>>,
    metrics: StreamMetrics,
    on_metadata: Option<MetadataCallback>,
    label: String,
}

impl TranslatedStream {
    pub fn new(source: StreamResponse, scheme: TagScheme, config: &StreamConfig) -> Self {
        Self {
            source: Some(source),
            decoder: LineDecoder::new(config.buffer_size),
            translator: StreamTranslator::new(scheme),
            pending: VecDeque::new(),
            metrics: StreamMetrics::new(),
            on_metadata: None,
            label: String::new(),
        }
    }

    /// 设置元数据回调
    pub fn with_metadata_callback(mut self, callback: MetadataCallback) -> Self {
        self.on_metadata = Some(callback);
        self
    }

    /// 日志中使用的标识（通常是响应 id）
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn metrics(&self) -> &StreamMetrics {
        &self.metrics
    }

    fn handle_lines(&mut self, lines: Vec<String>) {
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            self.metrics.record_line();
            for event in self.translator.push_line(&line) {
                if let (TranslatorEvent::Metadata(value), Some(callback)) =
                    (&event, self.on_metadata.as_mut())
                {
                    callback(value);
                }
                self.pending.push_back(Ok(event));
            }
        }
        self.metrics
            .set_malformed_lines(self.translator.malformed_lines());

        if self.translator.is_closed() {
            self.source = None;
            self.complete();
        }
    }

    /// 上游出错：记录错误帧，然后强制收尾
    fn fail(&mut self, error: StreamError) {
        if error == StreamError::ClientDisconnected {
            info!("[STREAM] 客户端断开，停止读取上游 ({})", self.label);
        } else {
            warn!("[STREAM] 上游流中断 ({}): {}", self.label, error);
        }
        self.metrics.record_error();
        self.pending.push_back(Err(error));
        self.pending
            .extend(self.translator.finish().into_iter().map(Ok));
        self.source = None;
        self.complete();
    }

    /// 上游正常结束
    fn end_of_body(&mut self) {
        if let Some(rest) = self.decoder.flush() {
            self.handle_lines(vec![rest]);
        }
        self.pending
            .extend(self.translator.finish().into_iter().map(Ok));
        self.source = None;
        self.complete();
    }

    fn complete(&mut self) {
        if !self.metrics.is_finished() {
            self.metrics.finish();
            self.metrics.log_metrics(&self.label);
        }
    }
}

impl Stream for TranslatedStream {
    type Item = Result<TranslatorEvent, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(item) = this.pending.pop_front() {
                return Poll::Ready(Some(item));
            }

            let Some(source) = this.source.as_mut() else {
                return Poll::Ready(None);
            };

            match source.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.metrics.record_chunk(bytes.len());
                    let lines = this.decoder.push(&bytes);
                    this.handle_lines(lines);
                    if this.source.is_some() && this.decoder.is_overflowed() {
                        this.fail(StreamError::BufferOverflow);
                    }
                }
                Poll::Ready(Some(Err(error))) => this.fail(error),
                Poll::Ready(None) => this.end_of_body(),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// ============================================================================
// 组装
// ============================================================================

/// 为上游字节流加上超时、取消，并接入翻译器
pub fn translate(
    source: StreamResponse,
    scheme: TagScheme,
    config: &StreamConfig,
    cancel: Option<CancellationToken>,
) -> TranslatedStream {
    let source: StreamResponse = Box::pin(TimeoutStream::new(source, config));
    let source: StreamResponse = match cancel {
        Some(token) => Box::pin(CancellableStream::new(source, token)),
        None => source,
    };
    TranslatedStream::new(source, scheme, config)
}

/// 翻译流 → SSE 帧流
///
/// 错误渲染为 `event: error` 帧，其后的收尾事件照常渲染。
pub fn into_sse_stream(
    events: TranslatedStream,
    mut renderer: ChunkRenderer,
) -> BoxStream<'static, String> {
    events
        .flat_map(move |item| {
            let frames = match item {
                Ok(event) => renderer.render(&event),
                Err(error) => vec![error.to_sse_error()],
            };
            futures::stream::iter(frames)
        })
        .boxed()
}

/// 翻译流 → 非流式响应；任何上游错误都使整个调用失败
pub async fn aggregate(
    mut events: TranslatedStream,
    model: &str,
    prompt_text: &str,
) -> Result<ChatCompletionResponse, StreamError> {
    let mut aggregator = ResponseAggregator::new();
    while let Some(item) = events.next().await {
        aggregator.push(&item?);
    }
    Ok(aggregator.into_response(model, prompt_text))
}

// ============================================================================
// 测试模块
// ============================================================================
