//! 流式翻译模块
//!
//! 把上游按行分隔的私有流协议翻译成 OpenAI 兼容的 chunk 流。
//!
//! # 主要组件
//!
//! - `line_parser`: 行标签映射与载荷反转义
//! - `translator`: 翻译状态机
//! - `converter`: 事件 → SSE 帧 / 聚合响应
//! - `manager`: 字节流 → 事件的管道（切行、超时、取消）
//! - `error` / `metrics` / `traits`: 错误类型、指标、字节流类型

pub mod converter;
pub mod error;
pub mod line_parser;
pub mod manager;
pub mod metrics;
pub mod traits;
pub mod translator;

pub use converter::{extract_content_from_sse, ChunkRenderer, ResponseAggregator};
pub use error::StreamError;
pub use line_parser::{LineKind, TagScheme, VendorLine};
pub use manager::{
    aggregate, into_sse_stream, translate, CancellableStream, LineDecoder, MetadataCallback,
    StreamConfig, TimeoutStream, TranslatedStream,
};
pub use metrics::StreamMetrics;
pub use traits::{reqwest_stream_to_stream_response, stream_from_chunks, StreamResponse};
pub use translator::{StreamTranslator, TranslatorEvent, TranslatorPhase, TranslatorState};
