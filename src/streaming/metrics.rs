//! 流式传输指标
//!
//! 每个流式调用一份，流结束时输出一行摘要日志。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// 流式传输指标
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMetrics {
    /// 首字节时间（毫秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttfb_ms: Option<u64>,

    /// 收到的 chunk 数量
    pub chunk_count: u32,

    /// 收到的总字节数
    pub total_bytes: usize,

    /// 解析出的行数（不含空行）
    pub line_count: u32,

    /// 被跳过的无法解析行数
    pub malformed_line_count: u32,

    /// 导致流提前结束的错误数量
    pub error_count: u32,

    pub start_time: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self {
            ttfb_ms: None,
            chunk_count: 0,
            total_bytes: 0,
            line_count: 0,
            malformed_line_count: 0,
            error_count: 0,
            start_time: Utc::now(),
            end_time: None,
        }
    }
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录收到一个 chunk，第一个 chunk 同时记录 TTFB
    pub fn record_chunk(&mut self, bytes: usize) {
        if self.chunk_count == 0 {
            self.ttfb_ms = Some((Utc::now() - self.start_time).num_milliseconds().max(0) as u64);
        }
        self.chunk_count += 1;
        self.total_bytes += bytes;
    }

    pub fn record_line(&mut self) {
        self.line_count += 1;
    }

    pub fn set_malformed_lines(&mut self, count: u32) {
        self.malformed_line_count = count;
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
    }

    pub fn finish(&mut self) {
        if self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    /// 总耗时（毫秒），未结束时计算到当前时间
    pub fn duration_ms(&self) -> u64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds().max(0) as u64
    }

    pub fn summary(&self) -> String {
        let ttfb = self
            .ttfb_ms
            .map(|t| format!("{}ms", t))
            .unwrap_or_else(|| "N/A".to_string());
        format!(
            "chunks: {}, bytes: {}, lines: {}, malformed: {}, errors: {}, duration: {}ms, ttfb: {}",
            self.chunk_count,
            self.total_bytes,
            self.line_count,
            self.malformed_line_count,
            self.error_count,
            self.duration_ms(),
            ttfb
        )
    }

    pub fn log_metrics(&self, response_id: &str) {
        info!(
            response_id = %response_id,
            chunk_count = self.chunk_count,
            total_bytes = self.total_bytes,
            malformed_lines = self.malformed_line_count,
            duration_ms = self.duration_ms(),
            "[STREAM] 流式传输完成: {}",
            self.summary()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_chunk() {
        let mut metrics = StreamMetrics::new();
        assert!(metrics.ttfb_ms.is_none());
        metrics.record_chunk(10);
        metrics.record_chunk(5);
        assert_eq!(metrics.chunk_count, 2);
        assert_eq!(metrics.total_bytes, 15);
        assert!(metrics.ttfb_ms.is_some());
    }

    #[test]
    fn test_finish_is_idempotent() {
        let mut metrics = StreamMetrics::new();
        metrics.finish();
        let end = metrics.end_time;
        metrics.finish();
        assert_eq!(metrics.end_time, end);
        assert!(metrics.is_finished());
    }

    #[test]
    fn test_summary() {
        let mut metrics = StreamMetrics::new();
        metrics.record_chunk(3);
        metrics.record_line();
        metrics.set_malformed_lines(2);
        let summary = metrics.summary();
        assert!(summary.contains("chunks: 1"));
        assert!(summary.contains("malformed: 2"));
    }
}
