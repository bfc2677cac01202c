//! 上游字节流类型

use crate::streaming::StreamError;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// 流式响应类型别名
///
/// 上游响应体的异步字节流，每个 Item 是一个 chunk 或错误。
pub type StreamResponse = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

/// 将 reqwest 的 bytes_stream 转换为 StreamResponse
pub fn reqwest_stream_to_stream_response(response: reqwest::Response) -> StreamResponse {
    use futures::StreamExt;

    let stream = response.bytes_stream().map(|result| result.map_err(StreamError::from));

    Box::pin(stream)
}

/// 由内存中的 chunk 构造 StreamResponse（测试与本地回放）
pub fn stream_from_chunks<I, B>(chunks: I) -> StreamResponse
where
    I: IntoIterator<Item = B>,
    B: Into<Bytes>,
{
    let items: Vec<Result<Bytes, StreamError>> =
        chunks.into_iter().map(|c| Ok(c.into())).collect();
    Box::pin(futures::stream::iter(items))
}
