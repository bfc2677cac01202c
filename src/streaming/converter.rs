//! 事件渲染
//!
//! - [`ChunkRenderer`]: 翻译事件 → OpenAI `chat.completion.chunk` SSE 帧
//! - [`ResponseAggregator`]: 翻译事件 → 非流式 `chat.completion` 响应
//!
//! 同一个响应的所有 chunk 共享一个 `chatcmpl-<uuid>` id 和请求中的模型名。

use super::translator::TranslatorEvent;
use crate::models::openai::{
    estimate_tokens, ChatCompletionChunk, ChatCompletionResponse, Choice, ChunkChoice, ChunkDelta,
    ResponseMessage, Usage,
};
use uuid::Uuid;

/// 思考块开头标记
pub const REASONING_OPEN_MARKER: &str = "<think>\n\n";
/// 思考块结尾标记
pub const REASONING_CLOSE_MARKER: &str = "\n</think>\n\n";
/// 流结束标记
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

const ASSISTANT: &str = "assistant";

pub fn new_response_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4())
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

// ============================================================================
// 流式渲染
// ============================================================================

#[derive(Debug, Clone)]
pub struct ChunkRenderer {
    response_id: String,
    model: String,
    created: i64,
    role_emitted: bool,
}

impl ChunkRenderer {
    pub fn new(model: impl Into<String>) -> Self {
        Self::with_id(new_response_id(), model)
    }

    pub fn with_id(response_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            response_id: response_id.into(),
            model: model.into(),
            created: now_secs(),
            role_emitted: false,
        }
    }

    pub fn response_id(&self) -> &str {
        &self.response_id
    }

    /// 渲染一个事件，返回零到多个 SSE 帧
    pub fn render(&mut self, event: &TranslatorEvent) -> Vec<String> {
        match event {
            TranslatorEvent::RoleOpen { content } | TranslatorEvent::ContentDelta { content } => {
                vec![self.content_frame(content.clone())]
            }
            TranslatorEvent::ReasoningOpen { content, .. } => {
                vec![self.content_frame(format!("{}{}", REASONING_OPEN_MARKER, content))]
            }
            TranslatorEvent::ReasoningDelta { content } => {
                vec![self.content_frame(content.clone())]
            }
            TranslatorEvent::ReasoningClose => {
                vec![self.content_frame(REASONING_CLOSE_MARKER.to_string())]
            }
            TranslatorEvent::Metadata(_) => Vec::new(),
            TranslatorEvent::Finish { reasoning } => {
                let mut frames = Vec::new();
                if !self.role_emitted {
                    frames.push(self.content_frame(String::new()));
                }
                if let Some(text) = reasoning {
                    frames.push(self.frame(
                        ChunkDelta {
                            meta: Some(serde_json::json!({ "thinking_content": text })),
                            ..Default::default()
                        },
                        None,
                    ));
                }
                frames.push(self.frame(ChunkDelta::default(), Some("stop")));
                frames
            }
            TranslatorEvent::Terminator => vec![DONE_FRAME.to_string()],
        }
    }

    /// 第一帧带上角色
    fn content_frame(&mut self, content: String) -> String {
        let role = if self.role_emitted {
            None
        } else {
            self.role_emitted = true;
            Some(ASSISTANT.to_string())
        };
        self.frame(
            ChunkDelta {
                role,
                content: Some(content),
                meta: None,
            },
            None,
        )
    }

    fn frame(&self, delta: ChunkDelta, finish_reason: Option<&str>) -> String {
        let chunk = ChatCompletionChunk {
            id: self.response_id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            }],
        };
        // ChatCompletionChunk 只含字符串、数字和 Value，序列化不会失败
        let json = serde_json::to_string(&chunk).unwrap_or_default();
        format!("data: {}\n\n", json)
    }
}

// ============================================================================
// 非流式聚合
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ResponseAggregator {
    content: String,
    reasoning: String,
    finished: bool,
}

impl ResponseAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &TranslatorEvent) {
        match event {
            TranslatorEvent::RoleOpen { content } | TranslatorEvent::ContentDelta { content } => {
                self.content.push_str(content)
            }
            TranslatorEvent::ReasoningOpen { content, .. }
            | TranslatorEvent::ReasoningDelta { content } => self.reasoning.push_str(content),
            TranslatorEvent::Finish { reasoning } => {
                if let Some(text) = reasoning {
                    self.reasoning = text.clone();
                }
                self.finished = true;
            }
            TranslatorEvent::ReasoningClose
            | TranslatorEvent::Metadata(_)
            | TranslatorEvent::Terminator => {}
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// 生成最终响应
    ///
    /// `prompt_text` 是请求中所有消息内容的拼接，仅用于估算 prompt token。
    pub fn into_response(self, model: &str, prompt_text: &str) -> ChatCompletionResponse {
        let completion_tokens = estimate_tokens(&self.content) + estimate_tokens(&self.reasoning);
        let reasoning_content = if self.reasoning.is_empty() {
            None
        } else {
            Some(self.reasoning)
        };

        ChatCompletionResponse {
            id: new_response_id(),
            object: "chat.completion".to_string(),
            created: now_secs(),
            model: model.to_string(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: ASSISTANT.to_string(),
                    content: self.content,
                    reasoning_content,
                },
                finish_reason: "stop".to_string(),
            }],
            usage: Usage::new(estimate_tokens(prompt_text), completion_tokens),
        }
    }
}

/// 从 SSE 帧中提取所有文本内容（不含 `[DONE]` 与错误帧）
pub fn extract_content_from_sse(frames: &[String]) -> String {
    let mut content = String::new();
    for frame in frames {
        for line in frame.lines() {
            let Some(json_str) = line.strip_prefix("data: ") else {
                continue;
            };
            if json_str == "[DONE]" {
                continue;
            }
            if let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(json_str) {
                for choice in chunk.choices {
                    if let Some(text) = choice.delta.content {
                        content.push_str(&text);
                    }
                }
            }
        }
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn parse_frame(frame: &str) -> Value {
        let json = frame
            .strip_prefix("data: ")
            .and_then(|s| s.strip_suffix("\n\n"))
            .unwrap();
        serde_json::from_str(json).unwrap()
    }

    fn render_all(events: &[TranslatorEvent]) -> Vec<String> {
        let mut renderer = ChunkRenderer::with_id("chatcmpl-test", "gpt-4.1");
        events.iter().flat_map(|e| renderer.render(e)).collect()
    }

    #[test]
    fn test_reasoning_rendering() {
        let frames = render_all(&[
            TranslatorEvent::ReasoningOpen {
                content: "think".to_string(),
                with_role: true,
            },
            TranslatorEvent::ReasoningDelta {
                content: "more".to_string(),
            },
            TranslatorEvent::ReasoningClose,
            TranslatorEvent::ContentDelta {
                content: "answer".to_string(),
            },
            TranslatorEvent::Finish {
                reasoning: Some("thinkmore".to_string()),
            },
            TranslatorEvent::Terminator,
        ]);
        assert_eq!(frames.len(), 7);

        let first = parse_frame(&frames[0]);
        assert_eq!(first["object"], "chat.completion.chunk");
        assert_eq!(first["id"], "chatcmpl-test");
        assert_eq!(first["model"], "gpt-4.1");
        assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(first["choices"][0]["delta"]["content"], "<think>\n\nthink");
        assert!(first["choices"][0]["finish_reason"].is_null());

        let second = parse_frame(&frames[1]);
        assert!(second["choices"][0]["delta"].get("role").is_none());
        assert_eq!(second["choices"][0]["delta"]["content"], "more");

        assert_eq!(
            parse_frame(&frames[2])["choices"][0]["delta"]["content"],
            "\n</think>\n\n"
        );

        let meta = parse_frame(&frames[4]);
        assert_eq!(
            meta["choices"][0]["delta"]["meta"]["thinking_content"],
            "thinkmore"
        );

        let finish = parse_frame(&frames[5]);
        assert_eq!(finish["choices"][0]["delta"], serde_json::json!({}));
        assert_eq!(finish["choices"][0]["finish_reason"], "stop");

        assert_eq!(frames[6], "data: [DONE]\n\n");
    }

    #[test]
    fn test_plain_rendering_has_no_meta_chunk() {
        let frames = render_all(&[
            TranslatorEvent::RoleOpen {
                content: "hello".to_string(),
            },
            TranslatorEvent::ContentDelta {
                content: " world".to_string(),
            },
            TranslatorEvent::Finish { reasoning: None },
            TranslatorEvent::Terminator,
        ]);
        assert_eq!(frames.len(), 4);
        assert_eq!(extract_content_from_sse(&frames), "hello world");
        assert!(!frames.iter().any(|f| f.contains("thinking_content")));
    }

    #[test]
    fn test_finish_without_content_emits_role() {
        let frames = render_all(&[
            TranslatorEvent::Finish { reasoning: None },
            TranslatorEvent::Terminator,
        ]);
        assert_eq!(frames.len(), 3);
        assert_eq!(
            parse_frame(&frames[0])["choices"][0]["delta"]["role"],
            "assistant"
        );
    }

    #[test]
    fn test_all_frames_share_id() {
        let mut renderer = ChunkRenderer::new("m");
        let id = renderer.response_id().to_string();
        assert!(id.starts_with("chatcmpl-"));
        let frames: Vec<String> = [
            TranslatorEvent::RoleOpen {
                content: "a".to_string(),
            },
            TranslatorEvent::Finish { reasoning: None },
        ]
        .iter()
        .flat_map(|e| renderer.render(e))
        .collect();
        for frame in &frames {
            assert_eq!(parse_frame(frame)["id"], id.as_str());
        }
    }

    #[test]
    fn test_metadata_not_rendered() {
        let frames = render_all(&[TranslatorEvent::Metadata(
            serde_json::json!({"messageId": "x"}),
        )]);
        assert!(frames.is_empty());
    }

    #[test]
    fn test_aggregate() {
        let mut agg = ResponseAggregator::new();
        for event in [
            TranslatorEvent::ReasoningOpen {
                content: "think".to_string(),
                with_role: true,
            },
            TranslatorEvent::ReasoningDelta {
                content: "more".to_string(),
            },
            TranslatorEvent::ReasoningClose,
            TranslatorEvent::ContentDelta {
                content: "answer".to_string(),
            },
            TranslatorEvent::Finish {
                reasoning: Some("thinkmore".to_string()),
            },
            TranslatorEvent::Terminator,
        ] {
            agg.push(&event);
        }
        assert!(agg.is_finished());

        let resp = agg.into_response("gpt-4.1", "hi");
        assert_eq!(resp.object, "chat.completion");
        assert_eq!(resp.model, "gpt-4.1");
        assert_eq!(resp.choices[0].message.content, "answer");
        assert_eq!(
            resp.choices[0].message.reasoning_content.as_deref(),
            Some("thinkmore")
        );
        assert_eq!(resp.choices[0].finish_reason, "stop");
        // "answer" 6/4→2, "thinkmore" 9/4→3, "hi" 2/4→1
        assert_eq!(resp.usage.completion_tokens, 5);
        assert_eq!(resp.usage.prompt_tokens, 1);
        assert_eq!(resp.usage.total_tokens, 6);
    }
}
