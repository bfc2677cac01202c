//! 流式翻译状态机
//!
//! 把上游的行序列翻译成统一的输出事件序列：
//!
//! ```text
//!          content               reasoning
//!   Idle ──────────▶ Streaming ◀──────────▶ InReasoning
//!     │  reasoning      │        content        │
//!     └─────────────────┼───────────────────────┘
//!                       ▼ end-of-turn / 上游结束
//!                     Closed
//! ```
//!
//! 保证：思考块最多同时打开一个；结束前一定先关闭思考块；
//! finish 后紧跟且只有一个 terminator。

use super::error::StreamError;
use super::line_parser::{TagScheme, VendorLine};
use tracing::{debug, warn};

/// 状态机阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslatorPhase {
    Idle,
    Streaming,
    InReasoning,
    Closed,
}

/// 每次流式调用独立的一份状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatorState {
    pub inside_reasoning_block: bool,
    pub accumulated_reasoning_text: String,
    pub is_first_emitted_chunk: bool,
}

impl Default for TranslatorState {
    fn default() -> Self {
        Self {
            inside_reasoning_block: false,
            accumulated_reasoning_text: String::new(),
            is_first_emitted_chunk: true,
        }
    }
}

/// 统一输出事件
#[derive(Debug, Clone, PartialEq)]
pub enum TranslatorEvent {
    /// 第一个正文片段，附带角色
    RoleOpen { content: String },
    /// 打开思考块；`with_role` 表示这是整个响应的第一个事件
    ReasoningOpen { content: String, with_role: bool },
    ReasoningDelta { content: String },
    ReasoningClose,
    ContentDelta { content: String },
    /// 上游元数据（如 messageId），不影响状态
    Metadata(serde_json::Value),
    /// 结束，附带完整的思考文本
    Finish { reasoning: Option<String> },
    Terminator,
}

/// 流式翻译器
#[derive(Debug)]
pub struct StreamTranslator {
    scheme: TagScheme,
    phase: TranslatorPhase,
    state: TranslatorState,
    malformed_lines: u32,
}

impl StreamTranslator {
    pub fn new(scheme: TagScheme) -> Self {
        Self {
            scheme,
            phase: TranslatorPhase::Idle,
            state: TranslatorState::default(),
            malformed_lines: 0,
        }
    }

    pub fn phase(&self) -> TranslatorPhase {
        self.phase
    }

    pub fn state(&self) -> &TranslatorState {
        &self.state
    }

    pub fn is_closed(&self) -> bool {
        self.phase == TranslatorPhase::Closed
    }

    /// 跳过的无法解析行数
    pub fn malformed_lines(&self) -> u32 {
        self.malformed_lines
    }

    /// 处理一行原始文本
    ///
    /// 无法解析的行记录日志后跳过，不会中断翻译。
    pub fn push_line(&mut self, raw: &str) -> Vec<TranslatorEvent> {
        if self.is_closed() {
            debug!("[STREAM] 已结束，忽略后续行");
            return Vec::new();
        }
        match self.scheme.parse_line(raw) {
            Ok(Some(line)) => self.apply(line),
            Ok(None) => Vec::new(),
            Err(e) => {
                self.malformed_lines += 1;
                warn!("[STREAM] 跳过无法解析的行: {}", e);
                Vec::new()
            }
        }
    }

    /// 推进状态机
    pub fn apply(&mut self, line: VendorLine) -> Vec<TranslatorEvent> {
        let mut events = Vec::new();
        match (self.phase, line) {
            (TranslatorPhase::Closed, _) => {}

            (_, VendorLine::Metadata(value)) => events.push(TranslatorEvent::Metadata(value)),

            (_, VendorLine::EndOfTurn) => self.close_into(&mut events),

            (_, VendorLine::Reasoning(text)) | (_, VendorLine::Content(text))
                if text.is_empty() => {}

            (TranslatorPhase::Idle, VendorLine::Content(text)) => {
                self.phase = TranslatorPhase::Streaming;
                self.state.is_first_emitted_chunk = false;
                events.push(TranslatorEvent::RoleOpen { content: text });
            }

            (TranslatorPhase::Idle, VendorLine::Reasoning(text))
            | (TranslatorPhase::Streaming, VendorLine::Reasoning(text)) => {
                let with_role = self.state.is_first_emitted_chunk;
                self.phase = TranslatorPhase::InReasoning;
                self.state.is_first_emitted_chunk = false;
                self.state.inside_reasoning_block = true;
                self.state.accumulated_reasoning_text.push_str(&text);
                events.push(TranslatorEvent::ReasoningOpen {
                    content: text,
                    with_role,
                });
            }

            (TranslatorPhase::InReasoning, VendorLine::Reasoning(text)) => {
                self.state.accumulated_reasoning_text.push_str(&text);
                events.push(TranslatorEvent::ReasoningDelta { content: text });
            }

            (TranslatorPhase::InReasoning, VendorLine::Content(text)) => {
                self.phase = TranslatorPhase::Streaming;
                self.state.inside_reasoning_block = false;
                events.push(TranslatorEvent::ReasoningClose);
                events.push(TranslatorEvent::ContentDelta { content: text });
            }

            (TranslatorPhase::Streaming, VendorLine::Content(text)) => {
                events.push(TranslatorEvent::ContentDelta { content: text });
            }
        }
        events
    }

    /// 上游在没有结束标记的情况下结束（正常 EOF 或出错）
    ///
    /// 未关闭的思考块会被强制关闭，然后补发 finish 和 terminator。
    /// 已经结束时返回空。
    pub fn finish(&mut self) -> Vec<TranslatorEvent> {
        let mut events = Vec::new();
        if self.is_closed() {
            return events;
        }
        let violation = StreamError::ProtocolViolation(format!(
            "上游未发送结束标记即关闭 (phase={:?})",
            self.phase
        ));
        warn!("[STREAM] {}", violation);
        self.close_into(&mut events);
        events
    }

    fn close_into(&mut self, events: &mut Vec<TranslatorEvent>) {
        if self.phase == TranslatorPhase::InReasoning {
            self.state.inside_reasoning_block = false;
            events.push(TranslatorEvent::ReasoningClose);
        }
        self.phase = TranslatorPhase::Closed;

        let reasoning = if self.state.accumulated_reasoning_text.is_empty() {
            None
        } else {
            Some(self.state.accumulated_reasoning_text.clone())
        };
        events.push(TranslatorEvent::Finish { reasoning });
        events.push(TranslatorEvent::Terminator);
    }
}
