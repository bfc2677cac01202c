//! 上游行协议解析
//!
//! 上游响应体按行分隔，每行形如 `<tag>:<payload>`。
//! 具体标签由 [`TagScheme`] 映射到四种语义：思考片段、正文片段、
//! 结束标记、元数据。状态机只关心语义，不关心字面标签。

use super::error::StreamError;
use serde::{Deserialize, Serialize};

/// 行语义
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Reasoning,
    Content,
    EndOfTurn,
    Metadata,
}

/// 解析后的一行
#[derive(Debug, Clone, PartialEq)]
pub enum VendorLine {
    Reasoning(String),
    Content(String),
    EndOfTurn,
    Metadata(serde_json::Value),
}

/// 标签映射
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagScheme {
    pub reasoning: Vec<String>,
    pub content: Vec<String>,
    pub end_of_turn: Vec<String>,
    pub metadata: Vec<String>,
}

impl Default for TagScheme {
    fn default() -> Self {
        Self {
            reasoning: vec!["g".to_string()],
            content: vec!["0".to_string()],
            end_of_turn: vec!["e".to_string(), "d".to_string()],
            metadata: vec!["f".to_string()],
        }
    }
}

impl TagScheme {
    pub fn classify(&self, tag: &str) -> Option<LineKind> {
        let has = |tags: &[String]| tags.iter().any(|t| t == tag);
        if has(&self.reasoning) {
            Some(LineKind::Reasoning)
        } else if has(&self.content) {
            Some(LineKind::Content)
        } else if has(&self.end_of_turn) {
            Some(LineKind::EndOfTurn)
        } else if has(&self.metadata) {
            Some(LineKind::Metadata)
        } else {
            None
        }
    }

    /// 每类至少一个标签，且同一标签不能出现在两类中
    pub fn validate(&self) -> Result<(), String> {
        let groups = [
            ("reasoning", &self.reasoning),
            ("content", &self.content),
            ("end_of_turn", &self.end_of_turn),
            ("metadata", &self.metadata),
        ];
        let mut seen: Vec<&str> = Vec::new();
        for (name, tags) in groups {
            if tags.is_empty() {
                return Err(format!("标签类别 {} 为空", name));
            }
            for tag in tags.iter() {
                if tag.is_empty() || tag.contains(':') {
                    return Err(format!("标签类别 {} 中有非法标签 {:?}", name, tag));
                }
                if seen.contains(&tag.as_str()) {
                    return Err(format!("标签 {:?} 重复出现", tag));
                }
                seen.push(tag);
            }
        }
        Ok(())
    }

    /// 解析一行
    ///
    /// 空行返回 `Ok(None)`；无法识别的行返回 `MalformedLine`，调用方跳过即可。
    pub fn parse_line(&self, raw: &str) -> Result<Option<VendorLine>, StreamError> {
        let line = raw.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Ok(None);
        }

        let Some((tag, payload)) = line.split_once(':') else {
            return Err(StreamError::malformed(line, "缺少标签分隔符"));
        };

        let kind = self
            .classify(tag.trim())
            .ok_or_else(|| StreamError::malformed(line, format!("未知标签 {:?}", tag)))?;

        let parsed = match kind {
            LineKind::Reasoning => VendorLine::Reasoning(
                decode_fragment(payload).map_err(|reason| StreamError::malformed(line, reason))?,
            ),
            LineKind::Content => VendorLine::Content(
                decode_fragment(payload).map_err(|reason| StreamError::malformed(line, reason))?,
            ),
            LineKind::EndOfTurn => VendorLine::EndOfTurn,
            LineKind::Metadata => VendorLine::Metadata(
                serde_json::from_str(payload.trim())
                    .map_err(|e| StreamError::malformed(line, format!("元数据不是合法 JSON: {}", e)))?,
            ),
        };
        Ok(Some(parsed))
    }
}

/// 解码片段载荷
///
/// 载荷两端的空白先去掉（`0: "hi"` 与 `0:"hi"` 等价），引号内的空白保留。
/// 合法的 JSON 字符串直接按 JSON 解码；否则去掉一层引号，
/// 再做一次 `\n`、`\"`、`\\` 反转义（只做一遍，不递归）。
pub fn decode_fragment(payload: &str) -> Result<String, String> {
    let payload = payload.trim();
    let quoted = payload.len() >= 2 && payload.starts_with('"') && payload.ends_with('"');

    if quoted {
        if let Ok(text) = serde_json::from_str::<String>(payload) {
            return Ok(text);
        }
        return Ok(unescape_once(&payload[1..payload.len() - 1]));
    }

    if payload.starts_with('"') || payload.ends_with('"') && !payload.ends_with("\\\"") {
        return Err("引号不成对".to_string());
    }

    Ok(unescape_once(payload))
}

/// 单遍反转义
fn unescape_once(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
