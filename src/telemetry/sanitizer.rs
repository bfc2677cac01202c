//! 敏感信息脱敏
//!
//! 上游错误响应体在写日志或返回给调用方之前先过一遍正则替换。

use regex::Regex;
use std::sync::OnceLock;

const REPLACEMENT: &str = "[REDACTED]";

/// 内置的敏感信息正则模式
fn builtin_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let patterns = [
            // OpenAI 风格 API 密钥
            r"sk-[a-zA-Z0-9_-]{20,}",
            // Bearer token
            r"Bearer\s+[a-zA-Z0-9_\-.=]+",
            // next-auth session cookie
            r"__Secure-next-auth\.session-token=[^;\s]+",
            // 通用 key=value 模式
            r"(?i)(api[_-]?key|access[_-]?token|session[_-]?token|auth[_-]?token|password|secret|token|key)\s*[=:]\s*[^\s,;&]+",
        ];
        patterns
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

/// 替换文本中的敏感信息
pub fn sanitize(text: &str) -> String {
    let mut result = text.to_string();
    for pattern in builtin_patterns() {
        result = pattern.replace_all(&result, REPLACEMENT).to_string();
    }
    result
}

/// 遮蔽密钥，只保留前后各 4 个字符
///
/// 长度不超过 12 的密钥完全遮蔽。
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 12 {
        return "*".repeat(chars.len().min(8));
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}
