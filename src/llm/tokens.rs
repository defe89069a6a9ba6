//! Token 估算
//!
//! 上游未返回 usage 时用于兜底计费：英文约 4 字符/token，CJK 约 1.5 字符/token。

use crate::llm::CompletionRequest;

/// Token 估算器（字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量（非空文本至少 1）
    pub fn estimate(text: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        let mut ascii_chars = 0u64;
        let mut non_ascii_chars = 0u64;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as u64;
        tokens.max(1)
    }

    /// 估算一次请求的输入 token：system prompt + 全部消息
    pub fn estimate_request(request: &CompletionRequest) -> u64 {
        let system = request
            .system_prompt
            .as_deref()
            .map(Self::estimate)
            .unwrap_or(0);
        system
            + request
                .messages
                .iter()
                .map(|m| Self::estimate(&m.content))
                .sum::<u64>()
    }
}
