//! 引擎错误类型
//!
//! 分四类：输入错误（缺文档、未知会话）立即返回调用方；沙箱错误只落在 ExecutionResult 中，
//! 从不以 Err 形式传出；委派错误在委派边界捕获后重新抛入程序控制流；
//! 基础设施错误（凭据缺失、存储不可用）原样返回调用方。引擎内不做任何自动重试。

use thiserror::Error;

use crate::llm::LlmError;
use crate::store::StoreError;

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Either a context document or a session with stored context is required")]
    MissingContext,

    #[error("Context too large: {size} characters (limit {limit})")]
    ContextTooLarge { size: usize, limit: usize },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// 委派任务本身崩溃（panic / 被取消），与模型返回的错误区分
    #[error("Delegation failed: {0}")]
    DelegationFailed(String),
}

impl AgentError {
    /// 输入类错误：调用方参数问题，不应重试
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            AgentError::MissingContext
                | AgentError::ContextTooLarge { .. }
                | AgentError::SessionNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_error_classification() {
        assert!(AgentError::MissingContext.is_input_error());
        assert!(AgentError::SessionNotFound("s1".into()).is_input_error());
        assert!(AgentError::ContextTooLarge { size: 10, limit: 5 }.is_input_error());
        assert!(!AgentError::DelegationFailed("boom".into()).is_input_error());
    }

    #[test]
    fn test_missing_credentials_is_not_input_error() {
        let err = AgentError::from(LlmError::MissingCredentials("openai".into()));
        assert!(!err.is_input_error());
        assert!(err.to_string().contains("openai"));
    }
}
