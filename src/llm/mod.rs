//! LLM 层：提供方抽象与实现（OpenAI 兼容 / Anthropic / Mock）、价目表、模型客户端

pub mod anthropic;
pub mod client;
pub mod mock;
pub mod openai;
pub mod pricing;
pub mod prompts;
pub mod tokens;
pub mod traits;

pub use anthropic::AnthropicClient;
pub use client::{ModelClient, ModelReply, ProviderKind};
pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use pricing::{calculate_cost, is_known_model, pricing_for, DEFAULT_PRICING};
pub use tokens::TokenEstimator;
pub use traits::{CompletionRequest, LlmError, LlmProvider, Message, ProviderReply, Role};
