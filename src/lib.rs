//! RLM - 递归执行引擎
//!
//! Agent 为超大文档上的查询编写短程序：程序读取文档、把子问题委派给子 Agent、合并结果，
//! 而不是把整份文档塞进一次模型调用。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型
//! - **engine**: 沙箱、编排器、执行轨迹、事件
//! - **llm**: 模型提供方抽象与实现（OpenAI 兼容 / Anthropic / Mock）、价目表
//! - **memory**: 会话记忆
//! - **runner**: 执行服务（校验、持久化、记忆合并）
//! - **store**: 执行与会话存储（内存 / SQLite）

pub mod config;
pub mod core;
pub mod engine;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod runner;
pub mod store;

pub use crate::core::AgentError;
pub use engine::{Agent, AgentConfig, AgentEvent, ExecutionResult, ExecutionTrace};
pub use runner::{ExecutionRequest, ExecutionService};
