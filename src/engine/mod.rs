//! 递归执行引擎
//!
//! - **sandbox**：受限 Rhai 引擎中运行生成的程序，桥接同步 delegate 与异步模型调用
//! - **agent**：编排一次调用（生成 → 执行 → 轨迹），按深度与大小决定直接回答或递归
//! - **trace**：轨迹数据模型（ExecutionTrace / ExecutionResult / ChildCall）
//! - **safety**：执行前的词法黑名单
//! - **events**：过程事件与流式输出

pub mod agent;
pub mod events;
pub mod safety;
pub mod sandbox;
pub mod trace;

pub use agent::{route, Agent, AgentConfig, DelegationRoute};
pub use events::{channel_notifier, event_stream, AgentEvent, Notifier};
pub use sandbox::{DelegateFn, DelegationRequest, Sandbox, SandboxLimits, NO_COMPLETION_ERROR};
pub use trace::{
    ChildCall, ChildEntry, ChildSummary, ContextInfo, ExecutionResult, ExecutionTrace, Usage,
};
