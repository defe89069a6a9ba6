//! Agent 编排器：生成程序 → 沙箱执行 → 组装轨迹
//!
//! 每次委派按 (depth, prompt 长度) 路由：深度到顶必定直接回答；否则超过分块阈值就
//! 以 depth + 1 递归生成子 Agent，把 prompt 当作子 Agent 的文档。
//! 子调用结果通过通道回传，沙箱结束后由本层显式折叠进自己的轨迹。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::mpsc;

use crate::core::AgentError;
use crate::engine::events::{AgentEvent, Notifier};
use crate::engine::sandbox::{DelegateFn, DelegationRequest, Sandbox, SandboxLimits};
use crate::engine::trace::{
    preview, ChildEntry, ChildSummary, ContextInfo, ExecutionResult, ExecutionTrace, Usage,
    CHILD_SUMMARY_PREVIEW,
};
use crate::llm::prompts::RECURSIVE_CHILD_QUERY;
use crate::llm::{ModelClient, ModelReply};
use crate::memory::Memory;

/// 单次运行的参数（运行期间只读）
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    /// 委派 prompt 超过此字符数时递归
    pub max_chunk_size: usize,
    /// 子 Agent 嵌套层数上限（根为 0）
    pub max_recursion_depth: u32,
    pub execution_timeout: Duration,
    pub delegate_timeout: Duration,
    /// 脚本操作数上限，0 表示不限
    pub max_operations: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4-turbo-preview".to_string(),
            max_chunk_size: 50_000,
            max_recursion_depth: 10,
            execution_timeout: Duration::from_secs(300),
            delegate_timeout: Duration::from_secs(120),
            max_operations: 0,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.max_recursion_depth < 1 {
            return Err(AgentError::ConfigError(
                "max_recursion_depth must be at least 1".to_string(),
            ));
        }
        if self.max_chunk_size == 0 {
            return Err(AgentError::ConfigError(
                "max_chunk_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn sandbox_limits(&self) -> SandboxLimits {
        SandboxLimits {
            run_timeout: self.execution_timeout,
            delegate_timeout: self.delegate_timeout,
            max_operations: self.max_operations,
            ..Default::default()
        }
    }
}

/// 委派路由结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationRoute {
    /// 单次模型调用
    Direct,
    /// 在 depth + 1 生成完整子 Agent
    Recurse,
}

/// 先看深度上限，再看 prompt 大小
pub fn route(depth: u32, prompt_chars: usize, config: &AgentConfig) -> DelegationRoute {
    if depth + 1 >= config.max_recursion_depth {
        DelegationRoute::Direct
    } else if prompt_chars > config.max_chunk_size {
        DelegationRoute::Recurse
    } else {
        DelegationRoute::Direct
    }
}

/// 编排器；clone 开销很小（共享模型客户端与回调）
#[derive(Clone)]
pub struct Agent {
    client: ModelClient,
    config: AgentConfig,
    depth: u32,
    notifier: Option<Notifier>,
}

impl Agent {
    pub fn new(client: ModelClient, config: AgentConfig) -> Self {
        Self {
            client,
            config,
            depth: 0,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    fn child(&self) -> Self {
        Self {
            depth: self.depth + 1,
            ..self.clone()
        }
    }

    fn notify(&self, event: AgentEvent) {
        if let Some(notifier) = &self.notifier {
            notifier(event);
        }
    }

    /// 运行一次完整调用；可恢复的失败都记录在轨迹里，不会返回错误
    pub async fn run(
        &self,
        query: &str,
        context: &str,
        memory: Memory,
        execution_id: Option<String>,
    ) -> ExecutionTrace {
        self.clone()
            .run_owned(query.to_string(), Arc::from(context), memory, execution_id)
            .await
    }

    fn run_owned(
        self,
        query: String,
        context: Arc<str>,
        memory: Memory,
        execution_id: Option<String>,
    ) -> BoxFuture<'static, ExecutionTrace> {
        Box::pin(async move { self.drive(query, context, memory, execution_id).await })
    }

    async fn drive(
        self,
        query: String,
        context: Arc<str>,
        memory: Memory,
        execution_id: Option<String>,
    ) -> ExecutionTrace {
        let info = ContextInfo::from_document(&context);
        let mut trace = ExecutionTrace::begin(execution_id, &query, &info, self.depth, &self.config.model);

        tracing::info!(
            execution_id = %trace.execution_id,
            depth = self.depth,
            context_size = info.size,
            "execution start"
        );
        self.notify(AgentEvent::ExecutionStart {
            execution_id: trace.execution_id.clone(),
            root_node_id: trace.root_node_id.clone(),
            depth: self.depth,
            user_query: query.clone(),
            context_size: info.size,
        });

        self.notify(AgentEvent::GeneratingCode {
            depth: self.depth,
            context_size: info.size,
            context_hash: info.hash.clone(),
        });
        let generated = match self
            .client
            .generate_program(&query, &info, &memory, &self.config.model)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(execution_id = %trace.execution_id, error = %e, "program generation failed");
                return self.fail(trace, format!("Program generation failed: {}", e));
            }
        };
        let usage = Usage::from(&generated);
        trace.record_generation(generated.content.clone(), usage);
        self.notify(AgentEvent::CodeGenerated {
            depth: self.depth,
            code: generated.content.clone(),
            tokens: generated.total_tokens(),
            cost: generated.cost_usd,
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<ChildEntry>();
        let delegate = self.delegate_fn(tx);
        let sandbox = Sandbox::new(context, memory, delegate, self.config.sandbox_limits());

        self.notify(AgentEvent::ExecutingCode { depth: self.depth });
        let result = sandbox.execute(&generated.content).await;

        // 超时被放弃的 worker 可能还在发送；只折叠此刻已完成的子调用
        while let Ok(entry) = rx.try_recv() {
            trace.fold_child(entry);
        }

        self.finish(trace, result)
    }

    fn finish(&self, mut trace: ExecutionTrace, result: ExecutionResult) -> ExecutionTrace {
        tracing::info!(
            execution_id = %trace.execution_id,
            depth = self.depth,
            success = result.success,
            children = trace.child_traces.len(),
            total_cost_usd = trace.total_cost_usd,
            "execution finished"
        );
        let event = AgentEvent::ExecutionComplete {
            depth: self.depth,
            execution_id: trace.execution_id.clone(),
            success: result.success,
            final_result: result.final_result.clone(),
            error: result.error.clone(),
            total_cost: trace.total_cost_usd,
        };
        trace.finish(result);
        self.notify(event);
        trace
    }

    fn fail(&self, mut trace: ExecutionTrace, error: String) -> ExecutionTrace {
        self.notify(AgentEvent::ExecutionError {
            depth: self.depth,
            execution_id: trace.execution_id.clone(),
            error: error.clone(),
        });
        trace.finish(ExecutionResult::failure(error));
        trace
    }

    /// 构造沙箱使用的委派函数；每次调用分配顺序号，完成后把条目送回本层
    fn delegate_fn(&self, tx: mpsc::UnboundedSender<ChildEntry>) -> DelegateFn {
        let agent = self.clone();
        let sequence = Arc::new(AtomicU32::new(0));
        Arc::new(move |request: DelegationRequest| {
            let agent = agent.clone();
            let tx = tx.clone();
            let sequence = sequence.fetch_add(1, Ordering::SeqCst) + 1;
            agent.delegate(sequence, request, tx).boxed()
        })
    }

    async fn delegate(
        self,
        sequence: u32,
        request: DelegationRequest,
        tx: mpsc::UnboundedSender<ChildEntry>,
    ) -> Result<ModelReply, AgentError> {
        let child_depth = self.depth + 1;
        let prompt_chars = request.prompt.chars().count();
        let started = Instant::now();

        match route(self.depth, prompt_chars, &self.config) {
            DelegationRoute::Recurse => {
                tracing::info!(sequence, depth = child_depth, prompt_chars, "spawning child agent");
                let child_trace = self
                    .child()
                    .run_owned(
                        RECURSIVE_CHILD_QUERY.to_string(),
                        Arc::from(request.prompt.as_str()),
                        request.memory,
                        None,
                    )
                    .await;

                let totals = child_trace.totals();
                let answer = child_trace.answer();
                self.notify(AgentEvent::ChildComplete {
                    depth: child_depth,
                    sequence,
                    recursive: true,
                    prompt_preview: preview(&request.prompt, CHILD_SUMMARY_PREVIEW),
                    response_preview: preview(&answer, CHILD_SUMMARY_PREVIEW),
                    input_tokens: totals.input_tokens,
                    output_tokens: totals.output_tokens,
                    cost_usd: totals.cost_usd,
                    model: self.config.model.clone(),
                });
                let _ = tx.send(ChildEntry::Recursive {
                    sequence,
                    depth: child_depth,
                    trace: Box::new(child_trace),
                });

                Ok(ModelReply {
                    content: answer,
                    model: self.config.model.clone(),
                    input_tokens: totals.input_tokens,
                    output_tokens: totals.output_tokens,
                    cost_usd: totals.cost_usd,
                })
            }
            DelegationRoute::Direct => {
                tracing::debug!(sequence, depth = child_depth, prompt_chars, "direct child call");
                let reply = self
                    .client
                    .complete_child(&request.prompt, &request.memory, &self.config.model)
                    .await?;

                let summary = ChildSummary {
                    sequence,
                    depth: child_depth,
                    prompt_preview: preview(&request.prompt, CHILD_SUMMARY_PREVIEW),
                    response_preview: preview(&reply.content, CHILD_SUMMARY_PREVIEW),
                    input_tokens: reply.input_tokens,
                    output_tokens: reply.output_tokens,
                    cost_usd: reply.cost_usd,
                    model: reply.model.clone(),
                    execution_time_ms: started.elapsed().as_secs_f64() * 1000.0,
                };
                self.notify(AgentEvent::ChildComplete {
                    depth: child_depth,
                    sequence,
                    recursive: false,
                    prompt_preview: summary.prompt_preview.clone(),
                    response_preview: summary.response_preview.clone(),
                    input_tokens: summary.input_tokens,
                    output_tokens: summary.output_tokens,
                    cost_usd: summary.cost_usd,
                    model: summary.model.clone(),
                });
                let _ = tx.send(ChildEntry::Direct(summary));
                Ok(reply)
            }
        }
    }
}
