//! 执行沙箱：在受限的 Rhai 引擎中运行一段生成的程序
//!
//! 能力集固定：`context`、`chunks`、`delegate`、`complete`、`memory_get` / `memory_set`、
//! 只读 `memory` 快照，以及被捕获的 `print` / `debug`。
//!
//! 程序体在 blocking 线程上顺序执行；`delegate` 通过运行时 Handle 把异步委派函数
//! spawn 回调度器，并在 worker 线程内同步等待（带单次超时）。整个运行另有墙钟超时，
//! 超时后取消 token、放弃 worker，立即返回超时结果。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Position, Scope};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::engine::safety;
use crate::engine::trace::{preview, ChildCall, ExecutionResult, CHILD_CALL_PREVIEW};
use crate::llm::ModelReply;
use crate::memory::Memory;

/// 程序未调用 complete() 就结束时的错误
pub const NO_COMPLETION_ERROR: &str =
    "Program completed without finishing: call complete(result) exactly once";

/// memory_set 日志中值的预览长度
const MEMORY_LOG_PREVIEW: usize = 100;

/// 一次委派：prompt 与调用时刻的工作记忆快照
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    pub prompt: String,
    pub memory: Memory,
}

/// 由编排器提供的异步委派函数
pub type DelegateFn =
    Arc<dyn Fn(DelegationRequest) -> BoxFuture<'static, Result<ModelReply, AgentError>> + Send + Sync>;

/// 沙箱限制
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    /// 整个运行的墙钟超时
    pub run_timeout: Duration,
    /// 单次 delegate 超时
    pub delegate_timeout: Duration,
    /// 操作数上限，0 表示不限
    pub max_operations: u64,
    pub max_call_levels: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(300),
            delegate_timeout: Duration::from_secs(120),
            max_operations: 0,
            max_call_levels: 64,
        }
    }
}

/// 一次运行中累积的状态（worker 与调用方共享）
#[derive(Debug, Default)]
struct RunState {
    output_log: Vec<String>,
    child_calls: Vec<ChildCall>,
    /// 工作记忆副本
    memory: Memory,
    /// 只记录 memory_set 写过的键
    memory_changes: Memory,
    /// complete() 写入的结果；设置后程序立即停止
    halt: Option<String>,
}

fn lock(state: &Mutex<RunState>) -> MutexGuard<'_, RunState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn runtime_error(message: String) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(message.into(), Position::NONE).into()
}

/// 沙箱：一个实例只运行一段程序
pub struct Sandbox {
    context: Arc<str>,
    memory: Memory,
    delegate: DelegateFn,
    limits: SandboxLimits,
}

enum Outcome {
    Returned,
    Fault(String),
    Panicked(String),
    TimedOut,
}

impl Sandbox {
    pub fn new(context: Arc<str>, memory: Memory, delegate: DelegateFn, limits: SandboxLimits) -> Self {
        Self {
            context,
            memory,
            delegate,
            limits,
        }
    }

    /// 运行程序，总是返回一个完整的 ExecutionResult
    pub async fn execute(self, program: &str) -> ExecutionResult {
        let start = Instant::now();

        let code = match safety::sanitize(program) {
            Ok(code) => code,
            Err(disallowed) => {
                tracing::warn!(label = disallowed.label, "program rejected by denylist");
                let mut result = ExecutionResult::failure(disallowed.to_string());
                result.execution_time_ms = elapsed_ms(start);
                return result;
            }
        };

        let state = Arc::new(Mutex::new(RunState {
            memory: self.memory.clone(),
            ..Default::default()
        }));
        let cancel = CancellationToken::new();
        // execute 被丢弃（父级 delegate 中止子运行）时同样通知工作线程停止
        let _cancel_on_drop = cancel.clone().drop_guard();
        let run_timeout = self.limits.run_timeout;

        let worker = {
            let state = state.clone();
            let cancel = cancel.clone();
            let handle = Handle::current();
            let Sandbox {
                context,
                memory,
                delegate,
                limits,
            } = self;
            tokio::task::spawn_blocking(move || {
                run_program(&code, context, memory, delegate, limits, state, handle, cancel)
            })
        };

        let outcome = match tokio::time::timeout(run_timeout, worker).await {
            Ok(Ok(Ok(()))) => Outcome::Returned,
            Ok(Ok(Err(err))) => Outcome::Fault(err),
            Ok(Err(join_err)) => Outcome::Panicked(join_err.to_string()),
            Err(_) => {
                cancel.cancel();
                Outcome::TimedOut
            }
        };

        let mut st = lock(&state);
        let mut result = ExecutionResult {
            output_log: std::mem::take(&mut st.output_log),
            child_calls: std::mem::take(&mut st.child_calls),
            memory_changes: std::mem::take(&mut st.memory_changes),
            execution_time_ms: elapsed_ms(start),
            ..Default::default()
        };

        match (outcome, st.halt.take()) {
            (Outcome::TimedOut, _) => {
                let secs = run_timeout.as_secs_f64();
                tracing::warn!(timeout_secs = secs, "program timed out");
                result.error = Some(format!("Execution timed out after {} seconds", secs));
            }
            (_, Some(answer)) => {
                result.success = true;
                result.final_result = Some(answer);
            }
            (Outcome::Returned, None) => {
                result.error = Some(NO_COMPLETION_ERROR.to_string());
            }
            (Outcome::Fault(message), None) => {
                result.error = Some(message);
            }
            (Outcome::Panicked(msg), None) => {
                result.error = Some(format!("WorkerPanic: {}", msg));
            }
        }

        tracing::info!(
            success = result.success,
            child_calls = result.child_calls.len(),
            elapsed_ms = result.execution_time_ms,
            "program finished"
        );
        result
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// "<类型>: <信息>"
fn describe_fault(err: &EvalAltResult) -> String {
    let kind = match err {
        EvalAltResult::ErrorParsing(..) => "ParseError",
        EvalAltResult::ErrorRuntime(..) => "RuntimeError",
        EvalAltResult::ErrorVariableNotFound(..) => "VariableNotFound",
        EvalAltResult::ErrorFunctionNotFound(..) => "FunctionNotFound",
        EvalAltResult::ErrorInFunctionCall(..) => "FunctionCallError",
        EvalAltResult::ErrorMismatchDataType(..) | EvalAltResult::ErrorMismatchOutputType(..) => {
            "TypeError"
        }
        EvalAltResult::ErrorIndexingType(..)
        | EvalAltResult::ErrorArrayBounds(..)
        | EvalAltResult::ErrorStringBounds(..) => "IndexError",
        EvalAltResult::ErrorArithmetic(..) => "ArithmeticError",
        EvalAltResult::ErrorTooManyOperations(..) => "TooManyOperations",
        EvalAltResult::ErrorStackOverflow(..) => "StackOverflow",
        EvalAltResult::ErrorTerminated(..) => "Terminated",
        _ => "EvalError",
    };
    format!("{}: {}", kind, err)
}

/// complete() 的参数转为结果文本：字符串原样，其它值转 JSON
fn render_value(value: &Dynamic) -> String {
    if value.is_string() {
        return value.to_string();
    }
    if value.is_unit() {
        return String::new();
    }
    rhai::serde::from_dynamic::<serde_json::Value>(value)
        .map(|v| v.to_string())
        .unwrap_or_else(|_| value.to_string())
}

/// 按字符把文本切成不超过 size 的片段
fn split_chunks(text: &str, size: i64) -> Result<Array, Box<EvalAltResult>> {
    if size <= 0 {
        return Err(runtime_error(format!("chunks: size must be positive, got {}", size)));
    }
    let size = size as usize;
    let chars: Vec<char> = text.chars().collect();
    Ok(chars
        .chunks(size)
        .map(|piece| Dynamic::from(piece.iter().collect::<String>()))
        .collect())
}

#[allow(clippy::too_many_arguments)]
fn run_program(
    code: &str,
    context: Arc<str>,
    memory_at_entry: Memory,
    delegate: DelegateFn,
    limits: SandboxLimits,
    state: Arc<Mutex<RunState>>,
    handle: Handle,
    cancel: CancellationToken,
) -> Result<(), String> {
    let mut engine = Engine::new();
    engine.disable_symbol("eval");
    engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
    engine.set_max_call_levels(limits.max_call_levels);
    if limits.max_operations > 0 {
        engine.set_max_operations(limits.max_operations);
    }

    {
        let state = state.clone();
        engine.on_print(move |text| {
            lock(&state).output_log.push(format!("[print] {}", text));
        });
    }
    {
        let state = state.clone();
        engine.on_debug(move |text, _source, _pos| {
            lock(&state).output_log.push(format!("[debug] {}", text));
        });
    }
    {
        // 取消（运行超时）或 complete() 已调用时立即终止
        let state = state.clone();
        let cancel = cancel.clone();
        engine.on_progress(move |_ops| {
            if cancel.is_cancelled() || lock(&state).halt.is_some() {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });
    }

    engine.register_fn("chunks", split_chunks);

    {
        let state = state.clone();
        engine.register_fn("complete", move |value: Dynamic| -> Result<(), Box<EvalAltResult>> {
            let mut st = lock(&state);
            if st.halt.is_none() {
                st.halt = Some(render_value(&value));
            }
            Err(EvalAltResult::ErrorTerminated(Dynamic::UNIT, Position::NONE).into())
        });
    }

    {
        let state = state.clone();
        engine.register_fn("memory_get", move |key: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            match lock(&state).memory.get(key) {
                Some(value) => rhai::serde::to_dynamic(value),
                None => Ok(Dynamic::UNIT),
            }
        });
    }
    {
        let state = state.clone();
        engine.register_fn(
            "memory_get",
            move |key: &str, default: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
                match lock(&state).memory.get(key) {
                    Some(value) => rhai::serde::to_dynamic(value),
                    None => Ok(default),
                }
            },
        );
    }
    {
        let state = state.clone();
        engine.register_fn(
            "memory_set",
            move |key: &str, value: Dynamic| -> Result<(), Box<EvalAltResult>> {
                let json = rhai::serde::from_dynamic::<serde_json::Value>(&value).map_err(|e| {
                    runtime_error(format!("memory_set: value for `{}` is not JSON-representable: {}", key, e))
                })?;
                let mut st = lock(&state);
                st.output_log.push(format!(
                    "[memory_set] {} = {}",
                    key,
                    preview(&json.to_string(), MEMORY_LOG_PREVIEW)
                ));
                st.memory.insert(key.to_string(), json.clone());
                st.memory_changes.insert(key.to_string(), json);
                Ok(())
            },
        );
    }

    {
        let state = state.clone();
        let delegate_timeout = limits.delegate_timeout;
        engine.register_fn("delegate", move |prompt: &str| -> Result<String, Box<EvalAltResult>> {
            let started = Instant::now();
            let request = DelegationRequest {
                prompt: prompt.to_string(),
                memory: lock(&state).memory.clone(),
            };
            let task = handle.spawn(delegate(request));
            let abort = task.abort_handle();

            let waited = handle.block_on(async {
                tokio::select! {
                    r = tokio::time::timeout(delegate_timeout, task) => Some(r),
                    _ = cancel.cancelled() => None,
                }
            });
            let Some(waited) = waited else {
                abort.abort();
                return Err(runtime_error("delegate cancelled: run timed out".to_string()));
            };

            match waited {
                Ok(Ok(Ok(reply))) => {
                    let mut st = lock(&state);
                    st.output_log.push(format!(
                        "[delegate] Tokens: {}+{}, Cost: ${:.4}",
                        reply.input_tokens, reply.output_tokens, reply.cost_usd
                    ));
                    st.child_calls.push(ChildCall {
                        prompt: preview(prompt, CHILD_CALL_PREVIEW),
                        result: preview(&reply.content, CHILD_CALL_PREVIEW),
                        input_tokens: reply.input_tokens,
                        output_tokens: reply.output_tokens,
                        cost_usd: reply.cost_usd,
                        execution_time_ms: elapsed_ms(started),
                    });
                    Ok(reply.content)
                }
                Ok(Ok(Err(e))) => {
                    lock(&state).output_log.push(format!("[delegate] ERROR: {}", e));
                    Err(runtime_error(format!("delegate failed: {}", e)))
                }
                Ok(Err(join_err)) => {
                    let e = AgentError::DelegationFailed(join_err.to_string());
                    lock(&state).output_log.push(format!("[delegate] ERROR: {}", e));
                    Err(runtime_error(format!("delegate failed: {}", e)))
                }
                Err(_) => {
                    abort.abort();
                    let secs = delegate_timeout.as_secs_f64();
                    tracing::warn!(timeout_secs = secs, "delegate timed out");
                    lock(&state)
                        .output_log
                        .push(format!("[delegate] TIMEOUT after {}s", secs));
                    Err(runtime_error(format!("delegate timed out after {}s", secs)))
                }
            }
        });
    }

    let mut scope = Scope::new();
    scope.push_constant("context", ImmutableString::from(&*context));
    let memory_map = rhai::serde::to_dynamic(&memory_at_entry).map_err(|e| describe_fault(&e))?;
    scope.push_constant("memory", memory_map);

    // 错误在 worker 内转成文本：Dynamic 不能跨线程
    engine
        .run_with_scope(&mut scope, code)
        .map_err(|e| describe_fault(&e))
}
