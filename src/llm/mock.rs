//! Mock LLM 提供方（用于测试，无需 API）
//!
//! 生成程序请求（system prompt 为 PROGRAM_SYSTEM_PROMPT）返回预置程序；
//! 其余请求视为子查询，默认回答 "Answer for N chars"，可替换为自定义闭包。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::prompts::PROGRAM_SYSTEM_PROMPT;
use crate::llm::{CompletionRequest, LlmError, LlmProvider, ProviderReply};

type ChildResponder = Arc<dyn Fn(&str) -> Result<String, LlmError> + Send + Sync>;

/// Mock 提供方
pub struct MockLlmClient {
    program: String,
    responder: ChildResponder,
    usage: (u64, u64),
    child_delay: Option<Duration>,
    generation_calls: AtomicUsize,
    child_calls: AtomicUsize,
    child_tasks: Mutex<Vec<String>>,
}

impl MockLlmClient {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            responder: Arc::new(|task: &str| Ok(format!("Answer for {} chars", task.chars().count()))),
            usage: (100, 20),
            child_delay: None,
            generation_calls: AtomicUsize::new(0),
            child_calls: AtomicUsize::new(0),
            child_tasks: Mutex::new(Vec::new()),
        }
    }

    /// 每次调用上报的 (input, output) token；(0, 0) 表示不上报
    pub fn with_usage(mut self, input: u64, output: u64) -> Self {
        self.usage = (input, output);
        self
    }

    /// 子查询延迟（模拟慢提供方）
    pub fn with_child_delay(mut self, delay: Duration) -> Self {
        self.child_delay = Some(delay);
        self
    }

    /// 自定义子查询回答；参数为 "Task: " 之后的任务正文
    pub fn with_child_responder<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        self.responder = Arc::new(f);
        self
    }

    pub fn generation_calls(&self) -> usize {
        self.generation_calls.load(Ordering::SeqCst)
    }

    pub fn child_calls(&self) -> usize {
        self.child_calls.load(Ordering::SeqCst)
    }

    /// 已收到的子查询任务正文（按到达顺序）
    pub fn child_tasks(&self) -> Vec<String> {
        self.child_tasks
            .lock()
            .map(|tasks| tasks.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmProvider for MockLlmClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<ProviderReply, LlmError> {
        let (input_tokens, output_tokens) = self.usage;

        if request.system_prompt.as_deref() == Some(PROGRAM_SYSTEM_PROMPT) {
            self.generation_calls.fetch_add(1, Ordering::SeqCst);
            return Ok(ProviderReply {
                content: self.program.clone(),
                input_tokens,
                output_tokens,
            });
        }

        self.child_calls.fetch_add(1, Ordering::SeqCst);
        let content = request.last_user_content();
        let task = content
            .split_once("Task: ")
            .map(|(_, t)| t)
            .unwrap_or(content)
            .to_string();
        if let Ok(mut tasks) = self.child_tasks.lock() {
            tasks.push(task.clone());
        }

        if let Some(delay) = self.child_delay {
            tokio::time::sleep(delay).await;
        }

        Ok(ProviderReply {
            content: (self.responder)(&task)?,
            input_tokens,
            output_tokens,
        })
    }
}
