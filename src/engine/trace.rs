//! 执行轨迹：一次 Agent 调用的完整记录
//!
//! 每层调用独占自己的 ExecutionTrace；子 Agent 结束后由父级显式 `fold_child` 折叠进来，
//! token / 费用在折叠时累加，因此总计与子调用顺序无关。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::llm::ModelReply;
use crate::memory::Memory;

/// ExecutionResult.child_calls 中 prompt / result 的预览长度
pub const CHILD_CALL_PREVIEW: usize = 1000;
/// 轨迹中直接子调用摘要的预览长度
pub const CHILD_SUMMARY_PREVIEW: usize = 500;
/// 文档元信息中的前缀预览长度
pub const CONTEXT_PREVIEW: usize = 200;

/// 按字符截断，超出部分以 "..." 结尾
pub fn preview(text: &str, limit: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(limit).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

/// 文档元信息（生成程序时只看到这些，看不到正文）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextInfo {
    /// 字符数
    pub size: usize,
    /// SHA-256 十六进制摘要，仅用于识别 / 去重
    pub hash: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub preview: String,
}

impl ContextInfo {
    pub fn from_document(document: &str) -> Self {
        Self {
            size: document.chars().count(),
            hash: hex::encode(Sha256::digest(document.as_bytes())),
            kind: "text".to_string(),
            preview: preview(document, CONTEXT_PREVIEW),
        }
    }
}

/// 一次模型调用的用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl From<&ModelReply> for Usage {
    fn from(reply: &ModelReply) -> Self {
        Self {
            input_tokens: reply.input_tokens,
            output_tokens: reply.output_tokens,
            cost_usd: reply.cost_usd,
        }
    }
}

/// 程序发起的一次委派（沙箱视角）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildCall {
    pub prompt: String,
    pub result: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub execution_time_ms: f64,
}

/// 一次沙箱运行的结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub final_result: Option<String>,
    pub error: Option<String>,
    pub output_log: Vec<String>,
    pub child_calls: Vec<ChildCall>,
    pub execution_time_ms: f64,
    /// 本次运行中 memory_set 写过的键（不是整份记忆）
    pub memory_changes: Memory,
}

impl ExecutionResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// 直接模型调用回答的委派（轨迹视角）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildSummary {
    pub sequence: u32,
    pub depth: u32,
    pub prompt_preview: String,
    pub response_preview: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub model: String,
    pub execution_time_ms: f64,
}

/// childTraces 中的一项：直接调用摘要，或完整的子轨迹
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChildEntry {
    Direct(ChildSummary),
    Recursive {
        sequence: u32,
        depth: u32,
        trace: Box<ExecutionTrace>,
    },
}

impl ChildEntry {
    pub fn sequence(&self) -> u32 {
        match self {
            ChildEntry::Direct(s) => s.sequence,
            ChildEntry::Recursive { sequence, .. } => *sequence,
        }
    }

    pub fn depth(&self) -> u32 {
        match self {
            ChildEntry::Direct(s) => s.depth,
            ChildEntry::Recursive { depth, .. } => *depth,
        }
    }

    /// 该项的总用量；子轨迹取其（已含孙级的）总计
    pub fn usage(&self) -> Usage {
        match self {
            ChildEntry::Direct(s) => Usage {
                input_tokens: s.input_tokens,
                output_tokens: s.output_tokens,
                cost_usd: s.cost_usd,
            },
            ChildEntry::Recursive { trace, .. } => trace.totals(),
        }
    }
}

/// 一次 Agent 调用的轨迹
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub execution_id: String,
    pub root_node_id: String,
    pub depth: u32,
    pub model: String,
    pub user_query: String,
    pub context_size: usize,
    pub context_hash: String,
    pub generated_code: String,
    /// 生成程序那一次调用的用量
    pub generation: Usage,
    pub execution_result: Option<ExecutionResult>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
    pub child_traces: Vec<ChildEntry>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionTrace {
    /// 开始一条新轨迹；execution_id 未提供时生成 uuid
    pub fn begin(
        execution_id: Option<String>,
        query: &str,
        info: &ContextInfo,
        depth: u32,
        model: &str,
    ) -> Self {
        Self {
            execution_id: execution_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            root_node_id: Uuid::new_v4().to_string(),
            depth,
            model: model.to_string(),
            user_query: query.to_string(),
            context_size: info.size,
            context_hash: info.hash.clone(),
            generated_code: String::new(),
            generation: Usage::default(),
            execution_result: None,
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_cost_usd: 0.0,
            child_traces: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    fn add(&mut self, usage: Usage) {
        self.total_input_tokens += usage.input_tokens;
        self.total_output_tokens += usage.output_tokens;
        self.total_cost_usd += usage.cost_usd;
    }

    pub fn record_generation(&mut self, code: String, usage: Usage) {
        self.generated_code = code;
        self.generation = usage;
        self.add(usage);
    }

    pub fn fold_child(&mut self, entry: ChildEntry) {
        self.add(entry.usage());
        self.child_traces.push(entry);
    }

    /// 附上运行结果并封存；之后不再修改
    pub fn finish(&mut self, result: ExecutionResult) {
        self.execution_result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    pub fn totals(&self) -> Usage {
        Usage {
            input_tokens: self.total_input_tokens,
            output_tokens: self.total_output_tokens,
            cost_usd: self.total_cost_usd,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.execution_result.as_ref().is_some_and(|r| r.success)
    }

    /// 作为委派回答返回给父级程序的文本；失败时以 "Error: " 开头
    pub fn answer(&self) -> String {
        match &self.execution_result {
            Some(r) if r.success => r.final_result.clone().unwrap_or_default(),
            Some(r) => format!("Error: {}", r.error.as_deref().unwrap_or("Unknown")),
            None => "Error: Unknown".to_string(),
        }
    }
}
