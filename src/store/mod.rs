//! 持久化：会话、会话记忆、执行记录与执行节点
//!
//! 运行结束后才写入：一条 ExecutionRecord + 一个根节点 + 每个子条目一个节点（递归展开）。
//! 所有节点 cost 之和等于执行的 total_cost_usd。
//!
//! - [`InMemoryStore`]：tokio RwLock，总是可用
//! - `SqliteStore`：sqlx，需要 `async-sqlite` feature

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::engine::{ChildEntry, ExecutionTrace};
use crate::memory::Memory;

mod in_memory;
#[cfg(feature = "async-sqlite")]
mod sqlite;

pub use in_memory::InMemoryStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// 会话：可携带一份文档，执行时优先使用
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub name: Option<String>,
    pub context: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(name: Option<String>, context: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            context,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "completed" {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        }
    }

    fn from_success(success: bool) -> Self {
        if success {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// 根调用
    Root,
    /// 递归子 Agent
    Recursive,
    /// 直接模型调用
    Direct,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Root => "root",
            NodeKind::Recursive => "recursive",
            NodeKind::Direct => "direct",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "root" => NodeKind::Root,
            "recursive" => NodeKind::Recursive,
            _ => NodeKind::Direct,
        }
    }
}

/// 一次执行的汇总
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub session_id: Option<String>,
    pub root_node_id: String,
    pub user_query: String,
    pub context_size: usize,
    pub context_hash: String,
    pub status: ExecutionStatus,
    pub final_result: Option<String>,
    pub error_message: Option<String>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// 调用树中的一个节点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub execution_id: String,
    pub parent_node_id: Option<String>,
    pub kind: NodeKind,
    pub depth: u32,
    pub sequence: u32,
    pub prompt: Option<String>,
    pub generated_code: Option<String>,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub status: ExecutionStatus,
}

/// 重建后的调用树
#[derive(Debug, Clone, Serialize)]
pub struct NodeTree {
    #[serde(flatten)]
    pub node: NodeRecord,
    pub children: Vec<NodeTree>,
}

/// 把一条已结束的轨迹展开为执行记录 + 节点列表
pub fn flatten_trace(trace: &ExecutionTrace, session_id: Option<&str>) -> (ExecutionRecord, Vec<NodeRecord>) {
    let result = trace.execution_result.as_ref();
    let record = ExecutionRecord {
        id: trace.execution_id.clone(),
        session_id: session_id.map(String::from),
        root_node_id: trace.root_node_id.clone(),
        user_query: trace.user_query.clone(),
        context_size: trace.context_size,
        context_hash: trace.context_hash.clone(),
        status: ExecutionStatus::from_success(trace.succeeded()),
        final_result: result.and_then(|r| r.final_result.clone()),
        error_message: result.and_then(|r| r.error.clone()),
        total_input_tokens: trace.total_input_tokens,
        total_output_tokens: trace.total_output_tokens,
        total_cost_usd: trace.total_cost_usd,
        started_at: trace.started_at,
        completed_at: trace.completed_at,
    };

    let mut nodes = Vec::new();
    push_trace_nodes(trace, &trace.execution_id, None, NodeKind::Root, 0, None, &mut nodes);
    (record, nodes)
}

fn push_trace_nodes(
    trace: &ExecutionTrace,
    execution_id: &str,
    parent: Option<&str>,
    kind: NodeKind,
    sequence: u32,
    prompt: Option<String>,
    out: &mut Vec<NodeRecord>,
) {
    let result = trace.execution_result.as_ref();
    out.push(NodeRecord {
        id: trace.root_node_id.clone(),
        execution_id: execution_id.to_string(),
        parent_node_id: parent.map(String::from),
        kind,
        depth: trace.depth,
        sequence,
        prompt,
        generated_code: Some(trace.generated_code.clone()),
        output: result.and_then(|r| r.final_result.clone()),
        error_message: result.and_then(|r| r.error.clone()),
        model: trace.model.clone(),
        input_tokens: trace.generation.input_tokens,
        output_tokens: trace.generation.output_tokens,
        cost_usd: trace.generation.cost_usd,
        status: ExecutionStatus::from_success(trace.succeeded()),
    });

    for entry in &trace.child_traces {
        match entry {
            ChildEntry::Direct(summary) => out.push(NodeRecord {
                id: Uuid::new_v4().to_string(),
                execution_id: execution_id.to_string(),
                parent_node_id: Some(trace.root_node_id.clone()),
                kind: NodeKind::Direct,
                depth: summary.depth,
                sequence: summary.sequence,
                prompt: Some(summary.prompt_preview.clone()),
                generated_code: None,
                output: Some(summary.response_preview.clone()),
                error_message: None,
                model: summary.model.clone(),
                input_tokens: summary.input_tokens,
                output_tokens: summary.output_tokens,
                cost_usd: summary.cost_usd,
                status: ExecutionStatus::Completed,
            }),
            ChildEntry::Recursive { sequence, trace: child, .. } => push_trace_nodes(
                child,
                execution_id,
                Some(&trace.root_node_id),
                NodeKind::Recursive,
                *sequence,
                Some(child.user_query.clone()),
                out,
            ),
        }
    }
}

/// 由节点列表重建调用树（同层按 depth、sequence 排序）；无根节点时返回 None
pub fn build_tree(mut nodes: Vec<NodeRecord>) -> Option<NodeTree> {
    nodes.sort_by_key(|n| (n.depth, n.sequence));

    let mut roots = Vec::new();
    let mut by_parent: HashMap<String, Vec<NodeRecord>> = HashMap::new();
    for node in nodes {
        match node.parent_node_id.clone() {
            Some(parent) => by_parent.entry(parent).or_default().push(node),
            None => roots.push(node),
        }
    }

    let root = roots.into_iter().next()?;
    Some(assemble(root, &mut by_parent))
}

fn assemble(node: NodeRecord, by_parent: &mut HashMap<String, Vec<NodeRecord>>) -> NodeTree {
    let children = by_parent
        .remove(&node.id)
        .unwrap_or_default()
        .into_iter()
        .map(|child| assemble(child, by_parent))
        .collect();
    NodeTree { node, children }
}

/// 执行存储
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_session(
        &self,
        name: Option<String>,
        context: Option<String>,
    ) -> Result<SessionRecord, StoreError>;

    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, StoreError>;

    async fn get_memory(&self, session_id: &str) -> Result<Memory, StoreError>;

    /// 后写覆盖
    async fn set_memory(
        &self,
        session_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// 返回键是否存在
    async fn delete_memory(&self, session_id: &str, key: &str) -> Result<bool, StoreError>;

    /// 合并一次运行的 memory_changes（逐键后写覆盖）
    async fn merge_memory(&self, session_id: &str, changes: &Memory) -> Result<(), StoreError> {
        for (key, value) in changes {
            self.set_memory(session_id, key, value.clone()).await?;
        }
        Ok(())
    }

    async fn save_trace(
        &self,
        session_id: Option<&str>,
        trace: &ExecutionTrace,
    ) -> Result<ExecutionRecord, StoreError>;

    async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError>;

    /// 按 depth、sequence 排序
    async fn list_nodes(&self, execution_id: &str) -> Result<Vec<NodeRecord>, StoreError>;
}
