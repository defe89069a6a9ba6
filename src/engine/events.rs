//! 执行过程事件：供流式 / SSE 展示生成、执行、子调用与结束
//!
//! 顺序：execution_start → generating_code → code_generated → executing_code
//! → 0..N child_complete → execution_complete | execution_error。
//! 递归子 Agent 共享同一通道，其事件带 depth > 0；只有 depth 0 的结束事件才是终止事件。

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use serde::Serialize;
use tokio::sync::mpsc;

/// 单个过程事件（序列化为 {"type": ..., "data": {...}}）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AgentEvent {
    ExecutionStart {
        execution_id: String,
        root_node_id: String,
        depth: u32,
        user_query: String,
        context_size: usize,
    },
    GeneratingCode {
        depth: u32,
        context_size: usize,
        context_hash: String,
    },
    CodeGenerated {
        depth: u32,
        code: String,
        tokens: u64,
        cost: f64,
    },
    ExecutingCode { depth: u32 },
    /// 一次委派结束；recursive 为 true 表示由子 Agent 回答
    ChildComplete {
        depth: u32,
        sequence: u32,
        recursive: bool,
        prompt_preview: String,
        response_preview: String,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
        model: String,
    },
    ExecutionComplete {
        depth: u32,
        execution_id: String,
        success: bool,
        final_result: Option<String>,
        error: Option<String>,
        total_cost: f64,
    },
    ExecutionError {
        depth: u32,
        execution_id: String,
        error: String,
    },
    /// 空闲心跳，无语义
    Heartbeat,
}

impl AgentEvent {
    pub fn depth(&self) -> Option<u32> {
        match self {
            AgentEvent::ExecutionStart { depth, .. }
            | AgentEvent::GeneratingCode { depth, .. }
            | AgentEvent::CodeGenerated { depth, .. }
            | AgentEvent::ExecutingCode { depth }
            | AgentEvent::ChildComplete { depth, .. }
            | AgentEvent::ExecutionComplete { depth, .. }
            | AgentEvent::ExecutionError { depth, .. } => Some(*depth),
            AgentEvent::Heartbeat => None,
        }
    }

    /// 根级 complete / error
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentEvent::ExecutionComplete { depth: 0, .. } | AgentEvent::ExecutionError { depth: 0, .. }
        )
    }

    pub fn to_sse(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("data: {}\n\n", json)
    }
}

/// 通知回调：同步调用，可能来自不同线程，不得长时间阻塞
pub type Notifier = Arc<dyn Fn(AgentEvent) + Send + Sync>;

/// 把事件送入无界通道（接收端关闭后静默丢弃）
pub fn channel_notifier(tx: mpsc::UnboundedSender<AgentEvent>) -> Notifier {
    Arc::new(move |event| {
        let _ = tx.send(event);
    })
}

/// 通道 → 事件流：空闲 `heartbeat` 时插入心跳，根级终止事件之后结束
pub fn event_stream(
    rx: mpsc::UnboundedReceiver<AgentEvent>,
    heartbeat: Duration,
) -> impl Stream<Item = AgentEvent> {
    stream::unfold((rx, false), move |(mut rx, done)| async move {
        if done {
            return None;
        }
        match tokio::time::timeout(heartbeat, rx.recv()).await {
            Ok(Some(event)) => {
                let terminal = event.is_terminal();
                Some((event, (rx, terminal)))
            }
            Ok(None) => None,
            Err(_) => Some((AgentEvent::Heartbeat, (rx, false))),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn complete(depth: u32) -> AgentEvent {
        AgentEvent::ExecutionComplete {
            depth,
            execution_id: "e".into(),
            success: true,
            final_result: Some("ok".into()),
            error: None,
            total_cost: 0.0,
        }
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(AgentEvent::ExecutingCode { depth: 0 }).unwrap();
        assert_eq!(json["type"], "executing_code");
        assert_eq!(json["data"]["depth"], 0);

        let sse = AgentEvent::Heartbeat.to_sse();
        assert_eq!(sse, "data: {\"type\":\"heartbeat\"}\n\n");
    }

    #[test]
    fn test_only_root_completion_is_terminal() {
        assert!(complete(0).is_terminal());
        assert!(!complete(1).is_terminal());
        assert!(!AgentEvent::Heartbeat.is_terminal());
    }

    #[tokio::test]
    async fn test_stream_ends_after_root_terminal() {
        let (tx, rx) = mpsc::unbounded_channel();
        let notify = channel_notifier(tx);
        notify(AgentEvent::ExecutingCode { depth: 0 });
        notify(complete(1));
        notify(complete(0));
        notify(AgentEvent::ExecutingCode { depth: 0 });

        let events: Vec<_> = event_stream(rx, Duration::from_secs(5)).collect().await;
        assert_eq!(events.len(), 3);
        assert!(events[2].is_terminal());
    }

    #[tokio::test]
    async fn test_stream_emits_heartbeat_when_idle() {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = event_stream(rx, Duration::from_millis(20));
        tokio::pin!(stream);

        let first = stream.next().await.unwrap();
        assert!(matches!(first, AgentEvent::Heartbeat));

        tx.send(complete(0)).unwrap();
        let mut saw_terminal = false;
        while let Some(event) = stream.next().await {
            if event.is_terminal() {
                saw_terminal = true;
            }
        }
        assert!(saw_terminal);
    }
}
