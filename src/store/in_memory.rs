//! 内存存储（测试与无数据库时的默认实现）

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{flatten_trace, ExecutionRecord, ExecutionStore, NodeRecord, SessionRecord, StoreError};
use crate::engine::ExecutionTrace;
use crate::memory::{apply_changes, Memory};

#[derive(Default)]
pub struct InMemoryStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    memory: RwLock<HashMap<String, Memory>>,
    executions: RwLock<HashMap<String, ExecutionRecord>>,
    nodes: RwLock<HashMap<String, Vec<NodeRecord>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn create_session(
        &self,
        name: Option<String>,
        context: Option<String>,
    ) -> Result<SessionRecord, StoreError> {
        let session = SessionRecord::new(name, context);
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn get_memory(&self, session_id: &str) -> Result<Memory, StoreError> {
        Ok(self
            .memory
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_memory(
        &self,
        session_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.memory
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete_memory(&self, session_id: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .memory
            .write()
            .await
            .get_mut(session_id)
            .map(|m| m.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn merge_memory(&self, session_id: &str, changes: &Memory) -> Result<(), StoreError> {
        let mut memory = self.memory.write().await;
        apply_changes(memory.entry(session_id.to_string()).or_default(), changes);
        Ok(())
    }

    async fn save_trace(
        &self,
        session_id: Option<&str>,
        trace: &ExecutionTrace,
    ) -> Result<ExecutionRecord, StoreError> {
        let (record, nodes) = flatten_trace(trace, session_id);
        self.nodes.write().await.insert(record.id.clone(), nodes);
        self.executions
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(self.executions.read().await.get(id).cloned())
    }

    async fn list_nodes(&self, execution_id: &str) -> Result<Vec<NodeRecord>, StoreError> {
        let mut nodes = self
            .nodes
            .read()
            .await
            .get(execution_id)
            .cloned()
            .unwrap_or_default();
        nodes.sort_by_key(|n| (n.depth, n.sequence));
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::build_tree;
    use crate::store::tests::sample_trace;
    use serde_json::json;

    #[tokio::test]
    async fn test_session_memory_last_write_wins() {
        let store = InMemoryStore::new();
        let session = store.create_session(Some("s".into()), None).await.unwrap();
        assert!(store.get_session(&session.id).await.unwrap().is_some());
        assert!(store.get_session("missing").await.unwrap().is_none());

        store.set_memory(&session.id, "k", json!(1)).await.unwrap();
        store.set_memory(&session.id, "k", json!(2)).await.unwrap();
        assert_eq!(store.get_memory(&session.id).await.unwrap()["k"], json!(2));

        assert!(store.delete_memory(&session.id, "k").await.unwrap());
        assert!(!store.delete_memory(&session.id, "k").await.unwrap());
        assert!(store.get_memory(&session.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_memory_overwrites_and_keeps_others() {
        let store = InMemoryStore::new();
        store.set_memory("s", "a", json!(1)).await.unwrap();
        store.set_memory("s", "b", json!("keep")).await.unwrap();

        let mut changes = Memory::new();
        changes.insert("a".into(), json!(2));
        changes.insert("c".into(), json!([1, 2]));
        store.merge_memory("s", &changes).await.unwrap();

        let memory = store.get_memory("s").await.unwrap();
        assert_eq!(memory.len(), 3);
        assert_eq!(memory["a"], json!(2));
        assert_eq!(memory["b"], json!("keep"));
        assert_eq!(memory["c"], json!([1, 2]));
    }

    #[tokio::test]
    async fn test_save_trace_and_rebuild_tree() {
        let store = InMemoryStore::new();
        let trace = sample_trace();
        let record = store.save_trace(Some("s-1"), &trace).await.unwrap();
        assert_eq!(record.session_id.as_deref(), Some("s-1"));
        assert!(store.get_execution("exec-1").await.unwrap().is_some());

        let nodes = store.list_nodes("exec-1").await.unwrap();
        assert_eq!(nodes.len(), 5);
        assert_eq!(nodes[0].depth, 0);
        let tree = build_tree(nodes).unwrap();
        assert_eq!(tree.children.len(), 3);
    }
}
