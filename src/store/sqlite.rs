//! SQLite 存储（sqlx）
//!
//! 时间以 RFC3339 文本保存；记忆值与节点字段按 JSON / 文本保存。save_trace 在单个事务内写入。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use super::{
    flatten_trace, ExecutionRecord, ExecutionStatus, ExecutionStore, NodeKind, NodeRecord,
    SessionRecord, StoreError,
};
use crate::engine::ExecutionTrace;
use crate::memory::Memory;

pub struct SqliteStore {
    pool: SqlitePool,
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl SqliteStore {
    /// 连接数据库（如 `sqlite:rlm.db?mode=rwc`、`sqlite::memory:`）并建表
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                name TEXT,
                context TEXT,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS session_memory (
                session_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (session_id, key)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                session_id TEXT,
                root_node_id TEXT NOT NULL,
                user_query TEXT NOT NULL,
                context_size INTEGER NOT NULL,
                context_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                final_result TEXT,
                error_message TEXT,
                total_input_tokens INTEGER NOT NULL,
                total_output_tokens INTEGER NOT NULL,
                total_cost_usd REAL NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS execution_nodes (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                parent_node_id TEXT,
                kind TEXT NOT NULL,
                depth INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                prompt TEXT,
                generated_code TEXT,
                output TEXT,
                error_message TEXT,
                model TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                cost_usd REAL NOT NULL,
                status TEXT NOT NULL,
                FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_execution_nodes_execution ON execution_nodes(execution_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_execution(row: &SqliteRow) -> ExecutionRecord {
        let started_at: String = row.get("started_at");
        let completed_at: Option<String> = row.get("completed_at");
        let status: String = row.get("status");
        ExecutionRecord {
            id: row.get("id"),
            session_id: row.get("session_id"),
            root_node_id: row.get("root_node_id"),
            user_query: row.get("user_query"),
            context_size: row.get::<i64, _>("context_size") as usize,
            context_hash: row.get("context_hash"),
            status: ExecutionStatus::parse(&status),
            final_result: row.get("final_result"),
            error_message: row.get("error_message"),
            total_input_tokens: row.get::<i64, _>("total_input_tokens") as u64,
            total_output_tokens: row.get::<i64, _>("total_output_tokens") as u64,
            total_cost_usd: row.get("total_cost_usd"),
            started_at: parse_time(&started_at),
            completed_at: completed_at.as_deref().map(parse_time),
        }
    }

    fn row_to_node(row: &SqliteRow) -> NodeRecord {
        let kind: String = row.get("kind");
        let status: String = row.get("status");
        NodeRecord {
            id: row.get("id"),
            execution_id: row.get("execution_id"),
            parent_node_id: row.get("parent_node_id"),
            kind: NodeKind::parse(&kind),
            depth: row.get::<i64, _>("depth") as u32,
            sequence: row.get::<i64, _>("sequence") as u32,
            prompt: row.get("prompt"),
            generated_code: row.get("generated_code"),
            output: row.get("output"),
            error_message: row.get("error_message"),
            model: row.get("model"),
            input_tokens: row.get::<i64, _>("input_tokens") as u64,
            output_tokens: row.get::<i64, _>("output_tokens") as u64,
            cost_usd: row.get("cost_usd"),
            status: ExecutionStatus::parse(&status),
        }
    }
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn create_session(
        &self,
        name: Option<String>,
        context: Option<String>,
    ) -> Result<SessionRecord, StoreError> {
        let session = SessionRecord::new(name, context);
        sqlx::query("INSERT INTO sessions (id, name, context, created_at) VALUES (?, ?, ?, ?)")
            .bind(&session.id)
            .bind(&session.name)
            .bind(&session.context)
            .bind(session.created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query("SELECT id, name, context, created_at FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| {
            let created_at: String = row.get("created_at");
            SessionRecord {
                id: row.get("id"),
                name: row.get("name"),
                context: row.get("context"),
                created_at: parse_time(&created_at),
            }
        }))
    }

    async fn get_memory(&self, session_id: &str) -> Result<Memory, StoreError> {
        let rows = sqlx::query("SELECT key, value FROM session_memory WHERE session_id = ?")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        let mut memory = Memory::new();
        for row in rows {
            let key: String = row.get("key");
            let value: String = row.get("value");
            memory.insert(key, serde_json::from_str(&value)?);
        }
        Ok(memory)
    }

    async fn set_memory(
        &self,
        session_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO session_memory (session_id, key, value, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(session_id, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(session_id)
        .bind(key)
        .bind(serde_json::to_string(&value)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_memory(&self, session_id: &str, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM session_memory WHERE session_id = ? AND key = ?")
            .bind(session_id)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_trace(
        &self,
        session_id: Option<&str>,
        trace: &ExecutionTrace,
    ) -> Result<ExecutionRecord, StoreError> {
        let (record, nodes) = flatten_trace(trace, session_id);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT OR REPLACE INTO executions (
                id, session_id, root_node_id, user_query, context_size, context_hash, status,
                final_result, error_message, total_input_tokens, total_output_tokens,
                total_cost_usd, started_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.session_id)
        .bind(&record.root_node_id)
        .bind(&record.user_query)
        .bind(record.context_size as i64)
        .bind(&record.context_hash)
        .bind(record.status.as_str())
        .bind(&record.final_result)
        .bind(&record.error_message)
        .bind(record.total_input_tokens as i64)
        .bind(record.total_output_tokens as i64)
        .bind(record.total_cost_usd)
        .bind(record.started_at.to_rfc3339())
        .bind(record.completed_at.map(|t| t.to_rfc3339()))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM execution_nodes WHERE execution_id = ?")
            .bind(&record.id)
            .execute(&mut *tx)
            .await?;

        for node in &nodes {
            sqlx::query(
                "INSERT INTO execution_nodes (
                    id, execution_id, parent_node_id, kind, depth, sequence, prompt,
                    generated_code, output, error_message, model, input_tokens,
                    output_tokens, cost_usd, status
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&node.id)
            .bind(&node.execution_id)
            .bind(&node.parent_node_id)
            .bind(node.kind.as_str())
            .bind(node.depth as i64)
            .bind(node.sequence as i64)
            .bind(&node.prompt)
            .bind(&node.generated_code)
            .bind(&node.output)
            .bind(&node.error_message)
            .bind(&node.model)
            .bind(node.input_tokens as i64)
            .bind(node.output_tokens as i64)
            .bind(node.cost_usd)
            .bind(node.status.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::debug!(execution_id = %record.id, nodes = nodes.len(), "trace saved");
        Ok(record)
    }

    async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Self::row_to_execution))
    }

    async fn list_nodes(&self, execution_id: &str) -> Result<Vec<NodeRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM execution_nodes WHERE execution_id = ? ORDER BY depth, sequence",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::row_to_node).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::build_tree;
    use crate::store::tests::sample_trace;
    use serde_json::json;

    async fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("rlm.db").display());
        let store = SqliteStore::connect(&url).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_sqlite_memory_roundtrip() {
        let (_dir, store) = temp_store().await;
        let session = store
            .create_session(None, Some("stored document".into()))
            .await
            .unwrap();
        let loaded = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.context.as_deref(), Some("stored document"));

        store.set_memory(&session.id, "facts", json!(["a"])).await.unwrap();
        store.set_memory(&session.id, "facts", json!(["a", "b"])).await.unwrap();
        let memory = store.get_memory(&session.id).await.unwrap();
        assert_eq!(memory["facts"], json!(["a", "b"]));
        assert!(store.delete_memory(&session.id, "facts").await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_save_trace() {
        let (_dir, store) = temp_store().await;
        let trace = sample_trace();
        store.save_trace(None, &trace).await.unwrap();
        // 重复保存同一执行不产生重复节点
        store.save_trace(None, &trace).await.unwrap();

        let record = store.get_execution("exec-1").await.unwrap().unwrap();
        assert!((record.total_cost_usd - trace.total_cost_usd).abs() < 1e-9);

        let nodes = store.list_nodes("exec-1").await.unwrap();
        assert_eq!(nodes.len(), 5);
        let tree = build_tree(nodes).unwrap();
        assert_eq!(tree.children[1].children.len(), 1);
    }
}
