//! 执行服务：输入校验 → 加载会话记忆 → 运行 Agent → 保存轨迹 → 合并记忆变更
//!
//! 输入错误与基础设施错误以 Err 返回；沙箱内的失败只出现在轨迹的 ExecutionResult 中。

use std::sync::Arc;

use serde::Serialize;

use crate::core::AgentError;
use crate::engine::{Agent, AgentConfig, ExecutionTrace, Notifier};
use crate::llm::ModelClient;
use crate::store::{ExecutionRecord, ExecutionStore};

/// 一次执行请求
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub query: String,
    pub context: Option<String>,
    pub session_id: Option<String>,
    /// 覆盖默认模型
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub record: ExecutionRecord,
    pub trace: ExecutionTrace,
}

pub struct ExecutionService {
    client: ModelClient,
    store: Arc<dyn ExecutionStore>,
    config: AgentConfig,
    max_context_size: usize,
}

impl ExecutionService {
    pub fn new(
        client: ModelClient,
        store: Arc<dyn ExecutionStore>,
        config: AgentConfig,
        max_context_size: usize,
    ) -> Self {
        Self {
            client,
            store,
            config,
            max_context_size,
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub async fn execute(
        &self,
        request: ExecutionRequest,
        notifier: Option<Notifier>,
    ) -> Result<ExecutionOutcome, AgentError> {
        let session = match &request.session_id {
            Some(id) => Some(
                self.store
                    .get_session(id)
                    .await?
                    .ok_or_else(|| AgentError::SessionNotFound(id.clone()))?,
            ),
            None => None,
        };

        let context = session
            .as_ref()
            .and_then(|s| s.context.clone())
            .or(request.context)
            .ok_or(AgentError::MissingContext)?;

        let size = context.chars().count();
        if size > self.max_context_size {
            return Err(AgentError::ContextTooLarge {
                size,
                limit: self.max_context_size,
            });
        }

        let memory = match &session {
            Some(s) => self.store.get_memory(&s.id).await?,
            None => Default::default(),
        };

        let mut config = self.config.clone();
        if let Some(model) = request.model {
            config.model = model;
        }
        config.validate()?;

        let mut agent = Agent::new(self.client.clone(), config);
        if let Some(notifier) = notifier {
            agent = agent.with_notifier(notifier);
        }

        tracing::info!(
            session_id = ?request.session_id,
            context_size = size,
            memory_keys = memory.len(),
            "execute"
        );
        let trace = agent.run(&request.query, &context, memory, None).await;

        let session_id = session.as_ref().map(|s| s.id.as_str());
        let record = self.store.save_trace(session_id, &trace).await?;

        if let (Some(id), Some(result)) = (session_id, trace.execution_result.as_ref()) {
            if !result.memory_changes.is_empty() {
                self.store.merge_memory(id, &result.memory_changes).await?;
            }
        }

        Ok(ExecutionOutcome { record, trace })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn service(program: &str, max_context_size: usize) -> (ExecutionService, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let client = ModelClient::single(Arc::new(MockLlmClient::new(program)));
        let config = AgentConfig {
            model: "gpt-4o-mini".into(),
            ..Default::default()
        };
        (
            ExecutionService::new(client, store.clone(), config, max_context_size),
            store,
        )
    }

    #[tokio::test]
    async fn test_input_errors() {
        let (svc, _) = service("complete(1);", 10);

        let err = svc
            .execute(ExecutionRequest { query: "q".into(), ..Default::default() }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::MissingContext));

        let err = svc
            .execute(
                ExecutionRequest {
                    query: "q".into(),
                    session_id: Some("nope".into()),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::SessionNotFound(_)));

        let err = svc
            .execute(
                ExecutionRequest {
                    query: "q".into(),
                    context: Some("x".repeat(11)),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ContextTooLarge { size: 11, limit: 10 }));
        assert!(err.is_input_error());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_session_context_and_memory_reconciled() {
        let (svc, store) = service(
            r#"let n = memory_get("runs", 0); memory_set("runs", n + 1); complete(context);"#,
            1_000,
        );
        let session = store
            .create_session(None, Some("session document".into()))
            .await
            .unwrap();
        store.set_memory(&session.id, "keep", json!("me")).await.unwrap();

        for _ in 0..2 {
            let outcome = svc
                .execute(
                    ExecutionRequest {
                        query: "q".into(),
                        context: Some("ignored".into()),
                        session_id: Some(session.id.clone()),
                        ..Default::default()
                    },
                    None,
                )
                .await
                .unwrap();
            assert!(outcome.trace.succeeded());
            assert_eq!(outcome.record.final_result.as_deref(), Some("session document"));
            assert_eq!(outcome.record.session_id.as_deref(), Some(session.id.as_str()));
        }

        let memory = store.get_memory(&session.id).await.unwrap();
        assert_eq!(memory["runs"], json!(2));
        assert_eq!(memory["keep"], json!("me"));
    }
}
