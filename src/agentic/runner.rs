//! 工作流入口：准备 scope、写入初始参数、调用根智能体
//!
//! - invoke：返回根智能体的结果
//! - invoke_with_scope：同时返回最终 scope（ResultWithScope）
//! - invoke_with_memory：按 memory id 复用 scope（多轮会话）；配置了持久化时先从磁盘恢复，结束后写回
//!
//! 参数中带 `memoryId` 时等同于 invoke_with_memory。

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::agentic::scope::value_to_text;
use crate::agentic::{Agent, AgentEvent, AgenticScope, ResultWithScope, ScopePersistence, ScopeRegistry};
use crate::core::AgentError;

/// 参数中的 memory id key
pub const MEMORY_ID_ARG: &str = "memoryId";

#[derive(Default)]
pub struct AgenticRunner {
    registry: Arc<ScopeRegistry>,
    persistence: Option<ScopePersistence>,
    events: Option<UnboundedSender<AgentEvent>>,
}

impl AgenticRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(mut self, registry: Arc<ScopeRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_persistence(mut self, persistence: ScopePersistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// 新建的 scope 都挂上这个事件通道
    pub fn with_events(mut self, events: UnboundedSender<AgentEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn registry(&self) -> &Arc<ScopeRegistry> {
        &self.registry
    }

    pub async fn invoke(&self, agent: &Arc<dyn Agent>, args: Map<String, Value>) -> Result<Value, AgentError> {
        self.invoke_with_scope(agent, args).await.map(|r| r.result)
    }

    pub async fn invoke_with_scope(
        &self,
        agent: &Arc<dyn Agent>,
        args: Map<String, Value>,
    ) -> Result<ResultWithScope, AgentError> {
        if let Some(memory_id) = args.get(MEMORY_ID_ARG).map(value_to_text) {
            return self.invoke_with_memory(agent, &memory_id, args).await;
        }
        let scope = Arc::new(self.attach_events(AgenticScope::new()));
        scope.write_all(args);
        self.run_root(agent, scope).await
    }

    pub async fn invoke_with_memory(
        &self,
        agent: &Arc<dyn Agent>,
        memory_id: &str,
        args: Map<String, Value>,
    ) -> Result<ResultWithScope, AgentError> {
        let scope = self
            .registry
            .get_or_insert_with(memory_id, || self.load_or_new(memory_id));
        scope.write_all(args);
        let result = self.run_root(agent, Arc::clone(&scope)).await;

        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.save(&scope) {
                warn!(memory_id, error = %e, "failed to persist scope");
            }
        }
        result
    }

    fn load_or_new(&self, memory_id: &str) -> AgenticScope {
        let loaded = match &self.persistence {
            Some(persistence) => match persistence.load(memory_id) {
                Ok(scope) => scope,
                Err(e) => {
                    warn!(memory_id, error = %e, "failed to load persisted scope, starting fresh");
                    None
                }
            },
            None => None,
        };
        let scope = loaded.unwrap_or_else(|| AgenticScope::new().with_memory_id(memory_id));
        self.attach_events(scope)
    }

    fn attach_events(&self, scope: AgenticScope) -> AgenticScope {
        match &self.events {
            Some(tx) => scope.with_events(tx.clone()),
            None => scope,
        }
    }

    async fn run_root(&self, agent: &Arc<dyn Agent>, scope: Arc<AgenticScope>) -> Result<ResultWithScope, AgentError> {
        let run_id = format!("run_{}", uuid::Uuid::new_v4());
        info!(%run_id, agent = agent.name(), memory_id = ?scope.memory_id(), "workflow start");
        scope.emit(AgentEvent::Started {
            agent: agent.name().to_string(),
            parent: String::new(),
        });
        match agent.invoke(&scope).await {
            Ok(result) => {
                scope.emit(AgentEvent::Completed {
                    agent: agent.name().to_string(),
                    output: result.clone(),
                });
                info!(%run_id, agent = agent.name(), "workflow done");
                Ok(ResultWithScope { result, scope })
            }
            Err(e) => {
                scope.emit(AgentEvent::Failed {
                    agent: agent.name().to_string(),
                    error: e.to_string(),
                });
                warn!(%run_id, agent = agent.name(), error = %e, "workflow failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentic::FunctionAgent;
    use serde_json::json;

    fn counter() -> Arc<dyn Agent> {
        Arc::new(
            FunctionAgent::builder("counter")
                .input_key("count")
                .default_value("count", json!(0))
                .output_key("count")
                .build(|inputs| Ok(inputs.get::<i64>("count")? + 1))
                .unwrap(),
        )
    }

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_fresh_scope_per_invocation() {
        let runner = AgenticRunner::new();
        let agent = counter();
        assert_eq!(runner.invoke(&agent, Map::new()).await.unwrap(), json!(1));
        assert_eq!(runner.invoke(&agent, Map::new()).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_memory_id_reuses_scope() {
        let runner = AgenticRunner::new();
        let agent = counter();
        runner.invoke(&agent, args(json!({"memoryId": "user-1"}))).await.unwrap();
        let second = runner
            .invoke_with_scope(&agent, args(json!({"memoryId": "user-1"})))
            .await
            .unwrap();
        assert_eq!(second.result, json!(2));
        assert_eq!(second.scope.memory_id(), Some("user-1"));
        assert_eq!(runner.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_persisted_scope_survives_new_runner() {
        let dir = tempfile::tempdir().unwrap();
        let agent = counter();

        let first = AgenticRunner::new().with_persistence(ScopePersistence::new(dir.path()));
        first.invoke_with_memory(&agent, "user-7", Map::new()).await.unwrap();

        let second = AgenticRunner::new().with_persistence(ScopePersistence::new(dir.path()));
        let out = second.invoke_with_memory(&agent, "user-7", Map::new()).await.unwrap();
        assert_eq!(out.result, json!(2));
    }

    #[tokio::test]
    async fn test_events_stream() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let runner = AgenticRunner::new().with_events(tx);
        runner.invoke(&counter(), Map::new()).await.unwrap();
        drop(runner);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(match event {
                AgentEvent::Started { .. } => "started",
                AgentEvent::Completed { .. } => "completed",
                _ => "other",
            });
        }
        assert_eq!(kinds, vec!["started", "completed"]);
    }
}
