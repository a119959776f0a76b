//! 并行组合：所有子智能体针对同一个 scope 并发执行，全部完成后再计算返回值
//!
//! 子智能体必须写不同的 key（由调用方保证）。任一子智能体失败立即中止其余子任务并返回该错误。
//! 未指定工作池时按调用创建一个，调用结束（无论成败）即关闭；调用方传入的工作池保持运行。

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tracing::{info, warn};

use crate::agentic::agent::{record_composite, run_child, union_input_keys};
use crate::agentic::projection::project_result;
use crate::agentic::{Agent, AgenticScope, OutputProjection};
use crate::config::WorkflowSection;
use crate::core::{AgentError, WorkerPool};

pub struct ParallelAgent {
    name: String,
    description: String,
    children: Vec<Arc<dyn Agent>>,
    input_keys: Vec<String>,
    output_key: Option<String>,
    projection: Option<OutputProjection>,
    executor: Option<Arc<WorkerPool>>,
    max_workers: usize,
}

impl ParallelAgent {
    pub fn builder(name: impl Into<String>) -> ParallelAgentBuilder {
        ParallelAgentBuilder {
            name: name.into(),
            description: String::new(),
            children: Vec::new(),
            output_key: None,
            projection: None,
            executor: None,
            max_workers: 0,
        }
    }

    async fn run_all(&self, pool: &WorkerPool, scope: &Arc<AgenticScope>) -> Result<(), AgentError> {
        let mut running = FuturesUnordered::new();
        let mut aborts = Vec::with_capacity(self.children.len());

        for child in &self.children {
            let parent = self.name.clone();
            let task_child = Arc::clone(child);
            let task_scope = Arc::clone(scope);
            let task = async move { run_child(&parent, &task_child, &task_scope).await };
            let submitted = if child.is_composite() {
                pool.submit_unbounded(task)
            } else {
                pool.submit(task)
            };
            let handle = match submitted {
                Ok(handle) => handle,
                Err(e) => {
                    aborts.iter().for_each(tokio::task::AbortHandle::abort);
                    return Err(e);
                }
            };
            aborts.push(handle.abort_handle());
            let child_name = child.name().to_string();
            running.push(async move { (child_name, handle.await) });
        }

        while let Some((child, joined)) = running.next().await {
            let result = joined
                .map_err(|e| AgentError::Join(e.to_string()).in_child(&self.name, &child))
                .and_then(|r| r);
            if let Err(e) = result {
                warn!(agent = %self.name, child = %child, error = %e, "parallel child failed, aborting siblings");
                aborts.iter().for_each(tokio::task::AbortHandle::abort);
                return Err(e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for ParallelAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_keys(&self) -> Vec<String> {
        self.input_keys.clone()
    }

    fn output_key(&self) -> Option<&str> {
        self.output_key.as_deref()
    }

    fn is_composite(&self) -> bool {
        true
    }

    async fn invoke(&self, scope: &Arc<AgenticScope>) -> Result<Value, AgentError> {
        let (pool, owned) = match &self.executor {
            Some(pool) => (Arc::clone(pool), false),
            None => {
                let workers = if self.max_workers == 0 {
                    self.children.len()
                } else {
                    self.max_workers
                };
                (Arc::new(WorkerPool::new(format!("{}-pool", self.name), workers)), true)
            }
        };
        info!(agent = %self.name, children = self.children.len(), workers = pool.max_workers(), "parallel start");

        let result = self.run_all(&pool, scope).await;
        if owned {
            pool.shutdown();
        }
        result?;

        let output = project_result(scope, self.output_key.as_deref(), self.projection.as_ref())?;
        record_composite(scope, &self.name, &output);
        Ok(output)
    }
}

pub struct ParallelAgentBuilder {
    name: String,
    description: String,
    children: Vec<Arc<dyn Agent>>,
    output_key: Option<String>,
    projection: Option<OutputProjection>,
    executor: Option<Arc<WorkerPool>>,
    max_workers: usize,
}

impl ParallelAgentBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn sub_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.children.push(agent);
        self
    }

    pub fn sub_agents(mut self, agents: impl IntoIterator<Item = Arc<dyn Agent>>) -> Self {
        self.children.extend(agents);
        self
    }

    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn output(mut self, projection: OutputProjection) -> Self {
        self.projection = Some(projection);
        self
    }

    /// 使用调用方的工作池（调用结束后不关闭）。
    /// 同一个池可以传给嵌套的并行组合：组合子节点不占许可，只有叶子单元受并发上限约束。
    pub fn executor(mut self, pool: Arc<WorkerPool>) -> Self {
        self.executor = Some(pool);
        self
    }

    /// 自建工作池的并发上限；0 表示与子智能体数量相同
    pub fn max_workers(mut self, n: usize) -> Self {
        self.max_workers = n;
        self
    }

    pub fn defaults(self, workflow: &WorkflowSection) -> Self {
        self.max_workers(workflow.parallel_max_workers)
    }

    pub fn build(self) -> Result<ParallelAgent, AgentError> {
        if self.children.is_empty() {
            return Err(AgentError::InvalidConfiguration(format!(
                "parallel '{}' has no sub-agents",
                self.name
            )));
        }
        Ok(ParallelAgent {
            input_keys: union_input_keys(&self.children),
            name: self.name,
            description: self.description,
            children: self.children,
            output_key: self.output_key,
            projection: self.projection,
            executor: self.executor,
            max_workers: self.max_workers,
        })
    }
}
