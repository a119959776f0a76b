//! Agent trait 与通用调度
//!
//! 所有执行单元（生成式、确定性、人在回路、各类组合智能体）都实现 Agent，组合智能体持有 Arc<dyn Agent> 子节点，
//! 因此可以任意嵌套。scope 显式传入每次调用。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::agentic::scope::{AgentInvocation, AgenticScope};
use crate::core::AgentError;

/// 执行单元
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// 声明需要从 scope 读取的 key
    fn input_keys(&self) -> Vec<String>;

    /// 声明写回 scope 的 key；None 表示不写
    fn output_key(&self) -> Option<&str>;

    /// 异步单元由消费其输出的组合智能体派发到独立任务
    fn is_async(&self) -> bool {
        false
    }

    /// 组合智能体只负责调度，自身不占用工作池的并发名额
    fn is_composite(&self) -> bool {
        false
    }

    /// 执行时可能读取 input_keys 之外的 key（组合智能体的条件与投影、ScopeAction）。
    /// 为 true 时，之前派发的异步单元全部完成后才开始执行。
    fn reads_whole_scope(&self) -> bool {
        self.is_composite()
    }

    async fn invoke(&self, scope: &Arc<AgenticScope>) -> Result<Value, AgentError>;
}

/// 基于当前 scope 的判断（分支条件、循环退出条件）
pub type ScopePredicate = Arc<dyn Fn(&AgenticScope) -> Result<bool, AgentError> + Send + Sync>;

/// 工作流过程事件（可序列化为 JSON 供外部展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 子智能体开始执行
    Started { agent: String, parent: String },
    Completed { agent: String, output: Value },
    Failed { agent: String, error: String },
    /// 循环智能体完成一轮
    LoopIteration { agent: String, iteration: usize },
    /// 监督者选择了下一个子智能体
    SupervisorDecision {
        agent: String,
        next: String,
        arguments: Value,
    },
}

/// 按声明解析输入；缺失且无默认值时返回 MissingInput
pub(crate) fn resolve_inputs(
    agent: &str,
    keys: &[String],
    defaults: &Map<String, Value>,
    scope: &AgenticScope,
) -> Result<Map<String, Value>, AgentError> {
    let mut inputs = Map::new();
    for key in keys {
        let value = scope
            .read_value(key)
            .or_else(|| defaults.get(key).cloned())
            .ok_or_else(|| AgentError::MissingInput {
                agent: agent.to_string(),
                key: key.clone(),
            })?;
        inputs.insert(key.clone(), value);
    }
    Ok(inputs)
}

/// 叶子单元的收尾：写输出 key、记录调用链；无输出 key 时返回整个 scope 快照
pub(crate) fn complete_unit(
    scope: &AgenticScope,
    agent: &str,
    output_key: Option<&str>,
    inputs: Map<String, Value>,
    output: Value,
) -> Value {
    if let Some(key) = output_key {
        scope.write_value(key, output.clone());
    }
    scope.record_invocation(AgentInvocation {
        agent: agent.to_string(),
        inputs,
        output: output.clone(),
        at: Utc::now(),
    });
    match output_key {
        Some(_) => output,
        None => Value::Object(scope.snapshot()),
    }
}

/// 组合智能体完成后记入调用链
pub(crate) fn record_composite(scope: &AgenticScope, agent: &str, output: &Value) {
    scope.record_invocation(AgentInvocation {
        agent: agent.to_string(),
        inputs: Map::new(),
        output: output.clone(),
        at: Utc::now(),
    });
}

/// 在组合智能体中执行一个子智能体：发送事件，失败时包装为 ChildFailure
pub(crate) async fn run_child(
    parent: &str,
    child: &Arc<dyn Agent>,
    scope: &Arc<AgenticScope>,
) -> Result<Value, AgentError> {
    tracing::debug!(parent, child = child.name(), "dispatch");
    scope.emit(AgentEvent::Started {
        agent: child.name().to_string(),
        parent: parent.to_string(),
    });
    match child.invoke(scope).await {
        Ok(output) => {
            scope.emit(AgentEvent::Completed {
                agent: child.name().to_string(),
                output: output.clone(),
            });
            Ok(output)
        }
        Err(e) => {
            scope.emit(AgentEvent::Failed {
                agent: child.name().to_string(),
                error: e.to_string(),
            });
            Err(e.in_child(parent, child.name()))
        }
    }
}

/// 在独立 tokio 任务中执行子智能体
pub(crate) fn spawn_child(
    parent: &str,
    child: &Arc<dyn Agent>,
    scope: &Arc<AgenticScope>,
) -> JoinHandle<Result<Value, AgentError>> {
    let parent = parent.to_string();
    let child = Arc::clone(child);
    let scope = Arc::clone(scope);
    tokio::spawn(async move { run_child(&parent, &child, &scope).await })
}

/// 等待已派发的子任务；panic 或被取消转为 Join 错误
pub(crate) async fn join_child(
    parent: &str,
    child: &str,
    handle: JoinHandle<Result<Value, AgentError>>,
) -> Result<Value, AgentError> {
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(AgentError::Join(e.to_string()).in_child(parent, child)),
    }
}

struct PendingTask {
    child: String,
    output_key: Option<String>,
    handle: JoinHandle<Result<Value, AgentError>>,
}

/// 组合智能体中尚未完成的异步子任务；在其输出被消费前 join。
/// 组合智能体提前失败时，Drop 会中止剩余任务。
pub(crate) struct PendingAsync {
    parent: String,
    tasks: Vec<PendingTask>,
}

impl PendingAsync {
    pub(crate) fn new(parent: &str) -> Self {
        Self {
            parent: parent.to_string(),
            tasks: Vec::new(),
        }
    }

    pub(crate) fn spawn(&mut self, child: &Arc<dyn Agent>, scope: &Arc<AgenticScope>) {
        self.tasks.push(PendingTask {
            child: child.name().to_string(),
            output_key: child.output_key().map(str::to_string),
            handle: spawn_child(&self.parent, child, scope),
        });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// 等待输出 key 出现在 keys 中的任务；keys 为空（组合子节点）时等待全部
    pub(crate) async fn join_for(&mut self, keys: &[String]) -> Result<(), AgentError> {
        if keys.is_empty() {
            return self.join_all().await;
        }
        let (ready, rest): (Vec<PendingTask>, Vec<PendingTask>) =
            std::mem::take(&mut self.tasks).into_iter().partition(|t| {
                t.output_key
                    .as_ref()
                    .map(|k| keys.contains(k))
                    .unwrap_or(false)
            });
        self.tasks = rest;
        self.join_tasks(ready).await
    }

    /// 执行 next 之前等待它可能读取的异步输出
    pub(crate) async fn join_before(&mut self, next: &Arc<dyn Agent>) -> Result<(), AgentError> {
        if self.tasks.is_empty() {
            return Ok(());
        }
        if next.reads_whole_scope() {
            return self.join_all().await;
        }
        self.join_for(&next.input_keys()).await
    }

    pub(crate) async fn join_all(&mut self) -> Result<(), AgentError> {
        let tasks = std::mem::take(&mut self.tasks);
        self.join_tasks(tasks).await
    }

    async fn join_tasks(&self, tasks: Vec<PendingTask>) -> Result<(), AgentError> {
        let mut tasks = tasks.into_iter();
        while let Some(task) = tasks.next() {
            if let Err(e) = join_child(&self.parent, &task.child, task.handle).await {
                for rest in tasks {
                    rest.handle.abort();
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Drop for PendingAsync {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.handle.abort();
        }
    }
}

/// 组合智能体的输入 key：子节点声明的并集
pub(crate) fn union_input_keys(children: &[Arc<dyn Agent>]) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for child in children {
        for key in child.input_keys() {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    keys
}
