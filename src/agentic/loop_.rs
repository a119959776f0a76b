//! 循环组合：重复执行子智能体直到退出条件为真或达到最大迭代次数
//!
//! 一次迭代 = 所有子智能体按顺序执行一遍。默认每执行完一个子智能体就检查一次退出条件；
//! test_exit_at_loop_end(true) 时每遍只在末尾检查一次。达到上限不是错误，通过 LoopOutcome 区分两种正常结束。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::agentic::agent::{record_composite, run_child, union_input_keys, PendingAsync, ScopePredicate};
use crate::agentic::projection::project_result;
use crate::agentic::{Agent, AgentEvent, AgenticScope, OutputProjection};
use crate::config::WorkflowSection;
use crate::core::AgentError;

/// 循环的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LoopOutcome {
    /// 退出条件在第 iterations 遍为真
    ExitConditionMet { iterations: usize },
    /// 跑满 iterations 遍仍未满足退出条件
    MaxIterationsReached { iterations: usize },
}

impl LoopOutcome {
    pub fn iterations(&self) -> usize {
        match self {
            Self::ExitConditionMet { iterations } | Self::MaxIterationsReached { iterations } => *iterations,
        }
    }

    pub fn exit_condition_met(&self) -> bool {
        matches!(self, Self::ExitConditionMet { .. })
    }
}

pub struct LoopAgent {
    name: String,
    description: String,
    children: Vec<Arc<dyn Agent>>,
    exit_condition: ScopePredicate,
    max_iterations: usize,
    test_exit_at_loop_end: bool,
    input_keys: Vec<String>,
    output_key: Option<String>,
    projection: Option<OutputProjection>,
    outcome_key: Option<String>,
}

impl LoopAgent {
    pub fn builder(name: impl Into<String>) -> LoopAgentBuilder {
        LoopAgentBuilder {
            name: name.into(),
            description: String::new(),
            children: Vec::new(),
            exit_condition: None,
            max_iterations: 10,
            test_exit_at_loop_end: false,
            output_key: None,
            projection: None,
            outcome_key: None,
        }
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// 执行循环，同时返回结束方式
    pub async fn execute(&self, scope: &Arc<AgenticScope>) -> Result<(Value, LoopOutcome), AgentError> {
        info!(agent = %self.name, max_iterations = self.max_iterations, "loop start");
        let outcome = self.run_iterations(scope).await?;
        match outcome {
            LoopOutcome::ExitConditionMet { iterations } => {
                info!(agent = %self.name, iterations, "loop exit condition met")
            }
            LoopOutcome::MaxIterationsReached { iterations } => {
                warn!(agent = %self.name, iterations, "loop reached max iterations")
            }
        }
        if let Some(key) = &self.outcome_key {
            scope.write(key, outcome)?;
        }

        let output = project_result(scope, self.output_key.as_deref(), self.projection.as_ref())?;
        record_composite(scope, &self.name, &output);
        Ok((output, outcome))
    }

    async fn run_iterations(&self, scope: &Arc<AgenticScope>) -> Result<LoopOutcome, AgentError> {
        let mut pending = PendingAsync::new(&self.name);
        for iteration in 1..=self.max_iterations {
            for child in &self.children {
                pending.join_before(child).await?;
                if child.is_async() {
                    pending.spawn(child, scope);
                } else {
                    run_child(&self.name, child, scope).await?;
                }
                if !self.test_exit_at_loop_end && self.should_exit(&mut pending, scope).await? {
                    self.iteration_done(scope, iteration);
                    return Ok(LoopOutcome::ExitConditionMet { iterations: iteration });
                }
            }
            let exit = self.test_exit_at_loop_end && self.should_exit(&mut pending, scope).await?;
            self.iteration_done(scope, iteration);
            if exit {
                return Ok(LoopOutcome::ExitConditionMet { iterations: iteration });
            }
        }
        pending.join_all().await?;
        Ok(LoopOutcome::MaxIterationsReached {
            iterations: self.max_iterations,
        })
    }

    /// 退出条件求值前等待所有异步子任务，保证条件看到本遍的输出
    async fn should_exit(&self, pending: &mut PendingAsync, scope: &AgenticScope) -> Result<bool, AgentError> {
        pending.join_all().await?;
        (self.exit_condition)(scope)
    }

    fn iteration_done(&self, scope: &AgenticScope, iteration: usize) {
        debug!(agent = %self.name, iteration, "loop iteration done");
        scope.emit(AgentEvent::LoopIteration {
            agent: self.name.clone(),
            iteration,
        });
    }
}

#[async_trait]
impl Agent for LoopAgent {
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
        self.execute(scope).await.map(|(output, _)| output)
    }
}

pub struct LoopAgentBuilder {
    name: String,
    description: String,
    children: Vec<Arc<dyn Agent>>,
    exit_condition: Option<ScopePredicate>,
    max_iterations: usize,
    test_exit_at_loop_end: bool,
    output_key: Option<String>,
    projection: Option<OutputProjection>,
    outcome_key: Option<String>,
}

impl LoopAgentBuilder {
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

    pub fn exit_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&AgenticScope) -> Result<bool, AgentError> + Send + Sync + 'static,
    {
        self.exit_condition = Some(Arc::new(condition));
        self
    }

    pub fn max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    /// true：每遍结束时才检查退出条件
    pub fn test_exit_at_loop_end(mut self, at_end: bool) -> Self {
        self.test_exit_at_loop_end = at_end;
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

    /// 把 LoopOutcome 写入 scope 的 key
    pub fn outcome_key(mut self, key: impl Into<String>) -> Self {
        self.outcome_key = Some(key.into());
        self
    }

    pub fn defaults(self, workflow: &WorkflowSection) -> Self {
        self.max_iterations(workflow.loop_max_iterations)
    }

    pub fn build(self) -> Result<LoopAgent, AgentError> {
        if self.children.is_empty() {
            return Err(AgentError::InvalidConfiguration(format!(
                "loop '{}' has no sub-agents",
                self.name
            )));
        }
        if self.max_iterations == 0 {
            return Err(AgentError::InvalidConfiguration(format!(
                "loop '{}' needs at least one iteration",
                self.name
            )));
        }
        let exit_condition = self.exit_condition.ok_or_else(|| {
            AgentError::InvalidConfiguration(format!("loop '{}' has no exit condition", self.name))
        })?;
        Ok(LoopAgent {
            input_keys: union_input_keys(&self.children),
            name: self.name,
            description: self.description,
            children: self.children,
            exit_condition,
            max_iterations: self.max_iterations,
            test_exit_at_loop_end: self.test_exit_at_loop_end,
            output_key: self.output_key,
            projection: self.projection,
            outcome_key: self.outcome_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentic::{FunctionAgent, ScopeAction};
    use serde_json::json;

    /// 每次执行把 counter 加一
    fn counter(name: &str, key: &'static str) -> Arc<dyn Agent> {
        Arc::new(
            FunctionAgent::builder(name)
                .input_key(key)
                .default_value(key, json!(0))
                .output_key(key)
                .build(move |inputs| Ok(inputs.get::<i64>(key)? + 1))
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_never_true_runs_exactly_max() {
        let looped = LoopAgent::builder("refine")
            .sub_agent(counter("step", "runs"))
            .exit_condition(|_| Ok(false))
            .max_iterations(4)
            .outcome_key("loopOutcome")
            .build()
            .unwrap();
        let scope = Arc::new(AgenticScope::new());
        let (_, outcome) = looped.execute(&scope).await.unwrap();
        assert_eq!(outcome, LoopOutcome::MaxIterationsReached { iterations: 4 });
        assert_eq!(scope.read::<i64>("runs").unwrap(), 4);
        assert_eq!(
            scope.read::<LoopOutcome>("loopOutcome").unwrap(),
            LoopOutcome::MaxIterationsReached { iterations: 4 }
        );
    }

    #[tokio::test]
    async fn test_early_exit_after_k() {
        let looped = LoopAgent::builder("refine")
            .sub_agent(counter("step", "runs"))
            .exit_condition(|scope| Ok(scope.read::<i64>("runs")? >= 2))
            .max_iterations(5)
            .build()
            .unwrap();
        let scope = Arc::new(AgenticScope::new());
        let (_, outcome) = looped.execute(&scope).await.unwrap();
        assert_eq!(outcome, LoopOutcome::ExitConditionMet { iterations: 2 });
        assert_eq!(scope.read::<i64>("runs").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_exit_checked_after_each_child_by_default() {
        let looped = LoopAgent::builder("refine")
            .sub_agents([counter("first", "a"), counter("second", "b")])
            .exit_condition(|scope| Ok(scope.read_or::<i64>("a", 0)? >= 1))
            .max_iterations(3)
            .build()
            .unwrap();
        let scope = Arc::new(AgenticScope::new());
        looped.invoke(&scope).await.unwrap();
        assert_eq!(scope.read::<i64>("a").unwrap(), 1);
        assert!(!scope.contains("b"));
    }

    #[tokio::test]
    async fn test_exit_at_loop_end_finishes_the_pass() {
        let looped = LoopAgent::builder("refine")
            .sub_agents([counter("first", "a"), counter("second", "b")])
            .exit_condition(|scope| Ok(scope.read_or::<i64>("a", 0)? >= 1))
            .test_exit_at_loop_end(true)
            .max_iterations(3)
            .build()
            .unwrap();
        let scope = Arc::new(AgenticScope::new());
        let (_, outcome) = looped.execute(&scope).await.unwrap();
        assert!(outcome.exit_condition_met());
        assert_eq!(scope.read::<i64>("b").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_iteration_events() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let looped = LoopAgent::builder("refine")
            .sub_agent(counter("step", "runs"))
            .exit_condition(|_| Ok(false))
            .max_iterations(2)
            .build()
            .unwrap();
        let scope = Arc::new(AgenticScope::new().with_events(tx));
        looped.invoke(&scope).await.unwrap();
        drop(scope);

        let mut iterations = Vec::new();
        while let Some(event) = rx.recv().await {
            if let AgentEvent::LoopIteration { iteration, .. } = event {
                iterations.push(iteration);
            }
        }
        assert_eq!(iterations, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_async_child_joined_before_scope_action() {
        let score: Arc<dyn Agent> = Arc::new(
            FunctionAgent::builder("score")
                .input_key("cv")
                .output_key("score")
                .async_mode(true)
                .build_async(|_| async {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok(0.9)
                })
                .unwrap(),
        );
        let copy: Arc<dyn Agent> = Arc::new(
            ScopeAction::new("copyScore", |scope| {
                let score: f64 = scope.read("score")?;
                scope.write("seen", score)
            })
            .input_keys(["cv"]),
        );
        let looped = LoopAgent::builder("review")
            .sub_agents([score, copy])
            .exit_condition(|scope| Ok(scope.contains("seen")))
            .test_exit_at_loop_end(true)
            .max_iterations(3)
            .build()
            .unwrap();
        let scope = Arc::new(AgenticScope::new());
        scope.write("cv", "draft").unwrap();
        let (_, outcome) = looped.execute(&scope).await.unwrap();
        assert_eq!(outcome, LoopOutcome::ExitConditionMet { iterations: 1 });
        assert_eq!(scope.read::<f64>("seen").unwrap(), 0.9);
    }

    #[test]
    fn test_requires_exit_condition() {
        let built = LoopAgent::builder("refine").sub_agent(counter("step", "runs")).build();
        assert!(matches!(built, Err(AgentError::InvalidConfiguration(_))));
    }
}
