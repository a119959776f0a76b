//! 条件组合：有序的 (条件, 子智能体) 对
//!
//! 先按声明顺序针对当前 scope 求值全部条件，再依次执行所有命中的子智能体（可多个同时命中）。
//! 同步子智能体按声明顺序一个接一个执行；异步子智能体派发后在返回前统一等待。无命中时不做任何事。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::agentic::agent::{record_composite, run_child, union_input_keys, PendingAsync, ScopePredicate};
use crate::agentic::projection::project_result;
use crate::agentic::{Agent, AgenticScope, OutputProjection};
use crate::core::AgentError;

struct Branch {
    condition: ScopePredicate,
    agent: Arc<dyn Agent>,
}

pub struct ConditionalAgent {
    name: String,
    description: String,
    branches: Vec<Branch>,
    input_keys: Vec<String>,
    output_key: Option<String>,
    projection: Option<OutputProjection>,
}

impl ConditionalAgent {
    pub fn builder(name: impl Into<String>) -> ConditionalAgentBuilder {
        ConditionalAgentBuilder {
            name: name.into(),
            description: String::new(),
            branches: Vec::new(),
            output_key: None,
            projection: None,
        }
    }

    fn matching(&self, scope: &AgenticScope) -> Result<Vec<&Arc<dyn Agent>>, AgentError> {
        let mut matched = Vec::new();
        for branch in &self.branches {
            if (branch.condition)(scope)? {
                matched.push(&branch.agent);
            }
        }
        Ok(matched)
    }
}

#[async_trait]
impl Agent for ConditionalAgent {
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
        let matched = self.matching(scope)?;
        info!(agent = %self.name, matched = matched.len(), branches = self.branches.len(), "conditional");

        let mut pending = PendingAsync::new(&self.name);
        for child in matched {
            debug!(agent = %self.name, child = child.name(), "branch fired");
            if child.is_async() {
                pending.spawn(child, scope);
            } else {
                run_child(&self.name, child, scope).await?;
            }
        }
        pending.join_all().await?;

        let output = project_result(scope, self.output_key.as_deref(), self.projection.as_ref())?;
        record_composite(scope, &self.name, &output);
        Ok(output)
    }
}

pub struct ConditionalAgentBuilder {
    name: String,
    description: String,
    branches: Vec<Branch>,
    output_key: Option<String>,
    projection: Option<OutputProjection>,
}

impl ConditionalAgentBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// 条件为真时执行 agent
    pub fn sub_agent_when<F>(mut self, condition: F, agent: Arc<dyn Agent>) -> Self
    where
        F: Fn(&AgenticScope) -> Result<bool, AgentError> + Send + Sync + 'static,
    {
        self.branches.push(Branch {
            condition: Arc::new(condition),
            agent,
        });
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

    pub fn build(self) -> Result<ConditionalAgent, AgentError> {
        if self.branches.is_empty() {
            return Err(AgentError::InvalidConfiguration(format!(
                "conditional '{}' has no branches",
                self.name
            )));
        }
        let agents: Vec<Arc<dyn Agent>> = self.branches.iter().map(|b| Arc::clone(&b.agent)).collect();
        Ok(ConditionalAgent {
            input_keys: union_input_keys(&agents),
            name: self.name,
            description: self.description,
            branches: self.branches,
            output_key: self.output_key,
            projection: self.projection,
        })
    }
}
