//! 顺序组合：按声明顺序执行子智能体，前一个的输出在后一个开始前已写入 scope
//!
//! 异步子智能体派发后继续往下走，直到某个后续子智能体需要它的输出 key、后续是会读取整个 scope 的组合智能体，或序列结束时才等待。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::agentic::agent::{record_composite, run_child, union_input_keys, PendingAsync};
use crate::agentic::projection::project_result;
use crate::agentic::{Agent, AgenticScope, OutputProjection};
use crate::core::AgentError;

pub struct SequentialAgent {
    name: String,
    description: String,
    children: Vec<Arc<dyn Agent>>,
    input_keys: Vec<String>,
    output_key: Option<String>,
    projection: Option<OutputProjection>,
}

impl SequentialAgent {
    pub fn builder(name: impl Into<String>) -> SequentialAgentBuilder {
        SequentialAgentBuilder {
            name: name.into(),
            description: String::new(),
            children: Vec::new(),
            output_key: None,
            projection: None,
        }
    }
}

#[async_trait]
impl Agent for SequentialAgent {
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
        info!(agent = %self.name, children = self.children.len(), "sequence start");
        let mut pending = PendingAsync::new(&self.name);
        for child in &self.children {
            pending.join_before(child).await?;
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

pub struct SequentialAgentBuilder {
    name: String,
    description: String,
    children: Vec<Arc<dyn Agent>>,
    output_key: Option<String>,
    projection: Option<OutputProjection>,
}

impl SequentialAgentBuilder {
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

    pub fn build(self) -> Result<SequentialAgent, AgentError> {
        if self.children.is_empty() {
            return Err(AgentError::InvalidConfiguration(format!(
                "sequence '{}' has no sub-agents",
                self.name
            )));
        }
        Ok(SequentialAgent {
            input_keys: union_input_keys(&self.children),
            name: self.name,
            description: self.description,
            children: self.children,
            output_key: self.output_key,
            projection: self.projection,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentic::{ConditionalAgent, FunctionAgent, LoopAgent};
    use serde_json::json;
    use std::time::Duration;

    fn append(name: &str, from: &str, to: &str, suffix: &'static str) -> Arc<dyn Agent> {
        let from_key = from.to_string();
        Arc::new(
            FunctionAgent::builder(name)
                .input_key(from)
                .output_key(to)
                .build(move |inputs| Ok(format!("{}{}", inputs.get::<String>(&from_key)?, suffix)))
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_children_see_previous_outputs() {
        let seq = SequentialAgent::builder("pipeline")
            .sub_agent(append("a", "x", "y", "+a"))
            .sub_agent(append("b", "y", "z", "+b"))
            .output_key("z")
            .build()
            .unwrap();
        let scope = Arc::new(AgenticScope::new());
        scope.write("x", "start").unwrap();
        assert_eq!(seq.invoke(&scope).await.unwrap(), json!("start+a+b"));
        assert_eq!(seq.input_keys(), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_children() {
        let seq = SequentialAgent::builder("pipeline")
            .sub_agent(append("a", "missing", "y", "+a"))
            .sub_agent(append("b", "x", "z", "+b"))
            .build()
            .unwrap();
        let scope = Arc::new(AgenticScope::new());
        scope.write("x", "start").unwrap();
        let err = seq.invoke(&scope).await.unwrap_err();
        assert!(matches!(err, AgentError::ChildFailure { ref child, .. } if child == "a"));
        assert!(!scope.contains("z"));
    }

    #[tokio::test]
    async fn test_async_child_joined_before_consumer() {
        let slow: Arc<dyn Agent> = Arc::new(
            FunctionAgent::builder("slow")
                .output_key("y")
                .async_mode(true)
                .build_async(|_| async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok("late")
                })
                .unwrap(),
        );
        let seq = SequentialAgent::builder("pipeline")
            .sub_agent(slow)
            .sub_agent(append("b", "y", "z", "+b"))
            .output_key("z")
            .build()
            .unwrap();
        let scope = Arc::new(AgenticScope::new());
        assert_eq!(seq.invoke(&scope).await.unwrap(), json!("late+b"));
    }

    fn slow_scorer() -> Arc<dyn Agent> {
        Arc::new(
            FunctionAgent::builder("scorer")
                .input_key("cv")
                .output_key("score")
                .async_mode(true)
                .build_async(|_| async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(0.9)
                })
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_async_child_joined_before_conditional_predicate() {
        let invite: Arc<dyn Agent> = Arc::new(
            FunctionAgent::builder("invite")
                .input_key("cv")
                .output_key("decision")
                .build(|_| Ok("invite"))
                .unwrap(),
        );
        let decide: Arc<dyn Agent> = Arc::new(
            ConditionalAgent::builder("decide")
                .sub_agent_when(|scope| Ok(scope.read::<f64>("score")? >= 0.8), invite)
                .build()
                .unwrap(),
        );
        let seq = SequentialAgent::builder("review")
            .sub_agents([slow_scorer(), decide])
            .output_key("decision")
            .build()
            .unwrap();
        let scope = Arc::new(AgenticScope::new());
        scope.write("cv", "draft").unwrap();
        assert_eq!(seq.invoke(&scope).await.unwrap(), json!("invite"));
    }

    #[tokio::test]
    async fn test_async_child_joined_before_loop_exit_condition() {
        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let refine: Arc<dyn Agent> = Arc::new(
            FunctionAgent::builder("refine")
                .input_key("cv")
                .output_key("cv")
                .build(move |inputs| {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(format!("{}+", inputs.get::<String>("cv")?))
                })
                .unwrap(),
        );
        let refine_loop: Arc<dyn Agent> = Arc::new(
            LoopAgent::builder("refineLoop")
                .sub_agent(refine)
                .exit_condition(|scope| Ok(scope.read::<f64>("score")? >= 0.8))
                .max_iterations(3)
                .build()
                .unwrap(),
        );
        let seq = SequentialAgent::builder("review")
            .sub_agents([slow_scorer(), refine_loop])
            .build()
            .unwrap();
        let scope = Arc::new(AgenticScope::new());
        scope.write("cv", "draft").unwrap();
        seq.invoke(&scope).await.unwrap();
        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(scope.read::<String>("cv").unwrap(), "draft+");
    }

    #[test]
    fn test_empty_sequence_rejected() {
        assert!(SequentialAgent::builder("empty").build().is_err());
    }
}
