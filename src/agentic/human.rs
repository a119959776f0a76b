//! 人在回路：展示请求、等待人工回复、把回复写回 scope
//!
//! response_reader 可能阻塞（如读 stdin），在 spawn_blocking 中执行；async_mode 下由组合智能体派发到独立任务，
//! 不阻塞并发中的其他子智能体。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::agentic::agent::{complete_unit, resolve_inputs};
use crate::agentic::{Agent, AgenticScope};
use crate::core::AgentError;

type RequestWriter = Arc<dyn Fn(&Value) -> Result<(), AgentError> + Send + Sync>;
type ResponseReader = Arc<dyn Fn() -> Result<String, AgentError> + Send + Sync>;

pub struct HumanInTheLoop {
    name: String,
    description: String,
    input_key: String,
    output_key: String,
    request_writer: RequestWriter,
    response_reader: ResponseReader,
    async_mode: bool,
}

impl HumanInTheLoop {
    pub fn builder() -> HumanInTheLoopBuilder {
        HumanInTheLoopBuilder::default()
    }
}

#[async_trait]
impl Agent for HumanInTheLoop {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_keys(&self) -> Vec<String> {
        vec![self.input_key.clone()]
    }

    fn output_key(&self) -> Option<&str> {
        Some(&self.output_key)
    }

    fn is_async(&self) -> bool {
        self.async_mode
    }

    async fn invoke(&self, scope: &Arc<AgenticScope>) -> Result<Value, AgentError> {
        let inputs = resolve_inputs(&self.name, &self.input_keys(), &Map::new(), scope)?;
        let request = inputs.get(&self.input_key).cloned().unwrap_or(Value::Null);
        (self.request_writer)(&request)?;

        let reader = Arc::clone(&self.response_reader);
        let response = tokio::task::spawn_blocking(move || reader())
            .await
            .map_err(|e| AgentError::HumanInput(format!("response reader aborted: {e}")))??;
        tracing::debug!(agent = %self.name, "human response received");

        Ok(complete_unit(
            scope,
            &self.name,
            Some(&self.output_key),
            inputs,
            Value::String(response),
        ))
    }
}

#[derive(Default)]
pub struct HumanInTheLoopBuilder {
    name: Option<String>,
    description: String,
    input_key: Option<String>,
    output_key: Option<String>,
    request_writer: Option<RequestWriter>,
    response_reader: Option<ResponseReader>,
    async_mode: bool,
}

impl HumanInTheLoopBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// 展示给人的值所在的 key
    pub fn input_key(mut self, key: impl Into<String>) -> Self {
        self.input_key = Some(key.into());
        self
    }

    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn request_writer<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Result<(), AgentError> + Send + Sync + 'static,
    {
        self.request_writer = Some(Arc::new(f));
        self
    }

    pub fn response_reader<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Result<String, AgentError> + Send + Sync + 'static,
    {
        self.response_reader = Some(Arc::new(f));
        self
    }

    pub fn async_mode(mut self, async_mode: bool) -> Self {
        self.async_mode = async_mode;
        self
    }

    pub fn build(self) -> Result<HumanInTheLoop, AgentError> {
        let missing = |what: &str| AgentError::InvalidConfiguration(format!("human checkpoint needs {what}"));
        Ok(HumanInTheLoop {
            name: self.name.unwrap_or_else(|| "humanInTheLoop".to_string()),
            description: self.description,
            input_key: self.input_key.ok_or_else(|| missing("an input key"))?,
            output_key: self.output_key.ok_or_else(|| missing("an output key"))?,
            request_writer: self.request_writer.unwrap_or_else(silent_writer),
            response_reader: self.response_reader.ok_or_else(|| missing("a response reader"))?,
            async_mode: self.async_mode,
        })
    }
}

fn silent_writer() -> RequestWriter {
    fn ignore(_: &Value) -> Result<(), AgentError> {
        Ok(())
    }
    Arc::new(ignore)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_round_trip() {
        let shown = Arc::new(Mutex::new(Vec::new()));
        let shown_clone = shown.clone();
        let human = HumanInTheLoop::builder()
            .input_key("proposal")
            .output_key("candidateAnswer")
            .request_writer(move |request| {
                shown_clone.lock().unwrap().push(request.clone());
                Ok(())
            })
            .response_reader(|| Ok("yes".to_string()))
            .build()
            .unwrap();

        let scope = Arc::new(AgenticScope::new());
        scope.write("proposal", "Tuesday 3pm").unwrap();
        let out = human.invoke(&scope).await.unwrap();

        assert_eq!(out, Value::String("yes".to_string()));
        assert_eq!(scope.read::<String>("candidateAnswer").unwrap(), "yes");
        assert_eq!(shown.lock().unwrap()[0], Value::String("Tuesday 3pm".to_string()));
    }

    #[tokio::test]
    async fn test_reader_failure_propagates() {
        let human = HumanInTheLoop::builder()
            .input_key("proposal")
            .output_key("answer")
            .response_reader(|| Err(AgentError::HumanInput("stdin closed".to_string())))
            .build()
            .unwrap();
        let scope = Arc::new(AgenticScope::new());
        scope.write("proposal", "Monday").unwrap();
        assert!(matches!(human.invoke(&scope).await, Err(AgentError::HumanInput(_))));
    }

    #[test]
    fn test_requires_reader() {
        let built = HumanInTheLoop::builder().input_key("a").output_key("b").build();
        assert!(matches!(built, Err(AgentError::InvalidConfiguration(_))));
    }
}
