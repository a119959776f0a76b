//! 生成式单元：由模型完成一步工作
//!
//! 一次调用：解析输入 → 渲染 system / user 模板 → （可选）检索增强 → （可选）带上该 memory id 的历史对话
//! → 调用模型；挂了工具时进入有上限的 计划 → 工具 → 观察 循环，直到模型给出不含工具调用的最终回复。
//! 设置 json_output 时最终回复按 JSON 解析（容忍 ```json 围栏），格式错误按 RecoveryEngine 的提示重试一次。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::agentic::agent::{complete_unit, resolve_inputs};
use crate::agentic::scope::value_to_text;
use crate::agentic::template::PromptTemplate;
use crate::agentic::{Agent, AgenticScope};
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::llm::LlmClient;
use crate::memory::{ChatMemoryStore, Message};
use crate::rag::ContentRetriever;
use crate::tools::{tool_call_schema_json, ToolExecutor};

/// 未指定 memory id 时共用的分区
const DEFAULT_MEMORY_ID: &str = "default";

/// 模型返回的工具调用：{"tool": "echo", "args": {"text": "..."}}
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

/// 模型一轮输出
#[derive(Debug, Clone)]
pub enum ModelReply {
    Final(String),
    ToolCall(ToolCall),
}

/// 从回复中取出 JSON 文本：```json 围栏内的内容，或首个 '{' 到最后一个 '}'
pub(crate) fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        if let Some(end) = rest.find("```") {
            let inner = rest[..end].trim();
            if inner.starts_with('{') || inner.starts_with('[') {
                return Some(inner);
            }
        }
    }
    let start = trimmed.find(['{', '['])?;
    let end = trimmed.rfind(['}', ']'])?;
    (end >= start).then(|| &trimmed[start..=end])
}

/// 将回复解析为 JSON 值
pub(crate) fn parse_json_reply(text: &str) -> Result<Value, AgentError> {
    let json = extract_json(text).ok_or_else(|| AgentError::JsonParseError(text.trim().to_string()))?;
    serde_json::from_str(json).map_err(|e| AgentError::JsonParseError(format!("{e}: {json}")))
}

/// 解析带工具时的模型回复：以 JSON 开头（或围栏）且含非空 "tool" 字段即为工具调用，否则为最终回复
pub fn parse_model_reply(text: &str) -> Result<ModelReply, AgentError> {
    let trimmed = text.trim();
    let looks_like_json = trimmed.starts_with('{') || trimmed.contains("```json");
    if !looks_like_json {
        return Ok(ModelReply::Final(trimmed.to_string()));
    }
    let value = parse_json_reply(trimmed)?;
    match value.get("tool").and_then(Value::as_str) {
        Some(tool) if !tool.is_empty() => {
            let call: ToolCall = serde_json::from_value(value.clone())
                .map_err(|e| AgentError::JsonParseError(format!("{e}: {value}")))?;
            Ok(ModelReply::ToolCall(call))
        }
        _ => Ok(ModelReply::Final(trimmed.to_string())),
    }
}

pub struct LlmAgent {
    name: String,
    description: String,
    llm: Arc<dyn LlmClient>,
    system_template: Option<PromptTemplate>,
    user_template: PromptTemplate,
    input_keys: Vec<String>,
    defaults: Map<String, Value>,
    output_key: Option<String>,
    json_output: bool,
    tools: Option<Arc<ToolExecutor>>,
    max_tool_rounds: usize,
    retriever: Option<Arc<dyn ContentRetriever>>,
    chat_memory: Option<Arc<ChatMemoryStore>>,
    async_mode: bool,
    recovery: RecoveryEngine,
}

impl LlmAgent {
    pub fn builder(name: impl Into<String>, llm: Arc<dyn LlmClient>) -> LlmAgentBuilder {
        LlmAgentBuilder {
            name: name.into(),
            description: String::new(),
            llm,
            system_template: None,
            user_template: None,
            input_keys: None,
            defaults: Map::new(),
            output_key: None,
            json_output: false,
            tools: None,
            max_tool_rounds: 5,
            retriever: None,
            chat_memory: None,
            async_mode: false,
        }
    }

    fn memory_id(scope: &AgenticScope) -> String {
        scope
            .memory_id()
            .map(str::to_string)
            .or_else(|| scope.read_value("memoryId").map(|v| value_to_text(&v)))
            .unwrap_or_else(|| DEFAULT_MEMORY_ID.to_string())
    }

    fn system_prompt(&self, inputs: &Map<String, Value>) -> Result<Option<String>, AgentError> {
        let mut system = match &self.system_template {
            Some(t) => Some(t.render(inputs)?),
            None => None,
        };
        if let Some(tools) = &self.tools {
            let tool_section = format!(
                "You can call tools. To call a tool, reply with exactly one JSON object \
                 {{\"tool\": \"<name>\", \"args\": {{...}}}} and nothing else.\n\
                 Tool call schema:\n{}\nAvailable tools:\n{}\n\
                 When you have the final answer, reply without a tool call.",
                tool_call_schema_json(),
                tools.schema_json()
            );
            system = Some(match system {
                Some(s) => format!("{s}\n\n{tool_section}"),
                None => tool_section,
            });
        }
        Ok(system)
    }

    async fn augment(&self, user: String) -> Result<String, AgentError> {
        let Some(retriever) = &self.retriever else {
            return Ok(user);
        };
        let snippets = retriever.retrieve(&user).await?;
        if snippets.is_empty() {
            return Ok(user);
        }
        debug!(agent = %self.name, snippets = snippets.len(), "retrieval augmentation");
        Ok(format!(
            "{user}\n\nAnswer using the following information:\n{}",
            snippets.join("\n\n")
        ))
    }

    async fn call_model(&self, messages: &[Message]) -> Result<String, AgentError> {
        self.llm.complete(messages).await.map_err(AgentError::LlmError)
    }

    /// 计划 → 工具 → 观察 循环；返回最终回复文本。新产生的对话追加到 exchanged
    async fn converse(
        &self,
        mut messages: Vec<Message>,
        exchanged: &mut Vec<Message>,
    ) -> Result<String, AgentError> {
        let mut tool_rounds = 0usize;
        let mut format_retries = 0usize;
        loop {
            let reply = self.call_model(&messages).await?;
            let Some(tools) = &self.tools else {
                return Ok(reply);
            };

            let parsed = parse_model_reply(&reply);
            let hint = match parsed {
                Ok(ModelReply::Final(text)) => return Ok(text),
                Ok(ModelReply::ToolCall(call)) => {
                    if tool_rounds >= self.max_tool_rounds {
                        return Err(AgentError::ToolExecutionFailed(format!(
                            "agent '{}' exceeded {} tool rounds",
                            self.name, self.max_tool_rounds
                        )));
                    }
                    tool_rounds += 1;
                    debug!(agent = %self.name, tool = %call.tool, round = tool_rounds, "tool call");
                    match tools.execute(&call.tool, call.args.clone()).await {
                        Ok(observation) => format!("Observation from {}: {}", call.tool, observation),
                        Err(e) => match self.recovery.handle(&e) {
                            RecoveryAction::RetryWithPrompt(hint) => hint,
                            RecoveryAction::ReportToSupervisor(msg) => {
                                warn!(agent = %self.name, tool = %call.tool, error = %e, "tool failed");
                                format!("Tool error from {}: {}", call.tool, msg)
                            }
                            RecoveryAction::Abort => return Err(e),
                        },
                    }
                }
                Err(e) => match self.recovery.handle(&e) {
                    RecoveryAction::RetryWithPrompt(hint) if format_retries == 0 => {
                        format_retries += 1;
                        hint
                    }
                    _ => return Err(e),
                },
            };

            let assistant = Message::assistant(reply);
            let observation = Message::user(hint);
            messages.push(assistant.clone());
            messages.push(observation.clone());
            exchanged.push(assistant);
            exchanged.push(observation);
        }
    }

    /// 按 json_output 把最终回复转为输出值；JSON 格式错误时带提示重试一次
    async fn finish_reply(
        &self,
        mut messages: Vec<Message>,
        reply: String,
        exchanged: &mut Vec<Message>,
    ) -> Result<(Value, String), AgentError> {
        if !self.json_output {
            return Ok((Value::String(reply.clone()), reply));
        }
        match parse_json_reply(&reply) {
            Ok(value) => Ok((value, reply)),
            Err(e) => {
                let RecoveryAction::RetryWithPrompt(hint) = self.recovery.handle(&e) else {
                    return Err(e);
                };
                warn!(agent = %self.name, error = %e, "structured output invalid, retrying");
                messages.extend(exchanged.iter().skip(1).cloned());
                let assistant = Message::assistant(reply);
                let retry = Message::user(hint);
                messages.push(assistant.clone());
                messages.push(retry.clone());
                exchanged.push(assistant);
                exchanged.push(retry);
                let second = self.call_model(&messages).await?;
                let value = parse_json_reply(&second)?;
                Ok((value, second))
            }
        }
    }
}

#[async_trait]
impl Agent for LlmAgent {
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

    fn is_async(&self) -> bool {
        self.async_mode
    }

    async fn invoke(&self, scope: &Arc<AgenticScope>) -> Result<Value, AgentError> {
        let inputs = resolve_inputs(&self.name, &self.input_keys, &self.defaults, scope)?;

        let system = self.system_prompt(&inputs)?;
        let user = self.augment(self.user_template.render(&inputs)?).await?;
        let memory_id = Self::memory_id(scope);

        let mut messages = Vec::new();
        if let Some(system) = &system {
            messages.push(Message::system(system.clone()));
        }
        if let Some(memory) = &self.chat_memory {
            messages.extend(memory.messages(&memory_id));
        }
        let user_message = Message::user(user);
        messages.push(user_message.clone());

        let mut exchanged = vec![user_message.clone()];
        let reply = self.converse(messages.clone(), &mut exchanged).await?;
        let (output, final_text) = self.finish_reply(messages, reply, &mut exchanged).await?;
        let assistant = Message::assistant(final_text);
        exchanged.push(assistant.clone());

        for message in exchanged {
            scope.append_message(&self.name, message);
        }
        if let Some(memory) = &self.chat_memory {
            memory.append(&memory_id, [user_message, assistant]);
        }

        Ok(complete_unit(
            scope,
            &self.name,
            self.output_key.as_deref(),
            inputs,
            output,
        ))
    }
}

pub struct LlmAgentBuilder {
    name: String,
    description: String,
    llm: Arc<dyn LlmClient>,
    system_template: Option<PromptTemplate>,
    user_template: Option<PromptTemplate>,
    input_keys: Option<Vec<String>>,
    defaults: Map<String, Value>,
    output_key: Option<String>,
    json_output: bool,
    tools: Option<Arc<ToolExecutor>>,
    max_tool_rounds: usize,
    retriever: Option<Arc<dyn ContentRetriever>>,
    chat_memory: Option<Arc<ChatMemoryStore>>,
    async_mode: bool,
}

impl LlmAgentBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn system_message(mut self, template: impl Into<PromptTemplate>) -> Self {
        self.system_template = Some(template.into());
        self
    }

    pub fn user_message(mut self, template: impl Into<PromptTemplate>) -> Self {
        self.user_template = Some(template.into());
        self
    }

    /// 显式声明输入；不设置时取模板中的占位符
    pub fn input_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn default_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(key.into(), value);
        self
    }

    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    /// 最终回复按 JSON 解析为结构化输出
    pub fn json_output(mut self, json_output: bool) -> Self {
        self.json_output = json_output;
        self
    }

    pub fn tools(mut self, tools: Arc<ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    pub fn retriever(mut self, retriever: Arc<dyn ContentRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn chat_memory(mut self, memory: Arc<ChatMemoryStore>) -> Self {
        self.chat_memory = Some(memory);
        self
    }

    pub fn async_mode(mut self, async_mode: bool) -> Self {
        self.async_mode = async_mode;
        self
    }

    pub fn build(self) -> Result<LlmAgent, AgentError> {
        if self.name.trim().is_empty() {
            return Err(AgentError::InvalidConfiguration(
                "generative agent needs a name".to_string(),
            ));
        }
        let user_template = self.user_template.ok_or_else(|| {
            AgentError::InvalidConfiguration(format!("agent '{}' has no user message", self.name))
        })?;
        let input_keys = match self.input_keys {
            Some(keys) => keys,
            None => {
                let mut keys = match &self.system_template {
                    Some(t) => t.variables()?,
                    None => Vec::new(),
                };
                for var in user_template.variables()? {
                    if !keys.contains(&var) {
                        keys.push(var);
                    }
                }
                keys
            }
        };
        Ok(LlmAgent {
            name: self.name,
            description: self.description,
            llm: self.llm,
            system_template: self.system_template,
            user_template,
            input_keys,
            defaults: self.defaults,
            output_key: self.output_key,
            json_output: self.json_output,
            tools: self.tools,
            max_tool_rounds: self.max_tool_rounds,
            retriever: self.retriever,
            chat_memory: self.chat_memory,
            async_mode: self.async_mode,
            recovery: RecoveryEngine::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, ScriptedLlmClient};
    use crate::memory::Role;
    use crate::rag::InMemoryRetriever;
    use crate::tools::{EchoTool, ToolRegistry};
    use serde_json::json;

    fn scope_with(args: Value) -> Arc<AgenticScope> {
        Arc::new(AgenticScope::from_args(
            args.as_object().cloned().unwrap_or_default(),
        ))
    }

    #[test]
    fn test_parse_model_reply() {
        assert!(matches!(
            parse_model_reply("Plain answer").unwrap(),
            ModelReply::Final(t) if t == "Plain answer"
        ));
        assert!(matches!(
            parse_model_reply("```json\n{\"tool\": \"echo\", \"args\": {\"text\": \"x\"}}\n```").unwrap(),
            ModelReply::ToolCall(c) if c.tool == "echo"
        ));
        assert!(matches!(
            parse_model_reply("{\"score\": 0.9}").unwrap(),
            ModelReply::Final(_)
        ));
        assert!(matches!(
            parse_model_reply("{\"tool\": \"echo\""),
            Err(AgentError::JsonParseError(_))
        ));
    }

    #[tokio::test]
    async fn test_inputs_derived_from_templates() {
        let agent = LlmAgent::builder("tailor", Arc::new(MockLlmClient))
            .system_message("You tailor CVs for {{jobDescription}}.")
            .user_message("Here is the CV: {{cv}} for {{jobDescription}}")
            .output_key("cv")
            .build()
            .unwrap();
        assert_eq!(agent.input_keys(), vec!["jobDescription", "cv"]);

        let scope = scope_with(json!({"cv": "draft", "jobDescription": "backend"}));
        let out = agent.invoke(&scope).await.unwrap();
        assert_eq!(out, json!("Echo from Mock: Here is the CV: draft for backend"));
        assert_eq!(scope.read::<String>("cv").unwrap(), "Echo from Mock: Here is the CV: draft for backend");
        assert_eq!(scope.history().len(), 2);
        assert_eq!(scope.history()[0].agent, "tailor");
    }

    #[tokio::test]
    async fn test_missing_input() {
        let agent = LlmAgent::builder("tailor", Arc::new(MockLlmClient))
            .user_message("{{cv}}")
            .output_key("cv")
            .build()
            .unwrap();
        let err = agent.invoke(&scope_with(json!({}))).await.unwrap_err();
        assert!(matches!(err, AgentError::MissingInput { key, .. } if key == "cv"));
    }

    #[tokio::test]
    async fn test_structured_output_retries_once() {
        let llm = Arc::new(ScriptedLlmClient::new([
            "I think it is good",
            "```json\n{\"score\": 0.9, \"feedback\": \"strong\"}\n```",
        ]));
        let agent = LlmAgent::builder("scorer", llm.clone())
            .user_message("Score {{cv}}")
            .output_key("review")
            .json_output(true)
            .build()
            .unwrap();
        let scope = scope_with(json!({"cv": "draft"}));
        agent.invoke(&scope).await.unwrap();
        assert_eq!(scope.read_value("review").unwrap()["score"], json!(0.9));
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_tool_loop_feeds_observation_back() {
        let llm = Arc::new(ScriptedLlmClient::new([
            "{\"tool\": \"echo\", \"args\": {\"text\": \"Tuesday 3pm\"}}",
            "{\"tool\": \"book_room\", \"args\": {}}",
            "Booked for Tuesday 3pm",
        ]));
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let agent = LlmAgent::builder("organizer", llm.clone())
            .user_message("Organize a meeting about {{topic}}")
            .output_key("response")
            .tools(Arc::new(ToolExecutor::new(registry, 5)))
            .build()
            .unwrap();

        let scope = scope_with(json!({"topic": "hiring"}));
        let out = agent.invoke(&scope).await.unwrap();
        assert_eq!(out, json!("Booked for Tuesday 3pm"));

        let calls = llm.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0][0].content.contains("\"echo\""));
        assert_eq!(calls[1].last().unwrap().content, "Observation from echo: Tuesday 3pm");
        assert!(calls[2].last().unwrap().content.contains("book_room"));
    }

    #[tokio::test]
    async fn test_tool_rounds_are_bounded() {
        let llm = Arc::new(ScriptedLlmClient::with_responder(|_| {
            Ok("{\"tool\": \"echo\", \"args\": {\"text\": \"again\"}}".to_string())
        }));
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let agent = LlmAgent::builder("looper", llm.clone())
            .user_message("go")
            .tools(Arc::new(ToolExecutor::new(registry, 5)))
            .max_tool_rounds(2)
            .build()
            .unwrap();
        let err = agent.invoke(&scope_with(json!({}))).await.unwrap_err();
        assert!(matches!(err, AgentError::ToolExecutionFailed(_)));
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn test_retrieval_augments_user_message() {
        let llm = Arc::new(ScriptedLlmClient::new(["Closed on Sundays"]));
        let retriever = Arc::new(InMemoryRetriever::from_documents(
            ["The office is closed on Sundays.", "Parking is free."],
            1,
        ));
        let agent = LlmAgent::builder("assistant", llm.clone())
            .user_message("{{question}}")
            .output_key("answer")
            .retriever(retriever)
            .build()
            .unwrap();
        agent
            .invoke(&scope_with(json!({"question": "Is the office open on Sundays?"})))
            .await
            .unwrap();
        let sent = &llm.calls()[0][0].content;
        assert!(sent.contains("Answer using the following information:"));
        assert!(sent.contains("closed on Sundays"));
        assert!(!sent.contains("Parking"));
    }

    #[tokio::test]
    async fn test_chat_memory_is_partitioned_by_memory_id() {
        let llm = Arc::new(ScriptedLlmClient::with_responder(|messages| {
            Ok(format!("seen {}", messages.len()))
        }));
        let memory = Arc::new(ChatMemoryStore::new(10));
        let agent = LlmAgent::builder("proposer", llm.clone())
            .user_message("Propose a slot for {{meetingTopic}}")
            .output_key("proposal")
            .chat_memory(memory.clone())
            .build()
            .unwrap();

        let first = Arc::new(
            AgenticScope::from_args(json!({"meetingTopic": "onboarding"}).as_object().cloned().unwrap_or_default())
                .with_memory_id("alice"),
        );
        assert_eq!(agent.invoke(&first).await.unwrap(), json!("seen 1"));
        assert_eq!(agent.invoke(&first).await.unwrap(), json!("seen 3"));

        let other = scope_with(json!({"meetingTopic": "onboarding", "memoryId": "bob"}));
        assert_eq!(agent.invoke(&other).await.unwrap(), json!("seen 1"));
        assert_eq!(memory.messages("alice").len(), 4);
        assert_eq!(memory.messages("bob")[1].role, Role::Assistant);
    }
}
