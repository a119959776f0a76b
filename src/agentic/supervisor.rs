//! 监督者：由模型逐步决定下一个要调用的子智能体，直到选择 `done`
//!
//! 每一步向模型发送：规划 system prompt（子智能体清单 + 可选策略文本）、用户请求，以及按上下文策略构造的进展
//! （近期决策对话窗口、模型生成的进展摘要，或两者）。模型回复 JSON：
//! `{"agentName": "...", "arguments": {...}, "response": "..."}`。
//!
//! 子智能体严格一个接一个执行（异步子智能体也会被等待）。子智能体出错时经 RecoveryEngine 转成信息反馈给模型，
//! 连续失败达到上限返回 SupervisorStalled。调用次数用尽时按响应策略返回已有结果。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::agentic::agent::{record_composite, resolve_inputs, run_child};
use crate::agentic::llm_agent::parse_json_reply;
use crate::agentic::projection::project_result;
use crate::agentic::scope::{conversation_of, value_to_text};
use crate::agentic::{Agent, AgentEvent, AgenticScope, OutputProjection};
use crate::config::WorkflowSection;
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::llm::LlmClient;
use crate::memory::Message;

/// 终止用的伪智能体名
pub const DONE_AGENT: &str = "done";

/// 调用时可覆盖策略文本的 scope key
pub const SUPERVISOR_CONTEXT_KEY: &str = "supervisorContext";

/// 模型对下一步的决定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDecision {
    pub agent_name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

/// 每次规划时提供给模型的进展信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SupervisorContextStrategy {
    /// 近期决策与结果的原始消息窗口
    #[default]
    ChatMemory,
    /// 由模型生成的子智能体交互摘要
    Summarization,
    ChatMemoryAndSummarization,
}

/// 结束时返回什么
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SupervisorResponseStrategy {
    /// 最后一个子智能体的输出
    #[default]
    Last,
    /// `done` 决策附带的总结；为空时由模型生成
    Summary,
    /// 由评分模型在 Last 与 Summary 之间择优
    Scored,
}

#[derive(Debug, Deserialize)]
struct ResponseScores {
    score1: f64,
    score2: f64,
}

/// 一次监督执行的完整结果
#[derive(Debug, Clone)]
pub struct SupervisorReport {
    pub output: Value,
    pub decisions: Vec<AgentDecision>,
    /// 实际调用子智能体的次数
    pub invocations: usize,
}

pub struct SupervisorAgent {
    name: String,
    description: String,
    llm: Arc<dyn LlmClient>,
    children: Vec<Arc<dyn Agent>>,
    max_agent_invocations: usize,
    max_consecutive_failures: usize,
    context_window: usize,
    context_strategy: SupervisorContextStrategy,
    response_strategy: SupervisorResponseStrategy,
    supervisor_context: Option<String>,
    request_key: String,
    output_key: Option<String>,
    projection: Option<OutputProjection>,
    recovery: RecoveryEngine,
}

/// 单次执行中的可变状态
struct Progress {
    dialogue: Vec<Message>,
    decisions: Vec<AgentDecision>,
    invocations: usize,
    consecutive_failures: usize,
    last_output: Option<Value>,
    last_error: Option<String>,
    done_response: Option<String>,
}

impl SupervisorAgent {
    pub fn builder(name: impl Into<String>, llm: Arc<dyn LlmClient>) -> SupervisorAgentBuilder {
        SupervisorAgentBuilder {
            name: name.into(),
            description: String::new(),
            llm,
            children: Vec::new(),
            max_agent_invocations: 10,
            max_consecutive_failures: 3,
            context_window: 10,
            context_strategy: SupervisorContextStrategy::default(),
            response_strategy: SupervisorResponseStrategy::default(),
            supervisor_context: None,
            request_key: "request".to_string(),
            output_key: None,
            projection: None,
        }
    }

    fn child(&self, name: &str) -> Option<&Arc<dyn Agent>> {
        self.children.iter().find(|c| c.name() == name)
    }

    fn planner_prompt(&self, policy: Option<&str>) -> String {
        let agents = self
            .children
            .iter()
            .map(|c| {
                format!(
                    "- {}: {} [inputs: {}]",
                    c.name(),
                    c.description(),
                    c.input_keys().join(", ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let mut prompt = format!(
            "You are a planner that coordinates a set of agents. You know nothing about any domain and \
             make no assumptions about the user request: the only thing you can do is rely on the agents.\n\
             Decide which agent to invoke next to address the request, and with which arguments. \
             Invoke one agent at a time.\n\
             Reply with exactly one JSON object: \
             {{\"agentName\": \"<agent name>\", \"arguments\": {{\"<input>\": <value>}}}}.\n\
             When the request is fully addressed, reply with \
             {{\"agentName\": \"{DONE_AGENT}\", \"response\": \"<summary of the final answer>\"}}.\n\
             The available agents are:\n{agents}"
        );
        if let Some(policy) = policy.filter(|p| !p.trim().is_empty()) {
            prompt.push_str("\n\n");
            prompt.push_str(policy);
        }
        prompt
    }

    fn children_conversation(&self, scope: &AgenticScope, since: chrono::DateTime<Utc>) -> String {
        let names: HashSet<&str> = self.children.iter().map(|c| c.name()).collect();
        let invocations: Vec<_> = scope
            .invocations()
            .into_iter()
            .filter(|inv| inv.at >= since && names.contains(inv.agent.as_str()))
            .collect();
        conversation_of(&invocations)
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, AgentError> {
        self.llm.complete(messages).await.map_err(AgentError::LlmError)
    }

    async fn summarize(&self, request: &str, conversation: &str) -> Result<String, AgentError> {
        self.complete(&[
            Message::system(
                "You summarize the interactions between a user and a set of agents. \
                 Keep every fact needed to continue working on the request.",
            ),
            Message::user(format!("Request: {request}\n\nInteractions:\n{conversation}")),
        ])
        .await
    }

    fn planning_messages(
        &self,
        policy: Option<&str>,
        request: &str,
        progress: &Progress,
        summary: Option<&str>,
    ) -> Vec<Message> {
        let mut messages = vec![
            Message::system(self.planner_prompt(policy)),
            Message::user(format!("The user request is: {request}")),
        ];
        if matches!(
            self.context_strategy,
            SupervisorContextStrategy::ChatMemory | SupervisorContextStrategy::ChatMemoryAndSummarization
        ) {
            let start = progress.dialogue.len().saturating_sub(self.context_window);
            messages.extend(progress.dialogue[start..].iter().cloned());
        }
        if let Some(summary) = summary {
            messages.push(Message::user(format!("Summary of the work done so far:\n{summary}")));
        }
        messages
    }

    fn stalled(&self, progress: &Progress) -> AgentError {
        AgentError::SupervisorStalled {
            agent: self.name.clone(),
            steps: progress.invocations,
            last_error: progress
                .last_error
                .clone()
                .unwrap_or_else(|| "no agent produced a result".to_string()),
        }
    }

    /// 记一次失败，并把提示反馈给模型；连续失败达到上限返回 SupervisorStalled
    fn note_failure(&self, progress: &mut Progress, reply: String, feedback: String) -> Result<(), AgentError> {
        progress.consecutive_failures += 1;
        progress.last_error = Some(feedback.clone());
        progress.dialogue.push(Message::assistant(reply));
        progress.dialogue.push(Message::user(feedback));
        if progress.consecutive_failures >= self.max_consecutive_failures {
            return Err(self.stalled(progress));
        }
        Ok(())
    }

    /// 执行监督循环并返回完整报告
    pub async fn execute(&self, scope: &Arc<AgenticScope>) -> Result<SupervisorReport, AgentError> {
        let inputs = resolve_inputs(&self.name, &[self.request_key.clone()], &Map::new(), scope)?;
        let request = inputs
            .get(&self.request_key)
            .map(value_to_text)
            .unwrap_or_default();
        let policy = scope
            .read_value(SUPERVISOR_CONTEXT_KEY)
            .map(|v| value_to_text(&v))
            .or_else(|| self.supervisor_context.clone());
        let started = Utc::now();
        let summarize_context = !matches!(self.context_strategy, SupervisorContextStrategy::ChatMemory);

        info!(agent = %self.name, children = self.children.len(), budget = self.max_agent_invocations, "supervisor start");
        let mut progress = Progress {
            dialogue: Vec::new(),
            decisions: Vec::new(),
            invocations: 0,
            consecutive_failures: 0,
            last_output: None,
            last_error: None,
            done_response: None,
        };

        let mut finished = false;
        while progress.invocations < self.max_agent_invocations {
            let summary = if summarize_context && progress.invocations > 0 {
                let conversation = self.children_conversation(scope, started);
                Some(self.summarize(&request, &conversation).await?)
            } else {
                None
            };
            let messages = self.planning_messages(policy.as_deref(), &request, &progress, summary.as_deref());
            let reply = self.complete(&messages).await?;

            let decision = parse_json_reply(&reply).and_then(|v| {
                serde_json::from_value::<AgentDecision>(v.clone())
                    .map_err(|e| AgentError::JsonParseError(format!("{e}: {v}")))
            });
            let decision = match decision {
                Ok(decision) => decision,
                Err(e) => {
                    let feedback = match self.recovery.handle(&e) {
                        RecoveryAction::RetryWithPrompt(hint) => hint,
                        _ => return Err(e),
                    };
                    warn!(agent = %self.name, error = %e, "invalid supervisor decision");
                    self.note_failure(&mut progress, reply, feedback)?;
                    continue;
                }
            };

            debug!(agent = %self.name, next = %decision.agent_name, "supervisor decision");
            scope.emit(AgentEvent::SupervisorDecision {
                agent: self.name.clone(),
                next: decision.agent_name.clone(),
                arguments: Value::Object(decision.arguments.clone()),
            });
            progress.decisions.push(decision.clone());

            if decision.agent_name == DONE_AGENT {
                progress.done_response = decision.response.clone();
                finished = true;
                break;
            }

            let Some(child) = self.child(&decision.agent_name) else {
                let feedback = format!(
                    "Agent '{}' does not exist. Available agents: {}.",
                    decision.agent_name,
                    self.children.iter().map(|c| c.name()).collect::<Vec<_>>().join(", ")
                );
                self.note_failure(&mut progress, reply, feedback)?;
                continue;
            };

            scope.write_all(decision.arguments.clone());
            progress.invocations += 1;
            match run_child(&self.name, child, scope).await {
                Ok(output) => {
                    progress.consecutive_failures = 0;
                    scope.append_message(&self.name, Message::assistant(reply.clone()));
                    progress.dialogue.push(Message::assistant(reply));
                    progress.dialogue.push(Message::user(format!(
                        "Agent '{}' returned: {}",
                        child.name(),
                        value_to_text(&output)
                    )));
                    progress.last_output = Some(output);
                }
                Err(e) => {
                    let feedback = match self.recovery.handle(&e) {
                        RecoveryAction::RetryWithPrompt(msg) | RecoveryAction::ReportToSupervisor(msg) => msg,
                        RecoveryAction::Abort => return Err(e),
                    };
                    warn!(agent = %self.name, child = child.name(), error = %e, "sub-agent failed");
                    self.note_failure(
                        &mut progress,
                        reply,
                        format!("Agent '{}' failed: {feedback}", child.name()),
                    )?;
                }
            }
        }

        if !finished {
            warn!(agent = %self.name, invocations = progress.invocations, "supervisor invocation budget exhausted");
            if progress.last_output.is_none() {
                return Err(self.stalled(&progress));
            }
        }

        let response = self.respond(scope, &request, started, &progress).await?;
        let output = match &self.projection {
            Some(_) => project_result(scope, self.output_key.as_deref(), self.projection.as_ref())?,
            None => {
                if let Some(key) = &self.output_key {
                    scope.write_value(key, response.clone());
                }
                response
            }
        };
        record_composite(scope, &self.name, &output);
        info!(agent = %self.name, invocations = progress.invocations, "supervisor done");

        Ok(SupervisorReport {
            output,
            decisions: progress.decisions,
            invocations: progress.invocations,
        })
    }

    async fn summary_response(
        &self,
        scope: &AgenticScope,
        request: &str,
        started: chrono::DateTime<Utc>,
        progress: &Progress,
    ) -> Result<String, AgentError> {
        match progress.done_response.as_deref().filter(|r| !r.trim().is_empty()) {
            Some(response) => Ok(response.to_string()),
            None => {
                let conversation = self.children_conversation(scope, started);
                self.summarize(request, &conversation).await
            }
        }
    }

    async fn respond(
        &self,
        scope: &AgenticScope,
        request: &str,
        started: chrono::DateTime<Utc>,
        progress: &Progress,
    ) -> Result<Value, AgentError> {
        match self.response_strategy {
            SupervisorResponseStrategy::Last => Ok(progress
                .last_output
                .clone()
                .unwrap_or_else(|| Value::String(progress.done_response.clone().unwrap_or_default()))),
            SupervisorResponseStrategy::Summary => Ok(Value::String(
                self.summary_response(scope, request, started, progress).await?,
            )),
            SupervisorResponseStrategy::Scored => {
                let summary = self.summary_response(scope, request, started, progress).await?;
                let Some(last) = progress.last_output.clone() else {
                    return Ok(Value::String(summary));
                };
                let reply = self
                    .complete(&[
                        Message::system(
                            "You score candidate responses to a user request. \
                             Reply with exactly one JSON object {\"score1\": <number>, \"score2\": <number>} \
                             with scores between 0.0 and 1.0.",
                        ),
                        Message::user(format!(
                            "Request: {request}\n\nResponse 1:\n{summary}\n\nResponse 2:\n{}",
                            value_to_text(&last)
                        )),
                    ])
                    .await?;
                let scores: ResponseScores = serde_json::from_value(parse_json_reply(&reply)?)
                    .map_err(|e| AgentError::JsonParseError(format!("{e}: {reply}")))?;
                debug!(agent = %self.name, summary = scores.score1, last = scores.score2, "scored responses");
                if scores.score1 > scores.score2 {
                    Ok(Value::String(summary))
                } else {
                    Ok(last)
                }
            }
        }
    }
}

#[async_trait]
impl Agent for SupervisorAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_keys(&self) -> Vec<String> {
        vec![self.request_key.clone()]
    }

    fn output_key(&self) -> Option<&str> {
        self.output_key.as_deref()
    }

    fn is_composite(&self) -> bool {
        true
    }

    async fn invoke(&self, scope: &Arc<AgenticScope>) -> Result<Value, AgentError> {
        self.execute(scope).await.map(|report| report.output)
    }
}

pub struct SupervisorAgentBuilder {
    name: String,
    description: String,
    llm: Arc<dyn LlmClient>,
    children: Vec<Arc<dyn Agent>>,
    max_agent_invocations: usize,
    max_consecutive_failures: usize,
    context_window: usize,
    context_strategy: SupervisorContextStrategy,
    response_strategy: SupervisorResponseStrategy,
    supervisor_context: Option<String>,
    request_key: String,
    output_key: Option<String>,
    projection: Option<OutputProjection>,
}

impl SupervisorAgentBuilder {
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

    /// 最多调用子智能体的次数
    pub fn max_agent_invocations(mut self, n: usize) -> Self {
        self.max_agent_invocations = n;
        self
    }

    /// 连续多少次无效决策或子智能体失败后放弃
    pub fn max_consecutive_failures(mut self, n: usize) -> Self {
        self.max_consecutive_failures = n;
        self
    }

    /// ChatMemory 策略保留的消息条数
    pub fn context_window(mut self, n: usize) -> Self {
        self.context_window = n;
        self
    }

    pub fn context_strategy(mut self, strategy: SupervisorContextStrategy) -> Self {
        self.context_strategy = strategy;
        self
    }

    pub fn response_strategy(mut self, strategy: SupervisorResponseStrategy) -> Self {
        self.response_strategy = strategy;
        self
    }

    /// 附加到规划 prompt 的策略文本（如 "Always check HR first"）
    pub fn supervisor_context(mut self, context: impl Into<String>) -> Self {
        self.supervisor_context = Some(context.into());
        self
    }

    pub fn request_key(mut self, key: impl Into<String>) -> Self {
        self.request_key = key.into();
        self
    }

    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    /// 设置后覆盖响应策略
    pub fn output(mut self, projection: OutputProjection) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn defaults(self, workflow: &WorkflowSection) -> Self {
        self.max_agent_invocations(workflow.supervisor_max_invocations)
            .context_window(workflow.supervisor_context_window)
    }

    pub fn build(self) -> Result<SupervisorAgent, AgentError> {
        if self.children.is_empty() {
            return Err(AgentError::InvalidConfiguration(format!(
                "supervisor '{}' has no sub-agents",
                self.name
            )));
        }
        let mut names = HashSet::new();
        for child in &self.children {
            if child.name() == DONE_AGENT || !names.insert(child.name().to_string()) {
                return Err(AgentError::InvalidConfiguration(format!(
                    "supervisor '{}': sub-agent name '{}' is reserved or duplicated",
                    self.name,
                    child.name()
                )));
            }
            if child.is_async() {
                warn!(
                    agent = %self.name,
                    child = child.name(),
                    "async sub-agent will run synchronously under a supervisor"
                );
            }
        }
        Ok(SupervisorAgent {
            name: self.name,
            description: self.description,
            llm: self.llm,
            children: self.children,
            max_agent_invocations: self.max_agent_invocations.max(1),
            max_consecutive_failures: self.max_consecutive_failures.max(1),
            context_window: self.context_window,
            context_strategy: self.context_strategy,
            response_strategy: self.response_strategy,
            supervisor_context: self.supervisor_context,
            request_key: self.request_key,
            output_key: self.output_key,
            projection: self.projection,
            recovery: RecoveryEngine::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentic::FunctionAgent;
    use crate::llm::ScriptedLlmClient;
    use serde_json::json;

    fn hr_reviewer() -> Arc<dyn Agent> {
        Arc::new(
            FunctionAgent::builder("hrReviewer")
                .description("Reviews a CV against HR requirements")
                .input_key("cv")
                .output_key("hrReview")
                .build(|inputs| Ok(json!({"score": 0.9, "cv": inputs.get::<String>("cv")?})))
                .unwrap(),
        )
    }

    fn emailer() -> Arc<dyn Agent> {
        Arc::new(
            FunctionAgent::builder("emailAssistant")
                .description("Sends an email to the candidate")
                .input_key("candidate")
                .output_key("email")
                .build(|inputs| Ok(format!("Invitation sent to {}", inputs.get::<String>("candidate")?)))
                .unwrap(),
        )
    }

    fn request_scope() -> Arc<AgenticScope> {
        let scope = Arc::new(AgenticScope::new());
        scope.write("request", "Evaluate Ada and invite her").unwrap();
        scope
    }

    #[tokio::test]
    async fn test_steps_one_agent_at_a_time_until_done() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"agentName": "hrReviewer", "arguments": {"cv": "Ada CV"}}"#,
            r#"{"agentName": "emailAssistant", "arguments": {"candidate": "Ada"}}"#,
            r#"{"agentName": "done", "response": "Ada was reviewed and invited"}"#,
        ]));
        let supervisor = SupervisorAgent::builder("hiring", llm.clone())
            .sub_agents([hr_reviewer(), emailer()])
            .supervisor_context("Policy: Always check HR first.")
            .output_key("decision")
            .build()
            .unwrap();
        let scope = request_scope();
        let report = supervisor.execute(&scope).await.unwrap();

        assert_eq!(report.invocations, 2);
        assert_eq!(report.decisions.len(), 3);
        assert_eq!(report.output, json!("Invitation sent to Ada"));
        assert_eq!(scope.read::<String>("decision").unwrap(), "Invitation sent to Ada");
        assert_eq!(scope.read_value("hrReview").unwrap()["score"], json!(0.9));

        let calls = llm.calls();
        assert!(calls[0][0].content.contains("hrReviewer: Reviews a CV"));
        assert!(calls[0][0].content.contains("Always check HR first"));
        assert!(calls[1].iter().any(|m| m.content.starts_with("Agent 'hrReviewer' returned")));
    }

    #[tokio::test]
    async fn test_unknown_agent_and_child_error_are_fed_back() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"agentName": "calendar", "arguments": {}}"#,
            r#"{"agentName": "emailAssistant", "arguments": {}}"#,
            r#"{"agentName": "emailAssistant", "arguments": {"candidate": "Ada"}}"#,
            r#"{"agentName": "done", "response": "invited"}"#,
        ]));
        let supervisor = SupervisorAgent::builder("hiring", llm.clone())
            .sub_agents([hr_reviewer(), emailer()])
            .response_strategy(SupervisorResponseStrategy::Summary)
            .build()
            .unwrap();
        let report = supervisor.execute(&request_scope()).await.unwrap();
        assert_eq!(report.output, json!("invited"));

        let calls = llm.calls();
        assert!(calls[1].iter().any(|m| m.content.contains("'calendar' does not exist")));
        assert!(calls[2].iter().any(|m| m.content.contains("'candidate' is missing")));
    }

    #[tokio::test]
    async fn test_stalls_after_consecutive_failures() {
        let llm = Arc::new(ScriptedLlmClient::with_responder(|_| {
            Ok("I am not sure what to do".to_string())
        }));
        let supervisor = SupervisorAgent::builder("hiring", llm)
            .sub_agent(hr_reviewer())
            .max_consecutive_failures(2)
            .build()
            .unwrap();
        let err = supervisor.execute(&request_scope()).await.unwrap_err();
        assert!(matches!(err, AgentError::SupervisorStalled { steps: 0, .. }));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_returns_last_output() {
        let llm = Arc::new(ScriptedLlmClient::with_responder(|_| {
            Ok(r#"{"agentName": "hrReviewer", "arguments": {"cv": "Ada CV"}}"#.to_string())
        }));
        let supervisor = SupervisorAgent::builder("hiring", llm.clone())
            .sub_agent(hr_reviewer())
            .max_agent_invocations(2)
            .build()
            .unwrap();
        let report = supervisor.execute(&request_scope()).await.unwrap();
        assert_eq!(report.invocations, 2);
        assert_eq!(report.output["score"], json!(0.9));
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_scored_prefers_higher_score_and_summarizes_context() {
        let llm = Arc::new(ScriptedLlmClient::with_responder(|messages| {
            let system = &messages[0].content;
            if system.starts_with("You summarize") {
                Ok("HR gave Ada 0.9".to_string())
            } else if system.starts_with("You score") {
                Ok(r#"{"score1": 0.8, "score2": 0.3}"#.to_string())
            } else if messages.iter().any(|m| m.content.contains("Summary of the work done so far")) {
                Ok(r#"{"agentName": "done", "response": ""}"#.to_string())
            } else {
                Ok(r#"{"agentName": "hrReviewer", "arguments": {"cv": "Ada CV"}}"#.to_string())
            }
        }));
        let supervisor = SupervisorAgent::builder("hiring", llm)
            .sub_agent(hr_reviewer())
            .context_strategy(SupervisorContextStrategy::Summarization)
            .response_strategy(SupervisorResponseStrategy::Scored)
            .build()
            .unwrap();
        let out = supervisor.invoke(&request_scope()).await.unwrap();
        assert_eq!(out, json!("HR gave Ada 0.9"));
    }

    #[tokio::test]
    async fn test_async_child_completes_before_next_decision() {
        let slow_reviewer: Arc<dyn Agent> = Arc::new(
            FunctionAgent::builder("hrReviewer")
                .description("Reviews a CV against HR requirements")
                .input_key("cv")
                .output_key("hrReview")
                .async_mode(true)
                .build_async(|_| async {
                    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                    Ok(json!({"score": 0.9}))
                })
                .unwrap(),
        );
        let scope = request_scope();
        let observed = Arc::clone(&scope);
        let llm = Arc::new(ScriptedLlmClient::with_responder(move |messages| {
            let saw_result = messages.iter().any(|m| m.content.contains("Agent 'hrReviewer' returned"));
            if !saw_result {
                return Ok(r#"{"agentName": "hrReviewer", "arguments": {"cv": "Ada CV"}}"#.to_string());
            }
            let response = if observed.contains("hrReview") { "reviewed" } else { "pending" };
            Ok(format!(r#"{{"agentName": "done", "response": "{response}"}}"#))
        }));
        let supervisor = SupervisorAgent::builder("hiring", llm.clone())
            .sub_agent(slow_reviewer)
            .build()
            .unwrap();

        let report = supervisor.execute(&scope).await.unwrap();
        assert_eq!(report.invocations, 1);
        assert_eq!(report.decisions[1].response.as_deref(), Some("reviewed"));
        assert_eq!(report.output, json!({"score": 0.9}));
        let second_prompt = &llm.calls()[1];
        assert!(second_prompt
            .iter()
            .any(|m| m.content.contains("Agent 'hrReviewer' returned") && m.content.contains("0.9")));
    }

    #[tokio::test]
    async fn test_missing_request_is_missing_input() {
        let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()));
        let supervisor = SupervisorAgent::builder("hiring", llm)
            .sub_agent(hr_reviewer())
            .build()
            .unwrap();
        let err = supervisor.invoke(&Arc::new(AgenticScope::new())).await.unwrap_err();
        assert!(matches!(err, AgentError::MissingInput { key, .. } if key == "request"));
    }

    #[test]
    fn test_done_is_reserved() {
        let done: Arc<dyn Agent> = Arc::new(
            FunctionAgent::builder(DONE_AGENT).build(|_| Ok(1)).unwrap(),
        );
        let built = SupervisorAgent::builder("hiring", Arc::new(ScriptedLlmClient::new(Vec::<String>::new())))
            .sub_agent(done)
            .build();
        assert!(built.is_err());
    }
}
