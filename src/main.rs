//! Agentflow 演示：招聘工作流
//!
//! 三位评审并行打分 → 聚合为综合评分 → 按分数走面试安排或拒信分支。
//! 配置了 OPENAI_API_KEY 时使用真实模型，否则使用内置的离线演示模型。

use std::sync::Arc;

use anyhow::Context;
use serde_json::{json, Map, Value};
use tracing::info;

use agentflow::agentic::{
    Agent, AgenticRunner, ConditionalAgent, FunctionAgent, LlmAgent, OutputProjection, ParallelAgent,
    SequentialAgent,
};
use agentflow::config::{load_config, AppConfig};
use agentflow::llm::{create_llm_from_config, LlmClient, ScriptedLlmClient};
use agentflow::memory::{ChatMemoryStore, Message, Role};
use agentflow::observability;
use agentflow::tools::{EchoTool, ToolExecutor, ToolRegistry};

const CV: &str = "Ada Lovelace. 8 years of Rust and Go backend development, \
                  designed event-driven payment systems, mentors junior engineers.";
const JOB_DESCRIPTION: &str = "Senior backend engineer: distributed systems, Rust, on-call ownership.";

/// 离线演示模型：按 system prompt 返回固定的评审与回复
fn offline_model() -> ScriptedLlmClient {
    ScriptedLlmClient::with_responder(|messages: &[Message]| {
        let system = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let reply = if system.contains("HR") {
            r#"{"score": 0.85, "feedback": "Meets HR requirements"}"#
        } else if system.contains("hiring manager") {
            r#"{"score": 0.9, "feedback": "Strong distributed systems background"}"#
        } else if system.contains("team member") {
            r#"{"score": 0.8, "feedback": "Would fit the team"}"#
        } else if system.contains("organize interviews") {
            "Interview scheduled for Tuesday 3pm."
        } else {
            "Thank you for applying, we will not move forward."
        };
        Ok(reply.to_string())
    })
}

fn reviewer(llm: &Arc<dyn LlmClient>, name: &str, role: &str, output_key: &str) -> anyhow::Result<Arc<dyn Agent>> {
    Ok(Arc::new(
        LlmAgent::builder(name, Arc::clone(llm))
            .description(format!("Reviews a CV from the {role} perspective"))
            .system_message(format!(
                "You are a {role} reviewing a CV for this job: {{{{jobDescription}}}}. \
                 Reply with JSON {{\"score\": <0.0-1.0>, \"feedback\": \"...\"}}."
            ))
            .user_message("CV:\n{{cv}}")
            .output_key(output_key)
            .json_output(true)
            .build()?,
    ))
}

fn hiring_workflow(cfg: &AppConfig, llm: Arc<dyn LlmClient>) -> anyhow::Result<Arc<dyn Agent>> {
    let reviewers: Arc<dyn Agent> = Arc::new(
        ParallelAgent::builder("reviewers")
            .sub_agent(reviewer(&llm, "hrReviewer", "HR specialist", "hrReview")?)
            .sub_agent(reviewer(&llm, "managerReviewer", "hiring manager", "managerReview")?)
            .sub_agent(reviewer(&llm, "teamReviewer", "team member", "teamReview")?)
            .defaults(&cfg.workflow)
            .build()?,
    );

    let aggregator: Arc<dyn Agent> = Arc::new(
        FunctionAgent::builder("scoreAggregator")
            .input_keys(["hrReview", "managerReview", "teamReview"])
            .output_key("combinedScore")
            .build(|inputs| {
                let mut total = 0.0;
                for key in ["hrReview", "managerReview", "teamReview"] {
                    total += inputs.value(key)?["score"].as_f64().unwrap_or_default();
                }
                Ok(total / 3.0)
            })?,
    );

    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    let tools = Arc::new(ToolExecutor::new(registry, cfg.tools.tool_timeout_secs));
    let candidate_memory = Arc::new(ChatMemoryStore::from_config(&cfg.workflow));

    let organizer: Arc<dyn Agent> = Arc::new(
        LlmAgent::builder("interviewOrganizer", Arc::clone(&llm))
            .system_message("You organize interviews for candidates that passed the review.")
            .user_message("Organize an on-site interview for this candidate:\n{{cv}}")
            .output_key("response")
            .tools(tools)
            .max_tool_rounds(cfg.tools.max_tool_rounds)
            .chat_memory(Arc::clone(&candidate_memory))
            .build()?,
    );
    let emailer: Arc<dyn Agent> = Arc::new(
        LlmAgent::builder("emailAssistant", Arc::clone(&llm))
            .system_message("You write polite rejection emails.")
            .user_message("Write a rejection email for this candidate:\n{{cv}}")
            .output_key("response")
            .chat_memory(candidate_memory)
            .build()?,
    );

    let decision: Arc<dyn Agent> = Arc::new(
        ConditionalAgent::builder("decision")
            .sub_agent_when(|scope| Ok(scope.read::<f64>("combinedScore")? >= 0.8), organizer)
            .sub_agent_when(|scope| Ok(scope.read::<f64>("combinedScore")? < 0.8), emailer)
            .build()?,
    );

    Ok(Arc::new(
        SequentialAgent::builder("hiringWorkflow")
            .sub_agents([reviewers, aggregator, decision])
            .output(OutputProjection::compute(|scope| {
                Ok(json!({
                    "combinedScore": scope.read::<f64>("combinedScore")?,
                    "response": scope.read_or("response", Value::Null)?,
                }))
            }))
            .build()?,
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    let remote = cfg.llm.provider.to_lowercase() != "mock" && std::env::var("OPENAI_API_KEY").is_ok();
    let llm: Arc<dyn LlmClient> = if remote {
        create_llm_from_config(&cfg)
    } else {
        info!("OPENAI_API_KEY not set or provider is mock, using offline demo model");
        Arc::new(offline_model())
    };

    let workflow = hiring_workflow(&cfg, Arc::clone(&llm))?;
    let mut args = Map::new();
    args.insert("cv".to_string(), json!(CV));
    args.insert("jobDescription".to_string(), json!(JOB_DESCRIPTION));

    let outcome = AgenticRunner::new()
        .invoke_with_scope(&workflow, args)
        .await
        .context("Hiring workflow failed")?;

    println!("=== Result ===");
    println!("{}", serde_json::to_string_pretty(&outcome.result)?);
    println!("\n=== Context as conversation ===");
    println!("{}", outcome.scope.context_as_conversation());

    let usage = llm.usage();
    info!(prompt = usage.prompt, completion = usage.completion, total = usage.total(), "token usage");
    Ok(())
}
