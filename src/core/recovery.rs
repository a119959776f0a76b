//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供生成式智能体的工具循环与监督者决定是重试、反馈还是终止。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作（重试提示 / 反馈给监督者 / 终止）
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 根据错误类型返回建议的恢复动作
    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err.root_cause() {
            AgentError::JsonParseError(raw) => RecoveryAction::RetryWithPrompt(format!(
                "The previous output was not valid JSON: {raw}. \
                Reply with exactly one JSON object and nothing else, without markdown fences."
            )),
            AgentError::HallucinatedTool(name) => RecoveryAction::RetryWithPrompt(format!(
                "Tool '{name}' does not exist. Use only the tools listed in the system prompt."
            )),
            AgentError::MissingInput { agent, key } => RecoveryAction::ReportToSupervisor(format!(
                "Agent '{agent}' could not run because '{key}' is missing. Provide it in the arguments."
            )),
            AgentError::TypeMismatch { key, expected, .. } => {
                RecoveryAction::ReportToSupervisor(format!(
                    "Value for '{key}' has the wrong shape, expected {expected}."
                ))
            }
            AgentError::ToolExecutionFailed(msg) => {
                RecoveryAction::ReportToSupervisor(format!("Tool execution failed: {msg}"))
            }
            AgentError::ToolTimeout(tool) => {
                RecoveryAction::ReportToSupervisor(format!("Tool '{tool}' timed out."))
            }
            AgentError::LlmError(msg) | AgentError::RetrievalError(msg) => {
                RecoveryAction::ReportToSupervisor(msg.clone())
            }
            _ => RecoveryAction::Abort,
        }
    }
}
