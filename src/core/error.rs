//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 RetryWithPrompt / ReportToSupervisor / Abort。

use thiserror::Error;

/// 工作流执行过程中可能出现的错误（输入缺失、类型不符、子智能体失败、外部协作者失败等）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 智能体声明的输入 key 在 scope 中不存在且没有默认值
    #[error("Agent '{agent}' is missing input '{key}'")]
    MissingInput { agent: String, key: String },

    /// 直接读取 scope 中不存在的 key（未提供默认值）
    #[error("Key '{0}' not found in agentic scope")]
    MissingKey(String),

    /// scope 中存储的值与读取方期望的类型不一致
    #[error("Type mismatch for key '{key}': expected {expected} ({detail})")]
    TypeMismatch {
        key: String,
        expected: String,
        detail: String,
    },

    /// 组合智能体的子智能体失败，保留原始错误
    #[error("Agent '{agent}' failed while running child '{child}': {source}")]
    ChildFailure {
        agent: String,
        child: String,
        #[source]
        source: Box<AgentError>,
    },

    /// 监督者在步数预算内无法取得进展
    #[error("Supervisor '{agent}' made no progress after {steps} steps: {last_error}")]
    SupervisorStalled {
        agent: String,
        steps: usize,
        last_error: String,
    },

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Hallucinated tool: {0}")]
    HallucinatedTool(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Retrieval error: {0}")]
    RetrievalError(String),

    /// 人在回路：展示或读取人工输入失败
    #[error("Human input error: {0}")]
    HumanInput(String),

    /// 异步任务 panic 或被中止
    #[error("Task join error: {0}")]
    Join(String),

    /// 工作池已关闭，无法再提交任务
    #[error("Worker pool '{0}' is shut down")]
    PoolShutdown(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl AgentError {
    /// 包装为 ChildFailure，记录组合智能体与出错的子智能体名
    pub fn in_child(self, agent: &str, child: &str) -> Self {
        AgentError::ChildFailure {
            agent: agent.to_string(),
            child: child.to_string(),
            source: Box::new(self),
        }
    }

    /// 沿 ChildFailure 链找到最初的错误
    pub fn root_cause(&self) -> &AgentError {
        match self {
            AgentError::ChildFailure { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone)]
pub enum RecoveryAction {
    /// 将提示注入下一轮，让 LLM 重试（如 JSON 格式错误）
    RetryWithPrompt(String),
    /// 作为信息反馈给监督者，由其决定下一步
    ReportToSupervisor(String),
    /// 终止当前任务
    Abort,
}
