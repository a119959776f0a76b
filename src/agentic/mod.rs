//! 智能体编排核心
//!
//! 叶子单元（LlmAgent / FunctionAgent / ScopeAction / HumanInTheLoop）与组合单元
//! （Sequential / Parallel / Conditional / Loop / Supervisor）都实现 Agent，共享同一个 AgenticScope。
//! AgenticRunner 负责准备 scope 并调用根智能体。

pub mod agent;
pub mod conditional;
pub mod function;
pub mod human;
pub mod llm_agent;
pub mod loop_;
pub mod parallel;
pub mod persistence;
pub mod projection;
pub mod runner;
pub mod scope;
pub mod sequence;
pub mod supervisor;
pub mod template;

pub use agent::{Agent, AgentEvent, ScopePredicate};
pub use conditional::{ConditionalAgent, ConditionalAgentBuilder};
pub use function::{FunctionAgent, FunctionAgentBuilder, Inputs, ScopeAction};
pub use human::{HumanInTheLoop, HumanInTheLoopBuilder};
pub use llm_agent::{LlmAgent, LlmAgentBuilder, ModelReply, ToolCall};
pub use loop_::{LoopAgent, LoopAgentBuilder, LoopOutcome};
pub use parallel::{ParallelAgent, ParallelAgentBuilder};
pub use persistence::ScopePersistence;
pub use projection::{OutputProjection, ResultWithScope};
pub use runner::AgenticRunner;
pub use scope::{AgentInvocation, AgentMessage, AgenticScope, ScopeRegistry};
pub use sequence::{SequentialAgent, SequentialAgentBuilder};
pub use supervisor::{
    AgentDecision, SupervisorAgent, SupervisorAgentBuilder, SupervisorContextStrategy, SupervisorReport,
    SupervisorResponseStrategy,
};
pub use template::PromptTemplate;
