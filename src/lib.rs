//! Agentflow - Rust 智能体工作流编排核心
//!
//! 模块划分：
//! - **agentic**: AgenticScope、Agent trait、生成式 / 确定性 / 人在回路单元，顺序 / 并行 / 条件 / 循环 / 监督者组合，运行入口
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、恢复引擎、工作池
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock / Scripted）
//! - **memory**: 对话消息、按 memory id 分区的对话记忆
//! - **observability**: tracing 日志初始化
//! - **rag**: 检索增强（内容检索器）
//! - **tools**: 工具注册表、带超时与审计日志的执行器

pub mod agentic;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod rag;
pub mod tools;

pub use agentic::{
    Agent, AgenticRunner, AgenticScope, ConditionalAgent, FunctionAgent, HumanInTheLoop, LlmAgent, LoopAgent,
    LoopOutcome, OutputProjection, ParallelAgent, ResultWithScope, ScopeAction, SequentialAgent, SupervisorAgent,
};
pub use core::AgentError;
