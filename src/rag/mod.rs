//! 检索增强：为生成式智能体提供外部知识片段

pub mod retriever;

pub use retriever::{ContentRetriever, InMemoryRetriever};
