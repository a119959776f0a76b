//! LLM 客户端抽象
//!
//! 编排核心只依赖 LlmClient：给定消息序列返回一段文本。

use async_trait::async_trait;
use serde::Serialize;

use crate::memory::Message;

/// 累计 token 用量快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt + self.completion
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 不统计用量的后端返回零值
    fn usage(&self) -> TokenUsage {
        TokenUsage::default()
    }
}
