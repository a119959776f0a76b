//! Mock LLM 客户端（用于测试与无 API Key 的演示）
//!
//! MockLlmClient 回显最后一条 User 消息；ScriptedLlmClient 按脚本依次返回预设回复，或交给闭包按消息内容生成回复，
//! 并记录每次收到的消息供测试断言。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::memory::{Message, Role};

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(format!("Echo from Mock: {}", last_user))
    }
}

type Responder = Box<dyn Fn(&[Message]) -> Result<String, String> + Send + Sync>;

enum Script {
    Queue(Mutex<VecDeque<String>>),
    Responder(Responder),
}

/// 脚本化客户端
pub struct ScriptedLlmClient {
    script: Script,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    /// 依次返回 responses 中的回复；用完后返回错误
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Script::Queue(Mutex::new(responses.into_iter().map(Into::into).collect())),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 由闭包根据收到的消息生成回复（并发场景下不依赖调用顺序）
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&[Message]) -> Result<String, String> + Send + Sync + 'static,
    {
        Self {
            script: Script::Responder(Box::new(responder)),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 已收到的全部请求
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(messages.to_vec());

        match &self.script {
            Script::Queue(queue) => queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .ok_or_else(|| "scripted responses exhausted".to_string()),
            Script::Responder(responder) => responder(messages),
        }
    }
}
