//! 按 memory id 分区的对话记忆
//!
//! 生成式智能体挂上 ChatMemoryStore 后，同一 memory id 的多次调用（如循环中的多轮提议）能看到之前的对话。

use std::collections::HashMap;
use std::sync::RwLock;

use crate::config::WorkflowSection;
use crate::memory::{Message, MessageWindow};

/// 每个 memory id 一个消息窗口
#[derive(Debug)]
pub struct ChatMemoryStore {
    max_messages: usize,
    memories: RwLock<HashMap<String, MessageWindow>>,
}

impl ChatMemoryStore {
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages,
            memories: RwLock::new(HashMap::new()),
        }
    }

    /// 窗口大小取 [workflow] chat_memory_window
    pub fn from_config(workflow: &WorkflowSection) -> Self {
        Self::new(workflow.chat_memory_window)
    }

    /// 取某个 memory id 的历史消息（不存在时为空）
    pub fn messages(&self, memory_id: &str) -> Vec<Message> {
        let memories = self.memories.read().unwrap_or_else(|e| e.into_inner());
        memories
            .get(memory_id)
            .map(MessageWindow::to_vec)
            .unwrap_or_default()
    }

    pub fn append(&self, memory_id: &str, messages: impl IntoIterator<Item = Message>) {
        let mut memories = self.memories.write().unwrap_or_else(|e| e.into_inner());
        let memory = memories
            .entry(memory_id.to_string())
            .or_insert_with(|| MessageWindow::with_capacity(self.max_messages));
        memory.extend(messages);
    }

    pub fn clear(&self, memory_id: &str) {
        let mut memories = self.memories.write().unwrap_or_else(|e| e.into_inner());
        memories.remove(memory_id);
    }
}

impl Default for ChatMemoryStore {
    fn default() -> Self {
        Self::from_config(&WorkflowSection::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memories_are_partitioned_by_id() {
        let store = ChatMemoryStore::new(4);
        store.append("user-1", [Message::user("hi"), Message::assistant("Tuesday 3pm?")]);
        store.append("user-2", [Message::user("hello")]);

        assert_eq!(store.messages("user-1").len(), 2);
        assert_eq!(store.messages("user-2").len(), 1);
        assert!(store.messages("user-3").is_empty());

        store.clear("user-1");
        assert!(store.messages("user-1").is_empty());
    }

    #[test]
    fn test_window_size_from_config() {
        let workflow = WorkflowSection {
            chat_memory_window: 2,
            ..WorkflowSection::default()
        };
        let store = ChatMemoryStore::from_config(&workflow);
        store.append(
            "user-1",
            [Message::user("a"), Message::assistant("b"), Message::user("c")],
        );
        let kept: Vec<String> = store.messages("user-1").into_iter().map(|m| m.content).collect();
        assert_eq!(kept, vec!["b", "c"]);
    }
}
