//! 记忆层：对话消息窗口、按 memory id 分区的对话记忆

pub mod chat_memory;
pub mod conversation;

pub use chat_memory::ChatMemoryStore;
pub use conversation::{Message, MessageWindow, Role};
