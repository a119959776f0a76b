//! AgenticScope：一次工作流调用中所有智能体共享的键值状态
//!
//! - 值统一存为 serde_json::Value，写入时不做类型检查；按类型读取时若不匹配返回 TypeMismatch
//! - 同时记录对话历史（按智能体标注）与调用链（AgentInvocation）
//! - memory_id 用于多轮会话时在 ScopeRegistry 中复用同一个 scope

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;

use crate::agentic::AgentEvent;
use crate::core::AgentError;
use crate::memory::Message;

/// 对话历史中的一条消息，标注交换它的智能体
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub agent: String,
    pub message: Message,
}

/// 调用链中的一条记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub agent: String,
    pub inputs: Map<String, Value>,
    pub output: Value,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
pub struct AgenticScope {
    memory_id: Option<String>,
    state: RwLock<HashMap<String, Value>>,
    history: RwLock<Vec<AgentMessage>>,
    invocations: RwLock<Vec<AgentInvocation>>,
    events: Option<UnboundedSender<AgentEvent>>,
}

impl std::fmt::Debug for AgenticScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgenticScope")
            .field("memory_id", &self.memory_id)
            .field("keys", &self.keys())
            .finish()
    }
}

impl AgenticScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory_id(mut self, memory_id: impl Into<String>) -> Self {
        self.memory_id = Some(memory_id.into());
        self
    }

    /// 挂上事件通道；智能体的开始、完成、失败等事件会发送到这里
    pub fn with_events(mut self, events: UnboundedSender<AgentEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// 用初始参数构建
    pub fn from_args(args: Map<String, Value>) -> Self {
        let scope = Self::new();
        scope.write_all(args);
        scope
    }

    pub fn memory_id(&self) -> Option<&str> {
        self.memory_id.as_deref()
    }

    /// 按类型读取；key 不存在返回 MissingKey，类型不符返回 TypeMismatch
    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Result<T, AgentError> {
        let value = self
            .read_value(key)
            .ok_or_else(|| AgentError::MissingKey(key.to_string()))?;
        decode(key, value)
    }

    /// 按类型读取，key 不存在时返回 default；存在但类型不符仍然报错
    pub fn read_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, AgentError> {
        match self.read_value(key) {
            Some(value) => decode(key, value),
            None => Ok(default),
        }
    }

    pub fn read_value(&self, key: &str) -> Option<Value> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// 写入任意可序列化的值，覆盖旧值
    pub fn write<T: Serialize>(&self, key: &str, value: T) -> Result<(), AgentError> {
        let value = serde_json::to_value(value).map_err(|e| AgentError::TypeMismatch {
            key: key.to_string(),
            expected: "serializable value".to_string(),
            detail: e.to_string(),
        })?;
        self.write_value(key, value);
        Ok(())
    }

    pub fn write_value(&self, key: &str, value: Value) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
    }

    pub fn write_all(&self, values: Map<String, Value>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        for (key, value) in values {
            state.insert(key, value);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    /// 当前所有 key（排序后返回）
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// 当前状态的快照（JSON 对象，key 有序）
    pub fn snapshot(&self) -> Map<String, Value> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<(&String, &Value)> = state.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
            .into_iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn append_message(&self, agent: &str, message: Message) {
        self.history
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(AgentMessage {
                agent: agent.to_string(),
                message,
            });
    }

    /// 按时间顺序的对话历史
    pub fn history(&self) -> Vec<AgentMessage> {
        self.history.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn record_invocation(&self, invocation: AgentInvocation) {
        self.invocations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(invocation);
    }

    pub fn invocations(&self) -> Vec<AgentInvocation> {
        self.invocations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// 某个智能体的全部调用记录
    pub fn invocations_of(&self, agent: &str) -> Vec<AgentInvocation> {
        self.invocations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|i| i.agent == agent)
            .cloned()
            .collect()
    }

    /// 将调用链渲染为对话文本：每次调用一段 "User: 输入" + "<agent> agent: 输出"
    pub fn context_as_conversation(&self) -> String {
        conversation_of(&self.invocations())
    }

    pub(crate) fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// 从快照恢复（持久化加载时使用）
    pub(crate) fn restore(
        memory_id: Option<String>,
        state: Map<String, Value>,
        history: Vec<AgentMessage>,
        invocations: Vec<AgentInvocation>,
    ) -> Self {
        Self {
            memory_id,
            state: RwLock::new(state.into_iter().collect()),
            history: RwLock::new(history),
            invocations: RwLock::new(invocations),
            events: None,
        }
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, AgentError> {
    serde_json::from_value(value).map_err(|e| AgentError::TypeMismatch {
        key: key.to_string(),
        expected: std::any::type_name::<T>().to_string(),
        detail: e.to_string(),
    })
}

/// 把一组调用记录渲染为对话文本
pub fn conversation_of(invocations: &[AgentInvocation]) -> String {
    invocations
        .iter()
        .map(|inv| {
            let inputs = inv
                .inputs
                .iter()
                .map(|(k, v)| format!("{k}: {}", value_to_text(v)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("User: {inputs}\n{} agent: {}", inv.agent, value_to_text(&inv.output))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// 字符串直接取内容，其余值转为紧凑 JSON
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 按 memory id 复用 scope（多轮会话）
#[derive(Default)]
pub struct ScopeRegistry {
    scopes: RwLock<HashMap<String, Arc<AgenticScope>>>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取已有 scope，不存在则新建并登记
    pub fn get_or_create(&self, memory_id: &str) -> Arc<AgenticScope> {
        self.get_or_insert_with(memory_id, || AgenticScope::new().with_memory_id(memory_id))
    }

    /// 取已有 scope，不存在则用 create 构建并登记
    pub fn get_or_insert_with<F>(&self, memory_id: &str, create: F) -> Arc<AgenticScope>
    where
        F: FnOnce() -> AgenticScope,
    {
        if let Some(scope) = self.get(memory_id) {
            return scope;
        }
        let mut scopes = self.scopes.write().unwrap_or_else(|e| e.into_inner());
        scopes
            .entry(memory_id.to_string())
            .or_insert_with(|| Arc::new(create()))
            .clone()
    }

    pub fn get(&self, memory_id: &str) -> Option<Arc<AgenticScope>> {
        self.scopes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(memory_id)
            .cloned()
    }

    /// 登记一个外部构建（如从磁盘加载）的 scope；必须带 memory id
    pub fn insert(&self, scope: Arc<AgenticScope>) -> Result<(), AgentError> {
        let memory_id = scope.memory_id().map(str::to_string).ok_or_else(|| {
            AgentError::InvalidConfiguration("scope without memory id cannot be registered".to_string())
        })?;
        self.scopes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(memory_id, scope);
        Ok(())
    }

    pub fn evict(&self, memory_id: &str) -> bool {
        self.scopes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(memory_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.scopes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_latest_write_is_visible() {
        let scope = AgenticScope::new();
        scope.write("cv", "draft").unwrap();
        scope.write("cv", "draft+backend").unwrap();
        assert_eq!(scope.read::<String>("cv").unwrap(), "draft+backend");
    }

    #[test]
    fn test_missing_key_and_default() {
        let scope = AgenticScope::new();
        assert!(matches!(scope.read::<String>("nope"), Err(AgentError::MissingKey(k)) if k == "nope"));
        assert_eq!(scope.read_or("nope", 3_i64).unwrap(), 3);
    }

    #[test]
    fn test_type_mismatch_surfaces_at_read() {
        let scope = AgenticScope::new();
        scope.write_value("score", json!("high"));
        let err = scope.read::<f64>("score").unwrap_err();
        assert!(matches!(err, AgentError::TypeMismatch { key, .. } if key == "score"));
        // 默认值只在 key 缺失时生效
        assert!(scope.read_or("score", 0.0_f64).is_err());
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let scope = AgenticScope::from_args(
            json!({"b": 1, "a": 2}).as_object().cloned().unwrap_or_default(),
        );
        let keys: Vec<String> = scope.snapshot().keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_context_as_conversation() {
        let scope = AgenticScope::new();
        let mut inputs = Map::new();
        inputs.insert("topic".to_string(), json!("dragons"));
        scope.record_invocation(AgentInvocation {
            agent: "writer".to_string(),
            inputs,
            output: json!("Once upon a time"),
            at: Utc::now(),
        });
        let text = scope.context_as_conversation();
        assert!(text.contains("User: topic: dragons"));
        assert!(text.contains("writer agent: Once upon a time"));
    }

    #[test]
    fn test_registry_reuses_scope_by_memory_id() {
        let registry = ScopeRegistry::new();
        let a = registry.get_or_create("user-1");
        a.write("name", "Ada").unwrap();
        let b = registry.get_or_create("user-1");
        assert_eq!(b.read::<String>("name").unwrap(), "Ada");
        assert_eq!(registry.len(), 1);
        assert!(registry.evict("user-1"));
        assert!(registry.get("user-1").is_none());
        assert!(registry.insert(Arc::new(AgenticScope::new())).is_err());
    }
}
