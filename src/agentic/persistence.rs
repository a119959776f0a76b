//! Scope 持久化
//!
//! 每个 memory id 一个 JSON 文件，保存状态、对话历史与调用链，用于跨进程恢复多轮会话。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agentic::scope::{AgentInvocation, AgentMessage};
use crate::agentic::AgenticScope;

#[derive(Serialize, Deserialize)]
struct ScopeSnapshot {
    memory_id: Option<String>,
    state: Map<String, Value>,
    history: Vec<AgentMessage>,
    invocations: Vec<AgentInvocation>,
}

#[derive(Debug, Clone)]
pub struct ScopePersistence {
    dir: PathBuf,
}

impl ScopePersistence {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// memory id 对应的文件；非字母数字字符替换为 '_'
    pub fn path_for(&self, memory_id: &str) -> PathBuf {
        let file: String = memory_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file}.json"))
    }

    /// 保存 scope；没有 memory id 的 scope 不能保存
    pub fn save(&self, scope: &AgenticScope) -> anyhow::Result<PathBuf> {
        let memory_id = scope
            .memory_id()
            .ok_or_else(|| anyhow::anyhow!("cannot persist a scope without memory id"))?;
        std::fs::create_dir_all(&self.dir)?;
        let snapshot = ScopeSnapshot {
            memory_id: Some(memory_id.to_string()),
            state: scope.snapshot(),
            history: scope.history(),
            invocations: scope.invocations(),
        };
        let path = self.path_for(memory_id);
        std::fs::write(&path, serde_json::to_string_pretty(&snapshot)?)?;
        tracing::debug!(memory_id, path = %path.display(), "scope saved");
        Ok(path)
    }

    /// 加载 scope；文件不存在时返回 None
    pub fn load(&self, memory_id: &str) -> anyhow::Result<Option<AgenticScope>> {
        let path = self.path_for(memory_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        let snapshot: ScopeSnapshot = serde_json::from_str(&data)?;
        Ok(Some(AgenticScope::restore(
            snapshot.memory_id.or_else(|| Some(memory_id.to_string())),
            snapshot.state,
            snapshot.history,
            snapshot.invocations,
        )))
    }

    pub fn remove(&self, memory_id: &str) -> anyhow::Result<bool> {
        let path = self.path_for(memory_id);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        Ok(true)
    }
}
