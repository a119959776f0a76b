//! 工具注册表
//!
//! 生成式智能体能调用的工具都实现 Tool，按名称登记在 ToolRegistry；
//! 调用时的超时与审计由 ToolExecutor 负责。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

#[async_trait]
pub trait Tool: Send + Sync {
    /// 模型在工具调用 JSON 的 "tool" 字段中使用的名称
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数的 JSON Schema，默认是不限字段的对象
    fn parameters_schema(&self) -> Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    /// 工具自身的失败以 Err(说明) 返回，由执行器转成 ToolExecutionFailed
    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 注入 system prompt 的工具说明
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 按名称有序存放，生成的工具说明顺序稳定
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同名工具会被替换
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_shared(Arc::new(tool));
    }

    pub fn register_shared(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// 链式登记，便于一次构建整个工具集
    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }

    pub fn to_schema_json(&self) -> String {
        serde_json::to_string_pretty(&self.specs()).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    #[tokio::test]
    async fn test_registry_lookup_and_specs() {
        let registry = ToolRegistry::new().with(EchoTool);

        assert!(registry.contains("echo"));
        assert!(registry.get("send_email").is_none());
        let out = registry
            .get("echo")
            .unwrap()
            .execute(serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(out, "hi");

        let specs = registry.specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "echo");
        assert!(registry.to_schema_json().contains("\"echo\""));
    }
}
