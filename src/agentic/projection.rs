//! 组合智能体的返回值策略
//!
//! 三选一：单个 scope key、基于 scope 计算、或把值与最终 scope 配对返回；默认返回整个 scope。

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::agentic::AgenticScope;
use crate::core::AgentError;

pub type ComputeFn = Arc<dyn Fn(&AgenticScope) -> Result<Value, AgentError> + Send + Sync>;

#[derive(Clone, Default)]
pub enum OutputProjection {
    /// 整个 scope 的快照
    #[default]
    Scope,
    /// 单个 key 的值；key 不存在时为 null
    Key(String),
    /// 由函数从 scope 计算
    Compute(ComputeFn),
    /// 内层策略的值与最终 scope 一起返回：{"result": ..., "scope": {...}}
    WithScope(Box<OutputProjection>),
}

impl std::fmt::Debug for OutputProjection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scope => write!(f, "Scope"),
            Self::Key(k) => write!(f, "Key({k})"),
            Self::Compute(_) => write!(f, "Compute(..)"),
            Self::WithScope(inner) => write!(f, "WithScope({inner:?})"),
        }
    }
}

impl OutputProjection {
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }

    pub fn compute<F>(f: F) -> Self
    where
        F: Fn(&AgenticScope) -> Result<Value, AgentError> + Send + Sync + 'static,
    {
        Self::Compute(Arc::new(f))
    }

    pub fn with_scope(self) -> Self {
        Self::WithScope(Box::new(self))
    }

    pub fn project(&self, scope: &AgenticScope) -> Result<Value, AgentError> {
        match self {
            Self::Scope => Ok(Value::Object(scope.snapshot())),
            Self::Key(key) => Ok(scope.read_value(key).unwrap_or(Value::Null)),
            Self::Compute(f) => f(scope),
            Self::WithScope(inner) => {
                let result = inner.project(scope)?;
                Ok(json!({ "result": result, "scope": Value::Object(scope.snapshot()) }))
            }
        }
    }
}

/// 组合智能体的收尾：
/// - 显式设置了 projection：按 projection 计算，并在有 output_key 时写回
/// - 只设置 output_key：返回该 key 的值
/// - 都没有：返回整个 scope
pub(crate) fn project_result(
    scope: &AgenticScope,
    output_key: Option<&str>,
    projection: Option<&OutputProjection>,
) -> Result<Value, AgentError> {
    match (projection, output_key) {
        (Some(projection), Some(key)) => {
            let value = projection.project(scope)?;
            scope.write_value(key, value.clone());
            Ok(value)
        }
        (Some(projection), None) => projection.project(scope),
        (None, Some(key)) => OutputProjection::key(key).project(scope),
        (None, None) => OutputProjection::Scope.project(scope),
    }
}

/// 调用结果与最终 scope
#[derive(Debug, Clone)]
pub struct ResultWithScope {
    pub result: Value,
    pub scope: Arc<AgenticScope>,
}

impl ResultWithScope {
    /// 按类型取结果
    pub fn result_as<T: DeserializeOwned>(&self) -> Result<T, AgentError> {
        serde_json::from_value(self.result.clone()).map_err(|e| AgentError::TypeMismatch {
            key: "(result)".to_string(),
            expected: std::any::type_name::<T>().to_string(),
            detail: e.to_string(),
        })
    }
}
