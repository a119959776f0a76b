//! 确定性单元：不调用模型的普通函数
//!
//! - FunctionAgent：从声明的输入计算输出（同步或 async 闭包）
//! - ScopeAction：直接读写整个 scope（如把分数换算成百分比）

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::agentic::agent::{complete_unit, resolve_inputs};
use crate::agentic::{Agent, AgenticScope};
use crate::core::AgentError;

/// 已解析的输入，按 key 取值
#[derive(Debug, Clone)]
pub struct Inputs {
    agent: String,
    values: Map<String, Value>,
}

impl Inputs {
    pub fn new(agent: impl Into<String>, values: Map<String, Value>) -> Self {
        Self {
            agent: agent.into(),
            values,
        }
    }

    pub fn value(&self, key: &str) -> Result<&Value, AgentError> {
        self.values.get(key).ok_or_else(|| AgentError::MissingInput {
            agent: self.agent.clone(),
            key: key.to_string(),
        })
    }

    /// 按类型取值；类型不符返回 TypeMismatch
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, AgentError> {
        let value = self.value(key)?.clone();
        serde_json::from_value(value).map_err(|e| AgentError::TypeMismatch {
            key: key.to_string(),
            expected: std::any::type_name::<T>().to_string(),
            detail: e.to_string(),
        })
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }
}

type SyncBody = Arc<dyn Fn(&Inputs) -> Result<Value, AgentError> + Send + Sync>;
type AsyncBody = Arc<dyn Fn(Inputs) -> BoxFuture<'static, Result<Value, AgentError>> + Send + Sync>;

enum Body {
    Sync(SyncBody),
    Async(AsyncBody),
}

pub struct FunctionAgent {
    name: String,
    description: String,
    input_keys: Vec<String>,
    defaults: Map<String, Value>,
    output_key: Option<String>,
    async_mode: bool,
    body: Body,
}

impl FunctionAgent {
    pub fn builder(name: impl Into<String>) -> FunctionAgentBuilder {
        FunctionAgentBuilder {
            name: name.into(),
            description: String::new(),
            input_keys: Vec::new(),
            defaults: Map::new(),
            output_key: None,
            async_mode: false,
        }
    }
}

#[async_trait]
impl Agent for FunctionAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_keys(&self) -> Vec<String> {
        self.input_keys.clone()
    }

    fn output_key(&self) -> Option<&str> {
        self.output_key.as_deref()
    }

    fn is_async(&self) -> bool {
        self.async_mode
    }

    async fn invoke(&self, scope: &Arc<AgenticScope>) -> Result<Value, AgentError> {
        let values = resolve_inputs(&self.name, &self.input_keys, &self.defaults, scope)?;
        let inputs = Inputs::new(&self.name, values.clone());
        let output = match &self.body {
            Body::Sync(f) => f(&inputs)?,
            Body::Async(f) => f(inputs).await?,
        };
        Ok(complete_unit(
            scope,
            &self.name,
            self.output_key.as_deref(),
            values,
            output,
        ))
    }
}

pub struct FunctionAgentBuilder {
    name: String,
    description: String,
    input_keys: Vec<String>,
    defaults: Map<String, Value>,
    output_key: Option<String>,
    async_mode: bool,
}

impl FunctionAgentBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn input_key(mut self, key: impl Into<String>) -> Self {
        self.input_keys.push(key.into());
        self
    }

    pub fn input_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// 输入缺失时使用的默认值
    pub fn default_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(key.into(), value);
        self
    }

    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn async_mode(mut self, async_mode: bool) -> Self {
        self.async_mode = async_mode;
        self
    }

    /// 以同步闭包构建
    pub fn build<F, T>(self, f: F) -> Result<FunctionAgent, AgentError>
    where
        F: Fn(&Inputs) -> Result<T, AgentError> + Send + Sync + 'static,
        T: Serialize,
    {
        let body: SyncBody = Arc::new(move |inputs: &Inputs| to_output(f(inputs)?));
        self.finish(Body::Sync(body))
    }

    /// 以 async 闭包构建
    pub fn build_async<F, Fut, T>(self, f: F) -> Result<FunctionAgent, AgentError>
    where
        F: Fn(Inputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, AgentError>> + Send + 'static,
        T: Serialize,
    {
        let f = Arc::new(f);
        let body: AsyncBody = Arc::new(move |inputs: Inputs| {
            let f = Arc::clone(&f);
            Box::pin(async move { to_output(f(inputs).await?) })
        });
        self.finish(Body::Async(body))
    }

    fn finish(self, body: Body) -> Result<FunctionAgent, AgentError> {
        if self.name.trim().is_empty() {
            return Err(AgentError::InvalidConfiguration(
                "function agent needs a name".to_string(),
            ));
        }
        Ok(FunctionAgent {
            name: self.name,
            description: self.description,
            input_keys: self.input_keys,
            defaults: self.defaults,
            output_key: self.output_key,
            async_mode: self.async_mode,
            body,
        })
    }
}

fn to_output<T: Serialize>(value: T) -> Result<Value, AgentError> {
    serde_json::to_value(value).map_err(|e| AgentError::TypeMismatch {
        key: "(output)".to_string(),
        expected: "serializable value".to_string(),
        detail: e.to_string(),
    })
}

type ActionBody = Arc<dyn Fn(&AgenticScope) -> Result<(), AgentError> + Send + Sync>;

/// 直接操作整个 scope 的单元；设置 output_key 时返回该 key 的值，否则返回 scope 快照
pub struct ScopeAction {
    name: String,
    description: String,
    input_keys: Vec<String>,
    output_key: Option<String>,
    action: ActionBody,
}

impl ScopeAction {
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(&AgenticScope) -> Result<(), AgentError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            input_keys: Vec::new(),
            output_key: None,
            action: Arc::new(action),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn input_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }
}

#[async_trait]
impl Agent for ScopeAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_keys(&self) -> Vec<String> {
        self.input_keys.clone()
    }

    fn output_key(&self) -> Option<&str> {
        self.output_key.as_deref()
    }

    fn reads_whole_scope(&self) -> bool {
        true
    }

    async fn invoke(&self, scope: &Arc<AgenticScope>) -> Result<Value, AgentError> {
        let inputs = resolve_inputs(&self.name, &self.input_keys, &Map::new(), scope)?;
        (self.action)(scope)?;
        let output = match &self.output_key {
            Some(key) => scope.read_value(key).ok_or_else(|| AgentError::MissingKey(key.clone()))?,
            None => Value::Null,
        };
        // 输出已由 action 写入，这里只补记调用链
        let snapshot = complete_unit(scope, &self.name, None, inputs, output.clone());
        Ok(if self.output_key.is_some() { output } else { snapshot })
    }
}
