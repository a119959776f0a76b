//! 提示模板：`{{variable}}` 占位符
//!
//! 生成式智能体未显式声明输入时，以模板中出现的占位符作为输入 key。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::agentic::scope::value_to_text;
use crate::core::AgentError;

static PLACEHOLDER_RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

fn placeholder_re() -> Result<&'static Regex, AgentError> {
    PLACEHOLDER_RE
        .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}"))
        .as_ref()
        .map_err(|e| AgentError::InvalidConfiguration(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    source: String,
}

impl PromptTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// 占位符名称，按首次出现顺序去重
    pub fn variables(&self) -> Result<Vec<String>, AgentError> {
        let mut vars: Vec<String> = Vec::new();
        for cap in placeholder_re()?.captures_iter(&self.source) {
            let name = cap[1].to_string();
            if !vars.contains(&name) {
                vars.push(name);
            }
        }
        Ok(vars)
    }

    /// 用 vars 填充占位符；字符串原样插入，其余值插入紧凑 JSON
    pub fn render(&self, vars: &Map<String, Value>) -> Result<String, AgentError> {
        let re = placeholder_re()?;
        let mut out = String::with_capacity(self.source.len());
        let mut last = 0;
        for cap in re.captures_iter(&self.source) {
            let (Some(whole), Some(name)) = (cap.get(0), cap.get(1)) else {
                continue;
            };
            let value = vars
                .get(name.as_str())
                .ok_or_else(|| AgentError::MissingKey(name.as_str().to_string()))?;
            out.push_str(&self.source[last..whole.start()]);
            out.push_str(&value_to_text(value));
            last = whole.end();
        }
        out.push_str(&self.source[last..]);
        Ok(out)
    }
}

impl From<&str> for PromptTemplate {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PromptTemplate {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}
