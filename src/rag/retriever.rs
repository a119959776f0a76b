//! 内容检索器
//!
//! 生成式智能体在调用模型前以用户消息为查询检索相关片段，并以
//! "Answer using the following information:" 追加到用户消息之后。
//! 当前内置实现为 InMemoryRetriever（关键词重叠），可替换为真实向量库。

use std::collections::HashSet;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::core::AgentError;

/// 检索器 trait：按查询返回最相关的文本片段（已按相关度降序）
#[async_trait]
pub trait ContentRetriever: Send + Sync {
    async fn retrieve(&self, query: &str) -> Result<Vec<String>, AgentError>;
}

/// 简单内存实现：按关键词重叠打分
pub struct InMemoryRetriever {
    /// (text, 小写词集合)
    store: RwLock<Vec<(String, HashSet<String>)>>,
    max_results: usize,
}

/// 将文本切分为小写词集合（去掉首尾标点，过滤单字符）
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| w.chars().count() > 1)
        .collect()
}

impl InMemoryRetriever {
    pub fn new(max_results: usize) -> Self {
        Self {
            store: RwLock::new(Vec::new()),
            max_results,
        }
    }

    /// 从一组文档构建
    pub fn from_documents<I, S>(docs: I, max_results: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let retriever = Self::new(max_results);
        for doc in docs {
            retriever.add(doc);
        }
        retriever
    }

    pub fn add(&self, text: impl Into<String>) {
        let text = text.into();
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let tokens = tokenize_lower(text);
        self.store
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((text.to_string(), tokens));
    }

    pub fn len(&self) -> usize {
        self.store.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryRetriever {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl ContentRetriever for InMemoryRetriever {
    async fn retrieve(&self, query: &str) -> Result<Vec<String>, AgentError> {
        let query_tokens = tokenize_lower(query);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }
        let store = self.store.read().unwrap_or_else(|e| e.into_inner());
        let mut scored: Vec<(usize, &String)> = store
            .iter()
            .map(|(text, doc_tokens)| (query_tokens.intersection(doc_tokens).count(), text))
            .filter(|(s, _)| *s > 0)
            .collect();
        // 稳定排序：同分时保持插入顺序
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(self.max_results)
            .map(|(_, t)| t.clone())
            .collect())
    }
}
