//! 工作池：并行组合智能体的执行器
//!
//! submit 把任务派发到 tokio 运行时，Semaphore 限制同时执行的任务数；shutdown 之后拒绝新任务，
//! 尚在排队等待许可的任务以 PoolShutdown 结束。
//! submit_unbounded 用于只做调度的任务（嵌套的组合智能体）：它们等待的子任务需要许可，自身再占许可会在池较小时死锁。

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;

/// 工作池
#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    max_workers: usize,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
    submitted: AtomicU64,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            name: name.into(),
            max_workers,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            shutdown: CancellationToken::new(),
            submitted: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// 已提交的任务总数
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// 提交任务；任务在拿到许可后才开始执行
    pub fn submit<F, T>(&self, task: F) -> Result<JoinHandle<Result<T, AgentError>>, AgentError>
    where
        F: Future<Output = Result<T, AgentError>> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_shutdown() {
            return Err(AgentError::PoolShutdown(self.name.clone()));
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);

        let semaphore = Arc::clone(&self.semaphore);
        let token = self.shutdown.clone();
        let name = self.name.clone();
        Ok(tokio::spawn(async move {
            let _permit = tokio::select! {
                permit = semaphore.acquire_owned() => {
                    permit.map_err(|_| AgentError::PoolShutdown(name.clone()))?
                }
                _ = token.cancelled() => return Err(AgentError::PoolShutdown(name)),
            };
            task.await
        }))
    }

    /// 提交不占许可的任务；同样受 shutdown 约束并计入 submitted
    pub fn submit_unbounded<F, T>(&self, task: F) -> Result<JoinHandle<Result<T, AgentError>>, AgentError>
    where
        F: Future<Output = Result<T, AgentError>> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_shutdown() {
            return Err(AgentError::PoolShutdown(self.name.clone()));
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(tokio::spawn(task))
    }

    /// 关闭工作池：拒绝新任务，已在执行的任务不受影响
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::debug!(pool = %self.name, submitted = self.submitted(), "worker pool shutdown");
        }
        self.shutdown.cancel();
        self.semaphore.close();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
