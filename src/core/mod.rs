//! 核心层：错误与恢复、工作池

pub mod error;
pub mod pool;
pub mod recovery;

pub use error::{AgentError, RecoveryAction};
pub use pool::WorkerPool;
pub use recovery::RecoveryEngine;
