//! 核心层：错误类型与优雅关闭

pub mod error;
pub mod shutdown;

pub use error::{DispatchError, EngineError, ResolutionError};
pub use shutdown::{ShutdownManager, ShutdownReason};
