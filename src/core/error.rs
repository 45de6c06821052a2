//! 错误类型
//!
//! - `EngineError`：响应引擎调用失败，按批次隔离，仅记录日志
//! - `ResolutionError`：媒体解析失败，转换为确定性的错误标签追加给会话
//! - `DispatchError`：调度器状态冲突（如重复启动消费循环）

use thiserror::Error;

/// 响应引擎（LLM）调用失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Engine unavailable: {0}")]
    Unavailable(String),
}

/// 单个附件解析失败的原因；超时不在此列，由解析器单独作为 `timeout` 结果处理
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("Download failed: {0}")]
    Download(String),

    #[error("Trim failed: {0}")]
    Trim(String),

    #[error("Transcription failed: {0}")]
    Transcription(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Resolution cancelled")]
    Cancelled,
}

impl ResolutionError {
    /// 写入错误标签 `error="..."` 的机器可读代码
    pub fn code(&self) -> &'static str {
        match self {
            ResolutionError::Download(_) => "download_failed",
            ResolutionError::Trim(_) => "trim_failed",
            ResolutionError::Transcription(_) => "transcription_failed",
            ResolutionError::Io(_) => "io_failed",
            ResolutionError::Cancelled => "cancelled",
        }
    }
}

impl From<std::io::Error> for ResolutionError {
    fn from(e: std::io::Error) -> Self {
        ResolutionError::Io(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Dispatch worker already running")]
    AlreadyRunning,
}
