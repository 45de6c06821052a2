//! Antler - 会话机器人消息调度核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、关闭信号
//! - **memory**: 共享对话历史
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **agent**: 基于 LLM 的响应引擎
//! - **dispatch**: 优先级队列、按来源合批、单消费者调度循环
//! - **media**: 附件处理、消息解析、后台解析监督
//! - **session**: 具名延时任务与会话空闲超时
//! - **handler**: 入站消息处理

pub mod agent;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod handler;
pub mod llm;
pub mod media;
pub mod memory;
pub mod observability;
pub mod session;
