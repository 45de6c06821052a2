//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::LlmClient;

use crate::config::AppConfig;

/// 按配置创建主 LLM：provider=openai 且有 OPENAI_API_KEY 时走 OpenAI 兼容端点，否则 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var("OPENAI_API_KEY").ok();

    match (provider.as_str(), api_key) {
        ("openai", Some(key)) => {
            tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                Some(&key),
                Duration::from_secs(cfg.llm.request_timeout_secs),
            ))
        }
        _ => {
            tracing::warn!("No API key set or provider unknown, using Mock LLM");
            Arc::new(MockLlmClient)
        }
    }
}

/// 媒体转述用 LLM：配置了 [llm.transcription].model 时单独建客户端，否则复用主 LLM
pub fn create_transcription_llm(cfg: &AppConfig, main: Arc<dyn LlmClient>) -> Arc<dyn LlmClient> {
    let Some(model) = cfg.llm.transcription.model.as_deref() else {
        return main;
    };
    let Ok(key) = std::env::var("TRANSCRIPTION_API_KEY").or_else(|_| std::env::var("OPENAI_API_KEY"))
    else {
        tracing::warn!("Transcription model set but no API key, reusing main LLM");
        return main;
    };
    let base_url = cfg
        .llm
        .transcription
        .base_url
        .as_deref()
        .or(cfg.llm.base_url.as_deref());
    tracing::info!("Using dedicated transcription LLM ({})", model);
    Arc::new(OpenAiClient::new(
        base_url,
        model,
        Some(&key),
        Duration::from_secs(cfg.llm.request_timeout_secs),
    ))
}
