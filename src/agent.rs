//! 响应引擎：基于 LlmClient 与共享对话历史
//!
//! invoke 把本批合并内容写入历史 → 拼 system prompt → 调用 LLM → 记录回复与当前时间；
//! 一轮成功后才按轮数剪枝；LLM 失败时撤回本轮 user 消息，历史保持调用前的样子。
//! summarize 把历史压缩成一条摘要型 system 消息（会话空闲超时触发）。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::AppConfig;
use crate::core::EngineError;
use crate::dispatch::{EngineInput, InvokeReason, ResponseEngine};
use crate::llm::LlmClient;
use crate::memory::{Message, Role, SharedHistory};

const DEFAULT_SYSTEM_PROMPT: &str = "你是一个群聊与私聊中的对话助手。\
消息以 <sender> 标签标明发送者；<image>、<audio>、<video>、<file> 标签表示附件，\
status=\"loading\" 表示附件仍在解析，结果会以后续消息补充。";

const SUMMARY_PROMPT: &str = "请用简洁的中文概括以上对话的要点（参与者、话题、未完成的事项），\
只输出摘要本身。";

/// 查找系统提示词：配置路径优先，其次 config/prompts/system.md，都没有时用内置提示词
pub fn load_system_prompt(cfg: &AppConfig) -> String {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(path) = &cfg.app.system_prompt_path {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("config/prompts/system.md"));
    candidates.push(PathBuf::from("../config/prompts/system.md"));

    candidates
        .iter()
        .find_map(|p| read_prompt(p))
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
}

fn read_prompt(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

pub struct AgentEngine {
    llm: Arc<dyn LlmClient>,
    history: SharedHistory,
    system_prompt: String,
}

impl AgentEngine {
    pub fn new(llm: Arc<dyn LlmClient>, history: SharedHistory, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            history,
            system_prompt: system_prompt.into(),
        }
    }

    pub fn history(&self) -> &SharedHistory {
        &self.history
    }

    fn with_system_prompt(&self, history: &[Message], reason: InvokeReason) -> Vec<Message> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        if !self.system_prompt.is_empty() {
            messages.push(Message::system(self.system_prompt.clone()));
        }
        if reason != InvokeReason::UserMessage {
            messages.push(Message::system(format!("本轮调用原因：{reason}")));
        }
        messages.extend_from_slice(history);
        messages
    }
}

fn now_note() -> Message {
    Message::system(format!(
        "当前时间：{}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    ))
}

#[async_trait]
impl ResponseEngine for AgentEngine {
    async fn invoke(&self, reason: InvokeReason, input: EngineInput) -> Result<String, EngineError> {
        let (text, blocks) = input.into_parts();
        let mut history = self.history.lock().await;
        history.push(Message::user_with_blocks(text, blocks));

        let messages = self.with_system_prompt(history.messages(), reason);
        match self.llm.complete(&messages).await {
            Ok(reply) => {
                history.push(Message::assistant(reply.clone()));
                history.push(now_note());
                history.prune();
                let (prompt, completion, _) = self.llm.token_usage();
                tracing::debug!(reason = %reason, prompt, completion, "engine invoked");
                Ok(reply)
            }
            Err(e) => {
                history.pop();
                Err(EngineError::Llm(e))
            }
        }
    }

    async fn summarize(&self) -> Result<(), EngineError> {
        let mut history = self.history.lock().await;
        if history.is_empty() {
            return Ok(());
        }

        let mut messages = self.with_system_prompt(history.messages(), InvokeReason::UserMessage);
        messages.push(Message::user(SUMMARY_PROMPT));
        let summary = self.llm.complete(&messages).await.map_err(EngineError::Llm)?;
        let summary = summary.trim();
        if summary.is_empty() {
            return Ok(());
        }

        let before = history.len();
        history.replace_with(Message::system(format!(
            "Previous conversation summary:\n\n{summary}"
        )));
        tracing::info!(messages = before, "history compacted into summary");
        Ok(())
    }

    async fn clear_history(&self) {
        self.history.lock().await.clear();
    }

    async fn has_history(&self) -> bool {
        let history = self.history.lock().await;
        history.messages().iter().any(|m| m.role != Role::System)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::memory::{shared_history, ContentBlock};

    struct FailingLlm;

    #[async_trait]
    impl LlmClient for FailingLlm {
        async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
            Err("upstream 500".to_string())
        }
    }

    #[tokio::test]
    async fn test_invoke_records_turn_and_time_note() {
        let history = shared_history(10);
        let engine = AgentEngine::new(Arc::new(MockLlmClient), history.clone(), "prompt");
        let reply = engine
            .invoke(InvokeReason::UserMessage, EngineInput::new("hello".into(), Vec::new()))
            .await
            .unwrap();
        assert_eq!(reply, "Echo from Mock: hello");

        let mem = history.lock().await;
        let roles: Vec<_> = mem.messages().iter().map(|m| m.role.clone()).collect();
        assert_eq!(roles, [Role::User, Role::Assistant, Role::System]);
        assert!(mem.messages()[2].content.starts_with("当前时间："));
    }

    #[tokio::test]
    async fn test_structured_input_keeps_blocks() {
        let history = shared_history(10);
        let engine = AgentEngine::new(Arc::new(MockLlmClient), history.clone(), "");
        let input = EngineInput::new(
            "look".into(),
            vec![ContentBlock::data_url("image/png", "abc")],
        );
        let reply = engine.invoke(InvokeReason::UserMessage, input).await.unwrap();
        assert_eq!(reply, "Echo from Mock: look [+1 blocks]");
        assert_eq!(history.lock().await.messages()[0].blocks.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_invoke_rolls_back_user_turn() {
        let history = shared_history(10);
        let engine = AgentEngine::new(Arc::new(FailingLlm), history.clone(), "prompt");
        let err = engine
            .invoke(InvokeReason::UserMessage, EngineInput::new("hi".into(), Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Llm("upstream 500".to_string()));
        assert!(history.lock().await.is_empty());
        assert!(!engine.has_history().await);
    }

    struct FlakyLlm {
        calls: std::sync::atomic::AtomicUsize,
        fail_on: usize,
    }

    #[async_trait]
    impl LlmClient for FlakyLlm {
        async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if n == self.fail_on {
                Err("upstream 500".to_string())
            } else {
                Ok("r".to_string())
            }
        }
    }

    #[tokio::test]
    async fn test_failed_invoke_keeps_full_history() {
        let history = shared_history(2);
        let llm = Arc::new(FlakyLlm {
            calls: Default::default(),
            fail_on: 3,
        });
        let engine = AgentEngine::new(llm, history.clone(), "prompt");
        for text in ["u1", "u2"] {
            engine
                .invoke(InvokeReason::UserMessage, EngineInput::new(text.into(), Vec::new()))
                .await
                .unwrap();
        }
        let before: Vec<String> = history.lock().await.messages().iter().map(|m| m.content.clone()).collect();
        assert_eq!(before.len(), 6);
        assert_eq!(before[0], "u1");

        engine
            .invoke(InvokeReason::UserMessage, EngineInput::new("u3".into(), Vec::new()))
            .await
            .unwrap_err();
        let after: Vec<String> = history.lock().await.messages().iter().map(|m| m.content.clone()).collect();
        assert_eq!(after, before);

        // 下一轮成功后整轮剪枝，历史从 user 消息开始
        engine
            .invoke(InvokeReason::UserMessage, EngineInput::new("u4".into(), Vec::new()))
            .await
            .unwrap();
        let mem = history.lock().await;
        assert_eq!(mem.len(), 6);
        assert_eq!(mem.messages()[0].content, "u2");
        assert_eq!(mem.messages()[3].content, "u4");
    }

    #[tokio::test]
    async fn test_summarize_then_clear() {
        let history = shared_history(10);
        let engine = AgentEngine::new(Arc::new(MockLlmClient), history.clone(), "prompt");
        engine
            .invoke(InvokeReason::UserMessage, EngineInput::new("hello".into(), Vec::new()))
            .await
            .unwrap();
        assert!(engine.has_history().await);

        engine.summarize().await.unwrap();
        {
            let mem = history.lock().await;
            assert_eq!(mem.len(), 1);
            assert!(mem.messages()[0].content.starts_with("Previous conversation summary:"));
        }
        assert!(!engine.has_history().await);

        engine.clear_history().await;
        assert!(history.lock().await.is_empty());
    }

    #[test]
    fn test_system_prompt_from_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.md");
        std::fs::write(&path, "  custom prompt \n").unwrap();
        let mut cfg = AppConfig::default();
        cfg.app.system_prompt_path = Some(path);
        assert_eq!(load_system_prompt(&cfg), "custom prompt");
    }
}
