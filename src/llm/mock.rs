//! Mock LLM 客户端（无需 API，本地跑通调度流程）
//!
//! 取最后一条 User 消息回显；带多媒体块时附上块数量。

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::memory::{Message, Role};

#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let last_user = messages.iter().rev().find(|m| matches!(m.role, Role::User));
        let Some(last_user) = last_user else {
            return Ok("Echo from Mock: (no input)".to_string());
        };
        if last_user.blocks.is_empty() {
            Ok(format!("Echo from Mock: {}", last_user.content))
        } else {
            Ok(format!(
                "Echo from Mock: {} [+{} blocks]",
                last_user.content,
                last_user.blocks.len()
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ContentBlock;

    #[tokio::test]
    async fn test_mock_echoes_last_user_message() {
        let messages = vec![
            Message::system("prompt"),
            Message::user("first"),
            Message::assistant("reply"),
            Message::user_with_blocks("second", vec![ContentBlock::text("x")]),
        ];
        let out = MockLlmClient.complete(&messages).await.unwrap();
        assert_eq!(out, "Echo from Mock: second [+1 blocks]");
    }
}
