//! 记忆层：共享对话历史

pub mod conversation;

pub use conversation::{
    shared_history, ContentBlock, ConversationMemory, ImageUrl, Message, Role, SharedHistory,
};
