use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::types::{ChatMessage, Role};

/// Session chat history bound to a memory node for the duration of one run.
///
/// Built fresh for every run from caller-supplied history; never stored on a
/// cached node instance.
#[derive(Debug, Clone, Default)]
pub struct ChatHistory {
    messages: Arc<RwLock<Vec<ChatMessage>>>,
}

impl ChatHistory {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages: Arc::new(RwLock::new(messages)),
        }
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.messages.read().await.clone()
    }

    /// The last `k` messages, or all when `k` is `None`.
    pub async fn recent(&self, k: Option<usize>) -> Vec<ChatMessage> {
        let messages = self.messages.read().await;
        match k {
            Some(k) if k < messages.len() => messages[messages.len() - k..].to_vec(),
            _ => messages.clone(),
        }
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }

    pub async fn push(&self, message: ChatMessage) {
        self.messages.write().await.push(message);
    }

    pub async fn add_user_message(&self, text: impl Into<String>) {
        self.push(ChatMessage::new(Role::User, text)).await;
    }

    pub async fn add_ai_message(&self, text: impl Into<String>) {
        self.push(ChatMessage::new(Role::Assistant, text)).await;
    }
}

/// Histories bound for one run, keyed by memory node id.
#[derive(Debug, Clone, Default)]
pub struct MemoryBindings {
    by_node: HashMap<String, ChatHistory>,
}

impl MemoryBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, node_id: impl Into<String>, history: ChatHistory) {
        self.by_node.insert(node_id.into(), history);
    }

    pub fn get(&self, node_id: &str) -> Option<&ChatHistory> {
        self.by_node.get(node_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ChatHistory)> {
        self.by_node.iter()
    }

    pub fn len(&self) -> usize {
        self.by_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recent_window() {
        let history = ChatHistory::new(vec![
            ChatMessage::user("a"),
            ChatMessage::assistant("b"),
            ChatMessage::user("c"),
        ]);
        let last_two = history.recent(Some(2)).await;
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].content, "b");
        assert_eq!(history.recent(Some(10)).await.len(), 3);
        assert_eq!(history.recent(None).await.len(), 3);
    }

    #[tokio::test]
    async fn test_clones_share_messages() {
        let history = ChatHistory::default();
        let alias = history.clone();
        alias.add_user_message("hi").await;
        assert_eq!(history.len().await, 1);
    }
}
