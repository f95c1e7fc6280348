use chainflow_core::capability::BASE_CHAT_MEMORY;
use chainflow_core::history::{ChatHistory, MemoryBindings};
use chainflow_core::types::{ChatMessage, Role};

use crate::graph::Graph;

/// Binds request history onto conversational memory nodes.
///
/// Every run gets fresh history objects built from the request, keyed by
/// memory node id and handed to the terminal through its run context.
/// Cached memory instances hold configuration only, so two sessions sharing
/// a graph never see each other's turns.
pub struct MemoryBinder;

impl MemoryBinder {
    /// Bind a copy of `history` to each memory node in `node_ids`.
    pub fn bind(graph: &Graph, node_ids: &[String], history: &[ChatMessage]) -> MemoryBindings {
        let conversation: Vec<ChatMessage> = history
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .cloned()
            .collect();

        let mut bindings = MemoryBindings::new();
        for id in node_ids {
            let Some(node) = graph.node(id) else {
                continue;
            };
            if node.has_capability(BASE_CHAT_MEMORY) {
                bindings.bind(id.clone(), ChatHistory::new(conversation.clone()));
            }
        }
        bindings
    }

    /// Record the user turn on every bound history after a successful run.
    pub async fn commit_user_turn(bindings: &MemoryBindings, input: &str) {
        for (_, history) in bindings.iter() {
            history.add_user_message(input).await;
        }
    }
}
