//! In-memory conversation store: per-context turn history and host context.
//!
//! The store is the only component allowed to mutate conversation state.
//! It lives for the whole process and holds nothing across restarts.

use crate::ContextId;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Agent => write!(f, "agent"),
        }
    }
}

/// One utterance in a conversation. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Read-only view of one conversation, taken under the store's locks.
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    pub turns: Vec<Turn>,
    pub host_context: Option<String>,
}

struct ContextEntry {
    turns: RwLock<Vec<Turn>>,
    host_context: RwLock<Option<String>>,
    /// Serializes full read-compose-write sequences for this context.
    turn_gate: Arc<Mutex<()>>,
}

impl ContextEntry {
    fn new() -> Self {
        Self {
            turns: RwLock::new(Vec::new()),
            host_context: RwLock::new(None),
            turn_gate: Arc::new(Mutex::new(())),
        }
    }
}

/// Process-scoped store mapping context ids to conversation state.
///
/// Contexts are created lazily on first reference and never removed.
/// Independent contexts never contend with each other; requests sharing a
/// context id serialize through [`ConversationStore::begin_turn`].
pub struct ConversationStore {
    contexts: RwLock<HashMap<ContextId, Arc<ContextEntry>>>,
    max_history_turns: usize,
}

impl ConversationStore {
    pub fn new(max_history_turns: usize) -> Self {
        Self {
            contexts: RwLock::new(HashMap::new()),
            max_history_turns: max_history_turns.max(2),
        }
    }

    async fn entry(&self, context_id: &str) -> Arc<ContextEntry> {
        {
            let contexts = self.contexts.read().await;
            if let Some(entry) = contexts.get(context_id) {
                return entry.clone();
            }
        }

        let mut contexts = self.contexts.write().await;
        contexts
            .entry(Arc::from(context_id))
            .or_insert_with(|| Arc::new(ContextEntry::new()))
            .clone()
    }

    /// Acquire the per-context guard. Held across a request's full
    /// read-compose-write sequence so concurrent requests on the same
    /// context wait rather than interleave turns.
    pub async fn begin_turn(&self, context_id: &str) -> OwnedMutexGuard<()> {
        let entry = self.entry(context_id).await;
        entry.turn_gate.clone().lock_owned().await
    }

    /// Read-only view of a conversation. Unseen ids yield an empty view.
    pub async fn snapshot(&self, context_id: &str) -> ContextSnapshot {
        let entry = self.entry(context_id).await;
        let turns = entry.turns.read().await.clone();
        let host_context = entry.host_context.read().await.clone();
        ContextSnapshot {
            turns,
            host_context,
        }
    }

    /// The most recent `max_turns` turns, oldest first.
    pub async fn history_window(&self, context_id: &str, max_turns: usize) -> Vec<Turn> {
        let entry = self.entry(context_id).await;
        let turns = entry.turns.read().await;
        let start = turns.len().saturating_sub(max_turns);
        turns[start..].to_vec()
    }

    /// Number of turns recorded for a context.
    pub async fn history_len(&self, context_id: &str) -> usize {
        let entry = self.entry(context_id).await;
        entry.turns.read().await.len()
    }

    /// Append a single turn.
    pub async fn append_turn(&self, context_id: &str, turn: Turn) {
        let entry = self.entry(context_id).await;
        let mut turns = entry.turns.write().await;
        turns.push(turn);
        trim_oldest(&mut turns, self.max_history_turns);
    }

    /// Append the user question and agent answer of one completed exchange
    /// under a single write lock, in that order.
    pub async fn append_exchange(&self, context_id: &str, user_text: &str, agent_text: &str) {
        let entry = self.entry(context_id).await;
        let mut turns = entry.turns.write().await;
        turns.push(Turn::new(Role::User, user_text));
        turns.push(Turn::new(Role::Agent, agent_text));
        trim_oldest(&mut turns, self.max_history_turns);
    }

    /// Replace the host context. Empty or whitespace-only values are
    /// ignored; the most recent non-empty value wins.
    pub async fn set_host_context(&self, context_id: &str, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let entry = self.entry(context_id).await;
        let mut host_context = entry.host_context.write().await;
        *host_context = Some(text.to_string());
    }
}

fn trim_oldest(turns: &mut Vec<Turn>, max: usize) {
    if turns.len() > max {
        let excess = turns.len() - max;
        turns.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unseen_context_is_empty() {
        let store = ConversationStore::new(20);
        let snapshot = store.snapshot("never-seen").await;
        assert!(snapshot.turns.is_empty());
        assert!(snapshot.host_context.is_none());
    }

    #[tokio::test]
    async fn turns_are_observed_in_append_order() {
        let store = ConversationStore::new(20);
        store.append_exchange("c1", "Hi", "Hello!").await;
        store.append_exchange("c1", "How are you?", "Fine.").await;

        let snapshot = store.snapshot("c1").await;
        let texts: Vec<&str> = snapshot.turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, ["Hi", "Hello!", "How are you?", "Fine."]);
        assert_eq!(snapshot.turns[0].role, Role::User);
        assert_eq!(snapshot.turns[1].role, Role::Agent);
    }

    #[tokio::test]
    async fn history_window_returns_most_recent_turns() {
        let store = ConversationStore::new(20);
        for index in 0..5 {
            store
                .append_turn("c1", Turn::new(Role::User, format!("turn {index}")))
                .await;
        }

        let window = store.history_window("c1", 2).await;
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].text, "turn 3");
        assert_eq!(window[1].text, "turn 4");

        // Asking for more than exists returns what's there.
        let window = store.history_window("c1", 50).await;
        assert_eq!(window.len(), 5);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let store = ConversationStore::new(4);
        for index in 0..6 {
            store.append_exchange("c1", &format!("q{index}"), &format!("a{index}")).await;
        }

        let snapshot = store.snapshot("c1").await;
        assert_eq!(snapshot.turns.len(), 4);
        assert_eq!(snapshot.turns[0].text, "q4");
        assert_eq!(snapshot.turns[3].text, "a5");
    }

    #[tokio::test]
    async fn last_non_empty_host_context_wins() {
        let store = ConversationStore::new(20);
        store.set_host_context("c1", "A").await;
        store.set_host_context("c1", "  ").await;
        assert_eq!(store.snapshot("c1").await.host_context.as_deref(), Some("A"));

        store.set_host_context("c1", "B").await;
        assert_eq!(store.snapshot("c1").await.host_context.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn concurrent_exchanges_on_one_context_serialize() {
        let store = Arc::new(ConversationStore::new(100));

        let mut handles = Vec::new();
        for index in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let _guard = store.begin_turn("shared").await;
                let before = store.history_len("shared").await;
                tokio::task::yield_now().await;
                store
                    .append_exchange("shared", &format!("q{index}"), &format!("a{index}"))
                    .await;
                let after = store.history_len("shared").await;
                (before, after)
            }));
        }

        for handle in handles {
            let (before, after) = handle.await.unwrap();
            // Each holder saw exactly its own two appends.
            assert_eq!(after, before + 2);
        }

        assert_eq!(store.history_len("shared").await, 16);
    }
}
