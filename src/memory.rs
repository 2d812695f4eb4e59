//! Per-conversation message windows.
//!
//! [`ConversationMemory`] keeps one bounded [`MemoryWindow`] per
//! conversation id. Each window holds at most `max_messages` turns and
//! evicts the oldest turn first when full.
//!
//! System turns are exempt from eviction when `retain_system` is set. A new
//! system turn then replaces the previous one, so a window never holds more
//! than one. If nothing but exempt turns remain, the oldest turn goes anyway:
//! the size bound always wins.
//!
//! # Locking
//!
//! The map of windows sits behind a `std::sync::RwLock` that is only held
//! long enough to find or create a window. Each window has its own
//! `tokio::sync::Mutex`; a request holds it (via [`ConversationMemory::lock`])
//! from reading history until it commits its turns, which serializes
//! requests on the same conversation without blocking other conversations.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{GatewayError, Result};
use crate::models::{Message, Role};

#[derive(Debug, Clone)]
pub struct MemoryWindow {
    turns: VecDeque<Message>,
    max_messages: usize,
    retain_system: bool,
}

impl MemoryWindow {
    pub fn new(max_messages: usize, retain_system: bool) -> Self {
        Self {
            turns: VecDeque::new(),
            max_messages: max_messages.max(1),
            retain_system,
        }
    }

    pub fn push(&mut self, turn: Message) -> Result<()> {
        if self.retain_system && turn.role == Role::System {
            self.turns.retain(|t| t.role != Role::System);
        }
        while self.turns.len() >= self.max_messages {
            self.evict_one();
        }
        self.turns.push_back(turn);

        if self.turns.len() > self.max_messages {
            return Err(GatewayError::MemoryCapacity(format!(
                "{} turns held, limit is {}",
                self.turns.len(),
                self.max_messages
            )));
        }
        Ok(())
    }

    fn evict_one(&mut self) {
        let victim = if self.retain_system {
            self.turns
                .iter()
                .position(|t| t.role != Role::System)
                .unwrap_or(0)
        } else {
            0
        };
        self.turns.remove(victim);
    }

    pub fn extend(&mut self, turns: impl IntoIterator<Item = Message>) -> Result<()> {
        for turn in turns {
            self.push(turn)?;
        }
        Ok(())
    }

    /// Turns in insertion order.
    pub fn turns(&self) -> Vec<Message> {
        self.turns.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

/// Exclusive access to one conversation's window.
pub type WindowGuard = OwnedMutexGuard<MemoryWindow>;

pub struct ConversationMemory {
    windows: RwLock<HashMap<String, Arc<Mutex<MemoryWindow>>>>,
    max_messages: usize,
    retain_system: bool,
}

impl ConversationMemory {
    pub fn new(max_messages: usize, retain_system: bool) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            max_messages,
            retain_system,
        }
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    fn existing(&self, conversation_id: &str) -> Option<Arc<Mutex<MemoryWindow>>> {
        self.windows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(conversation_id)
            .cloned()
    }

    fn window(&self, conversation_id: &str) -> Arc<Mutex<MemoryWindow>> {
        if let Some(window) = self.existing(conversation_id) {
            return window;
        }
        self.windows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(MemoryWindow::new(
                    self.max_messages,
                    self.retain_system,
                )))
            })
            .clone()
    }

    /// Wait for exclusive access to a conversation's window.
    pub async fn lock(&self, conversation_id: &str) -> WindowGuard {
        self.window(conversation_id).lock_owned().await
    }

    pub async fn append(&self, conversation_id: &str, turn: Message) -> Result<()> {
        self.lock(conversation_id).await.push(turn)
    }

    /// Turns held for a conversation; unknown ids read as empty without
    /// creating a window.
    pub async fn read(&self, conversation_id: &str) -> Vec<Message> {
        match self.existing(conversation_id) {
            Some(window) => window.lock().await.turns(),
            None => Vec::new(),
        }
    }

    /// Drop a conversation's history once any in-flight request on it has
    /// finished. Returns false for unknown ids.
    pub async fn forget(&self, conversation_id: &str) -> bool {
        let Some(window) = self.existing(conversation_id) else {
            return false;
        };
        window.lock().await.clear();

        let mut windows = self.windows.write().unwrap_or_else(|e| e.into_inner());
        // a request that picked the window up meanwhile keeps it alive, cleared
        let idle = windows
            .get(conversation_id)
            .is_some_and(|w| Arc::ptr_eq(w, &window) && Arc::strong_count(w) == 2);
        if idle {
            windows.remove(conversation_id);
        }
        tracing::debug!(conversation_id, removed = idle, "conversation forgotten");
        true
    }

    /// Number of conversations with a window.
    pub fn conversations(&self) -> usize {
        self.windows.read().map(|w| w.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn contents(turns: &[Message]) -> Vec<&str> {
        turns.iter().map(|t| t.content.as_str()).collect()
    }

    #[tokio::test]
    async fn test_keeps_last_max_messages_in_order() {
        let memory = ConversationMemory::new(10, true);
        for i in 0..13 {
            memory.append("c1", Message::user(format!("m{}", i))).await.unwrap();
        }
        let turns = memory.read("c1").await;
        assert_eq!(turns.len(), 10);
        let expected: Vec<String> = (3..13).map(|i| format!("m{}", i)).collect();
        assert_eq!(contents(&turns), expected.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_forget_removes_window() {
        let memory = ConversationMemory::new(10, true);
        memory.append("a", Message::user("a1")).await.unwrap();
        memory.append("b", Message::user("b1")).await.unwrap();
        assert_eq!(memory.conversations(), 2);

        assert!(memory.forget("a").await);
        assert!(memory.read("a").await.is_empty());
        assert_eq!(memory.conversations(), 1);
        assert_eq!(contents(&memory.read("b").await), vec!["b1"]);

        assert!(!memory.forget("a").await);
        assert!(memory.read("never-seen").await.is_empty());
        assert_eq!(memory.conversations(), 1);
    }

    #[tokio::test]
    async fn test_forget_waits_for_in_flight_request() {
        let memory = Arc::new(ConversationMemory::new(10, true));
        let mut guard = memory.lock("busy").await;

        let forgetting = tokio::spawn({
            let memory = memory.clone();
            async move { memory.forget("busy").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!forgetting.is_finished());

        guard.push(Message::user("late")).unwrap();
        drop(guard);
        assert!(forgetting.await.unwrap());
        assert!(memory.read("busy").await.is_empty());
        assert_eq!(memory.conversations(), 0);
    }

    #[tokio::test]
    async fn test_conversations_are_independent() {
        let memory = ConversationMemory::new(2, true);
        memory.append("a", Message::user("a1")).await.unwrap();
        memory.append("b", Message::user("b1")).await.unwrap();
        memory.append("b", Message::user("b2")).await.unwrap();
        memory.append("b", Message::user("b3")).await.unwrap();

        assert_eq!(contents(&memory.read("a").await), vec!["a1"]);
        assert_eq!(contents(&memory.read("b").await), vec!["b2", "b3"]);
        assert!(memory.read("unknown").await.is_empty());
    }

    #[test]
    fn test_system_turn_is_retained() {
        let mut window = MemoryWindow::new(3, true);
        window.push(Message::system("rules")).unwrap();
        for i in 1..=4 {
            window.push(Message::user(format!("u{}", i))).unwrap();
        }
        assert_eq!(contents(&window.turns()), vec!["rules", "u3", "u4"]);
    }

    #[test]
    fn test_new_system_turn_replaces_old() {
        let mut window = MemoryWindow::new(4, true);
        window.push(Message::system("old rules")).unwrap();
        window.push(Message::user("hi")).unwrap();
        window.push(Message::system("new rules")).unwrap();
        assert_eq!(contents(&window.turns()), vec!["hi", "new rules"]);
    }

    #[test]
    fn test_system_turn_evicted_without_retention() {
        let mut window = MemoryWindow::new(2, false);
        window.push(Message::system("rules")).unwrap();
        window.push(Message::user("u1")).unwrap();
        window.push(Message::user("u2")).unwrap();
        assert_eq!(contents(&window.turns()), vec!["u1", "u2"]);
    }

    #[test]
    fn test_window_of_one_keeps_latest() {
        let mut window = MemoryWindow::new(1, true);
        window.push(Message::system("rules")).unwrap();
        window.push(Message::user("u1")).unwrap();
        assert_eq!(contents(&window.turns()), vec!["u1"]);
    }

    #[tokio::test]
    async fn test_lock_serializes_same_conversation() {
        let memory = Arc::new(ConversationMemory::new(100, true));
        let mut handles = Vec::new();
        for i in 0..8 {
            let memory = memory.clone();
            handles.push(tokio::spawn(async move {
                let mut guard = memory.lock("shared").await;
                let before = guard.len();
                tokio::time::sleep(Duration::from_millis(2)).await;
                guard.push(Message::user(format!("n{}", before))).unwrap();
                guard.push(Message::assistant(format!("r{}", i))).unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let turns = memory.read("shared").await;
        assert_eq!(turns.len(), 16);
        // every request saw the previous request's commit
        for (pair, expected_before) in turns.chunks(2).zip((0..16).step_by(2)) {
            assert_eq!(pair[0].content, format!("n{}", expected_before));
        }
    }

    #[tokio::test]
    async fn test_other_conversations_not_blocked() {
        let memory = ConversationMemory::new(10, true);
        let _held = memory.lock("busy").await;
        let result = tokio::time::timeout(
            Duration::from_millis(200),
            memory.append("free", Message::user("hello")),
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(memory.conversations(), 2);
    }
}
