//! Bounded conversation memory.
//!
//! A [`MemoryWindow`] is the recent-turn view of one session that is fed
//! to the generation step. It is materialised from a [`TurnLog`] (the
//! durable session history) and kept in step with it on every append.
//! Serializing access per session is the owner's job; see the app crate's
//! session manager.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{Role, Turn};
use crate::rerank::RerankAuditEntry;

/// Up to `capacity` most recent turns, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryWindow {
    capacity: usize,
    turns: VecDeque<Turn>,
}

impl MemoryWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            turns: VecDeque::with_capacity(capacity),
        }
    }

    /// Build a window from history, keeping the newest `capacity` turns.
    /// A leading assistant turn whose user turn fell outside the window is
    /// dropped.
    pub fn from_history(capacity: usize, history: Vec<Turn>) -> Self {
        let skip = history.len().saturating_sub(capacity);
        let mut turns: VecDeque<Turn> = history.into_iter().skip(skip).collect();
        if skip > 0 && turns.front().map(|t| t.role) == Some(Role::Assistant) {
            turns.pop_front();
        }
        Self { capacity, turns }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Turns, oldest first.
    pub fn turns(&self) -> Vec<Turn> {
        self.turns.iter().cloned().collect()
    }

    /// Append one turn, evicting from the front. Returns the evicted turns,
    /// oldest first.
    pub fn push(&mut self, turn: Turn) -> Vec<Turn> {
        let mut evicted = Vec::new();
        if self.capacity == 0 {
            evicted.push(turn);
            return evicted;
        }
        while self.turns.len() >= self.capacity {
            if let Some(t) = self.turns.pop_front() {
                evicted.push(t);
            }
        }
        self.turns.push_back(turn);
        evicted
    }

    /// Append a user turn and its reply together. Eviction removes whole
    /// exchanges: an assistant turn left at the front without its user turn
    /// is evicted as well.
    pub fn push_exchange(&mut self, user: Turn, assistant: Turn) -> Vec<Turn> {
        let mut evicted = Vec::new();
        while !self.turns.is_empty() && self.turns.len() + 2 > self.capacity {
            if let Some(t) = self.turns.pop_front() {
                evicted.push(t);
            }
            if self.turns.front().map(|t| t.role) == Some(Role::Assistant) {
                if let Some(t) = self.turns.pop_front() {
                    evicted.push(t);
                }
            }
        }
        evicted.extend(self.push(user));
        evicted.extend(self.push(assistant));
        evicted
    }
}

/// One user turn and the assistant turn that answered it.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub user: Turn,
    pub assistant: Turn,
    /// Re-ranking audit for the assistant turn, empty if stage 2 did not run.
    pub rerank: Vec<RerankAuditEntry>,
}

/// Durable session history.
#[async_trait]
pub trait TurnLog: Send + Sync {
    /// The newest `limit` turns of a session, oldest first.
    async fn recent_turns(&self, session_id: &str, limit: usize) -> Result<Vec<Turn>>;

    /// Append both turns of an exchange, in order.
    async fn append_exchange(&self, session_id: &str, exchange: &Exchange) -> Result<()>;

    /// Whether `session_id` may receive turns. Logs that create sessions
    /// lazily accept every id.
    async fn session_exists(&self, _session_id: &str) -> Result<bool> {
        Ok(true)
    }

    /// Drop a session and its history. Returns false if it did not exist.
    async fn delete_session(&self, session_id: &str) -> Result<bool>;

    /// Drop every session. Returns how many were removed.
    async fn delete_all_sessions(&self) -> Result<usize>;
}

/// [`TurnLog`] kept in process memory.
#[derive(Default)]
pub struct InMemoryTurnLog {
    sessions: Mutex<HashMap<String, Vec<Turn>>>,
}

impl InMemoryTurnLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full history of a session.
    pub fn history(&self, session_id: &str) -> Result<Vec<Turn>> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("turn log lock poisoned"))?;
        Ok(sessions.get(session_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl TurnLog for InMemoryTurnLog {
    async fn recent_turns(&self, session_id: &str, limit: usize) -> Result<Vec<Turn>> {
        let all = self.history(session_id)?;
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }

    async fn append_exchange(&self, session_id: &str, exchange: &Exchange) -> Result<()> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("turn log lock poisoned"))?;
        let log = sessions.entry(session_id.to_string()).or_default();
        log.push(exchange.user.clone());
        log.push(exchange.assistant.clone());
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("turn log lock poisoned"))?;
        Ok(sessions.remove(session_id).is_some())
    }

    async fn delete_all_sessions(&self) -> Result<usize> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("turn log lock poisoned"))?;
        let n = sessions.len();
        sessions.clear();
        Ok(n)
    }
}
