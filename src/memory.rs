//! Per-session memory windows.
//!
//! Each session id maps to one slot holding its [`MemoryWindow`] behind a
//! `tokio` mutex. A caller holds the slot's guard for the whole
//! read-retrieve-generate-append sequence, so two messages racing on the
//! same session are answered one after the other, each seeing the other's
//! turns. Sessions never share a slot.
//!
//! The slot map itself sits behind a `std` mutex that is only held to look
//! up or insert a slot, never across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use docent_core::error::PipelineError;
use docent_core::memory::{Exchange, MemoryWindow, TurnLog};
use docent_core::models::Turn;

type Slot = Arc<AsyncMutex<Option<MemoryWindow>>>;

pub struct SessionWindows {
    log: Arc<dyn TurnLog>,
    capacity: usize,
    slots: Mutex<HashMap<String, Slot>>,
}

impl SessionWindows {
    /// `capacity` is in turns; one exchange is two turns.
    pub fn new(log: Arc<dyn TurnLog>, capacity: usize) -> Self {
        Self {
            log,
            capacity,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, session_id: &str) -> Result<Slot> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| anyhow!("session slot map lock poisoned"))?;
        Ok(slots.entry(session_id.to_string()).or_default().clone())
    }

    /// Take exclusive ownership of a session's window, loading it from the
    /// turn log on first use. Fails with a validation error if the log does
    /// not know the session.
    pub async fn lock(&self, session_id: &str) -> Result<SessionGuard> {
        let mut guard = self.slot(session_id)?.lock_owned().await;
        if guard.is_none() {
            if !self.log.session_exists(session_id).await? {
                return Err(
                    PipelineError::Validation(format!("Session not found: {}", session_id)).into(),
                );
            }
            let history = self.log.recent_turns(session_id, self.capacity).await?;
            tracing::debug!(session = session_id, turns = history.len(), "loaded memory window");
            *guard = Some(MemoryWindow::from_history(self.capacity, history));
        }
        Ok(SessionGuard {
            session_id: session_id.to_string(),
            guard,
            log: self.log.clone(),
        })
    }

    /// Delete a session from the log and drop its window. Waits for any
    /// message in flight on that session to finish first.
    pub async fn delete(&self, session_id: &str) -> Result<bool> {
        let slot = self.slot(session_id)?;
        let mut guard = slot.clone().lock_owned().await;
        let deleted = self.log.delete_session(session_id).await?;
        *guard = None;
        self.evict(session_id, &slot)?;
        Ok(deleted)
    }

    /// Delete every session and drop all windows.
    pub async fn delete_all(&self) -> Result<usize> {
        let deleted = self.log.delete_all_sessions().await?;
        self.slots
            .lock()
            .map_err(|_| anyhow!("session slot map lock poisoned"))?
            .clear();
        Ok(deleted)
    }

    /// Remove a session's slot if it is still `slot`.
    fn evict(&self, session_id: &str, slot: &Slot) -> Result<()> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| anyhow!("session slot map lock poisoned"))?;
        if slots.get(session_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(session_id);
        }
        Ok(())
    }

    /// Number of sessions with a slot.
    pub fn cached_sessions(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or_default()
    }
}

/// Exclusive access to one session's window.
pub struct SessionGuard {
    session_id: String,
    guard: OwnedMutexGuard<Option<MemoryWindow>>,
    log: Arc<dyn TurnLog>,
}

impl SessionGuard {
    /// Current window, oldest first.
    pub fn turns(&self) -> Vec<Turn> {
        self.guard.as_ref().map(MemoryWindow::turns).unwrap_or_default()
    }

    /// Persist an exchange, then add it to the window. If persisting fails
    /// the window is left as it was.
    pub async fn append_exchange(&mut self, exchange: Exchange) -> Result<()> {
        self.log.append_exchange(&self.session_id, &exchange).await?;
        if let Some(window) = self.guard.as_mut() {
            let evicted = window.push_exchange(exchange.user, exchange.assistant);
            if !evicted.is_empty() {
                tracing::debug!(
                    session = %self.session_id,
                    evicted = evicted.len(),
                    "memory window full, evicted oldest turns"
                );
            }
        }
        Ok(())
    }
}
