//! Checkpoint store for suspended and running sessions

use super::state::ResearchState;
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

/// Persistence of research state keyed by session id
///
/// Saves may be replayed; a later save of the same session overwrites the
/// earlier one.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, state: &ResearchState) -> Result<()>;

    async fn load(&self, session_id: Uuid) -> Result<Option<ResearchState>>;

    async fn delete(&self, session_id: Uuid) -> Result<bool>;
}

/// Process-local store
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<Uuid, ResearchState>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save(&self, state: &ResearchState) -> Result<()> {
        self.sessions.insert(state.session_id(), state.clone());
        Ok(())
    }

    async fn load(&self, session_id: Uuid) -> Result<Option<ResearchState>> {
        Ok(self.sessions.get(&session_id).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, session_id: Uuid) -> Result<bool> {
        Ok(self.sessions.remove(&session_id).is_some())
    }
}
