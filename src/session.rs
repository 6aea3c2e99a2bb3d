use crate::types::{OAuthSession, PendingAuthorization};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Key-value storage for sessions and in-flight authorizations.
///
/// Sessions are keyed by an opaque session id, pending authorizations by
/// their state token. Implementations backed by an external store must make
/// `compare_and_swap` and `take_pending` atomic.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<OAuthSession>>;

    async fn set(&self, session_id: &str, session: OAuthSession) -> Result<()>;

    /// Replace the session only if its current refresh token is `expected_refresh_token`.
    async fn compare_and_swap(
        &self,
        session_id: &str,
        expected_refresh_token: &str,
        session: OAuthSession,
    ) -> Result<bool>;

    async fn delete(&self, session_id: &str) -> Result<bool>;

    async fn put_pending(&self, pending: PendingAuthorization) -> Result<()>;

    /// Remove and return the pending authorization for `state_token`.
    async fn take_pending(&self, state_token: &str) -> Result<Option<PendingAuthorization>>;

    /// Drop pending authorizations older than `ttl`, returning how many were removed.
    async fn purge_expired_pending(&self, ttl: Duration) -> Result<usize>;
}

/// Upper bound on in-flight logins held by [`MemorySessionStore`].
pub const DEFAULT_MAX_PENDING: usize = 10_000;

#[derive(Debug)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, OAuthSession>>,
    pending: RwLock<HashMap<String, PendingAuthorization>>,
    max_pending: usize,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::with_max_pending(DEFAULT_MAX_PENDING)
    }

    /// Once `max_pending` logins are in flight, starting another evicts the oldest.
    pub fn with_max_pending(max_pending: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            max_pending: max_pending.max(1),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<OAuthSession>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn set(&self, session_id: &str, session: OAuthSession) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), session);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        session_id: &str,
        expected_refresh_token: &str,
        session: OAuthSession,
    ) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(current) if current.refresh_token == expected_refresh_token => {
                *current = session;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        Ok(self.sessions.write().await.remove(session_id).is_some())
    }

    async fn put_pending(&self, pending: PendingAuthorization) -> Result<()> {
        let mut entries = self.pending.write().await;
        if entries.len() >= self.max_pending && !entries.contains_key(&pending.state_token) {
            let oldest = entries
                .values()
                .min_by_key(|p| p.created_at)
                .map(|p| p.state_token.clone());
            if let Some(oldest) = oldest {
                warn!("Pending authorization limit reached, evicting oldest");
                entries.remove(&oldest);
            }
        }
        entries.insert(pending.state_token.clone(), pending);
        Ok(())
    }

    async fn take_pending(&self, state_token: &str) -> Result<Option<PendingAuthorization>> {
        Ok(self.pending.write().await.remove(state_token))
    }

    async fn purge_expired_pending(&self, ttl: Duration) -> Result<usize> {
        let now = Utc::now();
        let mut pending = self.pending.write().await;
        let before = pending.len();
        pending.retain(|_, p| !p.is_expired(ttl, now));
        let removed = before - pending.len();
        if removed > 0 {
            debug!("Purged {} expired pending authorizations", removed);
        }
        Ok(removed)
    }
}

/// Per-session mutexes that serialize refresh-token rotation.
///
/// Entries are weak so a session's mutex goes away once no refresh holds it.
#[derive(Debug, Default)]
pub struct RefreshLocks {
    locks: Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl RefreshLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, weak| weak.strong_count() > 0);
            match locks.get(session_id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(Mutex::new(()));
                    locks.insert(session_id.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    pub async fn active_count(&self) -> usize {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, weak| weak.strong_count() > 0);
        locks.len()
    }
}

pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}
