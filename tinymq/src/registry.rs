use std::time::Duration;

use dashmap::DashMap;

use crate::session::SessionHandle;
use crate::types::{ClientId, Reason};

/// Live sessions by client id. At most one session is registered per client id.
#[derive(Default)]
pub struct Registry {
    sessions: DashMap<ClientId, SessionHandle, ahash::RandomState>,
}

impl Registry {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops the session registered for `client_id`, if any, with [`Reason::TakenOver`] and waits
    /// up to `timeout` for its teardown. Its entry is gone when this returns.
    pub async fn evict(&self, client_id: &ClientId, timeout: Duration) -> Option<SessionHandle> {
        let prev = self.get(client_id)?;
        take_over(&prev, timeout).await;
        self.sessions.remove_if(client_id, |_, h| h.id() == prev.id());
        Some(prev)
    }

    /// Registers `handle`, replacing any session with the same client id. The replaced session is
    /// told to stop with [`Reason::TakenOver`] and is waited for, up to `timeout`.
    pub async fn register(&self, handle: SessionHandle, timeout: Duration) -> Option<SessionHandle> {
        let prev = self.sessions.insert(handle.client_id.clone(), handle)?;
        take_over(&prev, timeout).await;
        Some(prev)
    }

    /// Removes the entry for `handle.client_id` only if it still belongs to `handle`.
    #[inline]
    pub fn unregister(&self, handle: &SessionHandle) -> bool {
        self.sessions.remove_if(&handle.client_id, |_, h| h.id() == handle.id()).is_some()
    }

    #[inline]
    pub fn get(&self, client_id: &ClientId) -> Option<SessionHandle> {
        self.sessions.get(client_id).map(|entry| entry.value().clone())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Stops every live session with [`Reason::ServerShutdown`] and waits until the registry is
    /// empty. Returns false if sessions remain after `timeout`.
    pub async fn shutdown_all(&self, timeout: Duration) -> bool {
        let handles = self.handles();
        log::info!("shutting down {} sessions", handles.len());
        for handle in handles.iter() {
            handle.kick(Reason::ServerShutdown);
        }
        let drained = tokio::time::timeout(timeout, async {
            for handle in handles.iter() {
                handle.finished().await;
            }
        })
        .await
        .is_ok();
        if !drained {
            let remaining = self.handles().into_iter().filter(|h| !h.is_finished()).count();
            log::warn!("{} sessions still running after {:?}", remaining, timeout);
        }
        drained && self.is_empty()
    }
}

async fn take_over(prev: &SessionHandle, timeout: Duration) {
    if !prev.kick_and_wait(Reason::TakenOver, timeout).await {
        log::warn!("{:?} previous session {} did not finish within {:?}", prev.client_id, prev.id(), timeout);
    }
}
