use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = HashMap<String, Arc<AsyncMutex<()>>>;

/// Registry of per-session write locks.
///
/// Every mutating engine operation holds its session's guard for the
/// read-modify-write section only. Different sessions never contend. An
/// entry lives only while some task holds or waits on it.
#[derive(Clone, Default)]
pub struct SessionLocks {
    inner: Arc<Mutex<LockMap>>,
}

/// Write lock of one session. Dropping it removes the registry entry when
/// no other task is waiting for the same session.
pub struct SessionGuard {
    guard: Option<OwnedMutexGuard<()>>,
    session_id: String,
    registry: Arc<Mutex<LockMap>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the write lock of a session.
    pub async fn acquire(&self, session_id: &str) -> SessionGuard {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(session_id.to_string()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        SessionGuard {
            guard: Some(guard),
            session_id: session_id.to_string(),
            registry: self.inner.clone(),
        }
    }

    /// Number of sessions with a registered lock.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        // Unlock first so the guard's own handle no longer counts.
        self.guard.take();
        let mut map = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = map.get(&self.session_id) {
            if Arc::strong_count(lock) == 1 {
                map.remove(&self.session_id);
            }
        }
    }
}
