//! Registry of running session monitors.
//!
//! Monitors share no state; the registry only keeps their control handles so
//! a caller juggling several jobs can look one up, stop them all on shutdown,
//! and forget sessions that have already closed.
//!
//! # Thread Safety
//!
//! [`MonitorRegistry`] uses interior mutability with [`RwLock`] and can be
//! shared across tasks behind an `Arc`.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tracing::{debug, info};

use crate::monitor::MonitorHandle;

/// Handles of running monitors, keyed by session id.
#[derive(Default)]
pub struct MonitorRegistry {
    handles: RwLock<HashMap<String, MonitorHandle>>,
}

impl MonitorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handle, returning the one it replaced.
    pub fn register(&self, handle: MonitorHandle) -> Option<MonitorHandle> {
        let session_id = handle.session_id().to_string();
        debug!(session_id = %session_id, "Registering monitor");
        self.handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id, handle)
    }

    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<MonitorHandle> {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<MonitorHandle> {
        self.handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops handles of closed sessions. Returns how many were removed.
    pub fn prune_closed(&self) -> usize {
        let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);
        let before = handles.len();
        handles.retain(|_, handle| !handle.is_closed());
        let removed = before - handles.len();
        if removed > 0 {
            debug!(removed, "Pruned closed monitors");
        }
        removed
    }

    /// Stops every registered monitor and empties the registry.
    pub async fn stop_all(&self) {
        let handles: Vec<MonitorHandle> = self
            .handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handle)| handle)
            .collect();

        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "Stopping all monitors");
        for handle in handles {
            handle.stop().await;
        }
    }
}

impl std::fmt::Debug for MonitorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.handles.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("MonitorRegistry")
            .field("monitors", &len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, JobApi};
    use crate::monitor::SessionMonitor;
    use crate::transport::{FrameStream, PushTransport, TransportError};
    use crate::types::JobRecord;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Silent;

    #[async_trait]
    impl PushTransport for Silent {
        async fn connect(&self, _session_id: &str) -> Result<FrameStream, TransportError> {
            std::future::pending().await
        }
    }

    #[async_trait]
    impl JobApi for Silent {
        async fn poll_records(&self, _session_id: &str) -> Result<Vec<JobRecord>, ApiError> {
            Ok(Vec::new())
        }

        async fn list_records(&self) -> Result<Vec<JobRecord>, ApiError> {
            Ok(Vec::new())
        }

        async fn cancel(&self, _session_id: &str) -> Result<(), ApiError> {
            Ok(())
        }
    }

    fn started(session_id: &str) -> SessionMonitor {
        let mut monitor = SessionMonitor::new(session_id, Arc::new(Silent), Arc::new(Silent));
        monitor.start();
        monitor
    }

    #[tokio::test(start_paused = true)]
    async fn register_get_remove() {
        let registry = MonitorRegistry::new();
        let monitor = started("a");

        assert!(registry.register(monitor.handle().unwrap()).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().session_id(), "a");
        assert!(registry.get("b").is_none());

        assert!(registry.remove("a").is_some());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_closes_every_session() {
        let registry = MonitorRegistry::new();
        let first = started("a");
        let second = started("b");
        registry.register(first.handle().unwrap());
        registry.register(second.handle().unwrap());

        registry.stop_all().await;

        assert!(registry.is_empty());
        assert!(first.snapshot().is_closed());
        assert!(second.snapshot().is_closed());
        assert_eq!(first.snapshot().pending_timers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn prune_removes_closed_sessions() {
        let registry = MonitorRegistry::new();
        let mut first = started("a");
        let second = started("b");
        registry.register(first.handle().unwrap());
        registry.register(second.handle().unwrap());

        first.stop().await;
        assert_eq!(registry.prune_closed(), 1);
        assert!(registry.get("a").is_none());
        assert!(registry.get("b").is_some());
    }
}
