//! Execution context refresh notifications.
//!
//! The hosting process owns one [`ExecutionContext`].  Components that hold
//! state derived from the current configuration subscribe to it explicitly
//! and are called back once per refresh event, in subscription order, before
//! [`ExecutionContext::refresh`] returns.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Observable phase of the execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextPhase {
    /// Normal operation.
    Active,
    /// A refresh is being delivered to subscribers.
    Refreshed,
}

/// Snapshot of the context published to watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContextState {
    pub phase: ContextPhase,
    /// Number of refresh events delivered so far.
    pub epoch: u64,
}

/// Receives context refresh events.
#[async_trait::async_trait]
pub trait RefreshListener: Send + Sync {
    /// Called once for every refresh event.  `epoch` starts at 1.
    async fn context_refreshed(&self, epoch: u64);
}

/// Process-wide lifecycle source.
pub struct ExecutionContext {
    state: watch::Sender<ContextState>,
    listeners: Mutex<Vec<Weak<dyn RefreshListener>>>,
    /// Serialises refresh events so each one is fully delivered before the
    /// next starts.
    refresh_lock: tokio::sync::Mutex<()>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ContextState {
            phase: ContextPhase::Active,
            epoch: 0,
        });
        Self {
            state,
            listeners: Mutex::new(Vec::new()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> ContextState {
        *self.state.borrow()
    }

    /// Watch phase transitions without taking part in them.
    pub fn watch(&self) -> watch::Receiver<ContextState> {
        self.state.subscribe()
    }

    /// Register `listener` for refresh events.
    ///
    /// Only a weak reference is kept; a dropped listener is skipped and
    /// pruned on the next refresh.
    pub fn subscribe(&self, listener: Arc<dyn RefreshListener>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.push(Arc::downgrade(&listener));
        debug!(subscribers = listeners.len(), "refresh listener subscribed");
    }

    /// Deliver one refresh event to every live subscriber.
    ///
    /// Returns the number of subscribers notified.
    pub async fn refresh(&self) -> usize {
        let _serial = self.refresh_lock.lock().await;

        let epoch = self.state().epoch + 1;
        self.state.send_replace(ContextState {
            phase: ContextPhase::Refreshed,
            epoch,
        });

        let live: Vec<Arc<dyn RefreshListener>> = {
            let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };

        for listener in &live {
            listener.context_refreshed(epoch).await;
        }

        self.state.send_replace(ContextState {
            phase: ContextPhase::Active,
            epoch,
        });
        info!(epoch, notified = live.len(), "execution context refreshed");
        live.len()
    }
}
