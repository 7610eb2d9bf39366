//! Debounced network reachability.
//!
//! The platform reports raw connectivity observations with
//! [`NetworkReachabilityMonitor::report`]. A change is only published once
//! the new state has held for the stability window, so a flapping
//! connection does not trigger a storm of reconnects and drains.

use crate::config::ReachabilityConfig;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A published connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityEvent {
    BecameOnline,
    BecameOffline,
}

/// Observes connectivity and exposes a debounced online/offline signal.
///
/// Must be created inside a tokio runtime; the debounce task is spawned on
/// construction.
pub struct NetworkReachabilityMonitor {
    raw: watch::Sender<bool>,
    state: watch::Receiver<bool>,
    events: broadcast::Sender<ReachabilityEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkReachabilityMonitor {
    pub fn new(config: &ReachabilityConfig) -> Self {
        let initial = config.initially_online;
        let (raw_tx, raw_rx) = watch::channel(initial);
        let (state_tx, state_rx) = watch::channel(initial);
        let (events, _) = broadcast::channel(32);

        let task = tokio::spawn(debounce(
            raw_rx,
            state_tx,
            events.clone(),
            config.stability_window(),
        ));

        Self {
            raw: raw_tx,
            state: state_rx,
            events,
            task: Mutex::new(Some(task)),
        }
    }

    /// Feeds a raw connectivity observation from the platform.
    pub fn report(&self, online: bool) {
        self.raw.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    /// Current debounced state.
    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Watches the debounced state.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state.clone()
    }

    /// Subscribes to transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReachabilityEvent> {
        self.events.subscribe()
    }

    /// Stops the debounce task. Safe to call more than once.
    pub fn shutdown(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for NetworkReachabilityMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn debounce(
    mut raw: watch::Receiver<bool>,
    state: watch::Sender<bool>,
    events: broadcast::Sender<ReachabilityEvent>,
    window: Duration,
) {
    loop {
        let candidate = *raw.borrow_and_update();
        if candidate == *state.borrow() {
            if raw.changed().await.is_err() {
                return;
            }
            continue;
        }

        debug!("connectivity observed {}, waiting {:?}", candidate, window);
        tokio::select! {
            _ = tokio::time::sleep(window) => {
                state.send_replace(candidate);
                let event = if candidate {
                    ReachabilityEvent::BecameOnline
                } else {
                    ReachabilityEvent::BecameOffline
                };
                info!("network {:?}", event);
                let _ = events.send(event);
            }
            changed = raw.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
