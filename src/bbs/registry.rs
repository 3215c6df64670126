//! Process-wide connection table and the node-lock authority.
//!
//! The registry holds only routing identity: a session id and the locked
//! sender of its channel, never session state. Entries appear when
//! negotiation hands off to a session and vanish on disconnect. Negotiator
//! tasks touch it concurrently, so the map lives behind an async mutex.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use serde_json::json;
use tokio::sync::Mutex;

use super::event::{Event, SharedSender};

#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<String, SharedSender>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, sid: &str, sender: SharedSender) {
        info!("{sid} registered");
        self.inner.lock().await.insert(sid.to_owned(), sender);
    }

    pub async fn unregister(&self, sid: &str) {
        if self.inner.lock().await.remove(sid).is_some() {
            info!("{sid} unregistered");
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub async fn sids(&self) -> Vec<String> {
        self.inner.lock().await.keys().cloned().collect()
    }

    /// Deliver one event to a session by id. `false` when the id is unknown
    /// or its channel already closed.
    pub async fn deliver(&self, sid: &str, event: Event) -> bool {
        let sender = { self.inner.lock().await.get(sid).cloned() };
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => {
                debug!("deliver to unknown session {sid}");
                false
            }
        }
    }

    /// Fan an event out to every registered session except `exclude`.
    /// Returns the number of sessions reached.
    pub async fn broadcast(&self, event: Event, exclude: Option<&str>) -> usize {
        let targets: Vec<(String, SharedSender)> = {
            self.inner
                .lock()
                .await
                .iter()
                .filter(|(sid, _)| Some(sid.as_str()) != exclude)
                .map(|(sid, sender)| (sid.clone(), sender.clone()))
                .collect()
        };
        let mut reached = 0;
        for (_, sender) in targets {
            if sender.send(event.clone()).await.is_ok() {
                reached += 1;
            }
        }
        reached
    }

    /// Push a window-size refresh at a session after a mid-session NAWS
    /// update, the engine-side equivalent of the user pressing ^L.
    pub async fn notify_resize(&self, sid: &str, columns: u16, rows: u16) -> bool {
        self.deliver(sid, Event::Refresh(json!(["resize", [columns, rows]]))).await
    }
}

/// Fine-grained named locks, granted over the `lock-<name>` event protocol.
/// Node slots are the locks `node/1` .. `node/63`; sessions never see this
/// table directly, only its replies.
#[derive(Debug, Clone, Default)]
pub struct NodeLockTable {
    held: Arc<Mutex<HashMap<String, String>>>,
}

impl NodeLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `name` to `sid` if free (re-granting to the current holder is
    /// allowed, so a retry after a lost reply cannot deadlock).
    pub async fn acquire(&self, name: &str, sid: &str) -> bool {
        let mut held = self.held.lock().await;
        match held.get(name) {
            None => {
                held.insert(name.to_owned(), sid.to_owned());
                debug!("lock {name} acquired by {sid}");
                true
            }
            Some(holder) if holder == sid => true,
            Some(_) => false,
        }
    }

    /// Release `name` if held by `sid`.
    pub async fn release(&self, name: &str, sid: &str) -> bool {
        let mut held = self.held.lock().await;
        match held.get(name) {
            Some(holder) if holder == sid => {
                held.remove(name);
                debug!("lock {name} released by {sid}");
                true
            }
            _ => false,
        }
    }

    /// Drop every lock held by a disconnected session.
    pub async fn release_all(&self, sid: &str) {
        let mut held = self.held.lock().await;
        let before = held.len();
        held.retain(|_, holder| holder != sid);
        let dropped = before - held.len();
        if dropped > 0 {
            debug!("released {dropped} lock(s) held by {sid}");
        }
    }

    pub async fn holder(&self, name: &str) -> Option<String> {
        self.held.lock().await.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn locks_are_exclusive_until_released() {
        let table = NodeLockTable::new();
        assert!(table.acquire("node/1", "a").await);
        assert!(!table.acquire("node/1", "b").await);
        assert!(table.acquire("node/1", "a").await); // idempotent for holder
        assert!(table.release("node/1", "a").await);
        assert!(table.acquire("node/1", "b").await);
    }

    #[tokio::test]
    async fn release_all_frees_every_slot() {
        let table = NodeLockTable::new();
        table.acquire("node/1", "a").await;
        table.acquire("node/2", "a").await;
        table.acquire("node/3", "b").await;
        table.release_all("a").await;
        assert_eq!(table.holder("node/1").await, None);
        assert_eq!(table.holder("node/3").await, Some("b".into()));
    }
}
