//! Typed event protocol between the telnet front-end and a session.
//!
//! Every message crossing the session boundary is one `Event`. The set of
//! kinds is closed; script-defined traffic travels as [`Event::Custom`].
//! Events are buffered and matched by their *name*, a stable string key,
//! so a reply to `lock-node/7` can be awaited the same way as `input`.
//!
//! A channel end may be written by several concurrent producers (the relay's
//! I/O loop and the session itself share the front-end side), so the send
//! path is serialized behind a per-channel async mutex.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use super::encoding::Encoding;

/// How long `read_events` may suspend.
#[derive(Debug, Clone, Copy)]
pub enum Wait {
    /// Block until a match or the channel closes.
    Forever,
    /// Drain whatever is immediately available, never suspend.
    Poll,
    /// Block up to the given duration.
    For(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockOp {
    Acquire,
    Release,
}

/// One framed message on the session channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum Event {
    /// Raw client bytes, front-end to session.
    Input(Vec<u8>),
    /// Session text for the client; the front-end transcodes per `encoding`.
    Output { text: String, encoding: Encoding },
    /// Latest-only notification; `["resize", [cols, rows]]` also updates the
    /// session's live terminal dimensions.
    Refresh(Value),
    /// Broadcast fan-out, `[tag, ...]`. `["AYT", reply_sid]` is answered
    /// inline; everything else is buffered with a bounded queue.
    Global(Value),
    /// Instant-chat request from another session.
    Page { channel: i64, sender: i64 },
    /// Ask a session to publish its info snapshot back to `sid`.
    InfoReq { sid: String },
    /// Addressed reply envelope, delivered to `dest` by the front-end.
    Route { dest: String, kind: String, sid: String, data: Value },
    /// Node/lock protocol request against the front-end lock authority.
    Lock { name: String, op: LockOp },
    /// Authority answer to an acquire; shares the request's `lock-<name>` key.
    LockReply { name: String, granted: bool },
    /// Session is ending.
    Disconnect { reason: String },
    /// Failure to re-raise inside the receiving session.
    Exception { message: String },
    /// Log record forwarded to the front-end's log facade.
    Log { level: String, target: String, message: String },
    /// Script-defined event.
    Custom { name: String, data: Value },
}

impl Event {
    /// The buffering/dispatch key for this event.
    pub fn name(&self) -> String {
        match self {
            Event::Input(_) => "input".into(),
            Event::Output { .. } => "output".into(),
            Event::Refresh(_) => "refresh".into(),
            Event::Global(_) => "global".into(),
            Event::Page { .. } => "page".into(),
            Event::InfoReq { .. } => "info-req".into(),
            Event::Route { .. } => "route".into(),
            Event::Lock { name, .. } | Event::LockReply { name, .. } => format!("lock-{name}"),
            Event::Disconnect { .. } => "disconnect".into(),
            Event::Exception { .. } => "exception".into(),
            Event::Log { .. } => "logger".into(),
            Event::Custom { name, .. } => name.clone(),
        }
    }

    /// The opaque payload stored when this event lands in a session buffer.
    pub fn payload(self) -> Value {
        match self {
            Event::Input(data) => json!(data),
            Event::Output { text, encoding } => json!([text, encoding.to_string()]),
            Event::Refresh(data) | Event::Global(data) => data,
            Event::Page { channel, sender } => json!([channel, sender]),
            Event::InfoReq { sid } => json!([sid]),
            Event::Route { dest, kind, sid, data } => json!([dest, kind, sid, data]),
            Event::Lock { op, .. } => json!([op, Value::Null]),
            Event::LockReply { granted, .. } => json!(granted),
            Event::Disconnect { reason } => json!(reason),
            Event::Exception { message } => json!(message),
            Event::Log { level, target, message } => json!([level, target, message]),
            Event::Custom { data, .. } => data,
        }
    }
}

/// Sending half of a channel end, cloneable for the registry. All clones
/// share one mutex, keeping sends on a channel mutually exclusive.
#[derive(Debug, Clone)]
pub struct SharedSender {
    tx: Arc<Mutex<mpsc::UnboundedSender<Event>>>,
}

impl SharedSender {
    /// Send one event. `Err` means the receiving side is gone; for a
    /// session channel that is the disconnect signal.
    pub async fn send(&self, event: Event) -> Result<(), ChannelClosed> {
        let tx = self.tx.lock().await;
        tx.send(event).map_err(|_| ChannelClosed)
    }
}

/// One end of the bidirectional session channel.
#[derive(Debug)]
pub struct ChannelEnd {
    tx: SharedSender,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl ChannelEnd {
    pub async fn send(&self, event: Event) -> Result<(), ChannelClosed> {
        self.tx.send(event).await
    }

    /// `None` once the peer end has been dropped.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking receive; `Ok(None)` when nothing is pending.
    pub fn try_recv(&mut self) -> Result<Option<Event>, ChannelClosed> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(ChannelClosed),
        }
    }

    /// A cloneable handle onto this end's locked send path.
    pub fn sender(&self) -> SharedSender {
        self.tx.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event channel closed")]
pub struct ChannelClosed;

/// Build the duplex channel between a front-end and a session. Messages on
/// each direction are delivered in send order.
pub fn event_channel() -> (ChannelEnd, ChannelEnd) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let session = ChannelEnd {
        tx: SharedSender { tx: Arc::new(Mutex::new(a_tx)) },
        rx: b_rx,
    };
    let front = ChannelEnd {
        tx: SharedSender { tx: Arc::new(Mutex::new(b_tx)) },
        rx: a_rx,
    };
    (session, front)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_cross_in_send_order() {
        let (session, mut front) = event_channel();
        session.send(Event::Disconnect { reason: "a".into() }).await.unwrap();
        session.send(Event::Disconnect { reason: "b".into() }).await.unwrap();
        let first = front.recv().await.unwrap();
        let second = front.recv().await.unwrap();
        assert!(matches!(first, Event::Disconnect { reason } if reason == "a"));
        assert!(matches!(second, Event::Disconnect { reason } if reason == "b"));
    }

    #[test]
    fn lock_request_and_reply_share_a_name() {
        let req = Event::Lock { name: "node/7".into(), op: LockOp::Acquire };
        let reply = Event::LockReply { name: "node/7".into(), granted: true };
        assert_eq!(req.name(), "lock-node/7");
        assert_eq!(req.name(), reply.name());
    }

    #[tokio::test]
    async fn send_fails_after_peer_drop() {
        let (session, front) = event_channel();
        drop(front);
        let err = session.send(Event::Input(vec![b'x'])).await;
        assert_eq!(err, Err(ChannelClosed));
    }
}
