//! # BBS Server - connection front-end
//!
//! The `BbsServer` accepts telnet connections and runs one service task per
//! connection: negotiate terminal capabilities, spawn the session task, then
//! relay between the socket and the session's event channel until either
//! side goes away.
//!
//! The relay is the session's only window on the world. Inbound socket bytes
//! become `input` events; `output` events come back through the encoding
//! transcoder onto the wire; `lock-*` requests are answered from the shared
//! [`NodeLockTable`]; `route` and `global` events fan out through the
//! [`ConnectionRegistry`]; a mid-session NAWS update becomes a `refresh`
//! resize event. Sessions share nothing with each other or with the
//! front-end beyond these messages.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};

use super::event::{event_channel, ChannelEnd, Event, LockOp};
use super::registry::{ConnectionRegistry, NodeLockTable};
use super::scripting::{ScriptFrame, ScriptRegistry};
use super::session::Session;
use crate::config::Config;
use crate::telnet::negotiate::Negotiator;
use crate::telnet::{TelnetError, TelnetStream, TERM_UNDETECTED};

/// Socket poll granularity of the relay loop.
const RELAY_POLL: Duration = Duration::from_millis(100);

pub struct BbsServer {
    config: Config,
    registry: ConnectionRegistry,
    locks: NodeLockTable,
    scripts: Arc<ScriptRegistry>,
}

impl BbsServer {
    pub fn new(config: Config, scripts: ScriptRegistry) -> Self {
        Self {
            config,
            registry: ConnectionRegistry::new(),
            locks: NodeLockTable::new(),
            scripts: Arc::new(scripts),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Accept connections until shutdown (ctrl-c).
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.telnet.bind).await?;
        info!("{} listening on {}", self.config.bbs.name, self.config.telnet.bind);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, addr) = accepted?;
                    info!("{addr} connected");
                    let registry = self.registry.clone();
                    let locks = self.locks.clone();
                    let scripts = self.scripts.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        service_connection(socket, addr.to_string(), registry, locks, scripts, config)
                            .await;
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    return Ok(());
                }
            }
        }
    }
}

/// One connection, start to finish: negotiate, hand off to a session task,
/// relay until disconnect, clean up.
async fn service_connection(
    socket: TcpStream,
    sid: String,
    registry: ConnectionRegistry,
    locks: NodeLockTable,
    scripts: Arc<ScriptRegistry>,
    config: Config,
) {
    let client = TelnetStream::new(socket, sid.clone());
    if let Err(err) = client.set_socket_opts() {
        warn!("{sid}: socket options: {err}");
    }
    let mut client = match Negotiator::new(client).run().await {
        Ok(client) => client,
        Err(err) => {
            info!("{sid}: connection closed during negotiation: {err}");
            return;
        }
    };

    let env = session_env(client.env());
    let (session_end, mut front) = event_channel();
    registry.register(&sid, front.sender()).await;

    let initial = ScriptFrame::new(config.bbs.matrix_script.clone(), vec![]);
    let mut session =
        Session::new(sid.clone(), env, session_end, scripts, config.session.clone(), initial);
    let session_sid = sid.clone();
    tokio::spawn(async move {
        if let Err(err) = session.run().await {
            error!("{session_sid}: session ended abnormally: {err:#}");
        }
    });

    if let Err(err) = relay(&mut client, &mut front, &registry, &locks, &sid).await {
        info!("{sid}: connection closed: {err}");
    }
    client.shutdown().await;
    registry.unregister(&sid).await;
    locks.release_all(&sid).await;
    info!("{sid} disconnected");
}

/// Environment handed to the session, with negotiation results and hard
/// defaults for anything the client never answered.
fn session_env(negotiated: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env = negotiated.clone();
    env.entry("TERM".to_owned()).or_insert_with(|| TERM_UNDETECTED.to_owned());
    env.entry("LINES".to_owned()).or_insert_with(|| "24".to_owned());
    env.entry("COLUMNS".to_owned()).or_insert_with(|| "80".to_owned());
    env
}

/// Pump bytes and events between one socket and one session until either
/// side disconnects.
async fn relay(
    client: &mut TelnetStream,
    front: &mut ChannelEnd,
    registry: &ConnectionRegistry,
    locks: &NodeLockTable,
    sid: &str,
) -> Result<(), TelnetError> {
    loop {
        tokio::select! {
            pumped = client.pump(RELAY_POLL) => {
                match pumped {
                    Ok(_) => {
                        let input = client.take_input();
                        if !input.is_empty() && front.send(Event::Input(input)).await.is_err() {
                            // session task is gone
                            return Ok(());
                        }
                        if let Some((columns, rows)) = client.take_resize() {
                            registry.notify_resize(sid, columns, rows).await;
                        }
                    }
                    Err(err) => {
                        let _ = front
                            .send(Event::Exception { message: format!("connection lost: {err}") })
                            .await;
                        return Err(err);
                    }
                }
            }
            event = front.recv() => {
                let Some(event) = event else {
                    return Ok(());
                };
                match event {
                    Event::Output { text, encoding } => {
                        client.write_app(&encoding.encode(&text)).await?;
                    }
                    Event::Route { dest, kind, sid: from, data } => {
                        deliver_route(registry, &dest, &kind, &from, data).await;
                    }
                    Event::Global(data) => {
                        let reached = registry.broadcast(Event::Global(data), Some(sid)).await;
                        debug!("{sid}: global event reached {reached} session(s)");
                    }
                    Event::Lock { name, op: LockOp::Acquire } => {
                        let granted = locks.acquire(&name, sid).await;
                        if front.send(Event::LockReply { name, granted }).await.is_err() {
                            return Ok(());
                        }
                    }
                    Event::Lock { name, op: LockOp::Release } => {
                        locks.release(&name, sid).await;
                    }
                    Event::Disconnect { reason } => {
                        info!("{sid}: session ended: {reason}");
                        return Ok(());
                    }
                    Event::Log { level, target, message } => {
                        forward_log(&level, &target, &message);
                    }
                    other => debug!("{sid}: unroutable event {} from session", other.name()),
                }
            }
        }
    }
}

/// Deliver an addressed reply envelope. `page` arrives at the destination
/// as a first-class page; anything else as a custom event named by `kind`
/// carrying `[sender-sid, data]`.
async fn deliver_route(
    registry: &ConnectionRegistry,
    dest: &str,
    kind: &str,
    from: &str,
    data: Value,
) {
    let event = if kind == "page" {
        let channel = data.get(0).and_then(Value::as_i64).unwrap_or(0);
        let sender = data.get(1).and_then(Value::as_i64).unwrap_or(0);
        Event::Page { channel, sender }
    } else {
        Event::Custom { name: kind.to_owned(), data: json!([from, data]) }
    };
    if !registry.deliver(dest, event).await {
        debug!("route {kind} to unknown session {dest}");
    }
}

/// Session log records arrive over the channel and re-enter the process
/// log facade here.
fn forward_log(level: &str, target: &str, message: &str) {
    let level = level.parse().unwrap_or(log::Level::Info);
    log::log!(target: "session", level, "[{target}] {message}");
}
