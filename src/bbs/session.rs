//! The per-connection session engine.
//!
//! A `Session` is the isolated unit of execution behind one telnet
//! connection: it owns the script stack, the event buffer, the output
//! transcoder, and the optional recorder, and it talks to the outside world
//! exclusively through its event channel. One session runs per spawned task;
//! a fault in one session never touches another's state.
//!
//! Scripts drive everything through the session handed to their entry point:
//! `read_events` for input and notifications, `write` for output, `node` for
//! the door slot number, `run_script` for synchronous sub-scripts. The
//! `run` loop interprets their outcomes: `Goto` replaces the stack,
//! `Disconnect` ends the session, and any failure unwinds to the calling
//! frame with a short notice to the user.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use log::{debug, error, info, log_enabled, warn, Level};
use serde_json::{json, Value};

use super::encoding::{Encoding, InputDecoder};
use super::event::{ChannelEnd, Event, LockOp, Wait};
use super::recorder::SessionRecorder;
use super::scripting::{ScriptFrame, ScriptOutcome, ScriptRegistry, ScriptResult};
use crate::config::SessionSettings;
use crate::logutil::{escape_bytes, escape_log};

/// Highest node slot probed by the lock protocol.
pub const NODE_MAX: u8 = 63;

/// `page` sender value reserved for the sysop, who may always interrupt.
pub const SYSOP_SENDER: i64 = -1;

/// Pause after a recovery notice so the client receives it before the
/// connection may close.
const RECOVERY_PAUSE: Duration = Duration::from_secs(2);

/// `global` queue bounds: over the high mark, trimmed to the newest `keep`.
const GLOBAL_HIGH_MARK: usize = 150;
const GLOBAL_KEEP: usize = 100;

const RESET: &str = "\x1b[m";
const BOLD_GREEN: &str = "\x1b[1;32m";
const BOLD_CYAN: &str = "\x1b[1;36m";
const RED_REVERSE: &str = "\x1b[31;7m";

/// Engine-level session failures. Script failures are plain `anyhow`
/// errors; these variants are the ones the run loop and callers branch on.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The channel peer is gone or sent a disconnect; terminal.
    #[error("disconnected: {0}")]
    Disconnected(String),
    /// A failure forwarded from the front-end as an `exception` event.
    #[error("{0}")]
    Remote(String),
    /// Script missing from the registry.
    #[error("{0}: no script registered")]
    Resolution(String),
    /// Every node slot in 1..=63 is taken.
    #[error("no free node slot in 1..={NODE_MAX}")]
    NodesExhausted,
}

/// Per-name pending event queues. New entries go to the front, consumers pop
/// from the back, so each queue serves oldest-first. Queues are created
/// lazily on first use and live as long as the session.
#[derive(Debug, Default)]
struct EventBuffer {
    queues: HashMap<String, VecDeque<Value>>,
}

impl EventBuffer {
    fn push(&mut self, name: &str, data: Value) {
        self.queues.entry(name.to_owned()).or_default().push_front(data);
    }

    /// Latest-only semantics: drop anything pending, keep just `data`.
    fn replace(&mut self, name: &str, data: Value) {
        let queue = self.queues.entry(name.to_owned()).or_default();
        queue.clear();
        queue.push_front(data);
    }

    /// Remove and return the oldest entry for `name`.
    fn pop(&mut self, name: &str) -> Option<Value> {
        self.queues.get_mut(name).and_then(|q| q.pop_back())
    }

    fn pop_first(&mut self, names: &[&str]) -> Option<(String, Value)> {
        for name in names {
            if let Some(data) = self.pop(name) {
                return Some(((*name).to_owned(), data));
            }
        }
        None
    }

    fn len(&self, name: &str) -> usize {
        self.queues.get(name).map_or(0, |q| q.len())
    }

    /// Over `high`, keep only the newest `keep` entries.
    fn cap(&mut self, name: &str, high: usize, keep: usize) {
        if let Some(queue) = self.queues.get_mut(name) {
            if queue.len() > high {
                queue.truncate(keep);
            }
        }
    }
}

pub struct Session {
    sid: String,
    env: HashMap<String, String>,
    encoding: Encoding,
    decoder: InputDecoder,
    channel: ChannelEnd,
    scripts: Arc<ScriptRegistry>,
    settings: SessionSettings,
    stack: Vec<ScriptFrame>,
    buffer: EventBuffer,
    recorder: Option<SessionRecorder>,
    node: Option<u8>,
    handle: Option<String>,
    accept_pages: bool,
    activity: String,
    connected_at: Instant,
    connect_time: DateTime<Utc>,
    last_input: Instant,
    closed: bool,
}

impl Session {
    pub fn new(
        sid: impl Into<String>,
        env: HashMap<String, String>,
        channel: ChannelEnd,
        scripts: Arc<ScriptRegistry>,
        settings: SessionSettings,
        initial: ScriptFrame,
    ) -> Self {
        let encoding = settings.default_encoding;
        Self {
            sid: sid.into(),
            env,
            encoding,
            decoder: InputDecoder::for_encoding(encoding),
            channel,
            scripts,
            settings,
            stack: vec![initial],
            buffer: EventBuffer::default(),
            recorder: None,
            node: None,
            handle: None,
            accept_pages: true,
            activity: "<uninitialized>".to_owned(),
            connected_at: Instant::now(),
            connect_time: Utc::now(),
            last_input: Instant::now(),
            closed: false,
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.env
    }

    /// Terminal type, `unknown` when negotiation could not determine one.
    pub fn term(&self) -> &str {
        self.env.get("TERM").map(String::as_str).unwrap_or("unknown")
    }

    pub fn lines(&self) -> u16 {
        self.env.get("LINES").and_then(|v| v.parse().ok()).unwrap_or(24)
    }

    pub fn columns(&self) -> u16 {
        self.env.get("COLUMNS").and_then(|v| v.parse().ok()).unwrap_or(80)
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Switch between the two terminal modes. Also reconfigures the keyboard
    /// decoder; partial multi-byte input pending in the old decoder is
    /// dropped.
    pub fn set_encoding(&mut self, encoding: Encoding) {
        if encoding != self.encoding {
            debug!("{}: encoding is {}", self.sid, encoding);
            self.encoding = encoding;
            self.decoder = InputDecoder::for_encoding(encoding);
        }
    }

    pub fn handle(&self) -> &str {
        self.handle.as_deref().unwrap_or("")
    }

    pub fn set_handle(&mut self, handle: impl Into<String>) {
        let handle = handle.into();
        info!("{}: user {:?} -> {:?}", self.sid, self.handle, handle);
        self.handle = Some(handle);
    }

    pub fn accepts_pages(&self) -> bool {
        self.accept_pages
    }

    pub fn set_accept_pages(&mut self, accept: bool) {
        self.accept_pages = accept;
    }

    pub fn activity(&self) -> &str {
        &self.activity
    }

    /// Update the current-activity label ("who's online" text). On
    /// xterm-family terminals this also retitles the window.
    pub async fn set_activity(&mut self, value: &str) -> Result<()> {
        if self.activity == value {
            return Ok(());
        }
        debug!("{}: activity={}", self.sid, escape_log(value));
        self.activity = value.to_owned();
        let term = self.term();
        if term.contains("xterm") || term.contains("rxvt") {
            let title = format!("\x1b]2;{value}\x07");
            self.write(&title).await?;
        }
        Ok(())
    }

    /// Time since the connection began.
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn connect_time(&self) -> DateTime<Utc> {
        self.connect_time
    }

    /// Time since the last keypress.
    pub fn idle(&self) -> Duration {
        self.last_input.elapsed()
    }

    pub fn current_script(&self) -> Option<&str> {
        self.stack.last().map(|frame| frame.name.as_str())
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    /// The session's node slot, acquiring one over the lock protocol on
    /// first use: probe `node/1` .. `node/63` until the authority grants
    /// one. Exhausting the whole range is a failure.
    pub async fn node(&mut self) -> Result<u8> {
        if let Some(node) = self.node {
            return Ok(node);
        }
        for n in 1..=NODE_MAX {
            let lock = format!("node/{n}");
            self.send_event(Event::Lock { name: lock.clone(), op: LockOp::Acquire }).await?;
            let reply = format!("lock-{lock}");
            if let Some((_, data)) = self.read_events(&[reply.as_str()], Wait::Forever).await? {
                if data == Value::Bool(true) {
                    debug!("{}: node {} acquired", self.sid, n);
                    self.node = Some(n);
                    return Ok(n);
                }
            }
        }
        warn!("{}: all node slots busy", self.sid);
        Err(SessionError::NodesExhausted.into())
    }

    /// Key/value snapshot of session parameters, as answered to `info-req`
    /// and dumped into the recording trailer.
    pub fn info(&self) -> BTreeMap<String, Value> {
        let mut snapshot = BTreeMap::new();
        snapshot.insert("TERM".into(), json!(self.term()));
        snapshot.insert("LINES".into(), json!(self.lines()));
        snapshot.insert("COLUMNS".into(), json!(self.columns()));
        snapshot.insert("sid".into(), json!(self.sid));
        snapshot.insert("handle".into(), json!(self.handle()));
        snapshot.insert(
            "script".into(),
            self.current_script().map_or(Value::Null, |name| json!(name)),
        );
        snapshot.insert(
            "recording-file".into(),
            json!(self.recorder.as_ref().map(|r| r.file_name()).unwrap_or_default()),
        );
        snapshot.insert("connect_time".into(), json!(self.connect_time.to_rfc3339()));
        snapshot.insert("idle".into(), json!(self.idle().as_secs_f64()));
        snapshot.insert("activity".into(), json!(self.activity));
        snapshot.insert("encoding".into(), json!(self.encoding.to_string()));
        snapshot.insert("node".into(), self.node.map_or(Value::Null, |n| json!(n)));
        snapshot
    }

    /// Serialize one event onto the channel. The send path locks the
    /// channel, since the front-end side is shared by several producers.
    pub async fn send_event(&self, event: Event) -> Result<()> {
        if self.settings.tap_events && log_enabled!(Level::Debug) {
            debug!("{}: send {}", self.sid, event.name());
        }
        self.channel
            .send(event)
            .await
            .map_err(|_| SessionError::Disconnected("channel closed".into()))?;
        Ok(())
    }

    /// Write Unicode text to the client and, when enabled, to the session
    /// recording. Transcoding to the client's encoding happens at the
    /// front-end from the `(text, encoding)` pair sent here.
    pub async fn write(&mut self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.send_event(Event::Output { text: text.to_owned(), encoding: self.encoding }).await?;
        if self.settings.tap_output && log_enabled!(Level::Debug) {
            debug!("{}: --> {}", self.sid, escape_log(text));
        }
        if self.settings.record_tty {
            if self.recorder.is_none() {
                let origin = self.sid.split(':').next().unwrap_or(&self.sid).to_owned();
                let recorder = SessionRecorder::create(
                    &self.settings.ttyrec_path,
                    &origin,
                    self.lines(),
                    self.columns(),
                    self.duration(),
                )
                .await?;
                self.recorder = Some(recorder);
            }
            let elapsed = self.duration();
            if let Some(recorder) = self.recorder.as_mut() {
                recorder.write(elapsed, text).await?;
            }
        }
        Ok(())
    }

    /// Non-blocking single-name read.
    pub async fn poll_event(&mut self, name: &str) -> Result<Option<Value>> {
        Ok(self.read_events(&[name], Wait::Poll).await?.map(|(_, data)| data))
    }

    /// Single-name wrapper over [`read_events`](Self::read_events).
    pub async fn read_event(&mut self, name: &str, wait: Wait) -> Result<Option<Value>> {
        Ok(self.read_events(&[name], wait).await?.map(|(_, data)| data))
    }

    /// Drain and return all data buffered for `name`.
    pub async fn flush_event(&mut self, name: &str) -> Result<Vec<Value>> {
        let mut flushed = Vec::new();
        while let Some((_, data)) = self.read_events(&[name], Wait::Poll).await? {
            flushed.push(data);
        }
        if !flushed.is_empty() {
            debug!("{}: flushed {} entries from {}", self.sid, flushed.len(), name);
        }
        Ok(flushed)
    }

    /// Return the first match among `names`: an already-buffered entry
    /// immediately, otherwise pull channel messages through `buffer_event`
    /// until one produces a match or `wait` expires. `Ok(None)` on timeout
    /// or poll miss; channel loss surfaces as
    /// [`SessionError::Disconnected`].
    pub async fn read_events(
        &mut self,
        names: &[&str],
        wait: Wait,
    ) -> Result<Option<(String, Value)>> {
        if let Some(hit) = self.buffer.pop_first(names) {
            return Ok(Some(hit));
        }
        let deadline = match wait {
            Wait::Forever => None,
            Wait::For(timeout) => Some(Instant::now() + timeout),
            Wait::Poll => loop {
                let event = self
                    .channel
                    .try_recv()
                    .map_err(|_| SessionError::Disconnected("channel closed".into()))?;
                match event {
                    None => return Ok(None),
                    Some(event) => {
                        if let Some(hit) = self.dispatch(event, names).await? {
                            return Ok(Some(hit));
                        }
                    }
                }
            },
        };
        loop {
            let event = match deadline {
                None => self
                    .channel
                    .recv()
                    .await
                    .ok_or_else(|| SessionError::Disconnected("channel closed".into()))?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    match tokio::time::timeout(deadline - now, self.channel.recv()).await {
                        Ok(Some(event)) => event,
                        Ok(None) => {
                            return Err(SessionError::Disconnected("channel closed".into()).into())
                        }
                        Err(_) => return Ok(None),
                    }
                }
            };
            if let Some(hit) = self.dispatch(event, names).await? {
                return Ok(Some(hit));
            }
        }
    }

    /// Feed one channel event through the buffering policy and pop it right
    /// back if it produced a match for `names`.
    async fn dispatch(&mut self, event: Event, names: &[&str]) -> Result<Option<(String, Value)>> {
        let tap = self.settings.tap_events && log_enabled!(Level::Debug);
        let label = if tap { Some(event.name()) } else { None };
        let buffered = self.buffer_event(event).await?;
        if let Some(name) = label {
            let disposition = match &buffered {
                Some(key) if names.contains(&key.as_str()) => "caught",
                Some(_) => "buffered",
                None => "handled",
            };
            debug!("{}: event {} {}", self.sid, name, disposition);
        }
        if let Some(name) = buffered {
            if names.contains(&name.as_str()) {
                if let Some(data) = self.buffer.pop(&name) {
                    return Ok(Some((name, data)));
                }
            }
        }
        Ok(None)
    }

    /// Apply the per-kind buffering policy to one inbound event. Returns the
    /// buffer key when the event was queued, `None` when it was handled
    /// inline, and `Err` for the re-raised kinds.
    pub async fn buffer_event(&mut self, event: Event) -> Result<Option<String>> {
        match event {
            // failures forwarded from the other side are re-raised here
            Event::Exception { message } => Err(SessionError::Remote(message).into()),
            Event::Disconnect { reason } => Err(SessionError::Disconnected(reason).into()),

            Event::Global(data) => {
                if data.get(0).and_then(Value::as_str) == Some("AYT") {
                    let reply_to =
                        data.get(1).and_then(Value::as_str).unwrap_or_default().to_owned();
                    let handle = self.handle().to_owned();
                    self.send_event(Event::Route {
                        dest: reply_to,
                        kind: "ACK".into(),
                        sid: self.sid.clone(),
                        data: json!(handle),
                    })
                    .await?;
                    return Ok(None);
                }
                self.buffer.push("global", data);
                self.buffer.cap("global", GLOBAL_HIGH_MARK, GLOBAL_KEEP);
                Ok(Some("global".into()))
            }

            Event::Page { channel, sender } if self.current_script() != Some("chat") => {
                if self.accept_pages || sender == SYSOP_SENDER {
                    info!("{}: page from {}", self.sid, sender);
                    let outcome =
                        self.run_script("chat", vec![json!(channel), json!(sender)]).await?;
                    match outcome {
                        ScriptOutcome::Completed(value) if value_truthy(&value) => {}
                        ScriptOutcome::Completed(_) => {
                            info!("{}: rejected page from {}", self.sid, sender)
                        }
                        ScriptOutcome::Goto(frame) => warn!(
                            "{}: chat requested transfer to {}; ignored",
                            self.sid, frame.name
                        ),
                        ScriptOutcome::Disconnect(reason) => {
                            return Err(SessionError::Disconnected(reason).into())
                        }
                    }
                    // wake any asynchronous UI waiting on refresh
                    self.buffer.replace("refresh", json!("page-return"));
                    Ok(None)
                } else {
                    self.buffer.push("page", json!([channel, sender]));
                    Ok(Some("page".into()))
                }
            }

            Event::InfoReq { sid } => {
                let snapshot = json!(self.info());
                self.send_event(Event::Route {
                    dest: sid,
                    kind: "info-ack".into(),
                    sid: self.sid.clone(),
                    data: snapshot,
                })
                .await?;
                Ok(None)
            }

            Event::Input(data) => {
                self.buffer_input(&data);
                if self.buffer.len("input") > 0 {
                    Ok(Some("input".into()))
                } else {
                    // partial multi-byte sequence, keep waiting
                    Ok(None)
                }
            }

            Event::Refresh(data) => {
                if data.get(0).and_then(Value::as_str) == Some("resize") {
                    if let (Some(columns), Some(rows)) = (
                        data.pointer("/1/0").and_then(Value::as_u64),
                        data.pointer("/1/1").and_then(Value::as_u64),
                    ) {
                        debug!("{}: resize {}x{}", self.sid, columns, rows);
                        self.env.insert("COLUMNS".into(), columns.to_string());
                        self.env.insert("LINES".into(), rows.to_string());
                    }
                }
                self.buffer.replace("refresh", data);
                Ok(Some("refresh".into()))
            }

            other => {
                let name = other.name();
                self.buffer.push(&name, other.payload());
                Ok(Some(name))
            }
        }
    }

    /// Decode raw client bytes into buffered keystrokes and bump the idle
    /// timer.
    fn buffer_input(&mut self, data: &[u8]) {
        self.last_input = Instant::now();
        if self.settings.tap_input && log_enabled!(Level::Debug) {
            debug!("{}: <-- ({}): {}", self.sid, data.len(), escape_bytes(data));
        }
        for key in self.decoder.feed(data) {
            self.buffer.push("input", Value::String(key.to_string()));
        }
    }

    /// Main execution flow: run the top of the script stack until the stack
    /// empties or a disconnect unwinds it.
    pub async fn run(&mut self) -> Result<()> {
        while let Some(frame) = self.stack.last().cloned() {
            debug!(
                "{}: script stack: {:?}",
                self.sid,
                self.stack.iter().map(ScriptFrame::to_string).collect::<Vec<_>>()
            );
            match self.execute(&frame).await {
                Ok(ScriptOutcome::Completed(_)) => {
                    self.stack.pop();
                }
                Ok(ScriptOutcome::Goto(next)) => {
                    debug!("{}: goto {}", self.sid, next);
                    self.stack.clear();
                    self.stack.push(next);
                }
                Ok(ScriptOutcome::Disconnect(reason)) => {
                    info!("{}: disconnected: {}", self.sid, reason);
                    self.close().await;
                    return Ok(());
                }
                Err(err) => {
                    if let Some(SessionError::Disconnected(reason)) =
                        err.downcast_ref::<SessionError>()
                    {
                        info!("{}: disconnected: {}", self.sid, reason);
                        self.close().await;
                        return Ok(());
                    }
                    self.report_failure(&err).await;
                    self.recover().await;
                }
            }
        }
        debug!("{}: end of script stack", self.sid);
        self.close().await;
        Ok(())
    }

    async fn execute(&mut self, frame: &ScriptFrame) -> ScriptResult {
        let script = self
            .scripts
            .resolve(&frame.name)
            .ok_or_else(|| SessionError::Resolution(frame.name.clone()))?;
        script(self, frame.args.clone()).await
    }

    /// Push a frame and execute the named script synchronously, returning
    /// its outcome to the caller. On a normal return the frame is popped; on
    /// failure it stays for stack recovery.
    pub async fn run_script(&mut self, name: &str, args: Vec<Value>) -> ScriptResult {
        if args.is_empty() {
            info!("{}: run script '{}'", self.sid, name);
        } else {
            info!("{}: run script '{}', args {:?}", self.sid, name, args);
        }
        let frame = ScriptFrame::new(name, args);
        self.stack.push(frame.clone());
        let result = self.execute(&frame).await;
        if result.is_ok() {
            self.stack.pop();
        }
        result
    }

    /// Log a script failure in full and, when configured, echo the
    /// diagnostic to the client.
    async fn report_failure(&mut self, err: &anyhow::Error) {
        let diagnostic = format!("{err:#}");
        for line in diagnostic.lines() {
            error!("{}: {}", self.sid, line);
        }
        if self.settings.show_traceback {
            let _ = self.write(&format!("{RESET}\r\n")).await;
            for line in diagnostic.lines() {
                let _ = self.write(&format!("{line}\r\n")).await;
            }
        }
    }

    /// Recover from a general failure using the script stack: drop the
    /// faulted frame and resume the one beneath it, or stop when none
    /// remains.
    async fn recover(&mut self) {
        let Some(fault) = self.stack.pop() else { return };
        let _ = self.write("\r\n\r\n").await;
        match self.stack.last().map(|frame| frame.name.clone()) {
            Some(resume) => {
                warn!("{}: continue {} after failure in {}", self.sid, resume, fault.name);
                let _ = self
                    .write(&format!("{BOLD_GREEN}continue{RESET} {BOLD_CYAN}{resume}{RESET}"))
                    .await;
            }
            None => {
                warn!("{}: stop after failure in {}", self.sid, fault.name);
                let _ = self.write(&format!("{RED_REVERSE}stop{RESET}")).await;
            }
        }
        let _ = self
            .write(&format!(" after error in {BOLD_CYAN}{}{RESET}\r\n", fault.name))
            .await;
        // give the notice time to travel down the channel before the
        // connection may close
        tokio::time::sleep(RECOVERY_PAUSE).await;
    }

    /// Release session resources: recording trailer, node lock, and the
    /// disconnect notice to the front-end. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!("{}: closing session", self.sid);
        let snapshot = self.info();
        if let Some(recorder) = self.recorder.take() {
            if let Err(err) = recorder.stop(self.duration(), &snapshot).await {
                error!("{}: closing recording failed: {:#}", self.sid, err);
            }
        }
        if let Some(node) = self.node.take() {
            let _ = self
                .send_event(Event::Lock { name: format!("node/{node}"), op: LockOp::Release })
                .await;
        }
        let _ = self.send_event(Event::Disconnect { reason: "session close".into() }).await;
    }
}

fn value_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
