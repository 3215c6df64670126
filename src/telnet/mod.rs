//! Telnet option primitives: the byte-level layer the negotiator drives.
//!
//! [`TelnetStream`] owns the transport and an incremental IAC parser that
//! separates application bytes from protocol traffic, tracks remote option
//! state, and folds TTYPE / NEW-ENVIRON / NAWS subnegotiation results into
//! an environment map (`TERM`, `LINES`, `COLUMNS`, ...). It is generic over
//! the transport so tests can drive it over in-memory duplex pipes.
//!
//! Only the handful of options the engine negotiates are understood; any
//! other offer from the client is politely refused.

pub mod negotiate;

use std::collections::HashMap;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::logutil::escape_bytes;

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

/// Echo option, RFC 857.
pub const ECHO: u8 = 1;
/// Suppress go-ahead, RFC 858.
pub const SGA: u8 = 3;
/// Terminal type, RFC 1091.
pub const TTYPE: u8 = 24;
/// Negotiate about window size, RFC 1073.
pub const NAWS: u8 = 31;
/// New environment variables, RFC 1572.
pub const NEW_ENVIRON: u8 = 39;

const TTYPE_IS: u8 = 0;
const TTYPE_SEND: u8 = 1;

const ENV_IS: u8 = 0;
const ENV_SEND: u8 = 1;
const ENV_INFO: u8 = 2;
const ENV_VAR: u8 = 0;
const ENV_VALUE: u8 = 1;
const ENV_ESC: u8 = 2;
const ENV_USERVAR: u8 = 3;

pub const TERM_UNDETECTED: &str = "unknown";

#[derive(Debug, thiserror::Error)]
pub enum TelnetError {
    #[error("connection closed by peer")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What we know about the remote side of one option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptionState {
    #[default]
    Unknown,
    Enabled,
    Disabled,
}

impl OptionState {
    pub fn is_unknown(&self) -> bool {
        matches!(self, OptionState::Unknown)
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, OptionState::Enabled)
    }
}

#[derive(Debug)]
enum ParseState {
    Data,
    Iac,
    Verb(u8),
    SubnegOpt,
    Subneg { opt: u8, buf: Vec<u8>, iac: bool },
}

/// Incremental IAC parser and option tracker. Fed arbitrary chunks, emits
/// application bytes into `app` and any protocol answers into `replies`.
#[derive(Debug)]
struct TelnetCodec {
    state: ParseState,
    remote: HashMap<u8, OptionState>,
    env: HashMap<String, String>,
    resized: Option<(u16, u16)>,
}

impl Default for TelnetCodec {
    fn default() -> Self {
        let mut env = HashMap::new();
        env.insert("TERM".to_owned(), TERM_UNDETECTED.to_owned());
        Self { state: ParseState::Data, remote: HashMap::new(), env, resized: None }
    }
}

impl TelnetCodec {
    fn feed(&mut self, data: &[u8], app: &mut BytesMut, replies: &mut Vec<u8>) {
        for &byte in data {
            match &mut self.state {
                ParseState::Data => {
                    if byte == IAC {
                        self.state = ParseState::Iac;
                    } else {
                        app.put_u8(byte);
                    }
                }
                ParseState::Iac => match byte {
                    IAC => {
                        app.put_u8(IAC);
                        self.state = ParseState::Data;
                    }
                    WILL | WONT | DO | DONT => self.state = ParseState::Verb(byte),
                    SB => self.state = ParseState::SubnegOpt,
                    // NOP, GA, AYT and friends carry no operand
                    _ => self.state = ParseState::Data,
                },
                ParseState::Verb(verb) => {
                    let verb = *verb;
                    self.state = ParseState::Data;
                    self.handle_verb(verb, byte, replies);
                }
                ParseState::SubnegOpt => {
                    self.state = ParseState::Subneg { opt: byte, buf: Vec::new(), iac: false };
                }
                ParseState::Subneg { opt, buf, iac } => {
                    if *iac {
                        match byte {
                            SE => {
                                let opt = *opt;
                                let buf = std::mem::take(buf);
                                self.state = ParseState::Data;
                                self.handle_subneg(opt, &buf);
                            }
                            IAC => {
                                buf.push(IAC);
                                *iac = false;
                            }
                            // malformed subnegotiation, drop it and resync
                            _ => self.state = ParseState::Data,
                        }
                    } else if byte == IAC {
                        *iac = true;
                    } else {
                        buf.push(byte);
                    }
                }
            }
        }
    }

    fn handle_verb(&mut self, verb: u8, opt: u8, replies: &mut Vec<u8>) {
        match verb {
            WILL => match opt {
                TTYPE | NAWS | NEW_ENVIRON | ECHO | SGA => {
                    let state = self.remote.entry(opt).or_default();
                    let fresh = !state.is_enabled();
                    *state = OptionState::Enabled;
                    if fresh && opt == TTYPE {
                        replies.extend_from_slice(&[IAC, SB, TTYPE, TTYPE_SEND, IAC, SE]);
                    }
                    if fresh && opt == NEW_ENVIRON {
                        replies.extend_from_slice(&[IAC, SB, NEW_ENVIRON, ENV_SEND, IAC, SE]);
                    }
                }
                _ => {
                    self.remote.insert(opt, OptionState::Disabled);
                    replies.extend_from_slice(&[IAC, DONT, opt]);
                }
            },
            WONT => {
                self.remote.insert(opt, OptionState::Disabled);
            }
            DO => {
                // We offer echo and suppress-go-ahead ourselves; refuse the rest.
                if opt != ECHO && opt != SGA {
                    replies.extend_from_slice(&[IAC, WONT, opt]);
                }
            }
            _ => {}
        }
    }

    fn handle_subneg(&mut self, opt: u8, buf: &[u8]) {
        match opt {
            TTYPE => {
                if buf.first() == Some(&TTYPE_IS) && buf.len() > 1 {
                    let name = String::from_utf8_lossy(&buf[1..]).trim().to_lowercase();
                    if !name.is_empty() {
                        debug!("TTYPE is {name}");
                        self.env.insert("TERM".to_owned(), name);
                    }
                }
            }
            NAWS => {
                if buf.len() >= 4 {
                    let columns = u16::from_be_bytes([buf[0], buf[1]]);
                    let rows = u16::from_be_bytes([buf[2], buf[3]]);
                    if columns > 0 && rows > 0 {
                        debug!("NAWS {columns}x{rows}");
                        self.env.insert("COLUMNS".to_owned(), columns.to_string());
                        self.env.insert("LINES".to_owned(), rows.to_string());
                        self.resized = Some((columns, rows));
                    }
                }
            }
            NEW_ENVIRON => {
                if matches!(buf.first(), Some(&ENV_IS) | Some(&ENV_INFO)) {
                    self.parse_environ(&buf[1..]);
                }
            }
            _ => debug!("ignoring subnegotiation for option {opt}"),
        }
    }

    /// VAR/USERVAR name, VALUE data, ESC escapes the next byte.
    fn parse_environ(&mut self, buf: &[u8]) {
        fn store(env: &mut HashMap<String, String>, name: &mut Vec<u8>, value: &mut Vec<u8>) {
            if !name.is_empty() {
                let key = String::from_utf8_lossy(name).into_owned();
                let val = String::from_utf8_lossy(value).into_owned();
                debug!("environ {key}={}", escape_bytes(value));
                env.insert(key, val);
            }
            name.clear();
            value.clear();
        }

        #[derive(PartialEq)]
        enum Part {
            Skip,
            Name,
            Value,
        }
        let mut part = Part::Skip;
        let mut name = Vec::new();
        let mut value = Vec::new();
        let mut escaped = false;
        for &byte in buf {
            if escaped {
                escaped = false;
                match part {
                    Part::Name => name.push(byte),
                    Part::Value => value.push(byte),
                    Part::Skip => {}
                }
                continue;
            }
            match byte {
                ENV_VAR | ENV_USERVAR => {
                    store(&mut self.env, &mut name, &mut value);
                    part = Part::Name;
                }
                ENV_VALUE => part = Part::Value,
                ENV_ESC => escaped = true,
                _ => match part {
                    Part::Name => name.push(byte),
                    Part::Value => value.push(byte),
                    Part::Skip => {}
                },
            }
        }
        store(&mut self.env, &mut name, &mut value);
    }
}

/// A telnet connection: transport plus option/environment state. The
/// negotiator and the relay both drive it through [`pump`](Self::pump),
/// which reads whatever arrives within a bounded wait and runs it through
/// the parser.
#[derive(Debug)]
pub struct TelnetStream<S = TcpStream> {
    stream: S,
    peer: String,
    codec: TelnetCodec,
    input: BytesMut,
    // protocol answers not yet on the wire; kept across pump calls so a
    // cancelled write retries instead of dropping them
    pending: Vec<u8>,
    bytes_received: u64,
    last_recv: Instant,
}

impl<S: AsyncRead + AsyncWrite + Unpin> TelnetStream<S> {
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
            codec: TelnetCodec::default(),
            input: BytesMut::with_capacity(256),
            pending: Vec::new(),
            bytes_received: 0,
            last_recv: Instant::now(),
        }
    }

    /// Origin address (`ip:port`), the session id.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Read whatever the client sends within `wait` and parse it. Returns
    /// the number of raw bytes consumed (0 on a quiet interval); EOF is
    /// [`TelnetError::Closed`]. Protocol answers (option refusals, TTYPE
    /// and NEW-ENVIRON requests) are written back inline.
    pub async fn pump(&mut self, wait: Duration) -> Result<usize, TelnetError> {
        self.flush_pending().await?;
        let mut buf = [0u8; 1024];
        match tokio::time::timeout(wait, self.stream.read(&mut buf)).await {
            Err(_) => Ok(0),
            Ok(Ok(0)) => Err(TelnetError::Closed),
            Ok(Ok(n)) => {
                self.bytes_received += n as u64;
                self.last_recv = Instant::now();
                let mut replies = Vec::new();
                self.codec.feed(&buf[..n], &mut self.input, &mut replies);
                self.pending.extend_from_slice(&replies);
                self.flush_pending().await?;
                Ok(n)
            }
            Ok(Err(err)) => Err(err.into()),
        }
    }

    async fn flush_pending(&mut self) -> Result<(), TelnetError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.stream.write_all(&self.pending).await?;
        self.stream.flush().await?;
        self.pending.clear();
        Ok(())
    }

    /// Drain the application bytes collected so far.
    pub fn take_input(&mut self) -> Vec<u8> {
        self.input.split().to_vec()
    }

    /// Time since the last byte arrived.
    pub fn idle(&self) -> Duration {
        self.last_recv.elapsed()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn remote_option(&self, opt: u8) -> OptionState {
        self.codec.remote.get(&opt).copied().unwrap_or_default()
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.codec.env
    }

    pub fn env_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.codec.env
    }

    pub fn term(&self) -> &str {
        self.codec.env.get("TERM").map(String::as_str).unwrap_or(TERM_UNDETECTED)
    }

    /// Window size announced after the most recent NAWS subnegotiation,
    /// cleared by the take.
    pub fn take_resize(&mut self) -> Option<(u16, u16)> {
        self.codec.resized.take()
    }

    /// Send plain text (escape sequences and the like). Must not contain
    /// 0xFF bytes; use [`write_app`](Self::write_app) for arbitrary data.
    pub async fn send_str(&mut self, s: &str) -> Result<(), TelnetError> {
        self.stream.write_all(s.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Send application bytes with IAC bytes doubled, as the protocol
    /// requires (cp437 output legitimately contains 0xFF).
    pub async fn write_app(&mut self, data: &[u8]) -> Result<(), TelnetError> {
        if data.contains(&IAC) {
            let mut escaped = Vec::with_capacity(data.len() + 8);
            for &byte in data {
                escaped.push(byte);
                if byte == IAC {
                    escaped.push(IAC);
                }
            }
            self.stream.write_all(&escaped).await?;
        } else {
            self.stream.write_all(data).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn send_verb(&mut self, verb: u8, opt: u8) -> Result<(), TelnetError> {
        self.stream.write_all(&[IAC, verb, opt]).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn request_will_echo(&mut self) -> Result<(), TelnetError> {
        self.send_verb(WILL, ECHO).await
    }

    pub async fn request_will_sga(&mut self) -> Result<(), TelnetError> {
        self.send_verb(WILL, SGA).await
    }

    pub async fn request_do_sga(&mut self) -> Result<(), TelnetError> {
        self.send_verb(DO, SGA).await
    }

    pub async fn request_do_ttype(&mut self) -> Result<(), TelnetError> {
        self.send_verb(DO, TTYPE).await
    }

    pub async fn request_do_naws(&mut self) -> Result<(), TelnetError> {
        self.send_verb(DO, NAWS).await
    }

    pub async fn request_do_env(&mut self) -> Result<(), TelnetError> {
        self.send_verb(DO, NEW_ENVIRON).await
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

impl TelnetStream<TcpStream> {
    /// tokio sockets are already non-blocking; disable Nagle so negotiation
    /// probes and prompts leave immediately.
    pub fn set_socket_opts(&self) -> std::io::Result<()> {
        self.stream.set_nodelay(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(codec: &mut TelnetCodec, data: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut app = BytesMut::new();
        let mut replies = Vec::new();
        codec.feed(data, &mut app, &mut replies);
        (app.to_vec(), replies)
    }

    #[test]
    fn plain_bytes_pass_through() {
        let mut codec = TelnetCodec::default();
        let (app, replies) = feed(&mut codec, b"hello");
        assert_eq!(app, b"hello");
        assert!(replies.is_empty());
    }

    #[test]
    fn doubled_iac_is_a_literal_byte() {
        let mut codec = TelnetCodec::default();
        let (app, _) = feed(&mut codec, &[b'a', IAC, IAC, b'b']);
        assert_eq!(app, vec![b'a', IAC, b'b']);
    }

    #[test]
    fn will_ttype_requests_the_name() {
        let mut codec = TelnetCodec::default();
        let (_, replies) = feed(&mut codec, &[IAC, WILL, TTYPE]);
        assert_eq!(replies, vec![IAC, SB, TTYPE, TTYPE_SEND, IAC, SE]);
        assert!(codec.remote.get(&TTYPE).unwrap().is_enabled());
        // a repeated WILL must not loop another request
        let (_, replies) = feed(&mut codec, &[IAC, WILL, TTYPE]);
        assert!(replies.is_empty());
    }

    #[test]
    fn ttype_is_sets_term_lowercased() {
        let mut codec = TelnetCodec::default();
        let mut seq = vec![IAC, SB, TTYPE, TTYPE_IS];
        seq.extend_from_slice(b"ANSI");
        seq.extend_from_slice(&[IAC, SE]);
        feed(&mut codec, &seq);
        assert_eq!(codec.env.get("TERM").unwrap(), "ansi");
    }

    #[test]
    fn naws_sets_dimensions_and_resize() {
        let mut codec = TelnetCodec::default();
        feed(&mut codec, &[IAC, SB, NAWS, 0, 132, 0, 50, IAC, SE]);
        assert_eq!(codec.env.get("COLUMNS").unwrap(), "132");
        assert_eq!(codec.env.get("LINES").unwrap(), "50");
        assert_eq!(codec.resized, Some((132, 50)));
    }

    #[test]
    fn environ_is_parses_var_value_pairs() {
        let mut codec = TelnetCodec::default();
        let mut seq = vec![IAC, SB, NEW_ENVIRON, ENV_IS, ENV_VAR];
        seq.extend_from_slice(b"LANG");
        seq.push(ENV_VALUE);
        seq.extend_from_slice(b"en_US.UTF-8");
        seq.push(ENV_VAR);
        seq.extend_from_slice(b"USER");
        seq.push(ENV_VALUE);
        seq.extend_from_slice(b"jojo");
        seq.extend_from_slice(&[IAC, SE]);
        feed(&mut codec, &seq);
        assert_eq!(codec.env.get("LANG").unwrap(), "en_US.UTF-8");
        assert_eq!(codec.env.get("USER").unwrap(), "jojo");
    }

    #[test]
    fn unknown_will_is_refused() {
        let mut codec = TelnetCodec::default();
        let (_, replies) = feed(&mut codec, &[IAC, WILL, 34]);
        assert_eq!(replies, vec![IAC, DONT, 34]);
    }
}
