//! # telbbs - a multi-user telnet Bulletin Board System engine
//!
//! telbbs serves many concurrent telnet users, each in a fully isolated
//! session: a crash or hang in one user's script never affects another. A
//! short-lived negotiator probes each inbound connection for telnet options,
//! terminal type, and window size (with fallbacks for uncooperative
//! clients), then hands off to a long-lived session task that runs a stack
//! of interactive scripts, exchanging framed events with the front-end over
//! a private channel.
//!
//! ## Features
//!
//! - **Terminal negotiation**: NEW-ENVIRON, TTYPE, and NAWS probing under
//!   soft timeouts, with a cursor-position fallback for clients that answer
//!   none of them.
//! - **Isolated sessions**: one task per connection; the event channel is
//!   the only shared state.
//! - **Script stack**: goto/resume/recover control flow, so a faulted menu
//!   returns the user to its caller instead of dropping the line.
//! - **CP437 support**: classic box-drawing output for legacy terminals,
//!   UTF-8 for everyone else.
//! - **Session recording**: timestamped binary capture compatible with
//!   common tty players.
//! - **Node slots**: each session claims a small unique node number over an
//!   event-based lock protocol, for doors and "who's online".
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use telbbs::bbs::scripting::{ScriptFuture, ScriptOutcome, ScriptRegistry};
//! use telbbs::bbs::{BbsServer, Session};
//! use telbbs::config::Config;
//! use serde_json::Value;
//!
//! fn matrix<'a>(session: &'a mut Session, _args: Vec<Value>) -> ScriptFuture<'a> {
//!     Box::pin(async move {
//!         session.write("welcome!\r\n").await?;
//!         Ok(ScriptOutcome::Disconnect("done".into()))
//!     })
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let mut scripts = ScriptRegistry::new();
//!     scripts.register("matrix", matrix);
//!     BbsServer::new(config, scripts).run().await
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`bbs`] - Session engine, event protocol, scripting, recording
//! - [`telnet`] - Telnet option primitives and the negotiation state machine
//! - [`config`] - Configuration management and validation
//! - [`logutil`] - Log sanitization for raw client data

pub mod bbs;
pub mod config;
pub mod logutil;
pub mod telnet;
