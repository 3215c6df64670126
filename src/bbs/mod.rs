//! # BBS Core Module
//!
//! The session side of the engine: everything that happens after telnet
//! negotiation hands a connection off.
//!
//! ## Components
//!
//! - [`server`] - Accept loop, per-connection service tasks, the relay
//! - [`session`] - Per-connection session engine and event dispatch
//! - [`event`] - The typed event protocol and session channel
//! - [`scripting`] - Script frames, outcomes, and the entry-point registry
//! - [`encoding`] - UTF-8 / CP437 transcoding and keyboard decoding
//! - [`recorder`] - Binary session capture
//! - [`registry`] - Process-wide connection table and node-lock authority
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  negotiate   ┌──────────────┐
//! │ BbsServer    │─────────────→│ relay task   │  one per connection
//! └──────────────┘              └──────┬───────┘
//!                                      │ event channel (the only link)
//!                               ┌──────┴───────┐
//!                               │ Session task │  isolated, owns its state
//!                               │  script stack│
//!                               └──────────────┘
//! ```
//!
//! Each session is one spawned task owning its script stack, event buffer,
//! and recorder; the relay owns the socket. They exchange nothing but
//! events, so a wedged or crashing script leaves every other session
//! untouched.

pub mod encoding;
pub mod event;
pub mod recorder;
pub mod registry;
pub mod scripting;
pub mod server;
pub mod session;

pub use server::BbsServer;
pub use session::Session;
