#![allow(dead_code)]
//! Shared harness for session-level tests: an isolated session wired to an
//! in-memory front-end channel, no sockets involved.

use std::collections::HashMap;
use std::sync::Arc;

use telbbs::bbs::event::{event_channel, ChannelEnd, Event};
use telbbs::bbs::scripting::{ScriptFrame, ScriptRegistry};
use telbbs::bbs::Session;
use telbbs::config::SessionSettings;

pub const TEST_SID: &str = "203.0.113.9:4242";

pub fn test_env() -> HashMap<String, String> {
    HashMap::from([
        ("TERM".to_string(), "ansi".to_string()),
        ("LINES".to_string(), "24".to_string()),
        ("COLUMNS".to_string(), "80".to_string()),
    ])
}

/// A session plus the front-end half of its channel.
pub fn test_session(scripts: ScriptRegistry, initial: &str) -> (Session, ChannelEnd) {
    test_session_with(scripts, initial, SessionSettings::default())
}

pub fn test_session_with(
    scripts: ScriptRegistry,
    initial: &str,
    settings: SessionSettings,
) -> (Session, ChannelEnd) {
    let (session_end, front) = event_channel();
    let session = Session::new(
        TEST_SID,
        test_env(),
        session_end,
        Arc::new(scripts),
        settings,
        ScriptFrame::new(initial, vec![]),
    );
    (session, front)
}

/// Drain everything currently buffered on a channel end.
pub fn drain(front: &mut ChannelEnd) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = front.try_recv() {
        events.push(event);
    }
    events
}

/// Concatenated text of every `output` event in a batch.
pub fn output_text(events: &[Event]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Output { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}
