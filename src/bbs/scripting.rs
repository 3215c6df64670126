//! Script execution contracts: frames, outcomes, and the startup-populated
//! registry the session engine resolves entry points from.
//!
//! A script is an async entry point taking the session it runs inside plus
//! positional arguments. Control transfer is expressed in the return value,
//! not by unwinding: `Goto` replaces the whole stack, `Disconnect` ends the
//! session, and `Err` is a generic failure handled by stack recovery.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use super::session::Session;

/// One entry on the session's script stack: a script name plus its
/// positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptFrame {
    pub name: String,
    pub args: Vec<Value>,
}

impl ScriptFrame {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self { name: name.into(), args }
    }
}

impl std::fmt::Display for ScriptFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}{:?}", self.name, self.args)
        }
    }
}

/// How a script run ended, short of a generic failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptOutcome {
    /// Normal return with a value for the caller.
    Completed(Value),
    /// Forward transfer: discard the stack, continue at this frame.
    Goto(ScriptFrame),
    /// Terminal: unwind and close the session.
    Disconnect(String),
}

impl ScriptOutcome {
    pub fn done() -> Self {
        ScriptOutcome::Completed(Value::Null)
    }

    /// The completion value, `Null` for transfers.
    pub fn value(&self) -> &Value {
        match self {
            ScriptOutcome::Completed(value) => value,
            _ => &Value::Null,
        }
    }
}

pub type ScriptResult = anyhow::Result<ScriptOutcome>;

pub type ScriptFuture<'a> = Pin<Box<dyn Future<Output = ScriptResult> + Send + 'a>>;

/// A registered script entry point.
///
/// Written as a plain `fn` returning a boxed future so entries stay
/// nameable values:
///
/// ```rust,no_run
/// use telbbs::bbs::scripting::{ScriptFuture, ScriptOutcome};
/// use telbbs::bbs::Session;
/// use serde_json::Value;
///
/// fn hello<'a>(session: &'a mut Session, _args: Vec<Value>) -> ScriptFuture<'a> {
///     Box::pin(async move {
///         session.write("welcome\r\n").await?;
///         Ok(ScriptOutcome::done())
///     })
/// }
/// ```
pub type ScriptFn = for<'a> fn(&'a mut Session, Vec<Value>) -> ScriptFuture<'a>;

/// Name-to-entry-point table, populated once at startup. The session engine
/// only ever performs lookups; nothing is discovered mid-session.
#[derive(Default)]
pub struct ScriptRegistry {
    scripts: HashMap<String, ScriptFn>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, entry: ScriptFn) -> &mut Self {
        self.scripts.insert(name.into(), entry);
        self
    }

    pub fn resolve(&self, name: &str) -> Option<ScriptFn> {
        self.scripts.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.scripts.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

impl std::fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRegistry")
            .field("scripts", &self.scripts.keys().collect::<Vec<_>>())
            .finish()
    }
}
