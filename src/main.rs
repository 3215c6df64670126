//! Binary entrypoint for the telbbs CLI.
//!
//! Commands:
//! - `start [--bind <addr>]` - run the BBS server
//! - `init` - create a starter `config.toml`
//!
//! The binary registers a few demonstration scripts (`matrix`, `chat`,
//! `logoff`) so a fresh checkout answers telnet connections out of the box;
//! a real board replaces them with its own registry via the library API.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use serde_json::{json, Value};

use telbbs::bbs::scripting::{ScriptFrame, ScriptFuture, ScriptOutcome, ScriptRegistry};
use telbbs::bbs::event::Wait;
use telbbs::bbs::{BbsServer, Session};
use telbbs::config::Config;

#[derive(Parser)]
#[command(name = "telbbs")]
#[command(about = "A multi-user telnet Bulletin Board System engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the BBS server
    Start {
        /// Listener address override (e.g. 0.0.0.0:6023)
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Initialize a new BBS configuration
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            println!("wrote {}", cli.config);
            Ok(())
        }
        Commands::Start { bind } => {
            let mut config = Config::load(&cli.config).await?;
            init_logging(&config, cli.verbose);
            if let Some(bind) = bind {
                config.telnet.bind = bind;
                config.validate()?;
            }
            info!("starting telbbs v{}", env!("CARGO_PKG_VERSION"));
            let server = BbsServer::new(config, default_scripts());
            server.run().await
        }
    }
}

fn init_logging(config: &Config, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    let base_level = match verbosity {
        0 => config
            .logging
            .level
            .as_deref()
            .and_then(|level| level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    if let Some(file) = &config.logging.file {
        if let Ok(f) = std::fs::OpenOptions::new().create(true).append(true).open(file) {
            let sink = std::sync::Arc::new(std::sync::Mutex::new(f));
            // When stdout is a terminal, mirror the file there too.
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = sink.lock() {
                    let _ = writeln!(guard, "{line}");
                }
                if is_tty {
                    writeln!(fmt, "{line}")
                } else {
                    Ok(())
                }
            });
        }
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}

/// The built-in demonstration script set.
fn default_scripts() -> ScriptRegistry {
    let mut registry = ScriptRegistry::new();
    registry.register("matrix", matrix);
    registry.register("chat", chat);
    registry.register("logoff", logoff);
    registry
}

/// Connection greeter: claims a node slot, then echoes keystrokes until the
/// caller hangs up with 'q'.
fn matrix<'a>(session: &'a mut Session, _args: Vec<Value>) -> ScriptFuture<'a> {
    Box::pin(async move {
        session.set_activity("connecting").await?;
        let node = session.node().await?;
        session
            .write(&format!(
                "\r\n\x1b[1;36mtelbbs\x1b[m · node {node} · {}x{} {} ({})\r\n",
                session.columns(),
                session.lines(),
                session.term(),
                session.encoding(),
            ))
            .await?;
        session.write("type away; 'q' hangs up.\r\n\r\n").await?;
        session.set_activity("echo chamber").await?;
        loop {
            match session.read_event("input", Wait::Forever).await? {
                Some(Value::String(key)) if key == "q" => {
                    return Ok(ScriptOutcome::Goto(ScriptFrame::new("logoff", vec![])));
                }
                Some(Value::String(key)) => {
                    let echoed = if key == "\r" { "\r\n".to_owned() } else { key };
                    session.write(&echoed).await?;
                }
                _ => {}
            }
        }
    })
}

/// Minimal instant-chat target for `page` events.
fn chat<'a>(session: &'a mut Session, args: Vec<Value>) -> ScriptFuture<'a> {
    Box::pin(async move {
        let sender = args.get(1).cloned().unwrap_or(Value::Null);
        session.set_activity("chatting").await?;
        session.write(&format!("\r\n\x1b[1;33m*** page from {sender} ***\x1b[m\r\n")).await?;
        Ok(ScriptOutcome::Completed(json!(true)))
    })
}

fn logoff<'a>(session: &'a mut Session, _args: Vec<Value>) -> ScriptFuture<'a> {
    Box::pin(async move {
        session.write("\r\nNO CARRIER\r\n").await?;
        Ok(ScriptOutcome::Disconnect("logoff".into()))
    })
}
