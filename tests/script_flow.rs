//! Script stack control flow: goto, gosub, failure recovery.

mod common;

use common::{drain, output_text, test_session, test_session_with};
use serde_json::{json, Value};
use telbbs::bbs::event::Event;
use telbbs::bbs::scripting::{ScriptFrame, ScriptFuture, ScriptOutcome, ScriptRegistry};
use telbbs::bbs::Session;
use telbbs::config::SessionSettings;

fn hop<'a>(session: &'a mut Session, _args: Vec<Value>) -> ScriptFuture<'a> {
    Box::pin(async move {
        session.write("in-hop;").await?;
        Ok(ScriptOutcome::Goto(ScriptFrame::new("landing", vec![json!("x")])))
    })
}

fn landing<'a>(session: &'a mut Session, args: Vec<Value>) -> ScriptFuture<'a> {
    Box::pin(async move {
        session.write(&format!("in-landing:{};", args[0])).await?;
        Ok(ScriptOutcome::done())
    })
}

#[tokio::test(start_paused = true)]
async fn goto_replaces_the_stack_with_a_single_frame() {
    let mut scripts = ScriptRegistry::new();
    scripts.register("hop", hop);
    scripts.register("landing", landing);
    let (mut session, mut front) = test_session(scripts, "hop");

    session.run().await.unwrap();

    let events = drain(&mut front);
    let text = output_text(&events);
    // hop ran once, landing ran with hop's argument, and nothing resumed
    // hop afterwards: the transfer discarded it
    assert_eq!(text, "in-hop;in-landing:\"x\";");
    assert!(matches!(events.last(), Some(Event::Disconnect { .. })));
}

fn faulty<'a>(_session: &'a mut Session, _args: Vec<Value>) -> ScriptFuture<'a> {
    Box::pin(async move { Err(anyhow::anyhow!("the door jammed")) })
}

fn caller<'a>(session: &'a mut Session, _args: Vec<Value>) -> ScriptFuture<'a> {
    Box::pin(async move {
        if session.env().contains_key("VISITED") {
            session.write("resumed;").await?;
            return Ok(ScriptOutcome::done());
        }
        session.env_mut().insert("VISITED".into(), "1".into());
        session.run_script("faulty", vec![]).await?;
        Ok(ScriptOutcome::done())
    })
}

#[tokio::test(start_paused = true)]
async fn failure_in_a_gosub_resumes_the_caller() {
    let mut scripts = ScriptRegistry::new();
    scripts.register("caller", caller);
    scripts.register("faulty", faulty);
    let (mut session, mut front) = test_session(scripts, "caller");

    session.run().await.unwrap();

    let text = output_text(&drain(&mut front));
    assert!(text.contains("continue"), "notice names the resumed frame: {text}");
    assert!(text.contains("caller"));
    assert!(text.contains("faulty"));
    // the caller really ran again after recovery
    assert!(text.contains("resumed;"));
}

#[tokio::test(start_paused = true)]
async fn failure_with_no_caller_stops_the_session() {
    let mut scripts = ScriptRegistry::new();
    scripts.register("faulty", faulty);
    let (mut session, mut front) = test_session(scripts, "faulty");

    session.run().await.unwrap();

    let events = drain(&mut front);
    let text = output_text(&events);
    assert!(text.contains("stop"));
    assert!(text.contains("faulty"));
    assert!(matches!(events.last(), Some(Event::Disconnect { .. })));
}

#[tokio::test(start_paused = true)]
async fn unresolvable_script_goes_through_failure_recovery() {
    let (mut session, mut front) = test_session(ScriptRegistry::new(), "missing");
    session.run().await.unwrap();
    let text = output_text(&drain(&mut front));
    assert!(text.contains("stop"));
    assert!(text.contains("missing"));
}

#[tokio::test(start_paused = true)]
async fn traceback_echo_is_config_gated() {
    let mut scripts = ScriptRegistry::new();
    scripts.register("faulty", faulty);
    let settings = SessionSettings { show_traceback: true, ..SessionSettings::default() };
    let (mut session, mut front) = test_session_with(scripts, "faulty", settings);

    session.run().await.unwrap();
    let text = output_text(&drain(&mut front));
    assert!(text.contains("the door jammed"));
}

fn answer<'a>(_session: &'a mut Session, _args: Vec<Value>) -> ScriptFuture<'a> {
    Box::pin(async move { Ok(ScriptOutcome::Completed(json!(42))) })
}

fn asker<'a>(session: &'a mut Session, _args: Vec<Value>) -> ScriptFuture<'a> {
    Box::pin(async move {
        let outcome = session.run_script("answer", vec![]).await?;
        session.write(&format!("got:{};", outcome.value())).await?;
        Ok(ScriptOutcome::done())
    })
}

#[tokio::test(start_paused = true)]
async fn run_script_returns_the_callees_value() {
    let mut scripts = ScriptRegistry::new();
    scripts.register("asker", asker);
    scripts.register("answer", answer);
    let (mut session, mut front) = test_session(scripts, "asker");

    session.run().await.unwrap();
    assert!(output_text(&drain(&mut front)).contains("got:42;"));
}

fn hangs_up<'a>(session: &'a mut Session, _args: Vec<Value>) -> ScriptFuture<'a> {
    Box::pin(async move {
        session.write("bye").await?;
        Ok(ScriptOutcome::Disconnect("user request".into()))
    })
}

#[tokio::test(start_paused = true)]
async fn disconnect_outcome_ends_the_run_loop() {
    let mut scripts = ScriptRegistry::new();
    scripts.register("hangs_up", hangs_up);
    let (mut session, mut front) = test_session(scripts, "hangs_up");

    session.run().await.unwrap();
    let events = drain(&mut front);
    assert!(output_text(&events).contains("bye"));
    assert!(matches!(events.last(), Some(Event::Disconnect { .. })));
}

fn waits_forever<'a>(session: &'a mut Session, _args: Vec<Value>) -> ScriptFuture<'a> {
    Box::pin(async move {
        loop {
            session.read_events(&["input"], telbbs::bbs::event::Wait::Forever).await?;
        }
    })
}

#[tokio::test(start_paused = true)]
async fn dropped_channel_unwinds_a_blocked_script() {
    let mut scripts = ScriptRegistry::new();
    scripts.register("waits_forever", waits_forever);
    let (mut session, front) = test_session(scripts, "waits_forever");
    drop(front);
    // the disconnect is terminal, not a recoverable script failure
    session.run().await.unwrap();
}
