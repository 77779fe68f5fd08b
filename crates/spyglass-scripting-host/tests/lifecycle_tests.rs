//! Run lifecycle: result mapping, repeat, liveness and cancellation

mod common;

use std::time::Duration;

use common::{harness, settled_states, wait_for_state, wait_until_idle};
use spyglass_scripting_host::ScriptRunningState::{Finished, Frozen, Running, Stopped};
use spyglass_scripting_host::{ScriptArgs, ScriptRunningState, SpyMessage};

const SETTLE: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread")]
async fn test_async_run_finishes() {
    let mut h = harness(Duration::from_millis(50));
    let script = h.manager.add_inline_script("finish", "true");

    assert!(h.manager.run_script(&script, true, None));

    let states = settled_states(&mut h.events, &script, SETTLE).await;
    assert_eq!(states, vec![Running, Finished]);
    assert_eq!(script.status(), Finished);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unresponsive_script_is_frozen_then_stopped() {
    let mut h = harness(Duration::from_millis(50));
    let script = h.manager.add_inline_script_with(
        "spin",
        "let x = 0; loop { x += 1; }",
        false,
        Duration::from_millis(200),
    );

    assert!(h.manager.run_script(&script, true, None));
    assert!(wait_for_state(&script, Frozen, Duration::from_secs(3)).await);
    // Frozen is advisory; the body keeps running
    assert!(script.is_active());
    assert!(h.manager.are_scripts_running());
    assert!(!h.manager.run_script(&script, true, None));

    assert!(h.manager.stop_script(&script));
    let states = settled_states(&mut h.events, &script, SETTLE).await;
    assert_eq!(states, vec![Running, Frozen, Stopped]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sleeping_script_stops_on_request() {
    let h = harness(Duration::from_millis(50));
    let script = h.manager.add_inline_script("nap", "spy.sleep(5000); true");

    assert!(h.manager.run_script(&script, true, None));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(script.status(), Running);

    h.manager.stop_script(&script);
    assert!(wait_for_state(&script, Stopped, Duration::from_secs(1)).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_false_result_with_repeat_stops_without_restart() {
    let mut h = harness(Duration::from_millis(50));
    let script =
        h.manager
            .add_inline_script_with("once", "false", true, Duration::from_secs(5));

    assert!(h.manager.run_script(&script, true, None));

    let states = settled_states(&mut h.events, &script, SETTLE).await;
    assert_eq!(states, vec![Running, Stopped]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_repeat_reenters_running_until_stopped_by_script() {
    let mut h = harness(Duration::from_millis(50));
    let body = r#"
        spy.publish("count", "tick");
        mqtt.getMessages("count").len() < 3
    "#;
    let script = h
        .manager
        .add_inline_script_with("counter", body, true, Duration::from_secs(5));

    assert!(h.manager.run_script(&script, true, None));

    let states = settled_states(&mut h.events, &script, SETTLE).await;
    assert_eq!(
        states,
        vec![Running, Finished, Running, Finished, Running, Stopped]
    );
    assert_eq!(h.transport.payloads("count").len(), 3);
    assert_eq!(script.telemetry().published_count(), 3);
    assert!(script.telemetry().last_published().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_script_is_not_restarted() {
    let mut h = harness(Duration::from_millis(50));
    let body = r#"
        spy.publish("attempt", "1");
        throw "connection refused";
    "#;
    let script = h
        .manager
        .add_inline_script_with("broken", body, true, Duration::from_secs(5));

    assert!(h.manager.run_script(&script, true, None));

    let states = settled_states(&mut h.events, &script, SETTLE).await;
    assert_eq!(states, vec![Running, ScriptRunningState::Failed]);
    assert_eq!(h.transport.payloads("attempt").len(), 1);
    assert!(script.last_error().unwrap().contains("connection refused"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failure_is_cleared_by_next_run() {
    let h = harness(Duration::from_millis(50));
    let script = h
        .manager
        .add_inline_script("flaky", r#"if args.fail { throw "bad"; } true"#);

    let mut args = ScriptArgs::new();
    args.insert("fail".into(), true.into());
    assert!(h.manager.run_script(&script, false, Some(&args)));
    assert!(script.last_error().is_some());

    args.insert("fail".into(), false.into());
    assert!(h.manager.run_script(&script, false, Some(&args)));
    assert_eq!(script.status(), Finished);
    assert!(script.last_error().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_run_refused_while_running() {
    let mut h = harness(Duration::from_millis(50));
    let script = h.manager.add_inline_script("slow", "spy.sleep(300); true");

    assert!(h.manager.run_script(&script, true, None));
    assert!(!h.manager.run_script(&script, true, None));
    assert!(!h.manager.run_script(&script, false, None));

    let states = settled_states(&mut h.events, &script, SETTLE).await;
    assert_eq!(states, vec![Running, Finished]);

    assert!(h.manager.run_script(&script, false, None));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_synchronous_run_blocks_and_ignores_repeat() {
    let mut h = harness(Duration::from_millis(50));
    let script = h.manager.add_inline_script_with(
        "sync",
        r#"spy.publish("sync", "run"); true"#,
        true,
        Duration::from_secs(5),
    );

    assert!(h.manager.run_script(&script, false, None));
    assert_eq!(script.status(), Finished);
    assert_eq!(h.transport.payloads("sync").len(), 1);

    let states = settled_states(&mut h.events, &script, SETTLE).await;
    assert_eq!(states, vec![Running, Finished]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_after_completion_has_no_effect() {
    let mut h = harness(Duration::from_millis(50));
    let script = h.manager.add_inline_script("done", "true");
    h.manager.run_script(&script, false, None);
    let _ = settled_states(&mut h.events, &script, SETTLE).await;

    assert!(!h.manager.stop_script(&script));
    assert!(!h.manager.stop_script(&script));
    assert_eq!(script.status(), Finished);

    let states = settled_states(&mut h.events, &script, Duration::from_millis(100)).await;
    assert!(states.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_touching_script_stays_running() {
    let h = harness(Duration::from_millis(20));
    let body = r#"
        for i in 0..10 {
            spy.sleep(50);
            spy.touch();
        }
        true
    "#;
    let script = h
        .manager
        .add_inline_script_with("busy", body, false, Duration::from_millis(200));

    assert!(h.manager.run_script(&script, true, None));
    assert!(wait_for_state(&script, Finished, Duration::from_secs(3)).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_script_can_extend_its_timeout() {
    let h = harness(Duration::from_millis(20));
    let body = r#"
        spy.setTimeout(2000);
        spy.sleep(400);
        true
    "#;
    let script = h
        .manager
        .add_inline_script_with("patient", body, false, Duration::from_millis(100));

    assert!(h.manager.run_script(&script, true, None));
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(script.status(), Running);
    assert!(wait_for_state(&script, Finished, Duration::from_secs(3)).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_message_and_args_bindings() {
    let h = harness(Duration::from_millis(50));
    h.manager.add_custom_parameters(ScriptArgs::from_iter([(
        "prefix".to_string(),
        "echo/".into(),
    )]));
    let script = h.manager.add_inline_script(
        "echo",
        r#"spy.publish(args.prefix + message.topic, message.payload, 1, true)"#,
    );

    let message = SpyMessage::new("sensors/temp", "21.5");
    assert!(h.manager.run_script_with_message(&script, &message));
    assert!(wait_for_state(&script, Finished, Duration::from_secs(3)).await);

    let published = h.transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "echo/sensors/temp");
    assert_eq!(published[0].payload, "21.5");
    assert_eq!(published[0].qos, 1);
    assert!(published[0].retained);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_custom_parameters_override_call_args() {
    let h = harness(Duration::from_millis(50));
    h.manager.add_custom_parameters(ScriptArgs::from_iter([(
        "target".to_string(),
        "custom".into(),
    )]));
    let script = h.manager.add_inline_script(
        "override",
        r#"spy.publish("target", args.target); spy.publish("extra", args.extra)"#,
    );

    let args = ScriptArgs::from_iter([
        ("target".to_string(), "call".into()),
        ("extra".to_string(), "kept".into()),
    ]);
    assert!(h.manager.run_script(&script, false, Some(&args)));

    assert_eq!(h.transport.payloads("target"), vec!["custom"]);
    assert_eq!(h.transport.payloads("extra"), vec!["kept"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_stops_running_scripts() {
    let h = harness(Duration::from_millis(50));
    let script = h.manager.add_inline_script("forever", "loop { spy.sleep(10); }");

    assert!(h.manager.run_script(&script, true, None));
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.manager.shutdown();
    assert!(wait_for_state(&script, Stopped, Duration::from_secs(2)).await);

    // Runs started after shutdown end straight away
    assert!(wait_until_idle(&script, SETTLE).await);
    h.manager.run_script(&script, false, None);
    assert_eq!(script.status(), Stopped);
}
