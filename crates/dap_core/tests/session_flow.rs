mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{
    expect_event, orchestrator, remote_config, Script, ScriptedConnector, LOCALS_REFERENCE,
    TOP_FRAME_ID,
};
use dap_core::session::ConsoleKind;
use dap_core::{BreakpointOptions, DapError, OrchestratorEvent, SessionState};
use serde_json::json;

#[tokio::test]
async fn breakpoint_moves_to_verified_line() {
    let connector = ScriptedConnector::new(Script {
        line_offset: 1,
        ..Script::default()
    });
    let orchestrator = orchestrator(&connector);
    orchestrator
        .start_session(remote_config("/work/app.py"), None)
        .await
        .expect("session starts");

    let path = Path::new("/work/app.py");
    let bp = orchestrator
        .set_breakpoint(path, 10, BreakpointOptions::default())
        .await
        .expect("breakpoint set");

    assert!(bp.verified);
    assert_eq!(bp.line, 11);
    let sent = connector.last().requests("setBreakpoints");
    assert_eq!(sent.len(), 1);
    let args = sent[0].arguments.clone().expect("arguments");
    assert_eq!(args["breakpoints"][0]["line"], json!(10));
    assert_eq!(args["source"]["path"], json!("/work/app.py"));
}

#[tokio::test]
async fn toggling_twice_syncs_the_file_each_time() {
    let connector = ScriptedConnector::new(Script::default());
    let orchestrator = orchestrator(&connector);
    orchestrator
        .start_session(remote_config("/work/app.py"), None)
        .await
        .expect("session starts");

    let path = Path::new("/work/app.py");
    let bp = orchestrator
        .set_breakpoint(path, 5, BreakpointOptions::default())
        .await
        .expect("breakpoint set");

    let disabled = orchestrator.toggle_breakpoint(bp.id).await.expect("toggled");
    assert!(!disabled.enabled);
    let enabled = orchestrator.toggle_breakpoint(bp.id).await.expect("toggled");
    assert!(enabled.enabled);

    let sent = connector.last().requests("setBreakpoints");
    assert_eq!(sent.len(), 3);
    let counts: Vec<usize> = sent
        .iter()
        .map(|r| {
            r.arguments.as_ref().expect("arguments")["breakpoints"]
                .as_array()
                .map(Vec::len)
                .unwrap_or_default()
        })
        .collect();
    assert_eq!(counts, vec![1, 0, 1]);
}

#[tokio::test]
async fn stored_breakpoints_are_sent_before_configuration_done() {
    let connector = ScriptedConnector::new(Script::default());
    let orchestrator = orchestrator(&connector);
    let path = Path::new("/work/app.py");
    let bp = orchestrator
        .set_breakpoint(path, 3, BreakpointOptions::default())
        .await
        .expect("stored");
    assert!(!bp.verified);

    let session = orchestrator
        .start_session(remote_config("/work/app.py"), None)
        .await
        .expect("session starts");
    assert_eq!(session.state, SessionState::Running);

    assert_eq!(
        connector.last().commands(),
        vec!["initialize", "launch", "setBreakpoints", "configurationDone"]
    );
    let stored = orchestrator.breakpoints_for_file(path).await;
    assert!(stored[0].verified);
}

#[tokio::test]
async fn missing_initialized_event_does_not_block_start() {
    let connector = ScriptedConnector::new(Script {
        send_initialized: false,
        ..Script::default()
    });
    let orchestrator = orchestrator(&connector);

    let session = orchestrator
        .start_session(remote_config("/work/app.py"), None)
        .await
        .expect("session starts");

    assert_eq!(session.state, SessionState::Running);
    assert_eq!(connector.last().count("configurationDone"), 1);
}

#[tokio::test]
async fn failed_launch_unregisters_the_session() {
    let connector = ScriptedConnector::new(Script {
        launch_error: Some("program '/work/missing.py' does not exist".into()),
        ..Script::default()
    });
    let orchestrator = orchestrator(&connector);
    let mut events = orchestrator.subscribe();

    let err = orchestrator
        .start_session(remote_config("/work/missing.py"), None)
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "program '/work/missing.py' does not exist");
    expect_event(&mut events, |e| matches!(e, OrchestratorEvent::SessionTerminated { .. })).await;
    assert!(orchestrator.sessions().await.is_empty());
    assert!(orchestrator.active_session_id().await.is_none());
}

#[tokio::test]
async fn stop_selects_the_top_frame() {
    let connector = ScriptedConnector::new(Script::default());
    let orchestrator = orchestrator(&connector);
    let session = orchestrator
        .start_session(remote_config("/work/app.py"), None)
        .await
        .expect("session starts");
    let mut events = orchestrator.subscribe();

    connector
        .last()
        .send_event("stopped", json!({ "reason": "breakpoint", "threadId": 1 }));

    let stopped = expect_event(&mut events, |e| matches!(e, OrchestratorEvent::Stopped { .. })).await;
    let OrchestratorEvent::Stopped { thread_id, frame_id, reason, .. } = stopped else {
        unreachable!()
    };
    assert_eq!(reason, "breakpoint");
    assert_eq!(thread_id, Some(1));
    assert_eq!(frame_id, Some(TOP_FRAME_ID));

    let traces = connector.last().requests("stackTrace");
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].arguments.as_ref().expect("arguments")["threadId"], json!(1));

    let current = orchestrator.session(session.id).await.expect("session");
    assert_eq!(current.state, SessionState::Stopped);
    assert_eq!(current.current_thread_id, Some(1));
    assert_eq!(current.current_frame_id, Some(TOP_FRAME_ID));
}

#[tokio::test]
async fn continue_after_stop_resumes() {
    let connector = ScriptedConnector::new(Script::default());
    let orchestrator = orchestrator(&connector);
    let session = orchestrator
        .start_session(remote_config("/work/app.py"), None)
        .await
        .expect("session starts");
    let mut events = orchestrator.subscribe();

    connector
        .last()
        .send_event("stopped", json!({ "reason": "step", "threadId": 1 }));
    expect_event(&mut events, |e| matches!(e, OrchestratorEvent::Stopped { .. })).await;

    orchestrator.continue_(None).await.expect("continued");
    expect_event(&mut events, |e| matches!(e, OrchestratorEvent::Continued { thread_id: Some(1), .. }))
        .await;

    let current = orchestrator.session(session.id).await.expect("session");
    assert_eq!(current.state, SessionState::Running);
    let sent = connector.last().requests("continue");
    assert_eq!(sent[0].arguments.as_ref().expect("arguments")["threadId"], json!(1));
}

#[tokio::test]
async fn terminated_session_hands_over_active() {
    let connector = ScriptedConnector::new(Script::default());
    let orchestrator = orchestrator(&connector);
    let first = orchestrator
        .start_session(remote_config("/work/a.py"), None)
        .await
        .expect("first starts");
    let first_adapter = connector.last();
    let second = orchestrator
        .start_session(remote_config("/work/b.py"), None)
        .await
        .expect("second starts");
    assert_eq!(orchestrator.active_session_id().await, Some(first.id));

    let mut events = orchestrator.subscribe();
    first_adapter.send_event("terminated", json!({}));
    expect_event(&mut events, |e| {
        matches!(e, OrchestratorEvent::SessionTerminated { session, .. } if *session == first.id)
    })
    .await;

    let remaining = orchestrator.sessions().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, second.id);
    assert_eq!(orchestrator.active_session_id().await, Some(second.id));
}

#[tokio::test]
async fn lost_connection_tears_the_session_down() {
    let connector = ScriptedConnector::new(Script::default());
    let orchestrator = orchestrator(&connector);
    let session = orchestrator
        .start_session(remote_config("/work/app.py"), None)
        .await
        .expect("session starts");
    let mut events = orchestrator.subscribe();

    connector.last().close();

    let terminated = expect_event(&mut events, |e| {
        matches!(e, OrchestratorEvent::SessionTerminated { .. })
    })
    .await;
    assert_eq!(terminated.session(), Some(session.id));
    assert!(matches!(
        orchestrator.evaluate("1 + 1", None, None, None).await,
        Err(DapError::NoActiveSession)
    ));
}

#[tokio::test]
async fn evaluate_error_is_reported_verbatim() {
    let connector = ScriptedConnector::new(Script {
        evaluate_error: Some("name 'foo' is not defined".into()),
        ..Script::default()
    });
    let orchestrator = orchestrator(&connector);
    orchestrator
        .start_session(remote_config("/work/app.py"), None)
        .await
        .expect("session starts");

    let err = orchestrator
        .evaluate("foo", None, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "name 'foo' is not defined");

    let sent = connector.last().requests("evaluate");
    assert_eq!(sent[0].arguments.as_ref().expect("arguments")["context"], json!("repl"));
}

#[tokio::test]
async fn watch_errors_stay_on_the_watch() {
    let connector = ScriptedConnector::new(Script {
        evaluate_error: Some("name 'foo' is not defined".into()),
        ..Script::default()
    });
    let orchestrator = orchestrator(&connector);
    orchestrator
        .start_session(remote_config("/work/app.py"), None)
        .await
        .expect("session starts");
    let mut events = orchestrator.subscribe();
    connector
        .last()
        .send_event("stopped", json!({ "reason": "pause", "threadId": 1 }));
    expect_event(&mut events, |e| matches!(e, OrchestratorEvent::Stopped { .. })).await;

    let watch = orchestrator.add_watch("foo").await.expect("added");
    assert_eq!(watch.error.as_deref(), Some("name 'foo' is not defined"));

    let refreshed = orchestrator.refresh_watch(watch.id).await.expect("no error escapes");
    assert!(refreshed.value.is_none());
    assert_eq!(refreshed.error.as_deref(), Some("name 'foo' is not defined"));
    let sent = connector.last().requests("evaluate");
    assert_eq!(sent.last().and_then(|r| r.arguments.clone()).expect("arguments")["context"], json!("watch"));
}

#[tokio::test]
async fn console_records_input_and_result() {
    let connector = ScriptedConnector::new(Script::default());
    let orchestrator = orchestrator(&connector);
    orchestrator
        .start_session(remote_config("/work/app.py"), None)
        .await
        .expect("session starts");

    let result = orchestrator.execute_in_console("len(items)").await.expect("evaluated");
    assert_eq!(result, "<len(items)>");

    let messages = orchestrator.console_messages().await;
    let kinds: Vec<_> = messages.iter().map(|m| m.kind).collect();
    assert_eq!(kinds, vec![ConsoleKind::Input, ConsoleKind::Output]);
}

#[tokio::test]
async fn adapter_output_reaches_the_console() {
    let connector = ScriptedConnector::new(Script::default());
    let orchestrator = orchestrator(&connector);
    orchestrator
        .start_session(remote_config("/work/app.py"), None)
        .await
        .expect("session starts");
    let mut events = orchestrator.subscribe();

    let adapter = connector.last();
    adapter.send_event("output", json!({ "category": "telemetry", "output": "ping" }));
    adapter.send_event("output", json!({ "category": "stderr", "output": "Traceback\n" }));
    expect_event(&mut events, |e| matches!(e, OrchestratorEvent::ConsoleMessage { .. })).await;

    let messages = orchestrator.console_messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].kind, ConsoleKind::Error);
    assert_eq!(messages[0].text, "Traceback\n");
}

#[tokio::test]
async fn restart_without_adapter_support_starts_a_new_session() {
    let connector = ScriptedConnector::new(Script::default());
    let orchestrator = orchestrator(&connector);
    let first = orchestrator
        .start_session(remote_config("/work/app.py"), None)
        .await
        .expect("session starts");
    let first_adapter = connector.last();

    let restarted = orchestrator.restart_session(None).await.expect("restarted");

    assert_ne!(restarted.id, first.id);
    assert_eq!(connector.connections(), 2);
    assert_eq!(first_adapter.count("terminate"), 1);
    let sessions = orchestrator.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, restarted.id);
    assert_eq!(orchestrator.active_session_id().await, Some(restarted.id));
}

#[tokio::test]
async fn end_to_end_debugging_round() {
    let connector = ScriptedConnector::new(Script {
        line_offset: 1,
        ..Script::default()
    });
    let orchestrator = orchestrator(&connector);
    let path = Path::new("/work/app.py");
    orchestrator
        .set_breakpoint(path, 10, BreakpointOptions::default())
        .await
        .expect("stored");

    let session = orchestrator
        .start_session(remote_config("/work/app.py"), Some(Path::new("/work")))
        .await
        .expect("session starts");
    assert_eq!(orchestrator.active_session_id().await, Some(session.id));
    assert_eq!(orchestrator.breakpoints_for_file(path).await[0].line, 11);

    let mut events = orchestrator.subscribe();
    let adapter = connector.last();
    adapter.send_event(
        "stopped",
        json!({ "reason": "breakpoint", "threadId": 1, "hitBreakpointIds": [1] }),
    );
    expect_event(&mut events, |e| matches!(e, OrchestratorEvent::Stopped { .. })).await;

    let frames = orchestrator.get_stack_trace(None, None).await.expect("frames");
    assert_eq!(frames[0].id, TOP_FRAME_ID);
    let scopes = orchestrator.get_scopes(None, None).await.expect("scopes");
    assert_eq!(scopes[0].name, "Locals");
    let variables = orchestrator
        .get_variables(scopes[0].variables_reference, None)
        .await
        .expect("variables");
    assert_eq!(variables[0].name, "count");
    assert_eq!(variables[0].type_name.as_deref(), Some("int"));

    let value = orchestrator
        .evaluate("count * 2", None, None, None)
        .await
        .expect("evaluated");
    assert_eq!(value.result, "<count * 2>");
    let evaluate = adapter.requests("evaluate");
    assert_eq!(
        evaluate[0].arguments.as_ref().expect("arguments")["frameId"],
        json!(TOP_FRAME_ID)
    );

    orchestrator.step_over(None).await.expect("stepped");
    assert_eq!(adapter.count("next"), 1);

    orchestrator.stop_session(None).await.expect("stopped");
    assert_eq!(adapter.count("terminate"), 1);
    assert!(orchestrator.sessions().await.is_empty());
    assert!(orchestrator.active_session_id().await.is_none());

    let kept = orchestrator.breakpoints_for_file(path).await;
    assert_eq!(kept.len(), 1);
    assert!(!kept[0].verified);
}

#[tokio::test]
async fn one_failing_watch_does_not_spoil_the_batch() {
    let connector = ScriptedConnector::new(Script {
        evaluate_error: Some("name 'foo' is not defined".into()),
        failing_expression: Some("foo".into()),
        ..Script::default()
    });
    let orchestrator = orchestrator(&connector);
    orchestrator.add_watch("foo").await.expect("added");
    orchestrator.add_watch("count").await.expect("added");
    orchestrator
        .start_session(remote_config("/work/app.py"), None)
        .await
        .expect("session starts");

    let refreshed = orchestrator.refresh_watches().await;

    assert_eq!(refreshed.len(), 2);
    assert_eq!(refreshed[0].error.as_deref(), Some("name 'foo' is not defined"));
    assert!(refreshed[0].value.is_none());
    assert_eq!(refreshed[1].value.as_deref(), Some("<count>"));
    assert!(refreshed[1].error.is_none());
}

#[tokio::test]
async fn watches_refresh_when_the_session_stops() {
    let connector = ScriptedConnector::new(Script::default());
    let orchestrator = orchestrator(&connector);
    orchestrator
        .start_session(remote_config("/work/app.py"), None)
        .await
        .expect("session starts");
    let watch = orchestrator.add_watch("count").await.expect("watch added");
    assert!(watch.value.is_none());
    assert_eq!(connector.last().count("evaluate"), 0);
    let mut events = orchestrator.subscribe();

    connector
        .last()
        .send_event("stopped", json!({ "reason": "breakpoint", "threadId": 1 }));
    let event = expect_event(
        &mut events,
        |e| matches!(e, OrchestratorEvent::WatchUpdated { watch: w } if w.id == watch.id),
    )
    .await;
    let OrchestratorEvent::WatchUpdated { watch: updated } = event else {
        unreachable!()
    };
    assert_eq!(updated.value.as_deref(), Some("<count>"));
    assert!(updated.error.is_none());

    let sent = connector.last().requests("evaluate");
    let args = sent[0].arguments.clone().expect("arguments");
    assert_eq!(args["expression"], json!("count"));
    assert_eq!(args["context"], json!("watch"));
    assert_eq!(args["frameId"], json!(TOP_FRAME_ID));
}

#[tokio::test]
async fn restart_with_adapter_support_keeps_the_session() {
    let connector = ScriptedConnector::new(Script {
        capabilities: json!({
            "supportsConfigurationDoneRequest": true,
            "supportsTerminateRequest": true,
            "supportsRestartRequest": true,
        }),
        ..Script::default()
    });
    let orchestrator = orchestrator(&connector);
    let session = orchestrator
        .start_session(remote_config("/work/app.py"), None)
        .await
        .expect("session starts");

    let restarted = orchestrator.restart_session(None).await.expect("restarted");

    assert_eq!(restarted.id, session.id);
    assert_eq!(connector.connections(), 1);
    let adapter = connector.last();
    assert_eq!(adapter.count("terminate"), 0);
    let sent = adapter.requests("restart");
    assert_eq!(sent.len(), 1);
    let args = sent[0].arguments.clone().expect("arguments");
    assert_eq!(args["arguments"]["program"], json!("/work/app.py"));
    assert_eq!(orchestrator.sessions().await.len(), 1);
    assert_eq!(orchestrator.active_session_id().await, Some(session.id));
}

#[tokio::test]
async fn timed_out_request_leaves_the_session_usable() {
    let connector = ScriptedConnector::new(Script {
        unanswered: vec!["scopes"],
        ..Script::default()
    });
    let orchestrator = orchestrator(&connector);
    let session = orchestrator
        .start_session(remote_config("/work/app.py"), None)
        .await
        .expect("session starts");
    let mut events = orchestrator.subscribe();
    connector
        .last()
        .send_event("stopped", json!({ "reason": "breakpoint", "threadId": 1 }));
    expect_event(&mut events, |e| matches!(e, OrchestratorEvent::Stopped { .. })).await;

    let err = orchestrator.get_scopes(None, None).await.unwrap_err();
    assert!(err.is_timeout(), "expected a timeout, got {err}");

    let current = orchestrator.session(session.id).await.expect("still registered");
    assert_eq!(current.state, SessionState::Stopped);
    let variables = orchestrator
        .get_variables(LOCALS_REFERENCE, None)
        .await
        .expect("later requests still work");
    assert_eq!(variables[0].name, "count");
}

#[tokio::test]
async fn slow_breakpoint_sync_does_not_block_breakpoint_reads() {
    let connector = ScriptedConnector::new(Script {
        unanswered: vec!["setBreakpoints"],
        ..Script::default()
    });
    let orchestrator = Arc::new(orchestrator(&connector));
    orchestrator
        .start_session(remote_config("/work/app.py"), None)
        .await
        .expect("session starts");
    let adapter = connector.last();

    let o = orchestrator.clone();
    let pending = tokio::spawn(async move {
        o.set_breakpoint(Path::new("/work/app.py"), 10, BreakpointOptions::default())
            .await
    });
    tokio::time::timeout(Duration::from_secs(1), async {
        while adapter.count("setBreakpoints") == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sync request sent");

    let listed = tokio::time::timeout(Duration::from_millis(500), orchestrator.all_breakpoints())
        .await
        .expect("reads do not wait for the adapter");
    assert_eq!(listed.len(), 1);
    let for_file = tokio::time::timeout(
        Duration::from_millis(500),
        orchestrator.breakpoints_for_file(Path::new("/work/app.py")),
    )
    .await
    .expect("reads do not wait for the adapter");
    assert_eq!(for_file[0].line, 10);

    let bp = pending.await.expect("join").expect("edit succeeds despite the timeout");
    assert!(!bp.verified);
}

#[tokio::test]
async fn stop_reported_before_continue_ack_keeps_the_session_stopped() {
    let connector = ScriptedConnector::new(Script {
        stop_on_continue: true,
        ..Script::default()
    });
    let orchestrator = orchestrator(&connector);
    let session = orchestrator
        .start_session(remote_config("/work/app.py"), None)
        .await
        .expect("session starts");
    let mut events = orchestrator.subscribe();
    connector
        .last()
        .send_event("stopped", json!({ "reason": "step", "threadId": 1 }));
    expect_event(&mut events, |e| matches!(e, OrchestratorEvent::Stopped { .. })).await;

    orchestrator.continue_(None).await.expect("continued");
    expect_event(
        &mut events,
        |e| matches!(e, OrchestratorEvent::Stopped { reason, .. } if reason == "breakpoint"),
    )
    .await;

    let current = orchestrator.session(session.id).await.expect("session");
    assert_eq!(current.state, SessionState::Stopped);
}
