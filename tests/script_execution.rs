//! End-to-end script engine tests: JSON descriptors through compilation,
//! suspension on device I/O and handler delivery.

mod common;

use common::fixtures::{self, weather_env, weather_payload};
use common::{wait_for, CollectScript, ScriptOutcome};
use crossbeam_channel::unbounded;
use devmux::channel::mock::{ManualChannel, MockChannel, MockOutcome};
use devmux::channel::Channel;
use devmux::script::compiler::{compile, CompileError, InstructionDesc};
use devmux::script::runner::RunnerState;
use devmux::{RuntimeError, ScriptDebugger, ScriptParams, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_json_descriptors_run_end_to_end() {
    let mock = Arc::new(MockChannel::new("dev"));
    mock.on("read", MockOutcome::Complete(Some(weather_payload(23, 60))));
    let channel: Arc<dyn Channel> = mock.clone();

    let script = fixtures::compile_json(
        "read-weather",
        r#"[
            {"op": "submit", "request": "read", "channel": "dev",
             "parameters": [{"name": "address", "value": "16"}],
             "result": {"variable": "reading", "message_type": "weather"}},
            {"op": "put", "attribute": "temperature", "value": "reading.temperature"},
            {"op": "put", "attribute": "humidity", "value": "reading.humidity"},
            {"op": "emit"}
        ]"#,
        &weather_env(channel),
    );

    let exec = fixtures::executor(2);
    let (tx, rx) = unbounded();
    let runner = exec
        .execute(script, ScriptParams::new(), Arc::new(CollectScript(tx)))
        .unwrap();

    match rx.recv_timeout(common::test_timeout()).unwrap() {
        ScriptOutcome::Complete(samples) => {
            assert_eq!(samples.len(), 1);
            assert_eq!(samples[0].field("temperature"), Some(&Value::Integer(23)));
            assert_eq!(samples[0].field("humidity"), Some(&Value::Integer(60)));
        }
        ScriptOutcome::Error(e) => panic!("unexpected error: {e}"),
    }
    assert_eq!(runner.state(), RunnerState::Stopped);
    assert_eq!(mock.submissions()[0].parameter("address"), Some(&Value::Integer(16)));
}

#[test]
fn test_repeated_put_last_wins_and_buffer_persists() {
    let channel: Arc<dyn Channel> = Arc::new(MockChannel::new("dev"));
    let script = fixtures::compile_json(
        "unroll",
        r#"[
            {"op": "put", "attribute": "temperature", "value": "1"},
            {"op": "put", "attribute": "temperature", "value": "2"},
            {"op": "emit"},
            {"op": "put", "attribute": "humidity", "value": "60"},
            {"op": "emit"}
        ]"#,
        &weather_env(channel),
    );
    // Repeated puts of the same attribute share one slot.
    assert_eq!(script.emit_attributes().len(), 2);

    let exec = fixtures::executor(1);
    let (tx, rx) = unbounded();
    exec.execute(script, ScriptParams::new(), Arc::new(CollectScript(tx)))
        .unwrap();

    match rx.recv_timeout(common::test_timeout()).unwrap() {
        ScriptOutcome::Complete(samples) => {
            assert_eq!(samples.len(), 2);
            // Second put wins; humidity is not yet written.
            assert_eq!(samples[0].field("temperature"), Some(&Value::Integer(2)));
            assert_eq!(samples[0].field("humidity"), Some(&Value::Null));
            // Emit does not clear the buffer, so the temperature carries
            // over into the second sample.
            assert_eq!(samples[1].field("temperature"), Some(&Value::Integer(2)));
            assert_eq!(samples[1].field("humidity"), Some(&Value::Integer(60)));
        }
        ScriptOutcome::Error(e) => panic!("unexpected error: {e}"),
    }
}

#[test]
fn test_loops_and_branches() {
    let channel: Arc<dyn Channel> = Arc::new(MockChannel::new("dev"));
    let script = fixtures::compile_json(
        "readings",
        r#"[
            {"op": "create_complex", "variable": "msg", "message_type": "weather"},
            {"op": "append", "variable": "msg", "field": "readings", "value": "10"},
            {"op": "append", "variable": "msg", "field": "readings", "value": "20"},
            {"op": "foreach", "variable": "msg", "field": "readings",
             "element": "r", "index": "i",
             "body": [
                {"op": "put", "attribute": "temperature", "value": "r + i"},
                {"op": "emit"}
             ]},
            {"op": "if", "condition": "msg.readings[0] == 10",
             "then": [
                {"op": "put", "attribute": "humidity", "value": "1"},
                {"op": "emit"}
             ],
             "else": []}
        ]"#,
        &weather_env(channel),
    );

    let exec = fixtures::executor(1);
    let (tx, rx) = unbounded();
    exec.execute(script, ScriptParams::new(), Arc::new(CollectScript(tx)))
        .unwrap();

    match rx.recv_timeout(common::test_timeout()).unwrap() {
        ScriptOutcome::Complete(samples) => {
            assert_eq!(samples.len(), 3);
            assert_eq!(samples[0].field("temperature"), Some(&Value::Integer(10)));
            assert_eq!(samples[1].field("temperature"), Some(&Value::Integer(21)));
            assert_eq!(samples[2].field("humidity"), Some(&Value::Integer(1)));
        }
        ScriptOutcome::Error(e) => panic!("unexpected error: {e}"),
    }
}

#[test]
fn test_submit_suspends_until_the_channel_answers() {
    let manual = Arc::new(ManualChannel::new());
    let channel: Arc<dyn Channel> = manual.clone();
    let script = fixtures::compile_json(
        "read-weather",
        r#"[
            {"op": "submit", "request": "read", "channel": "manual",
             "parameters": [{"name": "address", "value": "16"}],
             "result": {"variable": "reading", "message_type": "weather"}},
            {"op": "put", "attribute": "temperature", "value": "reading.temperature"},
            {"op": "emit"}
        ]"#,
        &weather_env(channel),
    );

    let exec = fixtures::executor(2);
    let (tx, rx) = unbounded();
    let runner = exec
        .execute(script, ScriptParams::new(), Arc::new(CollectScript(tx)))
        .unwrap();

    wait_for("suspension", || runner.is_suspended());
    assert_eq!(exec.in_flight(), 1);
    assert!(rx.is_empty());

    assert!(manual.complete_next(Some(weather_payload(19, 80))));
    match rx.recv_timeout(common::test_timeout()).unwrap() {
        ScriptOutcome::Complete(samples) => {
            assert_eq!(samples[0].field("temperature"), Some(&Value::Integer(19)));
        }
        ScriptOutcome::Error(e) => panic!("unexpected error: {e}"),
    }
    wait_for("in-flight drain", || exec.in_flight() == 0);
}

#[test]
fn test_channel_error_cancels_with_the_wrapped_cause() {
    let mock = Arc::new(MockChannel::new("dev"));
    mock.on("read", MockOutcome::Error("device gone".to_string()));
    let channel: Arc<dyn Channel> = mock;
    let script = fixtures::compile_json(
        "read-weather",
        r#"[
            {"op": "submit", "request": "read", "channel": "dev",
             "parameters": [{"name": "address", "value": "16"}],
             "result": {"variable": "reading", "message_type": "weather"}},
            {"op": "put", "attribute": "temperature", "value": "reading.temperature"},
            {"op": "emit"}
        ]"#,
        &weather_env(channel),
    );

    let exec = fixtures::executor(2);
    let (tx, rx) = unbounded();
    let runner = exec
        .execute(script, ScriptParams::new(), Arc::new(CollectScript(tx)))
        .unwrap();

    match rx.recv_timeout(common::test_timeout()).unwrap() {
        ScriptOutcome::Error(e) => {
            let text = e.to_string();
            assert!(text.contains("request 'read' failed"), "{text}");
            assert!(text.contains("device gone"), "{text}");
        }
        ScriptOutcome::Complete(_) => panic!("the stop instruction must not be reached"),
    }
    wait_for("terminal state", || runner.is_done());
    assert_eq!(runner.state(), RunnerState::Cancelled);
}

#[test]
fn test_cancel_while_suspended_emits_nothing() {
    let manual = Arc::new(ManualChannel::new());
    let channel: Arc<dyn Channel> = manual.clone();
    let script = fixtures::compile_json(
        "read-weather",
        r#"[
            {"op": "submit", "request": "read", "channel": "manual",
             "parameters": [{"name": "address", "value": "16"}],
             "result": {"variable": "reading", "message_type": "weather"}},
            {"op": "put", "attribute": "temperature", "value": "reading.temperature"},
            {"op": "emit"}
        ]"#,
        &weather_env(channel),
    );

    let exec = fixtures::executor(2);
    let (tx, rx) = unbounded();
    let runner = exec
        .execute(script, ScriptParams::new(), Arc::new(CollectScript(tx)))
        .unwrap();

    wait_for("suspension", || runner.is_suspended());
    runner.cancel();

    match rx.recv_timeout(common::test_timeout()).unwrap() {
        ScriptOutcome::Error(RuntimeError::Cancelled(_)) => {}
        ScriptOutcome::Error(e) => panic!("unexpected error: {e}"),
        ScriptOutcome::Complete(_) => panic!("cancellation must not complete"),
    }

    // The late transport callback is discarded; the error fired exactly
    // once.
    assert!(manual.complete_next(Some(weather_payload(1, 1))));
    assert!(rx.recv_timeout(std::time::Duration::from_millis(200)).is_err());
    assert_eq!(runner.state(), RunnerState::Cancelled);
}

#[test]
fn test_compilation_accumulates_every_error() {
    let channel: Arc<dyn Channel> = Arc::new(MockChannel::new("dev"));
    let report = compile(
        "broken",
        &[
            InstructionDesc::Put {
                attribute: "no_such_attribute".to_string(),
                value: "1".to_string(),
            },
            InstructionDesc::Set {
                variable: "undeclared".to_string(),
                field: None,
                value: "2".to_string(),
            },
        ],
        &weather_env(channel),
    )
    .unwrap_err();

    assert_eq!(report.len(), 2);
    assert!(report
        .errors()
        .iter()
        .any(|e| matches!(e, CompileError::UnknownAttribute(_))));
    assert!(report
        .errors()
        .iter()
        .any(|e| matches!(e, CompileError::UndeclaredVariable(_))));
}

#[test]
fn test_debugger_sees_breakpoints() {
    struct Count(AtomicUsize);
    impl ScriptDebugger for Count {
        fn breakpoint(&self, _script: &Arc<devmux::Script>, _context: &devmux::script::ExecutionContext) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let channel: Arc<dyn Channel> = Arc::new(MockChannel::new("dev"));
    let script = fixtures::compile_json(
        "stepped",
        r#"[
            {"op": "put", "attribute": "temperature", "value": "5"},
            {"op": "breakpoint"},
            {"op": "emit"},
            {"op": "breakpoint"}
        ]"#,
        &weather_env(channel),
    );

    let exec = fixtures::executor(1);
    let (tx, rx) = unbounded();
    let debugger = Arc::new(Count(AtomicUsize::new(0)));
    exec.execute_with_debugger(
        script,
        ScriptParams::new(),
        Arc::new(CollectScript(tx)),
        debugger.clone(),
    )
    .unwrap();

    match rx.recv_timeout(common::test_timeout()).unwrap() {
        ScriptOutcome::Complete(samples) => assert_eq!(samples.len(), 1),
        ScriptOutcome::Error(e) => panic!("unexpected error: {e}"),
    }
    assert_eq!(debugger.0.load(Ordering::SeqCst), 2);
}
