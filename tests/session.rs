mod common;

use common::{drain, wait_for, MockRunner, EVENT_TIMEOUT};
use serde_json::json;
use std::sync::mpsc::Receiver;
use std::thread;
use suitedbg::error::ConnectorError;
use suitedbg::runner::protocol::{BreakpointRecord, Frame, Variable};
use suitedbg::runner::{CloseReason, RunnerConnector};
use suitedbg::session::breakpoint::Breakpoint;
use suitedbg::session::{DebugSession, SessionEvent};

fn session(mock: &MockRunner, stop_on_entry: bool) -> (DebugSession, Receiver<SessionEvent>) {
    let (connector, runner_events) = RunnerConnector::new(mock.clone(), "127.0.0.1", 0);
    DebugSession::new(connector, runner_events, stop_on_entry)
}

fn started(mock: &MockRunner, stop_on_entry: bool) -> (DebugSession, Receiver<SessionEvent>) {
    let (session, events) = session(mock, stop_on_entry);
    session.start().unwrap();
    wait_for(&events, |e| *e == SessionEvent::Connected);
    (session, events)
}

fn breakpoint(id: i64, source: &str, line: u32) -> Breakpoint {
    Breakpoint {
        id,
        source: source.to_string(),
        line,
        verified: true,
    }
}

#[test]
fn test_set_breakpoints() {
    let mock = MockRunner::new();
    let (session, _events) = started(&mock, true);

    let source = "/suites/login.robot";
    let breakpoints = session
        .set_breakpoints(source, vec![1, 4, 10])
        .unwrap()
        .wait_timeout(EVENT_TIMEOUT)
        .unwrap();
    assert_eq!(
        breakpoints,
        vec![
            breakpoint(1, source, 1),
            breakpoint(2, source, 4),
            breakpoint(3, source, 10),
        ]
    );

    let request = mock.wait_request("SET_BREAKPOINTS");
    assert_eq!(request.args, json!({"path": source, "lines": [1, 4, 10]}));
}

#[test]
fn test_breakpoint_lines_are_local() {
    let mock = MockRunner::new();
    // never started, no runner to ask
    let (session, _events) = session(&mock, true);

    session.set_breakpoints("/suites/a.robot", vec![10, 2, 2]).unwrap();
    assert_eq!(session.breakpoint_lines("/suites/a.robot"), vec![10, 2, 2]);
    assert!(session.breakpoint_lines("/suites/b.robot").is_empty());

    session.set_breakpoints("/suites/a.robot", vec![5]).unwrap();
    assert_eq!(session.breakpoint_lines("/suites/a.robot"), vec![5]);

    session.clear_breakpoints("/suites/a.robot").unwrap();
    assert!(session.breakpoint_lines("/suites/a.robot").is_empty());
}

#[test]
fn test_concurrent_breakpoint_updates() {
    const THREADS: u32 = 4;
    const UPDATES: u32 = 25;
    let source = "/suites/login.robot";

    let mock = MockRunner::new();
    let (session, _events) = started(&mock, true);

    thread::scope(|s| {
        for t in 0..THREADS {
            let session = &session;
            s.spawn(move || {
                for u in 0..UPDATES {
                    session.set_breakpoints(source, vec![t * 100 + u]).unwrap();
                }
            });
        }
    });

    let requests = mock.wait_requests("SET_BREAKPOINTS", (THREADS * UPDATES) as usize);
    let last = requests.last().unwrap();
    assert_eq!(last.args["lines"], json!(session.breakpoint_lines(source)));
}

#[test]
fn test_breakpoints_replayed_on_connect() {
    let mock = MockRunner::new();
    let (session, events) = session(&mock, true);

    session.set_breakpoints("/suites/b.robot", vec![7]).unwrap();
    session.set_breakpoints("/suites/a.robot", vec![3, 9]).unwrap();
    session.start().unwrap();
    wait_for(&events, |e| *e == SessionEvent::Connected);

    session
        .pause()
        .unwrap()
        .wait_timeout(EVENT_TIMEOUT)
        .unwrap();

    assert_eq!(
        mock.received_tags(),
        vec![
            "SET_BREAKPOINTS",
            "SET_BREAKPOINTS",
            "SET_BREAKPOINTS",
            "SET_BREAKPOINTS",
            "PAUSE"
        ]
    );
    let replayed: Vec<_> = mock.received()[2..4]
        .iter()
        .map(|e| e.args["path"].clone())
        .collect();
    assert_eq!(replayed, vec![json!("/suites/a.robot"), json!("/suites/b.robot")]);
}

#[test]
fn test_replayed_breakpoints_validated() {
    let mock = MockRunner::new();
    let (session, events) = session(&mock, true);

    session.set_breakpoints("/suites/a.robot", vec![3, 9]).unwrap();
    session.start().unwrap();

    let mut validated = vec![];
    for _ in 0..2 {
        match wait_for(&events, |e| matches!(e, SessionEvent::BreakpointValidated(_))) {
            SessionEvent::BreakpointValidated(bp) => validated.push(bp),
            _ => unreachable!(),
        }
    }
    assert_eq!(
        validated,
        vec![
            breakpoint(1, "/suites/a.robot", 3),
            breakpoint(2, "/suites/a.robot", 9),
        ]
    );
}

#[test]
fn test_continue_after_entry() {
    let mock = MockRunner::new();
    let (_session, events) = started(&mock, false);

    wait_for(&events, |e| *e == SessionEvent::StoppedOnEntry);
    let request = mock.wait_request("CONTINUE");
    assert_eq!(request.args, json!({}));
}

#[test]
fn test_stop_on_entry() {
    let mock = MockRunner::new();
    let (session, events) = started(&mock, true);

    wait_for(&events, |e| *e == SessionEvent::StoppedOnEntry);
    session
        .next()
        .unwrap()
        .wait_timeout(EVENT_TIMEOUT)
        .unwrap();
    assert_eq!(mock.received_tags(), vec!["STEP"]);
}

#[test]
fn test_execution_control_is_relayed() {
    let mock = MockRunner::new();
    let (session, _events) = started(&mock, true);

    let replies = vec![
        session.resume().unwrap(),
        session.resume().unwrap(),
        session.step_in().unwrap(),
        session.step_out().unwrap(),
        session.pause().unwrap(),
        session.terminate().unwrap(),
    ];
    for reply in replies {
        reply.wait_timeout(EVENT_TIMEOUT).unwrap();
    }
    assert_eq!(
        mock.received_tags(),
        vec!["CONTINUE", "CONTINUE", "STEP_IN", "STEP_OUT", "PAUSE", "TERMINATE"]
    );
}

#[test]
fn test_inspection() {
    let mock = MockRunner::new();
    let (session, _events) = started(&mock, true);

    let frames = session
        .call_stack()
        .unwrap()
        .wait_timeout(EVENT_TIMEOUT)
        .unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(
        frames[0],
        Frame {
            index: 0,
            name: "Valid Login".to_string(),
            file: "/suites/login.robot".to_string(),
            line: 12,
        }
    );

    let vars = session
        .variables(1)
        .unwrap()
        .wait_timeout(EVENT_TIMEOUT)
        .unwrap();
    assert_eq!(
        vars,
        vec![Variable {
            name: "${USER}".to_string(),
            value: "demo".to_string()
        }]
    );
    assert_eq!(mock.wait_request("VARIABLES").args, json!({"frame_id": 1}));

    let value = session
        .evaluate("${USER}", 0)
        .unwrap()
        .wait_timeout(EVENT_TIMEOUT)
        .unwrap();
    assert_eq!(value, json!({"expression": "${USER}", "frame_id": 0}));
}

#[test]
fn test_stop_events() {
    let mock = MockRunner::new();
    let (_session, events) = started(&mock, true);

    mock.hit_breakpoint(json!({"breakpoint": {"id": 1, "line": 12, "verified": true}}));
    assert_eq!(
        wait_for(&events, |e| matches!(e, SessionEvent::StoppedOnBreakpoint(_))),
        SessionEvent::StoppedOnBreakpoint(Some(BreakpointRecord {
            id: 1,
            line: 12,
            verified: true
        }))
    );

    mock.stop_on_step();
    wait_for(&events, |e| *e == SessionEvent::StoppedOnStep);
}

#[test]
fn test_terminated_once() {
    let mock = MockRunner::new();
    let (session, events) = started(&mock, true);

    mock.exit(Some(0));
    assert_eq!(
        wait_for(&events, |e| matches!(e, SessionEvent::Terminated(_))),
        SessionEvent::Terminated(CloseReason::RunnerExited(Some(0)))
    );

    assert!(matches!(
        session.pause(),
        Err(ConnectorError::Closed)
    ));
    session.shutdown();
    assert!(!drain(&events)
        .iter()
        .any(|e| matches!(e, SessionEvent::Terminated(_))));
}
