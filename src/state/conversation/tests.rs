use super::*;
use crate::api::mock_client::{
    content_chunk, finish_chunk, role_chunk, text_round, tool_round, MockResponse,
    MockStreamSource,
};
use crate::error::Error;
use crate::sink::{ChannelSink, EventSink, RecordingSink};
use crate::types::{Entry, ResponseEvent, Role};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[test]
fn test_conversation_module_structure() {
    let _ = std::any::TypeId::of::<Session>();
    let _ = std::any::TypeId::of::<TurnAssembler>();

    assert!(Path::new("src/state/conversation/state.rs").exists());
    assert!(Path::new("src/state/conversation/core.rs").exists());
    assert!(Path::new("src/state/conversation/streaming.rs").exists());
    assert!(Path::new("src/state/conversation/history.rs").exists());
}

fn session_with(responses: Vec<MockResponse>, options: SessionOptions) -> (Session, MockStreamSource) {
    let source = MockStreamSource::new(responses);
    let session = Session::with_source(Arc::new(source.clone()), options);
    (session, source)
}

fn recording() -> (Arc<RecordingSink>, Arc<dyn EventSink>) {
    let sink = Arc::new(RecordingSink::new());
    let as_dyn: Arc<dyn EventSink> = sink.clone();
    (sink, as_dyn)
}

fn roles(entries: &[Entry]) -> Vec<Role> {
    entries.iter().map(|entry| entry.role).collect()
}

fn parse(content: &str) -> Value {
    serde_json::from_str(content).expect("tool content is JSON")
}

async fn wait_for_text(rx: &mut mpsc::UnboundedReceiver<ResponseEvent>) -> String {
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("text delta should arrive")
        .expect("channel open");
    match event {
        ResponseEvent::TextDelta { content, .. } => content,
        other => panic!("expected text delta, got {other:?}"),
    }
}

#[tokio::test]
async fn test_tool_call_then_text_followup() {
    let (session, source) = session_with(
        vec![
            tool_round(&[("c1", "list_directory", "{\"path\":\".\"}")]),
            text_round(&["I see ", "two files."]),
        ],
        SessionOptions::default(),
    );
    let (events, sink) = recording();

    let outcome = session
        .submit_user_turn(vec![Entry::user("list files")], sink)
        .await
        .unwrap();
    let TurnOutcome::ToolCalls(calls) = outcome else {
        panic!("expected tool calls");
    };
    assert_eq!(calls[0].id, "c1");
    assert_eq!(calls[0].function.arguments, "{\"path\":\".\"}");
    assert_eq!(session.state(), SessionState::AwaitingToolResults);
    assert_eq!(session.pending_calls(), vec!["c1".to_string()]);
    assert!(matches!(
        events.take().as_slice(),
        [ResponseEvent::ToolCallReady { id, name, .. }] if id == "c1" && name == "list_directory"
    ));

    let outcome = session
        .submit_tool_result("c1", "list_directory", "a.txt\nb.txt", true)
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Text("I see two files.".to_string()));
    assert_eq!(session.state(), SessionState::Idle);
    assert!(session.pending_calls().is_empty());

    let followup_events = events.take();
    let texts: Vec<&str> = followup_events
        .iter()
        .filter_map(|event| match event {
            ResponseEvent::TextDelta { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["I see ", "I see two files."]);
    assert_eq!(followup_events.last(), Some(&ResponseEvent::FollowupComplete));

    let history = session.history();
    assert_eq!(
        roles(&history),
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    assert_eq!(history[1].tool_calls[0].id, "c1");
    assert_eq!(history[2].tool_call_id.as_deref(), Some("c1"));
    assert_eq!(history[2].name.as_deref(), Some("list_directory"));
    assert_eq!(parse(&history[2].content), json!({ "output": "a.txt\nb.txt" }));
    assert_eq!(history[3].content, "I see two files.");

    let requests = source.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(roles(&requests[1].messages), vec![Role::User, Role::Assistant, Role::Tool]);
    assert_eq!(requests[1].tools.len(), 5);
}

#[tokio::test]
async fn test_new_user_turn_reconciles_pending_calls() {
    let (session, source) = session_with(
        vec![
            tool_round(&[("c1", "shell", "{\"command\":\"ls\"}")]),
            text_round(&["Okay."]),
        ],
        SessionOptions::default(),
    );
    let (_events, sink) = recording();

    session
        .submit_user_turn(vec![Entry::user("list files")], Arc::clone(&sink))
        .await
        .unwrap();
    let outcome = session
        .submit_user_turn(vec![Entry::user("never mind")], sink)
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Text("Okay.".to_string()));
    assert!(session.pending_calls().is_empty());

    let history = session.history();
    assert_eq!(
        roles(&history),
        vec![Role::User, Role::Assistant, Role::Tool, Role::User, Role::Assistant]
    );
    assert_eq!(history[2].tool_call_id.as_deref(), Some("c1"));
    assert_eq!(history[2].name.as_deref(), Some("shell"));
    assert_eq!(
        parse(&history[2].content),
        json!({ "error": "execution cancelled by user" })
    );
    assert_eq!(history[3].content, "never mind");

    let second = &source.requests()[1];
    assert_eq!(
        roles(&second.messages),
        vec![Role::User, Role::Assistant, Role::Tool, Role::User]
    );
}

#[tokio::test]
async fn test_registration_precedes_tool_call_delivery() {
    let source = MockStreamSource::new(vec![tool_round(&[
        ("a", "read_file", "{\"path\":\"x\"}"),
        ("b", "read_file", "{\"path\":\"y\"}"),
    ])]);
    let session = Arc::new(Session::with_source(
        Arc::new(source),
        SessionOptions::default(),
    ));

    let observed = Arc::new(Mutex::new(Vec::new()));
    let probe = Arc::clone(&session);
    let log = Arc::clone(&observed);
    let sink = move |event: ResponseEvent| {
        if let ResponseEvent::ToolCallReady { id, .. } = event {
            let registered = probe.pending.contains(&id);
            log.lock().push((id, registered));
        }
    };

    session
        .submit_user_turn(vec![Entry::user("read both")], Arc::new(sink))
        .await
        .unwrap();

    assert_eq!(
        observed.lock().clone(),
        vec![("a".to_string(), true), ("b".to_string(), true)]
    );
}

#[tokio::test]
async fn test_cancel_mid_stream_commits_nothing() {
    let (session, _source) = session_with(
        vec![MockResponse::Stall(vec![role_chunk(), content_chunk("partial")])],
        SessionOptions::default(),
    );
    let session = Arc::new(session);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let runner = Arc::clone(&session);
    let handle = tokio::spawn(async move {
        runner
            .submit_user_turn(vec![Entry::user("write an essay")], Arc::new(ChannelSink::new(tx)))
            .await
    });

    assert_eq!(wait_for_text(&mut rx).await, "partial");
    assert_eq!(session.state(), SessionState::Streaming);
    session.cancel();

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(session.state(), SessionState::Cancelled);
    assert_eq!(roles(&session.history()), vec![Role::User]);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_new_user_turn_supersedes_stalled_stream() {
    let (session, _source) = session_with(
        vec![
            MockResponse::Stall(vec![role_chunk(), content_chunk("stale")]),
            text_round(&["fresh"]),
        ],
        SessionOptions::default(),
    );
    let session = Arc::new(session);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let runner = Arc::clone(&session);
    let first = tokio::spawn(async move {
        runner
            .submit_user_turn(vec![Entry::user("first")], Arc::new(ChannelSink::new(tx)))
            .await
    });
    assert_eq!(wait_for_text(&mut rx).await, "stale");

    let (_events, sink) = recording();
    let outcome = session
        .submit_user_turn(vec![Entry::user("second")], sink)
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Text("fresh".to_string()));

    assert!(matches!(first.await.unwrap(), Err(Error::Cancelled)));
    assert_eq!(session.state(), SessionState::Idle);
    let history = session.history();
    assert_eq!(roles(&history), vec![Role::User, Role::User, Role::Assistant]);
    assert_eq!(history[2].content, "fresh");
}

#[tokio::test]
async fn test_transport_error_leaves_log_consistent_and_allows_retry() {
    let (session, _source) = session_with(
        vec![
            MockResponse::Fail(vec![role_chunk(), content_chunk("par")], "connection reset".to_string()),
            text_round(&["ok"]),
        ],
        SessionOptions::default(),
    );
    let (_events, sink) = recording();

    let result = session
        .submit_user_turn(vec![Entry::user("hello")], Arc::clone(&sink))
        .await;
    assert!(matches!(result, Err(Error::Transport(message)) if message == "connection reset"));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(roles(&session.history()), vec![Role::User]);

    let outcome = session
        .submit_user_turn(vec![Entry::user("hello again")], sink)
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Text("ok".to_string()));
    assert_eq!(session.last_assistant_message().as_deref(), Some("ok"));
}

#[tokio::test]
async fn test_refused_open_fails_turn() {
    let (session, _source) = session_with(
        vec![MockResponse::RefuseOpen("HTTP 500".to_string())],
        SessionOptions::default(),
    );
    let (_events, sink) = recording();
    let result = session.submit_user_turn(vec![Entry::user("hi")], sink).await;
    assert!(matches!(result, Err(Error::Transport(_))));
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_stream_without_finish_marker_is_an_error() {
    let (session, _source) = session_with(
        vec![MockResponse::Chunks(vec![role_chunk(), content_chunk("hi")])],
        SessionOptions::default(),
    );
    let (events, sink) = recording();

    let result = session.submit_user_turn(vec![Entry::user("hi")], sink).await;
    assert!(matches!(result, Err(Error::MissingFinishMarker)));
    assert_eq!(roles(&session.history()), vec![Role::User]);
    assert!(!events.events().contains(&ResponseEvent::TurnComplete));
}

#[tokio::test]
async fn test_text_turn_emits_turn_complete() {
    let (session, _source) = session_with(vec![text_round(&["Hi", " there"])], SessionOptions::default());
    let (events, sink) = recording();

    session
        .submit_user_turn(vec![Entry::user("hello")], sink)
        .await
        .unwrap();
    let events = events.events();
    assert_eq!(events.len(), 3);
    assert_eq!(events.last(), Some(&ResponseEvent::TurnComplete));
}

#[tokio::test]
async fn test_multi_call_batch_waits_for_every_result() {
    let (session, source) = session_with(
        vec![
            tool_round(&[
                ("a", "shell", "{\"command\":\"pwd\"}"),
                ("b", "read_file", "{\"path\":\"Cargo.toml\"}"),
            ]),
            text_round(&["done"]),
        ],
        SessionOptions::default(),
    );
    let (_events, sink) = recording();

    session
        .submit_user_turn(vec![Entry::user("inspect")], sink)
        .await
        .unwrap();

    let outcome = session
        .submit_tool_result("b", "read_file", "permission denied", false)
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::AwaitingResults { remaining: 1 });
    assert_eq!(source.requests().len(), 1);
    assert_eq!(session.state(), SessionState::AwaitingToolResults);

    let outcome = session
        .submit_tool_result("a", "shell", "/work", true)
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Text("done".to_string()));

    let history = session.history();
    assert_eq!(parse(&history[2].content), json!({ "error": "permission denied" }));
    let followup = &source.requests()[1];
    assert_eq!(
        roles(&followup.messages),
        vec![Role::User, Role::Assistant, Role::Tool, Role::Tool]
    );
}

#[tokio::test]
async fn test_followup_limit_stops_tool_loop() {
    let options = SessionOptions {
        max_followup_rounds: 1,
        ..SessionOptions::default()
    };
    let (session, source) = session_with(
        vec![
            tool_round(&[("c1", "shell", "{}")]),
            tool_round(&[("c2", "shell", "{}")]),
        ],
        options,
    );
    let (_events, sink) = recording();

    session
        .submit_user_turn(vec![Entry::user("loop")], sink)
        .await
        .unwrap();
    let outcome = session.submit_tool_result("c1", "shell", "one", true).await.unwrap();
    assert!(matches!(outcome, TurnOutcome::ToolCalls(ref calls) if calls[0].id == "c2"));

    let result = session.submit_tool_result("c2", "shell", "two", true).await;
    assert!(matches!(result, Err(Error::FollowupLimit(1))));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(source.requests().len(), 2);
    assert_eq!(session.history().last().map(|entry| entry.role), Some(Role::Tool));
}

#[tokio::test]
async fn test_finalized_session_records_result_without_followup() {
    let (session, source) = session_with(
        vec![tool_round(&[("c1", "shell", "{}")])],
        SessionOptions::default(),
    );
    let (events, sink) = recording();

    session
        .submit_user_turn(vec![Entry::user("run")], sink)
        .await
        .unwrap();
    events.take();
    session.finalize_interaction();

    let outcome = session.submit_tool_result("c1", "shell", "ok", true).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Detached);
    assert_eq!(source.requests().len(), 1);
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.history().last().map(|entry| entry.role), Some(Role::Tool));
    assert!(events.events().is_empty());
}

#[tokio::test]
async fn test_late_result_for_reconciled_call_is_ignored() {
    let (session, _source) = session_with(
        vec![tool_round(&[("c1", "shell", "{}")]), text_round(&["moved on"])],
        SessionOptions::default(),
    );
    let (_events, sink) = recording();

    session
        .submit_user_turn(vec![Entry::user("run")], Arc::clone(&sink))
        .await
        .unwrap();
    session
        .submit_user_turn(vec![Entry::user("stop that")], sink)
        .await
        .unwrap();
    let before = session.history().len();

    let outcome = session.submit_tool_result("c1", "shell", "late", true).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Ignored);
    assert_eq!(session.history().len(), before);
}

#[tokio::test]
async fn test_unknown_result_is_dropped() {
    let (session, source) = session_with(Vec::new(), SessionOptions::default());
    let outcome = session
        .submit_tool_result("ghost", "", "boo", true)
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Ignored);
    assert!(session.history().is_empty());
    assert!(source.requests().is_empty());
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_unknown_result_leaves_streaming_turn_alone() {
    let (session, source) = session_with(
        vec![
            text_round(&["first answer"]),
            MockResponse::Stall(vec![role_chunk(), content_chunk("thinking")]),
        ],
        SessionOptions::default(),
    );
    let session = Arc::new(session);
    let (_events, sink) = recording();
    session
        .submit_user_turn(vec![Entry::user("u1")], sink)
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let runner = Arc::clone(&session);
    let handle = tokio::spawn(async move {
        runner
            .submit_user_turn(vec![Entry::user("u2")], Arc::new(ChannelSink::new(tx)))
            .await
    });
    assert_eq!(wait_for_text(&mut rx).await, "thinking");

    let outcome = session
        .submit_tool_result("ghost", "shell", "boo", true)
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Ignored);
    assert_eq!(session.state(), SessionState::Streaming);
    assert!(!handle.is_finished());
    assert_eq!(source.requests().len(), 2);

    session.cancel();
    assert!(matches!(handle.await.unwrap(), Err(Error::Cancelled)));
    assert_eq!(
        roles(&session.history()),
        vec![Role::User, Role::Assistant, Role::User]
    );
}

#[tokio::test]
async fn test_turn_without_text_commits_no_entry() {
    let (session, source) = session_with(
        vec![
            MockResponse::Chunks(vec![role_chunk(), finish_chunk("stop")]),
            text_round(&["second"]),
        ],
        SessionOptions::default(),
    );
    let (events, sink) = recording();

    let outcome = session
        .submit_user_turn(vec![Entry::user("hi")], Arc::clone(&sink))
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Text(String::new()));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(roles(&session.history()), vec![Role::User]);
    assert_eq!(session.last_assistant_message(), None);
    assert_eq!(events.take(), vec![ResponseEvent::TurnComplete]);

    session
        .submit_user_turn(vec![Entry::user("hello?")], sink)
        .await
        .unwrap();
    assert_eq!(roles(&source.requests()[1].messages), vec![Role::User, Role::User]);
}

#[tokio::test]
async fn test_empty_tool_calls_marker_commits_no_entry() {
    let (session, _source) = session_with(
        vec![MockResponse::Chunks(vec![role_chunk(), finish_chunk("tool_calls")])],
        SessionOptions::default(),
    );
    let (_events, sink) = recording();

    let outcome = session
        .submit_user_turn(vec![Entry::user("hi")], sink)
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Text(String::new()));
    assert_eq!(roles(&session.history()), vec![Role::User]);
    assert!(session.pending_calls().is_empty());
}

#[tokio::test]
async fn test_cancel_leaves_pending_calls_alone() {
    let (session, _source) = session_with(
        vec![tool_round(&[("c1", "shell", "{}")])],
        SessionOptions::default(),
    );
    let (_events, sink) = recording();
    session
        .submit_user_turn(vec![Entry::user("run")], sink)
        .await
        .unwrap();

    session.cancel();
    assert_eq!(session.state(), SessionState::AwaitingToolResults);
    assert_eq!(session.pending_calls(), vec!["c1".to_string()]);
}

#[tokio::test]
async fn test_request_uses_context_window() {
    let options = SessionOptions {
        system_prompt: Some("Be brief.".to_string()),
        max_context_entries: 4,
        ..SessionOptions::default()
    };
    let (session, source) = session_with(
        vec![text_round(&["a1"]), text_round(&["a2"]), text_round(&["a3"])],
        options,
    );
    let (_events, sink) = recording();

    for prompt in ["u1", "u2", "u3"] {
        session
            .submit_user_turn(vec![Entry::user(prompt)], Arc::clone(&sink))
            .await
            .unwrap();
    }

    let last = &source.requests()[2];
    let contents: Vec<&str> = last.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["Be brief.", "u2", "a2", "u3"]);
    assert_eq!(session.history().len(), 7);
}

#[test]
fn test_system_messages_and_clear_history() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.json");
    let options = SessionOptions {
        system_prompt: Some("seed".to_string()),
        history_path: Some(path.clone()),
        ..SessionOptions::default()
    };
    let (session, _source) = session_with(Vec::new(), options);

    session.add_system_message("DEBUG: internal trace");
    session.add_system_message("Working directory is /tmp");
    assert_eq!(session.history().len(), 2);

    session.clear_history().unwrap();
    let history = session.history();
    assert_eq!(history, vec![Entry::system("seed")]);
    assert_eq!(
        crate::state::MessageLog::load(&path).unwrap().entries(),
        history.as_slice()
    );
}

#[test]
fn test_load_history_marks_unanswered_calls_pending() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("saved.json");
    let saved = crate::state::MessageLog::from(vec![
        Entry::user("go"),
        Entry::assistant_tool_calls(vec![
            crate::types::ToolCallRequest::function("done", "shell", "{}"),
            crate::types::ToolCallRequest::function("open", "shell", "{}"),
        ]),
        Entry::tool_result("done", None, "{\"output\":\"\"}"),
    ]);
    saved.save(&path).unwrap();

    let (session, _source) = session_with(Vec::new(), SessionOptions::default());
    session.load_history(&path).unwrap();

    assert_eq!(session.history(), saved.entries().to_vec());
    assert_eq!(session.pending_calls(), vec!["open".to_string()]);
    assert_eq!(session.state(), SessionState::AwaitingToolResults);
}

#[tokio::test]
async fn test_result_recorded_while_user_turn_owns_session() {
    let (session, source) = session_with(
        vec![MockResponse::Stall(vec![role_chunk(), content_chunk("busy")])],
        SessionOptions::default(),
    );
    let session = Arc::new(session);
    session.pending.register("open");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let runner = Arc::clone(&session);
    let handle = tokio::spawn(async move {
        runner
            .submit_user_turn(vec![Entry::user("go")], Arc::new(ChannelSink::new(tx)))
            .await
    });
    assert_eq!(wait_for_text(&mut rx).await, "busy");
    // The user turn answered the open call with a cancellation result.
    assert!(session.pending_calls().is_empty());

    session.pending.register("late");
    let outcome = session.submit_tool_result("late", "shell", "ok", true).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Recorded);
    assert_eq!(session.state(), SessionState::Streaming);
    assert_eq!(source.requests().len(), 1);

    session.cancel();
    assert!(matches!(handle.await.unwrap(), Err(Error::Cancelled)));
}

#[test]
fn test_close_saves_to_history_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("closed.json");
    let options = SessionOptions {
        history_path: Some(path.clone()),
        ..SessionOptions::default()
    };
    let (session, _source) = session_with(Vec::new(), options);
    session.add_system_message("remember me");

    session.close().unwrap();
    assert_eq!(crate::state::MessageLog::load(&path).unwrap().len(), 1);
    assert_eq!(session.state(), SessionState::Idle);
}

#[test]
fn test_sessions_get_distinct_ids() {
    let (a, _) = session_with(Vec::new(), SessionOptions::default());
    let (b, _) = session_with(Vec::new(), SessionOptions::default());
    assert_ne!(a.id(), b.id());
    assert_eq!(a.id().len(), 36);
}
