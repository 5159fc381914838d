//! Tests for the orchestrator: routing, concurrency across messages,
//! disconnects and shutdown.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use nowpilot::api::PlannedTool;
use nowpilot::error::PilotError;
use nowpilot::orchestrator::{ClientHandle, Collaborators, Orchestrator};
use nowpilot::pool::ConnectionPool;
use nowpilot::store::MemoryStore;
use nowpilot::types::{Config, EventSink, ServerEvent, SessionId};

use crate::common::{
    catalog, collect_until_terminal, names, shape, test_config, ScriptedConnector,
    ScriptedGenerator, ScriptedSelector, Step,
};

const LIMIT: Duration = Duration::from_secs(5);

async fn orchestrator(
    config: &Config,
    connector: &ScriptedConnector,
    plan: Vec<PlannedTool>,
) -> Arc<Orchestrator> {
    let pool = ConnectionPool::initialize(&config.pool, Arc::new(connector.clone()))
        .await
        .unwrap();
    Orchestrator::new(
        config,
        pool,
        catalog(),
        Collaborators {
            selector: Arc::new(ScriptedSelector::new(plan)),
            generator: Arc::new(ScriptedGenerator::new(&["All ", "done."])),
            store: Arc::new(MemoryStore::new()),
        },
    )
}

fn client() -> (ClientHandle, mpsc::UnboundedReceiver<ServerEvent>) {
    let (sink, rx) = EventSink::channel();
    (ClientHandle::new("127.0.0.1", sink), rx)
}

async fn until_idle(orchestrator: &Orchestrator) {
    tokio::time::timeout(LIMIT, async {
        while orchestrator.active_messages() > 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();
}

async fn next_approval(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> nowpilot::types::ApprovalId {
    loop {
        match tokio::time::timeout(LIMIT, rx.recv()).await.unwrap() {
            Some(ServerEvent::ApprovalRequired { id, .. }) => return id,
            Some(_) => continue,
            None => panic!("client channel closed before an approval prompt"),
        }
    }
}

#[tokio::test]
async fn test_new_conversation_is_announced() {
    let connector = ScriptedConnector::default();
    let orchestrator = orchestrator(&test_config(), &connector, Vec::new()).await;
    let (client, mut rx) = client();

    let message_id = orchestrator
        .submit_message(&client, "Hi".into(), None, None)
        .unwrap();
    let events = collect_until_terminal(&mut rx, LIMIT).await;

    assert_eq!(
        shape(&events),
        [
            "session.ready",
            "stream.start",
            "stream.thinking",
            "text.chunk",
            "stream.complete",
        ]
    );
    assert_eq!(events[1].message_id(), Some(&message_id));
    until_idle(&orchestrator).await;
    assert_eq!(orchestrator.stats().conversations, 1);
}

#[tokio::test]
async fn test_existing_conversation_is_not_announced() {
    let connector = ScriptedConnector::default();
    let orchestrator = orchestrator(&test_config(), &connector, Vec::new()).await;
    let (client, mut rx) = client();

    orchestrator
        .submit_message(&client, "Hi".into(), None, Some(SessionId::from("s-42")))
        .unwrap();
    let events = collect_until_terminal(&mut rx, LIMIT).await;

    assert_eq!(names(&events)[0], "stream.start");
}

#[tokio::test]
async fn test_model_override_reaches_final_message() {
    let connector = ScriptedConnector::default();
    let orchestrator = orchestrator(&test_config(), &connector, Vec::new()).await;
    let (client, mut rx) = client();

    orchestrator
        .submit_message(&client, "Hi".into(), Some("claude-haiku".into()), None)
        .unwrap();
    let events = collect_until_terminal(&mut rx, LIMIT).await;

    match events.last() {
        Some(ServerEvent::StreamComplete { message, .. }) => {
            assert_eq!(message.model, "claude-haiku");
            assert_eq!(message.content, "All done.");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_single_connection_serializes_tool_calls_across_messages() {
    let mut config = test_config();
    config.pool.size = 1;
    let connector = ScriptedConnector::new([
        Step::Slow(Duration::from_millis(20), json!({"number": "INC1"})),
        Step::Slow(Duration::from_millis(20), json!({"number": "INC2"})),
    ]);
    let plan = vec![PlannedTool::new("servicenow__create_incident", json!({}))];
    let orchestrator = orchestrator(&config, &connector, plan).await;
    let (client, mut rx) = client();

    orchestrator
        .submit_message(&client, "first".into(), None, Some(SessionId::from("a")))
        .unwrap();
    orchestrator
        .submit_message(&client, "second".into(), None, Some(SessionId::from("b")))
        .unwrap();
    until_idle(&orchestrator).await;
    drop(client);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    let starts = events.iter().filter(|e| e.name() == "tool.start").count();
    let completes = events.iter().filter(|e| e.name() == "tool.complete").count();
    assert_eq!((starts, completes), (2, 2));
    assert_eq!(
        events.iter().filter(|e| e.name() == "stream.complete").count(),
        2
    );
    assert_eq!(connector.state.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_approval_is_routed_to_its_conversation() {
    let connector = ScriptedConnector::new([Step::Reply(json!({"deleted": true}))]);
    let plan = vec![PlannedTool::new("servicenow__delete_record", json!({"sys_id": "x"}))];
    let orchestrator = orchestrator(&test_config(), &connector, plan).await;
    let (client, mut rx) = client();

    orchestrator
        .submit_message(&client, "Delete it".into(), None, None)
        .unwrap();
    let id = next_approval(&mut rx).await;

    let bogus = nowpilot::types::ApprovalId::from("not-a-prompt");
    assert!(matches!(
        orchestrator.respond_approval(&bogus, true, false, None),
        Err(PilotError::NotFound { .. })
    ));

    orchestrator.respond_approval(&id, true, false, None).unwrap();
    let events = collect_until_terminal(&mut rx, LIMIT).await;

    assert!(names(&events).contains(&"tool.complete"));
    assert_eq!(names(&events).last(), Some(&"stream.complete"));
    assert_eq!(connector.state.calls(), ["delete_record"]);
}

#[tokio::test]
async fn test_always_allow_applies_to_later_messages_of_conversation() {
    let connector = ScriptedConnector::default();
    let plan = vec![PlannedTool::new("servicenow__delete_record", json!({}))];
    let orchestrator = orchestrator(&test_config(), &connector, plan).await;
    let (client, mut rx) = client();
    let session = SessionId::from("conversation-1");

    orchestrator
        .submit_message(&client, "Delete one".into(), None, Some(session.clone()))
        .unwrap();
    let id = next_approval(&mut rx).await;
    orchestrator.respond_approval(&id, true, true, None).unwrap();
    collect_until_terminal(&mut rx, LIMIT).await;
    until_idle(&orchestrator).await;

    orchestrator
        .submit_message(&client, "Delete another".into(), None, Some(session))
        .unwrap();
    let events = collect_until_terminal(&mut rx, LIMIT).await;

    assert!(!names(&events).contains(&"tool.approval_required"));
    assert!(names(&events).contains(&"tool.complete"));

    // A different conversation is prompted again
    orchestrator
        .submit_message(&client, "Delete elsewhere".into(), None, Some(SessionId::from("other")))
        .unwrap();
    let _ = next_approval(&mut rx).await;
}

#[tokio::test]
async fn test_disconnect_releases_connection_without_completing() {
    let connector = ScriptedConnector::new([Step::Hang]);
    let plan = vec![PlannedTool::new("servicenow__create_incident", json!({}))];
    let orchestrator = orchestrator(&test_config(), &connector, plan).await;
    let (client, mut rx) = client();

    orchestrator
        .submit_message(&client, "Create it".into(), None, None)
        .unwrap();
    loop {
        let event = tokio::time::timeout(LIMIT, rx.recv()).await.unwrap().unwrap();
        if event.name() == "tool.start" {
            break;
        }
    }
    assert_eq!(orchestrator.pool().stats().in_use, 1);

    orchestrator.disconnect(&client);
    until_idle(&orchestrator).await;

    let mut rest = Vec::new();
    while let Ok(event) = rx.try_recv() {
        rest.push(event);
    }
    assert!(!names(&rest).contains(&"stream.complete"));
    assert_eq!(orchestrator.pool().stats().in_use, 0);
    assert_eq!(orchestrator.stats().queued_tool_calls, 0);
}

#[tokio::test]
async fn test_cancel_message_stops_only_that_message() {
    let connector = ScriptedConnector::new([Step::Hang]);
    let plan = vec![PlannedTool::new("servicenow__create_incident", json!({}))];
    let orchestrator = orchestrator(&test_config(), &connector, plan).await;
    let (client, mut rx) = client();

    let message = orchestrator
        .submit_message(&client, "Create it".into(), None, None)
        .unwrap();
    loop {
        let event = tokio::time::timeout(LIMIT, rx.recv()).await.unwrap().unwrap();
        if event.name() == "tool.start" {
            break;
        }
    }

    assert!(orchestrator.cancel_message(&message));
    let events = collect_until_terminal(&mut rx, LIMIT).await;
    match events.last() {
        Some(ServerEvent::StreamError { error, message_id }) => {
            assert_eq!(message_id, &message);
            assert_eq!(error, "The request was cancelled.");
        }
        other => panic!("unexpected {other:?}"),
    }

    until_idle(&orchestrator).await;
    assert!(!orchestrator.cancel_message(&message));
    assert!(!client.cancel.is_cancelled());
}

#[tokio::test]
async fn test_rate_limited_submit_is_rejected() {
    let mut config = test_config();
    config.rate_limit.max_messages = 1;
    let connector = ScriptedConnector::default();
    let orchestrator = orchestrator(&config, &connector, Vec::new()).await;
    let (client, mut rx) = client();

    orchestrator
        .submit_message(&client, "one".into(), None, Some(SessionId::from("s")))
        .unwrap();
    collect_until_terminal(&mut rx, LIMIT).await;

    let err = orchestrator
        .submit_message(&client, "two".into(), None, Some(SessionId::from("s")))
        .unwrap_err();
    assert!(matches!(err, PilotError::RateLimited { .. }));
    match rx.recv().await {
        Some(ServerEvent::RateLimited { retry_after_ms }) => assert!(retry_after_ms > 0),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_shutdown_cancels_work_and_refuses_new_messages() {
    let connector = ScriptedConnector::new([Step::Hang]);
    let plan = vec![PlannedTool::new("servicenow__create_incident", json!({}))];
    let orchestrator = orchestrator(&test_config(), &connector, plan).await;
    let (client, mut rx) = client();

    orchestrator
        .submit_message(&client, "Create it".into(), None, None)
        .unwrap();
    loop {
        let event = tokio::time::timeout(LIMIT, rx.recv()).await.unwrap().unwrap();
        if event.name() == "tool.start" {
            break;
        }
    }

    orchestrator.shutdown(Duration::from_secs(2)).await;

    assert_eq!(orchestrator.active_messages(), 0);
    assert!(orchestrator.pool().is_closed());
    let events = collect_until_terminal(&mut rx, LIMIT).await;
    assert_eq!(names(&events).last(), Some(&"stream.error"));
    assert!(matches!(
        orchestrator.submit_message(&client, "again".into(), None, None),
        Err(PilotError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_finished_conversations_are_forgotten_after_ttl() {
    let mut config = test_config();
    config.session.conversation_idle_ttl = Duration::ZERO;
    let connector = ScriptedConnector::default();
    let orchestrator = orchestrator(&config, &connector, Vec::new()).await;

    for n in 0..20 {
        let (client, mut rx) = client();
        orchestrator
            .submit_message(&client, "hi".into(), None, Some(SessionId::from(format!("s-{n}"))))
            .unwrap();
        collect_until_terminal(&mut rx, LIMIT).await;
        orchestrator.disconnect(&client);
    }
    until_idle(&orchestrator).await;

    let stats = orchestrator.stats();
    assert_eq!(stats.active_messages, 0);
    assert_eq!(stats.conversations, 0);
}

#[tokio::test]
async fn test_idle_conversation_is_kept_within_ttl() {
    let connector = ScriptedConnector::default();
    let orchestrator = orchestrator(&test_config(), &connector, Vec::new()).await;
    let (client, mut rx) = client();

    orchestrator
        .submit_message(&client, "hi".into(), None, Some(SessionId::from("kept")))
        .unwrap();
    collect_until_terminal(&mut rx, LIMIT).await;
    until_idle(&orchestrator).await;

    assert_eq!(orchestrator.stats().conversations, 1);
}

#[tokio::test]
async fn test_stats_report_pool_and_catalog() {
    let connector = ScriptedConnector::default();
    let orchestrator = orchestrator(&test_config(), &connector, Vec::new()).await;

    let stats = orchestrator.stats();
    assert_eq!(stats.pool.total, 2);
    assert_eq!(stats.tools, 3);
    assert_eq!(stats.active_messages, 0);

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["queuedToolCalls"], 0);
    assert_eq!(json["pool"]["inUse"], 0);
}
