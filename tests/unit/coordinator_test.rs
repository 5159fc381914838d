//! End-to-end tests of one streaming session.
//!
//! Each test drives `SessionCoordinator::run` against a scripted tool
//! server, scripted model collaborators and an in-memory store, then checks
//! the exact events the client would have seen.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use nowpilot::api::{PlannedTool, TextGenerator, ToolSelector};
use nowpilot::approval::{ApprovalGate, ApprovalPolicy};
use nowpilot::error::{PilotError, PilotResult};
use nowpilot::pool::ConnectionPool;
use nowpilot::session::{SessionCoordinator, SessionOutcome, Turn};
use nowpilot::store::{ChatStore, MemoryStore, ToolExecutionUpdate};
use nowpilot::tools::{RetryPolicy, RetryQueue, ToolCallStatus, ToolExecutor, ToolNamespace};
use nowpilot::types::{
    ContextMessage, EventSink, ExecutionId, MessageId, Role, ServerEvent, SessionId, StoredMessage,
};

use crate::common::{
    catalog, pool_settings, shape, ScriptedConnector, ScriptedGenerator, ScriptedSelector, Step,
};

const CREATE: &str = "servicenow__create_incident";
const GET: &str = "servicenow__get_incident";
const DELETE: &str = "servicenow__delete_record";

struct Harness {
    coordinator: SessionCoordinator,
    connector: ScriptedConnector,
    generator: Arc<ScriptedGenerator>,
    store: Arc<MemoryStore>,
    pool: ConnectionPool,
    gate: Arc<ApprovalGate>,
}

impl Harness {
    async fn new(steps: impl IntoIterator<Item = Step>, plan: Vec<PlannedTool>) -> Self {
        Self::with(
            ScriptedConnector::new(steps),
            Arc::new(ScriptedSelector::new(plan)),
            Arc::new(ScriptedGenerator::new(&["Created ", "INC0010001", "."])),
            None,
        )
        .await
    }

    async fn with(
        connector: ScriptedConnector,
        selector: Arc<dyn ToolSelector>,
        generator: Arc<ScriptedGenerator>,
        store: Option<Arc<dyn ChatStore>>,
    ) -> Self {
        let pool = ConnectionPool::initialize(&pool_settings(1), Arc::new(connector.clone()))
            .await
            .unwrap();
        let executor = ToolExecutor::new(
            pool.clone(),
            ToolNamespace::new("servicenow"),
            Duration::from_millis(30),
        );
        let queue = Arc::new(RetryQueue::start(
            executor,
            RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(5),
                retry_tool_errors: false,
            },
            None,
        ));
        let memory = Arc::new(MemoryStore::new());
        let store = store.unwrap_or_else(|| Arc::clone(&memory) as Arc<dyn ChatStore>);
        let coordinator = SessionCoordinator::new(
            queue,
            selector,
            Arc::clone(&generator) as Arc<dyn TextGenerator>,
            store,
            Arc::new(catalog()),
        );

        Self {
            coordinator,
            connector,
            generator,
            store: memory,
            pool,
            gate: Arc::new(ApprovalGate::new(ApprovalPolicy::new(vec![
                "*delete*".to_string(),
            ]))),
        }
    }

    /// Runs one turn to completion and returns its outcome and events.
    async fn run(&self, session_id: &SessionId, text: &str) -> (SessionOutcome, Vec<ServerEvent>) {
        let (sink, mut rx) = EventSink::channel();
        let turn = Turn {
            session_id: session_id.clone(),
            message_id: MessageId::new(),
            text: text.to_string(),
            model: "claude-sonnet-4-5".to_string(),
        };
        let outcome = self
            .coordinator
            .run(turn, &self.gate, &sink, &CancellationToken::new())
            .await;
        drop(sink);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (outcome, events)
    }

    async fn assistant_record(&self, session_id: &SessionId) -> StoredMessage {
        self.store
            .messages(session_id)
            .await
            .into_iter()
            .find(|m| m.role == Role::Assistant)
            .unwrap()
    }
}

fn final_message(events: &[ServerEvent]) -> &nowpilot::types::FinalMessage {
    match events.last() {
        Some(ServerEvent::StreamComplete { message, .. }) => message,
        other => panic!("expected stream.complete, got {other:?}"),
    }
}

fn stream_error(events: &[ServerEvent]) -> &str {
    match events.last() {
        Some(ServerEvent::StreamError { error, .. }) => error,
        other => panic!("expected stream.error, got {other:?}"),
    }
}

// ============================================================================
// Happy paths
// ============================================================================

#[tokio::test]
async fn test_create_incident_event_sequence() {
    let harness = Harness::new(
        [Step::Reply(json!({"number": "INC0010001", "sys_id": "a1b2"}))],
        vec![PlannedTool::new(
            CREATE,
            json!({"short_description": "VPN is down"}),
        )],
    )
    .await;
    let session = SessionId::new();

    let (outcome, events) = harness.run(&session, "Create an incident: VPN is down").await;

    assert_eq!(outcome, SessionOutcome::Completed { degraded: false });
    assert_eq!(
        shape(&events),
        [
            "stream.start",
            "stream.thinking",
            "tool.start",
            "tool.complete",
            "text.chunk",
            "stream.complete",
        ]
    );

    let message_id = events[0].message_id().unwrap().clone();
    assert!(events.iter().all(|e| e.message_id() == Some(&message_id)));

    match &events[2] {
        ServerEvent::ToolStart {
            tool_name,
            arguments,
            ..
        } => {
            assert_eq!(tool_name, CREATE);
            assert_eq!(arguments, &json!({"short_description": "VPN is down"}));
        }
        other => panic!("unexpected {other:?}"),
    }
    match &events[3] {
        ServerEvent::ToolComplete { result, .. } => {
            assert_eq!(result, &json!({"number": "INC0010001", "sys_id": "a1b2"}));
        }
        other => panic!("unexpected {other:?}"),
    }

    let message = final_message(&events);
    assert_eq!(message.content, "Created INC0010001.");
    assert_eq!(message.model, "claude-sonnet-4-5");
    assert_eq!(message.tool_calls.len(), 1);
    assert_eq!(message.tool_calls[0].status, ToolCallStatus::Completed);
    assert_eq!(harness.connector.state.calls(), ["create_incident"]);
}

#[tokio::test]
async fn test_message_without_tools_goes_straight_to_text() {
    let harness = Harness::new([], Vec::new()).await;

    let (outcome, events) = harness.run(&SessionId::new(), "Hello").await;

    assert!(outcome.is_completed());
    assert_eq!(
        shape(&events),
        ["stream.start", "stream.thinking", "text.chunk", "stream.complete"]
    );
    assert!(final_message(&events).tool_calls.is_empty());
    assert!(harness.connector.state.calls().is_empty());
}

#[tokio::test]
async fn test_history_and_executions_are_persisted() {
    let harness = Harness::new(
        [Step::Reply(json!({"number": "INC0010001"}))],
        vec![PlannedTool::new(CREATE, json!({"short_description": "VPN"}))],
    )
    .await;
    let session = SessionId::new();

    harness.run(&session, "Create an incident").await;

    let messages = harness.store.messages(&session).await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "Create an incident");
    assert_eq!(messages[1].content, "Created INC0010001.");

    let record = harness.assistant_record(&session).await;
    let executions = harness.store.executions(&record.id).await;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].tool_name, CREATE);
    assert_eq!(executions[0].status, ToolCallStatus::Completed);
    assert_eq!(executions[0].result, Some(json!({"number": "INC0010001"})));
}

#[tokio::test]
async fn test_earlier_turns_become_context() {
    let harness = Harness::new([], Vec::new()).await;
    let session = SessionId::new();

    harness.run(&session, "First question").await;
    harness.run(&session, "Second question").await;

    let requests = harness.generator.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].context.is_empty());
    assert_eq!(
        requests[1].context,
        [
            ContextMessage::user("First question"),
            ContextMessage::assistant("Created INC0010001."),
        ]
    );
    assert_eq!(requests[1].user_text, "Second question");
}

#[tokio::test]
async fn test_tool_results_reach_the_generator() {
    let harness = Harness::new(
        [Step::Reply(json!({"state": "In Progress"}))],
        vec![PlannedTool::new(GET, json!({"number": "INC0010001"}))],
    )
    .await;

    harness.run(&SessionId::new(), "What is the state of INC0010001?").await;

    let requests = harness.generator.requests.lock().unwrap().clone();
    let results = &requests[0].tool_results;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].tool_name, GET);
    assert_eq!(results[0].result, Some(json!({"state": "In Progress"})));
}

#[tokio::test]
async fn test_progress_is_reported_between_start_and_complete() {
    let harness = Harness::new(
        [Step::Progress(vec![10, 60], json!({"ok": true}))],
        vec![PlannedTool::new(GET, json!({}))],
    )
    .await;

    let (_, events) = harness.run(&SessionId::new(), "Look it up").await;

    assert_eq!(
        &shape(&events)[2..6],
        &["tool.start", "tool.progress", "tool.progress", "tool.complete"]
    );
    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::ToolProgress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert_eq!(progress, [10, 60]);
}

#[tokio::test]
async fn test_transport_errors_retry_under_one_start() {
    let harness = Harness::new(
        [
            Step::Transport,
            Step::Transport,
            Step::Reply(json!({"number": "INC0010002"})),
        ],
        vec![PlannedTool::new(CREATE, json!({}))],
    )
    .await;

    let (outcome, events) = harness.run(&SessionId::new(), "Create it").await;

    assert!(outcome.is_completed());
    assert_eq!(
        shape(&events),
        [
            "stream.start",
            "stream.thinking",
            "tool.start",
            "tool.complete",
            "text.chunk",
            "stream.complete",
        ]
    );
    assert_eq!(harness.connector.state.calls().len(), 3);
}

#[tokio::test]
async fn test_tools_of_one_message_run_in_order() {
    let harness = Harness::new(
        [
            Step::Reply(json!({"number": "INC0010003"})),
            Step::Reply(json!({"state": "New"})),
        ],
        vec![
            PlannedTool::new(CREATE, json!({})),
            PlannedTool::new(GET, json!({})),
        ],
    )
    .await;

    let (_, events) = harness.run(&SessionId::new(), "Create then read").await;

    let tools: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::ToolStart { tool_name, .. } => Some(format!("start {tool_name}")),
            ServerEvent::ToolComplete { tool_name, .. } => Some(format!("done {tool_name}")),
            _ => None,
        })
        .collect();
    assert_eq!(
        tools,
        [
            format!("start {CREATE}"),
            format!("done {CREATE}"),
            format!("start {GET}"),
            format!("done {GET}"),
        ]
    );
}

// ============================================================================
// Approval
// ============================================================================

#[tokio::test]
async fn test_denied_tool_still_completes_message() {
    let harness = Harness::new([], vec![PlannedTool::new(DELETE, json!({"sys_id": "x"}))]).await;
    let (sink, mut rx) = EventSink::channel();
    let turn = Turn {
        session_id: SessionId::new(),
        message_id: MessageId::new(),
        text: "Delete that record".to_string(),
        model: "claude-sonnet-4-5".to_string(),
    };

    let coordinator = harness.coordinator.clone();
    let gate = Arc::clone(&harness.gate);
    let running = tokio::spawn(async move {
        coordinator
            .run(turn, &gate, &sink, &CancellationToken::new())
            .await
    });

    let mut events = Vec::new();
    let approval = loop {
        let event = rx.recv().await.unwrap();
        if let ServerEvent::ApprovalRequired { id, .. } = &event {
            let id = id.clone();
            events.push(event);
            break id;
        }
        events.push(event);
    };
    harness
        .gate
        .respond(&approval, false, false, Some("wrong record".into()))
        .unwrap();

    let outcome = running.await.unwrap();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    assert!(outcome.is_completed());
    assert_eq!(
        shape(&events),
        [
            "stream.start",
            "stream.thinking",
            "tool.approval_required",
            "tool.denied",
            "text.chunk",
            "stream.complete",
        ]
    );
    match &events[3] {
        ServerEvent::ToolDenied { reason, .. } => {
            assert_eq!(reason.as_deref(), Some("wrong record"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        final_message(&events).tool_calls[0].status,
        ToolCallStatus::Denied
    );
    assert!(harness.connector.state.calls().is_empty());
}

#[tokio::test]
async fn test_approved_tool_runs_after_prompt() {
    let harness = Harness::new(
        [Step::Reply(json!({"deleted": true}))],
        vec![PlannedTool::new(DELETE, json!({"sys_id": "x"}))],
    )
    .await;
    let (sink, mut rx) = EventSink::channel();
    let turn = Turn {
        session_id: SessionId::new(),
        message_id: MessageId::new(),
        text: "Delete that record".to_string(),
        model: "claude-sonnet-4-5".to_string(),
    };

    let coordinator = harness.coordinator.clone();
    let gate = Arc::clone(&harness.gate);
    let running = tokio::spawn(async move {
        coordinator
            .run(turn, &gate, &sink, &CancellationToken::new())
            .await
    });

    let approval = loop {
        if let Some(ServerEvent::ApprovalRequired { id, .. }) = rx.recv().await {
            break id;
        }
    };
    // Nothing reaches the server before the answer
    assert!(harness.connector.state.calls().is_empty());
    harness.gate.respond(&approval, true, false, None).unwrap();

    assert!(running.await.unwrap().is_completed());
    assert_eq!(harness.connector.state.calls(), ["delete_record"]);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_optional_tool_failure_is_reported_and_message_completes() {
    let harness = Harness::new(
        [Step::ToolError("Record not found".into())],
        vec![PlannedTool::new(GET, json!({"number": "INC9"}))],
    )
    .await;

    let (outcome, events) = harness.run(&SessionId::new(), "Find INC9").await;

    assert!(outcome.is_completed());
    assert!(shape(&events).contains(&"tool.error"));
    let message = final_message(&events);
    assert_eq!(message.tool_calls[0].status, ToolCallStatus::Error);
    assert_eq!(
        message.tool_calls[0].error.as_deref(),
        Some("servicenow__get_incident failed: Record not found")
    );
}

#[tokio::test]
async fn test_required_tool_failure_fails_message() {
    let harness = Harness::new(
        [Step::ToolError("Invalid caller".into())],
        vec![PlannedTool::new(CREATE, json!({})).required()],
    )
    .await;

    let (outcome, events) = harness.run(&SessionId::new(), "Create it").await;

    assert_eq!(
        outcome,
        SessionOutcome::Failed {
            error: "servicenow__create_incident failed: Invalid caller".to_string()
        }
    );
    assert_eq!(
        shape(&events),
        [
            "stream.start",
            "stream.thinking",
            "tool.start",
            "tool.error",
            "stream.error",
        ]
    );
    assert_eq!(
        stream_error(&events),
        "servicenow__create_incident failed: Invalid caller"
    );
}

#[tokio::test]
async fn test_unknown_tool_is_reported_without_execution() {
    let harness = Harness::new(
        [],
        vec![PlannedTool::new("servicenow__reboot_datacenter", json!({}))],
    )
    .await;

    let (outcome, events) = harness.run(&SessionId::new(), "Reboot").await;

    assert!(outcome.is_completed());
    assert_eq!(
        shape(&events),
        [
            "stream.start",
            "stream.thinking",
            "tool.error",
            "text.chunk",
            "stream.complete",
        ]
    );
    assert!(harness.connector.state.calls().is_empty());
}

#[tokio::test]
async fn test_selection_failure_answers_without_tools() {
    let harness = Harness::with(
        ScriptedConnector::default(),
        Arc::new(ScriptedSelector::failing()),
        Arc::new(ScriptedGenerator::new(&["I could not look that up."])),
        None,
    )
    .await;

    let (outcome, events) = harness.run(&SessionId::new(), "Anything").await;

    assert!(outcome.is_completed());
    assert_eq!(
        shape(&events),
        ["stream.start", "stream.thinking", "text.chunk", "stream.complete"]
    );
}

#[tokio::test]
async fn test_generation_failure_ends_with_stream_error() {
    let harness = Harness::with(
        ScriptedConnector::default(),
        Arc::new(ScriptedSelector::new(Vec::new())),
        Arc::new(ScriptedGenerator::failing()),
        None,
    )
    .await;

    let (outcome, events) = harness.run(&SessionId::new(), "Hello").await;

    assert!(matches!(outcome, SessionOutcome::Failed { .. }));
    assert_eq!(
        shape(&events),
        ["stream.start", "stream.thinking", "text.chunk", "stream.error"]
    );
    assert!(!events.iter().any(|e| e.name() == "stream.complete"));
}

/// A store whose every operation fails.
struct BrokenStore;

#[async_trait]
impl ChatStore for BrokenStore {
    async fn create_message(&self, _: &SessionId, _: Role, _: &str) -> PilotResult<MessageId> {
        Err(PilotError::persistence("database is down"))
    }

    async fn update_message_content(&self, _: &MessageId, _: &str) -> PilotResult<()> {
        Err(PilotError::persistence("database is down"))
    }

    async fn create_tool_execution(
        &self,
        _: &MessageId,
        _: &str,
        _: &Value,
    ) -> PilotResult<ExecutionId> {
        Err(PilotError::persistence("database is down"))
    }

    async fn update_tool_execution(
        &self,
        _: &ExecutionId,
        _: ToolExecutionUpdate,
    ) -> PilotResult<()> {
        Err(PilotError::persistence("database is down"))
    }

    async fn list_recent_messages(
        &self,
        _: &SessionId,
        _: usize,
    ) -> PilotResult<Vec<StoredMessage>> {
        Err(PilotError::persistence("database is down"))
    }
}

#[tokio::test]
async fn test_store_failures_degrade_but_do_not_fail() {
    let harness = Harness::with(
        ScriptedConnector::new([Step::Reply(json!({"number": "INC0010004"}))]),
        Arc::new(ScriptedSelector::new(vec![PlannedTool::new(CREATE, json!({}))])),
        Arc::new(ScriptedGenerator::new(&["Done."])),
        Some(Arc::new(BrokenStore) as Arc<dyn ChatStore>),
    )
    .await;

    let (outcome, events) = harness.run(&SessionId::new(), "Create it").await;

    assert_eq!(outcome, SessionOutcome::Completed { degraded: true });
    assert_eq!(final_message(&events).content, "Done.");
    assert!(shape(&events).contains(&"tool.complete"));
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_during_tool_releases_connection() {
    let harness = Harness::new([Step::Hang], vec![PlannedTool::new(CREATE, json!({}))]).await;
    let (sink, mut rx) = EventSink::channel();
    let cancel = CancellationToken::new();
    let turn = Turn {
        session_id: SessionId::new(),
        message_id: MessageId::new(),
        text: "Create it".to_string(),
        model: "claude-sonnet-4-5".to_string(),
    };

    let coordinator = harness.coordinator.clone();
    let gate = Arc::clone(&harness.gate);
    let token = cancel.clone();
    let running =
        tokio::spawn(async move { coordinator.run(turn, &gate, &sink, &token).await });

    let mut events = Vec::new();
    loop {
        let event = rx.recv().await.unwrap();
        let started = event.name() == "tool.start";
        events.push(event);
        if started {
            break;
        }
    }
    cancel.cancel();

    assert_eq!(running.await.unwrap(), SessionOutcome::Cancelled);
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    assert_eq!(
        shape(&events),
        ["stream.start", "stream.thinking", "tool.start", "stream.error"]
    );
    assert_eq!(stream_error(&events), "The request was cancelled.");
    assert_eq!(harness.pool.stats().in_use, 0);
    assert_eq!(harness.connector.state.in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_while_awaiting_approval_withdraws_prompt() {
    let harness = Harness::new([], vec![PlannedTool::new(DELETE, json!({}))]).await;
    let (sink, mut rx) = EventSink::channel();
    let cancel = CancellationToken::new();
    let turn = Turn {
        session_id: SessionId::new(),
        message_id: MessageId::new(),
        text: "Delete it".to_string(),
        model: "claude-sonnet-4-5".to_string(),
    };

    let coordinator = harness.coordinator.clone();
    let gate = Arc::clone(&harness.gate);
    let token = cancel.clone();
    let running =
        tokio::spawn(async move { coordinator.run(turn, &gate, &sink, &token).await });

    loop {
        if let Some(ServerEvent::ApprovalRequired { .. }) = rx.recv().await {
            break;
        }
    }
    cancel.cancel();

    assert_eq!(running.await.unwrap(), SessionOutcome::Cancelled);
    assert!(harness.gate.outstanding().is_none());
    assert!(harness.connector.state.calls().is_empty());
}
