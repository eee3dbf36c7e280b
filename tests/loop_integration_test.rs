//! End-to-end agent loop tests against the scripted provider.

use agentloop::{
    Agent, AgentConfig, ContentPart, ConversationThread, Event, EventPayload, FinishReason,
    Message, MessageRole, ScriptedProvider, Tool, tool,
};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn agent_with(provider: Arc<ScriptedProvider>, tools: Vec<Arc<dyn Tool>>) -> Agent {
    Agent::new(
        AgentConfig::builder()
            .name("Assistant")
            .provider(provider)
            .model("test-model")
            .tools(tools)
            .build()
            .unwrap(),
    )
}

async fn collect_events(
    agent: &Agent,
    messages: Vec<Message>,
    thread: Arc<ConversationThread>,
) -> Vec<Event> {
    let mut stream = agent.run(messages, thread).unwrap();
    let mut events = Vec::new();
    while let Some(item) = stream.next().await {
        events.push(item.expect("run should not fault"));
    }
    events
}

fn kinds(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(|e| e.payload.kind()).collect()
}

fn add_tool() -> Arc<dyn Tool> {
    Arc::new(
        tool("add", "Add two numbers")
            .param("a", "number")
            .param("b", "number")
            .build(|args| async move {
                let a = args["a"].as_i64().unwrap_or(0);
                let b = args["b"].as_i64().unwrap_or(0);
                Ok(json!(a + b))
            }),
    )
}

#[tokio::test]
async fn single_text_turn_produces_expected_event_sequence() {
    let provider = Arc::new(ScriptedProvider::new().text_turn("Hello"));
    let agent = agent_with(provider, vec![]);
    let thread = Arc::new(ConversationThread::new());

    let events = collect_events(&agent, vec![Message::user("hi")], thread.clone()).await;

    assert_eq!(
        kinds(&events),
        vec![
            "turn_started",
            "iteration_started",
            "text_delta",
            "iteration_completed",
            "turn_completed",
        ]
    );

    match &events[2].payload {
        EventPayload::TextDelta { text, .. } => assert_eq!(text, "Hello"),
        other => panic!("expected text delta, got {}", other.kind()),
    }
    match &events[3].payload {
        EventPayload::IterationCompleted {
            iteration,
            finish_reason,
        } => {
            assert_eq!(*iteration, 0);
            assert_eq!(*finish_reason, FinishReason::Stop);
        }
        other => panic!("expected iteration completed, got {}", other.kind()),
    }
    match &events[4].payload {
        EventPayload::TurnCompleted {
            final_message,
            error,
            ..
        } => {
            assert_eq!(final_message.as_ref().unwrap().text(), "Hello");
            assert!(error.is_none());
        }
        other => panic!("expected turn completed, got {}", other.kind()),
    }

    // User message plus the assistant response.
    assert_eq!(thread.message_count(), 2);
}

#[tokio::test]
async fn single_tool_call_runs_two_iterations() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .tool_call_turn("c1", "add", r#"{"a":2,"b":3}"#)
            .text_turn("5"),
    );
    let agent = agent_with(provider.clone(), vec![add_tool()]);
    let thread = Arc::new(ConversationThread::new());

    let events = collect_events(&agent, vec![Message::user("what is 2+3?")], thread.clone()).await;

    // Two iterations ran.
    let iterations: Vec<u32> = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::IterationStarted { iteration } => Some(*iteration),
            _ => None,
        })
        .collect();
    assert_eq!(iterations, vec![0, 1]);
    assert_eq!(provider.call_count(), 2);

    // The tool call streamed and resolved.
    assert!(events.iter().any(|e| matches!(
        &e.payload,
        EventPayload::ToolCallStart { call_id, name } if call_id == "c1" && name == "add"
    )));
    assert!(events.iter().any(|e| matches!(
        &e.payload,
        EventPayload::ToolCallResult { call_id, result: Some(value), error: None }
            if call_id == "c1" && *value == json!(5)
    )));

    // A tool-result message with the matching call id was appended.
    let messages = thread.messages();
    let tool_result = messages
        .iter()
        .find(|m| m.role == MessageRole::Tool)
        .expect("tool result message");
    match &tool_result.content[0] {
        ContentPart::ToolResult(result) => {
            assert_eq!(result.call_id, "c1");
            assert_eq!(result.value, Some(json!(5)));
        }
        other => panic!("expected tool result part, got {other:?}"),
    }

    match &events.last().unwrap().payload {
        EventPayload::TurnCompleted {
            final_message,
            function_calls,
            ..
        } => {
            assert_eq!(final_message.as_ref().unwrap().text(), "5");
            assert_eq!(function_calls.len(), 1);
            assert_eq!(function_calls[0].name, "add");
        }
        other => panic!("expected turn completed, got {}", other.kind()),
    }
}

#[tokio::test]
async fn unknown_tool_is_recorded_as_error_result() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .tool_call_turn("c1", "missing_tool", r#"{}"#)
            .text_turn("sorry"),
    );
    let agent = agent_with(provider, vec![]);
    let thread = Arc::new(ConversationThread::new());

    let events = collect_events(&agent, vec![Message::user("go")], thread.clone()).await;

    assert!(events.iter().any(|e| matches!(
        &e.payload,
        EventPayload::ToolCallResult { error: Some(err), .. } if err.contains("missing_tool")
    )));

    // The turn still completed normally; the model saw the failure.
    match &events.last().unwrap().payload {
        EventPayload::TurnCompleted { final_message, .. } => {
            assert_eq!(final_message.as_ref().unwrap().text(), "sorry");
        }
        other => panic!("expected turn completed, got {}", other.kind()),
    }
}

#[tokio::test]
async fn iteration_cap_terminates_turn() {
    // The model keeps requesting tools forever; the cap stops it.
    let provider = Arc::new(
        ScriptedProvider::new()
            .tool_call_turn("c1", "add", r#"{"a":1,"b":1}"#)
            .tool_call_turn("c2", "add", r#"{"a":1,"b":1}"#)
            .tool_call_turn("c3", "add", r#"{"a":1,"b":1}"#),
    );
    let agent = Agent::new(
        AgentConfig::builder()
            .name("Assistant")
            .provider(provider.clone())
            .model("test-model")
            .tool(add_tool())
            .max_iterations(2)
            .build()
            .unwrap(),
    );
    let thread = Arc::new(ConversationThread::new());

    let events = collect_events(&agent, vec![Message::user("loop")], thread).await;

    let started = events
        .iter()
        .filter(|e| matches!(e.payload, EventPayload::IterationStarted { .. }))
        .count();
    assert_eq!(started, 2);
    assert_eq!(provider.call_count(), 2);
    assert!(matches!(
        &events.last().unwrap().payload,
        EventPayload::TurnCompleted { error: None, .. }
    ));
}

#[tokio::test]
async fn error_budget_terminates_with_marker() {
    let failing: Arc<dyn Tool> = Arc::new(
        tool("flaky", "Always fails").build(|_args| async move {
            Err(agentloop::Error::tool("disk on fire"))
        }),
    );
    let provider = Arc::new(
        ScriptedProvider::new()
            .tool_call_turn("c1", "flaky", r#"{}"#)
            .tool_call_turn("c2", "flaky", r#"{}"#)
            .tool_call_turn("c3", "flaky", r#"{}"#),
    );
    let agent = Agent::new(
        AgentConfig::builder()
            .name("Assistant")
            .provider(provider)
            .model("test-model")
            .tool(failing)
            .max_consecutive_errors(1)
            .build()
            .unwrap(),
    );
    let thread = Arc::new(ConversationThread::new());

    let events = collect_events(&agent, vec![Message::user("go")], thread.clone()).await;

    // Exactly limit + 1 error iterations ran.
    let started = events
        .iter()
        .filter(|e| matches!(e.payload, EventPayload::IterationStarted { .. }))
        .count();
    assert_eq!(started, 2);

    match &events.last().unwrap().payload {
        EventPayload::TurnCompleted {
            final_message,
            error,
            ..
        } => {
            assert!(error.as_ref().unwrap().contains("Error budget exceeded"));
            // The final assistant message explains the stop.
            assert!(final_message.as_ref().unwrap().text().contains("Stopping"));
        }
        other => panic!("expected turn completed, got {}", other.kind()),
    }
}

#[tokio::test]
async fn successful_tool_resets_error_budget() {
    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter_clone = counter.clone();
    let sometimes: Arc<dyn Tool> = Arc::new(tool("sometimes", "Fails every other call").build(
        move |_args| {
            let n = counter_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n % 2 == 0 {
                    Err(agentloop::Error::tool("odd one out"))
                } else {
                    Ok(json!("ok"))
                }
            }
        },
    ));
    // fail, succeed, fail, then answer: never two consecutive failures.
    let provider = Arc::new(
        ScriptedProvider::new()
            .tool_call_turn("c1", "sometimes", r#"{}"#)
            .tool_call_turn("c2", "sometimes", r#"{}"#)
            .tool_call_turn("c3", "sometimes", r#"{}"#)
            .text_turn("done"),
    );
    let agent = Agent::new(
        AgentConfig::builder()
            .name("Assistant")
            .provider(provider)
            .model("test-model")
            .tool(sometimes)
            .max_consecutive_errors(1)
            .build()
            .unwrap(),
    );
    let thread = Arc::new(ConversationThread::new());

    let events = collect_events(&agent, vec![Message::user("go")], thread).await;

    match &events.last().unwrap().payload {
        EventPayload::TurnCompleted {
            final_message,
            error,
            ..
        } => {
            assert!(error.is_none());
            assert_eq!(final_message.as_ref().unwrap().text(), "done");
        }
        other => panic!("expected turn completed, got {}", other.kind()),
    }
}

#[tokio::test]
async fn provider_fault_reaches_caller_after_events() {
    let provider = Arc::new(ScriptedProvider::new().error_turn("401 Unauthorized"));
    let agent = agent_with(provider, vec![]);
    let thread = Arc::new(ConversationThread::new());

    let mut stream = agent.run(vec![Message::user("hi")], thread).unwrap();
    let mut saw_turn_started = false;
    let mut terminal_error = None;

    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                if matches!(event.payload, EventPayload::TurnStarted { .. }) {
                    saw_turn_started = true;
                }
            }
            Err(error) => terminal_error = Some(error),
        }
    }

    assert!(saw_turn_started);
    assert!(matches!(
        terminal_error,
        Some(agentloop::Error::Provider(msg)) if msg.contains("401")
    ));
}

#[tokio::test]
async fn cancellation_faults_the_stream() {
    let provider = Arc::new(ScriptedProvider::new().text_turn("never seen"));
    let agent = agent_with(provider, vec![]);
    let thread = Arc::new(ConversationThread::new());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut stream = agent
        .run_with_cancel(vec![Message::user("hi")], thread, cancel)
        .unwrap();

    let mut terminal_error = None;
    while let Some(item) = stream.next().await {
        if let Err(error) = item {
            terminal_error = Some(error);
        }
    }
    assert!(matches!(terminal_error, Some(agentloop::Error::Cancelled)));
}

#[tokio::test]
async fn deterministic_provider_gives_identical_event_sequences() {
    let script = || {
        Arc::new(
            ScriptedProvider::new()
                .tool_call_turn("c1", "add", r#"{"a":2,"b":3}"#)
                .text_turn("5"),
        )
    };

    let mut sequences = Vec::new();
    for _ in 0..2 {
        let agent = agent_with(script(), vec![add_tool()]);
        let thread = Arc::new(ConversationThread::new());
        let events = collect_events(&agent, vec![Message::user("what is 2+3?")], thread).await;
        // Compare kinds and sequence numbers; payload ids differ per run.
        let fingerprint: Vec<(u64, &'static str)> =
            events.iter().map(|e| (e.seq, e.payload.kind())).collect();
        sequences.push(fingerprint);
    }
    assert_eq!(sequences[0], sequences[1]);
}

#[tokio::test]
async fn system_prompt_is_seeded_once() {
    let provider = Arc::new(ScriptedProvider::new().text_turn("one").text_turn("two"));
    let agent = Agent::new(
        AgentConfig::builder()
            .name("Assistant")
            .provider(provider)
            .model("test-model")
            .system_prompt("Be brief")
            .build()
            .unwrap(),
    );
    let thread = Arc::new(ConversationThread::new());

    let _ = collect_events(&agent, vec![Message::user("first")], thread.clone()).await;
    let _ = collect_events(&agent, vec![Message::user("second")], thread.clone()).await;

    let system_count = thread
        .messages()
        .iter()
        .filter(|m| m.role == MessageRole::System)
        .count();
    assert_eq!(system_count, 1);
    // system + (user + assistant) * 2
    assert_eq!(thread.message_count(), 5);
}
