use agentloop::{
    ContentPart, ConversationThread, Event, EventChannel, EventPayload, LoopState, Message,
    RunOptions, TextPart, ToolCallPart, ToolResultPart,
};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use serde_json::json;

// Helper to build conversations of varying shape
fn create_messages(count: usize, text_size: usize) -> Vec<Message> {
    let text = "a".repeat(text_size);
    (0..count)
        .map(|i| {
            if i == 0 {
                Message::system(&text)
            } else if i % 2 == 0 {
                Message::user(&text)
            } else {
                Message::assistant(vec![ContentPart::Text(TextPart::new(text.clone()))])
            }
        })
        .collect()
}

// Helper to build conversations with tool traffic
fn create_messages_with_tools(count: usize) -> Vec<Message> {
    let mut messages = vec![Message::system("You are a helpful assistant")];

    for i in 0..count {
        if i % 3 == 0 {
            messages.push(Message::user("Calculate 2 + 2"));
        } else if i % 3 == 1 {
            messages.push(Message::assistant(vec![ContentPart::ToolCall(
                ToolCallPart::new(
                    format!("call_{i}"),
                    "calculator",
                    json!({"operation": "add", "a": 2, "b": 2}),
                ),
            )]));
        } else {
            messages.push(Message::tool_result(ToolResultPart::ok(
                format!("call_{}", i - 1),
                json!({"result": 4}),
            )));
        }
    }

    messages
}

// Benchmark: event channel emit throughput
fn bench_channel_emit(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_emit");

    for count in [100, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| {
                let (channel, reader) = EventChannel::new();
                for i in 0..count {
                    let _ = channel.emit(black_box(Event::new(EventPayload::TextDelta {
                        run_id: "run".to_string(),
                        message_id: "msg".to_string(),
                        text: format!("delta {i}"),
                    })));
                }
                drop(reader);
            });
        });
    }

    group.finish();
}

// Benchmark: snapshot serialization by conversation size
fn bench_snapshot_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_serialize");

    for count in [10, 50, 200].iter() {
        let thread = ConversationThread::new();
        thread.add_messages(create_messages(*count, 200));
        let snapshot = thread.to_snapshot();
        group.bench_with_input(BenchmarkId::from_parameter(count), &snapshot, |b, snap| {
            b.iter(|| black_box(snap.serialize().unwrap()));
        });
    }

    group.finish();
}

// Benchmark: checkpoint serialization (snapshot + loop state)
fn bench_checkpoint_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint_serialize");

    for count in [10, 50].iter() {
        let thread = ConversationThread::new();
        thread.add_messages(create_messages_with_tools(*count));
        let state = LoopState::new(
            "run",
            thread.conversation_id(),
            "Agent",
            thread.messages(),
            RunOptions::builder().model("bench-model").build().unwrap(),
        );
        thread.set_execution_state(Some(state.snapshot()));
        let checkpoint = thread.to_checkpoint().unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(count), &checkpoint, |b, ckpt| {
            b.iter(|| black_box(ckpt.serialize().unwrap()));
        });
    }

    group.finish();
}

// Benchmark: thread snapshot reads (copy cost)
fn bench_thread_snapshot_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("thread_snapshot_read");

    for count in [10, 100, 500].iter() {
        let thread = ConversationThread::new();
        thread.add_messages(create_messages(*count, 100));
        group.bench_with_input(BenchmarkId::from_parameter(count), &thread, |b, t| {
            b.iter(|| black_box(t.messages()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_channel_emit,
    bench_snapshot_serialize,
    bench_checkpoint_serialize,
    bench_thread_snapshot_read,
);
criterion_main!(benches);
