//! 引擎端到端场景（Mock 提供方，无需 API）

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rlm_engine::engine::{Agent, AgentConfig, AgentEvent, ChildEntry};
use rlm_engine::llm::{MockLlmClient, ModelClient};
use rlm_engine::memory::Memory;
use serde_json::json;

fn agent(mock: &Arc<MockLlmClient>, chunk: usize, depth: u32) -> Agent {
    Agent::new(
        ModelClient::single(mock.clone()),
        AgentConfig {
            model: "gpt-4o-mini".into(),
            max_chunk_size: chunk,
            max_recursion_depth: depth,
            ..Default::default()
        },
    )
}

const CHUNKED_SUMMARY: &str = r#"
let pieces = chunks(context, 45000);
let notes = [];
for piece in pieces {
    notes.push(delegate("Summarize this part:\n" + piece));
}
let joined = "";
for note in notes {
    joined += note + "\n";
}
complete(delegate("Combine these notes into one summary:\n" + joined));
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn summarize_large_document_in_chunks() {
    let mock = Arc::new(MockLlmClient::new(format!("```rhai\n{}\n```", CHUNKED_SUMMARY)));
    let document = "lorem ipsum ".repeat(10_000);
    assert_eq!(document.chars().count(), 120_000);

    let trace = agent(&mock, 50_000, 3)
        .run("summarize", &document, Memory::new(), None)
        .await;

    let result = trace.execution_result.clone().unwrap();
    assert!(result.success, "{:?}", result.error);
    assert!(!result.final_result.unwrap().is_empty());
    assert_eq!(result.child_calls.len(), 4);
    assert_eq!(trace.child_traces.len(), result.child_calls.len());
    assert!(trace.child_traces.iter().all(|c| matches!(c, ChildEntry::Direct(_))));

    let tasks = mock.child_tasks();
    assert_eq!(tasks.len(), 4);
    assert!(tasks.iter().all(|t| t.chars().count() <= 50_000));
    assert_eq!(mock.generation_calls(), 1);
    assert_eq!(trace.context_size, 120_000);
    assert!(!trace.generated_code.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recursion_is_bounded_by_depth() {
    let mock = Arc::new(MockLlmClient::new("complete(delegate(context + context));").with_usage(100, 20));
    let trace = agent(&mock, 4, 3).run("q", "abc", Memory::new(), None).await;

    assert!(trace.succeeded(), "{:?}", trace.execution_result);
    assert_eq!(trace.execution_result.as_ref().unwrap().final_result.as_deref(), Some("Answer for 24 chars"));
    assert_eq!(mock.generation_calls(), 3);
    assert_eq!(mock.child_calls(), 1);

    let ChildEntry::Recursive { depth: 1, trace: level1, .. } = &trace.child_traces[0] else {
        panic!("expected recursive child at depth 1");
    };
    let ChildEntry::Recursive { depth: 2, trace: level2, .. } = &level1.child_traces[0] else {
        panic!("expected recursive child at depth 2");
    };
    assert!(matches!(level2.child_traces[0], ChildEntry::Direct(ref s) if s.depth == 3));

    // 4 次调用（3 次生成 + 1 次直接回答），总计逐层折叠
    assert_eq!(trace.total_input_tokens, 400);
    assert_eq!(trace.total_output_tokens, 80);
    assert_eq!(level1.total_input_tokens, 300);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cost_is_additive_across_direct_and_recursive_children() {
    let program = r#"
        let a = delegate(context);
        let b = delegate("short question");
        complete(a + b);
    "#;
    let mock = Arc::new(MockLlmClient::new(program).with_usage(1_000, 500));
    let trace = agent(&mock, 20, 2)
        .run("q", &"y".repeat(40), Memory::new(), None)
        .await;
    assert!(trace.succeeded());

    let children: f64 = trace.child_traces.iter().map(|c| c.usage().cost_usd).sum();
    assert!((trace.total_cost_usd - (trace.generation.cost_usd + children)).abs() < 1e-12);

    let result = trace.execution_result.as_ref().unwrap();
    let calls: f64 = result.child_calls.iter().map(|c| c.cost_usd).sum();
    assert!((calls - children).abs() < 1e-12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_child_agent_answers_with_prefixed_error() {
    let program = r#"
        if context.len() == 30 {
            complete(delegate(context.sub_string(0, 15)));
        } else {
            throw "child exploded";
        }
    "#;
    let mock = Arc::new(MockLlmClient::new(program));
    let trace = agent(&mock, 10, 5)
        .run("q", &"z".repeat(30), Memory::new(), None)
        .await;

    assert!(trace.succeeded());
    let answer = trace.answer();
    assert!(answer.starts_with("Error: "), "{}", answer);
    assert!(answer.contains("child exploded"));
    let ChildEntry::Recursive { trace: child, .. } = &trace.child_traces[0] else {
        panic!("expected recursive child");
    };
    assert!(!child.succeeded());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disallowed_program_never_delegates() {
    let mock = Arc::new(MockLlmClient::new("import os\ncomplete(delegate(context));"));
    let trace = agent(&mock, 50_000, 3).run("q", "doc", Memory::new(), None).await;

    let result = trace.execution_result.unwrap();
    assert!(!result.success);
    assert!(result.output_log.is_empty());
    assert!(result.error.unwrap().contains("import os"));
    assert_eq!(mock.child_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_delegate_raises_timeout_into_program() {
    let mock = Arc::new(
        MockLlmClient::new(r#"let r = delegate("slow"); complete(r);"#)
            .with_child_delay(Duration::from_secs(5)),
    );
    let agent = Agent::new(
        ModelClient::single(mock.clone()),
        AgentConfig {
            model: "gpt-4o-mini".into(),
            delegate_timeout: Duration::from_millis(200),
            ..Default::default()
        },
    );

    let started = Instant::now();
    let trace = agent.run("q", "doc", Memory::new(), None).await;
    assert!(started.elapsed() < Duration::from_secs(4));

    let result = trace.execution_result.unwrap();
    assert!(!result.success);
    assert!(result.error.unwrap().contains("delegate timed out"));
    assert!(result.output_log.iter().any(|l| l.starts_with("[delegate] TIMEOUT")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_timeout_wins_over_pending_delegate() {
    let mock = Arc::new(
        MockLlmClient::new(r#"print("start"); complete(delegate("slow"));"#)
            .with_child_delay(Duration::from_secs(30)),
    );
    let agent = Agent::new(
        ModelClient::single(mock.clone()),
        AgentConfig {
            model: "gpt-4o-mini".into(),
            execution_timeout: Duration::from_secs(1),
            delegate_timeout: Duration::from_secs(20),
            ..Default::default()
        },
    );

    let started = Instant::now();
    let trace = agent.run("q", "doc", Memory::new(), None).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let result = trace.execution_result.unwrap();
    assert_eq!(result.error.as_deref(), Some("Execution timed out after 1 seconds"));
    assert_eq!(result.output_log, vec!["[print] start".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_changes_report_only_written_keys() {
    let program = r#"
        let prior = memory_get("topic");
        memory_set("summary_of", prior);
        complete(prior);
    "#;
    let mock = Arc::new(MockLlmClient::new(program));
    let mut memory = Memory::new();
    memory.insert("topic".into(), json!("rust"));
    memory.insert("other".into(), json!(42));

    let trace = agent(&mock, 50_000, 3).run("q", "doc", memory, None).await;
    let result = trace.execution_result.unwrap();
    assert_eq!(result.final_result.as_deref(), Some("rust"));
    assert_eq!(result.memory_changes.len(), 1);
    assert_eq!(result.memory_changes["summary_of"], json!("rust"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn program_without_complete_fails() {
    let mock = Arc::new(MockLlmClient::new(r#"print("thinking"); let x = delegate("a");"#));
    let trace = agent(&mock, 50_000, 3).run("q", "doc", Memory::new(), None).await;

    let result = trace.execution_result.unwrap();
    assert!(!result.success);
    assert!(result.error.unwrap().contains("completed without finishing"));
    assert_eq!(result.child_calls.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn events_arrive_in_order() {
    let mock = Arc::new(MockLlmClient::new(r#"delegate("a"); delegate("b"); complete("ok");"#));
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let agent = agent(&mock, 50_000, 3).with_notifier(Arc::new(move |event: AgentEvent| {
        let kind = serde_json::to_value(&event).unwrap()["type"]
            .as_str()
            .unwrap()
            .to_string();
        sink.lock().unwrap().push(kind);
    }));

    agent.run("q", "doc", Memory::new(), None).await;

    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            "execution_start",
            "generating_code",
            "code_generated",
            "executing_code",
            "child_complete",
            "child_complete",
            "execution_complete",
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandoned_child_stops_calling_the_model() {
    let program = r#"
        if context.len() == 30 {
            for i in 0..3 { delegate("slow"); }
            complete(delegate(context + "!"));
        } else {
            loop { delegate("tick"); }
        }
    "#;
    let mock = Arc::new(MockLlmClient::new(program).with_child_delay(Duration::from_millis(200)));
    let agent = Agent::new(
        ModelClient::single(mock.clone()),
        AgentConfig {
            model: "gpt-4o-mini".into(),
            max_chunk_size: 10,
            max_recursion_depth: 5,
            execution_timeout: Duration::from_millis(1500),
            ..Default::default()
        },
    );

    let trace = agent.run("q", &"z".repeat(30), Memory::new(), None).await;
    let result = trace.execution_result.unwrap();
    assert_eq!(result.error.as_deref(), Some("Execution timed out after 1.5 seconds"));
    assert_eq!(mock.generation_calls(), 2);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let settled = mock.child_calls();
    assert!(settled > 3);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(mock.child_calls(), settled);
}
