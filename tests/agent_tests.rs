use async_trait::async_trait;
use chitragupta::chitragupta::agent::{AgentConfig, AgentError};
use chitragupta::chitragupta::clock::{Clock, ManualClock};
use chitragupta::chitragupta::config::ChitraguptaConfig;
use chitragupta::chitragupta::cost::{CostTracker, ModelCatalog};
use chitragupta::chitragupta::event::{AgentEvent, EventBus, EventSink};
use chitragupta::chitragupta::kaala_brahma::KaalaBrahma;
use chitragupta::chitragupta::learning::LearningLoop;
use chitragupta::chitragupta::provider::{
    CancellationToken, ChatRequest, EventStream, Provider, ProviderError, ProviderRegistry, Role,
    StopReason, StreamEvent, StreamUsage,
};
use chitragupta::chitragupta::samiti::Samiti;
use chitragupta::chitragupta::tool::{
    AllowAllPolicy, ToolContext, ToolExecutor, ToolHandler, ToolOutcome, ToolRegistry,
};
use chitragupta::{Agent, AgentState, ContentPart, TreeContext};
use futures_util::stream;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::RwLock as TokioRwLock;

/// Provider that replays scripted event sequences, one per stream call.
struct MockProvider {
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
}

impl MockProvider {
    fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
        }
    }

    fn text_reply(text: &str) -> Vec<StreamEvent> {
        vec![
            StreamEvent::Start {
                message_id: "msg".to_string(),
            },
            StreamEvent::Text {
                chunk: text.to_string(),
            },
            StreamEvent::Done {
                stop_reason: StopReason::EndTurn,
                usage: StreamUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                    ..StreamUsage::default()
                },
            },
        ]
    }

    fn tool_reply(tool: &str, args: serde_json::Value) -> Vec<StreamEvent> {
        vec![
            StreamEvent::Start {
                message_id: "msg".to_string(),
            },
            StreamEvent::Text {
                chunk: "Let me check.".to_string(),
            },
            StreamEvent::ToolCall {
                id: "call-1".to_string(),
                name: tool.to_string(),
                arguments: args,
            },
            StreamEvent::Done {
                stop_reason: StopReason::ToolUse,
                usage: StreamUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                    ..StreamUsage::default()
                },
            },
        ]
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(
        &self,
        _request: &ChatRequest,
        _cancel: CancellationToken,
    ) -> Result<EventStream, ProviderError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| MockProvider::text_reply("default"));
        Ok(Box::pin(stream::iter(script)))
    }
}

struct EchoTool;

#[async_trait]
impl ToolHandler for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "echoes its input"
    }
    async fn execute(&self, args: serde_json::Value, _ctx: &ToolContext) -> ToolOutcome {
        ToolOutcome::success(format!("echo: {}", args["text"].as_str().unwrap_or("")))
    }
}

struct RecordingSink {
    kinds: Mutex<Vec<String>>,
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn on_event(&self, event: &AgentEvent) {
        let kind = match event {
            AgentEvent::TurnStart { .. } => "turn:start",
            AgentEvent::TurnDone { .. } => "turn:done",
            AgentEvent::StreamStart { .. } => "stream:start",
            AgentEvent::StreamText { .. } => "stream:text",
            AgentEvent::StreamThinking { .. } => "stream:thinking",
            AgentEvent::StreamToolCall { .. } => "stream:tool_call",
            AgentEvent::StreamDone { .. } => "stream:done",
            AgentEvent::ToolDone { .. } => "tool:done",
            AgentEvent::SubagentSpawn { .. } => "subagent:spawn",
        };
        self.kinds.lock().unwrap().push(kind.to_string());
    }
}

fn build_context(provider: Arc<dyn Provider>, events: EventBus) -> TreeContext {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
    let mut providers = ProviderRegistry::new();
    providers.register(provider);
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(EchoTool));
    let learning = Arc::new(Mutex::new(LearningLoop::default()));
    let executor = Arc::new(ToolExecutor::new(
        Arc::new(TokioRwLock::new(registry)),
        Arc::new(AllowAllPolicy),
        Arc::clone(&learning),
        Arc::clone(&clock),
        events.clone(),
    ));
    TreeContext {
        providers: Arc::new(RwLock::new(providers)),
        executor,
        samiti: Arc::new(Samiti::new(Arc::clone(&clock))),
        learning,
        kaala: Arc::new(KaalaBrahma::new(Arc::clone(&clock), 30_000, 120_000)),
        events,
        clock,
        cost: Arc::new(CostTracker::new()),
        catalog: Arc::new(ModelCatalog::new()),
        config: ChitraguptaConfig::default(),
    }
}

fn root_with_provider(provider: Arc<dyn Provider>, events: EventBus) -> Arc<Agent> {
    Agent::root(
        AgentConfig::new("coordinator")
            .with_id("root")
            .with_provider("mock")
            .with_model("haiku-standard"),
        "session-1",
        build_context(provider, events),
    )
}

#[tokio::test]
async fn test_prompt_plain_response() {
    let provider = Arc::new(MockProvider::new(vec![MockProvider::text_reply(
        "Hello back",
    )]));
    let root = root_with_provider(provider, EventBus::new());
    let turn = root.prompt("Hello").await.unwrap();
    assert_eq!(turn.role, Role::Assistant);
    assert_eq!(turn.text(), "Hello back");
    assert_eq!(root.state(), AgentState::Completed);
    // user + assistant
    assert_eq!(root.history().len(), 2);
}

#[tokio::test]
async fn test_prompt_runs_tool_loop() {
    let provider = Arc::new(MockProvider::new(vec![
        MockProvider::tool_reply("echo", serde_json::json!({"text": "ping"})),
        MockProvider::text_reply("The tool said: echo: ping"),
    ]));
    let root = root_with_provider(provider, EventBus::new());
    let turn = root.prompt("use the echo tool").await.unwrap();
    assert_eq!(turn.text(), "The tool said: echo: ping");

    let history = root.history();
    // user, assistant(tool_use), tool, assistant(final)
    assert_eq!(history.len(), 4);
    assert_eq!(history[2].role, Role::Tool);
    match &history[2].parts[0] {
        ContentPart::ToolResult {
            content, is_error, ..
        } => {
            assert!(!is_error);
            assert_eq!(content, "echo: ping");
        }
        other => panic!("expected tool result, got {:?}", other),
    }
}

#[tokio::test]
async fn test_events_fire_in_order() {
    let sink = Arc::new(RecordingSink {
        kinds: Mutex::new(Vec::new()),
    });
    let provider = Arc::new(MockProvider::new(vec![
        MockProvider::tool_reply("echo", serde_json::json!({"text": "x"})),
        MockProvider::text_reply("done"),
    ]));
    let root = root_with_provider(provider, EventBus::with_sink(sink.clone()));
    root.prompt("go").await.unwrap();

    let kinds = sink.kinds.lock().unwrap().clone();
    assert_eq!(kinds.first().map(String::as_str), Some("turn:start"));
    assert_eq!(kinds.last().map(String::as_str), Some("turn:done"));
    assert!(kinds.contains(&"stream:tool_call".to_string()));
    assert!(kinds.contains(&"tool:done".to_string()));
    // The tool finishes before the follow-up stream starts.
    let tool_done = kinds.iter().position(|k| k == "tool:done").unwrap();
    let second_start = kinds
        .iter()
        .enumerate()
        .filter(|(_, k)| *k == "stream:start")
        .nth(1)
        .map(|(i, _)| i)
        .unwrap();
    assert!(tool_done < second_start);
}

#[tokio::test]
async fn test_max_turns_is_fatal() {
    // Every round asks for another tool call; the loop must give up.
    let scripts: Vec<Vec<StreamEvent>> = (0..30)
        .map(|_| MockProvider::tool_reply("echo", serde_json::json!({"text": "again"})))
        .collect();
    let provider = Arc::new(MockProvider::new(scripts));
    let root = root_with_provider(provider, EventBus::new());
    let err = root.prompt("loop forever").await.unwrap_err();
    assert!(matches!(err, AgentError::MaxTurnsExceeded(25)));
    assert_eq!(root.state(), AgentState::Error);
}

#[tokio::test]
async fn test_abort_cascades_to_all_descendants() {
    let provider = Arc::new(MockProvider::new(vec![]));
    let root = root_with_provider(provider, EventBus::new());
    let a = root.spawn(AgentConfig::new("a")).unwrap();
    let b = a.spawn(AgentConfig::new("b")).unwrap();
    assert_eq!(root.depth(), 0);
    assert_eq!(a.depth(), 1);
    assert_eq!(b.depth(), 2);

    root.abort();
    assert_eq!(root.state(), AgentState::Aborted);
    assert_eq!(a.state(), AgentState::Aborted);
    assert_eq!(b.state(), AgentState::Aborted);
    assert!(b.cancellation_token().is_cancelled());
}

#[tokio::test]
async fn test_spawn_width_cap() {
    let provider = Arc::new(MockProvider::new(vec![]));
    let root = root_with_provider(provider, EventBus::new());
    for i in 0..6 {
        root.spawn(AgentConfig::new(format!("worker-{}", i)))
            .unwrap();
    }
    let err = root.spawn(AgentConfig::new("one too many")).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Cannot spawn sub-agent: parent already has 6 children"
    );
    // The existing six are unaffected.
    assert_eq!(root.get_children().len(), 6);
    assert!(root
        .get_children()
        .iter()
        .all(|c| c.state() == AgentState::Idle));
}

#[tokio::test]
async fn test_spawn_depth_cap() {
    let provider = Arc::new(MockProvider::new(vec![]));
    let root = root_with_provider(provider, EventBus::new());
    let mut current = root;
    // Depths 1 through 5 succeed.
    for i in 0..5 {
        current = current
            .spawn(AgentConfig::new(format!("level-{}", i + 1)))
            .unwrap();
    }
    assert_eq!(current.depth(), 5);
    assert!(matches!(
        current.spawn(AgentConfig::new("too deep")),
        Err(AgentError::SpawnDepthExceeded { depth: 6 })
    ));
}

#[tokio::test]
async fn test_aborted_agent_refuses_prompts() {
    let provider = Arc::new(MockProvider::new(vec![MockProvider::text_reply("hi")]));
    let root = root_with_provider(provider, EventBus::new());
    root.abort();
    assert!(matches!(
        root.prompt("hello?").await,
        Err(AgentError::Aborted)
    ));
}

#[tokio::test]
async fn test_delegate_runs_child_prompt() {
    let provider = Arc::new(MockProvider::new(vec![MockProvider::text_reply(
        "child result",
    )]));
    let root = root_with_provider(provider, EventBus::new());
    let result = root
        .delegate(AgentConfig::new("delegate"), "do the thing")
        .await
        .unwrap();
    assert_eq!(result, "child result");
    assert_eq!(root.get_children().len(), 1);
    assert_eq!(root.get_children()[0].state(), AgentState::Completed);
}

#[tokio::test]
async fn test_delegate_parallel_collects_all() {
    let provider = Arc::new(MockProvider::new(vec![
        MockProvider::text_reply("one"),
        MockProvider::text_reply("two"),
    ]));
    let root = root_with_provider(provider, EventBus::new());
    let results = root
        .delegate_parallel(vec![
            (AgentConfig::new("t1"), "first".to_string()),
            (AgentConfig::new("t2"), "second".to_string()),
        ])
        .await;
    assert_eq!(results.len(), 2);
    let mut texts: Vec<String> = results.into_iter().map(|r| r.unwrap()).collect();
    texts.sort();
    assert_eq!(texts, vec!["one".to_string(), "two".to_string()]);
}

#[tokio::test]
async fn test_prompt_usage_feeds_cost_tracker() {
    let provider = Arc::new(MockProvider::new(vec![MockProvider::text_reply("paid")]));
    let ctx = build_context(provider, EventBus::new());
    let tracker = Arc::clone(&ctx.cost);
    let root = Agent::root(
        AgentConfig::new("coordinator")
            .with_provider("mock")
            .with_model("haiku-standard"),
        "session-1",
        ctx,
    );
    root.prompt("bill me").await.unwrap();

    let per_model = tracker.per_model();
    let spend = per_model.get("haiku-standard").unwrap();
    assert_eq!(spend.calls, 1);
    assert_eq!(spend.usage.input_tokens, 10);
    assert_eq!(spend.usage.output_tokens, 5);
    assert!(spend.cost_usd > 0.0);
}

#[tokio::test]
async fn test_delegate_parallel_spawn_failure_is_isolated() {
    let provider = Arc::new(MockProvider::new(vec![
        MockProvider::text_reply("ok"),
        MockProvider::text_reply("ok"),
    ]));
    let root = root_with_provider(provider, EventBus::new());
    // Fill five slots so only one spawn can succeed.
    for i in 0..5 {
        root.spawn(AgentConfig::new(format!("filler-{}", i)))
            .unwrap();
    }
    let results = root
        .delegate_parallel(vec![
            (AgentConfig::new("fits"), "first".to_string()),
            (AgentConfig::new("overflows"), "second".to_string()),
        ])
        .await;
    assert!(results[0].is_ok());
    assert!(results[1].is_err());
}
