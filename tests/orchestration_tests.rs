use async_trait::async_trait;
use chitragupta::chitragupta::autonomous::{
    AutonomousConfig, AutonomousOrchestrator, TaskBudget,
};
use chitragupta::chitragupta::bandit::BanditMode;
use chitragupta::chitragupta::clock::{Clock, ManualClock};
use chitragupta::chitragupta::marga::{MargaPipeline, RouteOutcome, RoutingProfile, Tier};
use chitragupta::chitragupta::orchestrator::{
    AgentSlot, FallbackConfig, Orchestrator, OrchestratorEvent, OrchestratorTask, SlotWorker,
    Strategy,
};
use chitragupta::chitragupta::provider::{CancellationToken, Turn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct CountingWorker {
    id: &'static str,
    calls: Arc<AtomicUsize>,
    fail_first: usize,
}

#[async_trait]
impl SlotWorker for CountingWorker {
    async fn run(
        &self,
        task: &OrchestratorTask,
        _cancel: CancellationToken,
    ) -> Result<String, String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            Err(format!("{} not warmed up yet", self.id))
        } else {
            Ok(format!("{}: {}", self.id, task.description))
        }
    }
}

fn slot(id: &'static str, calls: Arc<AtomicUsize>, fail_first: usize) -> AgentSlot {
    AgentSlot::new(
        id,
        vec![],
        Arc::new(CountingWorker {
            id,
            calls,
            fail_first,
        }),
    )
}

#[tokio::test]
async fn test_retry_budget_recovers_from_transient_failures() {
    let calls = Arc::new(AtomicUsize::new(0));
    let orch = Orchestrator::new(
        vec![slot("s1", calls.clone(), 1)],
        Arc::new(ManualClock::new(0)),
    )
    .with_fallback(FallbackConfig { max_retries: 2 });

    let outcome = orch.execute(&OrchestratorTask::new("warm up")).await.unwrap();
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.output, "s1: warm up");
}

#[tokio::test]
async fn test_callback_sees_lifecycle() {
    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let calls = Arc::new(AtomicUsize::new(0));
    let orch = Orchestrator::new(
        vec![slot("s1", calls, 1)],
        Arc::new(ManualClock::new(0)),
    )
    .with_fallback(FallbackConfig { max_retries: 1 })
    .with_callback(Arc::new(move |event| {
        let label = match event {
            OrchestratorEvent::TaskStarted { strategy, .. } => format!("started:{}", strategy),
            OrchestratorEvent::TaskCompleted { slot_id, .. } => format!("completed:{}", slot_id),
            OrchestratorEvent::TaskFailed { attempt, .. } => format!("failed:{}", attempt),
        };
        sink.lock().unwrap().push(label);
    }));

    orch.execute(&OrchestratorTask::new("t")).await.unwrap();
    let seen = events.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            "started:round-robin".to_string(),
            "failed:1".to_string(),
            "completed:s1".to_string()
        ]
    );
}

#[tokio::test]
async fn test_hierarchical_decomposes_bullets() {
    let calls = Arc::new(AtomicUsize::new(0));
    let orch = Orchestrator::new(
        vec![slot("s1", calls.clone(), 0), slot("s2", Arc::new(AtomicUsize::new(0)), 0)],
        Arc::new(ManualClock::new(0)),
    );
    orch.set_strategy(Strategy::Hierarchical);
    let task = OrchestratorTask::new("- research the topic\n- draft the summary");
    let outcome = orch.execute(&task).await.unwrap();
    assert!(outcome.output.contains("research the topic"));
    assert!(outcome.output.contains("draft the summary"));
}

#[tokio::test]
async fn test_autonomous_learns_and_reports_stats() {
    let clock = Arc::new(ManualClock::new(0));
    let slots = vec![
        slot("s1", Arc::new(AtomicUsize::new(0)), 0),
        slot("s2", Arc::new(AtomicUsize::new(0)), 0),
    ];
    let orch = Arc::new(Orchestrator::new(slots, clock.clone() as Arc<dyn Clock>));
    let auto = AutonomousOrchestrator::new(
        orch,
        BanditMode::Ucb1,
        AutonomousConfig::default(),
        clock as Arc<dyn Clock>,
    );

    for i in 0..12 {
        auto.execute_with_budget(
            &OrchestratorTask::new(format!("task {}", i)),
            TaskBudget {
                expected_duration_ms: Some(10_000),
                cost_budget_usd: Some(0.05),
                actual_cost_usd: 0.01,
            },
        )
        .await
        .unwrap();
    }

    let stats = auto.get_stats();
    let total_pulls: u64 = stats.iter().map(|s| s.pulls).sum();
    assert_eq!(total_pulls, 12);
    // Successful cheap fast tasks score well everywhere.
    assert!(stats.iter().all(|s| s.pulls == 0 || s.average_reward > 0.5));
}

#[test]
fn test_marga_routes_and_learns_end_to_end() {
    let pipeline = MargaPipeline::new(RoutingProfile::LocalFirst);

    // A heartbeat never reaches a model.
    let heartbeat = pipeline.route(&[Turn::user("heartbeat")]);
    assert!(heartbeat.skip_llm);

    // A hard code task lands on a capable tier.
    let decision = pipeline.route(&[Turn::user(
        "Refactor the whole architecture across the codebase.\n```rust\nfn main() {}\n```",
    )]);
    assert!(!decision.skip_llm);
    assert!(decision.tier >= Tier::Sonnet);
    assert!(decision.cost_estimate > 0.0);
    assert!(decision.rationale.contains("code-gen"));

    // Reward feedback flows into the bandit and survives a save/restore.
    let reward = pipeline.report_reward(
        &decision,
        RouteOutcome {
            success: true,
            latency_ms: 2_000,
            cost_usd: 0.002,
            budget_usd: 0.01,
        },
    );
    assert!(reward > 0.7);

    let saved = pipeline.serialize_bandit();
    let fresh = MargaPipeline::new(RoutingProfile::LocalFirst);
    fresh.restore_bandit(&saved).unwrap();
}

#[tokio::test]
async fn test_plan_with_inputs_substitution() {
    let calls = Arc::new(AtomicUsize::new(0));
    let orch = Orchestrator::new(
        vec![slot("s1", calls, 0)],
        Arc::new(ManualClock::new(0)),
    );
    let mut inputs = HashMap::new();
    inputs.insert("target".to_string(), "storage layer".to_string());
    let outcomes = orch
        .execute_plan(
            vec![OrchestratorTask::new("inspect the {target}")],
            &inputs,
        )
        .await
        .unwrap();
    assert_eq!(outcomes[0].output, "s1: inspect the storage layer");
}
