use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use planeval::{
    eval::{
        AgentReply, AgentUnderTest, ConversationEngine, EngineConfig, ProgressSnapshot,
        RunnerConfig, ScenarioOutcome, ScenarioRunner, ScenarioStatus, SimulatedReply,
        SimulatorRequest, StepKnowledgeBase, TestScenario, UserPersona, UserSimulator,
    },
    ChatMessage, EvalError, LLMError, TokenUsage,
};

/// Sleeps on every reply and records how many replies were in progress at once.
#[derive(Default)]
struct CountingAgent {
    active: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl AgentUnderTest for CountingAgent {
    async fn respond(
        &self,
        _system_prompt: &str,
        history: &[ChatMessage],
        _injected_knowledge: &str,
    ) -> Result<AgentReply, LLMError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let opening = history
            .iter()
            .find_map(|m| (m.role == planeval::MessageRole::User).then(|| m.text()).flatten())
            .unwrap_or_default();
        if opening.contains("explode") {
            return Err(LLMError::Provider("upstream unavailable".to_string()));
        }
        if opening.contains("crash") {
            panic!("agent crashed");
        }
        Ok(AgentReply {
            text: "Thanks, that helps. What outcome matters most to you?".to_string(),
            token_usage: TokenUsage::default(),
        })
    }
}

struct EchoUser;

#[async_trait]
impl UserSimulator for EchoUser {
    async fn generate_response(
        &self,
        request: &SimulatorRequest<'_>,
    ) -> Result<SimulatedReply, LLMError> {
        Ok(SimulatedReply::from_text(
            request.scripted_override.unwrap_or("We mostly care about sales."),
        ))
    }
}

fn engine(agent: Arc<CountingAgent>) -> Arc<ConversationEngine> {
    Arc::new(ConversationEngine::new(
        agent,
        Arc::new(EchoUser),
        Arc::new(StepKnowledgeBase::new()),
        EngineConfig::default(),
    ))
}

fn scenarios(count: usize) -> Vec<TestScenario> {
    (0..count)
        .map(|i| {
            TestScenario::new(
                format!("scenario-{i:02}"),
                format!("Scenario {i}"),
                UserPersona::new("Dana"),
                "We want to drive sales.",
            )
            .with_turn_bounds(1, 2)
        })
        .collect()
}

fn runner(agent: Arc<CountingAgent>, concurrency: usize) -> ScenarioRunner {
    ScenarioRunner::new(
        engine(agent),
        RunnerConfig {
            concurrency,
            progress_interval: Duration::from_millis(10),
        },
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_exceeds_the_concurrency_limit() {
    let agent = Arc::new(CountingAgent::default());
    let snapshots: Arc<Mutex<Vec<ProgressSnapshot>>> = Arc::default();
    let seen = snapshots.clone();

    let summary = runner(agent.clone(), 3)
        .with_progress_callback(move |snapshot| seen.lock().unwrap().push(snapshot.clone()))
        .run(scenarios(10))
        .await
        .unwrap();

    let peak = agent.peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 3, "peak concurrency {peak}");
    assert_eq!(agent.calls.load(Ordering::SeqCst), 20);

    let report = &summary.report;
    assert_eq!(report.total, 10);
    assert_eq!(report.passed + report.failed, 10);
    assert_eq!(report.errored, 0);
    let ids: BTreeSet<_> = report.scenarios.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids.len(), 10);
    assert_eq!(summary.results().count(), 10);
    assert!(report.scenarios.windows(2).all(|pair| pair[0].id < pair[1].id));

    let snapshots = snapshots.lock().unwrap();
    let last = snapshots.last().expect("final snapshot");
    assert_eq!(last.completed, 10);
    assert!(last.in_flight.is_empty());
    assert_eq!(last.eta, Some(Duration::ZERO));
    assert!(snapshots.iter().all(|s| s.in_flight.len() <= 3));
}

#[tokio::test]
async fn errored_scenarios_are_reported_not_fatal() {
    let agent = Arc::new(CountingAgent::default());
    let mut batch = scenarios(3);
    batch.push(
        TestScenario::new("scenario-boom", "Boom", UserPersona::new("Dana"), "Please explode.")
            .with_turn_bounds(1, 2),
    );

    let summary = runner(agent, 2).run(batch).await.unwrap();
    let report = &summary.report;

    assert_eq!(report.total, 4);
    assert_eq!(report.errored, 1);
    let boom = report.scenario("scenario-boom").unwrap();
    assert_eq!(boom.status, ScenarioStatus::Errored);
    assert!(boom.error.as_deref().unwrap_or_default().contains("agent under test"));
    assert_eq!(summary.results().count(), 3);
    // errored runs are excluded from the rates
    assert_eq!(report.passed + report.failed, 3);
}

#[tokio::test]
async fn a_panicking_conversation_is_reported_as_errored() {
    let agent = Arc::new(CountingAgent::default());
    let mut batch = scenarios(4);
    batch.push(
        TestScenario::new("scenario-crash", "Crash", UserPersona::new("Dana"), "Then crash.")
            .with_turn_bounds(1, 2),
    );

    let summary = runner(agent, 2).run(batch).await.unwrap();
    let report = &summary.report;

    assert_eq!(report.total, 5);
    assert_eq!(report.errored, 1);
    assert_eq!(report.passed + report.failed, 4);
    let crash = report.scenario("scenario-crash").unwrap();
    assert_eq!(crash.status, ScenarioStatus::Errored);
    assert!(crash.error.as_deref().unwrap_or_default().contains("agent crashed"));
    let ids: BTreeSet<_> = report.scenarios.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids.len(), 5);

    let aborted = summary
        .outcomes
        .iter()
        .find_map(|outcome| match outcome {
            ScenarioOutcome::Errored { error, .. } => Some(error),
            ScenarioOutcome::Finished(_) => None,
        })
        .expect("errored outcome");
    assert!(matches!(aborted, EvalError::Aborted(_)));
    assert!(!aborted.is_config());
}

#[tokio::test]
async fn selection_rejects_unknown_ids() {
    let agent = Arc::new(CountingAgent::default());
    let err = runner(agent.clone(), 2)
        .run_selected(scenarios(3), &["scenario-99".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, EvalError::UnknownScenario(id) if id == "scenario-99"));
    assert_eq!(agent.calls.load(Ordering::SeqCst), 0);

    let summary = runner(agent, 2)
        .run_selected(scenarios(3), &["scenario-01".to_string()])
        .await
        .unwrap();
    assert_eq!(summary.report.total, 1);
    assert_eq!(summary.report.scenarios[0].id, "scenario-01");
}

#[tokio::test]
async fn empty_batch_and_bad_configuration() {
    let agent = Arc::new(CountingAgent::default());
    let summary = runner(agent.clone(), 2).run(Vec::new()).await.unwrap();
    assert_eq!(summary.report.total, 0);
    assert_eq!(summary.report.pass_rate, 0.0);
    assert_eq!(summary.report.average_score, 0.0);

    let err = runner(agent.clone(), 0).run(scenarios(1)).await.unwrap_err();
    assert!(matches!(err, EvalError::Config(_)));

    let mut duplicated = scenarios(2);
    duplicated[1].id = duplicated[0].id.clone();
    let err = runner(agent, 2).run(duplicated).await.unwrap_err();
    assert!(matches!(err, EvalError::InvalidScenario { .. }));
}
