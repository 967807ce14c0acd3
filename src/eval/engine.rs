use std::{
    collections::BTreeMap,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time;
use tracing::{debug, info, warn};

use crate::{
    error::{Collaborator, EvalError},
    eval::{
        agent::AgentUnderTest,
        detector::{DetectedFailure, DetectorConfig, FailureDetector, TurnContext},
        events::{detect_events, ConversationEvent},
        knowledge::KnowledgeSource,
        scenario::{Severity, TestScenario},
        scoring::{
            calculate_composite_score, calculate_turn_aggregates, evaluate_success,
            score_conversation, score_turn, ConversationScores, ScoreWeights, SuccessInput,
            SuccessVerdict, TurnAggregate, TurnDimension, TurnScores,
        },
        simulator::{SimulatorRequest, UserSimulator},
        steps::{StepTracker, StepTrackingState, TerminalReason},
    },
    extract::{extract_agent_data, UserSignals},
    types::{ChatMessage, TokenUsage},
    workflow::{merge_data, ExtractedData, Step},
    LLMError,
};

pub const DEFAULT_SYSTEM_PROMPT: &str = include_str!("../../prompts/planner_system.md");
pub const DEFAULT_GREETING: &str =
    "Hi! I'm your media planning assistant. What are you hoping to achieve with your next campaign?";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub system_prompt: String,
    /// The agent's opening line, shown to the simulator before turn 1.
    pub greeting: String,
    pub weights: ScoreWeights,
    pub detector: DetectorConfig,
    /// Upper bound for each simulator or agent call. `None` waits forever.
    pub call_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            greeting: DEFAULT_GREETING.to_string(),
            weights: ScoreWeights::default(),
            detector: DetectorConfig::default(),
            call_timeout: None,
        }
    }
}

impl EngineConfig {
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting = greeting.into();
        self
    }

    pub fn with_weights(mut self, weights: ScoreWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_detector(mut self, detector: DetectorConfig) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

/// One exchange: the simulated user's message and the agent's reply, with
/// everything the harness derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub turn_number: u32,
    pub step: Step,
    pub user_message: String,
    pub user_signals: UserSignals,
    pub agent_response: String,
    pub token_usage: TokenUsage,
    pub latency_ms: u64,
    pub scores: TurnScores,
    pub events: Vec<ConversationEvent>,
    pub failures: Vec<DetectedFailure>,
    pub extracted_data: ExtractedData,
    pub state_snapshot: StepTrackingState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCounts {
    pub warning: usize,
    pub major: usize,
    pub critical: usize,
}

impl FailureCounts {
    pub fn from_failures(failures: &[DetectedFailure]) -> Self {
        let mut counts = Self::default();
        for failure in failures {
            match failure.severity {
                Severity::Warning => counts.warning += 1,
                Severity::Major => counts.major += 1,
                Severity::Critical => counts.critical += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.warning + self.major + self.critical
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub total_turns: u32,
    pub token_usage: TokenUsage,
    pub mean_agent_latency_ms: f64,
    pub terminal_reason: Option<TerminalReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationResult {
    pub scenario_id: String,
    pub scenario_name: String,
    pub turns: Vec<ConversationTurn>,
    pub final_state: StepTrackingState,
    pub failures: Vec<DetectedFailure>,
    pub failure_counts: FailureCounts,
    pub events: Vec<ConversationEvent>,
    pub turn_aggregates: BTreeMap<TurnDimension, TurnAggregate>,
    pub conversation_scores: ConversationScores,
    pub composite_score: f64,
    pub verdict: SuccessVerdict,
    pub metadata: ExecutionMetadata,
}

impl ConversationResult {
    pub fn passed(&self) -> bool {
        self.verdict.passed
    }
}

/// Drives one simulated conversation at a time against the agent under test.
///
/// The engine itself holds no per-conversation state; every call to
/// [`ConversationEngine::run_conversation`] builds a fresh tracking state and
/// failure detector, so one engine can serve many concurrent conversations.
pub struct ConversationEngine {
    agent: Arc<dyn AgentUnderTest>,
    simulator: Arc<dyn UserSimulator>,
    knowledge: Arc<dyn KnowledgeSource>,
    config: EngineConfig,
    tracker: StepTracker,
}

impl ConversationEngine {
    pub fn new(
        agent: Arc<dyn AgentUnderTest>,
        simulator: Arc<dyn UserSimulator>,
        knowledge: Arc<dyn KnowledgeSource>,
        config: EngineConfig,
    ) -> Self {
        Self {
            agent,
            simulator,
            knowledge,
            config,
            tracker: StepTracker::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn call<T>(
        &self,
        collaborator: Collaborator,
        turn: u32,
        fut: impl Future<Output = Result<T, LLMError>>,
    ) -> Result<T, EvalError> {
        let result = match self.config.call_timeout {
            Some(after) => time::timeout(after, fut).await.map_err(|_| EvalError::Timeout {
                collaborator,
                turn,
                after,
            })?,
            None => fut.await,
        };
        result.map_err(|source| EvalError::ExternalCall {
            collaborator,
            turn,
            source,
        })
    }

    pub async fn run_conversation(
        &self,
        scenario: &TestScenario,
    ) -> Result<ConversationResult, EvalError> {
        scenario.validate()?;
        self.config.weights.validate().map_err(EvalError::Config)?;

        let mut detector =
            FailureDetector::new(scenario.effective_failure_conditions(), self.config.detector)?;
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(scenario = %scenario.id, max_turns = scenario.max_turns, "conversation started");

        let mut state = StepTrackingState::new();
        let mut turns: Vec<ConversationTurn> = Vec::new();
        let mut failures: Vec<DetectedFailure> = Vec::new();
        let mut events: Vec<ConversationEvent> = Vec::new();
        let mut history: Vec<ChatMessage> = Vec::new();
        let mut token_usage = TokenUsage::default();
        let mut agent_latency_ms: u64 = 0;
        let mut prior_agent = self.config.greeting.clone();
        if !prior_agent.trim().is_empty() {
            history.push(ChatMessage::assistant(prior_agent.clone()));
        }

        for turn_number in 1..=scenario.max_turns {
            let change = scenario
                .data_change
                .as_ref()
                .filter(|change| change.at_turn == turn_number);
            let scripted_override = if turn_number == 1 {
                Some(scenario.opening_message.as_str())
            } else {
                change.map(|change| change.message.as_str())
            };

            let request = SimulatorRequest {
                persona: &scenario.persona,
                last_agent_message: &prior_agent,
                prior_turns: &turns,
                scripted_override,
            };
            let simulated = self
                .call(
                    Collaborator::Simulator,
                    turn_number,
                    self.simulator.generate_response(&request),
                )
                .await?;
            token_usage += simulated.token_usage;

            let mut user_data = simulated.revealed_data.clone();
            if let Some(change) = change {
                user_data.insert(change.field, change.value.clone());
            }

            let step = self
                .tracker
                .detect_current_step(&simulated.message, &prior_agent, &state);
            let knowledge = self
                .knowledge
                .content_for_step(step, &scenario.knowledge_injection);

            history.push(ChatMessage::user(simulated.message.clone()));
            let started = Instant::now();
            let reply = self
                .call(
                    Collaborator::Agent,
                    turn_number,
                    self.agent
                        .respond(&self.config.system_prompt, &history, &knowledge),
                )
                .await?;
            let latency_ms = started.elapsed().as_millis() as u64;
            agent_latency_ms += latency_ms;
            token_usage += reply.token_usage;
            history.push(ChatMessage::assistant(reply.text.clone()));

            let mut extracted = user_data.clone();
            merge_data(&mut extracted, &extract_agent_data(&reply.text));
            let mut next_state = self.tracker.update_state(
                &state,
                step,
                &simulated.message,
                &reply.text,
                &extracted,
                turn_number,
            );

            let ctx = TurnContext {
                turn_number,
                step,
                user_message: &simulated.message,
                agent_response: &reply.text,
                user_signals: simulated.signals,
                extracted: &user_data,
            };
            let turn_failures = detector.detect_failures(&ctx);
            for failure in &turn_failures {
                warn!(
                    scenario = %scenario.id,
                    turn = turn_number,
                    failure = %failure.name,
                    severity = %failure.severity,
                    "{}",
                    failure.evidence
                );
            }

            let turn_events = detect_events(
                turn_number,
                &simulated.message,
                &simulated.signals,
                &reply.text,
                &state,
                &next_state,
                &prior_agent,
            );
            let scores = score_turn(
                &simulated.message,
                &reply.text,
                step,
                &next_state,
                scenario.persona.sophistication,
            );

            let expected_done = !scenario.expected_completed_steps.is_empty()
                && scenario
                    .expected_completed_steps
                    .iter()
                    .all(|step| next_state.completed_steps.contains(step));
            if turn_failures.iter().any(|f| f.terminate) {
                next_state = next_state.terminated(TerminalReason::CriticalFailure);
            } else if expected_done && turn_number >= scenario.min_turns {
                next_state = next_state.terminated(TerminalReason::ExpectedStepsComplete);
            } else if turn_number == scenario.max_turns {
                next_state = next_state.terminated(TerminalReason::MaxTurnsReached);
            }

            debug!(
                scenario = %scenario.id,
                turn = turn_number,
                step = %step,
                completed = next_state.completed_steps.len(),
                failures = turn_failures.len(),
                "turn complete"
            );

            failures.extend(turn_failures.iter().cloned());
            events.extend(turn_events.iter().cloned());
            turns.push(ConversationTurn {
                turn_number,
                step,
                user_message: simulated.message,
                user_signals: simulated.signals,
                agent_response: reply.text.clone(),
                token_usage: reply.token_usage,
                latency_ms,
                scores,
                events: turn_events,
                failures: turn_failures,
                extracted_data: extracted,
                state_snapshot: next_state.clone(),
            });

            state = next_state;
            prior_agent = reply.text;
            if state.is_terminal {
                break;
            }
        }

        let conversation_scores = score_conversation(&turns, scenario, &events, &failures);
        let turn_aggregates = calculate_turn_aggregates(&turns);
        let composite_score = calculate_composite_score(
            &turn_aggregates,
            &conversation_scores,
            &failures,
            &self.config.weights,
        );
        let verdict = evaluate_success(
            &SuccessInput {
                composite_score,
                completed_steps: &state.completed_steps,
                failures: &failures,
                turn_aggregates: &turn_aggregates,
                turns: &turns,
            },
            &scenario.success_criteria,
        );

        let total_turns = turns.len() as u32;
        let metadata = ExecutionMetadata {
            started_at,
            finished_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
            total_turns,
            token_usage,
            mean_agent_latency_ms: if total_turns == 0 {
                0.0
            } else {
                agent_latency_ms as f64 / f64::from(total_turns)
            },
            terminal_reason: state.terminal_reason,
        };

        info!(
            scenario = %scenario.id,
            turns = total_turns,
            composite = composite_score,
            passed = verdict.passed,
            reason = ?state.terminal_reason,
            "conversation finished"
        );

        Ok(ConversationResult {
            scenario_id: scenario.id.clone(),
            scenario_name: scenario.name.clone(),
            failure_counts: FailureCounts::from_failures(&failures),
            final_state: state,
            turns,
            failures,
            events,
            turn_aggregates,
            conversation_scores,
            composite_score,
            verdict,
            metadata,
        })
    }
}
