pub mod agent;
pub mod detector;
pub mod engine;
pub mod events;
pub mod knowledge;
pub mod report;
pub mod runner;
pub mod scenario;
pub mod scoring;
pub mod simulator;
pub mod steps;

pub use agent::{AgentReply, AgentUnderTest, LlmAgent};
pub use detector::{DetectedFailure, DetectorConfig, FailureDetector, TurnContext};
pub use engine::{ConversationEngine, ConversationResult, ConversationTurn, EngineConfig};
pub use events::{ConversationEvent, EventKind};
pub use knowledge::{KnowledgeSource, StepKnowledgeBase};
pub use report::{EvalReport, RegressionReport, ScenarioReport, ScenarioStatus};
pub use runner::{ProgressSnapshot, RunSummary, RunnerConfig, ScenarioOutcome, ScenarioRunner};
pub use scenario::{load_scenarios, FailureCondition, Severity, TestScenario, UserPersona};
pub use scoring::{ScoreWeights, SuccessVerdict};
pub use simulator::{LlmUserSimulator, SimulatedReply, SimulatorRequest, UserSimulator};
pub use steps::{StepTracker, StepTrackingState, TerminalReason};
