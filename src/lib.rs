pub mod config;
pub mod error;
pub mod eval;
pub mod extract;
pub mod providers;
pub mod types;
pub mod workflow;

pub use config::{EvalConfig, ModelConfig};
pub use error::{Collaborator, EvalError, LLMError};
pub use eval::{
    ConversationEngine, ConversationResult, EngineConfig, EvalReport, RegressionReport,
    ScenarioRunner, TestScenario,
};
pub use providers::LLMProvider;
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
pub use workflow::{DataField, ExtractedData, FieldValue, Step};
