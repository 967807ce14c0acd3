use std::{
    collections::{BTreeMap, HashSet},
    fmt, fs,
    path::Path,
    sync::Arc,
};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    error::EvalError,
    eval::{detector::TurnContext, scoring::SuccessInput, scoring::TurnDimension},
    workflow::{DataField, ExtractedData, FieldValue, Step},
};

/// A complete, immutable test fixture: who the simulated user is, how the
/// conversation opens, and what counts as success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestScenario {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub persona: UserPersona,
    pub opening_message: String,
    #[serde(default)]
    pub expected_completed_steps: Vec<Step>,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_min_turns")]
    pub min_turns: u32,
    #[serde(default)]
    pub knowledge_injection: BTreeMap<Step, String>,
    #[serde(default)]
    pub failure_conditions: Vec<FailureCondition>,
    #[serde(default)]
    pub success_criteria: SuccessCriteria,
    #[serde(default)]
    pub data_change: Option<DataChange>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_max_turns() -> u32 {
    20
}

fn default_min_turns() -> u32 {
    1
}

impl TestScenario {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        persona: UserPersona,
        opening_message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            persona,
            opening_message: opening_message.into(),
            expected_completed_steps: Vec::new(),
            max_turns: default_max_turns(),
            min_turns: default_min_turns(),
            knowledge_injection: BTreeMap::new(),
            failure_conditions: Vec::new(),
            success_criteria: SuccessCriteria::default(),
            data_change: None,
            tags: Vec::new(),
        }
    }

    pub fn with_turn_bounds(mut self, min_turns: u32, max_turns: u32) -> Self {
        self.min_turns = min_turns;
        self.max_turns = max_turns;
        self
    }

    pub fn with_expected_steps<I>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = Step>,
    {
        self.expected_completed_steps = steps.into_iter().collect();
        self
    }

    pub fn with_knowledge(mut self, step: Step, content: impl Into<String>) -> Self {
        self.knowledge_injection.insert(step, content.into());
        self
    }

    pub fn with_failure_condition(mut self, condition: FailureCondition) -> Self {
        self.failure_conditions.push(condition);
        self
    }

    pub fn with_success_criteria(mut self, criteria: SuccessCriteria) -> Self {
        self.success_criteria = criteria;
        self
    }

    pub fn with_data_change(mut self, change: DataChange) -> Self {
        self.data_change = Some(change);
        self
    }

    /// Built-in conditions overlaid with the scenario's own: a scenario rule
    /// replaces the built-in of the same name, anything else is appended.
    pub fn effective_failure_conditions(&self) -> Vec<FailureCondition> {
        let mut conditions = FailureCondition::builtin_defaults();
        for custom in &self.failure_conditions {
            match conditions.iter_mut().find(|c| c.name == custom.name) {
                Some(existing) => *existing = custom.clone(),
                None => conditions.push(custom.clone()),
            }
        }
        conditions
    }

    /// Rejects fixtures that could never run meaningfully. Called before any
    /// conversation starts.
    pub fn validate(&self) -> Result<(), EvalError> {
        let invalid = |reason: String| -> Result<(), EvalError> {
            Err(EvalError::invalid(&self.id, reason))
        };

        if self.id.trim().is_empty() {
            return Err(EvalError::invalid("<empty>", "scenario id must not be empty"));
        }
        if self.opening_message.trim().is_empty() {
            return invalid("opening message must not be empty".into());
        }
        if self.max_turns == 0 {
            return invalid("max_turns must be at least 1".into());
        }
        if self.min_turns > self.max_turns {
            return invalid(format!(
                "min_turns ({}) exceeds max_turns ({})",
                self.min_turns, self.max_turns
            ));
        }
        let score = self.success_criteria.minimum_overall_score;
        if !(0.0..=1.0).contains(&score) {
            return invalid(format!("minimum_overall_score {score} is outside [0, 1]"));
        }
        for condition in &self.failure_conditions {
            if condition.score_penalty < 0.0 {
                return invalid(format!("{}: score_penalty must not be negative", condition.name));
            }
            match &condition.detection {
                DetectionType::Pattern { pattern, .. } => {
                    if let Err(err) = Regex::new(pattern) {
                        return invalid(format!("{}: invalid pattern: {err}", condition.name));
                    }
                }
                DetectionType::Custom { check } if check.0.is_none() => {
                    return invalid(format!(
                        "{}: custom rule has no evaluator attached",
                        condition.name
                    ));
                }
                _ => {}
            }
        }
        for criterion in &self.success_criteria.custom_criteria {
            if criterion.check.0.is_none() {
                return invalid(format!(
                    "custom criterion {} has no evaluator attached",
                    criterion.name
                ));
            }
        }
        if let Some(change) = &self.data_change {
            if change.at_turn < 2 || change.at_turn > self.max_turns {
                return invalid(format!(
                    "data change at turn {} must fall within 2..={}",
                    change.at_turn, self.max_turns
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SophisticationLevel {
    Novice,
    #[default]
    Intermediate,
    Expert,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    Terse,
    #[default]
    Moderate,
    Verbose,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehavioralTraits {
    /// Share of answers (0..=1) where the user admits not knowing.
    pub uncertainty_frequency: f64,
    pub pushback_frequency: f64,
    pub verbosity: Verbosity,
}

impl Default for BehavioralTraits {
    fn default() -> Self {
        Self {
            uncertainty_frequency: 0.1,
            pushback_frequency: 0.1,
            verbosity: Verbosity::Moderate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPersona {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sophistication: SophisticationLevel,
    #[serde(default)]
    pub known_data: ExtractedData,
    /// Facts the user cannot supply; asked about them, they say so.
    #[serde(default)]
    pub unknown_fields: Vec<DataField>,
    #[serde(default)]
    pub traits: BehavioralTraits,
    #[serde(default)]
    pub language_patterns: Vec<String>,
    #[serde(default)]
    pub response_style: String,
}

impl UserPersona {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            sophistication: SophisticationLevel::default(),
            known_data: ExtractedData::new(),
            unknown_fields: Vec::new(),
            traits: BehavioralTraits::default(),
            language_patterns: Vec::new(),
            response_style: String::new(),
        }
    }

    pub fn with_sophistication(mut self, level: SophisticationLevel) -> Self {
        self.sophistication = level;
        self
    }

    pub fn knows(mut self, field: DataField, value: FieldValue) -> Self {
        self.known_data.insert(field, value);
        self
    }

    pub fn does_not_know(mut self, field: DataField) -> Self {
        self.unknown_fields.push(field);
        self
    }
}

/// A scripted mid-conversation change to one of the user's facts, used to
/// judge whether the agent reforecasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataChange {
    pub at_turn: u32,
    pub field: DataField,
    pub value: FieldValue,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Major,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => f.write_str("warning"),
            Severity::Major => f.write_str("major"),
            Severity::Critical => f.write_str("critical"),
        }
    }
}

type TurnCheckFn = dyn Fn(&TurnContext<'_>) -> bool + Send + Sync;
type CriterionFn = dyn Fn(&SuccessInput<'_>) -> bool + Send + Sync;

/// Code-supplied predicate for a `custom` failure rule. Not serialisable:
/// scenarios loaded from files must attach it before running.
#[derive(Clone, Default)]
pub struct TurnCheck(Option<Arc<TurnCheckFn>>);

impl TurnCheck {
    pub fn new(check: impl Fn(&TurnContext<'_>) -> bool + Send + Sync + 'static) -> Self {
        Self(Some(Arc::new(check)))
    }

    pub fn evaluate(&self, ctx: &TurnContext<'_>) -> bool {
        self.0.as_ref().is_some_and(|check| check(ctx))
    }
}

impl fmt::Debug for TurnCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() {
            "TurnCheck(attached)"
        } else {
            "TurnCheck(missing)"
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectionType {
    /// Regex over the agent response, checked from `min_turn` on.
    Pattern {
        pattern: String,
        #[serde(default)]
        min_turn: Option<u32>,
    },
    LoopDetection,
    ExcessiveQuestions,
    ContextLoss,
    StepBoundaryViolation,
    BlockedProgress,
    Custom {
        #[serde(skip)]
        check: TurnCheck,
    },
}

impl DetectionType {
    pub fn label(&self) -> &'static str {
        match self {
            DetectionType::Pattern { .. } => "pattern",
            DetectionType::LoopDetection => "loop_detection",
            DetectionType::ExcessiveQuestions => "excessive_questions",
            DetectionType::ContextLoss => "context_loss",
            DetectionType::StepBoundaryViolation => "step_boundary_violation",
            DetectionType::BlockedProgress => "blocked_progress",
            DetectionType::Custom { .. } => "custom",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureCondition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub detection: DetectionType,
    pub severity: Severity,
    #[serde(default)]
    pub score_penalty: f64,
    #[serde(default)]
    pub terminate_on_detect: bool,
}

pub const GREETING_PATTERN: &str =
    r"(?i)^\W*(?:hi|hello|hey|welcome|greetings)\b|\b(?:i'?m your|i am your) (?:media )?plann";

impl FailureCondition {
    pub fn new(name: impl Into<String>, detection: DetectionType, severity: Severity) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            detection,
            severity,
            score_penalty: 0.0,
            terminate_on_detect: false,
        }
    }

    pub fn with_penalty(mut self, penalty: f64) -> Self {
        self.score_penalty = penalty;
        self
    }

    pub fn terminating(mut self) -> Self {
        self.terminate_on_detect = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn stops_conversation(&self) -> bool {
        self.severity == Severity::Critical && self.terminate_on_detect
    }

    pub fn builtin_defaults() -> Vec<FailureCondition> {
        vec![
            FailureCondition::new(
                "greeting-repetition",
                DetectionType::Pattern {
                    pattern: GREETING_PATTERN.to_string(),
                    min_turn: Some(2),
                },
                Severity::Warning,
            )
            .with_penalty(0.02)
            .with_description("agent re-introduces itself after the first turn"),
            FailureCondition::new(
                "excessive-questions",
                DetectionType::ExcessiveQuestions,
                Severity::Warning,
            )
            .with_penalty(0.03)
            .with_description("more than two questions in one response"),
            FailureCondition::new(
                "step-boundary-violation",
                DetectionType::StepBoundaryViolation,
                Severity::Major,
            )
            .with_penalty(0.05)
            .with_description(
                "channel-level tactics raised before outcomes and economics are settled",
            ),
            FailureCondition::new("context-loss", DetectionType::ContextLoss, Severity::Major)
                .with_penalty(0.10)
                .with_description("asks for data the user already provided"),
            FailureCondition::new(
                "loop-detection",
                DetectionType::LoopDetection,
                Severity::Critical,
            )
            .with_penalty(0.15)
            .terminating()
            .with_description("keeps asking about the same topic"),
            FailureCondition::new(
                "blocked-progress-idk",
                DetectionType::BlockedProgress,
                Severity::Major,
            )
            .with_penalty(0.10)
            .with_description("pushes for a value the user said they don't know"),
        ]
    }
}

/// Code-supplied success predicate; like [`TurnCheck`] it is never serialised.
#[derive(Clone, Default)]
pub struct CriterionCheck(Option<Arc<CriterionFn>>);

impl CriterionCheck {
    pub fn evaluate(&self, input: &SuccessInput<'_>) -> bool {
        self.0.as_ref().is_some_and(|check| check(input))
    }
}

impl fmt::Debug for CriterionCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() {
            "CriterionCheck(attached)"
        } else {
            "CriterionCheck(missing)"
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomCriterion {
    pub name: String,
    #[serde(skip)]
    pub check: CriterionCheck,
}

impl CustomCriterion {
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&SuccessInput<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: CriterionCheck(Some(Arc::new(check))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessCriteria {
    #[serde(default = "default_minimum_score")]
    pub minimum_overall_score: f64,
    #[serde(default)]
    pub required_steps_complete: Vec<Step>,
    #[serde(default)]
    pub minimum_turn_scores: BTreeMap<TurnDimension, f64>,
    #[serde(default)]
    pub custom_criteria: Vec<CustomCriterion>,
}

fn default_minimum_score() -> f64 {
    0.7
}

impl Default for SuccessCriteria {
    fn default() -> Self {
        Self {
            minimum_overall_score: default_minimum_score(),
            required_steps_complete: Vec::new(),
            minimum_turn_scores: BTreeMap::new(),
            custom_criteria: Vec::new(),
        }
    }
}

/// Loads one scenario file or every `.yaml`/`.yml`/`.json` file in a
/// directory, sorted by id. Duplicate ids are rejected.
pub fn load_scenarios(path: impl AsRef<Path>) -> Result<Vec<TestScenario>, EvalError> {
    let path = path.as_ref();
    let mut scenarios = if path.is_dir() {
        let mut scenarios = Vec::new();
        let entries = fs::read_dir(path).map_err(|e| EvalError::io(path, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| EvalError::io(path, e))?;
            let p = entry.path();
            let ext = p.extension().and_then(|s| s.to_str()).unwrap_or("");
            if !matches!(ext, "yaml" | "yml" | "json") {
                continue;
            }
            scenarios.push(load_scenario_file(&p)?);
        }
        scenarios
    } else {
        vec![load_scenario_file(path)?]
    };

    scenarios.sort_by(|a, b| a.id.cmp(&b.id));

    let mut seen = HashSet::new();
    for scenario in &scenarios {
        if !seen.insert(scenario.id.as_str()) {
            return Err(EvalError::invalid(&scenario.id, "duplicate scenario id"));
        }
    }
    Ok(scenarios)
}

fn load_scenario_file(path: &Path) -> Result<TestScenario, EvalError> {
    let bytes = fs::read(path).map_err(|e| EvalError::io(path, e))?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    let scenario = if ext == "json" {
        serde_json::from_slice(&bytes)?
    } else {
        serde_yaml::from_slice(&bytes)?
    };
    Ok(scenario)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario() -> TestScenario {
        TestScenario::new("s1", "basic", UserPersona::new("Dana"), "Hi, I need a media plan.")
    }

    #[test]
    fn parses_minimal_yaml() {
        let yaml = r#"
id: ecommerce-basic
name: E-commerce founder
persona:
  name: Dana
  sophistication: novice
  known_data:
    budget: 500000
    objective: drive sales
  unknown_fields: [cac]
opening_message: "We want to grow online sales."
expected_completed_steps: [1, 2]
failure_conditions:
  - name: competitor-mention
    detection: { type: pattern, pattern: "(?i)acme corp" }
    severity: major
    score_penalty: 0.05
success_criteria:
  minimum_overall_score: 0.6
  minimum_turn_scores:
    single_question: 0.8
"#;
        let scenario: TestScenario = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(scenario.max_turns, 20);
        assert_eq!(scenario.persona.sophistication, SophisticationLevel::Novice);
        assert_eq!(
            scenario.persona.known_data.get(&DataField::Budget),
            Some(&FieldValue::Number(500_000.0))
        );
        assert_eq!(scenario.expected_completed_steps, vec![Step::Outcomes, Step::Economics]);
        assert!(scenario.validate().is_ok());
    }

    #[test]
    fn scenario_rules_override_builtins_by_name() {
        let scenario = scenario()
            .with_failure_condition(
                FailureCondition::new(
                    "context-loss",
                    DetectionType::ContextLoss,
                    Severity::Critical,
                )
                .with_penalty(0.3),
            )
            .with_failure_condition(FailureCondition::new(
                "no-jargon",
                DetectionType::Pattern {
                    pattern: "(?i)synerg".into(),
                    min_turn: None,
                },
                Severity::Warning,
            ));
        let conditions = scenario.effective_failure_conditions();
        assert_eq!(conditions.len(), FailureCondition::builtin_defaults().len() + 1);
        let context_loss = conditions.iter().find(|c| c.name == "context-loss").unwrap();
        assert_eq!(context_loss.severity, Severity::Critical);
        assert_eq!(context_loss.score_penalty, 0.3);
    }

    #[test]
    fn rejects_bad_bounds_and_detached_custom_rules() {
        let err = scenario().with_turn_bounds(5, 3).validate().unwrap_err();
        assert!(matches!(err, EvalError::InvalidScenario { .. }));

        let detached = scenario().with_failure_condition(FailureCondition::new(
            "custom",
            DetectionType::Custom { check: TurnCheck::default() },
            Severity::Major,
        ));
        assert!(detached.validate().is_err());

        let bad_regex = scenario().with_failure_condition(FailureCondition::new(
            "broken",
            DetectionType::Pattern { pattern: "(".into(), min_turn: None },
            Severity::Warning,
        ));
        assert!(bad_regex.validate().is_err());
    }
}
