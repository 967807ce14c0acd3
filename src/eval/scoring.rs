//! Turn and conversation scoring.
//!
//! Each dimension scorer is a free function over its own inputs; none reads
//! another's result, so dimensions can be added or removed without moving
//! the others.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    eval::{
        detector::DetectedFailure,
        engine::ConversationTurn,
        events::{find_calculations, mentions_numbers, ConversationEvent, EventKind},
        scenario::{DataChange, Severity, SophisticationLevel, SuccessCriteria, TestScenario},
        steps::StepTrackingState,
    },
    extract::{normalize, questions, word_count},
    workflow::{FieldValue, Step},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDimension {
    SingleQuestion,
    ResponseLength,
    AdaptiveSophistication,
    ProactiveCalculation,
    Teaching,
}

impl TurnDimension {
    pub const ALL: [TurnDimension; 5] = [
        TurnDimension::SingleQuestion,
        TurnDimension::ResponseLength,
        TurnDimension::AdaptiveSophistication,
        TurnDimension::ProactiveCalculation,
        TurnDimension::Teaching,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TurnDimension::SingleQuestion => "single_question",
            TurnDimension::ResponseLength => "response_length",
            TurnDimension::AdaptiveSophistication => "adaptive_sophistication",
            TurnDimension::ProactiveCalculation => "proactive_calculation",
            TurnDimension::Teaching => "teaching",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationDimension {
    PlanCoherence,
    StepQuality,
    Reforecasting,
}

impl ConversationDimension {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationDimension::PlanCoherence => "plan_coherence",
            ConversationDimension::StepQuality => "step_quality",
            ConversationDimension::Reforecasting => "reforecasting",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionScore {
    pub score: f64,
    /// What the scorer saw, for debugging a surprising number.
    #[serde(default)]
    pub matched: Vec<String>,
}

impl DimensionScore {
    fn new(score: f64) -> Self {
        Self {
            score: score.clamp(0.0, 1.0),
            matched: Vec::new(),
        }
    }

    fn with_matched(mut self, matched: impl IntoIterator<Item = String>) -> Self {
        self.matched.extend(matched);
        self
    }
}

pub type TurnScores = BTreeMap<TurnDimension, DimensionScore>;
pub type ConversationScores = BTreeMap<ConversationDimension, DimensionScore>;

static RE_JARGON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:cac|ltv|roas|cpm|cpa|cpc|ctr|incrementality|attribution|mmm|frequency cap(?:ping)?|lookalikes?|programmatic|retargeting|funnel|marginal returns?|diminishing returns|payback period)\b",
    )
    .unwrap()
});

static RE_EXPLANATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:which means|in other words|stands for|that is,|i\.e\.|meaning|put simply)",
    )
    .unwrap()
});

static RE_TEACHING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:because|this (?:helps|matters|means|tells us|lets us)|the reason|which means|so that|that way|in other words|for example|for instance|why this matters)\b",
    )
    .unwrap()
});

static RE_FORECAST_LANGUAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:forecast\w*|projection|projected|revised|re-?forecast|updated (?:plan|numbers|estimate)|we (?:now )?expect)\b",
    )
    .unwrap()
});

static RE_ACKNOWLEDGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:updated?|changed?|new (?:budget|target|number)|revis\w+|adjust\w*|noted|thanks for the update)\b",
    )
    .unwrap()
});

fn distinct_matches(pattern: &Regex, text: &str) -> Vec<String> {
    let found: BTreeSet<String> = pattern
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect();
    found.into_iter().collect()
}

pub fn score_single_question(agent_response: &str) -> DimensionScore {
    let asked = questions(agent_response);
    let score = match asked.len() {
        0 | 1 => 1.0,
        2 => 0.5,
        _ => 0.0,
    };
    DimensionScore::new(score).with_matched(asked)
}

pub fn score_response_length(agent_response: &str) -> DimensionScore {
    let words = word_count(agent_response);
    let score = match words {
        0..=19 => 0.6,
        20..=200 => 1.0,
        201..=350 => 1.0 - 0.6 * (words - 200) as f64 / 150.0,
        _ => 0.2,
    };
    DimensionScore::new(score).with_matched([format!("{words} words")])
}

pub fn score_adaptive_sophistication(
    agent_response: &str,
    level: SophisticationLevel,
) -> DimensionScore {
    let jargon = distinct_matches(&RE_JARGON, agent_response);
    let explained = RE_EXPLANATION.is_match(agent_response);
    let teaching = RE_TEACHING.find_iter(agent_response).count();

    let score = match level {
        SophisticationLevel::Novice => match (jargon.len(), explained) {
            (0, _) => 1.0,
            (_, true) => 0.8,
            (1, false) => 0.6,
            _ => 0.3,
        },
        SophisticationLevel::Intermediate => {
            if jargon.len() > 3 && !explained {
                0.7
            } else {
                1.0
            }
        }
        SophisticationLevel::Expert => {
            if !jargon.is_empty() {
                1.0
            } else if teaching >= 2 {
                0.6
            } else {
                0.8
            }
        }
    };
    DimensionScore::new(score).with_matched(jargon)
}

/// Only meaningful once at least two numeric facts are known and the
/// conversation is on economics or forecasting; otherwise `None`.
pub fn score_proactive_calculation(
    agent_response: &str,
    step: Step,
    state: &StepTrackingState,
) -> Option<DimensionScore> {
    if !matches!(step, Step::Economics | Step::Forecast) {
        return None;
    }
    let numeric_facts = state
        .all_data()
        .values()
        .filter(|value| matches!(value, FieldValue::Number(_)))
        .count();
    if numeric_facts < 2 {
        return None;
    }

    let calculations = find_calculations(agent_response);
    let score = if !calculations.is_empty() {
        1.0
    } else if mentions_numbers(agent_response) {
        0.5
    } else {
        0.0
    };
    Some(DimensionScore::new(score).with_matched(calculations.into_iter().map(|c| c.expression)))
}

pub fn score_teaching(agent_response: &str) -> DimensionScore {
    let found = distinct_matches(&RE_TEACHING, agent_response);
    let score = match found.len() {
        0 => 0.3,
        1 => 0.7,
        _ => 1.0,
    };
    DimensionScore::new(score).with_matched(found)
}

/// Scores one agent response. Pure; `state` is the tracking state after the turn.
pub fn score_turn(
    _user_message: &str,
    agent_response: &str,
    step: Step,
    state: &StepTrackingState,
    sophistication: SophisticationLevel,
) -> TurnScores {
    let mut scores = TurnScores::new();
    scores.insert(TurnDimension::SingleQuestion, score_single_question(agent_response));
    scores.insert(TurnDimension::ResponseLength, score_response_length(agent_response));
    scores.insert(
        TurnDimension::AdaptiveSophistication,
        score_adaptive_sophistication(agent_response, sophistication),
    );
    if let Some(score) = score_proactive_calculation(agent_response, step, state) {
        scores.insert(TurnDimension::ProactiveCalculation, score);
    }
    scores.insert(TurnDimension::Teaching, score_teaching(agent_response));
    scores
}

pub fn score_plan_coherence(
    turns: &[ConversationTurn],
    failures: &[DetectedFailure],
) -> DimensionScore {
    let regressions: Vec<String> = turns
        .windows(2)
        .filter(|pair| pair[1].step < pair[0].step)
        .map(|pair| format!("turn {}: {} -> {}", pair[1].turn_number, pair[0].step, pair[1].step))
        .collect();
    let context_losses = failures
        .iter()
        .filter(|f| f.detection == "context_loss")
        .count();
    let score = 1.0 - 0.1 * regressions.len() as f64 - 0.15 * context_losses as f64;
    DimensionScore::new(score).with_matched(regressions)
}

/// Turns a step is expected to take when handled well.
const TURNS_PER_STEP: f64 = 3.0;

pub fn score_step_quality(turns: &[ConversationTurn], expected: &[Step]) -> DimensionScore {
    let Some(last) = turns.last() else {
        return DimensionScore::new(0.0);
    };
    let completed = &last.state_snapshot.completed_steps;
    let target: BTreeSet<Step> = if expected.is_empty() {
        turns.iter().map(|t| t.step).collect()
    } else {
        expected.iter().copied().collect()
    };
    if target.is_empty() {
        return DimensionScore::new(0.0);
    }

    let covered = target.intersection(completed).count();
    let coverage = covered as f64 / target.len() as f64;
    let efficiency = if completed.is_empty() {
        0.0
    } else {
        (TURNS_PER_STEP * completed.len() as f64 / turns.len() as f64).min(1.0)
    };
    DimensionScore::new(0.5 * coverage + 0.5 * efficiency).with_matched([
        format!("{covered}/{} target steps complete", target.len()),
        format!("{} steps in {} turns", completed.len(), turns.len()),
    ])
}

/// How the agent handled a scripted change of facts: acknowledging it,
/// recalculating, and restating the forecast. `None` when nothing changed or
/// the conversation ended before the change.
pub fn score_reforecasting(
    turns: &[ConversationTurn],
    change: Option<&DataChange>,
    events: &[ConversationEvent],
) -> Option<DimensionScore> {
    let change = change?;
    let after: Vec<&ConversationTurn> = turns
        .iter()
        .filter(|turn| turn.turn_number >= change.at_turn)
        .collect();
    if after.is_empty() {
        return None;
    }

    let field = change.field.as_str().replace('_', " ");
    let value = normalize(&change.value.to_string());
    let acknowledged = after.iter().any(|turn| {
        let text = normalize(&turn.agent_response);
        RE_ACKNOWLEDGE.is_match(&turn.agent_response)
            || text.contains(&field)
            || text.contains(&value)
    });
    let recalculated = events.iter().any(|event| {
        event.turn_number >= change.at_turn
            && matches!(event.kind, EventKind::CalculationPerformed { .. })
    });
    let restated = after
        .iter()
        .any(|turn| RE_FORECAST_LANGUAGE.is_match(&turn.agent_response));

    let mut matched = Vec::new();
    let mut score = 0.0;
    if acknowledged {
        score += 0.4;
        matched.push("acknowledged change".to_string());
    }
    if recalculated {
        score += 0.4;
        matched.push("recalculated".to_string());
    }
    if restated {
        score += 0.2;
        matched.push("restated forecast".to_string());
    }
    Some(DimensionScore::new(score).with_matched(matched))
}

pub fn score_conversation(
    turns: &[ConversationTurn],
    scenario: &TestScenario,
    events: &[ConversationEvent],
    failures: &[DetectedFailure],
) -> ConversationScores {
    let mut scores = ConversationScores::new();
    scores.insert(ConversationDimension::PlanCoherence, score_plan_coherence(turns, failures));
    scores.insert(
        ConversationDimension::StepQuality,
        score_step_quality(turns, &scenario.expected_completed_steps),
    );
    if let Some(score) = score_reforecasting(turns, scenario.data_change.as_ref(), events) {
        scores.insert(ConversationDimension::Reforecasting, score);
    }
    scores
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TurnAggregate {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

/// Per-dimension statistics over the turns that computed the dimension.
pub fn calculate_turn_aggregates(
    turns: &[ConversationTurn],
) -> BTreeMap<TurnDimension, TurnAggregate> {
    let mut values: BTreeMap<TurnDimension, Vec<f64>> = BTreeMap::new();
    for turn in turns {
        for (dimension, score) in &turn.scores {
            values.entry(*dimension).or_default().push(score.score);
        }
    }
    values
        .into_iter()
        .filter(|(_, scores)| !scores.is_empty())
        .map(|(dimension, scores)| {
            let sum: f64 = scores.iter().sum();
            let aggregate = TurnAggregate {
                mean: sum / scores.len() as f64,
                min: scores.iter().copied().fold(f64::INFINITY, f64::min),
                max: scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                count: scores.len(),
            };
            (dimension, aggregate)
        })
        .collect()
}

/// Composite weights, one per dimension. Fixed configuration; only the
/// dimensions present in a conversation share the total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub single_question: f64,
    pub response_length: f64,
    pub adaptive_sophistication: f64,
    pub proactive_calculation: f64,
    pub teaching: f64,
    pub plan_coherence: f64,
    pub step_quality: f64,
    pub reforecasting: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            single_question: 0.15,
            response_length: 0.10,
            adaptive_sophistication: 0.10,
            proactive_calculation: 0.10,
            teaching: 0.10,
            plan_coherence: 0.15,
            step_quality: 0.20,
            reforecasting: 0.10,
        }
    }
}

impl ScoreWeights {
    pub fn for_turn(&self, dimension: TurnDimension) -> f64 {
        match dimension {
            TurnDimension::SingleQuestion => self.single_question,
            TurnDimension::ResponseLength => self.response_length,
            TurnDimension::AdaptiveSophistication => self.adaptive_sophistication,
            TurnDimension::ProactiveCalculation => self.proactive_calculation,
            TurnDimension::Teaching => self.teaching,
        }
    }

    pub fn for_conversation(&self, dimension: ConversationDimension) -> f64 {
        match dimension {
            ConversationDimension::PlanCoherence => self.plan_coherence,
            ConversationDimension::StepQuality => self.step_quality,
            ConversationDimension::Reforecasting => self.reforecasting,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let all = [
            self.single_question,
            self.response_length,
            self.adaptive_sophistication,
            self.proactive_calculation,
            self.teaching,
            self.plan_coherence,
            self.step_quality,
            self.reforecasting,
        ];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err("score weights must be finite and non-negative".to_string());
        }
        if all.iter().sum::<f64>() <= 0.0 {
            return Err("score weights must not all be zero".to_string());
        }
        Ok(())
    }
}

/// Weighted mean of the present dimensions minus every triggered penalty,
/// clamped to [0, 1]. Iteration order is fixed, so equal inputs give
/// bit-identical output.
pub fn calculate_composite_score(
    turn_aggregates: &BTreeMap<TurnDimension, TurnAggregate>,
    conversation_scores: &ConversationScores,
    failures: &[DetectedFailure],
    weights: &ScoreWeights,
) -> f64 {
    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    for (dimension, aggregate) in turn_aggregates {
        let weight = weights.for_turn(*dimension);
        weighted += weight * aggregate.mean;
        total_weight += weight;
    }
    for (dimension, score) in conversation_scores {
        let weight = weights.for_conversation(*dimension);
        weighted += weight * score.score;
        total_weight += weight;
    }

    let base = if total_weight > 0.0 {
        weighted / total_weight
    } else {
        0.0
    };
    let penalty: f64 = failures.iter().map(|f| f.score_penalty).sum();
    (base - penalty).clamp(0.0, 1.0)
}

/// What success criteria (including custom evaluators) get to look at.
#[derive(Debug, Clone, Copy)]
pub struct SuccessInput<'a> {
    pub composite_score: f64,
    pub completed_steps: &'a BTreeSet<Step>,
    pub failures: &'a [DetectedFailure],
    pub turn_aggregates: &'a BTreeMap<TurnDimension, TurnAggregate>,
    pub turns: &'a [ConversationTurn],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessVerdict {
    pub passed: bool,
    /// Why the conversation failed; empty when it passed.
    pub reasons: Vec<String>,
}

pub fn evaluate_success(input: &SuccessInput<'_>, criteria: &SuccessCriteria) -> SuccessVerdict {
    let mut reasons = Vec::new();

    if input.composite_score < criteria.minimum_overall_score {
        reasons.push(format!(
            "composite score {:.3} below minimum {:.3}",
            input.composite_score, criteria.minimum_overall_score
        ));
    }

    for step in &criteria.required_steps_complete {
        if !input.completed_steps.contains(step) {
            reasons.push(format!("required step {step} not complete"));
        }
    }

    let critical: Vec<&str> = input
        .failures
        .iter()
        .filter(|f| f.severity == Severity::Critical)
        .map(|f| f.name.as_str())
        .collect();
    if !critical.is_empty() {
        reasons.push(format!("critical failures: {}", critical.join(", ")));
    }

    for (dimension, minimum) in &criteria.minimum_turn_scores {
        match input.turn_aggregates.get(dimension) {
            Some(aggregate) if aggregate.mean >= *minimum => {}
            Some(aggregate) => reasons.push(format!(
                "{} mean {:.3} below minimum {:.3}",
                dimension.as_str(),
                aggregate.mean,
                minimum
            )),
            None => reasons.push(format!("{} was never scored", dimension.as_str())),
        }
    }

    for criterion in &criteria.custom_criteria {
        if !criterion.check.evaluate(input) {
            reasons.push(format!("custom criterion {} not met", criterion.name));
        }
    }

    SuccessVerdict {
        passed: reasons.is_empty(),
        reasons,
    }
}
