use chrono::{DateTime, Utc};
use evalexpr::{eval, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    eval::{
        detector::{classify_topic, QuestionTopic},
        steps::StepTrackingState,
    },
    extract::{parse_amount, UserSignals},
    workflow::Step,
};

/// A noteworthy thing that happened on a turn. Reporting only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub turn_number: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// The user said they don't know and the agent offered a benchmark or
    /// assumption instead of insisting.
    IdkProtocol { topic: QuestionTopic },
    CalculationPerformed {
        expression: String,
        result: f64,
        correct: bool,
    },
    BenchmarkCited { excerpt: String },
    StepTransition { from: Step, to: Step },
    StepCompletion { step: Step },
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::IdkProtocol { .. } => "idk_protocol",
            EventKind::CalculationPerformed { .. } => "calculation_performed",
            EventKind::BenchmarkCited { .. } => "benchmark_cited",
            EventKind::StepTransition { .. } => "step_transition",
            EventKind::StepCompletion { .. } => "step_completion",
        }
    }
}

const NUMBER: &str = r"\$?\s?(\d[\d,]*(?:\.\d+)?)(?:\s*(k|m)\b)?";

static RE_CALCULATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i){NUMBER}\s*([-+*/x×÷])\s*{NUMBER}\s*=\s*{NUMBER}"
    ))
    .unwrap()
});

static RE_ASSUMPTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:benchmarks?|industry averages?|typical(?:ly)?|assum(?:e|es|ing|ption)|rule of thumb|on average|placeholder|estimate)\b",
    )
    .unwrap()
});

static RE_BENCHMARK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:industry (?:average|benchmark|standard)s?|benchmarks?|typical(?:ly)?|on average)\b[^.\n]{0,80}?\d[\d,.]*\s*%?",
    )
    .unwrap()
});

/// A simple `a op b = c` calculation found in agent text, re-evaluated.
#[derive(Debug, Clone, PartialEq)]
pub struct Calculation {
    pub expression: String,
    pub result: f64,
    pub correct: bool,
}

fn amount(caps: &regex::Captures<'_>, digits: usize) -> Option<f64> {
    parse_amount(
        caps.get(digits)?.as_str(),
        caps.get(digits + 1).map(|m| m.as_str()),
    )
}

/// Every arithmetic statement in `text`, each checked with the expression
/// evaluator. A stated result within 1% of the computed one counts as correct.
pub fn find_calculations(text: &str) -> Vec<Calculation> {
    RE_CALCULATION
        .captures_iter(text)
        .filter_map(|caps| {
            let left = amount(&caps, 1)?;
            let right = amount(&caps, 4)?;
            let stated = amount(&caps, 6)?;
            let op = match caps.get(3)?.as_str() {
                "x" | "X" | "×" | "*" => "*",
                "÷" | "/" => "/",
                other => other,
            };
            let computed = match eval(&format!("{left:?} {op} {right:?}")).ok()? {
                Value::Float(v) => v,
                Value::Int(v) => v as f64,
                _ => return None,
            };
            if !computed.is_finite() {
                return None;
            }
            Some(Calculation {
                expression: caps.get(0)?.as_str().trim().to_string(),
                result: stated,
                correct: (computed - stated).abs() <= (computed.abs() * 0.01).max(0.01),
            })
        })
        .collect()
}

pub fn mentions_numbers(text: &str) -> bool {
    text.chars().any(|c| c.is_ascii_digit())
}

/// Events produced by one turn, in a fixed order: idk handling, calculations,
/// benchmarks, then step movement.
pub fn detect_events(
    turn_number: u32,
    user_message: &str,
    user_signals: &UserSignals,
    agent_response: &str,
    previous: &StepTrackingState,
    current: &StepTrackingState,
    previous_agent_message: &str,
) -> Vec<ConversationEvent> {
    let timestamp = Utc::now();
    let mut kinds = Vec::new();

    if user_signals.said_i_dont_know && RE_ASSUMPTION.is_match(agent_response) {
        let mut topic = classify_topic(user_message);
        if topic == QuestionTopic::Other {
            topic = classify_topic(previous_agent_message);
        }
        kinds.push(EventKind::IdkProtocol { topic });
    }

    for calculation in find_calculations(agent_response) {
        kinds.push(EventKind::CalculationPerformed {
            expression: calculation.expression,
            result: calculation.result,
            correct: calculation.correct,
        });
    }

    if let Some(found) = RE_BENCHMARK.find(agent_response) {
        kinds.push(EventKind::BenchmarkCited {
            excerpt: found.as_str().trim().to_string(),
        });
    }

    if previous.current_step != current.current_step {
        kinds.push(EventKind::StepTransition {
            from: previous.current_step,
            to: current.current_step,
        });
    }

    for step in current.completed_steps.difference(&previous.completed_steps) {
        kinds.push(EventKind::StepCompletion { step: *step });
    }

    kinds
        .into_iter()
        .map(|kind| ConversationEvent {
            turn_number,
            timestamp,
            kind,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_a_correct_cac_calculation() {
        let calcs = find_calculations("With $750,000 / 5,000 = $150 per customer, the math works.");
        assert_eq!(calcs.len(), 1);
        assert_eq!(calcs[0].result, 150.0);
        assert!(calcs[0].correct);
    }

    #[test]
    fn flags_wrong_arithmetic_and_handles_suffixes() {
        let calcs = find_calculations("$500k x 2 = $2m");
        assert_eq!(calcs.len(), 1);
        assert!(!calcs[0].correct);

        let calcs = find_calculations("1,200 - 200 = 1,000");
        assert!(calcs[0].correct);
    }

    #[test]
    fn idk_protocol_and_benchmarks() {
        let state = StepTrackingState::new();
        let signals = UserSignals {
            said_i_dont_know: true,
            ..UserSignals::default()
        };
        let events = detect_events(
            3,
            "I don't know.",
            &signals,
            "No problem. A typical CAC in your category is around $120, so let's assume that for now.",
            &state,
            &state,
            "What is your CAC?",
        );
        let kinds: Vec<&str> = events.iter().map(|e| e.kind.label()).collect();
        assert_eq!(kinds, vec!["idk_protocol", "benchmark_cited"]);
        assert_eq!(events[0].kind, EventKind::IdkProtocol { topic: QuestionTopic::Cac });
    }

    #[test]
    fn step_movement() {
        let before = StepTrackingState::new();
        let mut after = before.clone();
        after.current_step = Step::Economics;
        after.completed_steps.insert(Step::Outcomes);
        let events = detect_events(2, "", &UserSignals::default(), "", &before, &after, "");
        assert_eq!(
            events.iter().map(|e| e.kind.clone()).collect::<Vec<_>>(),
            vec![
                EventKind::StepTransition { from: Step::Outcomes, to: Step::Economics },
                EventKind::StepCompletion { step: Step::Outcomes },
            ]
        );
    }
}
