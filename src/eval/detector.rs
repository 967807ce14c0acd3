//! Per-conversation failure detection.
//!
//! The detector keeps a short memory of the conversation (recent agent
//! questions, every fact the user has provided, the topic of any pending
//! "I don't know") and runs every configured [`FailureCondition`] against each
//! new agent response in a single ordered pass.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    error::EvalError,
    eval::scenario::{DetectionType, FailureCondition, Severity},
    extract::{normalize, questions, signals_uncertainty, UserSignals},
    workflow::{merge_data, DataField, ExtractedData, Step},
};

/// Everything a detection rule may look at for one turn.
#[derive(Debug, Clone, Copy)]
pub struct TurnContext<'a> {
    pub turn_number: u32,
    pub step: Step,
    pub user_message: &'a str,
    pub agent_response: &'a str,
    pub user_signals: UserSignals,
    /// Facts revealed in this turn's user message.
    pub extracted: &'a ExtractedData,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Number of recent agent questions remembered for loop detection.
    pub loop_window: usize,
    /// Occurrences of one topic inside the window that count as a loop.
    pub loop_threshold: usize,
    pub max_questions_per_response: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            loop_window: 8,
            loop_threshold: 6,
            max_questions_per_response: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionTopic {
    Budget,
    Volume,
    Kpi,
    Audience,
    Channel,
    Objective,
    Ltv,
    Cac,
    Margin,
    Other,
}

impl QuestionTopic {
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionTopic::Budget => "budget",
            QuestionTopic::Volume => "volume",
            QuestionTopic::Kpi => "kpi",
            QuestionTopic::Audience => "audience",
            QuestionTopic::Channel => "channel",
            QuestionTopic::Objective => "objective",
            QuestionTopic::Ltv => "ltv",
            QuestionTopic::Cac => "cac",
            QuestionTopic::Margin => "margin",
            QuestionTopic::Other => "other",
        }
    }
}

// Order matters: the unit-economics topics are checked before the broader
// budget and volume buckets that would otherwise swallow them.
static TOPIC_RULES: Lazy<Vec<(Regex, QuestionTopic)>> = Lazy::new(|| {
    [
        (r"\b(?:ltv|clv|lifetime value)\b", QuestionTopic::Ltv),
        (r"\b(?:cac|cpa|acquisition cost|cost per acquisition)\b", QuestionTopic::Cac),
        (r"\bmargins?\b", QuestionTopic::Margin),
        (r"\b(?:budget|spend|spending|invest|investment)\b", QuestionTopic::Budget),
        (
            r"\b(?:how many|volume|number of (?:leads|customers|sales|conversions)|target number)\b",
            QuestionTopic::Volume,
        ),
        (r"\b(?:kpis?|metrics?|measure success|success look)\b", QuestionTopic::Kpi),
        (
            r"\b(?:audiences?|demographics?|personas?|who (?:is|are) your|ideal customers?|target customers?)\b",
            QuestionTopic::Audience,
        ),
        (
            r"\b(?:channels?|platforms?|facebook|instagram|tiktok|linkedin|google|youtube|programmatic)\b",
            QuestionTopic::Channel,
        ),
        (r"\b(?:goals?|objectives?|achieve|outcomes?)\b", QuestionTopic::Objective),
    ]
    .into_iter()
    .map(|(pattern, topic)| (Regex::new(pattern).unwrap(), topic))
    .collect()
});

/// Buckets a question (or any text) into the first matching topic.
pub fn classify_topic(text: &str) -> QuestionTopic {
    let text = normalize(text);
    TOPIC_RULES
        .iter()
        .find(|(pattern, _)| pattern.is_match(&text))
        .map(|(_, topic)| *topic)
        .unwrap_or(QuestionTopic::Other)
}

/// Questions that ask for a specific field. A match is context loss when the
/// field is already known.
static FIELD_REQUESTS: Lazy<Vec<(Regex, DataField)>> = Lazy::new(|| {
    [
        (
            r"(?i)what.?s your (?:total |overall |monthly |annual )?budget|what is your (?:total |overall |monthly |annual )?budget|what budget|how much (?:are you|do you|can you|would you)(?: \w+)? (?:to )?(?:spend|invest)",
            DataField::Budget,
        ),
        (
            r"(?i)how many (?:new )?(?:leads|customers|conversions|sales|sign-?ups|orders)|what.?s your (?:volume )?target|what is your (?:volume )?target",
            DataField::VolumeTarget,
        ),
        (
            r"(?i)what.?s your (?:main |primary )?(?:goal|objective)|what (?:is|are) your (?:main |primary )?(?:goals?|objectives?)|what are you (?:trying|hoping|looking) to achieve",
            DataField::Objective,
        ),
        (
            r"(?i)what (?:kpi|metric)|which (?:kpi|metric)s?|how (?:will|do) you measure success",
            DataField::Kpi,
        ),
        (
            r"(?i)(?:what.?s|what is|do you know|can you share|could you share|how much is) your (?:average |customer |current )?(?:ltv|lifetime value)|what (?:ltv|lifetime value) do you",
            DataField::Ltv,
        ),
        (
            r"(?i)(?:what.?s|what is|do you know|can you share|could you share|how much is) your (?:average |target |current |blended )?(?:cac|cpa|customer acquisition cost|acquisition cost)|what (?:cac|cpa) (?:are|do) you|how much does it cost (?:you )?to acquire",
            DataField::Cac,
        ),
        (
            r"(?i)(?:what.?s|what is|what are|do you know|can you share|could you share) your (?:gross |net |profit |average )?margins?|what margins? do you|how much margin",
            DataField::Margin,
        ),
        (
            r"(?i)who (?:is|are) your (?:target )?(?:audience|customers?)|describe your (?:target )?audience|what audience",
            DataField::Audience,
        ),
    ]
    .into_iter()
    .map(|(pattern, field)| (Regex::new(pattern).unwrap(), field))
    .collect()
});

static RE_PUSHING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:what is|what's|what are|can you tell|could you share|can you share|do you know|please provide|i need|i'll need|roughly|ballpark|even an estimate)\b",
    )
    .unwrap()
});

static RE_CHANNEL_TACTICS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:facebook|instagram|tiktok|linkedin|google ads|youtube|programmatic|display ads|ctv|channel mix|media mix|ad formats?|creatives?|bidding|placements?)\b",
    )
    .unwrap()
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFailure {
    pub name: String,
    pub detection: String,
    pub severity: Severity,
    pub score_penalty: f64,
    pub terminate: bool,
    pub turn_number: u32,
    pub evidence: String,
}

#[derive(Debug, Clone)]
struct AskedQuestion {
    text: String,
    topic: QuestionTopic,
}

struct Rule {
    condition: FailureCondition,
    pattern: Option<Regex>,
}

pub struct FailureDetector {
    config: DetectorConfig,
    rules: Vec<Rule>,
    recent_questions: VecDeque<AskedQuestion>,
    provided: ExtractedData,
    last_agent_topics: BTreeSet<QuestionTopic>,
    pending_idk: BTreeSet<QuestionTopic>,
}

impl FailureDetector {
    pub fn new(
        conditions: Vec<FailureCondition>,
        config: DetectorConfig,
    ) -> Result<Self, EvalError> {
        if config.loop_window == 0 || config.loop_threshold == 0 {
            return Err(EvalError::Config(
                "loop window and threshold must be at least 1".to_string(),
            ));
        }
        let rules = conditions
            .into_iter()
            .map(|condition| -> Result<Rule, EvalError> {
                let pattern = match &condition.detection {
                    DetectionType::Pattern { pattern, .. } => Some(Regex::new(pattern).map_err(|e| {
                        EvalError::Config(format!("failure rule {}: {e}", condition.name))
                    })?),
                    _ => None,
                };
                Ok(Rule { condition, pattern })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            config,
            rules,
            recent_questions: VecDeque::with_capacity(config.loop_window),
            provided: ExtractedData::new(),
            last_agent_topics: BTreeSet::new(),
            pending_idk: BTreeSet::new(),
        })
    }

    /// A detector running only the built-in rules.
    pub fn with_defaults() -> Self {
        Self {
            config: DetectorConfig::default(),
            rules: FailureCondition::builtin_defaults()
                .into_iter()
                .map(|condition| Rule {
                    pattern: match &condition.detection {
                        DetectionType::Pattern { pattern, .. } => Regex::new(pattern).ok(),
                        _ => None,
                    },
                    condition,
                })
                .collect(),
            recent_questions: VecDeque::new(),
            provided: ExtractedData::new(),
            last_agent_topics: BTreeSet::new(),
            pending_idk: BTreeSet::new(),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Facts the user has provided so far.
    pub fn provided_data(&self) -> &ExtractedData {
        &self.provided
    }

    /// Adds facts known to the agent outside the normal turn flow.
    pub fn record_provided(&mut self, data: &ExtractedData) {
        merge_data(&mut self.provided, data);
    }

    pub fn reset(&mut self) {
        self.recent_questions.clear();
        self.provided.clear();
        self.last_agent_topics.clear();
        self.pending_idk.clear();
    }

    /// Runs every rule against the new agent response and updates the
    /// detector's memory. Rules are independent; one turn may trip several.
    pub fn detect_failures(&mut self, ctx: &TurnContext<'_>) -> Vec<DetectedFailure> {
        merge_data(&mut self.provided, ctx.extracted);

        let asked: Vec<AskedQuestion> = questions(ctx.agent_response)
            .into_iter()
            .map(|q| AskedQuestion {
                topic: classify_topic(&q),
                text: normalize(&q),
            })
            .collect();
        for question in &asked {
            if self.recent_questions.len() == self.config.loop_window {
                self.recent_questions.pop_front();
            }
            self.recent_questions.push_back(question.clone());
        }

        let mut failures = Vec::new();
        for rule in &self.rules {
            if let Some(evidence) = self.evaluate(rule, ctx, &asked) {
                failures.push(DetectedFailure {
                    name: rule.condition.name.clone(),
                    detection: rule.condition.detection.label().to_string(),
                    severity: rule.condition.severity,
                    score_penalty: rule.condition.score_penalty,
                    terminate: rule.condition.stops_conversation(),
                    turn_number: ctx.turn_number,
                    evidence,
                });
            }
        }

        self.pending_idk.clear();
        if ctx.user_signals.said_i_dont_know || signals_uncertainty(ctx.user_message) {
            let topic = classify_topic(ctx.user_message);
            if topic != QuestionTopic::Other {
                self.pending_idk.insert(topic);
            } else {
                self.pending_idk.extend(self.last_agent_topics.iter().copied());
            }
        }
        self.last_agent_topics = asked
            .iter()
            .map(|q| q.topic)
            .filter(|topic| *topic != QuestionTopic::Other)
            .collect();

        failures
    }

    /// True once any topic fills the loop threshold inside the question window.
    pub fn check_loop_detection(&self) -> bool {
        self.looping_topic().is_some()
    }

    fn looping_topic(&self) -> Option<(QuestionTopic, usize)> {
        let mut counts: BTreeMap<QuestionTopic, usize> = BTreeMap::new();
        for question in &self.recent_questions {
            if question.topic != QuestionTopic::Other {
                *counts.entry(question.topic).or_insert(0) += 1;
            }
        }
        counts
            .into_iter()
            .filter(|(_, count)| *count >= self.config.loop_threshold)
            .max_by_key(|(_, count)| *count)
    }

    fn evaluate(
        &self,
        rule: &Rule,
        ctx: &TurnContext<'_>,
        asked: &[AskedQuestion],
    ) -> Option<String> {
        match &rule.condition.detection {
            DetectionType::Pattern { min_turn, .. } => {
                if ctx.turn_number < min_turn.unwrap_or(1) {
                    return None;
                }
                let found = rule.pattern.as_ref()?.find(ctx.agent_response)?;
                Some(format!("matched \"{}\"", found.as_str().trim()))
            }
            DetectionType::ExcessiveQuestions => {
                let count = ctx.agent_response.matches('?').count();
                (count > self.config.max_questions_per_response)
                    .then(|| format!("{count} questions in one response"))
            }
            DetectionType::StepBoundaryViolation => {
                if ctx.step > Step::Economics {
                    return None;
                }
                let found = RE_CHANNEL_TACTICS.find(ctx.agent_response)?;
                Some(format!(
                    "mentioned \"{}\" during step {}",
                    found.as_str(),
                    ctx.step
                ))
            }
            DetectionType::ContextLoss => asked.iter().find_map(|question| {
                FIELD_REQUESTS
                    .iter()
                    .find(|(pattern, field)| {
                        self.provided.contains_key(field) && pattern.is_match(&question.text)
                    })
                    .map(|(_, field)| {
                        format!("asked for {field} already provided: \"{}\"", question.text)
                    })
            }),
            DetectionType::LoopDetection => {
                let (topic, count) = self.looping_topic()?;
                asked
                    .iter()
                    .any(|q| q.topic == topic)
                    .then(|| {
                        format!(
                            "{count} {} questions in the last {} asked",
                            topic.as_str(),
                            self.recent_questions.len()
                        )
                    })
            }
            DetectionType::BlockedProgress => {
                if self.pending_idk.is_empty() {
                    return None;
                }
                asked
                    .iter()
                    .find(|q| self.pending_idk.contains(&q.topic) && RE_PUSHING.is_match(&q.text))
                    .map(|q| {
                        format!(
                            "re-asked {} after the user said they don't know: \"{}\"",
                            q.topic.as_str(),
                            q.text
                        )
                    })
            }
            DetectionType::Custom { check } => check
                .evaluate(ctx)
                .then(|| "custom check matched".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::FieldValue;

    fn ctx<'a>(
        turn: u32,
        user: &'a str,
        agent: &'a str,
        extracted: &'a ExtractedData,
    ) -> TurnContext<'a> {
        TurnContext {
            turn_number: turn,
            step: Step::Outcomes,
            user_message: user,
            agent_response: agent,
            user_signals: crate::extract::classify_user_signals(user),
            extracted,
        }
    }

    fn names(failures: &[DetectedFailure]) -> Vec<&str> {
        failures.iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn topics_prefer_unit_economics() {
        assert_eq!(classify_topic("What is your CAC?"), QuestionTopic::Cac);
        assert_eq!(
            classify_topic("What budget do you have for LTV modelling?"),
            QuestionTopic::Ltv
        );
        assert_eq!(classify_topic("What's your budget?"), QuestionTopic::Budget);
        assert_eq!(classify_topic("Who are your target customers?"), QuestionTopic::Audience);
        assert_eq!(classify_topic("How are you today?"), QuestionTopic::Other);
    }

    #[test]
    fn loop_flags_on_sixth_repeat_only() {
        let mut detector = FailureDetector::with_defaults();
        let empty = ExtractedData::new();
        for turn in 1..=5 {
            let failures =
                detector.detect_failures(&ctx(turn, "ok", "What is your budget?", &empty));
            assert!(!detector.check_loop_detection(), "flagged early on turn {turn}");
            assert!(!names(&failures).contains(&"loop-detection"));
        }
        let failures = detector.detect_failures(&ctx(6, "ok", "What is your budget?", &empty));
        assert!(detector.check_loop_detection());
        let looped = failures.iter().find(|f| f.name == "loop-detection").unwrap();
        assert_eq!(looped.severity, Severity::Critical);
        assert!(looped.terminate);
    }

    #[test]
    fn other_questions_never_count_towards_loops() {
        let mut detector = FailureDetector::with_defaults();
        let empty = ExtractedData::new();
        for turn in 1..=10 {
            detector.detect_failures(&ctx(turn, "ok", "Does that make sense?", &empty));
        }
        assert!(!detector.check_loop_detection());
    }

    #[test]
    fn context_loss_needs_the_field_to_be_known() {
        let mut provided = ExtractedData::new();
        provided.insert(DataField::Budget, FieldValue::Number(500_000.0));
        let empty = ExtractedData::new();

        let mut detector = FailureDetector::with_defaults();
        detector.record_provided(&provided);
        let failures =
            detector.detect_failures(&ctx(2, "ok", "Thanks. What's your budget?", &empty));
        let lost = failures.iter().find(|f| f.name == "context-loss").unwrap();
        assert_eq!(lost.severity, Severity::Major);

        let mut detector = FailureDetector::with_defaults();
        let failures =
            detector.detect_failures(&ctx(2, "ok", "Thanks. What's your budget?", &empty));
        assert!(!names(&failures).contains(&"context-loss"));
    }

    #[test]
    fn mentioning_a_known_value_is_not_asking_for_it() {
        let mut provided = ExtractedData::new();
        provided.insert(DataField::Ltv, FieldValue::Number(600.0));
        provided.insert(DataField::Cac, FieldValue::Number(150.0));
        provided.insert(DataField::Margin, FieldValue::Number(40.0));
        let empty = ExtractedData::new();

        let mut detector = FailureDetector::with_defaults();
        detector.record_provided(&provided);
        let failures = detector.detect_failures(&ctx(
            3,
            "ok",
            "With your LTV of $600 against a $150 CAC, who is the ideal buyer you want to reach first?",
            &empty,
        ));
        assert!(!names(&failures).contains(&"context-loss"));
        let failures = detector.detect_failures(&ctx(
            4,
            "ok",
            "Your 40% margin leaves room to test. Which region should we start with?",
            &empty,
        ));
        assert!(!names(&failures).contains(&"context-loss"));

        for question in [
            "What is your CAC?",
            "Do you know your lifetime value?",
            "What are your margins?",
        ] {
            let mut detector = FailureDetector::with_defaults();
            detector.record_provided(&provided);
            let failures = detector.detect_failures(&ctx(5, "ok", question, &empty));
            assert!(names(&failures).contains(&"context-loss"), "{question}");
        }
    }

    #[test]
    fn blocked_progress_after_i_dont_know() {
        let mut detector = FailureDetector::with_defaults();
        let empty = ExtractedData::new();
        detector.detect_failures(&ctx(2, "Budget is set.", "What is your CAC?", &empty));
        let failures = detector.detect_failures(&ctx(
            3,
            "I don't know.",
            "No problem, we can work with a benchmark for now.",
            &empty,
        ));
        assert!(!names(&failures).contains(&"blocked-progress-idk"));

        let mut detector = FailureDetector::with_defaults();
        detector.detect_failures(&ctx(2, "Budget is set.", "What is your CAC?", &empty));
        detector.detect_failures(&ctx(3, "I don't know.", "Got it.", &empty));
        let failures =
            detector.detect_failures(&ctx(4, "Okay.", "Sure, but what is your CAC?", &empty));
        let blocked = failures.iter().find(|f| f.name == "blocked-progress-idk").unwrap();
        assert_eq!(blocked.severity, Severity::Major);
        assert_eq!(blocked.score_penalty, 0.10);
    }

    #[test]
    fn several_rules_can_fire_on_one_turn() {
        let mut detector = FailureDetector::with_defaults();
        let empty = ExtractedData::new();
        let failures = detector.detect_failures(&ctx(
            2,
            "We sell shoes.",
            "Hello again! Should we use TikTok? What about Instagram? And your budget?",
            &empty,
        ));
        let fired = names(&failures);
        assert!(fired.contains(&"greeting-repetition"));
        assert!(fired.contains(&"excessive-questions"));
        assert!(fired.contains(&"step-boundary-violation"));
    }

    #[test]
    fn greeting_is_fine_on_first_turn_and_reset_clears_memory() {
        let mut detector = FailureDetector::with_defaults();
        let mut provided = ExtractedData::new();
        provided.insert(DataField::Budget, FieldValue::Number(1.0));
        let failures =
            detector.detect_failures(&ctx(1, "Budget is $1", "Hello! Happy to help.", &provided));
        assert!(failures.is_empty());
        assert!(!detector.provided_data().is_empty());
        detector.reset();
        assert!(detector.provided_data().is_empty());
    }

    #[test]
    fn rejects_invalid_pattern_rules() {
        let condition = FailureCondition::new(
            "broken",
            DetectionType::Pattern { pattern: "(".into(), min_turn: None },
            Severity::Warning,
        );
        assert!(FailureDetector::new(vec![condition], DetectorConfig::default()).is_err());
    }
}
