use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::workflow::{merge_data, ExtractedData, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    WorkflowComplete,
    ExpectedStepsComplete,
    CriticalFailure,
    MaxTurnsReached,
}

/// Data collected for one step and whether it satisfies that step's
/// minimum-viable rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepData {
    pub fields: ExtractedData,
    pub minimum_viable_met: bool,
    pub completed_at_turn: Option<u32>,
}

/// Workflow progress for one conversation. Every update produces a new value;
/// snapshots stored on turns are never touched again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTrackingState {
    pub current_step: Step,
    pub completed_steps: BTreeSet<Step>,
    pub step_turn_counts: BTreeMap<Step, u32>,
    pub step_data: BTreeMap<Step, StepData>,
    pub is_terminal: bool,
    pub terminal_reason: Option<TerminalReason>,
}

impl Default for StepTrackingState {
    fn default() -> Self {
        Self::new()
    }
}

impl StepTrackingState {
    pub fn new() -> Self {
        Self {
            current_step: Step::Outcomes,
            completed_steps: BTreeSet::new(),
            step_turn_counts: BTreeMap::new(),
            step_data: BTreeMap::new(),
            is_terminal: false,
            terminal_reason: None,
        }
    }

    pub fn is_complete(&self, step: Step) -> bool {
        self.completed_steps.contains(&step)
    }

    pub fn data_for(&self, step: Step) -> Option<&StepData> {
        self.step_data.get(&step)
    }

    /// Every field collected so far, across steps.
    pub fn all_data(&self) -> ExtractedData {
        let mut all = ExtractedData::new();
        for data in self.step_data.values() {
            merge_data(&mut all, &data.fields);
        }
        all
    }

    pub fn turns_in(&self, step: Step) -> u32 {
        self.step_turn_counts.get(&step).copied().unwrap_or(0)
    }

    /// Marks the state terminal. The first reason recorded sticks.
    pub fn terminated(mut self, reason: TerminalReason) -> Self {
        if !self.is_terminal {
            self.is_terminal = true;
            self.terminal_reason = Some(reason);
        }
        self
    }
}

struct StepCue {
    step: Step,
    pattern: Regex,
}

fn cue(step: Step, pattern: &str) -> StepCue {
    StepCue {
        step,
        pattern: Regex::new(pattern).unwrap(),
    }
}

static STEP_CUES: Lazy<Vec<StepCue>> = Lazy::new(|| {
    vec![
        cue(
            Step::Outcomes,
            r"(?i)\b(?:objectives?|goals?|outcomes?|achieve|kpis?|success look|volume target|how many (?:leads|customers|sales|conversions))\b",
        ),
        cue(
            Step::Economics,
            r"(?i)\b(?:budget|spend|ltv|lifetime value|cac|acquisition cost|margins?|unit economics|cpa|payback)\b",
        ),
        cue(
            Step::Audience,
            r"(?i)\b(?:audiences?|demographics?|personas?|ideal customer|target customers?|who (?:are|is) your)\b",
        ),
        cue(
            Step::Geography,
            r"(?i)\b(?:geograph\w*|regions?|markets?|countries|country|cities|city|locations?|nationwide|national)\b",
        ),
        cue(
            Step::Timing,
            r"(?i)\b(?:timeline|timing|launch date|flight(?:ing)?|seasonal\w*|quarter|q[1-4]|start date|how long)\b",
        ),
        cue(
            Step::ChannelMix,
            r"(?i)\b(?:channels?|platforms?|google ads|paid search|paid social|meta|facebook|instagram|tiktok|linkedin|youtube|programmatic|ctv|display)\b",
        ),
        cue(
            Step::Creative,
            r"(?i)\b(?:creatives?|ad formats?|video assets?|copy|messaging|assets)\b",
        ),
        cue(
            Step::Measurement,
            r"(?i)\b(?:measure(?:ment)?|tracking|attribution|pixel|analytics|reporting|dashboards?)\b",
        ),
        cue(
            Step::Forecast,
            r"(?i)\b(?:forecast\w*|projections?|projected|expected results|scenarios?)\b",
        ),
        cue(
            Step::PlanReview,
            r"(?i)\b(?:plan summary|final plan|summari[sz]e|recap|approve|sign off|next steps|finali[sz]e)\b",
        ),
    ]
});

static RE_REVISIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:go back|back to|revisit|return to|change (?:my|our|the)|update (?:my|our|the)|actually,? (?:our|my|the))\b",
    )
    .unwrap()
});

const USER_WEIGHT: usize = 2;
const AGENT_WEIGHT: usize = 1;

fn cue_scores(text: &str, weight: usize, scores: &mut BTreeMap<Step, usize>) {
    for cue in STEP_CUES.iter() {
        let hits = cue.pattern.find_iter(text).count();
        if hits > 0 {
            *scores.entry(cue.step).or_insert(0) += hits * weight;
        }
    }
}

/// Infers workflow position and folds each turn's data into the tracking state.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepTracker;

impl StepTracker {
    pub fn new() -> Self {
        Self
    }

    /// Which step the latest exchange belongs to. Stays on the current step
    /// unless a later one is cued more strongly; moves back only when the user
    /// explicitly revisits an earlier topic.
    pub fn detect_current_step(
        &self,
        user_message: &str,
        prior_agent_message: &str,
        state: &StepTrackingState,
    ) -> Step {
        let current = state.current_step;

        if RE_REVISIT.is_match(user_message) {
            let mut user_only = BTreeMap::new();
            cue_scores(user_message, 1, &mut user_only);
            let revisited = user_only
                .iter()
                .filter(|(step, _)| **step < current)
                .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
                .map(|(step, _)| *step);
            if let Some(step) = revisited {
                return step;
            }
        }

        let mut scores = BTreeMap::new();
        cue_scores(user_message, USER_WEIGHT, &mut scores);
        cue_scores(prior_agent_message, AGENT_WEIGHT, &mut scores);

        let current_score = scores.get(&current).copied().unwrap_or(0);
        // Highest score wins; on ties the nearest step ahead is preferred.
        let best = scores
            .iter()
            .filter(|(step, _)| **step > current)
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)));

        match best {
            Some((step, score)) if *score > current_score => *step,
            _ => current,
        }
    }

    /// Returns the state after one turn: the detected step becomes current, its
    /// turn count grows, extracted fields land in their owning step's record and
    /// any step whose minimum-viable rule now holds is completed at `turn_number`.
    pub fn update_state(
        &self,
        state: &StepTrackingState,
        step: Step,
        _user_message: &str,
        _agent_message: &str,
        extracted: &ExtractedData,
        turn_number: u32,
    ) -> StepTrackingState {
        let mut next = state.clone();
        next.current_step = step;
        *next.step_turn_counts.entry(step).or_insert(0) += 1;

        for (field, value) in extracted {
            next.step_data
                .entry(field.owner())
                .or_default()
                .fields
                .insert(*field, value.clone());
        }

        for candidate in Step::ALL {
            let Some(data) = next.step_data.get_mut(&candidate) else {
                continue;
            };
            if data.minimum_viable_met {
                continue;
            }
            if candidate.minimum_viable().is_met(&data.fields) {
                data.minimum_viable_met = true;
                data.completed_at_turn = Some(turn_number);
                next.completed_steps.insert(candidate);
            }
        }

        if next.completed_steps.len() == Step::ALL.len() {
            next = next.terminated(TerminalReason::WorkflowComplete);
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{extract::extract_user_data, workflow::DataField};

    #[test]
    fn defaults_to_previous_step_without_cues() {
        let tracker = StepTracker::new();
        let mut state = StepTrackingState::new();
        state.current_step = Step::Audience;
        assert_eq!(
            tracker.detect_current_step("Sure, sounds fine.", "Great, thanks!", &state),
            Step::Audience
        );
    }

    #[test]
    fn advances_when_a_later_step_is_cued() {
        let tracker = StepTracker::new();
        let state = StepTrackingState::new();
        let step = tracker.detect_current_step(
            "Our budget is $200k for the year.",
            "What budget are you working with?",
            &state,
        );
        assert_eq!(step, Step::Economics);
    }

    #[test]
    fn does_not_regress_without_explicit_revisit() {
        let tracker = StepTracker::new();
        let mut state = StepTrackingState::new();
        state.current_step = Step::ChannelMix;
        let step = tracker.detect_current_step("The budget is fixed.", "", &state);
        assert_eq!(step, Step::ChannelMix);

        let step = tracker.detect_current_step("Can we go back to the budget?", "", &state);
        assert_eq!(step, Step::Economics);
    }

    #[test]
    fn completes_step_once_minimum_viable_holds() {
        let tracker = StepTracker::new();
        let state = StepTrackingState::new();

        let first = extract_user_data("Our goal is lead generation and we want 2,000 leads.");
        let s1 = tracker.update_state(&state, Step::Outcomes, "", "", &first, 1);
        assert!(!s1.is_complete(Step::Outcomes));
        assert_eq!(s1.turns_in(Step::Outcomes), 1);

        let second = extract_user_data("KPI is cost per lead.");
        let s2 = tracker.update_state(&s1, Step::Outcomes, "", "", &second, 2);
        assert!(s2.is_complete(Step::Outcomes));
        assert_eq!(s2.data_for(Step::Outcomes).unwrap().completed_at_turn, Some(2));

        // the input state is untouched
        assert!(!s1.is_complete(Step::Outcomes));
    }

    #[test]
    fn minimum_viable_is_monotone() {
        let tracker = StepTracker::new();
        let mut state = StepTrackingState::new();
        let mut completed_sizes = Vec::new();
        let turns = [
            "Our objective is brand awareness, KPI is CPM, and we want 10,000 signups.",
            "Budget is $300k and our margin is 35%.",
            "",
            "Actually, go back to goals for a second.",
            "Our audience is new parents in their 30s.",
        ];
        for (i, text) in turns.iter().enumerate() {
            let turn = i as u32 + 1;
            let step = tracker.detect_current_step(text, "", &state);
            state = tracker.update_state(&state, step, text, "", &extract_user_data(text), turn);
            completed_sizes.push(state.completed_steps.len());
            for step in &state.completed_steps {
                assert!(state.data_for(*step).unwrap().minimum_viable_met);
            }
        }
        assert!(completed_sizes.windows(2).all(|w| w[0] <= w[1]));
        assert!(state.is_complete(Step::Outcomes));
        assert!(state.is_complete(Step::Economics));
        assert!(state.is_complete(Step::Audience));
        assert_eq!(state.data_for(Step::Outcomes).unwrap().completed_at_turn, Some(1));
    }

    #[test]
    fn routes_fields_to_their_owning_step() {
        let tracker = StepTracker::new();
        let mut data = ExtractedData::new();
        data.insert(DataField::Budget, crate::workflow::FieldValue::Number(1.0));
        let state =
            tracker.update_state(&StepTrackingState::new(), Step::Audience, "", "", &data, 1);
        assert!(state.data_for(Step::Economics).unwrap().fields.contains_key(&DataField::Budget));
        assert_eq!(state.current_step, Step::Audience);
    }
}
