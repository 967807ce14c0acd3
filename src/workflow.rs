//! Closed vocabularies shared by every part of the harness: the ten workflow
//! steps and the data fields a planning conversation collects.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

/// One of the ten stages a planning agent walks a user through.
///
/// Serialised as its number (1..=10) so scenario files can write `[1, 2, 3]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Step {
    Outcomes = 1,
    Economics = 2,
    Audience = 3,
    Geography = 4,
    Timing = 5,
    ChannelMix = 6,
    Creative = 7,
    Measurement = 8,
    Forecast = 9,
    PlanReview = 10,
}

impl Step {
    pub const ALL: [Step; 10] = [
        Step::Outcomes,
        Step::Economics,
        Step::Audience,
        Step::Geography,
        Step::Timing,
        Step::ChannelMix,
        Step::Creative,
        Step::Measurement,
        Step::Forecast,
        Step::PlanReview,
    ];

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn from_number(number: u8) -> Option<Step> {
        Step::ALL.get(usize::from(number).checked_sub(1)?).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Step::Outcomes => "outcomes",
            Step::Economics => "economics",
            Step::Audience => "audience",
            Step::Geography => "geography",
            Step::Timing => "timing",
            Step::ChannelMix => "channel mix",
            Step::Creative => "creative",
            Step::Measurement => "measurement",
            Step::Forecast => "forecast",
            Step::PlanReview => "plan review",
        }
    }

    /// Fields that must all be present (or, for `any_of`, at least one) before
    /// the step counts as complete.
    pub fn minimum_viable(self) -> MinimumViable {
        use DataField::*;
        match self {
            Step::Outcomes => MinimumViable::all(&[Objective, Kpi, VolumeTarget]),
            Step::Economics => MinimumViable::all(&[Budget]).or_any(&[Cac, Ltv, Margin]),
            Step::Audience => MinimumViable::all(&[Audience]),
            Step::Geography => MinimumViable::all(&[Geography]),
            Step::Timing => MinimumViable::all(&[Timeline]),
            Step::ChannelMix => MinimumViable::all(&[Channels]),
            Step::Creative => MinimumViable::all(&[CreativeFormats]),
            Step::Measurement => MinimumViable::all(&[Measurement]),
            Step::Forecast => MinimumViable::all(&[Forecast]),
            Step::PlanReview => MinimumViable::all(&[Approval]),
        }
    }
}

impl From<Step> for u8 {
    fn from(step: Step) -> u8 {
        step.number()
    }
}

impl TryFrom<u8> for Step {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Step::from_number(value)
            .ok_or_else(|| format!("step must be between 1 and 10, got {value}"))
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.number(), self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinimumViable {
    pub all_of: &'static [DataField],
    pub any_of: &'static [DataField],
}

impl MinimumViable {
    fn all(fields: &'static [DataField]) -> Self {
        Self {
            all_of: fields,
            any_of: &[],
        }
    }

    fn or_any(mut self, fields: &'static [DataField]) -> Self {
        self.any_of = fields;
        self
    }

    pub fn is_met(&self, data: &ExtractedData) -> bool {
        self.all_of.iter().all(|field| data.contains_key(field))
            && (self.any_of.is_empty() || self.any_of.iter().any(|field| data.contains_key(field)))
    }
}

/// Facts a planning conversation collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataField {
    Objective,
    Kpi,
    VolumeTarget,
    Budget,
    Cac,
    Ltv,
    Margin,
    Audience,
    Geography,
    Timeline,
    Channels,
    CreativeFormats,
    Measurement,
    Forecast,
    Approval,
}

impl DataField {
    /// The step whose collected-data record holds this field.
    pub fn owner(self) -> Step {
        match self {
            DataField::Objective | DataField::Kpi | DataField::VolumeTarget => Step::Outcomes,
            DataField::Budget | DataField::Cac | DataField::Ltv | DataField::Margin => {
                Step::Economics
            }
            DataField::Audience => Step::Audience,
            DataField::Geography => Step::Geography,
            DataField::Timeline => Step::Timing,
            DataField::Channels => Step::ChannelMix,
            DataField::CreativeFormats => Step::Creative,
            DataField::Measurement => Step::Measurement,
            DataField::Forecast => Step::Forecast,
            DataField::Approval => Step::PlanReview,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataField::Objective => "objective",
            DataField::Kpi => "kpi",
            DataField::VolumeTarget => "volume_target",
            DataField::Budget => "budget",
            DataField::Cac => "cac",
            DataField::Ltv => "ltv",
            DataField::Margin => "margin",
            DataField::Audience => "audience",
            DataField::Geography => "geography",
            DataField::Timeline => "timeline",
            DataField::Channels => "channels",
            DataField::CreativeFormats => "creative_formats",
            DataField::Measurement => "measurement",
            DataField::Forecast => "forecast",
            DataField::Approval => "approval",
        }
    }
}

impl fmt::Display for DataField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Flag(value) => write!(f, "{value}"),
            FieldValue::Number(value) => write!(f, "{value}"),
            FieldValue::Text(value) => f.write_str(value),
        }
    }
}

pub type ExtractedData = BTreeMap<DataField, FieldValue>;

/// Adds every field of `incoming` to `target`; newer values overwrite, nothing is removed.
pub fn merge_data(target: &mut ExtractedData, incoming: &ExtractedData) {
    for (field, value) in incoming {
        target.insert(*field, value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_numbers_round_trip() {
        for step in Step::ALL {
            assert_eq!(Step::from_number(step.number()), Some(step));
        }
        assert_eq!(Step::from_number(0), None);
        assert_eq!(Step::from_number(11), None);
    }

    #[test]
    fn steps_deserialize_from_integers() {
        let steps: Vec<Step> = serde_yaml::from_str("[1, 2, 10]").unwrap();
        assert_eq!(steps, vec![Step::Outcomes, Step::Economics, Step::PlanReview]);
        assert!(serde_yaml::from_str::<Vec<Step>>("[11]").is_err());
    }

    #[test]
    fn economics_needs_budget_and_one_unit_metric() {
        let rule = Step::Economics.minimum_viable();
        let mut data = ExtractedData::new();
        data.insert(DataField::Budget, FieldValue::Number(500_000.0));
        assert!(!rule.is_met(&data));
        data.insert(DataField::Margin, FieldValue::Number(40.0));
        assert!(rule.is_met(&data));
    }

    #[test]
    fn every_field_is_owned_by_a_step_that_can_use_it() {
        for step in Step::ALL {
            let rule = step.minimum_viable();
            for field in rule.all_of.iter().chain(rule.any_of) {
                assert_eq!(field.owner(), step, "{field} routed to the wrong step");
            }
        }
    }
}
