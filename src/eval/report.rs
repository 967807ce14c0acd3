use std::{collections::BTreeMap, fmt, fs, path::Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::EvalError,
    eval::{
        engine::{ConversationResult, FailureCounts},
        steps::TerminalReason,
    },
    workflow::Step,
};

pub const DEFAULT_REGRESSION_THRESHOLD: f64 = 0.05;

/// Absorbs float noise so a drop of exactly `threshold` stays inside the band.
const THRESHOLD_EPSILON: f64 = 1e-9;

fn dropped_beyond(delta: f64, threshold: f64) -> bool {
    delta < -(threshold + THRESHOLD_EPSILON)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Passed,
    Failed,
    /// An external call failed; the scenario is left out of pass/fail totals.
    Errored,
}

impl fmt::Display for ScenarioStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioStatus::Passed => f.write_str("passed"),
            ScenarioStatus::Failed => f.write_str("failed"),
            ScenarioStatus::Errored => f.write_str("errored"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub id: String,
    pub name: String,
    pub status: ScenarioStatus,
    pub composite_score: f64,
    pub completed_steps: Vec<Step>,
    pub failure_counts: FailureCounts,
    pub turns: u32,
    pub duration_ms: u64,
    #[serde(default)]
    pub terminal_reason: Option<TerminalReason>,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ScenarioReport {
    pub fn from_result(result: &ConversationResult) -> Self {
        Self {
            id: result.scenario_id.clone(),
            name: result.scenario_name.clone(),
            status: if result.passed() {
                ScenarioStatus::Passed
            } else {
                ScenarioStatus::Failed
            },
            composite_score: result.composite_score,
            completed_steps: result.final_state.completed_steps.iter().copied().collect(),
            failure_counts: result.failure_counts,
            turns: result.metadata.total_turns,
            duration_ms: result.metadata.duration_ms,
            terminal_reason: result.metadata.terminal_reason,
            reasons: result.verdict.reasons.clone(),
            error: None,
        }
    }

    pub fn errored(
        id: impl Into<String>,
        name: impl Into<String>,
        error: impl fmt::Display,
        duration_ms: u64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: ScenarioStatus::Errored,
            composite_score: 0.0,
            completed_steps: Vec::new(),
            failure_counts: FailureCounts::default(),
            turns: 0,
            duration_ms,
            terminal_reason: None,
            reasons: Vec::new(),
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    /// Passed over passed + failed; errored scenarios don't count.
    pub pass_rate: f64,
    /// Mean composite score over scenarios that ran to completion.
    pub average_score: f64,
    pub scenarios: Vec<ScenarioReport>,
}

impl EvalReport {
    /// Builds the aggregate view. Scenarios are sorted by id; an empty run
    /// reports zero rates.
    pub fn from_scenarios(mut scenarios: Vec<ScenarioReport>) -> Self {
        scenarios.sort_by(|a, b| a.id.cmp(&b.id));

        let count =
            |status: ScenarioStatus| scenarios.iter().filter(|s| s.status == status).count();
        let passed = count(ScenarioStatus::Passed);
        let failed = count(ScenarioStatus::Failed);
        let errored = count(ScenarioStatus::Errored);
        let scored = passed + failed;

        let (pass_rate, average_score) = if scored == 0 {
            (0.0, 0.0)
        } else {
            let sum: f64 = scenarios
                .iter()
                .filter(|s| s.status != ScenarioStatus::Errored)
                .map(|s| s.composite_score)
                .sum();
            (passed as f64 / scored as f64, sum / scored as f64)
        };

        Self {
            generated_at: Utc::now(),
            total: scenarios.len(),
            passed,
            failed,
            errored,
            pass_rate,
            average_score,
            scenarios,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.errored == 0
    }

    pub fn scenario(&self, id: &str) -> Option<&ScenarioReport> {
        self.scenarios.iter().find(|s| s.id == id)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), EvalError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| EvalError::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|e| EvalError::io(path, e))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EvalError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| EvalError::io(path, e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Field-by-field comparison against an earlier run. Any drop larger than
    /// `threshold`, or a scenario that stopped passing, is a regression.
    pub fn compare(&self, baseline: &EvalReport, threshold: f64) -> RegressionReport {
        let current: BTreeMap<&str, &ScenarioReport> =
            self.scenarios.iter().map(|s| (s.id.as_str(), s)).collect();
        let previous: BTreeMap<&str, &ScenarioReport> =
            baseline.scenarios.iter().map(|s| (s.id.as_str(), s)).collect();

        let scenarios = current
            .iter()
            .filter_map(|(id, now)| {
                let before = previous.get(id)?;
                let delta = now.composite_score - before.composite_score;
                let stopped_passing =
                    before.status == ScenarioStatus::Passed && now.status != ScenarioStatus::Passed;
                Some(ScenarioDelta {
                    id: id.to_string(),
                    baseline_status: before.status,
                    current_status: now.status,
                    baseline: before.composite_score,
                    current: now.composite_score,
                    delta,
                    regressed: stopped_passing || dropped_beyond(delta, threshold),
                })
            })
            .collect();

        RegressionReport {
            threshold,
            pass_rate: MetricDelta::new(baseline.pass_rate, self.pass_rate, threshold),
            average_score: MetricDelta::new(baseline.average_score, self.average_score, threshold),
            scenarios,
            added: current
                .keys()
                .filter(|id| !previous.contains_key(*id))
                .map(|id| id.to_string())
                .collect(),
            missing: previous
                .keys()
                .filter(|id| !current.contains_key(*id))
                .map(|id| id.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricDelta {
    pub baseline: f64,
    pub current: f64,
    pub delta: f64,
    pub regressed: bool,
}

impl MetricDelta {
    fn new(baseline: f64, current: f64, threshold: f64) -> Self {
        let delta = current - baseline;
        Self {
            baseline,
            current,
            delta,
            regressed: dropped_beyond(delta, threshold),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDelta {
    pub id: String,
    pub baseline_status: ScenarioStatus,
    pub current_status: ScenarioStatus,
    pub baseline: f64,
    pub current: f64,
    pub delta: f64,
    pub regressed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionReport {
    pub threshold: f64,
    pub pass_rate: MetricDelta,
    pub average_score: MetricDelta,
    pub scenarios: Vec<ScenarioDelta>,
    pub added: Vec<String>,
    pub missing: Vec<String>,
}

impl RegressionReport {
    pub fn has_regressions(&self) -> bool {
        self.pass_rate.regressed
            || self.average_score.regressed
            || self.scenarios.iter().any(|s| s.regressed)
    }

    pub fn regressed_scenarios(&self) -> impl Iterator<Item = &ScenarioDelta> {
        self.scenarios.iter().filter(|s| s.regressed)
    }
}

fn flag(regressed: bool) -> &'static str {
    if regressed {
        "  REGRESSION"
    } else {
        ""
    }
}

impl fmt::Display for RegressionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "regression check (threshold {:.3})", self.threshold)?;
        let metrics = [("pass rate", &self.pass_rate), ("average score", &self.average_score)];
        for (label, metric) in metrics {
            writeln!(
                f,
                "  {label:<14} {:.3} -> {:.3} ({:+.3}){}",
                metric.baseline,
                metric.current,
                metric.delta,
                flag(metric.regressed)
            )?;
        }
        for scenario in &self.scenarios {
            let status = if scenario.baseline_status == scenario.current_status {
                scenario.current_status.to_string()
            } else {
                format!("{} -> {}", scenario.baseline_status, scenario.current_status)
            };
            writeln!(
                f,
                "  {:<30} {:.3} -> {:.3} ({:+.3}) [{status}]{}",
                scenario.id,
                scenario.baseline,
                scenario.current,
                scenario.delta,
                flag(scenario.regressed)
            )?;
        }
        if !self.added.is_empty() {
            writeln!(f, "  new scenarios: {}", self.added.join(", "))?;
        }
        if !self.missing.is_empty() {
            writeln!(f, "  missing from this run: {}", self.missing.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario(id: &str, status: ScenarioStatus, score: f64) -> ScenarioReport {
        ScenarioReport {
            id: id.to_string(),
            name: id.to_string(),
            status,
            composite_score: score,
            completed_steps: vec![Step::Outcomes],
            failure_counts: FailureCounts::default(),
            turns: 4,
            duration_ms: 10,
            terminal_reason: Some(TerminalReason::MaxTurnsReached),
            reasons: Vec::new(),
            error: None,
        }
    }

    #[test]
    fn aggregates_exclude_errored_scenarios() {
        let report = EvalReport::from_scenarios(vec![
            scenario("c", ScenarioStatus::Failed, 0.5),
            scenario("a", ScenarioStatus::Passed, 0.9),
            ScenarioReport::errored("b", "b", "agent under test call failed", 3),
        ]);
        assert_eq!(report.total, 3);
        assert_eq!(report.errored, 1);
        assert_eq!(report.pass_rate, 0.5);
        assert!((report.average_score - 0.7).abs() < 1e-12);
        let ids: Vec<&str> = report.scenarios.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(!report.all_passed());
    }

    #[test]
    fn empty_run_is_neutral() {
        let report = EvalReport::from_scenarios(Vec::new());
        assert_eq!(report.total, 0);
        assert_eq!(report.pass_rate, 0.0);
        assert_eq!(report.average_score, 0.0);
        assert!(report.all_passed());
    }

    #[test]
    fn compare_flags_drops_beyond_threshold() {
        let baseline = EvalReport::from_scenarios(vec![
            scenario("a", ScenarioStatus::Passed, 0.90),
            scenario("b", ScenarioStatus::Passed, 0.80),
            scenario("gone", ScenarioStatus::Passed, 0.80),
        ]);
        let current = EvalReport::from_scenarios(vec![
            scenario("a", ScenarioStatus::Passed, 0.87),
            scenario("b", ScenarioStatus::Failed, 0.60),
            scenario("new", ScenarioStatus::Passed, 0.95),
        ]);
        let diff = current.compare(&baseline, DEFAULT_REGRESSION_THRESHOLD);
        assert!(diff.has_regressions());
        let regressed: Vec<&str> = diff.regressed_scenarios().map(|s| s.id.as_str()).collect();
        assert_eq!(regressed, vec!["b"]);
        assert_eq!(diff.added, vec!["new"]);
        assert_eq!(diff.missing, vec!["gone"]);

        let text = diff.to_string();
        assert!(text.contains("passed -> failed"));
        assert!(text.contains("REGRESSION"));

        let same = baseline.compare(&baseline, DEFAULT_REGRESSION_THRESHOLD);
        assert!(!same.has_regressions());
    }

    #[test]
    fn drop_of_exactly_the_threshold_is_tolerated() {
        let baseline =
            EvalReport::from_scenarios(vec![scenario("a", ScenarioStatus::Passed, 0.80)]);

        let edge = EvalReport::from_scenarios(vec![scenario("a", ScenarioStatus::Passed, 0.75)]);
        let diff = edge.compare(&baseline, DEFAULT_REGRESSION_THRESHOLD);
        assert!(diff.scenarios[0].delta < -DEFAULT_REGRESSION_THRESHOLD);
        assert!(!diff.scenarios[0].regressed);
        assert!(!diff.average_score.regressed);
        assert!(!diff.has_regressions());

        let worse = EvalReport::from_scenarios(vec![scenario("a", ScenarioStatus::Passed, 0.74)]);
        let diff = worse.compare(&baseline, DEFAULT_REGRESSION_THRESHOLD);
        assert!(diff.scenarios[0].regressed);
        assert!(diff.average_score.regressed);
    }

    #[test]
    fn save_and_load() {
        let path = std::env::temp_dir()
            .join(format!("planeval-report-{}", std::process::id()))
            .join("report.json");
        let report = EvalReport::from_scenarios(vec![scenario("a", ScenarioStatus::Passed, 0.9)]);
        report.save(&path).unwrap();
        let loaded = EvalReport::load(&path).unwrap();
        assert_eq!(loaded, report);
        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
