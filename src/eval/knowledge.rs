use std::{collections::BTreeMap, fs, path::Path};

use crate::{error::EvalError, workflow::Step};

/// Reference material appended to the agent's system prompt for a step.
pub trait KnowledgeSource: Send + Sync {
    /// Returns the empty string when nothing is configured for `step`.
    fn content_for_step(&self, step: Step, scenario_knowledge: &BTreeMap<Step, String>) -> String;
}

/// Static per-step content, optionally loaded from `step_<n>.md` files, plus
/// whatever the scenario injects for the same step.
#[derive(Debug, Clone, Default)]
pub struct StepKnowledgeBase {
    base: BTreeMap<Step, String>,
}

impl StepKnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step(mut self, step: Step, content: impl Into<String>) -> Self {
        self.base.insert(step, content.into());
        self
    }

    /// Reads `step_1.md` .. `step_10.md` from `dir`; missing files are skipped.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, EvalError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(EvalError::Config(format!(
                "knowledge directory {} does not exist",
                dir.display()
            )));
        }
        let mut base = BTreeMap::new();
        for step in Step::ALL {
            let path = dir.join(format!("step_{}.md", step.number()));
            if !path.is_file() {
                continue;
            }
            let content = fs::read_to_string(&path).map_err(|e| EvalError::io(&path, e))?;
            if !content.trim().is_empty() {
                base.insert(step, content.trim().to_string());
            }
        }
        Ok(Self { base })
    }

    pub fn len(&self) -> usize {
        self.base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }
}

impl KnowledgeSource for StepKnowledgeBase {
    fn content_for_step(&self, step: Step, scenario_knowledge: &BTreeMap<Step, String>) -> String {
        [self.base.get(&step), scenario_knowledge.get(&step)]
            .into_iter()
            .flatten()
            .map(|block| block.trim())
            .filter(|block| !block.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combines_base_and_scenario_content() {
        let kb = StepKnowledgeBase::new().with_step(Step::Economics, "Typical CAC: $80-$150.");
        let mut scenario = BTreeMap::new();
        scenario.insert(Step::Economics, "Client margin is thin.".to_string());
        scenario.insert(Step::Audience, "Parents of toddlers.".to_string());

        assert_eq!(
            kb.content_for_step(Step::Economics, &scenario),
            "Typical CAC: $80-$150.\n\nClient margin is thin."
        );
        assert_eq!(kb.content_for_step(Step::Audience, &scenario), "Parents of toddlers.");
        assert_eq!(kb.content_for_step(Step::Forecast, &scenario), "");
    }

    #[test]
    fn loads_step_files() {
        let dir = std::env::temp_dir().join(format!("planeval-kb-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("step_2.md"), "Benchmarks for economics\n").unwrap();
        fs::write(dir.join("notes.md"), "ignored").unwrap();

        let kb = StepKnowledgeBase::from_dir(&dir).unwrap();
        assert_eq!(kb.len(), 1);
        assert_eq!(
            kb.content_for_step(Step::Economics, &BTreeMap::new()),
            "Benchmarks for economics"
        );

        fs::remove_dir_all(&dir).unwrap();
        assert!(StepKnowledgeBase::from_dir(&dir).is_err());
    }
}
