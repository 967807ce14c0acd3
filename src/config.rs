use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::EvalError,
    eval::{
        detector::DetectorConfig,
        engine::{EngineConfig, DEFAULT_GREETING, DEFAULT_SYSTEM_PROMPT},
        knowledge::StepKnowledgeBase,
        report::DEFAULT_REGRESSION_THRESHOLD,
        runner::RunnerConfig,
        scoring::ScoreWeights,
    },
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ModelConfig {
    fn named(model: &str, temperature: f32) -> Self {
        Self {
            model: model.to_string(),
            temperature: Some(temperature),
            max_tokens: None,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::named("gpt-4o-mini", 0.2)
    }
}

/// Harness settings, usually read from `eval.yaml`. Every field has a
/// default so an empty file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub concurrency: usize,
    pub progress_interval_secs: u64,
    /// Upper bound for a single agent or simulator call; unset means no limit.
    pub call_timeout_secs: Option<u64>,
    pub regression_threshold: f64,
    pub agent: ModelConfig,
    pub simulator: ModelConfig,
    pub system_prompt_file: Option<PathBuf>,
    pub simulator_template_file: Option<PathBuf>,
    pub greeting: Option<String>,
    pub knowledge_dir: Option<PathBuf>,
    pub detector: DetectorConfig,
    pub weights: ScoreWeights,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            progress_interval_secs: 10,
            call_timeout_secs: None,
            regression_threshold: DEFAULT_REGRESSION_THRESHOLD,
            agent: ModelConfig::default(),
            simulator: ModelConfig::named("gpt-4o-mini", 0.7),
            system_prompt_file: None,
            simulator_template_file: None,
            greeting: None,
            knowledge_dir: None,
            detector: DetectorConfig::default(),
            weights: ScoreWeights::default(),
        }
    }
}

impl EvalConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EvalError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| EvalError::io(path, e))?;
        let mut config: EvalConfig = serde_yaml::from_str(&text)?;
        // relative paths inside the file resolve against the file's directory
        if let Some(base) = path.parent() {
            for file in [
                &mut config.system_prompt_file,
                &mut config.simulator_template_file,
                &mut config.knowledge_dir,
            ]
            .into_iter()
            .flatten()
            {
                if file.is_relative() {
                    *file = base.join(&*file);
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EvalError> {
        if self.concurrency == 0 {
            return Err(EvalError::Config("concurrency must be at least 1".to_string()));
        }
        if self.progress_interval_secs == 0 {
            return Err(EvalError::Config("progress_interval_secs must be positive".to_string()));
        }
        if self.call_timeout_secs == Some(0) {
            return Err(EvalError::Config("call_timeout_secs must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.regression_threshold) {
            return Err(EvalError::Config(
                "regression_threshold must lie in [0, 1]".to_string(),
            ));
        }
        if self.detector.loop_window == 0 || self.detector.loop_threshold == 0 {
            return Err(EvalError::Config(
                "detector loop_window and loop_threshold must be positive".to_string(),
            ));
        }
        self.weights.validate().map_err(EvalError::Config)
    }

    pub fn engine_config(&self) -> Result<EngineConfig, EvalError> {
        let system_prompt = match &self.system_prompt_file {
            Some(path) => fs::read_to_string(path).map_err(|e| EvalError::io(path, e))?,
            None => DEFAULT_SYSTEM_PROMPT.to_string(),
        };
        let mut config = EngineConfig::default()
            .with_system_prompt(system_prompt)
            .with_greeting(self.greeting.as_deref().unwrap_or(DEFAULT_GREETING))
            .with_weights(self.weights)
            .with_detector(self.detector);
        if let Some(secs) = self.call_timeout_secs {
            config = config.with_call_timeout(Duration::from_secs(secs));
        }
        Ok(config)
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            concurrency: self.concurrency,
            progress_interval: Duration::from_secs(self.progress_interval_secs),
        }
    }

    pub fn simulator_template(&self) -> Result<Option<String>, EvalError> {
        self.simulator_template_file
            .as_ref()
            .map(|path| fs::read_to_string(path).map_err(|e| EvalError::io(path, e)))
            .transpose()
    }

    pub fn knowledge_base(&self) -> Result<StepKnowledgeBase, EvalError> {
        match &self.knowledge_dir {
            Some(dir) => StepKnowledgeBase::from_dir(dir),
            None => Ok(StepKnowledgeBase::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: EvalConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, EvalConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.runner_config().concurrency, 4);
        assert!(config.engine_config().unwrap().call_timeout.is_none());
    }

    #[test]
    fn partial_overrides_keep_other_defaults() {
        let yaml = r#"
concurrency: 8
call_timeout_secs: 30
agent:
  model: planner-large
detector:
  loop_threshold: 4
weights:
  step_quality: 0.5
"#;
        let config: EvalConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.agent.model, "planner-large");
        assert_eq!(config.agent.temperature, None);
        assert_eq!(config.detector.loop_threshold, 4);
        assert_eq!(config.detector.loop_window, 8);
        assert_eq!(config.weights.step_quality, 0.5);
        assert_eq!(config.weights.teaching, 0.10);

        let engine = config.engine_config().unwrap();
        assert_eq!(engine.call_timeout, Some(Duration::from_secs(30)));
        assert_eq!(engine.detector.loop_threshold, 4);
    }

    #[test]
    fn rejects_zero_concurrency_and_bad_weights() {
        let config = EvalConfig {
            concurrency: 0,
            ..EvalConfig::default()
        };
        assert!(matches!(config.validate(), Err(EvalError::Config(_))));

        let mut config = EvalConfig::default();
        config.weights.teaching = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = EvalConfig::load("/definitely/not/here/eval.yaml").unwrap_err();
        assert!(matches!(err, EvalError::Io { .. }));
    }
}
