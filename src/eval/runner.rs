//! Bounded-concurrency batch execution.
//!
//! Scenarios sit in one shared queue drained by exactly `concurrency` worker
//! tasks. Workers never touch shared results: they report starts and outcomes
//! over a channel to a single aggregator task, which owns the outcome list and
//! the progress counters and emits a snapshot on every timer tick.

use std::{
    any::Any,
    collections::{BTreeMap, HashSet, VecDeque},
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures_util::{future::join_all, FutureExt};
use serde::Serialize;
use tokio::{sync::mpsc, time};
use tracing::{info, warn};

use crate::{
    error::EvalError,
    eval::{
        engine::{ConversationEngine, ConversationResult},
        report::{EvalReport, ScenarioReport},
        scenario::TestScenario,
    },
};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub concurrency: usize,
    pub progress_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            progress_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    /// Names of the scenarios currently running, ordered by id.
    pub in_flight: Vec<String>,
    /// Mean duration so far times the remaining work, spread over the workers.
    pub eta: Option<Duration>,
}

/// How one scenario ended.
#[derive(Debug)]
pub enum ScenarioOutcome {
    Finished(Box<ConversationResult>),
    Errored {
        id: String,
        name: String,
        error: EvalError,
        duration: Duration,
    },
}

impl ScenarioOutcome {
    pub fn id(&self) -> &str {
        match self {
            ScenarioOutcome::Finished(result) => &result.scenario_id,
            ScenarioOutcome::Errored { id, .. } => id,
        }
    }

    pub fn report(&self) -> ScenarioReport {
        match self {
            ScenarioOutcome::Finished(result) => ScenarioReport::from_result(result),
            ScenarioOutcome::Errored {
                id,
                name,
                error,
                duration,
            } => {
                let duration_ms = duration.as_millis() as u64;
                ScenarioReport::errored(id.clone(), name.clone(), error, duration_ms)
            }
        }
    }
}

/// Everything a run produced: the aggregate report plus each outcome, both
/// ordered by scenario id.
#[derive(Debug)]
pub struct RunSummary {
    pub report: EvalReport,
    pub outcomes: Vec<ScenarioOutcome>,
}

impl RunSummary {
    pub fn results(&self) -> impl Iterator<Item = &ConversationResult> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            ScenarioOutcome::Finished(result) => Some(result.as_ref()),
            ScenarioOutcome::Errored { .. } => None,
        })
    }
}

type ProgressCallback = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;

enum WorkerMessage {
    Started { id: String, name: String },
    Finished { outcome: ScenarioOutcome, elapsed: Duration },
}

pub struct ScenarioRunner {
    engine: Arc<ConversationEngine>,
    config: RunnerConfig,
    progress_callback: Option<ProgressCallback>,
}

impl ScenarioRunner {
    pub fn new(engine: Arc<ConversationEngine>, config: RunnerConfig) -> Self {
        Self {
            engine,
            config,
            progress_callback: None,
        }
    }

    pub fn with_progress_callback(
        mut self,
        callback: impl Fn(&ProgressSnapshot) + Send + Sync + 'static,
    ) -> Self {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    /// Runs only the scenarios whose ids are listed. Unknown ids fail the
    /// whole run before anything starts.
    pub async fn run_selected(
        &self,
        scenarios: Vec<TestScenario>,
        ids: &[String],
    ) -> Result<RunSummary, EvalError> {
        if ids.is_empty() {
            return self.run(scenarios).await;
        }
        let known: HashSet<&str> = scenarios.iter().map(|s| s.id.as_str()).collect();
        if let Some(missing) = ids.iter().find(|id| !known.contains(id.as_str())) {
            return Err(EvalError::UnknownScenario(missing.clone()));
        }
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let selected = scenarios
            .into_iter()
            .filter(|s| wanted.contains(s.id.as_str()))
            .collect();
        self.run(selected).await
    }

    pub async fn run(&self, scenarios: Vec<TestScenario>) -> Result<RunSummary, EvalError> {
        let concurrency = self.config.concurrency;
        if concurrency == 0 {
            return Err(EvalError::Config("concurrency must be at least 1".to_string()));
        }
        if self.config.progress_interval.is_zero() {
            return Err(EvalError::Config("progress interval must be positive".to_string()));
        }
        let mut seen = HashSet::new();
        for scenario in &scenarios {
            scenario.validate()?;
            if !seen.insert(scenario.id.as_str()) {
                return Err(EvalError::invalid(&scenario.id, "duplicate scenario id"));
            }
        }

        let total = scenarios.len();
        info!(total, concurrency, "starting evaluation run");
        if total == 0 {
            return Ok(RunSummary {
                report: EvalReport::from_scenarios(Vec::new()),
                outcomes: Vec::new(),
            });
        }

        let queue = Arc::new(Mutex::new(VecDeque::from(scenarios)));
        let (tx, rx) = mpsc::unbounded_channel();

        let aggregator = tokio::spawn(aggregate(
            rx,
            total,
            concurrency,
            self.config.progress_interval,
            self.progress_callback.clone(),
        ));

        let workers: Vec<_> = (0..concurrency)
            .map(|worker| {
                let queue = Arc::clone(&queue);
                let engine = Arc::clone(&self.engine);
                let tx = tx.clone();
                tokio::spawn(async move {
                    while let Some(scenario) = next_scenario(&queue) {
                        let _ = tx.send(WorkerMessage::Started {
                            id: scenario.id.clone(),
                            name: scenario.name.clone(),
                        });
                        let started = Instant::now();
                        // a panicking conversation still reports, as errored
                        let result = AssertUnwindSafe(engine.run_conversation(&scenario))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|panic| {
                                Err(EvalError::Aborted(panic_message(panic.as_ref())))
                            });
                        let outcome = match result {
                            Ok(result) => ScenarioOutcome::Finished(Box::new(result)),
                            Err(error) => {
                                warn!(worker, scenario = %scenario.id, %error, "scenario errored");
                                ScenarioOutcome::Errored {
                                    id: scenario.id.clone(),
                                    name: scenario.name.clone(),
                                    error,
                                    duration: started.elapsed(),
                                }
                            }
                        };
                        let _ = tx.send(WorkerMessage::Finished {
                            outcome,
                            elapsed: started.elapsed(),
                        });
                    }
                })
            })
            .collect();
        drop(tx);

        for joined in join_all(workers).await {
            if let Err(err) = joined {
                warn!(error = %err, "runner worker stopped unexpectedly");
            }
        }
        let mut outcomes = aggregator
            .await
            .map_err(|err| EvalError::Config(format!("progress aggregator failed: {err}")))?;

        outcomes.sort_by(|a, b| a.id().cmp(b.id()));
        let report =
            EvalReport::from_scenarios(outcomes.iter().map(ScenarioOutcome::report).collect());
        info!(
            total = report.total,
            passed = report.passed,
            failed = report.failed,
            errored = report.errored,
            pass_rate = report.pass_rate,
            average_score = report.average_score,
            "evaluation run finished"
        );
        Ok(RunSummary { report, outcomes })
    }
}

fn next_scenario(queue: &Mutex<VecDeque<TestScenario>>) -> Option<TestScenario> {
    queue.lock().ok()?.pop_front()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panicked".to_string())
}

struct Progress {
    total: usize,
    concurrency: usize,
    passed: usize,
    failed: usize,
    errored: usize,
    busy: Duration,
    in_flight: BTreeMap<String, String>,
}

impl Progress {
    fn completed(&self) -> usize {
        self.passed + self.failed + self.errored
    }

    fn snapshot(&self) -> ProgressSnapshot {
        let completed = self.completed();
        let eta = (completed > 0).then(|| {
            let mean = self.busy / completed as u32;
            let remaining = (self.total - completed) as u32;
            mean * remaining / self.concurrency.min(self.total).max(1) as u32
        });
        ProgressSnapshot {
            total: self.total,
            completed,
            passed: self.passed,
            failed: self.failed,
            errored: self.errored,
            in_flight: self.in_flight.values().cloned().collect(),
            eta,
        }
    }
}

fn emit(snapshot: &ProgressSnapshot, callback: &Option<ProgressCallback>) {
    info!(
        completed = snapshot.completed,
        total = snapshot.total,
        passed = snapshot.passed,
        failed = snapshot.failed,
        errored = snapshot.errored,
        in_flight = ?snapshot.in_flight,
        eta_secs = snapshot.eta.map(|eta| eta.as_secs()),
        "progress"
    );
    if let Some(callback) = callback {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (callback)(snapshot)));
    }
}

async fn aggregate(
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
    total: usize,
    concurrency: usize,
    interval: Duration,
    callback: Option<ProgressCallback>,
) -> Vec<ScenarioOutcome> {
    let mut progress = Progress {
        total,
        concurrency,
        passed: 0,
        failed: 0,
        errored: 0,
        busy: Duration::ZERO,
        in_flight: BTreeMap::new(),
    };
    let mut outcomes = Vec::with_capacity(total);
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // the first tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(WorkerMessage::Started { id, name }) => {
                    progress.in_flight.insert(id, name);
                }
                Some(WorkerMessage::Finished { outcome, elapsed }) => {
                    progress.in_flight.remove(outcome.id());
                    progress.busy += elapsed;
                    match &outcome {
                        ScenarioOutcome::Finished(result) if result.passed() => {
                            progress.passed += 1
                        }
                        ScenarioOutcome::Finished(_) => progress.failed += 1,
                        ScenarioOutcome::Errored { .. } => progress.errored += 1,
                    }
                    outcomes.push(outcome);
                }
                None => break,
            },
            _ = ticker.tick() => emit(&progress.snapshot(), &callback),
        }
    }

    emit(&progress.snapshot(), &callback);
    outcomes
}
