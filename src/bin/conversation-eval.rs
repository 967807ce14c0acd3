use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use colored::Colorize;
use planeval::{
    eval::{
        load_scenarios, ConversationEngine, EvalReport, LlmAgent, LlmUserSimulator,
        ProgressSnapshot, ScenarioRunner, ScenarioStatus, TestScenario,
    },
    providers::openai::OpenAI,
    EvalConfig, EvalError, LLMProvider,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "conversation-eval")]
#[command(about = "Run multi-turn planning conversations against simulated users and score them")]
struct Args {
    /// Scenario file or directory of .yaml/.json scenarios
    #[arg(short, long)]
    scenarios: PathBuf,

    /// Harness configuration (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of conversations run at once
    #[arg(long)]
    concurrency: Option<usize>,

    /// Keep scenarios whose id contains, or whose tags include, this value
    #[arg(long)]
    filter: Vec<String>,

    /// Run only these scenario ids
    #[arg(long = "scenario-id")]
    scenario_ids: Vec<String>,

    /// Where to write the JSON report
    #[arg(short, long, default_value = "reports/latest.json")]
    out: PathBuf,

    /// Previous report to check for regressions
    #[arg(long)]
    baseline: Option<PathBuf>,

    /// Override the regression threshold from the config
    #[arg(long)]
    threshold: Option<f64>,

    /// Validate scenarios and configuration without calling any model
    #[arg(long)]
    dry_run: bool,
}

const EXIT_FAILED: u8 = 1;
const EXIT_ERRORED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err}", "error:".bright_red().bold());
            if err.downcast_ref::<EvalError>().is_some_and(EvalError::is_config) {
                eprintln!("  check the scenarios and configuration with --dry-run");
            }
            ExitCode::from(EXIT_ERRORED)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => EvalConfig::load(path)?,
        None => EvalConfig::default(),
    };
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(threshold) = args.threshold {
        config.regression_threshold = threshold;
    }
    config.validate()?;

    let scenarios = select(load_scenarios(&args.scenarios)?, &args.filter);
    let engine_config = config.engine_config()?;
    let knowledge = config.knowledge_base()?;

    if args.dry_run {
        for scenario in &scenarios {
            scenario.validate()?;
        }
        if let Some(missing) = args
            .scenario_ids
            .iter()
            .find(|id| !scenarios.iter().any(|s| &s.id == *id))
        {
            return Err(EvalError::UnknownScenario(missing.clone()).into());
        }
        println!(
            "{} {} scenario(s), {} knowledge file(s), concurrency {}",
            "dry run ok:".bright_green().bold(),
            scenarios.len(),
            knowledge.len(),
            config.concurrency
        );
        for scenario in &scenarios {
            println!("  {} ({}), up to {} turns", scenario.id, scenario.name, scenario.max_turns);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let provider: Arc<dyn LLMProvider> = Arc::new(OpenAI::from_env()?);

    let mut agent = LlmAgent::new(provider.clone(), config.agent.model.clone());
    if let Some(temperature) = config.agent.temperature {
        agent = agent.with_temperature(temperature);
    }
    if let Some(max_tokens) = config.agent.max_tokens {
        agent = agent.with_max_tokens(max_tokens);
    }

    let mut simulator = LlmUserSimulator::new(provider, config.simulator.model.clone());
    if let Some(temperature) = config.simulator.temperature {
        simulator = simulator.with_temperature(temperature);
    }
    if let Some(template) = config.simulator_template()? {
        simulator = simulator.with_template(template);
    }

    let engine = Arc::new(ConversationEngine::new(
        Arc::new(agent),
        Arc::new(simulator),
        Arc::new(knowledge),
        engine_config,
    ));
    let runner =
        ScenarioRunner::new(engine, config.runner_config()).with_progress_callback(print_progress);
    let summary = runner.run_selected(scenarios, &args.scenario_ids).await?;
    let report = summary.report;

    print_summary(&report);
    report.save(&args.out)?;
    println!("report written to {}", args.out.display());

    let mut regressed = false;
    if let Some(path) = &args.baseline {
        let baseline = EvalReport::load(path)?;
        let regression = report.compare(&baseline, config.regression_threshold);
        regressed = regression.has_regressions();
        let text = regression.to_string();
        if regressed {
            print!("{}", text.bright_red());
        } else {
            print!("{}", text.bright_green());
        }
    }

    Ok(if report.errored > 0 {
        ExitCode::from(EXIT_ERRORED)
    } else if report.failed > 0 || regressed {
        ExitCode::from(EXIT_FAILED)
    } else {
        ExitCode::SUCCESS
    })
}

fn select(scenarios: Vec<TestScenario>, filters: &[String]) -> Vec<TestScenario> {
    if filters.is_empty() {
        return scenarios;
    }
    scenarios
        .into_iter()
        .filter(|scenario| {
            filters.iter().any(|f| {
                scenario.id.contains(f.as_str()) || scenario.tags.iter().any(|tag| tag == f)
            })
        })
        .collect()
}

fn print_progress(snapshot: &ProgressSnapshot) {
    let eta = snapshot
        .eta
        .map(|eta| format!(", eta {}s", eta.as_secs()))
        .unwrap_or_default();
    println!(
        "{} {}/{} done ({} passed, {} failed, {} errored){eta}",
        "progress".cyan().bold(),
        snapshot.completed,
        snapshot.total,
        snapshot.passed,
        snapshot.failed,
        snapshot.errored
    );
    if !snapshot.in_flight.is_empty() {
        println!("  running: {}", snapshot.in_flight.join(", "));
    }
}

fn print_summary(report: &EvalReport) {
    println!();
    for scenario in &report.scenarios {
        let status = match scenario.status {
            ScenarioStatus::Passed => "PASS".bright_green().bold(),
            ScenarioStatus::Failed => "FAIL".bright_red().bold(),
            ScenarioStatus::Errored => "ERROR".bright_yellow().bold(),
        };
        println!(
            "{status} {:<32} score {:.3}  turns {:>2}  steps {}  {}",
            scenario.id,
            scenario.composite_score,
            scenario.turns,
            scenario.completed_steps.len(),
            format_duration(Duration::from_millis(scenario.duration_ms))
        );
        for reason in &scenario.reasons {
            println!("    - {reason}");
        }
        if let Some(error) = &scenario.error {
            println!("    - {}", error.yellow());
        }
    }
    println!(
        "\n{}: {} total, {} passed, {} failed, {} errored, pass rate {:.1}%, average score {:.3}",
        "Summary".bold(),
        report.total,
        report.passed,
        report.failed,
        report.errored,
        report.pass_rate * 100.0,
        report.average_score
    );
}

fn format_duration(duration: Duration) -> String {
    format!("{:.1}s", duration.as_secs_f64())
}
