use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use pvbench_contracts::{HARNESS_EXIT_ERROR, HARNESS_EXIT_STOPPED};
use tracing::{info, warn};

mod config;
mod confusion;
mod credential;
mod eval;
mod logging;
mod results;
mod testcase;
mod tool;
mod util;

use config::{HarnessArgs, HarnessConfig};
use confusion::ReportFormat;
use eval::{EvalOutcome, Evaluator, StopReason};
use tool::CliTool;

#[derive(Parser, Debug)]
#[command(name = "pvbench")]
#[command(about = "Benchmark harness for patch-validation CLI tools.", long_about = None)]
#[command(version)]
struct Cli {
    /// Run the evaluation (the default when --results is not given).
    #[arg(long)]
    evaluate: bool,

    /// Path to a results.json file; renders its confusion matrix instead of evaluating.
    #[arg(long, value_name = "PATH")]
    results: Option<PathBuf>,

    /// Output directory for results, transcripts and the confusion matrix [default: output].
    #[arg(short = 'o', long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Report format for the confusion matrix summary.
    #[arg(long, value_enum, default_value_t = ReportFormat::Json)]
    format: ReportFormat,

    #[command(flatten)]
    harness: HarnessArgs,
}

fn main() -> ExitCode {
    logging::init();
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(HARNESS_EXIT_ERROR)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if let Some(results) = &cli.results {
        if cli.evaluate {
            warn!("--results takes priority over --evaluate; rendering only");
        }
        return cmd_render(&cli, results);
    }
    cmd_evaluate(&cli)
}

fn cmd_render(cli: &Cli, results: &std::path::Path) -> Result<ExitCode> {
    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from("output"));
    let report = confusion::render(results, &output)?;
    confusion::emit_report(cli.format, &report)?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_evaluate(cli: &Cli) -> Result<ExitCode> {
    let config = HarnessConfig::resolve(&cli.harness, cli.output.as_deref())?;

    // Checked before anything touches the corpus or spawns the tool.
    let credential = config.credential.resolve()?;

    let tool = CliTool::new(&config.tool, config.timeout)
        .with_env(credential.name.clone(), credential.value());
    info!(
        tool = %tool.exe().display(),
        cases = config.case_count,
        output = %config.output_dir.display(),
        diffs = config.diffs_dir.is_some(),
        "starting evaluation"
    );

    let report = Evaluator::new(&config, tool).run()?;

    let cases_covered = report.recorded.div_ceil(2);
    println!(
        "Results saved to {} ({} results across {} of {} cases, {} new)",
        report.results_path.display(),
        report.recorded,
        cases_covered,
        config.case_count,
        report.performed
    );

    match report.outcome {
        EvalOutcome::Completed => Ok(ExitCode::SUCCESS),
        EvalOutcome::Stopped { at, reason } => {
            let why = match reason {
                StopReason::ToolCrash => "tool crash",
                StopReason::Timeout => "tool timeout",
            };
            println!(
                "Stopped at case {} ({} patch) after a {why}; rerun to resume",
                at.case, at.variant
            );
            Ok(ExitCode::from(HARNESS_EXIT_STOPPED))
        }
    }
}
