use std::path::PathBuf;

use anyhow::{Context, Result};
use pvbench_contracts::{PVBENCH_INVOCATION_SCHEMA_VERSION, TOOL_EXIT_CORRECT, TOOL_EXIT_CRASH};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::HarnessConfig;
use crate::results::{ResultStore, LABEL_BUGGY, LABEL_CORRECT};
use crate::testcase;
use crate::tool::{self, ToolOutput, ToolRequest, ToolRunner};
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    Good,
    Bad,
}

impl Variant {
    pub fn as_str(self) -> &'static str {
        match self {
            Variant::Good => "good",
            Variant::Bad => "bad",
        }
    }

    /// Fixed by construction of the corpus, never derived from the tool.
    pub fn true_label(self) -> u8 {
        match self {
            Variant::Good => LABEL_CORRECT,
            Variant::Bad => LABEL_BUGGY,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Variant::Good => "correct",
            Variant::Bad => "incorrect",
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point in the `case1-good, case1-bad, case2-good, ...` ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub case: u32,
    pub variant: Variant,
}

impl Position {
    /// The invocation that follows `completed` recorded ones.
    pub fn from_completed(completed: usize) -> Self {
        Self {
            case: (completed / 2) as u32 + 1,
            variant: if completed % 2 == 0 {
                Variant::Good
            } else {
                Variant::Bad
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Judged(u8),
    Crashed,
    TimedOut,
}

pub fn classify(output: &ToolOutput) -> Classification {
    if output.timed_out {
        return Classification::TimedOut;
    }
    match output.exit_code {
        TOOL_EXIT_CRASH => Classification::Crashed,
        TOOL_EXIT_CORRECT => Classification::Judged(LABEL_CORRECT),
        _ => Classification::Judged(LABEL_BUGGY),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ToolCrash,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalOutcome {
    Completed,
    Stopped { at: Position, reason: StopReason },
}

#[derive(Debug, Clone)]
pub struct EvalReport {
    pub outcome: EvalOutcome,
    pub results_path: PathBuf,
    /// Invocations recorded in the results file when the loop ended.
    pub recorded: usize,
    /// Invocations performed by this run.
    pub performed: usize,
}

#[derive(Debug, Serialize)]
struct InvocationRecord<'a> {
    schema_version: &'static str,
    case: u32,
    variant: Variant,
    test_identifier: &'a str,
    project_dir: String,
    argv: Vec<String>,
    exit_code: i32,
    true_label: u8,
    predicted_label: u8,
    duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    diff_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    diff_sha256_hex: Option<String>,
}

pub struct Evaluator<'a, T> {
    config: &'a HarnessConfig,
    tool: T,
    store: ResultStore,
}

impl<'a, T: ToolRunner> Evaluator<'a, T> {
    pub fn new(config: &'a HarnessConfig, tool: T) -> Self {
        Self {
            config,
            tool,
            store: ResultStore::new(config.results_path()),
        }
    }

    #[cfg(test)]
    pub fn into_tool(self) -> T {
        self.tool
    }

    /// Runs every invocation not yet recorded in the results file, persisting after
    /// each one. A tool crash or timeout stops the loop with the results file at the
    /// last recorded invocation.
    pub fn run(&mut self) -> Result<EvalReport> {
        std::fs::create_dir_all(&self.config.output_dir).with_context(|| {
            format!("create output dir: {}", self.config.output_dir.display())
        })?;

        let mut results = self.store.load()?;
        let total = self.config.total_invocations();
        let completed = results.len();

        if completed >= total {
            println!(
                "All {} cases already evaluated ({} results recorded)",
                self.config.case_count, completed
            );
            return Ok(self.report(EvalOutcome::Completed, completed, 0));
        }

        let start = Position::from_completed(completed);
        println!(
            "Resuming: test case {}, starting with {} patch",
            start.case, start.variant
        );
        info!(completed, total, case = start.case, variant = %start.variant, "resuming evaluation");

        let mut performed = 0;
        for ordinal in completed..total {
            let pos = Position::from_completed(ordinal);
            let output = self.invoke_at(pos)?;
            performed += 1;

            let predicted = match classify(&output.tool) {
                Classification::Judged(label) => label,
                Classification::Crashed => {
                    println!("Tool crash on {} patch #{}", pos.variant.describe(), pos.case);
                    warn!(case = pos.case, variant = %pos.variant, stderr = %output.tool.stderr.trim(), "tool crashed");
                    return Ok(self.report(
                        EvalOutcome::Stopped {
                            at: pos,
                            reason: StopReason::ToolCrash,
                        },
                        results.len(),
                        performed,
                    ));
                }
                Classification::TimedOut => {
                    println!("Tool timed out on {} patch #{}", pos.variant.describe(), pos.case);
                    warn!(case = pos.case, variant = %pos.variant, duration_ms = output.tool.duration_ms, "tool timed out");
                    return Ok(self.report(
                        EvalOutcome::Stopped {
                            at: pos,
                            reason: StopReason::Timeout,
                        },
                        results.len(),
                        performed,
                    ));
                }
            };

            results.push(pos.variant.true_label(), predicted);
            self.store.save(&results)?;
            self.write_transcripts(pos, &output, predicted)?;

            println!(
                "Completed case {} ({} patch), saved results",
                pos.case, pos.variant
            );
            info!(
                case = pos.case,
                variant = %pos.variant,
                exit_code = output.tool.exit_code,
                predicted,
                recorded = results.len(),
                "invocation recorded"
            );
        }

        Ok(self.report(EvalOutcome::Completed, results.len(), performed))
    }

    fn invoke_at(&mut self, pos: Position) -> Result<Invocation> {
        let description_path = self.config.description_path(pos.case);
        let bug_description = std::fs::read_to_string(&description_path).with_context(|| {
            format!("read bug description: {}", description_path.display())
        })?;

        // Both variants run the test named by the good patch's script.
        let test_identifier =
            testcase::resolve_test_identifier(&self.config.project_dir(pos.case, Variant::Good))?;

        let project_dir = self.config.project_dir(pos.case, pos.variant);
        let diff_path = self.config.diff_path(pos.case, pos.variant);
        let request = ToolRequest {
            bug_description: &bug_description,
            test_identifier: &test_identifier,
            project_dir: &project_dir,
            diff_path: diff_path.as_deref(),
        };
        let argv = tool::tool_argv(&request)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        info!(case = pos.case, variant = %pos.variant, test = %test_identifier, "invoking tool");
        let output = self.tool.invoke(&request).with_context(|| {
            format!("invoke tool for case {} ({} patch)", pos.case, pos.variant)
        })?;

        Ok(Invocation {
            tool: output,
            test_identifier,
            project_dir,
            diff_path,
            argv,
        })
    }

    fn write_transcripts(&self, pos: Position, inv: &Invocation, predicted: u8) -> Result<()> {
        let stdout_path = self.config.transcript_path(pos.case, pos.variant, "output.txt");
        std::fs::write(&stdout_path, &inv.tool.stdout)
            .with_context(|| format!("write transcript: {}", stdout_path.display()))?;

        if !inv.tool.stderr.is_empty() {
            let stderr_path = self.config.transcript_path(pos.case, pos.variant, "error.txt");
            std::fs::write(&stderr_path, &inv.tool.stderr)
                .with_context(|| format!("write transcript: {}", stderr_path.display()))?;
        }

        let diff_sha256_hex = match inv.diff_path.as_deref() {
            Some(path) => match std::fs::read(path) {
                Ok(bytes) => Some(util::sha256_hex(&bytes)),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "diff file unreadable; not hashed");
                    None
                }
            },
            None => None,
        };

        let record = InvocationRecord {
            schema_version: PVBENCH_INVOCATION_SCHEMA_VERSION,
            case: pos.case,
            variant: pos.variant,
            test_identifier: &inv.test_identifier,
            project_dir: inv.project_dir.display().to_string(),
            argv: inv.argv.clone(),
            exit_code: inv.tool.exit_code,
            true_label: pos.variant.true_label(),
            predicted_label: predicted,
            duration_ms: inv.tool.duration_ms,
            diff_path: inv.diff_path.as_ref().map(|p| p.display().to_string()),
            diff_sha256_hex,
        };
        let record_path = self
            .config
            .transcript_path(pos.case, pos.variant, "invocation.json");
        util::write_atomic(&record_path, &util::pretty_json_bytes(&record)?)
            .with_context(|| format!("write invocation record: {}", record_path.display()))
    }

    fn report(&self, outcome: EvalOutcome, recorded: usize, performed: usize) -> EvalReport {
        EvalReport {
            outcome,
            results_path: self.store.path().to_path_buf(),
            recorded,
            performed,
        }
    }
}

struct Invocation {
    tool: ToolOutput,
    test_identifier: String,
    project_dir: PathBuf,
    diff_path: Option<PathBuf>,
    argv: Vec<String>,
}
