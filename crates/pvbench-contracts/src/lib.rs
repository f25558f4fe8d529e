//! Shared, version-pinned identifiers.
//!
//! These constants are the single source of truth for schema/version strings, file
//! names and exit codes that appear in pvbench's machine-readable I/O and in the
//! contract with the tool under test.

pub const PVBENCH_CONFIG_SCHEMA_VERSION: &str = "pvbench.config@0.1.0";
pub const PVBENCH_INVOCATION_SCHEMA_VERSION: &str = "pvbench.invocation@0.1.0";
pub const PVBENCH_CONFUSION_SCHEMA_VERSION: &str = "pvbench.confusion@0.1.0";

pub const RESULTS_FILE_NAME: &str = "results.json";
pub const CONFUSION_MATRIX_SVG_FILE_NAME: &str = "confusion_matrix.svg";
pub const CONFUSION_MATRIX_REPORT_FILE_NAME: &str = "confusion_matrix.json";

/// Test-execution script expected at the root of every patch project directory.
pub const TEST_SCRIPT_FILE_NAME: &str = "bugsinpy_run_test.sh";

pub const DEFAULT_CASE_COUNT: u32 = 23;
pub const DEFAULT_CREDENTIAL_ENV: &str = "OPENAI_API_KEY";
pub const DEFAULT_PROJECT_TEMPLATE: &str = "framework/bin/temp/black-{case}/{variant}/black";

/// Tool exit code for "the patch is correct".
pub const TOOL_EXIT_CORRECT: i32 = 0;
/// Tool exit code for "the tool crashed"; never a judgment.
pub const TOOL_EXIT_CRASH: i32 = 3;

pub const HARNESS_EXIT_ERROR: u8 = 2;
/// Evaluation stopped before the last invocation (tool crash or timeout).
pub const HARNESS_EXIT_STOPPED: u8 = 20;
