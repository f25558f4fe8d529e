use std::path::Path;

use anyhow::{Context, Result};
use pvbench_contracts::TEST_SCRIPT_FILE_NAME;

/// Reads the project's test-execution script and returns the bare test name it runs.
pub fn resolve_test_identifier(project_dir: &Path) -> Result<String> {
    let script = project_dir.join(TEST_SCRIPT_FILE_NAME);
    let text = std::fs::read_to_string(&script)
        .with_context(|| format!("read test script: {}", script.display()))?;
    Ok(test_identifier_from_script(&text))
}

/// Only the first line counts. Its last whitespace-separated token is a dotted test
/// path (`tests.test_black.BlackTestCase.test_foo`) or a pytest node id
/// (`tests/test_foo.py::test_bar`); the trailing component is returned unvalidated.
pub fn test_identifier_from_script(text: &str) -> String {
    let first_line = text.trim().lines().next().unwrap_or_default();
    let token = first_line.split_whitespace().last().unwrap_or_default();
    let token = token.rsplit_once("::").map_or(token, |(_, tail)| tail);
    let name = token.rsplit_once('.').map_or(token, |(_, tail)| tail);
    name.to_string()
}
