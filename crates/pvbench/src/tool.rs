use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::warn;

/// One request to the tool under test.
#[derive(Debug, Clone, Copy)]
pub struct ToolRequest<'a> {
    pub bug_description: &'a str,
    pub test_identifier: &'a str,
    pub project_dir: &'a Path,
    pub diff_path: Option<&'a Path>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// The child was killed by the timeout policy; `exit_code` is then meaningless.
    pub timed_out: bool,
    pub duration_ms: u64,
}

pub trait ToolRunner {
    fn invoke(&mut self, request: &ToolRequest<'_>) -> Result<ToolOutput>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Wait for the child however long it takes.
    #[default]
    None,
    WallClock(Duration),
}

impl TimeoutPolicy {
    pub fn from_ms(ms: Option<u64>) -> Self {
        match ms {
            Some(ms) if ms > 0 => TimeoutPolicy::WallClock(Duration::from_millis(ms)),
            _ => TimeoutPolicy::None,
        }
    }
}

/// `-d <project> -b <description> [--diff <diff>] <test>`
pub fn tool_argv(request: &ToolRequest<'_>) -> Vec<OsString> {
    let mut argv: Vec<OsString> = vec![
        "-d".into(),
        request.project_dir.as_os_str().to_os_string(),
        "-b".into(),
        request.bug_description.into(),
    ];
    if let Some(diff) = request.diff_path {
        argv.push("--diff".into());
        argv.push(diff.as_os_str().to_os_string());
    }
    argv.push(request.test_identifier.into());
    argv
}

/// Runs the tool under test as a child process.
#[derive(Debug, Clone)]
pub struct CliTool {
    exe: PathBuf,
    env: Vec<(String, String)>,
    timeout: TimeoutPolicy,
}

impl CliTool {
    pub fn new(exe: impl Into<PathBuf>, timeout: TimeoutPolicy) -> Self {
        Self {
            exe: exe.into(),
            env: Vec::new(),
            timeout,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    fn command(&self, request: &ToolRequest<'_>) -> Command {
        let mut cmd = Command::new(&self.exe);
        cmd.args(tool_argv(request));
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }
}

impl ToolRunner for CliTool {
    fn invoke(&mut self, request: &ToolRequest<'_>) -> Result<ToolOutput> {
        let started = Instant::now();
        let mut cmd = self.command(request);

        let (status, stdout, stderr, timed_out) = match self.timeout {
            TimeoutPolicy::None => {
                let out = cmd
                    .output()
                    .with_context(|| format!("run tool: {}", self.exe.display()))?;
                (out.status, out.stdout, out.stderr, false)
            }
            TimeoutPolicy::WallClock(limit) => {
                let mut child = cmd
                    .spawn()
                    .with_context(|| format!("spawn tool: {}", self.exe.display()))?;
                let stdout_reader = drain_pipe("stdout", child.stdout.take());
                let stderr_reader = drain_pipe("stderr", child.stderr.take());
                let (status, timed_out) = wait_child_with_wall_timeout(&mut child, limit)?;
                let stdout = stdout_reader.join().unwrap_or_default();
                let stderr = stderr_reader.join().unwrap_or_default();
                (status, stdout, stderr, timed_out)
            }
        };

        Ok(ToolOutput {
            exit_code: exit_code_of(&status),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            timed_out,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn drain_pipe<R: Read + Send + 'static>(
    stream: &'static str,
    pipe: Option<R>,
) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || read_pipe(stream, pipe))
}

/// Keeps whatever was read before a failure; the transcript is then incomplete.
fn read_pipe<R: Read>(stream: &'static str, pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(err) = pipe.read_to_end(&mut buf) {
            warn!(stream, error = %err, bytes = buf.len(), "tool output truncated");
        }
    }
    buf
}

fn wait_child_with_wall_timeout(child: &mut Child, limit: Duration) -> Result<(ExitStatus, bool)> {
    let deadline = Instant::now().checked_add(limit);

    loop {
        if let Some(status) = child.try_wait().context("try_wait tool")? {
            return Ok((status, false));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            let _ = child.kill();
            let status = child.wait().context("wait tool after kill")?;
            return Ok((status, true));
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Signal deaths map to `-signal`, matching how the tool's exit is usually reported
/// by shells and Python's `subprocess`.
fn exit_code_of(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(project: &'a Path, diff: Option<&'a Path>) -> ToolRequest<'a> {
        ToolRequest {
            bug_description: "black crashes on empty input",
            test_identifier: "test_empty",
            project_dir: project,
            diff_path: diff,
        }
    }

    #[test]
    fn argv_without_diff() {
        let argv = tool_argv(&request(Path::new("/p/good"), None));
        assert_eq!(
            argv,
            vec![
                OsString::from("-d"),
                OsString::from("/p/good"),
                OsString::from("-b"),
                OsString::from("black crashes on empty input"),
                OsString::from("test_empty"),
            ]
        );
    }

    #[test]
    fn argv_with_diff_keeps_test_last() {
        let argv = tool_argv(&request(Path::new("/p/bad"), Some(Path::new("/d/1/bad_patch.txt"))));
        assert_eq!(argv[4], OsString::from("--diff"));
        assert_eq!(argv[5], OsString::from("/d/1/bad_patch.txt"));
        assert_eq!(argv.last(), Some(&OsString::from("test_empty")));
        assert_eq!(argv.len(), 7);
    }

    #[test]
    fn timeout_policy_from_ms() {
        assert_eq!(TimeoutPolicy::from_ms(None), TimeoutPolicy::None);
        assert_eq!(TimeoutPolicy::from_ms(Some(0)), TimeoutPolicy::None);
        assert_eq!(
            TimeoutPolicy::from_ms(Some(1500)),
            TimeoutPolicy::WallClock(Duration::from_millis(1500))
        );
    }

    #[cfg(unix)]
    #[test]
    fn captures_streams_env_and_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("tool.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"out $2\"\necho \"key=$PVBENCH_TEST_KEY\" >&2\nexit 7\n",
        )
        .expect("write script");
        set_executable(&script);

        let mut tool =
            CliTool::new(&script, TimeoutPolicy::None).with_env("PVBENCH_TEST_KEY", "sk-test");
        let out = tool.invoke(&request(dir.path(), None)).expect("invoke");
        assert_eq!(out.exit_code, 7);
        assert_eq!(out.stdout.trim(), format!("out {}", dir.path().display()));
        assert_eq!(out.stderr.trim(), "key=sk-test");
        assert!(!out.timed_out);
    }

    #[cfg(unix)]
    #[test]
    fn wall_clock_timeout_kills_child() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("slow.sh");
        std::fs::write(&script, "#!/bin/sh\necho started\nexec sleep 30\n").expect("write script");
        set_executable(&script);

        let mut tool = CliTool::new(&script, TimeoutPolicy::from_ms(Some(200)));
        let out = tool.invoke(&request(dir.path(), None)).expect("invoke");
        assert!(out.timed_out);
        assert!(out.duration_ms < 30_000);
        assert_eq!(out.stdout.trim(), "started");
    }

    struct FailsAfter(Option<&'static [u8]>);

    impl Read for FailsAfter {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.0.take() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(chunk);
                    Ok(chunk.len())
                }
                None => Err(std::io::Error::other("pipe broke")),
            }
        }
    }

    #[test]
    fn read_failure_keeps_partial_output() {
        assert_eq!(read_pipe("stdout", Some(FailsAfter(Some(b"partial")))), b"partial");
        assert!(read_pipe::<FailsAfter>("stderr", None).is_empty());
    }

    #[test]
    fn missing_executable_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut tool = CliTool::new(dir.path().join("no-such-tool"), TimeoutPolicy::None);
        assert!(tool.invoke(&request(dir.path(), None)).is_err());
    }

    #[cfg(unix)]
    fn set_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt as _;
        let mut perms = std::fs::metadata(path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).expect("chmod");
    }
}
