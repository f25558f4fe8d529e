use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;
use pvbench_contracts::{
    DEFAULT_CASE_COUNT, DEFAULT_CREDENTIAL_ENV, DEFAULT_PROJECT_TEMPLATE,
    PVBENCH_CONFIG_SCHEMA_VERSION, RESULTS_FILE_NAME,
};
use serde::Deserialize;

use crate::credential::CredentialSource;
use crate::eval::Variant;
use crate::tool::TimeoutPolicy;
use crate::util;

const DEFAULT_BUGSINPY_ROOT: &str = "BugsInPy";
const DEFAULT_DESCRIPTIONS_DIR: &str = "pyllmvalidate-benchmark/descriptions";
const DEFAULT_TOOL: &str = "./cli";
const DEFAULT_ENV_FILE: &str = ".env";
const DEFAULT_OUTPUT_DIR: &str = "output";

#[derive(Debug, Clone, Default, Args)]
pub struct HarnessArgs {
    /// JSON config file supplying defaults for the flags below.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Number of bug cases (cases are numbered 1..=N).
    #[arg(long, value_name = "N")]
    pub cases: Option<u32>,

    /// BugsInPy checkout holding the good/bad patch project directories.
    #[arg(long, value_name = "DIR")]
    pub bugsinpy: Option<PathBuf>,

    /// Directory of `<case>.txt` bug descriptions.
    #[arg(long, value_name = "DIR")]
    pub descriptions: Option<PathBuf>,

    /// Directory of `<case>/<variant>_patch.txt` diffs passed to the tool via --diff.
    #[arg(long, value_name = "DIR", conflicts_with = "no_diffs")]
    pub diffs: Option<PathBuf>,

    /// Do not pass --diff even if the config file names a diffs directory.
    #[arg(long)]
    pub no_diffs: bool,

    /// Project directory under the BugsInPy root; `{case}` and `{variant}` are substituted.
    #[arg(long, value_name = "TEMPLATE")]
    pub project_template: Option<String>,

    /// Tool under test.
    #[arg(long, value_name = "PATH")]
    pub tool: Option<PathBuf>,

    /// Environment variable holding the API credential.
    #[arg(long, value_name = "NAME")]
    pub credential_env: Option<String>,

    /// Dotenv file consulted for the credential.
    #[arg(long, value_name = "PATH")]
    pub env_file: Option<PathBuf>,

    /// Kill the tool after this many milliseconds and stop the run (default: wait forever).
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,
}

/// On-disk defaults. Relative paths are resolved against the config file's directory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub cases: Option<u32>,
    #[serde(default)]
    pub bugsinpy_root: Option<PathBuf>,
    #[serde(default)]
    pub descriptions_dir: Option<PathBuf>,
    #[serde(default)]
    pub diffs_dir: Option<PathBuf>,
    #[serde(default)]
    pub project_template: Option<String>,
    #[serde(default)]
    pub tool: Option<PathBuf>,
    #[serde(default)]
    pub credential_env: Option<String>,
    #[serde(default)]
    pub env_file: Option<PathBuf>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let file: ConfigFile =
        util::read_json_file(path).with_context(|| format!("load config: {}", path.display()))?;
    if let Some(sv) = &file.schema_version {
        if sv.trim() != PVBENCH_CONFIG_SCHEMA_VERSION {
            bail!(
                "config schema_version mismatch: expected {} got {:?}",
                PVBENCH_CONFIG_SCHEMA_VERSION,
                sv
            );
        }
    }
    Ok(file.rebased(path.parent().unwrap_or_else(|| Path::new("."))))
}

impl ConfigFile {
    fn rebased(mut self, base: &Path) -> Self {
        let rebase = |p: &mut Option<PathBuf>| {
            if let Some(path) = p.as_mut() {
                if path.is_relative() && !base.as_os_str().is_empty() {
                    *path = base.join(&*path);
                }
            }
        };
        rebase(&mut self.bugsinpy_root);
        rebase(&mut self.descriptions_dir);
        rebase(&mut self.diffs_dir);
        rebase(&mut self.tool);
        rebase(&mut self.env_file);
        rebase(&mut self.output_dir);
        self
    }
}

/// Everything the evaluation loop needs to know about the corpus and the tool.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub bugsinpy_root: PathBuf,
    pub descriptions_dir: PathBuf,
    pub diffs_dir: Option<PathBuf>,
    pub project_template: String,
    pub case_count: u32,
    pub output_dir: PathBuf,
    pub tool: PathBuf,
    pub credential: CredentialSource,
    pub timeout: TimeoutPolicy,
}

impl HarnessConfig {
    /// Flags override the config file, which overrides the built-in defaults.
    pub fn resolve(args: &HarnessArgs, output: Option<&Path>) -> Result<Self> {
        let file = match &args.config {
            Some(path) => load_config_file(path)?,
            None => ConfigFile::default(),
        };

        let case_count = args.cases.or(file.cases).unwrap_or(DEFAULT_CASE_COUNT);
        if case_count == 0 {
            bail!("E_CONFIG_CASES: the number of cases must be at least 1");
        }

        let project_template = args
            .project_template
            .clone()
            .or(file.project_template)
            .unwrap_or_else(|| DEFAULT_PROJECT_TEMPLATE.to_string());
        if !project_template.contains("{case}") || !project_template.contains("{variant}") {
            bail!(
                "E_CONFIG_TEMPLATE: project template must contain {{case}} and {{variant}}: {project_template:?}"
            );
        }

        let diffs_dir = if args.no_diffs {
            None
        } else {
            args.diffs.clone().or(file.diffs_dir)
        };

        Ok(Self {
            bugsinpy_root: args
                .bugsinpy
                .clone()
                .or(file.bugsinpy_root)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BUGSINPY_ROOT)),
            descriptions_dir: args
                .descriptions
                .clone()
                .or(file.descriptions_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DESCRIPTIONS_DIR)),
            diffs_dir,
            project_template,
            case_count,
            output_dir: output
                .map(Path::to_path_buf)
                .or(file.output_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            tool: args
                .tool
                .clone()
                .or(file.tool)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TOOL)),
            credential: CredentialSource {
                env_var: args
                    .credential_env
                    .clone()
                    .or(file.credential_env)
                    .unwrap_or_else(|| DEFAULT_CREDENTIAL_ENV.to_string()),
                env_file: Some(
                    args.env_file
                        .clone()
                        .or(file.env_file)
                        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_FILE)),
                ),
            },
            timeout: TimeoutPolicy::from_ms(args.timeout_ms.or(file.timeout_ms)),
        })
    }

    pub fn total_invocations(&self) -> usize {
        self.case_count as usize * 2
    }

    pub fn description_path(&self, case: u32) -> PathBuf {
        self.descriptions_dir.join(format!("{case}.txt"))
    }

    pub fn project_dir(&self, case: u32, variant: Variant) -> PathBuf {
        let rel = self
            .project_template
            .replace("{case}", &case.to_string())
            .replace("{variant}", variant.as_str());
        self.bugsinpy_root.join(rel)
    }

    pub fn diff_path(&self, case: u32, variant: Variant) -> Option<PathBuf> {
        self.diffs_dir.as_ref().map(|dir| {
            dir.join(case.to_string())
                .join(format!("{}_patch.txt", variant.as_str()))
        })
    }

    pub fn results_path(&self) -> PathBuf {
        self.output_dir.join(RESULTS_FILE_NAME)
    }

    pub fn transcript_path(&self, case: u32, variant: Variant, kind: &str) -> PathBuf {
        self.output_dir.join(format!("{case}-{}-{kind}", variant.as_str()))
    }
}
