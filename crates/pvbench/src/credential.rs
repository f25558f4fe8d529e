use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::debug;

/// Where the API credential required by the tool under test comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSource {
    pub env_var: String,
    /// Dotenv file consulted when the variable is absent from the process environment.
    pub env_file: Option<PathBuf>,
}

pub struct Credential {
    pub name: String,
    value: String,
}

impl Credential {
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .finish()
    }
}

impl CredentialSource {
    pub fn resolve(&self) -> Result<Credential> {
        self.resolve_with(|key| std::env::var(key).ok())
    }

    /// The process environment wins over the dotenv file.
    pub fn resolve_with(&self, env_lookup: impl Fn(&str) -> Option<String>) -> Result<Credential> {
        if let Some(value) = env_lookup(&self.env_var) {
            debug!(name = %self.env_var, "credential found in process environment");
            return Ok(Credential {
                name: self.env_var.clone(),
                value,
            });
        }

        if let Some(path) = self.env_file.as_deref() {
            if let Some(value) = lookup_env_file(path, &self.env_var)? {
                debug!(name = %self.env_var, file = %path.display(), "credential found in env file");
                return Ok(Credential {
                    name: self.env_var.clone(),
                    value,
                });
            }
        }

        match &self.env_file {
            Some(path) => bail!(
                "E_CREDENTIAL_MISSING: missing {} in the environment or in {}",
                self.env_var,
                path.display()
            ),
            None => bail!(
                "E_CREDENTIAL_MISSING: missing {} in the environment",
                self.env_var
            ),
        }
    }
}

/// First assignment of `key` in a dotenv file; a missing file counts as empty.
fn lookup_env_file(path: &Path, key: &str) -> Result<Option<String>> {
    let entries = match dotenvy::from_path_iter(path) {
        Ok(entries) => entries,
        Err(err) if err.not_found() => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("read env file: {}", path.display()))
        }
    };
    for entry in entries {
        let (name, value) =
            entry.with_context(|| format!("parse env file: {}", path.display()))?;
        if name == key {
            return Ok(Some(value));
        }
    }
    Ok(None)
}
