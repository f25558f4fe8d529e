use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::util;

/// Ground-truth label of a good patch, and the prediction for "tool judged correct".
pub const LABEL_CORRECT: u8 = 1;
/// Ground-truth label of a bad patch, and the prediction for "tool judged buggy".
pub const LABEL_BUGGY: u8 = 0;

/// Two parallel label sequences, appended in evaluation order.
///
/// The length of the set is the resume checkpoint: entry `i` belongs to the `i`th
/// invocation of the `case1-good, case1-bad, case2-good, ...` ordering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSet {
    #[serde(default)]
    pub y_true: Vec<u8>,
    #[serde(default)]
    pub y_pred: Vec<u8>,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.y_true.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y_true.is_empty()
    }

    pub fn push(&mut self, true_label: u8, predicted_label: u8) {
        self.y_true.push(true_label);
        self.y_pred.push(predicted_label);
    }

    pub fn pairs(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        self.y_true.iter().copied().zip(self.y_pred.iter().copied())
    }

    pub fn validate(&self) -> Result<()> {
        if self.y_true.len() != self.y_pred.len() {
            bail!(
                "E_RESULTS_LEN_MISMATCH: y_true has {} entries but y_pred has {}",
                self.y_true.len(),
                self.y_pred.len()
            );
        }
        for (key, labels) in [("y_true", &self.y_true), ("y_pred", &self.y_pred)] {
            if let Some((idx, label)) = labels
                .iter()
                .enumerate()
                .find(|(_, l)| **l != LABEL_CORRECT && **l != LABEL_BUGGY)
            {
                bail!("E_RESULTS_LABEL: {key}[{idx}] = {label} is not a 0/1 label");
            }
        }
        Ok(())
    }
}

pub fn parse_result_set(bytes: &[u8]) -> Result<ResultSet> {
    let set: ResultSet = serde_json::from_slice(bytes).context("parse results JSON")?;
    set.validate()?;
    Ok(set)
}

/// Reads a results file that must exist and be well formed.
pub fn read_result_set(path: &Path) -> Result<ResultSet> {
    let bytes = std::fs::read(path).with_context(|| format!("read: {}", path.display()))?;
    parse_result_set(&bytes).with_context(|| format!("decode results: {}", path.display()))
}

/// The resume checkpoint on disk.
#[derive(Debug, Clone)]
pub struct ResultStore {
    path: PathBuf,
}

impl ResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means a fresh run. A file that exists but cannot be decoded is
    /// reported and discarded so the run starts over instead of failing.
    pub fn load(&self) -> Result<ResultSet> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no existing results");
                return Ok(ResultSet::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read: {}", self.path.display()));
            }
        };

        match parse_result_set(&bytes) {
            Ok(set) => Ok(set),
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %format!("{err:#}"),
                    "could not load existing results; starting from an empty result set"
                );
                Ok(ResultSet::default())
            }
        }
    }

    pub fn save(&self, set: &ResultSet) -> Result<()> {
        set.validate()
            .with_context(|| format!("refusing to save results: {}", self.path.display()))?;
        let bytes = util::pretty_json_bytes(set)?;
        util::write_atomic(&self.path, &bytes)
            .with_context(|| format!("write results: {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> ResultStore {
        ResultStore::new(dir.path().join("results.json"))
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let set = store_in(&dir).load().expect("load");
        assert!(set.is_empty());
    }

    #[test]
    fn load_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        std::fs::write(store.path(), b"{not json").expect("write");
        assert_eq!(store.load().expect("load"), ResultSet::default());
    }

    #[test]
    fn load_mismatched_lengths_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        std::fs::write(store.path(), br#"{"y_true":[1,0,1],"y_pred":[1]}"#).expect("write");
        assert!(store.load().expect("load").is_empty());
    }

    #[test]
    fn load_non_binary_labels_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        std::fs::write(store.path(), br#"{"y_true":[1,2],"y_pred":[1,0]}"#).expect("write");
        assert!(store.load().expect("load").is_empty());
    }

    #[test]
    fn save_then_load_preserves_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        let mut set = ResultSet::default();
        set.push(1, 1);
        set.push(0, 1);
        set.push(1, 0);
        store.save(&set).expect("save");

        let loaded = store.load().expect("load");
        assert_eq!(loaded, set);
        assert_eq!(loaded.y_true.len(), loaded.y_pred.len());

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).expect("read")).expect("json");
        assert_eq!(raw["y_true"], serde_json::json!([1, 0, 1]));
        assert_eq!(raw["y_pred"], serde_json::json!([1, 1, 0]));
    }

    #[test]
    fn save_rejects_mismatched_lengths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        let set = ResultSet {
            y_true: vec![1, 0],
            y_pred: vec![1],
        };
        let err = store.save(&set).expect_err("must refuse");
        assert!(format!("{err:#}").contains("E_RESULTS_LEN_MISMATCH"));
        assert!(!store.path().exists());
    }

    #[test]
    fn missing_keys_decode_as_empty() {
        let set = parse_result_set(b"{}").expect("parse");
        assert!(set.is_empty());
    }
}
