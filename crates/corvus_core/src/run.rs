use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One resolved run of a sweep, as handed over by the configuration driver.
///
/// Immutable for the lifetime of a batch. `ordinal` determines where the run's
/// outcome lands in the [`BatchResult`](crate::job::BatchResult).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSpec {
    pub ordinal: usize,
    /// Parameter name to value, already resolved.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Working and output directory of the run.
    pub output_dir: PathBuf,
}

impl RunSpec {
    pub fn new(ordinal: usize, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            ordinal,
            params: BTreeMap::new(),
            output_dir: output_dir.into(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}
