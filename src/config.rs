//! Runtime configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StormError};

/// Knobs shared by every query a [`crate::runtime::Runtime`] executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Entries a spooled collection keeps in memory before moving to disk.
    pub spool_threshold: usize,
    /// Parent directory for spool databases. Defaults to the system temp dir.
    pub scratch_dir: Option<PathBuf>,
    /// Maximum nesting of function calls and module imports.
    pub max_call_depth: usize,
    /// Wall-clock budget per query, in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Upper bound on items a single `for` loop may iterate.
    pub max_loop_items: Option<usize>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self::balanced()
    }
}

impl RuntimeOptions {
    /// General purpose defaults.
    pub fn balanced() -> Self {
        Self {
            spool_threshold: 10_000,
            scratch_dir: None,
            max_call_depth: 128,
            timeout_ms: None,
            max_loop_items: None,
        }
    }

    /// Spools early and bounds loops, for constrained hosts.
    pub fn low_memory() -> Self {
        Self {
            spool_threshold: 256,
            max_loop_items: Some(1_000_000),
            ..Self::balanced()
        }
    }

    /// Parses options from a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let opts: RuntimeOptions = toml::from_str(text)?;
        opts.validate()?;
        Ok(opts)
    }

    /// Reads options from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|err| StormError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Directory spooled collections allocate under.
    pub fn scratch_path(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Timeout as a duration.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<()> {
        if self.max_call_depth == 0 {
            return Err(StormError::Config(
                "max_call_depth must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_defaults() -> Result<()> {
        let opts = RuntimeOptions::from_toml_str(
            r#"
            spool_threshold = 5
            timeout_ms = 250
            scratch_dir = "/tmp/storm-scratch"
            "#,
        )?;
        assert_eq!(opts.spool_threshold, 5);
        assert_eq!(opts.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(opts.scratch_path(), PathBuf::from("/tmp/storm-scratch"));
        assert_eq!(opts.max_call_depth, RuntimeOptions::balanced().max_call_depth);
        Ok(())
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let err = RuntimeOptions::from_toml_str("spool_threshold = \"lots\"")
            .expect_err("string threshold must fail");
        assert_eq!(err.code(), "ConfigError");
    }

    #[test]
    fn zero_call_depth_rejected() {
        let err = RuntimeOptions::from_toml_str("max_call_depth = 0").expect_err("must fail");
        assert_eq!(err.code(), "ConfigError");
    }

    #[test]
    fn load_reads_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("storm.toml");
        fs::write(&path, "spool_threshold = 7\n")?;
        assert_eq!(RuntimeOptions::load(&path)?.spool_threshold, 7);
        Ok(())
    }
}
