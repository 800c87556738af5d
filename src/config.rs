//! Runtime configuration types.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::vm::cpu::DEFAULT_STACK_LIMIT;
use crate::vm::heap::DEFAULT_HEAP_LIMIT;

/// Array reachability used by the mark phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GcMode {
    /// Stack roots plus one hop through arrays referenced from the stack.
    #[default]
    Shallow,
    /// Follow array references to a fixed point.
    Transitive,
}

/// Format of the statistics printed after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsFormat {
    #[default]
    Human,
    Json,
}

/// Runtime configuration for the VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub gc_mode: GcMode,
    /// Hard ceiling on the stack, in words.
    pub stack_limit: usize,
    /// Limit on live array words (None = unlimited, only reachable from code)
    pub heap_limit: Option<usize>,
    pub gc_stats: bool,
    /// Print machine statistics after the run.
    pub stats: Option<StatsFormat>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            gc_mode: GcMode::Shallow,
            stack_limit: DEFAULT_STACK_LIMIT,
            heap_limit: Some(DEFAULT_HEAP_LIMIT),
            gc_stats: false,
            stats: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl RuntimeConfig {
    /// Load configuration from a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.gc_mode, GcMode::Shallow);
        assert_eq!(config.stack_limit, 1 << 30);
        assert_eq!(config.heap_limit, Some(1 << 28));
        assert_eq!(config.stats, None);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: RuntimeConfig = toml::from_str(
            r#"
gc_mode = "transitive"
heap_limit = 4096
stats = "json"
"#,
        )
        .unwrap();
        assert_eq!(config.gc_mode, GcMode::Transitive);
        assert_eq!(config.heap_limit, Some(4096));
        assert_eq!(config.stats, Some(StatsFormat::Json));
        assert_eq!(config.stack_limit, DEFAULT_STACK_LIMIT);
        assert!(!config.gc_stats);
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ijvm.toml");
        fs::write(&path, "gc_mode = \"sideways\"\n").unwrap();
        let err = RuntimeConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("ijvm.toml"));

        let missing = RuntimeConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
