//! Host-to-container path translation.
//!
//! When the orchestrator itself runs inside a container, the host paths named
//! in the configuration are mounted at different locations. The mapping is
//! built once at process start from environment variables and applied at
//! every filesystem boundary.

use std::path::{Path, PathBuf};

use crate::model::PathsConfig;

/// Environment variable remapping the pool root.
pub const ENV_PATH_POOL: &str = "ORCH_PATH_POOL";
/// Environment variable remapping the scratch root.
pub const ENV_PATH_SCRATCH: &str = "ORCH_PATH_SCRATCH";
/// Environment variable remapping the appdata root.
pub const ENV_PATH_APPDATA: &str = "ORCH_PATH_APPDATA";

/// Longest-prefix path rewriter from config (host) paths to the mountpoints
/// visible to this process.
#[derive(Debug, Clone, Default)]
pub struct PathMap {
    rules: Vec<(PathBuf, PathBuf)>,
}

impl PathMap {
    /// Build the map from `ORCH_PATH_*` environment variables, anchored at
    /// the roots declared in the document. Unset variables contribute no
    /// rule, so on a bare host the map is the identity.
    #[must_use]
    pub fn from_env(paths: &PathsConfig) -> Self {
        let mut rules = Vec::new();
        if let Ok(target) = std::env::var(ENV_PATH_POOL) {
            rules.push((paths.pool.clone(), PathBuf::from(target)));
        }
        if let Ok(target) = std::env::var(ENV_PATH_SCRATCH)
            && let Some(scratch) = &paths.scratch
        {
            rules.push((scratch.clone(), PathBuf::from(target)));
        }
        if let Ok(target) = std::env::var(ENV_PATH_APPDATA) {
            rules.push((paths.appdata.clone(), PathBuf::from(target)));
        }
        Self::with_rules(rules)
    }

    /// Build the map from explicit `(host_prefix, local_prefix)` rules.
    #[must_use]
    pub fn with_rules(mut rules: Vec<(PathBuf, PathBuf)>) -> Self {
        // Longest prefix first so nested roots win over their parents.
        rules.sort_by_key(|(from, _)| std::cmp::Reverse(from.components().count()));
        Self { rules }
    }

    /// Rewrite a host path to the locally visible equivalent. Paths outside
    /// every rule pass through unchanged.
    #[must_use]
    pub fn translate(&self, path: &Path) -> PathBuf {
        for (from, to) in &self.rules {
            if let Ok(rest) = path.strip_prefix(from) {
                return to.join(rest);
            }
        }
        path.to_path_buf()
    }

    /// Whether the map carries any rules at all.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.rules.is_empty()
    }
}
