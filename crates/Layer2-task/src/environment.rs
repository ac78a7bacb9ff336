//! Environment lookups that live outside the environment record

use caravel_foundation::{EnvironmentSettings, MemoCache};
use std::path::Path;
use tracing::debug;

/// Whether `path` is the root of a git working tree
pub fn probe_git_dir(path: &Path) -> bool {
    path.join(".git").exists()
}

/// Memoized "is this environment's workdir a git repository" flags
///
/// Keyed by environment id. Callers invalidate an entry whenever they
/// change the environment it belongs to.
#[derive(Debug, Default)]
pub struct RepoProbeCache {
    memo: MemoCache<String, bool>,
}

impl RepoProbeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached probe result for `env`, running `probe` on a miss
    ///
    /// Environments without a workdir are never repositories and are not
    /// cached.
    pub fn is_git_repo(&self, env: &EnvironmentSettings, probe: impl FnOnce(&Path) -> bool) -> bool {
        let Some(workdir) = env.host_workdir.as_deref() else {
            return false;
        };
        self.memo.get_or_insert_with(&env.id, || {
            let found = probe(workdir);
            debug!(environment = %env.id, workdir = %workdir.display(), found, "Probed workdir");
            found
        })
    }

    /// Forget the flag of one environment
    pub fn invalidate(&self, environment_id: &str) -> bool {
        self.memo.invalidate(&environment_id.to_string())
    }

    pub fn clear(&self) {
        self.memo.clear();
    }
}
