//! Version-control collaborators
//!
//! Repository preparation and PR metadata live outside the core. The
//! supervisor only calls these traits and passes their results through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Repository preparation failure
#[derive(Debug, Error)]
pub enum VcsError {
    #[error("failed to clone {repo}: {message}")]
    Clone { repo: String, message: String },

    #[error("failed to create branch {branch}: {message}")]
    Branch { branch: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What to check out before the first attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsRequest {
    /// Repository reference (URL or `owner/name`)
    pub repo: String,
    /// Branch to base the work on; `None` uses the remote default
    pub base_branch: Option<String>,
}

/// Result of repository preparation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsCheckout {
    pub repo_root: PathBuf,
    pub base_branch: String,
    pub branch: String,
}

/// Optional pull request text written by the agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrMetadata {
    pub title: Option<String>,
    pub body: Option<String>,
}

/// Repository preparation service
#[async_trait]
pub trait VcsPreparer: Send + Sync {
    /// Check out `request` into `dest`
    async fn prepare(&self, request: &VcsRequest, dest: &Path) -> Result<VcsCheckout, VcsError>;
}

/// PR metadata store, read once when a VCS-linked run finishes
pub trait PrMetadataSource: Send + Sync {
    fn read(&self, checkout: &VcsCheckout) -> Option<PrMetadata>;
}
