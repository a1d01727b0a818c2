use anyhow::Context;
use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use clap::ValueEnum;
use serde::Deserialize;

use crate::ops::repository::Remote;

pub const DEFAULT_BRANCH: &str = "main";
pub const WORKING_BRANCH: &str = "gitops-tag";
pub const PR_TITLE: &str = "create-pull-request";
pub const COMMIT_MESSAGE: &str = "update file, modify tag";
/// `{time}` is replaced with the merge time in RFC 3339
pub const MERGE_MESSAGE: &str = "merge-message,time by {time}";

/// How the working branch is named for each run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchNaming {
    /// Configured name plus a timestamp and base SHA suffix, so runs never collide
    #[default]
    Unique,
    /// Configured name as-is; concurrent runs on one repository will conflict
    Fixed,
}

/// What to do with branches and pull requests created by a run that fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackPolicy {
    /// Close the pull request and delete the working branch, newest first
    #[default]
    Compensate,
    /// Leave everything in place for manual inspection
    Leave,
}

/// Per-run workflow settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowConfig {
    pub default_branch: String,
    pub working_branch: String,
    pub branch_naming: BranchNaming,
    pub rollback: RollbackPolicy,
    pub pr_title: String,
    pub commit_message: String,
    pub merge_message: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_branch: DEFAULT_BRANCH.to_string(),
            working_branch: WORKING_BRANCH.to_string(),
            branch_naming: BranchNaming::default(),
            rollback: RollbackPolicy::default(),
            pr_title: PR_TITLE.to_string(),
            commit_message: COMMIT_MESSAGE.to_string(),
            merge_message: MERGE_MESSAGE.to_string(),
        }
    }
}

impl WorkflowConfig {
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whichever `GITOPS_*` workflow variables are set
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut workflow = Self::default();
        if let Some(branch) = lookup("GITOPS_DEFAULT_BRANCH") {
            workflow.default_branch = branch;
        }
        if let Some(branch) = lookup("GITOPS_WORKING_BRANCH") {
            workflow.working_branch = branch;
        }
        if let Some(naming) = lookup("GITOPS_BRANCH_NAMING") {
            workflow.branch_naming = BranchNaming::from_str(&naming, true)
                .map_err(|e| anyhow::anyhow!("GITOPS_BRANCH_NAMING: {}", e))?;
        }
        if let Some(rollback) = lookup("GITOPS_ROLLBACK") {
            workflow.rollback = RollbackPolicy::from_str(&rollback, true)
                .map_err(|e| anyhow::anyhow!("GITOPS_ROLLBACK: {}", e))?;
        }
        Ok(workflow)
    }

    /// Name of the working branch for a run starting from `base_sha`
    pub fn branch_name(&self, base_sha: &str, now: DateTime<Utc>) -> String {
        match self.branch_naming {
            BranchNaming::Fixed => self.working_branch.clone(),
            BranchNaming::Unique => {
                let short_sha: String = base_sha.chars().take(7).collect();
                format!(
                    "{}-{}-{}",
                    self.working_branch,
                    now.format("%Y%m%d%H%M%S"),
                    short_sha
                )
            }
        }
    }

    pub fn merge_message(&self, now: DateTime<Utc>) -> String {
        self.merge_message.replace("{time}", &now.to_rfc3339())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub base_url: String,
    pub token: String,
    pub workflow: WorkflowConfig,
}

impl Config {
    /// Load config from `GITOPS_*` variables, looked up through `lookup`
    /// (the environment, or CLI flags layered over it)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let base_url = lookup("GITOPS_BASE_URL")
            .context("GITOPS_BASE_URL is not set (e.g. https://api.github.com/repos/owner/repo)")?;
        let token = lookup("GITOPS_TOKEN").context("GITOPS_TOKEN is not set")?;
        let workflow = WorkflowConfig::from_lookup(&lookup)?;

        Ok(Self::new(base_url, token, workflow))
    }

    pub fn new(base_url: String, token: String, workflow: WorkflowConfig) -> Self {
        Self {
            base_url,
            token,
            workflow,
        }
    }

    /// Default config for tests
    pub fn default_for_tests() -> Self {
        Self {
            base_url: "https://api.example.test/repos/acme/deploy".to_string(),
            token: "test-token".to_string(),
            workflow: WorkflowConfig {
                working_branch: "release-patch".to_string(),
                branch_naming: BranchNaming::Fixed,
                ..WorkflowConfig::default()
            },
        }
    }

    pub fn remote(&self) -> Remote {
        Remote::new(self.base_url.clone(), self.token.clone())
    }
}
