use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use colored::Colorize;
use futures_util::future::join_all;
use serde::Deserialize;
use tracing::info;

use super::update::write_outcome;
use crate::App;
use crate::config::BranchNaming;
use crate::config::RollbackPolicy;
use crate::config::WorkflowConfig;
use crate::ops::repository::Remote;
use crate::ops::repository::RepositoryOps;
use crate::patch::ReplacementSet;

// -----------------------------------------------------------------------------
// Manifest

/// A list of independent update targets, usually one per repository.
///
/// ```yaml
/// targets:
///   - name: staging
///     base_url: https://api.github.com/repos/acme/deploy-staging
///     token_env: STAGING_TOKEN
///     file: config/app.yaml
///     replacements:
///       - tag: TAG_VERSION
///         value: "2.3.0"
/// ```
#[derive(Debug, Deserialize)]
pub struct Manifest {
    pub targets: Vec<Target>,
}

#[derive(Debug, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub name: Option<String>,
    pub base_url: String,
    /// Environment variable holding this target's token; defaults to the shared token
    #[serde(default)]
    pub token_env: Option<String>,
    pub file: String,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub working_branch: Option<String>,
    #[serde(default)]
    pub branch_naming: Option<BranchNaming>,
    #[serde(default)]
    pub rollback: Option<RollbackPolicy>,
    pub replacements: Vec<Replacement>,
}

#[derive(Debug, Deserialize)]
pub struct Replacement {
    pub tag: String,
    pub value: String,
}

impl Manifest {
    pub fn parse(yaml: &str) -> Result<Self> {
        let manifest: Manifest = serde_yml::from_str(yaml).context("Invalid manifest")?;
        if manifest.targets.is_empty() {
            bail!("Manifest has no targets");
        }
        Ok(manifest)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let yaml = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        Self::parse(&yaml)
    }
}

/// A target with every default filled in
struct Run {
    label: String,
    remote: Remote,
    file: String,
    replacements: ReplacementSet,
    workflow: WorkflowConfig,
}

impl Target {
    fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{} {}", self.base_url, self.file),
        }
    }

    fn resolve(
        &self,
        shared_token: Option<&str>,
        defaults: &WorkflowConfig,
        env: &impl Fn(&str) -> Option<String>,
    ) -> Result<Run> {
        let label = self.label();
        let token = match &self.token_env {
            Some(var) => env(var)
                .with_context(|| format!("{}: environment variable {} is not set", label, var))?,
            None => shared_token
                .map(str::to_string)
                .with_context(|| format!("{}: no token_env and no shared token", label))?,
        };

        let pairs = self
            .replacements
            .iter()
            .map(|r| (r.tag.clone(), r.value.clone()))
            .collect::<Vec<_>>();
        let replacements = ReplacementSet::try_from(pairs)
            .with_context(|| format!("{}: invalid replacement", label))?;

        let mut workflow = defaults.clone();
        if let Some(branch) = &self.default_branch {
            workflow.default_branch = branch.clone();
        }
        if let Some(branch) = &self.working_branch {
            workflow.working_branch = branch.clone();
        }
        if let Some(naming) = self.branch_naming {
            workflow.branch_naming = naming;
        }
        if let Some(rollback) = self.rollback {
            workflow.rollback = rollback;
        }

        Ok(Run {
            label,
            remote: Remote::new(self.base_url.clone(), token),
            file: self.file.clone(),
            replacements,
            workflow,
        })
    }
}

impl Run {
    fn repository(&self) -> &str {
        self.remote.base_url.trim_end_matches('/')
    }
}

/// A fixed branch left behind by one target would block the next on that repository
fn check_branch_collisions(runs: &[Run]) -> Result<()> {
    let mut seen = HashSet::new();
    for run in runs {
        if run.workflow.branch_naming != BranchNaming::Fixed {
            continue;
        }
        let key = (run.repository(), run.workflow.working_branch.as_str());
        if !seen.insert(key) {
            bail!(
                "{}: working branch {} is already used by another target on {}; \
                 use unique branch naming or a different working branch",
                run.label,
                run.workflow.working_branch,
                run.remote.base_url
            );
        }
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// Command

impl<R: RepositoryOps> App<R> {
    /// Run the update workflow for every target.
    ///
    /// Different repositories are updated concurrently. Targets sharing a
    /// repository run one after another in manifest order, so each branches
    /// from the previous merge. One target failing does not stop the others.
    /// Fails if any target failed.
    pub async fn cmd_apply(
        &self,
        manifest: &Manifest,
        shared_token: Option<&str>,
        defaults: &WorkflowConfig,
        stdout: &mut impl std::io::Write,
    ) -> Result<()> {
        self.apply_with_env(manifest, shared_token, defaults, stdout, |key| {
            std::env::var(key).ok()
        })
        .await
    }

    async fn apply_with_env(
        &self,
        manifest: &Manifest,
        shared_token: Option<&str>,
        defaults: &WorkflowConfig,
        stdout: &mut impl std::io::Write,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        let runs = manifest
            .targets
            .iter()
            .map(|target| target.resolve(shared_token, defaults, &env))
            .collect::<Result<Vec<_>>>()?;
        check_branch_collisions(&runs)?;

        let mut repositories: Vec<(&str, Vec<usize>)> = Vec::new();
        for (index, run) in runs.iter().enumerate() {
            match repositories.iter_mut().find(|(repo, _)| *repo == run.repository()) {
                Some((_, indices)) => indices.push(index),
                None => repositories.push((run.repository(), vec![index])),
            }
        }

        info!(
            targets = runs.len(),
            repositories = repositories.len(),
            "applying manifest"
        );
        let runs = &runs;
        let futures = repositories.iter().map(|(_, indices)| async move {
            let mut results = Vec::new();
            for &index in indices {
                let run = &runs[index];
                let result = self
                    .update_deployment(&run.remote, &run.file, &run.replacements, &run.workflow)
                    .await;
                results.push((index, result));
            }
            results
        });
        let mut results: Vec<_> = join_all(futures).await.into_iter().flatten().collect();
        results.sort_by_key(|(index, _)| *index);
        let results = results.into_iter().map(|(_, result)| result);

        let mut failed = 0;
        for (run, result) in runs.iter().zip(results) {
            writeln!(stdout, "{} {}", "==>".bold(), run.label.bold())?;
            match result {
                Ok(outcome) => write_outcome(stdout, &outcome)?,
                Err(err) => {
                    failed += 1;
                    writeln!(stdout, "{}", format!("Error: {}", err).red())?;
                }
            }
        }

        if failed > 0 {
            bail!("{} of {} targets failed", failed, runs.len());
        }
        Ok(())
    }
}
