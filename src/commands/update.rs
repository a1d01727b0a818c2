use std::fmt::Display;

use anyhow::Result;
use chrono::Utc;
use colored::Colorize;
use log::warn;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::instrument;

use crate::App;
use crate::config::Config;
use crate::config::RollbackPolicy;
use crate::config::WorkflowConfig;
use crate::ops::error::RepoError;
use crate::ops::repository::PullRequest;
use crate::ops::repository::Remote;
use crate::ops::repository::RepositoryOps;
use crate::patch::EncodedBody;
use crate::patch::PatchError;
use crate::patch::ReplacementSet;
use crate::patch::patch_counted;

// -----------------------------------------------------------------------------
// Types

/// Step of the update workflow, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ReadBaseBranch,
    CreateBranch,
    FetchContent,
    PatchContent,
    CommitContent,
    CreatePullRequest,
    MergePullRequest,
    DeleteBranch,
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::ReadBaseBranch => "read base branch",
            Stage::CreateBranch => "create working branch",
            Stage::FetchContent => "fetch file content",
            Stage::PatchContent => "patch file content",
            Stage::CommitContent => "commit file content",
            Stage::CreatePullRequest => "create pull request",
            Stage::MergePullRequest => "merge pull request",
            Stage::DeleteBranch => "delete working branch",
        })
    }
}

/// Something a run created on the remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Leftover {
    Branch(String),
    PullRequest(u64),
}

impl Display for Leftover {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Leftover::Branch(branch) => write!(f, "branch {}", branch),
            Leftover::PullRequest(number) => write!(f, "pull request #{}", number),
        }
    }
}

#[derive(Debug, Error)]
pub enum UpdateCause {
    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Patch(#[from] PatchError),
}

/// A run that stopped at `stage`.
///
/// `leftovers` lists what is still on the remote because rollback was disabled
/// or did not succeed.
#[derive(Debug, Error)]
#[error("failed to {stage}: {source}{}", leftover_note(.leftovers))]
pub struct UpdateError {
    pub stage: Stage,
    #[source]
    pub source: UpdateCause,
    pub leftovers: Vec<Leftover>,
}

impl UpdateError {
    pub fn is_conflict(&self) -> bool {
        matches!(&self.source, UpdateCause::Repo(err) if err.is_conflict())
    }
}

fn leftover_note(leftovers: &[Leftover]) -> String {
    if leftovers.is_empty() {
        return String::new();
    }
    let items: Vec<String> = leftovers.iter().map(|l| l.to_string()).collect();
    format!(" (left on remote: {})", items.join(", "))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Merged {
        working_branch: String,
        pull_request: PullRequest,
        content_sha: String,
        merge_sha: String,
    },
    /// No tag matched, so there was nothing to propose
    Unchanged { working_branch: String },
}

impl UpdateOutcome {
    pub fn working_branch(&self) -> &str {
        match self {
            UpdateOutcome::Merged { working_branch, .. } => working_branch,
            UpdateOutcome::Unchanged { working_branch } => working_branch,
        }
    }
}

/// Inverse actions registered by completed steps, undone newest first
struct UndoLog {
    policy: RollbackPolicy,
    entries: Vec<Leftover>,
    /// Past the merge nothing is rolled back, only reported
    settled: bool,
}

impl UndoLog {
    fn new(policy: RollbackPolicy) -> Self {
        Self {
            policy,
            entries: Vec::new(),
            settled: false,
        }
    }

    fn push(&mut self, entry: Leftover) {
        self.entries.push(entry);
    }

    fn remove(&mut self, entry: &Leftover) {
        self.entries.retain(|e| e != entry);
    }

    fn settle(&mut self) {
        self.settled = true;
    }
}

fn at<E: Into<UpdateCause>>(stage: Stage) -> impl FnOnce(E) -> (Stage, UpdateCause) {
    move |err| (stage, err.into())
}

// -----------------------------------------------------------------------------
// Workflow

impl<R: RepositoryOps> App<R> {
    /// Patch `file_path` through a merged pull request.
    ///
    /// 1. Resolve the default branch head.
    /// 2. Create the working branch at that commit.
    /// 3. Read the file from the default branch.
    /// 4. Decode, apply `replacements`, re-encode.
    /// 5. Commit to the working branch, guarded by the blob SHA read in 3.
    /// 6. Open a pull request from the working branch into the default branch.
    /// 7. Merge it.
    /// 8. Delete the working branch.
    ///
    /// Any failure stops the run. Depending on the rollback policy the pull
    /// request is closed and the working branch deleted before returning.
    #[instrument(skip_all, fields(path = %file_path))]
    pub async fn update_deployment(
        &self,
        remote: &Remote,
        file_path: &str,
        replacements: &ReplacementSet,
        workflow: &WorkflowConfig,
    ) -> Result<UpdateOutcome, UpdateError> {
        let mut undo = UndoLog::new(workflow.rollback);
        match self
            .run_update(remote, file_path, replacements, workflow, &mut undo)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err((stage, source)) => {
                warn!("Update of {} failed to {}: {}", file_path, stage, source);
                let leftovers = self.unwind(remote, undo).await;
                Err(UpdateError {
                    stage,
                    source,
                    leftovers,
                })
            }
        }
    }

    async fn run_update(
        &self,
        remote: &Remote,
        file_path: &str,
        replacements: &ReplacementSet,
        workflow: &WorkflowConfig,
        undo: &mut UndoLog,
    ) -> Result<UpdateOutcome, (Stage, UpdateCause)> {
        let base = self
            .repo
            .get_branch(remote, &workflow.default_branch)
            .await
            .map_err(at(Stage::ReadBaseBranch))?;
        info!(branch = %base.branch, sha = %base.sha, "resolved base branch");

        let working_branch = workflow.branch_name(&base.sha, Utc::now());
        self.repo
            .create_branch(remote, &working_branch, &base.sha)
            .await
            .map_err(at(Stage::CreateBranch))?;
        undo.push(Leftover::Branch(working_branch.clone()));
        info!(branch = %working_branch, "created working branch");

        // Read from the default branch; the working branch is identical to it here
        let file = self
            .repo
            .get_file(remote, file_path, &workflow.default_branch)
            .await
            .map_err(at(Stage::FetchContent))?;

        let body = EncodedBody::decode(&file.content, &file.encoding)
            .map_err(at(Stage::PatchContent))?;
        let (patched, counts) = patch_counted(&body.text, replacements);
        for ((tag, _), count) in replacements.iter().zip(counts) {
            debug!(tag, count, "replaced tag");
        }

        if patched == body.text {
            info!("replacements changed nothing, removing working branch");
            undo.settle();
            self.delete_working_branch(remote, &working_branch)
                .await
                .map_err(at(Stage::DeleteBranch))?;
            return Ok(UpdateOutcome::Unchanged { working_branch });
        }

        let commit = self
            .repo
            .put_file(
                remote,
                file_path,
                &body.encode(&patched),
                &file.sha,
                &working_branch,
                &workflow.commit_message,
            )
            .await
            .map_err(at(Stage::CommitContent))?;
        info!(commit = %commit.commit_sha, "committed patched content");

        let pull_request = self
            .repo
            .create_pull_request(
                remote,
                &workflow.pr_title,
                &working_branch,
                &workflow.default_branch,
            )
            .await
            .map_err(at(Stage::CreatePullRequest))?;
        undo.push(Leftover::PullRequest(pull_request.number));
        info!(number = pull_request.number, "opened pull request");

        let merge = self
            .repo
            .merge_pull_request(
                remote,
                pull_request.number,
                &workflow.merge_message(Utc::now()),
            )
            .await
            .map_err(at(Stage::MergePullRequest))?;
        undo.remove(&Leftover::PullRequest(pull_request.number));
        undo.settle();
        info!(number = pull_request.number, sha = %merge.sha, "merged pull request");

        self.delete_working_branch(remote, &working_branch)
            .await
            .map_err(at(Stage::DeleteBranch))?;
        info!(branch = %working_branch, "deleted working branch");

        Ok(UpdateOutcome::Merged {
            working_branch,
            pull_request: PullRequest {
                merged: true,
                state: "closed".to_string(),
                ..pull_request
            },
            content_sha: commit.content_sha,
            merge_sha: merge.sha,
        })
    }

    /// Delete a branch; one that is already gone counts as deleted
    async fn delete_working_branch(&self, remote: &Remote, branch: &str) -> Result<(), RepoError> {
        match self.repo.delete_branch(remote, branch).await {
            Err(err) if err.is_not_found() => {
                warn!("Working branch {} was already gone: {}", branch, err);
                Ok(())
            }
            result => result,
        }
    }

    /// Undo registered steps newest first and return whatever remains
    async fn unwind(&self, remote: &Remote, undo: UndoLog) -> Vec<Leftover> {
        if undo.settled || undo.policy == RollbackPolicy::Leave {
            return undo.entries;
        }

        let mut leftovers = Vec::new();
        // A branch must outlive its open pull request
        let mut pull_request_open = false;
        for entry in undo.entries.into_iter().rev() {
            if pull_request_open && matches!(entry, Leftover::Branch(_)) {
                leftovers.push(entry);
                continue;
            }

            let result = match &entry {
                Leftover::PullRequest(number) => {
                    self.repo.close_pull_request(remote, *number).await
                }
                Leftover::Branch(branch) => self.delete_working_branch(remote, branch).await,
            };
            match result {
                Ok(()) => info!(%entry, "rolled back"),
                Err(err) => {
                    warn!("Could not roll back {}: {}", entry, err);
                    if matches!(entry, Leftover::PullRequest(_)) {
                        pull_request_open = true;
                    }
                    leftovers.push(entry);
                }
            }
        }
        leftovers.reverse();
        leftovers
    }

    pub async fn cmd_update(
        &self,
        config: &Config,
        file_path: &str,
        replacements: &ReplacementSet,
        stdout: &mut impl std::io::Write,
    ) -> Result<()> {
        writeln!(stdout, "Repository: {}", config.base_url)?;
        writeln!(stdout, "File: {}", file_path)?;

        let outcome = self
            .update_deployment(&config.remote(), file_path, replacements, &config.workflow)
            .await?;
        write_outcome(stdout, &outcome)?;

        Ok(())
    }
}

pub(crate) fn write_outcome(
    stdout: &mut impl std::io::Write,
    outcome: &UpdateOutcome,
) -> std::io::Result<()> {
    match outcome {
        UpdateOutcome::Merged {
            working_branch,
            pull_request,
            merge_sha,
            ..
        } => {
            let merged = format!("Merged PR #{}", pull_request.number);
            writeln!(stdout, "{} ({})", merged.green(), merge_sha)?;
            if !pull_request.html_url.is_empty() {
                writeln!(stdout, "{}", format!("  {}", pull_request.html_url).dimmed())?;
            }
            writeln!(stdout, "Deleted working branch {}", working_branch)?;
        }
        UpdateOutcome::Unchanged { working_branch } => {
            writeln!(
                stdout,
                "{}",
                "No tag matched, nothing to merge".yellow()
            )?;
            writeln!(stdout, "Deleted working branch {}", working_branch)?;
        }
    }
    Ok(())
}
