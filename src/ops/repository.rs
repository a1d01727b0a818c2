#![allow(async_fn_in_trait)]

#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::instrument;

use super::error::RepoError;
use super::http::HttpRequest;
use super::http::Method;
use super::http::RequestExecutor;
use super::http::authorization_header;

// -----------------------------------------------------------------------------
// RepositoryOps trait

/// Operations against a repository on the hosting API.
///
/// Every method is exactly one request. Nothing here retries or compensates;
/// callers decide what a failure means.
#[cfg_attr(test, automock)]
pub trait RepositoryOps {
    /// Resolve a branch to the commit it points at
    async fn get_branch(&self, remote: &Remote, branch: &str)
    -> Result<RepositoryRef, RepoError>;

    /// Create `refs/heads/{branch}` pointing at `from_sha`
    async fn create_branch(
        &self,
        remote: &Remote,
        branch: &str,
        from_sha: &str,
    ) -> Result<RepositoryRef, RepoError>;

    async fn delete_branch(&self, remote: &Remote, branch: &str) -> Result<(), RepoError>;

    /// Fetch a file as seen from `git_ref`
    async fn get_file(
        &self,
        remote: &Remote,
        path: &str,
        git_ref: &str,
    ) -> Result<FileContent, RepoError>;

    /// Commit new base64 `content` for `path` on `branch`.
    ///
    /// `expected_sha` is the blob SHA the caller read; the host rejects the
    /// write with a conflict if the file has moved since.
    async fn put_file(
        &self,
        remote: &Remote,
        path: &str,
        content: &str,
        expected_sha: &str,
        branch: &str,
        message: &str,
    ) -> Result<CommitResult, RepoError>;

    async fn create_pull_request(
        &self,
        remote: &Remote,
        title: &str,
        head: &str,
        base: &str,
    ) -> Result<PullRequest, RepoError>;

    async fn merge_pull_request(
        &self,
        remote: &Remote,
        number: u64,
        commit_message: &str,
    ) -> Result<MergeResult, RepoError>;

    async fn close_pull_request(&self, remote: &Remote, number: u64) -> Result<(), RepoError>;
}

// -----------------------------------------------------------------------------
// Types

/// Where a repository lives and how to authenticate against it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    /// Repository API root, e.g. `https://api.github.com/repos/owner/repo`
    pub base_url: String,
    pub token: String,
}

impl Remote {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Percent-encode each segment of a branch name or file path, keeping the `/`
fn encode_segments(path: &str) -> String {
    path.trim_start_matches('/')
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRef {
    pub branch: String,
    pub sha: String,
}

/// A file as returned by the contents endpoint. `content` is still encoded.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileContent {
    pub path: String,
    pub sha: String,
    #[serde(default)]
    pub encoding: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    /// New blob SHA of the file
    pub content_sha: String,
    pub commit_sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub head: String,
    pub base: String,
    pub state: String,
    pub merged: bool,
    pub html_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub sha: String,
    pub message: String,
}

// Wire formats

#[derive(Debug, Deserialize)]
struct GitRef {
    #[serde(rename = "ref")]
    ref_name: String,
    object: GitObject,
}

#[derive(Debug, Deserialize)]
struct GitObject {
    sha: String,
}

/// Some hosts answer a ref lookup with every ref sharing the prefix
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RefLookup {
    Exact(GitRef),
    Matching(Vec<GitRef>),
}

#[derive(Debug, Serialize)]
struct CreateRef<'a> {
    #[serde(rename = "ref")]
    ref_name: String,
    sha: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdateFile<'a> {
    message: &'a str,
    content: &'a str,
    sha: &'a str,
    branch: &'a str,
}

#[derive(Debug, Deserialize)]
struct UpdateFileResponse {
    content: ContentSha,
    commit: CommitSha,
}

#[derive(Debug, Deserialize)]
struct ContentSha {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct CommitSha {
    sha: String,
}

#[derive(Debug, Serialize)]
struct CreatePullRequest<'a> {
    title: &'a str,
    head: &'a str,
    base: &'a str,
}

#[derive(Debug, Serialize)]
struct MergePullRequest<'a> {
    commit_message: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdatePullRequest<'a> {
    state: &'a str,
}

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    number: u64,
    #[serde(default)]
    title: String,
    head: BranchLabel,
    base: BranchLabel,
    #[serde(default)]
    state: String,
    #[serde(default)]
    merged: Option<bool>,
    #[serde(default)]
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct BranchLabel {
    #[serde(rename = "ref")]
    ref_name: String,
}

#[derive(Debug, Deserialize)]
struct MergeResponse {
    #[serde(default)]
    sha: Option<String>,
    merged: bool,
    #[serde(default)]
    message: String,
}

impl From<PullRequestResponse> for PullRequest {
    fn from(pr: PullRequestResponse) -> Self {
        Self {
            number: pr.number,
            title: pr.title,
            head: pr.head.ref_name,
            base: pr.base.ref_name,
            state: pr.state,
            merged: pr.merged.unwrap_or(false),
            html_url: pr.html_url,
        }
    }
}

// -----------------------------------------------------------------------------
// RealRepository

/// REST implementation over any request executor
pub struct RealRepository<E> {
    executor: E,
}

impl<E: RequestExecutor> RealRepository<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    /// Send a request and turn any non-2xx status into a typed error
    async fn send(
        &self,
        remote: &Remote,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<String, RepoError> {
        let request = HttpRequest {
            method,
            url: remote.url(path),
            authorization: authorization_header(&remote.token),
            body,
        };
        debug!(method = %request.method, url = %request.url, "sending request");

        let response = self.executor.execute(request).await?;
        debug!(status = response.status, "received response");

        if !response.is_success() {
            return Err(RepoError::from_status(response.status, &response.body));
        }
        Ok(response.body)
    }
}

impl<E: RequestExecutor> RepositoryOps for RealRepository<E> {
    #[instrument(skip_all, fields(branch = %branch))]
    async fn get_branch(&self, remote: &Remote, branch: &str) -> Result<RepositoryRef, RepoError> {
        let path = format!("/git/refs/heads/{}", encode_segments(branch));
        let response = self.send(remote, Method::Get, &path, None).await?;

        let wanted = format!("refs/heads/{}", branch);
        let git_ref = match serde_json::from_str::<RefLookup>(&response)? {
            RefLookup::Exact(git_ref) => Some(git_ref),
            RefLookup::Matching(refs) => refs.into_iter().find(|r| r.ref_name == wanted),
        }
        .filter(|r| r.ref_name == wanted)
        .ok_or_else(|| RepoError::NotFound {
            message: format!("no branch named {}", branch),
        })?;

        Ok(RepositoryRef {
            branch: branch.to_string(),
            sha: git_ref.object.sha,
        })
    }

    #[instrument(skip_all, fields(branch = %branch))]
    async fn create_branch(
        &self,
        remote: &Remote,
        branch: &str,
        from_sha: &str,
    ) -> Result<RepositoryRef, RepoError> {
        let request_body = CreateRef {
            ref_name: format!("refs/heads/{}", branch),
            sha: from_sha,
        };
        let json_data = serde_json::to_string(&request_body)?;
        let response = self
            .send(remote, Method::Post, "/git/refs", Some(json_data))
            .await?;
        let git_ref: GitRef = serde_json::from_str(&response)?;

        Ok(RepositoryRef {
            branch: branch.to_string(),
            sha: git_ref.object.sha,
        })
    }

    #[instrument(skip_all, fields(branch = %branch))]
    async fn delete_branch(&self, remote: &Remote, branch: &str) -> Result<(), RepoError> {
        let path = format!("/git/refs/heads/{}", encode_segments(branch));
        match self.send(remote, Method::Delete, &path, None).await {
            Ok(_) => Ok(()),
            // GitHub reports a missing ref on delete as 422
            Err(RepoError::Conflict { message, .. }) if message.contains("does not exist") => {
                Err(RepoError::NotFound { message })
            }
            Err(err) => Err(err),
        }
    }

    #[instrument(skip_all, fields(path = %path, git_ref = %git_ref))]
    async fn get_file(
        &self,
        remote: &Remote,
        path: &str,
        git_ref: &str,
    ) -> Result<FileContent, RepoError> {
        let url_path = format!(
            "/contents/{}?ref={}",
            encode_segments(path),
            urlencoding::encode(git_ref)
        );
        let response = self.send(remote, Method::Get, &url_path, None).await?;
        serde_json::from_str(&response)
            .map_err(|e| RepoError::Decode(format!("{} is not a file: {}", path, e)))
    }

    #[instrument(skip_all, fields(path = %path, branch = %branch))]
    async fn put_file(
        &self,
        remote: &Remote,
        path: &str,
        content: &str,
        expected_sha: &str,
        branch: &str,
        message: &str,
    ) -> Result<CommitResult, RepoError> {
        let request_body = UpdateFile {
            message,
            content,
            sha: expected_sha,
            branch,
        };
        let json_data = serde_json::to_string(&request_body)?;
        let url_path = format!("/contents/{}", encode_segments(path));
        let response = self
            .send(remote, Method::Put, &url_path, Some(json_data))
            .await?;
        let update: UpdateFileResponse = serde_json::from_str(&response)?;

        Ok(CommitResult {
            content_sha: update.content.sha,
            commit_sha: update.commit.sha,
        })
    }

    #[instrument(skip_all, fields(head = %head, base = %base))]
    async fn create_pull_request(
        &self,
        remote: &Remote,
        title: &str,
        head: &str,
        base: &str,
    ) -> Result<PullRequest, RepoError> {
        let request_body = CreatePullRequest { title, head, base };
        let json_data = serde_json::to_string(&request_body)?;
        let response = self
            .send(remote, Method::Post, "/pulls", Some(json_data))
            .await?;
        let pr: PullRequestResponse = serde_json::from_str(&response)?;
        Ok(pr.into())
    }

    #[instrument(skip_all, fields(number = number))]
    async fn merge_pull_request(
        &self,
        remote: &Remote,
        number: u64,
        commit_message: &str,
    ) -> Result<MergeResult, RepoError> {
        let request_body = MergePullRequest { commit_message };
        let json_data = serde_json::to_string(&request_body)?;
        let path = format!("/pulls/{}/merge", number);
        let response = self
            .send(remote, Method::Put, &path, Some(json_data))
            .await?;
        let merge: MergeResponse = serde_json::from_str(&response)?;

        match (merge.merged, merge.sha) {
            (true, Some(sha)) => Ok(MergeResult {
                sha,
                message: merge.message,
            }),
            _ => Err(RepoError::Conflict {
                status: 200,
                message: format!("pull request {} was not merged: {}", number, merge.message),
            }),
        }
    }

    #[instrument(skip_all, fields(number = number))]
    async fn close_pull_request(&self, remote: &Remote, number: u64) -> Result<(), RepoError> {
        let request_body = UpdatePullRequest { state: "closed" };
        let json_data = serde_json::to_string(&request_body)?;
        let path = format!("/pulls/{}", number);
        self.send(remote, Method::Patch, &path, Some(json_data))
            .await?;
        Ok(())
    }
}
