use std::collections::BTreeMap;
use std::sync::Mutex;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use gitops_tag::ops::error::RepoError;
use gitops_tag::ops::http::HttpRequest;
use gitops_tag::ops::http::HttpResponse;
use gitops_tag::ops::http::Method;
use gitops_tag::ops::http::RequestExecutor;
use serde_json::Value;
use serde_json::json;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::Layer as _;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

pub const BASE_URL: &str = "https://api.example.test/repos/acme/deploy";

pub fn setup_logging() -> anyhow::Result<()> {
    let timer = tracing_subscriber::fmt::time::ChronoLocal::new("%H:%M:%S%.3f".into());
    let format = tracing_subscriber::fmt::format().with_timer(timer);
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;
    let subscriber = tracing_subscriber::fmt::layer()
        .event_format(format)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_test_writer()
        .with_filter(filter);
    tracing_subscriber::registry().with(subscriber).try_init()?;
    Ok(())
}

// -----------------------------------------------------------------------------
// FakeHost

/// Files of one commit, path -> (blob sha, text)
type Tree = BTreeMap<String, (String, String)>;

#[derive(Debug, Clone)]
pub struct FakePullRequest {
    pub title: String,
    pub head: String,
    pub base: String,
    pub state: String,
    pub merged: bool,
}

#[derive(Default)]
struct State {
    branches: BTreeMap<String, String>,
    commits: BTreeMap<String, Tree>,
    pulls: BTreeMap<u64, FakePullRequest>,
    next_id: u64,
    failures: Vec<(Method, String, u16, String)>,
    log: Vec<String>,
}

impl State {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{}", prefix, self.next_id)
    }

    fn tree(&self, branch: &str) -> Option<&Tree> {
        self.branches
            .get(branch)
            .and_then(|sha| self.commits.get(sha))
    }
}

/// In-memory repository host speaking the REST dialect `RealRepository` uses.
///
/// Commits are whole trees; a merge makes the base branch point at the head's
/// tree. Every request is logged as `METHOD path`.
pub struct FakeHost {
    state: Mutex<State>,
}

impl FakeHost {
    /// A repository whose `branch` points at `sha` and holds `files`
    pub fn new(branch: &str, sha: &str, files: &[(&str, &str)]) -> Self {
        let mut state = State::default();
        let tree = files
            .iter()
            .enumerate()
            .map(|(i, (path, text))| {
                (path.to_string(), (format!("blob{}", i + 1), text.to_string()))
            })
            .collect();
        state.commits.insert(sha.to_string(), tree);
        state.branches.insert(branch.to_string(), sha.to_string());
        state.next_id = 100;
        Self {
            state: Mutex::new(state),
        }
    }

    /// Answer the first request matching `method` whose path contains
    /// `path_part` with an error instead of handling it
    pub fn fail_on(&self, method: Method, path_part: &str, status: u16, message: &str) {
        self.state.lock().unwrap().failures.push((
            method,
            path_part.to_string(),
            status,
            message.to_string(),
        ));
    }

    pub fn add_branch(&self, branch: &str, from: &str) {
        let mut state = self.state.lock().unwrap();
        let sha = state.branches[from].clone();
        state.branches.insert(branch.to_string(), sha);
    }

    pub fn branches(&self) -> Vec<String> {
        self.state.lock().unwrap().branches.keys().cloned().collect()
    }

    pub fn file_text(&self, branch: &str, path: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .tree(branch)
            .and_then(|tree| tree.get(path))
            .map(|(_, text)| text.clone())
    }

    pub fn pull_request(&self, number: u64) -> Option<FakePullRequest> {
        self.state.lock().unwrap().pulls.get(&number).cloned()
    }

    pub fn request_log(&self) -> String {
        self.state.lock().unwrap().log.join("\n")
    }

    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        let mut state = self.state.lock().unwrap();
        let path = request.url.strip_prefix(BASE_URL).unwrap_or(&request.url);
        state.log.push(format!("{} {}", request.method, path));

        if request.authorization != "Bearer test-token" {
            return error(401, "Bad credentials");
        }
        let failure = state
            .failures
            .iter()
            .position(|(method, part, _, _)| *method == request.method && path.contains(part));
        if let Some(i) = failure {
            let (_, _, status, message) = state.failures.remove(i);
            return error(status, &message);
        }

        let body: Value = request
            .body
            .as_deref()
            .map(|b| serde_json::from_str(b).unwrap())
            .unwrap_or(Value::Null);
        let (path, query) = path.split_once('?').unwrap_or((path, ""));
        let path = path.to_string();
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

        match (request.method, segments.as_slice()) {
            (Method::Get, ["git", "refs", "heads", branch @ ..]) => {
                let branch = branch.join("/");
                match state.branches.get(&branch) {
                    Some(sha) => ok(json!({
                        "ref": format!("refs/heads/{}", branch),
                        "object": {"sha": sha, "type": "commit"},
                    })),
                    None => error(404, "Not Found"),
                }
            }
            (Method::Post, ["git", "refs"]) => {
                let name = body["ref"].as_str().unwrap();
                let branch = name.trim_start_matches("refs/heads/").to_string();
                let sha = body["sha"].as_str().unwrap().to_string();
                if state.branches.contains_key(&branch) {
                    return error(422, "Reference already exists");
                }
                if !state.commits.contains_key(&sha) {
                    return error(422, "Object does not exist");
                }
                state.branches.insert(branch, sha.clone());
                created(json!({"ref": name, "object": {"sha": sha, "type": "commit"}}))
            }
            (Method::Delete, ["git", "refs", "heads", branch @ ..]) => {
                match state.branches.remove(&branch.join("/")) {
                    Some(_) => HttpResponse {
                        status: 204,
                        body: String::new(),
                    },
                    None => error(422, "Reference does not exist"),
                }
            }
            (Method::Get, ["contents", file @ ..]) => {
                let file = file.join("/");
                let git_ref = query.strip_prefix("ref=").unwrap_or("main");
                match state.tree(git_ref).and_then(|tree| tree.get(&file)) {
                    Some((sha, text)) => ok(json!({
                        "type": "file",
                        "encoding": "base64",
                        "path": file,
                        "sha": sha,
                        "content": wrapped_base64(text),
                    })),
                    None => error(404, "Not Found"),
                }
            }
            (Method::Put, ["contents", file @ ..]) => {
                let file = file.join("/");
                let branch = body["branch"].as_str().unwrap().to_string();
                let Some(mut tree) = state.tree(&branch).cloned() else {
                    return error(404, &format!("Branch {} not found", branch));
                };
                let expected = body["sha"].as_str().unwrap_or_default();
                if tree.get(&file).map(|(sha, _)| sha.as_str()) != Some(expected) {
                    return error(409, &format!("{} does not match {}", file, expected));
                }
                let compact: String = body["content"]
                    .as_str()
                    .unwrap()
                    .split_whitespace()
                    .collect();
                let text = String::from_utf8(STANDARD.decode(compact).unwrap()).unwrap();

                let blob = state.next("blob");
                let commit = state.next("commit");
                tree.insert(file.clone(), (blob.clone(), text));
                state.commits.insert(commit.clone(), tree);
                state.branches.insert(branch, commit.clone());
                ok(json!({"content": {"path": file, "sha": blob}, "commit": {"sha": commit}}))
            }
            (Method::Post, ["pulls"]) => {
                let head = body["head"].as_str().unwrap().to_string();
                let base = body["base"].as_str().unwrap().to_string();
                if !state.branches.contains_key(&head) || !state.branches.contains_key(&base) {
                    return error(422, "Validation Failed");
                }
                let number = state.pulls.len() as u64 + 1;
                let pr = FakePullRequest {
                    title: body["title"].as_str().unwrap().to_string(),
                    head,
                    base,
                    state: "open".to_string(),
                    merged: false,
                };
                let response = pull_json(number, &pr);
                state.pulls.insert(number, pr);
                created(response)
            }
            (Method::Put, ["pulls", number, "merge"]) => {
                let number: u64 = number.parse().unwrap();
                let Some(pr) = state.pulls.get(&number).cloned() else {
                    return error(404, "Not Found");
                };
                if pr.state != "open" {
                    return error(405, "Pull Request is not mergeable");
                }
                let Some(tree) = state.tree(&pr.head).cloned() else {
                    return error(405, "Head branch was deleted");
                };
                let sha = state.next("merge");
                state.commits.insert(sha.clone(), tree);
                state.branches.insert(pr.base.clone(), sha.clone());
                if let Some(pr) = state.pulls.get_mut(&number) {
                    pr.state = "closed".to_string();
                    pr.merged = true;
                }
                ok(json!({"sha": sha, "merged": true, "message": "Pull Request successfully merged"}))
            }
            (Method::Patch, ["pulls", number]) => {
                let number: u64 = number.parse().unwrap();
                let Some(pr) = state.pulls.get_mut(&number) else {
                    return error(404, "Not Found");
                };
                if let Some(new_state) = body["state"].as_str() {
                    pr.state = new_state.to_string();
                }
                let response = pull_json(number, pr);
                ok(response)
            }
            _ => error(404, "Not Found"),
        }
    }
}

impl RequestExecutor for &FakeHost {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, RepoError> {
        Ok(self.handle(&request))
    }
}

/// Yields to the runtime before every request so concurrent runs interleave
pub struct Interleaved<'a>(pub &'a FakeHost);

impl RequestExecutor for Interleaved<'_> {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, RepoError> {
        tokio::task::yield_now().await;
        Ok(self.0.handle(&request))
    }
}

fn ok(body: Value) -> HttpResponse {
    HttpResponse {
        status: 200,
        body: body.to_string(),
    }
}

fn created(body: Value) -> HttpResponse {
    HttpResponse {
        status: 201,
        body: body.to_string(),
    }
}

fn error(status: u16, message: &str) -> HttpResponse {
    HttpResponse {
        status,
        body: json!({"message": message, "documentation_url": "https://docs.example.test"})
            .to_string(),
    }
}

fn pull_json(number: u64, pr: &FakePullRequest) -> Value {
    json!({
        "number": number,
        "title": pr.title,
        "state": pr.state,
        "merged": pr.merged,
        "html_url": format!("https://example.test/acme/deploy/pull/{}", number),
        "head": {"ref": pr.head},
        "base": {"ref": pr.base},
    })
}

/// Base64 in 60-column lines with a trailing newline, as the contents API sends it
fn wrapped_base64(text: &str) -> String {
    let encoded = STANDARD.encode(text);
    let mut wrapped = String::new();
    for chunk in encoded.as_bytes().chunks(60) {
        wrapped.push_str(std::str::from_utf8(chunk).unwrap());
        wrapped.push('\n');
    }
    wrapped
}
