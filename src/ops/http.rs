#![allow(async_fn_in_trait)]

use std::fmt::Display;
use std::process::Stdio;

use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;

use super::error::RepoError;

const USER_AGENT: &str = "User-Agent: gitops-tag";
const ACCEPT: &str = "Accept: application/vnd.github+json";

// -----------------------------------------------------------------------------
// Types

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    /// Full value of the `Authorization` header
    pub authorization: String,
    /// JSON body, if any
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// -----------------------------------------------------------------------------
// RequestExecutor trait

/// Sends one request and returns the raw response.
///
/// Implementations only fail with [`RepoError::Transport`]; status codes are
/// interpreted by the caller.
pub trait RequestExecutor {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, RepoError>;
}

/// Build the `Authorization` header value for a token.
///
/// Bare tokens get the `Bearer` scheme. Values that already carry a scheme
/// (`token abc`, `Basic abc`, `Bearer abc`) are passed through.
pub fn authorization_header(token: &str) -> String {
    let token = token.trim();
    if token.contains(' ') {
        token.to_string()
    } else {
        format!("Bearer {}", token)
    }
}

// -----------------------------------------------------------------------------
// CurlExecutor

/// Executes requests by running curl
pub struct CurlExecutor;

impl CurlExecutor {
    fn args(request: &HttpRequest) -> Vec<String> {
        let mut args = vec![
            "-s".to_string(),
            "-w".to_string(),
            "\n%{http_code}".to_string(),
            "-X".to_string(),
            request.method.to_string(),
            "-H".to_string(),
            format!("Authorization: {}", request.authorization),
            "-H".to_string(),
            ACCEPT.to_string(),
            "-H".to_string(),
            USER_AGENT.to_string(),
        ];
        if request.body.is_some() {
            // Body goes through stdin so large file contents don't hit argv limits
            args.extend([
                "-H".to_string(),
                "Content-Type: application/json".to_string(),
                "--data-binary".to_string(),
                "@-".to_string(),
            ]);
        }
        args.push(request.url.clone());
        args
    }

    /// Parse curl output with the status code appended on its own line
    fn parse_response(stdout: Vec<u8>) -> Result<HttpResponse, RepoError> {
        let output_str = String::from_utf8(stdout)
            .map_err(|e| RepoError::Transport(format!("response is not UTF-8: {}", e)))?;
        let (body, status_line) = output_str
            .rsplit_once('\n')
            .unwrap_or(("", output_str.as_str()));

        let status = status_line
            .trim()
            .parse::<u16>()
            .map_err(|_| RepoError::Transport("no status code in curl output".to_string()))?;
        if status == 0 {
            return Err(RepoError::Transport("no HTTP response received".to_string()));
        }

        Ok(HttpResponse {
            status,
            body: body.to_string(),
        })
    }
}

impl RequestExecutor for CurlExecutor {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, RepoError> {
        let mut child = Command::new("curl")
            .args(Self::args(&request))
            .stdin(if request.body.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RepoError::Transport(format!("failed to execute curl: {}", e)))?;

        if let (Some(body), Some(mut stdin)) = (&request.body, child.stdin.take()) {
            stdin
                .write_all(body.as_bytes())
                .await
                .map_err(|e| RepoError::Transport(format!("failed to send body: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| RepoError::Transport(format!("curl did not finish: {}", e)))?;

        if !output.status.success() {
            return Err(RepoError::Transport(format!(
                "curl command failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Self::parse_response(output.stdout)
    }
}
