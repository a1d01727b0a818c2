//! Integration layer for the git-hosting REST API.
//!
//! - [`error`]: Typed failures of individual API calls
//! - [`http`]: Request executor abstraction and the curl-based implementation
//! - [`repository`]: Branch, content and pull-request operations on one repository
//!
//! The repository operations sit behind a trait with a real and a mock
//! implementation to support both production use and testing.

pub mod error;
pub mod http;
pub mod repository;
