//! Command implementations on [`crate::App`].
//!
//! - [`update`]: The branch → commit → pull request → merge → cleanup workflow
//! - [`apply`]: Runs the workflow for every target in a manifest
//! - [`preview`]: Applies replacements to a local file without touching any remote

pub mod apply;
pub mod preview;
pub mod update;
