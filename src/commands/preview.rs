use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use colored::Colorize;
use log::warn;

use crate::App;
use crate::ops::repository::RepositoryOps;
use crate::patch::ReplacementSet;
use crate::patch::patch_counted;

impl<R: RepositoryOps> App<R> {
    /// Print `path` with replacements applied; per-tag counts go to `stderr`.
    ///
    /// Works on a local copy of the file and never contacts the remote.
    pub async fn cmd_preview(
        &self,
        path: &Path,
        replacements: &ReplacementSet,
        stdout: &mut impl std::io::Write,
        stderr: &mut impl std::io::Write,
    ) -> Result<()> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let (patched, counts) = patch_counted(&raw, replacements);
        write!(stdout, "{}", patched)?;

        for ((tag, value), count) in replacements.iter().zip(counts) {
            if count == 0 {
                warn!("Tag {} not found in {}", tag, path.display());
                writeln!(stderr, "{} {} not found", "!".yellow(), tag)?;
            } else {
                writeln!(stderr, "{} {} -> {} ({}x)", "✓".green(), tag, value, count)?;
            }
        }
        if patched == raw {
            writeln!(stderr, "No changes")?;
        }

        Ok(())
    }
}
