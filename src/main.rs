use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use gitops_tag::App;
use gitops_tag::Config;
use gitops_tag::commands::apply::Manifest;
use gitops_tag::config::BranchNaming;
use gitops_tag::config::RollbackPolicy;
use gitops_tag::config::WorkflowConfig;
use gitops_tag::ops::http::CurlExecutor;
use gitops_tag::ops::repository::RealRepository;
use gitops_tag::patch::ReplacementSet;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Parser)]
#[command(name = "gitops-tag")]
#[command(about = "Patch tagged values in a repository file through a merged pull request", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Branch, patch, open a PR, merge it and delete the branch
    Update {
        /// Repository-relative path of the file to patch
        #[arg(short, long)]
        file: String,
        /// Replacement as TAG=VALUE (repeatable, applied in order)
        #[arg(short, long = "set", value_name = "TAG=VALUE", required = true)]
        set: Vec<String>,
        /// Repository API root (defaults to $GITOPS_BASE_URL)
        #[arg(long)]
        base_url: Option<String>,
        /// Access token (defaults to $GITOPS_TOKEN)
        #[arg(long)]
        token: Option<String>,
        #[command(flatten)]
        workflow: WorkflowArgs,
    },
    /// Run the update for every target in a YAML manifest
    Apply {
        /// Path to the manifest
        manifest: PathBuf,
        /// Token for targets without their own token_env
        #[arg(long, env = "GITOPS_TOKEN", hide_env_values = true)]
        token: Option<String>,
        #[command(flatten)]
        workflow: WorkflowArgs,
    },
    /// Show what the replacements would do to a local file
    Preview {
        /// Local file to read
        file: PathBuf,
        /// Replacement as TAG=VALUE (repeatable, applied in order)
        #[arg(short, long = "set", value_name = "TAG=VALUE")]
        set: Vec<String>,
    },
}

#[derive(Args)]
pub struct WorkflowArgs {
    /// Branch to read from and merge into (defaults to $GITOPS_DEFAULT_BRANCH or main)
    #[arg(long)]
    default_branch: Option<String>,
    /// Working branch name or prefix (defaults to $GITOPS_WORKING_BRANCH or gitops-tag)
    #[arg(long)]
    working_branch: Option<String>,
    #[arg(long, value_enum)]
    branch_naming: Option<BranchNaming>,
    #[arg(long, value_enum)]
    rollback: Option<RollbackPolicy>,
    #[arg(long)]
    pr_title: Option<String>,
    #[arg(long)]
    commit_message: Option<String>,
    /// Merge commit message; {time} is replaced with the merge time
    #[arg(long)]
    merge_message: Option<String>,
}

impl WorkflowArgs {
    fn apply_to(self, workflow: &mut WorkflowConfig) {
        if let Some(branch) = self.default_branch {
            workflow.default_branch = branch;
        }
        if let Some(branch) = self.working_branch {
            workflow.working_branch = branch;
        }
        if let Some(naming) = self.branch_naming {
            workflow.branch_naming = naming;
        }
        if let Some(rollback) = self.rollback {
            workflow.rollback = rollback;
        }
        if let Some(title) = self.pr_title {
            workflow.pr_title = title;
        }
        if let Some(message) = self.commit_message {
            workflow.commit_message = message;
        }
        if let Some(message) = self.merge_message {
            workflow.merge_message = message;
        }
    }
}

fn setup_logging() -> Result<()> {
    let timer = tracing_subscriber::fmt::time::ChronoLocal::new("%H:%M:%S%.3f".into());
    let format = tracing_subscriber::fmt::format().with_timer(timer);
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;
    let subscriber = tracing_subscriber::fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr)
        .with_filter(filter);
    tracing_subscriber::registry().with(subscriber).init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging()?;

    let app = App::new(RealRepository::new(CurlExecutor));
    let cli = Cli::parse();

    match cli.command {
        Commands::Update {
            file,
            set,
            base_url,
            token,
            workflow,
        } => {
            // Flags win over the environment
            let flags: HashMap<&str, String> = [("GITOPS_BASE_URL", base_url), ("GITOPS_TOKEN", token)]
                .into_iter()
                .filter_map(|(key, value)| value.map(|v| (key, v)))
                .collect();
            let mut config = Config::from_lookup(|key| {
                flags.get(key).cloned().or_else(|| std::env::var(key).ok())
            })?;
            workflow.apply_to(&mut config.workflow);

            let replacements = ReplacementSet::parse_assignments(set.iter().map(String::as_str))?;
            app.cmd_update(&config, &file, &replacements, &mut std::io::stdout())
                .await?
        }
        Commands::Apply {
            manifest,
            token,
            workflow,
        } => {
            let manifest = Manifest::load(&manifest).await?;
            let mut defaults = WorkflowConfig::load()?;
            workflow.apply_to(&mut defaults);
            app.cmd_apply(&manifest, token.as_deref(), &defaults, &mut std::io::stdout())
                .await?
        }
        Commands::Preview { file, set } => {
            let replacements = ReplacementSet::parse_assignments(set.iter().map(String::as_str))?;
            app.cmd_preview(
                &file,
                &replacements,
                &mut std::io::stdout(),
                &mut std::io::stderr(),
            )
            .await?
        }
    }

    Ok(())
}
