use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use medsync_core::{AccessToken, RunMode, RunSummary, SyncConfig, SyncSession};

#[derive(Parser)]
#[command(name = "medsync")]
#[command(about = "Reconcile imaging records across the FHIR server, DICOM archive and mirror")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log every mutation instead of sending it
    #[arg(long, global = true)]
    dry_run: bool,

    /// Debug logging and per-request artifacts in the run directory
    #[arg(long, global = true)]
    verbose: bool,

    /// Accept invalid TLS certificates
    #[arg(long, global = true)]
    insecure: bool,

    /// Directory the run directory is created in (overrides LOG_DIR)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Merge unscheduled exams into their scheduled orders
    SyncStudies,
    /// Consolidate patient identities under the canonical issuer
    MergePatients,
    /// Correct stale instance counts in the relational mirror
    RecountInstances,
    /// Run sync-studies, merge-patients and recount-instances in that order
    All,
}

/// Entry point for the `medsync` operations tool.
///
/// Configuration comes from the environment (a `.env` file is loaded first); the CLI flags
/// only raise the run mode. Each run gets its own directory holding the audit log, the run
/// log and any staged documents.
///
/// Only fatal errors (configuration, authentication, an unreadable ServiceRequest collection,
/// the audit log) end the process with a non-zero status.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut cfg = SyncConfig::from_lookup(|key| std::env::var(key).ok())
        .context("invalid configuration")?
        .with_mode(RunMode {
            dry_run: cli.dry_run,
            verbose: cli.verbose,
            insecure: cli.insecure,
        });
    if let Some(dir) = cli.log_dir {
        cfg = cfg.with_log_root(dir);
    }

    let session = SyncSession::open(cfg).context("could not open run directory")?;
    init_tracing(&session)?;

    print_banner(&session, cli.command);
    let token = session
        .token_provider()
        .obtain()
        .await
        .context("could not obtain an access token")?;

    let summary = run(&session, &token, cli.command).await?;
    println!("{summary}");
    Ok(())
}

/// RUST_LOG wins when set; otherwise the tool's own crates log at info, or debug when verbose.
fn log_filter(rust_log: Option<&str>, verbose: bool) -> String {
    match rust_log.map(str::trim) {
        Some(directives) if !directives.is_empty() => directives.to_string(),
        _ => {
            let level = if verbose { "debug" } else { "info" };
            format!("warn,medsync={level},medsync_core={level}")
        }
    }
}

fn init_tracing(session: &SyncSession) -> anyhow::Result<()> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = EnvFilter::try_new(log_filter(rust_log.as_deref(), session.config().verbose()))
        .context("invalid RUST_LOG")?;

    let log_path = session.run_log_path();
    let log_file = std::fs::File::create(&log_path)
        .with_context(|| format!("could not create {}", log_path.display()))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(log_file)),
        )
        .init();
    Ok(())
}

fn print_banner(session: &SyncSession, command: Commands) {
    let cfg = session.config();
    let mode = if cfg.dry_run() { "DRY-RUN" } else { "LIVE" };
    println!("medsync {} [{mode}]", env!("CARGO_PKG_VERSION"));
    println!("  FHIR:      {}", cfg.fhir_base());
    println!("  QIDO:      {}", cfg.qido_base());
    println!("  MWL:       {}", cfg.mwl_base());
    println!("  canonical: {}", cfg.canonical_issuer());
    println!("  run dir:   {}", session.run_dir().display());
    if !cfg.dry_run() && command != Commands::SyncStudies {
        println!("  live mode: archive identities and the mirror may be modified");
    }
}

async fn run(
    session: &SyncSession,
    token: &AccessToken,
    command: Commands,
) -> anyhow::Result<RunSummary> {
    let mut studies = None;
    let mut merge = None;
    let mut recount = None;

    if matches!(command, Commands::SyncStudies | Commands::All) {
        info!("synchronizing unscheduled studies");
        studies = Some(
            session
                .sync_studies(token)
                .await
                .context("study synchronization aborted")?,
        );
    }

    if matches!(command, Commands::MergePatients | Commands::All) {
        info!("merging patient identities");
        merge = Some(
            session
                .identity_merger()
                .run(token)
                .await
                .context("patient merge aborted")?,
        );
    }

    match command {
        Commands::RecountInstances => {
            info!("recounting mirror instance counts");
            recount = Some(session.instance_recounter()?.run(token).await?);
        }
        Commands::All if session.config().mirror().is_some() => {
            info!("recounting mirror instance counts");
            recount = Some(session.instance_recounter()?.run(token).await?);
        }
        Commands::All => warn!("no relational mirror configured, skipping instance recount"),
        _ => {}
    }

    Ok(RunSummary {
        studies,
        merge,
        recount,
        ..session.summary()
    })
}
