mod cli;

use transcriptforge::{
    collaborators::CommandTools,
    config,
    orchestrator::{Orchestrator, Role, RunOptions},
    progress::{self, ProgressReport},
};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use transcriptforge_common::Phase;

/// Refresh interval of `run --role monitor`.
const MONITOR_INTERVAL: Duration = Duration::from_secs(60);

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "transcriptforge=trace,transcriptforge_common=trace".to_string()
        } else {
            "transcriptforge=info,transcriptforge_common=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Run {
            collection,
            limit,
            role,
            confirm,
        } => {
            let options = RunOptions { role, limit, confirm };
            block_on_interruptible(|cancel| run(config_path, collection, options, cancel))
        }
        Commands::Verify { collection } => verify(config_path, &collection),
        Commands::Cleanup { collection, confirm } => cleanup(config_path, &collection, confirm),
        Commands::Status {
            collection,
            json,
            watch: Some(secs),
        } => block_on_interruptible(|cancel| watch(config_path, collection, json, secs, cancel)),
        Commands::Status {
            collection,
            json,
            watch: None,
        } => status(config_path, &collection, json),
        Commands::Reset { collection, index, to } => reset(config_path, &collection, index, to),
        Commands::Validate { file } => {
            let path = file.or_else(|| config_path.map(Path::to_path_buf));
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("transcriptforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Run `task` on a fresh runtime; Ctrl-C trips the cancellation token.
fn block_on_interruptible<F, Fut>(task: F) -> Result<()>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let rt = tokio::runtime::Runtime::new()?;
    let cancel = CancellationToken::new();

    let interrupt = cancel.clone();
    rt.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; finishing the current step and saving progress");
            interrupt.cancel();
        }
    });

    rt.block_on(task(cancel))
}

fn orchestrator(config_path: Option<&Path>, cancel: CancellationToken) -> Result<Orchestrator> {
    let config = config::load_config_or_default(config_path)?;
    Ok(Orchestrator::from_config(config, cancel))
}

async fn run(
    config_path: Option<&Path>,
    selector: String,
    options: RunOptions,
    cancel: CancellationToken,
) -> Result<()> {
    if options.role == Role::Monitor {
        return watch(config_path, selector, false, MONITOR_INTERVAL.as_secs(), cancel).await;
    }

    let orchestrator = orchestrator(config_path, cancel)?;
    let config = orchestrator.config();
    let collections = config.select(&selector)?;
    CommandTools::new(config.tools.clone(), config.retry.call_timeout())
        .require(&options.role.required_tools(&collections))
        .context("Missing external tool configuration")?;

    let summary = orchestrator.run(&selector, &options).await?;

    for c in &summary.collections {
        println!(
            "{}: {} advanced, {} resumed, {} no content, {} failed, {} retrying, {} remaining",
            c.collection, c.advanced, c.resumed, c.no_content, c.failed, c.retried, c.remaining
        );
        if let Some(reason) = &c.halted {
            println!("  halted: {}", reason);
        }
        if let Some(verification) = &c.verification {
            if verification.passed {
                println!("  verification passed");
            } else {
                println!("  verification failed:");
                for issue in &verification.issues {
                    println!("    - {}", issue);
                }
            }
        }
        if let Some(report) = &c.cleanup {
            print_cleanup(report);
        }
    }

    if summary.cancelled {
        anyhow::bail!("Interrupted; progress has been saved");
    }
    if !summary.is_stable() {
        let unstable = summary.collections.iter().filter(|c| !c.is_stable()).count();
        anyhow::bail!("{} collection(s) not yet stable; progress has been saved", unstable);
    }
    Ok(())
}

fn verify(config_path: Option<&Path>, selector: &str) -> Result<()> {
    let orchestrator = orchestrator(config_path, CancellationToken::new())?;
    let mut failed = 0;

    for collection in orchestrator.config().select(selector)? {
        let result = orchestrator.verify(collection)?;
        if result.passed {
            println!("✓ {}: verification passed", collection.name);
        } else {
            failed += 1;
            println!("✗ {}: {} issue(s)", collection.name, result.issues.len());
            for issue in &result.issues {
                println!("    - {}", issue);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("Verification failed for {} collection(s)", failed);
    }
    Ok(())
}

fn cleanup(config_path: Option<&Path>, selector: &str, confirm: bool) -> Result<()> {
    let orchestrator = orchestrator(config_path, CancellationToken::new())?;
    let mut refused = 0;

    for collection in orchestrator.config().select(selector)? {
        match orchestrator.cleanup(collection, confirm) {
            Ok(report) => print_cleanup(&report),
            Err(e @ transcriptforge_common::Error::VerificationFailed { .. }) => {
                refused += 1;
                println!("✗ {}", e);
            }
            Err(e) => return Err(e.into()),
        }
    }

    if refused > 0 {
        anyhow::bail!("Cleanup refused for {} collection(s)", refused);
    }
    Ok(())
}

fn print_cleanup(report: &transcriptforge::cleanup::CleanupReport) {
    if report.confirmed {
        println!(
            "  {}: deleted {} file(s), {} bytes reclaimed",
            report.collection, report.deleted, report.bytes
        );
        for failure in &report.failures {
            println!("    failed: {} ({})", failure.path.display(), failure.error);
        }
    } else {
        println!(
            "  {}: [DRY RUN] would delete {} file(s), {} bytes",
            report.collection,
            report.files.len(),
            report.bytes
        );
        for file in &report.files {
            println!("    {}", file.display());
        }
    }
}

fn print_report(report: &ProgressReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", progress::render_text(report));
    }
    Ok(())
}

fn status(config_path: Option<&Path>, selector: &str, json: bool) -> Result<()> {
    let orchestrator = orchestrator(config_path, CancellationToken::new())?;
    print_report(&orchestrator.status(selector)?, json)
}

async fn watch(
    config_path: Option<&Path>,
    selector: String,
    json: bool,
    secs: u64,
    cancel: CancellationToken,
) -> Result<()> {
    let orchestrator = orchestrator(config_path, cancel)?;
    let mut failure = None;
    orchestrator
        .monitor(&selector, Duration::from_secs(secs.max(1)), |report| {
            if let Err(e) = print_report(report, json) {
                failure.get_or_insert(e);
            }
        })
        .await?;
    failure.map_or(Ok(()), Err)
}

fn reset(config_path: Option<&Path>, collection: &str, index: u32, to: Phase) -> Result<()> {
    let orchestrator = orchestrator(config_path, CancellationToken::new())?;
    let unit = orchestrator.reset(collection, index, to)?;
    println!("{}#{:03} ({}) reset to {}", collection, unit.index, unit.item_id, unit.state);
    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            config::load_config(p)?
        }
        None => {
            println!("No config file specified, using defaults");
            config::Config::default()
        }
    };

    println!("✓ Configuration is valid");
    println!("  Storage root: {}", config.storage.root.display());
    println!("  Registry: {}", config.storage.registry_path().display());
    println!(
        "  Retry: {} attempts per call, {} per phase",
        config.retry.max_attempts, config.retry.max_phase_attempts
    );
    println!("  Collections: {}", config.collections.len());
    for c in &config.collections {
        println!(
            "    {} (priority {}, {} items, profile {})",
            c.name,
            c.priority,
            c.total,
            c.profile.name()
        );
    }

    Ok(())
}
