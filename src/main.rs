use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use dazzle::constants::{DEFAULT_DEFINITION_FILE, DEFAULT_FINAL_TAG, DEFAULT_REPOSITORY};
use dazzle::image::ImageRef;
use dazzle::orchestrator::{BuildResult, LayerStatus};
use dazzle::runner::TestStatus;
use dazzle::{composer, config, logging, report, BuildConfig, Environment};
use std::path::{Path, PathBuf};

/// Builds container images from independently cached and tested layers
#[derive(Parser)]
#[command(name = "dazzle")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, compose and test an image
    Build(BuildArgs),
    /// Print the version
    Version,
}

#[derive(clap::Args)]
struct BuildArgs {
    /// Build context holding the build definition
    #[arg(default_value = ".")]
    context: PathBuf,

    /// Build definition, relative to the context
    #[arg(short = 'f', long = "file", default_value = DEFAULT_DEFINITION_FILE)]
    file: String,

    /// Tag of the composed image
    #[arg(short, long, default_value = DEFAULT_FINAL_TAG)]
    tag: String,

    /// Working repository layer images are stored under
    #[arg(short, long, env = "DAZZLE_REPOSITORY")]
    repository: Option<String>,

    /// Image store directory
    #[arg(long, env = "DAZZLE_STORE")]
    store: Option<PathBuf>,

    /// Maximum number of concurrent layer builds and test containers
    #[arg(short, long, env = "DAZZLE_JOBS")]
    jobs: Option<usize>,

    /// Write a JUnit XML test report here
    #[arg(long)]
    output_test_xml: Option<PathBuf>,

    /// Write a JSON test report here
    #[arg(long)]
    output_test_json: Option<PathBuf>,

    /// Export the composed image as an OCI image layout directory
    #[arg(long)]
    export_oci: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(e) = logging::init_logging(cli.json_logs) {
        eprintln!("failed to initialise logging: {}", e);
    }

    match cli.command {
        Commands::Version => {
            println!("dazzle {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Build(args) => {
            tokio::select! {
                outcome = cmd_build(args) => outcome,
                _ = tokio::signal::ctrl_c() => bail!("interrupted"),
            }
        }
    }
}

async fn cmd_build(args: BuildArgs) -> Result<()> {
    if !args.context.is_dir() {
        bail!("context {} must be a directory", args.context.display());
    }
    let tag = ImageRef::parse(&args.tag)?;

    let store = args.store.unwrap_or_else(config::default_store_dir);
    let env = Environment::local(&store)
        .with_context(|| format!("cannot open image store {}", store.display()))?;
    let mut build_config = BuildConfig::from_env(env)?;
    match args.repository {
        Some(repository) => build_config = build_config.with_repository(repository),
        None => tracing::warn!(
            "no working repository given, using '{}'",
            DEFAULT_REPOSITORY
        ),
    }
    if let Some(jobs) = args.jobs {
        build_config = build_config.with_parallelism(jobs, jobs);
    }

    let (result, error) = match dazzle::build(&build_config, &args.context, &args.file, &tag).await {
        Ok(result) => (Some(result), None),
        Err(failure) => (failure.result.map(|r| *r), Some(failure.error)),
    };

    if let Some(result) = &result {
        print_summary(result);

        let tests = report::aggregate(&result.layers);
        if let Some(path) = &args.output_test_xml {
            save_report(path, "JUnit", |p| report::write_junit(p, &tests));
        }
        if let Some(path) = &args.output_test_json {
            save_report(path, "JSON", |p| report::write_json(p, &tests));
        }

        if let (Some(dir), Some(image)) = (&args.export_oci, &result.image) {
            let stored = build_config
                .env
                .repository
                .resolve(&image.reference)
                .await?
                .with_context(|| format!("{} vanished from the store", image.reference))?;
            composer::export_layout(build_config.env.repository.as_ref(), &stored, dir).await?;
        }
    }

    if let Some(error) = error {
        return Err(error.into());
    }
    match result {
        Some(result) if !result.tests_passed() => bail!(
            "{} test(s) failed, {} errored",
            result.stats.tests_failed,
            result.stats.tests_errored
        ),
        _ => Ok(()),
    }
}

/// A report that cannot be written is logged; the build outcome still decides
/// the exit status.
fn save_report(path: &Path, format: &str, write: impl FnOnce(&Path) -> dazzle::Result<()>) -> bool {
    match write(path) {
        Ok(()) => {
            tracing::info!(path = %path.display(), "{} report written", format);
            true
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "cannot save {} test report", format);
            false
        }
    }
}

fn print_summary(result: &BuildResult) {
    println!(
        "{} {} ({} bytes){}",
        "base".bold(),
        result.base.reference,
        result.base.size,
        if result.base.cache_hit { " cached".dimmed().to_string() } else { String::new() }
    );
    for (name, status) in &result.statuses {
        match status {
            LayerStatus::Built => {
                if let Some(layer) = result.layer(name) {
                    println!(
                        "{} {} ({} bytes){}",
                        name.bold(),
                        layer.reference,
                        layer.size,
                        if layer.cache_hit { " cached".dimmed().to_string() } else { String::new() }
                    );
                }
            }
            LayerStatus::Failed(reason) => println!("{} {}: {}", name.bold(), "failed".red(), reason),
            LayerStatus::Skipped(dep) => {
                println!("{} {} (dependency {} failed)", name.bold(), "skipped".yellow(), dep)
            }
        }
    }

    for outcome in report::aggregate(&result.layers).outcomes {
        let mark = match outcome.status {
            TestStatus::Passed => "PASS".green(),
            TestStatus::Failed => "FAIL".red(),
            TestStatus::Error => "ERROR".red().bold(),
        };
        println!("  {} {}", mark, outcome.description);
        if outcome.status != TestStatus::Passed {
            for line in outcome.detail.lines() {
                println!("       {}", line.dimmed());
            }
        }
    }

    if let Some(image) = &result.image {
        println!(
            "{} {} ({} layers, {} bytes)",
            "image".bold().green(),
            image.reference,
            image.layers,
            image.size
        );
    }
    let stats = &result.stats;
    println!(
        "{} layers: {} built, {} cached ({:.1}%), {} failed, {} skipped in {}ms",
        stats.total_layers,
        stats.executed_layers,
        stats.cache_hits,
        stats.cache_hit_rate(),
        stats.failed_layers,
        stats.skipped_layers,
        stats.total_duration_ms
    );
}
