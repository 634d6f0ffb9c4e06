use anyhow::{Context, bail};
use clap::Parser;

use common::{Environment, TelemetryGuard};
use curator::cli::{CheckArgs, Cli, Command, CurateArgs};
use curator::config::{CuratorConfig, Overrides};
use curator::integrity::check_sources;
use curator::pipeline::Curator;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (path, overrides) = match &cli.command {
        Command::Curate(args) => (&args.config, args.overrides()),
        Command::Check(args) => (&args.config, Overrides::default()),
    };
    let config = CuratorConfig::load(Some(path), &overrides)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

    // TelemetryGuard requires a Tokio runtime for async OTLP exporters.
    // We must keep the runtime alive for the exporters to flush on drop.
    let (_telemetry, _runtime) = if let Some(endpoint) = config.otel_endpoint.as_ref() {
        let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
        let guard = rt.block_on(async {
            TelemetryGuard::init("curator", endpoint, config.log_level, config.environment)
        })?;
        (Some(guard), Some(rt))
    } else {
        common::setup_logging(config.log_level, config.environment);
        (None, None)
    };

    match cli.command {
        Command::Curate(args) => curate(config, &args),
        Command::Check(args) => check(&config, &args),
    }
}

fn curate(config: CuratorConfig, args: &CurateArgs) -> anyhow::Result<()> {
    tracing::info!(
        config = %args.config.display(),
        sources = config.sources.len(),
        seed = config.seed,
        output = %config.output_dir.display(),
        "Curator starting"
    );

    let mut curator = Curator::new(config);
    let (output, layout) = curator.run().context("Curation failed")?;

    let counts = output.split.assignment.counts();
    tracing::info!(
        records = output.corpus.len(),
        duplicates_removed = output.dedup.removed_count(),
        downsampled = output.balance.downsampled,
        achieved_tolerance = output.split.report.achieved_tolerance,
        manifest = %layout.manifest.display(),
        "Curation complete"
    );
    for (partition, count) in counts {
        tracing::info!(%partition, images = count, "Partition written");
    }
    Ok(())
}

fn check(config: &CuratorConfig, args: &CheckArgs) -> anyhow::Result<()> {
    let sources = config.source_datasets()?;
    let progress = config.environment == Environment::Development;
    let reports = check_sources(&sources, progress);

    let dirty: Vec<&str> = reports
        .iter()
        .filter(|r| !r.is_clean())
        .map(|r| r.source_id.as_str())
        .collect();
    if dirty.is_empty() {
        tracing::info!(sources = reports.len(), "All sources passed the integrity check");
    } else if args.fail_on_issues {
        bail!("Integrity issues found in: {}", dirty.join(", "));
    }
    Ok(())
}
