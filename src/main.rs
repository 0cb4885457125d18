use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use replica_export::{
    AppConfig, BackendRegistry, BulkCopyConfig, CopyPolicyConfig, CopyReport,
    CopyStrategySelector, ExportMode, ExportPlanner, ExportReport, StorageLocation,
};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let matches = build_cli().get_matches();

    let log_level = matches
        .get_one::<String>("log-level")
        .cloned()
        .unwrap_or_else(|| "info".to_string());

    // Initialize logging
    initialize_logging(&log_level);

    // Load environment variables
    load_environment_variables();

    // Initialize configuration from environment and command line arguments
    let config = create_app_config(&matches, log_level)?;

    // Run the application
    run_application(config, &matches).await
}

fn build_cli() -> Command {
    Command::new("replica-export")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Copy replication sources between storage backends or export them as manifests")
        .subcommand_required(true)
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Set the log level (trace, debug, info, warn, error)")
                .default_value("info")
                .global(true),
        )
        .arg(
            Arg::new("max-copy-size")
                .long("max-copy-size")
                .value_name("BYTES")
                .help("Largest aggregate size copied in-process before delegating")
                .value_parser(value_parser!(u64))
                .global(true),
        )
        .arg(
            Arg::new("max-file-count")
                .long("max-file-count")
                .value_name("COUNT")
                .help("Largest aggregate file count copied in-process before delegating")
                .value_parser(value_parser!(u64))
                .global(true),
        )
        .arg(
            Arg::new("always-local")
                .long("always-local")
                .help("Never delegate to a bulk copy job")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            Command::new("copy")
                .about("Copy source files or directories into a destination")
                .arg(
                    Arg::new("dest")
                        .long("dest")
                        .value_name("URI")
                        .help("Destination location")
                        .required(true),
                )
                .arg(
                    Arg::new("sources")
                        .value_name("SOURCE")
                        .help("Source locations (URIs or absolute local paths)")
                        .num_args(1..)
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("export")
                .about("Export a source tree as copies or as a checksummed manifest")
                .arg(
                    Arg::new("source")
                        .long("source")
                        .value_name("URI")
                        .help("Root of the tree to export")
                        .required(true),
                )
                .arg(
                    Arg::new("dest")
                        .long("dest")
                        .value_name("URI")
                        .help("Export root")
                        .required(true),
                )
                .arg(
                    Arg::new("lazy")
                        .long("lazy")
                        .help("Write a manifest of references instead of copying data")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .help("Print the export report as JSON")
                        .action(ArgAction::SetTrue),
                ),
        )
}

/// Create application configuration from the environment, with CLI overrides
fn create_app_config(matches: &ArgMatches, log_level: String) -> Result<AppConfig> {
    let mut copy_policy =
        CopyPolicyConfig::from_env().context("Invalid copy policy in environment")?;

    if let Some(max) = matches.get_one::<u64>("max-copy-size") {
        copy_policy.max_copy_size = *max;
    }
    if let Some(max) = matches.get_one::<u64>("max-file-count") {
        copy_policy.max_file_count = *max;
    }
    if matches.get_flag("always-local") {
        copy_policy.always_local = true;
    }

    Ok(AppConfig {
        copy_policy,
        bulk_copy: BulkCopyConfig::from_env(),
        log_level,
    })
}

/// Install the fmt subscriber; `RUST_LOG` directives are kept and the
/// `--log-level` value is added on top. Unknown levels fall back to info.
fn initialize_logging(log_level: &str) {
    let level = log_level.parse::<Level>().unwrap_or(Level::INFO);
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Load a `.env` file if there is one
fn load_environment_variables() {
    if dotenvy::dotenv().is_err() {
        info!("No .env file found, using system environment variables");
    }
}

fn parse_location(value: &str) -> Result<StorageLocation> {
    StorageLocation::parse(value).with_context(|| format!("Invalid location: {}", value))
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a String> {
    matches
        .get_one::<String>(name)
        .with_context(|| format!("Missing required argument --{}", name))
}

async fn run_application(config: AppConfig, matches: &ArgMatches) -> Result<()> {
    info!("Starting replica-export");
    info!("Configuration: {:#?}", config);

    let registry = Arc::new(BackendRegistry::new());

    match matches.subcommand() {
        Some(("copy", args)) => {
            let destination = parse_location(required(args, "dest")?)?;
            let sources = args
                .get_many::<String>("sources")
                .into_iter()
                .flatten()
                .map(|s| parse_location(s))
                .collect::<Result<Vec<_>>>()?;

            let selector = CopyStrategySelector::new(
                config.copy_policy,
                registry,
                Arc::from(config.bulk_copy.build_job()),
            );
            let report = selector.copy(&destination, &sources).await?;
            print_copy_report(&report);
        }
        Some(("export", args)) => {
            let source = parse_location(required(args, "source")?)?;
            let destination = parse_location(required(args, "dest")?)?;
            let mode = if args.get_flag("lazy") {
                ExportMode::ManifestOnly
            } else {
                ExportMode::Materialize
            };

            let planner = ExportPlanner::new(&registry, source, destination)?;
            let report = planner.export(mode).await?;

            if args.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_export_report(&report);
            }
        }
        _ => anyhow::bail!("Unknown command"),
    }

    info!("Application completed successfully");
    Ok(())
}

fn print_copy_report(report: &CopyReport) {
    info!("=== COPY REPORT ===");
    info!("Destination: {}", report.destination);
    info!("Groups copied directly: {}", report.direct_groups());
    info!("Groups delegated: {}", report.delegated_groups());
    for group in &report.groups {
        info!("  {} ({} sources): {:?}", group.backend, group.sources, group.method);
    }
}

fn print_export_report(report: &ExportReport) {
    info!("=== EXPORT REPORT ===");
    info!("Mode: {:?}", report.mode);
    info!("Source: {}", report.source_root);
    info!("Export root: {}", report.export_root);
    info!("Files exported: {}", report.files_exported);
    info!("Entries excluded: {}", report.entries_excluded);
    info!("Bytes exported: {}", report.bytes_exported);
    if let Some(manifest) = &report.manifest {
        info!("Manifest: {}", manifest);
    }
    info!(
        "Duration: {} ms",
        (report.finished_at - report.started_at).num_milliseconds()
    );
}
