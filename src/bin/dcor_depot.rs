use std::path::PathBuf;
use std::process::ExitCode;

use chrono::NaiveDate;
use clap::{ArgAction, Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use dcor_depot::app::{App, ProgressSink};
use dcor_depot::catalog::JsonCatalog;
use dcor_depot::config::ConfigLoader;
use dcor_depot::convert::CommandConverter;
use dcor_depot::depotize::{ArchiveOutcome, DepotizeOptions, DepotizeSummary};
use dcor_depot::error::DepotError;
use dcor_depot::import::ImportOptions;
use dcor_depot::object_store::{self, ObjectStore};
use dcor_depot::oracle::CommandOracle;
use dcor_depot::output::{ConsoleOutput, JsonOutput, OutputMode};
use dcor_depot::sync::{SyncOptions, SyncSummary};

#[derive(Parser)]
#[command(name = "dcor-depot")]
#[command(about = "Depotize RT-DC measurement archives and migrate resources to the object store")]
#[command(version, author)]
struct Cli {
    /// Print JSON results instead of console progress.
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Configuration file (default: ./dcor-depot.json, then the user config dir).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Depotize an archive, or every archive below a directory")]
    DepotizeArchive(DepotizeArgs),
    #[command(about = "Upload resources, condensed files and previews to the object store")]
    MigrateResourcesToObjectStore(MigrateArgs),
    #[command(about = "Import resource sets from the internal depot into the catalog")]
    ImportInternal(ImportArgs),
    #[command(about = "Print the id of every resource in the catalog")]
    ListAllResources,
}

#[derive(Args)]
struct DepotizeArgs {
    path: PathBuf,
    /// Remove extracted data and file the archive away after success.
    #[arg(long)]
    cleanup: bool,
    /// Skip archives marked failed by an earlier run.
    #[arg(long)]
    skip_failed: bool,
    /// Continue past unknown files instead of halting the archive.
    #[arg(long)]
    ignore_unknown: bool,
    /// Write a new version of resource sets that already exist.
    #[arg(long)]
    supersede: bool,
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Args)]
struct MigrateArgs {
    #[arg(long)]
    verify_checksum: bool,
    #[arg(long)]
    delete_after_migration: bool,
    /// Only migrate resources of this dataset.
    #[arg(long)]
    dataset: Option<String>,
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Args)]
struct ImportArgs {
    #[arg(long, default_value_t = 0)]
    limit: usize,
    #[arg(long)]
    start_date: Option<NaiveDate>,
    #[arg(long)]
    end_date: Option<NaiveDate>,
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(depot) = report.downcast_ref::<DepotError>() {
            return ExitCode::from(map_exit_code(depot));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &DepotError) -> u8 {
    match error {
        DepotError::NotFound(_) | DepotError::InvalidInput(_) => 2,
        DepotError::MissingTool(_)
        | DepotError::ObjectStoreHttp(_)
        | DepotError::ObjectStoreStatus { .. }
        | DepotError::Timeout(_) => 3,
        DepotError::UnknownFiles { .. } => 4,
        DepotError::Interrupted => 130,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let catalog = JsonCatalog::open(config.storage.catalog.as_std_path());
    let store = object_store::from_settings(&config.object_store)?;
    let app = App::new(config, catalog, store);

    match cli.command {
        Commands::DepotizeArchive(args) => run_depotize(&app, args, output_mode),
        Commands::MigrateResourcesToObjectStore(args) => run_migrate(&app, args, output_mode),
        Commands::ImportInternal(args) => {
            let options = ImportOptions {
                limit: Some(args.limit),
                start_date: args.start_date,
                end_date: args.end_date,
            };
            let console = ConsoleOutput::new(args.verbose);
            let summary = app.import_internal(options, sink_for(output_mode, &console))?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_import(&summary).into_diagnostic(),
                OutputMode::Interactive => {
                    println!(
                        "datasets created: {}, skipped: {}, resources created: {}, failed: {}",
                        summary.datasets_created,
                        summary.datasets_skipped,
                        summary.resources_created,
                        summary.failed.len()
                    );
                    Ok(())
                }
            }
        }
        Commands::ListAllResources => {
            let result = app.list_all_resources()?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_resources(&result).into_diagnostic(),
                OutputMode::Interactive => {
                    for id in &result.resources {
                        println!("{id}");
                    }
                    Ok(())
                }
            }
        }
    }
}

fn sink_for<'a>(mode: OutputMode, console: &'a ConsoleOutput) -> &'a dyn ProgressSink {
    match mode {
        OutputMode::NonInteractive => &JsonOutput,
        OutputMode::Interactive => console,
    }
}

fn run_depotize<S: ObjectStore>(
    app: &App<JsonCatalog, S>,
    args: DepotizeArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let tools = &app.config().tools;
    let oracle = CommandOracle::new(&tools.inspect)?;
    let converter = CommandConverter::new(tools)?;
    let options = DepotizeOptions {
        cleanup: args.cleanup,
        skip_failed: args.skip_failed,
        abort_on_unknown: !args.ignore_unknown,
        supersede: args.supersede,
    };
    let console = ConsoleOutput::new(args.verbose);
    let summary = app.depotize(
        &oracle,
        &converter,
        &args.path,
        options,
        sink_for(output_mode, &console),
    )?;

    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_depotize(&summary).into_diagnostic()?,
        OutputMode::Interactive => print_depotize_summary(&summary),
    }

    // a halted single archive is actionable by the operator; sweeps exit 0
    if !args.path.is_dir() {
        if let Some(report) = summary.archives.iter().find(|report| report.is_halted()) {
            if let ArchiveOutcome::Halted { unknown } = &report.outcome {
                return Err(DepotError::UnknownFiles {
                    archive: report.archive.clone(),
                    count: unknown.len(),
                }
                .into());
            }
        }
    }
    Ok(())
}

fn print_depotize_summary(summary: &DepotizeSummary) {
    for report in &summary.archives {
        let outcome = match &report.outcome {
            ArchiveOutcome::Completed => "completed".to_string(),
            ArchiveOutcome::Skipped => "skipped".to_string(),
            ArchiveOutcome::Halted { unknown } => format!("halted ({} unknown files)", unknown.len()),
            ArchiveOutcome::Failed { message } => format!("failed: {message}"),
        };
        println!(
            "{}: {outcome}, {} usable, {} invalid, {} converted",
            report.archive.display(),
            report.usable,
            report.invalid,
            report.converted
        );
    }
}

fn run_migrate<S: ObjectStore>(
    app: &App<JsonCatalog, S>,
    args: MigrateArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let options = SyncOptions {
        verify_checksum: args.verify_checksum,
        delete_after_migration: args.delete_after_migration,
    };
    let console = ConsoleOutput::new(args.verbose);
    let summary = app.migrate_resources(
        args.dataset.as_deref(),
        options,
        sink_for(output_mode, &console),
    )?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_sync(&summary).into_diagnostic(),
        OutputMode::Interactive => {
            print_sync_summary(&summary);
            Ok(())
        }
    }
}

fn print_sync_summary(summary: &SyncSummary) {
    println!(
        "{} artifacts checked, {} uploaded, {} failed",
        summary.artifacts.len(),
        summary.uploads(),
        summary.failures()
    );
}
