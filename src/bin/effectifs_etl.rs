use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use effectifs_etl::config::{ConfigLoader, ResolvedConfig};
use effectifs_etl::error::{ConfigError, PipelineError};
use effectifs_etl::fetch::{HttpSource, format_bytes};
use effectifs_etl::labels::MAX_LABEL_CHARS;
use effectifs_etl::layout::read_json;
use effectifs_etl::normalize::{NormalizeOptions, audit_labels, normalize_labels, overlong_count};
use effectifs_etl::output::{JsonOutput, progress_line};
use effectifs_etl::pipeline::{Pipeline, PipelineReport, RunOptions};
use effectifs_etl::progress::{ProgressSnapshot, ProgressTracker, Stage};
use effectifs_etl::store::SqliteStore;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "effectifs-etl")]
#[command(about = "Initialize the local effectifs store from the data.ameli.fr export")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch, clean, load and normalize the dataset")]
    Run(RunArgs),
    #[command(about = "Show the mirrored progress of the current or last run")]
    Status(ConfigArgs),
    #[command(about = "Audit persisted pathology labels")]
    Labels(LabelsArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long)]
    config: Option<String>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[arg(long)]
    force: bool,

    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct LabelsArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[arg(long)]
    apply: bool,

    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<PipelineError>() {
            return ExitCode::from(map_exit_code(error));
        }
        if report.downcast_ref::<ConfigError>().is_some() {
            return ExitCode::from(2);
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PipelineError) -> u8 {
    match error {
        PipelineError::Config(_) => 2,
        PipelineError::Fetch(_) => 3,
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
    match cli.command {
        Commands::Run(args) => run_pipeline(args),
        Commands::Status(args) => run_status(args),
        Commands::Labels(args) => run_labels(args),
    }
}

fn resolve(args: &ConfigArgs) -> Result<ResolvedConfig, PipelineError> {
    Ok(ConfigLoader::resolve(args.config.as_deref())?)
}

fn run_pipeline(args: RunArgs) -> miette::Result<()> {
    let config = resolve(&args.config)?;
    let source = HttpSource::new(config.http).map_err(PipelineError::from)?;
    let pipeline = Pipeline::new(config, source, ProgressTracker::global());
    let handle = pipeline.spawn(RunOptions { force: args.force });

    let tracker = Arc::clone(handle.tracker());
    let mut last_line = String::new();
    loop {
        let finished = handle.is_finished();
        let snapshot = tracker.snapshot();
        if !args.json {
            let line = progress_line(&snapshot);
            if line != last_line {
                eprintln!("{line}");
                last_line = line;
            }
        }
        if finished {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    let report = handle.join()?;
    if args.json {
        JsonOutput::print_report(&report).into_diagnostic()?;
    } else {
        print_summary(&report);
    }
    Ok(())
}

fn print_summary(report: &PipelineReport) {
    let green = "\x1b[32m";
    let cyan = "\x1b[36m";
    let yellow = "\x1b[33m";
    let reset = "\x1b[0m";

    let counters = &report.clean.manifest.counters;
    println!("{cyan}effectifs-etl run {}{reset}", report.run_id);
    println!(
        "{green}fetch:     {:?} {} ({}){reset}",
        report.fetch.action,
        report.fetch.path,
        format_bytes(report.fetch.bytes)
    );
    println!(
        "{green}clean:     {:?} kept {} of {} rows{reset}",
        report.clean.action, counters.rows_kept, counters.rows_read
    );
    if counters.dropped.total() > 0 {
        println!(
            "{yellow}           dropped: {} undecodable, {} malformed, {} missing key, {} invalid key{reset}",
            counters.dropped.undecodable,
            counters.dropped.malformed,
            counters.dropped.missing_key,
            counters.dropped.invalid_key
        );
    }
    println!(
        "{green}load:      {:?} {} rows into {} ({} batches committed){reset}",
        report.load.action, report.load.rows, report.load.table, report.load.batches_committed
    );
    println!(
        "{green}normalize: {} labels, {} rows updated{reset}",
        report.normalize.changes.len(),
        report.normalize.rows_updated
    );
}

fn run_status(args: ConfigArgs) -> miette::Result<()> {
    let config = resolve(&args)?;
    let Some(path) = config.progress_file.as_ref() else {
        return Err(miette::miette!(
            "no progress_file configured; status is only available through the mirror file"
        ));
    };
    if !path.as_std_path().exists() {
        println!("no run recorded at {path}");
        return Ok(());
    }
    let snapshot: ProgressSnapshot = read_json(path).into_diagnostic()?;
    JsonOutput::print_snapshot(&snapshot).into_diagnostic()?;
    Ok(())
}

fn run_labels(args: LabelsArgs) -> miette::Result<()> {
    let config = resolve(&args.config)?;
    let store_path = config.layout.store_path();

    let normalized = if args.apply {
        let mut store = SqliteStore::open(store_path, &config.table_name)?;
        let tracker = ProgressTracker::new();
        tracker.advance_to(Stage::Normalizing, "normalizing pathology labels");
        let report = normalize_labels(
            &mut store,
            NormalizeOptions {
                batch_size: config.batch_size,
                dry_run: false,
            },
            &tracker,
        )?;
        Some(report)
    } else {
        None
    };

    let store = SqliteStore::open_read_only(store_path, &config.table_name)?;
    let audit = audit_labels(&store)?;
    if args.json {
        JsonOutput::print_labels(&audit, normalized.as_ref()).into_diagnostic()?;
        return Ok(());
    }

    for entry in &audit {
        let marker = if entry.overlong { "!" } else { " " };
        println!("{marker} {:>3} {:>9} {}", entry.chars, entry.rows, entry.label);
    }
    println!(
        "{} labels, {} longer than {MAX_LABEL_CHARS} characters",
        audit.len(),
        overlong_count(&audit)
    );
    if let Some(report) = normalized {
        println!(
            "normalized {} labels ({} rows updated)",
            report.changes.len(),
            report.rows_updated
        );
    }
    Ok(())
}
