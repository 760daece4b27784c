use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use boundary_vault::config::{Config, ConfigLoader, Selection, split_list};
use boundary_vault::domain::{CountryCode, parse_level};
use boundary_vault::error::VaultError;
use boundary_vault::output::JsonOutput;
use boundary_vault::overpass::OverpassHttpClient;
use boundary_vault::runner::Runner;
use boundary_vault::store::{Layout, list_backups, read_backup};

#[derive(Parser)]
#[command(name = "boundary-vault")]
#[command(about = "Resumable backups of OpenStreetMap administrative boundaries")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch boundaries and write one backup per country and level")]
    Backup(BackupArgs),
    #[command(about = "List stored backups")]
    List(DirArgs),
    #[command(about = "Print one stored backup record")]
    Show(ShowArgs),
}

#[derive(Args)]
struct BackupArgs {
    #[arg(long)]
    config: Option<String>,

    #[arg(long, conflicts_with = "all_countries")]
    countries: Option<String>,

    #[arg(long)]
    all_countries: bool,

    #[arg(long, conflicts_with = "all_levels")]
    levels: Option<String>,

    #[arg(long)]
    all_levels: bool,

    #[arg(long)]
    output_dir: Option<String>,

    #[arg(long)]
    delay_ms: Option<u64>,

    #[arg(long)]
    retain_raw: bool,

    #[arg(long)]
    no_compress: bool,

    #[arg(long)]
    missing_only: bool,

    #[arg(long, conflicts_with = "missing_only", help = "Refetch targets that already have a backup")]
    refresh: bool,

    #[arg(long)]
    endpoints: Option<String>,

    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Args)]
struct DirArgs {
    #[arg(long, default_value = "backups")]
    output_dir: Utf8PathBuf,
}

#[derive(Args)]
struct ShowArgs {
    country: String,

    level: String,

    #[arg(long, default_value = "backups")]
    output_dir: Utf8PathBuf,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(vault) = report.downcast_ref::<VaultError>() {
            return ExitCode::from(map_exit_code(vault));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &VaultError) -> u8 {
    match error {
        VaultError::InvalidCountryCode(_)
        | VaultError::InvalidLevel(_)
        | VaultError::MissingCountries
        | VaultError::MissingLevels
        | VaultError::TooFewEndpoints(_)
        | VaultError::ConfigRead(_)
        | VaultError::ConfigParse(_) => 2,
        VaultError::ClientSetup(_) | VaultError::FetchFailed { .. } => 3,
        VaultError::PartialRun { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Backup(args) => run_backup(args),
        Commands::List(args) => {
            let entries = list_backups(&Layout::new(args.output_dir))?;
            JsonOutput::print_list(&entries).into_diagnostic()?;
            Ok(())
        }
        Commands::Show(args) => {
            let country: CountryCode = args.country.parse()?;
            let level = parse_level(&args.level)?;
            let record = read_backup(&Layout::new(args.output_dir), &country, level)?;
            JsonOutput::print_record(&record).into_diagnostic()?;
            Ok(())
        }
    }
}

fn run_backup(args: BackupArgs) -> miette::Result<()> {
    let overrides = overrides_from(&args);
    let resolved = ConfigLoader::resolve(args.config.as_deref(), overrides)?;
    let client = OverpassHttpClient::new(
        resolved.endpoints.clone(),
        resolved.retry,
        resolved.timeout,
    )?;
    let runner = Runner::new(client, resolved);
    let summary = runner.run()?;
    JsonOutput::print_summary(&summary).into_diagnostic()?;
    if !summary.failures.is_empty() {
        return Err(VaultError::PartialRun {
            failed: summary.failures.len(),
            total: summary.targets(),
        }
        .into());
    }
    Ok(())
}

fn overrides_from(args: &BackupArgs) -> Config {
    let countries = if args.all_countries {
        Some(Selection::Keyword("all".to_string()))
    } else {
        args.countries
            .as_deref()
            .map(|value| Selection::List(split_list(value)))
    };
    let levels = if args.all_levels {
        Some(Selection::Keyword("all".to_string()))
    } else {
        args.levels
            .as_deref()
            .map(|value| Selection::Keyword(value.to_string()))
    };
    Config {
        countries,
        levels,
        output_dir: args.output_dir.clone(),
        delay_ms: args.delay_ms,
        retain_raw: args.retain_raw.then_some(true),
        compress: args.no_compress.then_some(false),
        missing_only: if args.refresh {
            Some(false)
        } else {
            args.missing_only.then_some(true)
        },
        endpoints: args
            .endpoints
            .as_deref()
            .map(split_list)
            .unwrap_or_default(),
        timeout_secs: args.timeout_secs,
        max_attempts: None,
        base_delay_ms: None,
    }
}
