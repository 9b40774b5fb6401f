use std::env;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use xnat_sync::app::{App, CheckReport, LoadOptions, SaveOutcome, SaveReport, SaveRequest};
use xnat_sync::config::{ConfigLoader, ResolvedConfig};
use xnat_sync::error::SyncError;
use xnat_sync::host::{DirectorySceneSerializer, FileCheckHost};
use xnat_sync::load::{FormatKind, LoadOutcome, LoadReport};
use xnat_sync::output::{JsonOutput, LogSink, OutputMode};
use xnat_sync::store::Store;
use xnat_sync::xnat::{CancelToken, XnatHttpClient};

const PASSWORD_VAR: &str = "XNAT_PASSWORD";
const ABORTED_EXIT: u8 = 4;

#[derive(Parser)]
#[command(name = "xnat-sync")]
#[command(about = "Cache-aware download and scene upload for XNAT archives")]
#[command(version, author)]
struct Cli {
    /// Path to xnat-sync.json (defaults to ./xnat-sync.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print machine-readable JSON reports on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download (or reuse from cache) and load remote files")]
    Load(TargetArgs),
    #[command(about = "Report whether remote files are already cached")]
    Check(TargetArgs),
    #[command(about = "Package a scene directory and upload it")]
    Save(SaveArgs),
}

#[derive(Args)]
struct TargetArgs {
    /// Remote file URIs from one resource's files collection
    #[arg(required = true)]
    uris: Vec<String>,

    /// Configured host name or base URL
    #[arg(long)]
    host: Option<String>,

    /// Force a file family instead of detecting it from extensions
    #[arg(long)]
    format: Option<FormatKind>,
}

#[derive(Args)]
struct SaveArgs {
    /// Remote level to attach the scene to, e.g. /data/projects/P/subjects/S/experiments/E
    #[arg(long)]
    level: String,

    /// Scene file name; `.zip` is appended on upload
    #[arg(long)]
    name: String,

    /// Directory holding the serialized scene
    #[arg(long)]
    scene: Utf8PathBuf,

    /// The scene was opened from an earlier download
    #[arg(long)]
    linked: bool,

    #[arg(long)]
    host: Option<String>,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(error) = report.downcast_ref::<SyncError>() {
                return ExitCode::from(map_exit_code(error));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error {
        SyncError::ConfigRead(_)
        | SyncError::ConfigParse(_)
        | SyncError::UnknownHost(_)
        | SyncError::InvalidAddress(_)
        | SyncError::InvalidRequest(_) => 2,
        SyncError::AuthenticationFailure { .. }
        | SyncError::XnatHttp(_)
        | SyncError::XnatStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let store = Store::new(&config)?;
    let password = env::var(PASSWORD_VAR).ok();

    match cli.command {
        Commands::Load(args) => run_load(args, config, store, password, output_mode),
        Commands::Check(args) => run_check(args, config, store, output_mode),
        Commands::Save(args) => run_save(args, config, store, password, output_mode),
    }
}

fn build_app(
    config: ResolvedConfig,
    store: Store,
    first_uri: &str,
    host: Option<&str>,
) -> miette::Result<App<XnatHttpClient, FileCheckHost>> {
    let address = first_uri.parse()?;
    let host = config.host_for(&address, host)?;
    let client = XnatHttpClient::new(&host.url)?;
    Ok(App::new(store, config, client, FileCheckHost)?)
}

fn run_load(
    args: TargetArgs,
    config: ResolvedConfig,
    store: Store,
    password: Option<String>,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let app = build_app(config, store, &args.uris[0], args.host.as_deref())?;
    let options = LoadOptions {
        host: args.host,
        format: args.format,
        password,
    };
    let cancel = CancelToken::new();
    let report = match output_mode {
        OutputMode::Json => {
            let report = app.load(&args.uris, &options, &cancel, &JsonOutput)?;
            JsonOutput::print_load(&report).into_diagnostic()?;
            report
        }
        OutputMode::Text => {
            let report = app.load(&args.uris, &options, &cancel, &LogSink)?;
            print_load_summary(&report);
            report
        }
    };

    match report.outcome {
        LoadOutcome::Done { .. } => Ok(ExitCode::SUCCESS),
        LoadOutcome::Aborted => Ok(ExitCode::from(ABORTED_EXIT)),
        LoadOutcome::Failed { error, .. } => Err(error.into()),
    }
}

fn run_check(
    args: TargetArgs,
    config: ResolvedConfig,
    store: Store,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let app = build_app(config, store, &args.uris[0], args.host.as_deref())?;
    let options = LoadOptions {
        host: args.host,
        format: args.format,
        password: None,
    };
    let report = app.check(&args.uris, &options)?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_check(&report).into_diagnostic()?,
        OutputMode::Text => print_check_summary(&report),
    }
    Ok(ExitCode::SUCCESS)
}

fn run_save(
    args: SaveArgs,
    config: ResolvedConfig,
    store: Store,
    password: Option<String>,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let serializer = DirectorySceneSerializer::new(args.scene, config.formats.clone());
    let app = build_app(config, store, &args.level, args.host.as_deref())?;
    let request = SaveRequest {
        save_level: args.level,
        file_name: args.name,
        linked: args.linked,
        host: args.host,
        password,
    };
    let report = match output_mode {
        OutputMode::Json => {
            let report = app.save(&request, &serializer, &JsonOutput)?;
            JsonOutput::print_save(&report).into_diagnostic()?;
            report
        }
        OutputMode::Text => {
            let report = app.save(&request, &serializer, &LogSink)?;
            print_save_summary(&report);
            report
        }
    };

    match report.outcome {
        SaveOutcome::Done { .. } => Ok(ExitCode::SUCCESS),
        SaveOutcome::Failed { error, .. } => Err(error.into()),
    }
}

fn print_load_summary(report: &LoadReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("{cyan}xnat-sync load ({}){reset}", report.format);
    let stages = report
        .stages
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ");
    println!("   stages: {stages}");
    match &report.outcome {
        LoadOutcome::Done {
            session,
            files,
            from_cache,
        } => {
            let source = if *from_cache { "cache" } else { "download" };
            println!(
                "{green}loaded {} file(s) from {source}{reset}",
                files.len()
            );
            for file in files {
                println!("{green}   {file}{reset}");
            }
            println!("   session: {}", session.session_type());
        }
        LoadOutcome::Aborted => println!("{yellow}aborted{reset}"),
        LoadOutcome::Failed { stage, error } => {
            println!("{red}failed at {stage}: {error}{reset}");
        }
    }
}

fn print_check_summary(report: &CheckReport) {
    let verdict = if report.hit { "hit" } else { "miss" };
    println!("cache {verdict} ({})", report.format);
    if !report.use_cache {
        println!("   caching is disabled for this host; load will always download");
    }
    for path in &report.paths {
        println!("   {path}");
    }
}

fn print_save_summary(report: &SaveReport) {
    match &report.outcome {
        SaveOutcome::Done { session, bundle } => {
            println!("\x1b[32muploaded {}\x1b[0m", report.save_uri);
            println!("   session: {}", session.session_type());
            if let Some(bundle) = bundle {
                println!("   bundle kept at {bundle}");
            }
        }
        SaveOutcome::Failed {
            stage,
            error,
            bundle,
        } => {
            println!("\x1b[31mfailed at {stage:?}: {error}\x1b[0m");
            if let Some(bundle) = bundle {
                println!("   bundle kept at {bundle}");
            }
        }
    }
}
