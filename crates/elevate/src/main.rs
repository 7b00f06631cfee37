mod artifact;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};
use tracing::info;

use elevation::credentials::{self, AzureCli, CachedCredential};
use elevation::{
    detect_context, AzureMlPlatform, ElevationConfig, ElevationError, ElevationGuard,
    ElevationOutcome, EnvironmentDeletion, EnvironmentResolver, ExecutionContext,
    InMemoryPlatform, RemotePlatform, WorkspaceHandle,
};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a script here if already remote, otherwise submit it as a job
    Run {
        /// Package and resolve against an in-memory platform; nothing is sent
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Script or executable to run
        entry_point: String,
        /// Arguments passed through to the entry point
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print the detected execution context
    Detect,
    /// Build an artifact with the configured build command
    Package,
    /// Remove the artifact directory
    Clean,
    /// Cache an access token from the Azure CLI
    Login,
    /// Delete one registered environment version
    DeleteEnv {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        version: Option<String>,
        /// Content hash the registered version must carry
        #[arg(long)]
        hash: Option<String>,
    },
    /// Show the status of a submitted job
    Status { job: String },
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match dispatch(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

/// Print an error with its class and any platform diagnostics.
fn report(err: &anyhow::Error) {
    match err.downcast_ref::<ElevationError>() {
        Some(elevation_err) => {
            eprintln!("error[{}]: {err:#}", elevation_err.code());
            if let ElevationError::Submission {
                diagnostics: Some(diagnostics),
                ..
            } = elevation_err
            {
                if let Ok(pretty) = serde_json::to_string_pretty(diagnostics) {
                    eprintln!("{pretty}");
                }
            }
        }
        None => eprintln!("error: {err:#}"),
    }
}

fn dispatch(args: Args) -> Result<()> {
    // Detected once; everything below receives it explicitly
    let context = detect_context();
    let project_root = match args.project {
        Some(path) => path,
        None => std::env::current_dir().context("Failed to read current directory")?,
    };

    match args.command {
        Commands::Run {
            dry_run,
            entry_point,
            args,
        } => run(context, &project_root, dry_run, &entry_point, &args),
        Commands::Detect => {
            println!("{}", serde_json::to_string_pretty(&context)?);
            Ok(())
        }
        Commands::Package => {
            let config = ElevationConfig::load(&project_root)?;
            let path = artifact::build(&config)?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Clean => {
            let config = ElevationConfig::load(&project_root)?;
            if !artifact::clean(&config)? {
                info!("Nothing to clean");
            }
            Ok(())
        }
        Commands::Login => {
            let path = CachedCredential::default_path()?;
            let credential = AzureCli::new().login(&path)?;
            println!("Token cached until {}", credential.expires_on);
            Ok(())
        }
        Commands::DeleteEnv {
            name,
            version,
            hash,
        } => {
            let workspace = WorkspaceHandle::load(&project_root)?;
            let platform = azure_platform()?;
            EnvironmentResolver::new(&platform, &workspace).delete_environment(
                &EnvironmentDeletion {
                    name,
                    version,
                    content_hash: hash,
                },
            )?;
            Ok(())
        }
        Commands::Status { job } => {
            let workspace = WorkspaceHandle::load(&project_root)?;
            let status = azure_platform()?
                .job_status(&workspace, &job)
                .with_context(|| format!("Failed to fetch status of {job}"))?;
            println!("{job}: {status}");
            Ok(())
        }
    }
}

fn run(
    context: ExecutionContext,
    project_root: &Path,
    dry_run: bool,
    entry_point: &str,
    args: &[String],
) -> Result<()> {
    if let ExecutionContext::Remote(markers) = &context {
        info!(run_id = %markers.run_id, entry_point, "Remote context, running in place");
        let code = run_in_place(project_root, entry_point, args)?;
        std::process::exit(code);
    }

    let config = ElevationConfig::load(project_root)?;
    let outcome = if dry_run {
        let platform = InMemoryPlatform::new();
        let outcome = ElevationGuard::new(context, &platform)
            .submit_if_needed(&config, entry_point, args)?;
        if let Some(job) = platform.jobs().first() {
            println!("{}", serde_json::to_string_pretty(job)?);
        }
        outcome
    } else {
        let platform = azure_platform()?;
        ElevationGuard::new(context, &platform).submit_if_needed(&config, entry_point, args)?
    };

    match outcome {
        ElevationOutcome::Submitted(handle) => {
            println!("{}", serde_json::to_string_pretty(&handle)?);
            Ok(())
        }
        // Context was local above
        ElevationOutcome::Remote(run) => {
            anyhow::bail!("unexpected remote outcome for {}", run.run_id)
        }
    }
}

/// Execute the entry point as a child process and return its exit code.
fn run_in_place(project_root: &Path, entry_point: &str, args: &[String]) -> Result<i32> {
    let mut command = if entry_point.ends_with(".py") {
        let mut c = Command::new("python");
        c.arg(entry_point);
        c
    } else {
        Command::new(entry_point)
    };
    let status = command
        .args(args)
        .current_dir(project_root)
        .status()
        .with_context(|| format!("Failed to run `{entry_point}`"))?;
    // Killed by a signal: report generic failure
    Ok(status.code().unwrap_or(1))
}

fn azure_platform() -> Result<AzureMlPlatform> {
    let token = credentials::resolve_access_token()?;
    Ok(AzureMlPlatform::new(token)?)
}
