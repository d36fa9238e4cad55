//! Clusterprofile CLI
//!
//! Loads the credentials of a cluster profile and renders them as a shell
//! script.
//!
//! # Usage
//!
//! ```bash
//! # Load (or reuse) credentials for prod and write ~/.clusterid/export.sh
//! clusterprofile --profile prod
//! source ~/.clusterid/export.sh
//!
//! # Print the script instead of writing it
//! eval "$(clusterprofile --profile prod --echo)"
//!
//! # Inspect or drop the cached entry
//! clusterprofile --profile prod show
//! clusterprofile --profile prod remove
//! ```

mod render;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clusterprofile_core::{
    CacheFile, ClusterProfiles, ProviderFailurePolicy, TracingReporter, load_profiles,
};
use directories::BaseDirs;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt};

use crate::render::{Banner, render_script, write_exec_file};

#[derive(Parser)]
#[command(name = "clusterprofile")]
#[command(about = "Load cluster credentials into the shell")]
#[command(version)]
struct Cli {
    /// Folder holding the profile definitions [default: ~/.clusterid/profiles/]
    #[arg(short = 'f', long, env = "CLUSTERID_CONFIG_FOLDER", global = true)]
    profile_folder: Option<PathBuf>,

    /// Credentials cache file [default: ~/.clusterid/credentials]
    #[arg(short, long, env = "CLUSTERID_PROFILE_FILE", global = true)]
    creds: Option<PathBuf>,

    /// Script the export lines are written to [default: ~/.clusterid/export.sh]
    #[arg(short, long, env = "CLUSTERID_EXEC_FILE", global = true)]
    exec: Option<PathBuf>,

    /// Name of the profile
    #[arg(short, long, env = "PROFILE_NAME", global = true)]
    profile: Option<String>,

    /// Print the script to stdout instead of writing the exec file
    #[arg(long, global = true)]
    echo: bool,

    /// Show a banner with the profile name when the script runs
    #[arg(short, long, global = true)]
    banner: bool,

    /// Command used for the banner
    #[arg(long, default_value = "figlet", global = true)]
    banner_cmd: String,

    /// Arguments for the banner command (comma-separated)
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true, global = true)]
    banner_args: Vec<String>,

    /// Continue without providers that fail to generate credentials
    #[arg(long, global = true)]
    skip_failed_providers: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy, Debug, PartialEq, Eq)]
enum Commands {
    /// Load credentials, regenerating them if missing or expired (default)
    #[command(alias = "l")]
    Load,

    /// Print the cached credentials
    #[command(alias = "s")]
    Show,

    /// Remove the cached credentials
    #[command(alias = "r")]
    Remove,
}

/// Files the CLI works on, after applying defaults.
#[derive(Debug)]
struct Paths {
    profile_folder: PathBuf,
    creds: PathBuf,
    exec: PathBuf,
}

impl Paths {
    fn resolve(cli: &Cli) -> Result<Self> {
        let base = clusterid_dir();
        let default = |name: &str| -> Result<PathBuf> {
            base.as_ref()
                .map(|dir| dir.join(name))
                .context("Could not determine the home directory; pass the path explicitly")
        };

        Ok(Self {
            profile_folder: match &cli.profile_folder {
                Some(path) => path.clone(),
                None => default("profiles")?,
            },
            creds: match &cli.creds {
                Some(path) => path.clone(),
                None => default("credentials")?,
            },
            exec: match &cli.exec {
                Some(path) => path.clone(),
                None => default("export.sh")?,
            },
        })
    }
}

fn clusterid_dir() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.home_dir().join(".clusterid"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("clusterprofile: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let paths = Paths::resolve(&cli)?;
    debug!("Using {:?}", paths);

    let profile = cli
        .profile
        .clone()
        .filter(|p| !p.is_empty())
        .context("No profile given; use --profile or set PROFILE_NAME")?;

    let configs = load_profiles(&paths.profile_folder)
        .with_context(|| format!("Failed to load profiles from {:?}", paths.profile_folder))?;
    let policy = if cli.skip_failed_providers {
        ProviderFailurePolicy::Skip
    } else {
        ProviderFailurePolicy::Abort
    };
    let profiles = ClusterProfiles::new(configs).with_failure_policy(policy);

    let mut cache = CacheFile::open(&paths.creds)
        .with_context(|| format!("Failed to open credentials {:?}", paths.creds))?;

    match cli.command.unwrap_or(Commands::Load) {
        Commands::Load => load(&cli, &paths, &profiles, &mut cache, &profile).await,
        Commands::Show => show(&profiles, &cache, &profile),
        Commands::Remove => remove(&profiles, &mut cache, &profile),
    }
}

async fn load(
    cli: &Cli,
    paths: &Paths,
    profiles: &ClusterProfiles,
    cache: &mut CacheFile,
    profile: &str,
) -> Result<()> {
    let loaded = profiles
        .load(profile, cache.cache_mut(), &mut TracingReporter)
        .await
        .with_context(|| format!("Failed to load profile {}", profile))?;
    cache
        .commit()
        .with_context(|| format!("Failed to save credentials in {:?}", cache.path()))?;

    let banner = Banner::resolve(cli.banner, &cli.banner_cmd, cli.banner_args.clone());
    let script = render_script(profile, &loaded.export_lines, banner.as_ref());

    if cli.echo {
        print!("{}", script);
    } else {
        write_exec_file(&paths.exec, &script)?;
        debug!("Wrote {:?}", paths.exec);
    }
    Ok(())
}

fn show(profiles: &ClusterProfiles, cache: &CacheFile, profile: &str) -> Result<()> {
    let lines = profiles
        .show(profile, cache.cache())
        .with_context(|| format!("Failed to show profile {}", profile))?;

    if !lines.is_empty() {
        println!("[{}]", profile);
        for line in lines {
            println!("{}", line);
        }
    }
    Ok(())
}

fn remove(profiles: &ClusterProfiles, cache: &mut CacheFile, profile: &str) -> Result<()> {
    profiles
        .remove(profile, cache.cache_mut())
        .with_context(|| format!("Failed to remove profile {}", profile))?;
    cache
        .commit()
        .with_context(|| format!("Failed to save credentials in {:?}", cache.path()))?;
    Ok(())
}
