//! xcodecache - a build-product cache for pods-based Xcode workspaces.

use clap::{Parser, Subcommand};
use miette::Result;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use xcodecache_types::Config;

mod error;
mod inject;
mod stages;
mod workspace;

#[derive(Parser)]
#[command(name = "xcodecache")]
#[command(version, about = "Build-product cache for pods-based Xcode workspaces", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    global: GlobalOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct GlobalOptions {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fingerprint targets, bind cache hits and prepare the projects.
    /// Run before the build with the same arguments the build gets.
    Pre {
        /// Build-tool arguments; `-configuration <name>` is required
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        build_args: Vec<String>,
    },

    /// Archive newly built products, restore the projects, evict the cache.
    /// Run after the build with the same arguments as `pre`.
    Post {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        build_args: Vec<String>,
    },

    /// Capture one target's build environment (invoked by the build tool)
    Printenv {
        target_name: String,
        project_path: PathBuf,
    },

    /// Unpack one cached product into the build tree (invoked by the build tool)
    Extract {
        cache_dir: PathBuf,
        build_product_dir: String,
        build_intermediate_dir: String,
    },

    /// Restore projects and remove sidecar state left by an interrupted run
    Clean,
}

fn main() -> Result<()> {
    error::setup();
    let cli = Cli::parse();

    let log_level = match cli.global.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    if !cli.global.quiet {
        tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_target(false)
            .init();
    }

    let cwd = env::current_dir().map_err(|err| miette::miette!("cannot read cwd: {err}"))?;
    match cli.command {
        Commands::Pre { build_args } => {
            let config = Config::from_env().map_err(error::StageError::from)?;
            stages::pre::run(&config, &cwd, &build_args)?;
        }
        Commands::Post { build_args } => {
            let config = Config::from_env().map_err(error::StageError::from)?;
            stages::post::run(&config, &cwd, &build_args)?;
        }
        Commands::Printenv {
            target_name,
            project_path,
        } => {
            let vars: BTreeMap<String, String> = env::vars().collect();
            stages::printenv::run(&target_name, &project_path, &vars)?;
        }
        Commands::Extract {
            cache_dir,
            build_product_dir,
            build_intermediate_dir,
        } => {
            let vars: BTreeMap<String, String> = env::vars().collect();
            stages::extract::run(&cache_dir, &build_product_dir, &build_intermediate_dir, &vars)?;
        }
        Commands::Clean => {
            stages::clean::run(&cwd)?;
        }
    }

    Ok(())
}
