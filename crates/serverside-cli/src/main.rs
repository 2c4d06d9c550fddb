mod cmd;
mod logging;
mod options;

use clap::{Parser, Subcommand};
use cmd::deploy::DeployAction;
use cmd::maintenance::Toggle;
use options::{CommonArgs, SourceArgs};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "serverside",
    about = "Server-side deploy orchestrator: releases, hooks and maintenance pages across an app fleet",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy the application, or roll it back
    Deploy {
        #[arg(value_enum, default_value_t = DeployAction::Deploy)]
        action: DeployAction,

        #[command(flatten)]
        common: CommonArgs,

        #[command(flatten)]
        source: SourceArgs,
    },

    /// Run a single deploy hook
    Hook {
        /// Hook name, e.g. before_migrate
        name: String,

        #[command(flatten)]
        common: CommonArgs,

        /// Release the hook runs in
        #[arg(long)]
        release_path: PathBuf,

        /// Roles of the server the hook runs as
        #[arg(long, num_args = 1..)]
        current_roles: Vec<String>,

        /// Name of the server the hook runs as
        #[arg(long)]
        current_name: Option<String>,
    },

    /// Bring new servers up to the current release
    Integrate {
        #[command(flatten)]
        common: CommonArgs,

        #[command(flatten)]
        source: SourceArgs,

        /// Keep files already present on the new servers
        #[arg(long)]
        ignore_existing: bool,
    },

    /// Restart the application servers
    Restart {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Put up the maintenance page
    #[command(name = "enable_maintenance")]
    EnableMaintenance {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Take down the maintenance page
    #[command(name = "disable_maintenance")]
    DisableMaintenance {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Report whether the maintenance page is up
    #[command(name = "maintenance_status")]
    MaintenanceStatus {
        #[command(flatten)]
        common: CommonArgs,
    },
}

impl Commands {
    fn common(&self) -> &CommonArgs {
        match self {
            Commands::Deploy { common, .. }
            | Commands::Hook { common, .. }
            | Commands::Integrate { common, .. }
            | Commands::Restart { common }
            | Commands::EnableMaintenance { common }
            | Commands::DisableMaintenance { common }
            | Commands::MaintenanceStatus { common } => common,
        }
    }

    /// Names the log file.
    fn log_name(&self) -> String {
        match self {
            Commands::Deploy { .. } => "deploy".to_string(),
            Commands::Hook { name, .. } => format!("deploy-hook-{name}"),
            Commands::Integrate { .. } => "integrate".to_string(),
            Commands::Restart { .. } => "restart".to_string(),
            Commands::EnableMaintenance { .. }
            | Commands::DisableMaintenance { .. }
            | Commands::MaintenanceStatus { .. } => "maintenance".to_string(),
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let common = cli.command.common();
    logging::init(&common.app, &cli.command.log_name(), common.verbose);

    let result = match &cli.command {
        Commands::Deploy {
            action,
            common,
            source,
        } => cmd::deploy::run(*action, common, source),
        Commands::Hook {
            name,
            common,
            release_path,
            current_roles,
            current_name,
        } => cmd::hook::run(
            name,
            common,
            release_path,
            current_roles,
            current_name.as_deref(),
        ),
        Commands::Integrate {
            common,
            source,
            ignore_existing,
        } => cmd::integrate::run(common, source, *ignore_existing),
        Commands::Restart { common } => cmd::restart::run(common),
        Commands::EnableMaintenance { common } => cmd::maintenance::run(Toggle::Enable, common),
        Commands::DisableMaintenance { common } => cmd::maintenance::run(Toggle::Disable, common),
        Commands::MaintenanceStatus { common } => cmd::maintenance::run(Toggle::Status, common),
    };

    if let Err(e) = result {
        tracing::error!("{e:#}");
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
