use clap::{Parser, Subcommand};
use pkgops::OperationCommand;

#[derive(Parser)]
#[command(name = "pkgops")]
#[command(about = "Run package-manager operations concurrently and stream their output")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Install one or more packages
    Install {
        /// Package names
        #[arg(required = true)]
        packages: Vec<String>,

        /// Bucket to install from
        #[arg(short, long)]
        bucket: Option<String>,
    },

    /// Update one or more packages
    Update {
        /// Package names
        #[arg(required = true)]
        packages: Vec<String>,

        /// Force the update even if the package is current
        #[arg(short, long)]
        force: bool,
    },

    /// Update every installed package
    UpdateAll,

    /// Uninstall one or more packages
    Uninstall {
        /// Package names
        #[arg(required = true)]
        packages: Vec<String>,
    },

    /// Remove cached downloads for packages
    ClearCache {
        /// Package names
        #[arg(required = true)]
        packages: Vec<String>,
    },

    /// Scan packages with VirusTotal
    Scan {
        /// Package names
        #[arg(required = true)]
        packages: Vec<String>,

        /// Bucket the packages come from
        #[arg(short, long)]
        bucket: Option<String>,
    },

    /// Run arbitrary shell commands, one operation each
    Run {
        /// Command lines
        #[arg(required = true)]
        commands: Vec<String>,
    },
}

impl Commands {
    /// One operation per package or command line.
    pub fn into_operations(self) -> Vec<OperationCommand> {
        match self {
            Commands::Install { packages, bucket } => packages
                .into_iter()
                .map(|package| OperationCommand::Install {
                    package,
                    bucket: bucket.clone(),
                })
                .collect(),
            Commands::Update { packages, force } => packages
                .into_iter()
                .map(|package| OperationCommand::Update { package, force })
                .collect(),
            Commands::UpdateAll => vec![OperationCommand::UpdateAll],
            Commands::Uninstall { packages } => packages
                .into_iter()
                .map(|package| OperationCommand::Uninstall { package })
                .collect(),
            Commands::ClearCache { packages } => packages
                .into_iter()
                .map(|package| OperationCommand::ClearCache { package })
                .collect(),
            Commands::Scan { packages, bucket } => packages
                .into_iter()
                .map(|package| OperationCommand::Scan {
                    package,
                    bucket: bucket.clone(),
                })
                .collect(),
            Commands::Run { commands } => commands
                .into_iter()
                .map(|command| OperationCommand::Run { command })
                .collect(),
        }
    }
}
