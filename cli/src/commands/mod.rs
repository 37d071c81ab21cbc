pub mod admin;
pub mod lifecycle;

use crate::GlobalOpts;
use clap::Subcommand;
use jailrun_container::{LifecycleController, LifecycleError};
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the state of a container as OCI state JSON
    State {
        /// Container ID
        container_id: String,
    },
    /// Create a container from a bundle
    Create {
        /// Path to the bundle directory
        #[arg(long, short = 'b')]
        bundle: Option<PathBuf>,

        /// Write the init process pid to this file once started
        #[arg(long)]
        pid_file: Option<PathBuf>,

        /// Pass N additional file descriptors, starting at fd 3, to the
        /// container's init process
        #[arg(long, default_value_t = 0, value_name = "N")]
        preserve_fds: u32,

        /// Container ID
        container_id: String,

        /// Bundle directory, if not given with --bundle
        #[arg(value_name = "BUNDLE")]
        bundle_path: Option<PathBuf>,
    },
    /// Start the init process of a created container
    Start {
        /// Container ID
        container_id: String,
    },
    /// Send a signal to the container's init process
    Kill {
        /// Signal every process in the jail, not just the init process group
        #[arg(long, short)]
        all: bool,

        /// Container ID
        container_id: String,

        /// Signal name or number
        #[arg(default_value = "TERM")]
        signal: String,
    },
    /// Delete a container and release its jail
    #[command(visible_alias = "rm")]
    Delete {
        /// Stop a running container first
        #[arg(long, short)]
        force: bool,

        /// Seconds to wait after SIGTERM before sending SIGKILL
        #[arg(long, short)]
        timeout: Option<u64>,

        /// Container ID
        container_id: String,
    },
    /// List containers
    #[command(visible_alias = "ps")]
    List {
        /// Only print container IDs
        #[arg(long, short)]
        quiet: bool,

        #[arg(long, value_enum, default_value_t = admin::ListFormat::Table)]
        format: admin::ListFormat,
    },
    /// Force-remove a jail by name or jid
    Cleanup {
        /// Jail name or jid
        #[arg(short = 'j', long = "jail")]
        jail: String,
    },
    /// Start a container and supervise its init process until it exits
    #[command(hide = true)]
    Monitor {
        /// Container ID
        container_id: String,
    },
}

pub async fn execute(
    controller: &LifecycleController,
    global: &GlobalOpts,
    cmd: Commands,
) -> Result<(), LifecycleError> {
    match cmd {
        Commands::State { container_id } => lifecycle::state(controller, &container_id).await,
        Commands::Create {
            bundle,
            pid_file,
            preserve_fds,
            container_id,
            bundle_path,
        } => {
            let bundle = bundle.or(bundle_path).unwrap_or_else(|| PathBuf::from("."));
            let opts = lifecycle::CreateArgs {
                bundle,
                pid_file,
                preserve_fds,
            };
            lifecycle::create(controller, global, &container_id, opts).await
        }
        Commands::Start { container_id } => {
            lifecycle::start(controller, global, &container_id).await
        }
        Commands::Kill {
            all,
            container_id,
            signal,
        } => lifecycle::kill(controller, &container_id, &signal, all).await,
        Commands::Delete {
            force,
            timeout,
            container_id,
        } => lifecycle::delete(controller, &container_id, force, timeout).await,
        Commands::List { quiet, format } => admin::list(controller, quiet, format).await,
        Commands::Cleanup { jail } => admin::cleanup(controller, &jail).await,
        Commands::Monitor { container_id } => admin::monitor(controller, &container_id).await,
    }
}
