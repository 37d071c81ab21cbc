mod commands;
mod logging;
mod output;
mod utils;

use clap::{Args, Parser};
use commands::Commands;
use jailrun_container::{
    DEFAULT_DEVFS_RULESET_VMM, DEFAULT_DEVFS_RULESET_VNET, DEFAULT_ROOT, LifecycleController,
    RuntimeConfig,
};
use logging::LogFormat;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "jailrun")]
#[command(about = "OCI container runtime on FreeBSD jails")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalOpts {
    /// Directory holding container state
    #[arg(long, global = true, env = "JAILRUN_ROOT", default_value = DEFAULT_ROOT)]
    root: PathBuf,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Log filter, e.g. `debug` or `jailrun_container=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Reject unknown org.freebsd.jail.* annotations
    #[arg(long, global = true)]
    strict: bool,

    /// Use the specified devfs ruleset for vnet jails
    #[arg(long, global = true, default_value_t = DEFAULT_DEVFS_RULESET_VNET)]
    devfs_ruleset_vnet: u32,

    /// Use the specified devfs ruleset for vmm jails
    #[arg(long, global = true, default_value_t = DEFAULT_DEVFS_RULESET_VMM)]
    devfs_ruleset_vmm: u32,

    /// Accepted for compatibility with container engines; ignored
    #[arg(long, global = true, hide = true)]
    systemd_cgroup: bool,
}

impl GlobalOpts {
    fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            root: self.root.clone(),
            strict: self.strict,
            devfs_ruleset_vnet: self.devfs_ruleset_vnet,
            devfs_ruleset_vmm: self.devfs_ruleset_vmm,
            ..RuntimeConfig::default()
        }
    }

    /// The options again as arguments, for handing to a child invocation.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args = vec![OsString::from("--root"), self.root.clone().into()];
        if let Some(log) = &self.log {
            args.push("--log".into());
            args.push(log.clone().into());
        }
        args.push("--log-format".into());
        args.push(self.log_format.as_str().into());
        if let Some(level) = &self.log_level {
            args.push("--log-level".into());
            args.push(level.into());
        }
        if self.strict {
            args.push("--strict".into());
        }
        args.push("--devfs-ruleset-vnet".into());
        args.push(self.devfs_ruleset_vnet.to_string().into());
        args.push("--devfs-ruleset-vmm".into());
        args.push(self.devfs_ruleset_vmm.to_string().into());
        args
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(
        cli.global.log.as_deref(),
        cli.global.log_format,
        cli.global.log_level.as_deref(),
    ) {
        output::print_error("Internal", &format!("cannot set up logging: {}", e));
        return ExitCode::FAILURE;
    }

    let controller = match LifecycleController::open(cli.global.runtime_config()).await {
        Ok(controller) => controller,
        Err(e) => {
            output::print_error(e.kind(), &e.to_string());
            return ExitCode::FAILURE;
        }
    };

    match commands::execute(&controller, &cli.global, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(kind = e.kind(), error = %e, "Command failed");
            output::print_error(e.kind(), &e.to_string());
            ExitCode::FAILURE
        }
    }
}
