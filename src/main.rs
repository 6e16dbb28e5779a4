//!
#![warn(missing_debug_implementations, rust_2018_idioms, missing_docs)]

use std::process;

use clap::{Args, Parser, Subcommand};
use log::{error, LevelFilter};

use local_path_provisioner::{error::EXIT_USAGE, lifecycle, shutdown, Environment, StartFlags};

/// Local Path Provisioner
#[derive(Debug, Parser)]
#[command(version, about, subcommand_required = true, arg_required_else_help = true)]
struct Cli {
    /// enable debug logging level
    #[arg(
        short,
        long,
        global = true,
        env = "RANCHER_DEBUG",
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the provisioner
    Start(StartArgs),
}

#[derive(Debug, Args)]
struct StartArgs {
    /// Required. Provisioner configuration file. Read from the local-path-config ConfigMap when empty
    #[arg(long)]
    config: Option<String>,

    /// Required. Specify Provisioner name [env: PROVISIONER_NAME] [default: rancher.io/local-path]
    #[arg(long)]
    provisioner_name: Option<String>,

    /// Required. The namespace that Provisioner is running in [env: POD_NAMESPACE] [default: local-path-storage]
    #[arg(long)]
    namespace: Option<String>,

    /// Required. The helper image used for create/delete directories on the host [env: HELPER_IMAGE] [default: busybox]
    #[arg(long)]
    helper_image: Option<String>,

    /// Paths to a kubeconfig. Only required when it is out-of-cluster
    #[arg(long)]
    kubeconfig: Option<String>,
}

impl From<StartArgs> for StartFlags {
    fn from(args: StartArgs) -> Self {
        StartFlags {
            config_file: args.config,
            provisioner_name: args.provisioner_name,
            namespace: args.namespace,
            helper_image: args.helper_image,
            kubeconfig: args.kubeconfig,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            if e.use_stderr() {
                process::exit(EXIT_USAGE);
            }
            return;
        }
    };

    init_logging(cli.debug);

    let res = match cli.command {
        Command::Start(args) => start(args).await,
    };
    if let Err(e) = res {
        error!("Error starting daemon: {}", e);
        process::exit(e.exit_code());
    }
}

async fn start(args: StartArgs) -> local_path_provisioner::Result<()> {
    // armed before the first blocking call
    let signal = shutdown::arm()?;
    lifecycle::start(args.into(), Environment::from_process(), signal).await
}

fn init_logging(debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::new()
        .filter_level(level)
        .filter_module("kube", LevelFilter::Warn)
        .filter_module("hyper", LevelFilter::Warn)
        .filter_module("tower", LevelFilter::Warn)
        .parse_default_env()
        .init();
}
