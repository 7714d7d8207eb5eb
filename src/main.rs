use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use fantasy_five::{
    chain::Address,
    client,
    deployment,
};
use std::{
    path::{
        Path,
        PathBuf,
    },
    sync::OnceLock,
    time::Duration,
};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling,
};
use tracing_subscriber::{
    EnvFilter,
    fmt,
};

const DEFAULT_LOG_DIR: &str = "~/.fantasy-five/logs";
const LOG_FILE: &str = "fantasy-five.log";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn print_usage_and_exit() -> ! {
    println!(
        "Usage: fantasy-five [--sepolia | --local] [--rpc-url <url>]\n\
         [--contract <address>] [--operator <address>]\n\
         [--poll-interval <secs>] [--deployments-dir <path>] [--log-dir <path>]\n\
         \n\
         Flags:\n\
           --sepolia                Use Sepolia testnet (default RPC {})\n\
           --local                  Use a local development node (default RPC {})\n\
           --rpc-url <url>          Override the wallet RPC URL for the selected network\n\
           --contract <address>     Lottery contract (defaults to the latest recorded deployment)\n\
           --operator <address>     Account allowed to withdraw the contract balance\n\
           --poll-interval <secs>   Seconds between lottery state refreshes (default {})\n\
           --deployments-dir <path> Deployment records root (default {})\n\
           --log-dir <path>         Where to write {} (default {})",
        client::DEFAULT_SEPOLIA_RPC_URL,
        client::DEFAULT_LOCAL_RPC_URL,
        client::DEFAULT_POLL_INTERVAL.as_secs(),
        deployment::DEPLOYMENTS_ROOT,
        LOG_FILE,
        DEFAULT_LOG_DIR,
    );
    std::process::exit(0);
}

#[derive(Debug)]
struct CliArgs {
    config: client::AppConfig,
    log_dir: PathBuf,
}

fn parse_cli_args(args: impl IntoIterator<Item = String>) -> Result<CliArgs> {
    #[derive(Clone, Copy)]
    enum NetworkFlag {
        Sepolia,
        Local,
    }

    fn once<T>(slot: &mut Option<T>, value: T, flag: &str) -> Result<()> {
        if slot.is_some() {
            return Err(eyre!("{flag} may only be specified once"));
        }
        *slot = Some(value);
        Ok(())
    }

    fn address(raw: &str, flag: &str) -> Result<Address> {
        raw.parse::<Address>()
            .map_err(|e| eyre!("{flag} expects a 0x-prefixed address: {e}"))
    }

    let mut args = args.into_iter();
    let mut network_flag: Option<NetworkFlag> = None;
    let mut custom_url: Option<String> = None;
    let mut contract: Option<Address> = None;
    let mut operator: Option<Address> = None;
    let mut poll_interval: Option<Duration> = None;
    let mut deployments_dir: Option<String> = None;
    let mut log_dir: Option<String> = None;

    while let Some(arg) = args.next() {
        let mut value = |what: &str| {
            args.next()
                .ok_or_else(|| eyre!("{arg} requires {what} argument"))
        };
        match arg.as_str() {
            "--sepolia" | "--local" => {
                if network_flag.is_some() {
                    return Err(eyre!(
                        "Multiple network flags provided; choose one of --sepolia/--local"
                    ));
                }
                network_flag = Some(if arg == "--sepolia" {
                    NetworkFlag::Sepolia
                } else {
                    NetworkFlag::Local
                });
            }
            "--rpc-url" => {
                let url = value("a URL")?;
                if network_flag.is_none() {
                    return Err(eyre!(
                        "--rpc-url must follow a network flag (--sepolia/--local)"
                    ));
                }
                once(&mut custom_url, url, "--rpc-url")?;
            }
            "--contract" => {
                let raw = value("an address")?;
                once(&mut contract, address(&raw, "--contract")?, "--contract")?;
            }
            "--operator" => {
                let raw = value("an address")?;
                once(&mut operator, address(&raw, "--operator")?, "--operator")?;
            }
            "--poll-interval" => {
                let raw = value("a number of seconds")?;
                let secs = raw
                    .parse::<u64>()
                    .ok()
                    .filter(|secs| *secs > 0)
                    .ok_or_else(|| eyre!("--poll-interval must be a positive number of seconds"))?;
                once(&mut poll_interval, Duration::from_secs(secs), "--poll-interval")?;
            }
            "--deployments-dir" => {
                let dir = value("a path")?;
                once(&mut deployments_dir, dir, "--deployments-dir")?;
            }
            "--log-dir" => {
                let dir = value("a path")?;
                once(&mut log_dir, dir, "--log-dir")?;
            }
            "--help" | "-h" => print_usage_and_exit(),
            other => return Err(eyre!("Unknown argument: {other}")),
        }
    }

    let network = match network_flag {
        None => return Err(eyre!("Select a network with --sepolia or --local")),
        Some(NetworkFlag::Sepolia) => client::NetworkTarget::Sepolia {
            url: custom_url.unwrap_or_else(|| client::DEFAULT_SEPOLIA_RPC_URL.to_string()),
        },
        Some(NetworkFlag::Local) => client::NetworkTarget::Local {
            url: custom_url.unwrap_or_else(|| client::DEFAULT_LOCAL_RPC_URL.to_string()),
        },
    };

    let expand = |raw: &str| PathBuf::from(shellexpand::tilde(raw).into_owned());
    Ok(CliArgs {
        config: client::AppConfig {
            network,
            contract,
            operator,
            poll_interval: poll_interval.unwrap_or(client::DEFAULT_POLL_INTERVAL),
            deployments_dir: expand(
                deployments_dir.as_deref().unwrap_or(deployment::DEPLOYMENTS_ROOT),
            ),
        },
        log_dir: expand(log_dir.as_deref().unwrap_or(DEFAULT_LOG_DIR)),
    })
}

// The terminal belongs to the dashboard, so logs go to a file.
fn init_tracing(log_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(log_dir)
        .wrap_err_with(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(rolling::never(log_dir, LOG_FILE));
    let _ = LOG_GUARD.set(guard);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| eyre!("Failed to install log subscriber: {e}"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = parse_cli_args(std::env::args().skip(1))?;
    init_tracing(&args.log_dir)?;
    tracing::info!("starting fantasy-five client");
    client::run_app(args.config).await
}
