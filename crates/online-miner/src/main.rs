mod datasource;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use datasource::{DatasourceBackend, parse_accounts};
use photos_index::bus::address::BusAddress;
use photos_index::{logging, online_miner::peer};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Environment variable carrying the comma separated account ids to mine.
const ACCOUNTS_ENV: &str = "PHOTOS_ONLINE_MINER_ACCOUNTS";
const PROGRAM_INFIX: &str = "-online-miner-";

#[derive(Parser, Debug)]
#[command(
    name = "photos-online-miner",
    version,
    about = "Online miner helper spawned by photos-index."
)]
struct Cli {
    /// Bus address of the online miner manager.
    #[arg(long)]
    address: String,

    /// Provider type. Taken from the program name when omitted.
    #[arg(long)]
    provider: Option<String>,

    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() {
    if let Err(err) = try_main().await {
        error!(error = ?err, "photos-online-miner exited with error");
        std::process::exit(1);
    }
}

async fn try_main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let provider = match cli.provider {
        Some(provider) => provider,
        None => provider_from_program(std::env::args_os().next().as_deref().map(Path::new))?,
    };
    let address: BusAddress = cli
        .address
        .parse()
        .with_context(|| format!("parsing bus address {}", cli.address))?;
    let accounts = std::env::var(ACCOUNTS_ENV)
        .map(|value| parse_accounts(&value))
        .unwrap_or_default();
    info!(%provider, accounts = accounts.len(), "starting online miner");

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    let backend = Arc::new(DatasourceBackend::new(provider.clone(), accounts));
    peer::run(&address, &provider, backend, cancel)
        .await
        .with_context(|| format!("serving online miner for {provider}"))
}

/// `<tarname>-online-miner-<provider>` yields `<provider>`.
fn provider_from_program(program: Option<&Path>) -> Result<String> {
    let name = program
        .and_then(Path::file_name)
        .and_then(|name| name.to_str())
        .context("program name unavailable; pass --provider")?;
    match name.rsplit_once(PROGRAM_INFIX) {
        Some((_, provider)) if !provider.is_empty() => Ok(provider.to_string()),
        _ => bail!("cannot derive provider from program name {name:?}; pass --provider"),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::provider_from_program;

    #[test]
    fn provider_comes_from_program_suffix() {
        let program = Path::new("/usr/libexec/gnome-photos-online-miner-google");
        assert_eq!(provider_from_program(Some(program)).unwrap(), "google");
    }

    #[test]
    fn plain_program_name_is_rejected() {
        assert!(provider_from_program(Some(Path::new("photos-online-miner"))).is_err());
        assert!(provider_from_program(None).is_err());
    }
}
