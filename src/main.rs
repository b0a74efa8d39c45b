//! Command line entrypoint: run the miner supervisor or print item queries.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use photos_index::config::Config;
use photos_index::events::MinersChanged;
use photos_index::query::{Query, QueryFlags};
use photos_index::{AppContext, logging, query_builder};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "photos-index", version, about = "Photo metadata query and online miner coordinator")]
struct Cli {
    /// Path to YAML config file. Built-in defaults are used when omitted.
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Supervise the online miners until interrupted.
    Run,
    /// Print, or run, one of the item queries.
    Query(QueryArgs),
}

#[derive(Debug, Args)]
struct QueryArgs {
    /// Run the query against the tracker store and print the rows as JSON.
    #[arg(long, global = true)]
    execute: bool,

    /// Offset of the page for paged queries.
    #[arg(long, default_value_t = 0, global = true)]
    offset: u32,

    #[command(subcommand)]
    kind: QueryKind,
}

#[derive(Debug, Subcommand)]
enum QueryKind {
    /// Every photo, newest first.
    Overview,
    Collections,
    Favorites,
    /// Items matching the search terms.
    Search { terms: Vec<String> },
    /// Number of photos.
    Count,
    /// One item by urn.
    Single { urn: String },
}

#[tokio::main]
async fn main() {
    if let Err(err) = try_main().await {
        error!(error = ?err, "photos-index exited with error");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn try_main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.validate().context("validating configuration")?;

    let ctx = AppContext::new(config);
    ctx.state().sources.refresh_accounts(&ctx.config().accounts);

    match cli.command {
        Commands::Run => run(&ctx).await,
        Commands::Query(args) => query(&ctx, args).await,
    }
}

async fn run(ctx: &AppContext) -> Result<()> {
    let miners = ctx
        .online_miner_manager()
        .await
        .context("starting the online miner manager")?;
    let mut changed = miners.subscribe();
    info!(address = %miners.address(), "supervising online miners");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            event = changed.recv() => match event {
                Ok(MinersChanged(running)) => {
                    let running: Vec<&str> = running.iter().map(|m| m.provider_type()).collect();
                    info!(?running, "online miners changed");
                }
                Err(RecvError::Lagged(skipped)) => info!(skipped, "missed miner updates"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    ctx.shutdown();
    Ok(())
}

async fn query(ctx: &AppContext, args: QueryArgs) -> Result<()> {
    let state = ctx.state();
    state.offsets.set_offset(args.offset);

    let query: Query = match &args.kind {
        QueryKind::Overview => query_builder::global_query(state, QueryFlags::OVERVIEW, &state.offsets),
        QueryKind::Collections => {
            query_builder::global_query(state, QueryFlags::COLLECTIONS, &state.offsets)
        }
        QueryKind::Favorites => {
            query_builder::global_query(state, QueryFlags::FAVORITES, &state.offsets)
        }
        QueryKind::Search { terms } => {
            state.search.set_string(&terms.join(" "));
            query_builder::global_query(state, QueryFlags::SEARCH, &state.offsets)
        }
        QueryKind::Count => query_builder::count_query(state, QueryFlags::OVERVIEW),
        QueryKind::Single { urn } => query_builder::single_query(state, QueryFlags::UNFILTERED, urn),
    };
    let query = query.with_tag(format!("{:?}", args.kind).to_lowercase());

    if !args.execute {
        println!("{}", query.sparql());
        return Ok(());
    }

    let queue = ctx
        .tracker_queue()
        .await
        .context("opening the tracker store")?;
    let cursor = queue
        .select_async(query, Some(ctx.cancel_token().child_token()))
        .await
        .context("running query")?;
    println!("{}", serde_json::to_string_pretty(&cursor)?);
    Ok(())
}
