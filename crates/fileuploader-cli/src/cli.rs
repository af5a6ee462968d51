//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use fileuploader_tokens::config::Config;
use fileuploader_tokens::protocol::EXTJWT;
use fileuploader_tokens::{Peer, TokenManager, metrics};

use crate::irc::IrcPeer;
use crate::logging;

/// How long to wait for the server to accept the connection.
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Commands of the token client.
#[derive(Debug, Subcommand)]
enum Command {
    /// Connect to a server and request tokens.
    Fetch(FetchArgs),
}

#[derive(Debug, Args)]
struct FetchArgs {
    /// The server to connect to, as `host:port`.
    addr: String,

    /// The nick to register with.
    #[arg(long, default_value = "fileuploader")]
    nick: String,

    /// How often to ask for a token.
    ///
    /// Repeated requests within the token lifetime are answered from the cache.
    #[arg(long, default_value_t = 1)]
    repeat: usize,

    /// Pause between repeated requests, like `5s`.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    interval: Duration,

    /// Request a token for this service instead of the server's own.
    #[arg(long)]
    service: Option<String>,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Overrides the log level of the configuration file.
    ///
    /// Possible values: off, error, warn, info, debug, trace
    #[arg(long, global = true)]
    log_level: Option<LevelFilter>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config()).context("failed loading config")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: This is safe because we are calling it at the beginning of the program, before
    // starting the runtime.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to set up metrics")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("fileuploader")
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    match cli.command {
        Command::Fetch(args) => runtime.block_on(fetch(config, args)),
    }
}

async fn fetch(mut config: Config, args: FetchArgs) -> Result<()> {
    if args.service.is_some() {
        config.tokens.service = args.service;
    }

    let peer = IrcPeer::connect(&args.addr, &args.nick, REGISTRATION_TIMEOUT).await?;
    if peer.isupport(EXTJWT).is_none() {
        tracing::warn!(addr = %args.addr, "Server does not advertise EXTJWT, asking anyway");
    }

    let manager = TokenManager::new(config.tokens);
    let result = fetch_tokens(&manager, &peer, args.repeat, args.interval).await;
    peer.quit("done");
    manager.forget(&peer);
    result
}

async fn fetch_tokens(
    manager: &TokenManager<IrcPeer>,
    peer: &IrcPeer,
    repeat: usize,
    interval: Duration,
) -> Result<()> {
    for attempt in 1..=repeat {
        if attempt > 1 {
            tokio::time::sleep(interval).await;
        }

        let lookup = manager.lookup(peer);
        let cached = !lookup.is_pending();
        let Some(token) = lookup.resolve().await.context("failed to get a token")? else {
            println!("{} does not support {EXTJWT}", peer.addr());
            return Ok(());
        };

        tracing::info!(attempt, cached, age = ?token.age(), "Got token");
        println!("{}", token.value);
    }

    Ok(())
}
