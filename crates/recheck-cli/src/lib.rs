//! recheck command line.

pub mod cli;
pub mod logging;

use anyhow::{anyhow, bail, Context as _, Result};
use clap::Parser;
use recheck_agent::health_check;
use recheck_backend::{BackendError, Context, Dispatcher};
use recheck_config::Config;
use recheck_core::{CancellationToken, CheckOptions, Diagnostics, Parameters};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use cli::{CheckArgs, Cli, Commands, PingArgs};

/// How long to wait for outstanding work before disposing the backend.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    logging::init(cli.verbose, &config.logging.level);
    debug!(?config, "Loaded configuration");

    match cli.command {
        Commands::Check(args) => check(config, args).await,
        Commands::Ping(args) => ping(config, args).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn parse_params(raw: Option<&str>) -> Result<Parameters> {
    let Some(raw) = raw else {
        return Ok(Parameters::new());
    };
    let value: Value = serde_json::from_str(raw).context("--params is not valid JSON")?;
    Parameters::try_from(value).context("--params must be a JSON object")
}

async fn check(mut config: Config, args: CheckArgs) -> Result<()> {
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    let params = parse_params(args.params.as_deref())?;
    let context = Arc::new(Context::new(config));

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling outstanding checks");
                cancel.cancel();
            }
        })
    };

    let mut checks = JoinSet::new();
    for (index, source) in args.sources.iter().cloned().enumerate() {
        let context = context.clone();
        let flags = args.flags.clone();
        let mut options = CheckOptions::new()
            .with_params(params.clone())
            .with_cancel(cancel.clone());
        if args.log {
            let tag = source.clone();
            options = options.with_logger(move |line| eprintln!("[{}] {}", tag, line));
        }
        checks.spawn(async move {
            let result = context.check(&source, &flags, options).await;
            (index, result)
        });
    }

    let mut results: Vec<Option<Diagnostics>> = vec![None; args.sources.len()];
    let mut failures = 0;
    while let Some(joined) = checks.join_next().await {
        let (index, result) = joined.context("Check task panicked")?;
        match result {
            Ok(diagnostics) => results[index] = Some(diagnostics),
            Err(e) => {
                error!(source = %args.sources[index], error = %e, "Check failed");
                failures += 1;
            }
        }
    }
    interrupt.abort();

    for diagnostics in results.iter().flatten() {
        println!("{}", serde_json::to_string(diagnostics.as_value())?);
    }

    if tokio::time::timeout(DRAIN_TIMEOUT, context.keep_alive().wait_idle())
        .await
        .is_err()
    {
        warn!(
            outstanding = context.keep_alive().count(),
            "Backend still busy, disposing anyway"
        );
    }
    context.shutdown().await.context("Failed to shut down backend")?;

    if failures > 0 {
        bail!("{} of {} checks failed", failures, args.sources.len());
    }
    Ok(())
}

async fn ping(mut config: Config, args: PingArgs) -> Result<()> {
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    let backend = config.backend;
    let context = Context::new(config);

    let dispatcher = match context.dispatcher().await {
        Ok(dispatcher) => dispatcher,
        Err(BackendError::Agent(e)) if e.is_launch_failure() => {
            return Err(anyhow!(e).context(format!(
                "The {} agent could not be started (see agent.bin / RECHECK_BIN, agent.jar / RECHECK_JAR)",
                backend
            )));
        }
        Err(e) => return Err(e.into()),
    };

    let report = match dispatcher {
        Dispatcher::Agent(agent) => {
            let status = health_check(agent).await;
            if !status.is_healthy() {
                context.shutdown().await?;
                return Err(anyhow!("Agent is not healthy: {:?}", status));
            }
            json!({ "backend": backend, "status": "healthy", "pid": agent.pid() })
        }
        Dispatcher::Pool(pool) => {
            let stats = pool.stats().await?;
            json!({ "backend": backend, "status": "healthy", "stats": stats })
        }
    };
    println!("{}", report);

    context.shutdown().await?;
    Ok(())
}
