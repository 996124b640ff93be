// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{
    env,
    future::Future,
    io::{self, Write},
    process,
    sync::Arc,
    time::Duration,
};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use logspout_kinesis::{
    adapter::KinesisAdapter,
    config::{AdapterConfig, RouteConfig},
    errors::{AdapterError, ConfigError, ReaderError},
    kinesis::{self, KinesisShardSource, KinesisSink},
    message::RawLogEvent,
    reader::{StartPosition, StreamTail},
};

const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// How long shutdown waits for blocking threads. A pending stdin read parks
/// one of them until the next line arrives.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error("failed to start the async runtime: {0}")]
    Runtime(io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Ship stdin events to the route's stream.
    Ship(RouteConfig),
    /// Print every record of a stream to stdout.
    Tail {
        stream_name: String,
        position: StartPosition,
    },
}

pub fn main() {
    let log_level = env::var("LK_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!(
        "h2=off,hyper=off,rustls=off,aws_smithy_runtime=off,aws_config=off,{}",
        log_level
    );

    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("could not parse log level {log_level:?}: {e}");
            process::exit(1);
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
        process::exit(1);
    }

    debug!("Logging subsystem enabled");

    let result = match Runtime::new() {
        Ok(runtime) => run_to_completion(runtime, run()),
        Err(e) => Err(AgentError::Runtime(e)),
    };
    if let Err(e) = result {
        error!("Shutting down: {}", e);
        process::exit(1);
    }
}

/// Blocks on `future`, then shuts the runtime down without waiting more than
/// [`SHUTDOWN_GRACE`] for blocking threads.
fn run_to_completion<F: Future>(runtime: Runtime, future: F) -> F::Output {
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    output
}

async fn run() -> Result<(), AgentError> {
    let args: Vec<String> = env::args().skip(1).collect();
    match parse_command(&args, |key| env::var(key).ok())? {
        Command::Ship(route) => ship(route).await,
        Command::Tail {
            stream_name,
            position,
        } => tail(stream_name, position).await,
    }
}

async fn ship(route: RouteConfig) -> Result<(), AgentError> {
    let config = AdapterConfig::from_route_env(&route)?;

    let endpoint = env::var("LK_KINESIS_ENDPOINT").ok();
    let sink = KinesisSink::connect(config.stream_name.clone(), endpoint.as_deref()).await?;

    let adapter = KinesisAdapter::new(config, Arc::new(sink))?;
    info!(
        "Shipping container logs from stdin to stream {}",
        adapter.config().stream_name
    );

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let reader = tokio::spawn(read_events(tx));

    adapter.stream(rx).await?;
    if let Err(e) = reader.await {
        warn!("stdin reader failed: {}", e);
    }

    let stats = adapter.stats();
    info!(
        "Stopped: {} records delivered, {} dropped",
        stats.delivered,
        stats.dropped.total()
    );
    Ok(())
}

/// Prints every record of `stream_name` to stdout, one per line, until
/// Ctrl-C or until every shard is closed.
async fn tail(stream_name: String, position: StartPosition) -> Result<(), AgentError> {
    let endpoint = env::var("LK_KINESIS_ENDPOINT").ok();
    let client = kinesis::load_client(endpoint.as_deref()).await?;
    let source = KinesisShardSource::new(client, stream_name.clone());
    let tail = StreamTail::new(source, stream_name.as_str(), position);
    info!("Reading stream {} ({:?})", stream_name, position);

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received interrupt, stopping");
            }
            cancel.cancel();
        })
    };

    let stdout = io::stdout();
    let received = tail
        .run(cancel, |record| {
            let mut out = stdout.lock();
            if let Err(e) = out.write_all(&record).and_then(|()| out.write_all(b"\n")) {
                warn!("Failed to write record to stdout: {}", e);
            }
        })
        .await;
    interrupt.abort();

    info!("Read {} records", received?);
    Ok(())
}

/// `tail <stream> [--from-start]` reads a stream back. Anything else ships
/// stdin to the route from the first argument or `LK_ROUTE`, otherwise to a
/// bare route on `LK_STREAM_NAME`.
fn parse_command<F>(args: &[String], lookup: F) -> Result<Command, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let stream_from_env = || {
        lookup("LK_STREAM_NAME").filter(|stream_name| !stream_name.trim().is_empty())
    };

    if args.first().map(String::as_str) == Some("tail") {
        let mut stream_name = None;
        let mut position = StartPosition::Latest;
        for arg in &args[1..] {
            match arg.as_str() {
                "--from-start" => position = StartPosition::TrimHorizon,
                flag if flag.starts_with("--") => {
                    return Err(ConfigError::Invalid(format!("unknown tail flag {flag}")))
                }
                name => stream_name = Some(name.to_string()),
            }
        }
        let stream_name = stream_name.or_else(stream_from_env).ok_or_else(|| {
            ConfigError::Invalid(
                "no stream given: pass tail <stream>, or set LK_STREAM_NAME".to_string(),
            )
        })?;
        return Ok(Command::Tail {
            stream_name,
            position,
        });
    }

    if let Some(uri) = args.first().cloned().or_else(|| lookup("LK_ROUTE")) {
        return RouteConfig::from_uri(&uri).map(Command::Ship);
    }
    match stream_from_env() {
        Some(stream_name) => Ok(Command::Ship(RouteConfig::new(stream_name))),
        None => Err(ConfigError::Invalid(
            "no route given: pass kinesis://<stream> as argument, or set LK_ROUTE or LK_STREAM_NAME"
                .to_string(),
        )),
    }
}

/// Forwards newline-delimited JSON events from stdin until EOF or Ctrl-C.
/// Dropping `tx` on return lets the adapter drain and stop.
async fn read_events(tx: mpsc::Sender<RawLogEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    loop {
        let line = tokio::select! {
            _ = &mut interrupt => {
                info!("Received interrupt, draining");
                return;
            }
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("stdin closed");
                return;
            }
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<RawLogEvent>(&line) {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!("Skipping malformed event: {}", e),
        }
    }
}
