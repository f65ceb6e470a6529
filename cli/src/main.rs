//! chainstream CLI — watch a node's event stream from the terminal.
//!
//! Usage:
//! ```bash
//! # Print every committed transaction as a JSON line
//! chainstream watch --url https://rpc.akashnet.net --query "tm.event='Tx'"
//!
//! # Send a JSON-RPC call over the stream connection
//! chainstream call --url ws://localhost:26657 --method status
//!
//! # Block until a transaction is committed
//! chainstream wait-tx --url ws://localhost:26657 --hash 0A1B2C... --timeout 60
//! ```

mod logging;

use std::env;
use std::process;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;

use chainstream_ws::{Notification, StreamClient, StreamClientConfig};

use crate::logging::{init_tracing, LogConfig};

#[tokio::main]
async fn main() {
    let (log, args) = split_global_flags(env::args().skip(1).collect());
    if args.is_empty() {
        print_usage();
        process::exit(1);
    }
    init_tracing(&log);

    let result = match args[0].as_str() {
        "watch" => cmd_watch(&args[1..]).await,
        "call" => cmd_call(&args[1..]).await,
        "wait-tx" => cmd_wait_tx(&args[1..]).await,
        "version" | "--version" | "-V" => {
            println!("chainstream {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainstream {}", env!("CARGO_PKG_VERSION"));
    println!("Watch CometBFT / Tendermint event streams\n");
    println!("USAGE:");
    println!("    chainstream [--log-level <LEVEL>] [--log-json] <COMMAND>\n");
    println!("COMMANDS:");
    println!("    watch      Print events matching a query as JSON lines");
    println!("    call       Send a JSON-RPC call over the stream connection");
    println!("    wait-tx    Wait for a transaction to be committed");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("WATCH FLAGS:");
    println!("    --url <URL>        Node endpoint (http, https, ws, wss)  [required]");
    println!("    --query <QUERY>    Event query, e.g. \"tm.event='Tx'\"    [required]");
    println!("    --config <FILE>    Client config as JSON\n");
    println!("CALL FLAGS:");
    println!("    --url <URL>        Node endpoint  [required]");
    println!("    --method <METHOD>  JSON-RPC method  [required]");
    println!("    --params <JSON>    Params object (default {{}})\n");
    println!("WAIT-TX FLAGS:");
    println!("    --url <URL>        Node endpoint  [required]");
    println!("    --hash <HASH>      Transaction hash  [required]");
    println!("    --timeout <SECS>   Give up after this long (default 60)");
}

async fn cmd_watch(args: &[String]) -> Result<()> {
    let url = parse_flag(args, "--url").context("--url is required")?;
    let query = parse_flag(args, "--query").context("--query is required")?;
    let config = match parse_flag(args, "--config") {
        Some(path) => load_config(&path)?,
        None => StreamClientConfig::default(),
    };

    let client = StreamClient::connect(&url, config)
        .await
        .with_context(|| format!("connecting to {url}"))?;
    let (_handle, mut notifications) = client.subscribe_channel(query.as_str())?;
    tracing::info!(endpoint = %client.endpoint(), query = %query, "watching");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                client.close();
                return Ok(());
            }
            notification = notifications.recv() => match notification {
                Some(Notification::Event(event)) => {
                    println!("{}", serde_json::to_string(&event)?);
                }
                Some(Notification::Error(e)) => {
                    return Err(anyhow!(e)).with_context(|| format!("subscription {query:?} ended"));
                }
                None => return Ok(()),
            },
        }
    }
}

async fn cmd_call(args: &[String]) -> Result<()> {
    let url = parse_flag(args, "--url").context("--url is required")?;
    let method = parse_flag(args, "--method").context("--method is required")?;
    let params: Value = match parse_flag(args, "--params") {
        Some(raw) => serde_json::from_str(&raw).context("--params is not valid JSON")?,
        None => Value::Object(Default::default()),
    };

    let client = connected_client(&url).await?;
    let result: Value = client
        .call(&method, params)
        .await
        .with_context(|| format!("{method} failed"))?;
    client.close();

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn cmd_wait_tx(args: &[String]) -> Result<()> {
    let url = parse_flag(args, "--url").context("--url is required")?;
    let hash = parse_flag(args, "--hash").context("--hash is required")?;
    let timeout = match parse_flag(args, "--timeout") {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("--timeout must be a number of seconds, got {raw:?}"))?,
        None => 60,
    };

    let client = connected_client(&url).await?;
    let event = client
        .wait_for_tx(&hash, Duration::from_secs(timeout))
        .await
        .with_context(|| format!("waiting for transaction {hash}"))?;
    client.close();

    println!("{}", serde_json::to_string_pretty(&event)?);
    Ok(())
}

async fn connected_client(url: &str) -> Result<StreamClient> {
    let config = StreamClientConfig::default();
    let timeout = config.request_timeout();
    let client = StreamClient::connect(url, config)
        .await
        .with_context(|| format!("connecting to {url}"))?;
    match tokio::time::timeout(timeout, client.wait_connected()).await {
        Ok(Ok(())) => Ok(client),
        Ok(Err(e)) => Err(e).with_context(|| format!("connecting to {url}")),
        Err(_) => bail!("timed out connecting to {url}"),
    }
}

fn load_config(path: &str) -> Result<StreamClientConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    StreamClientConfig::from_json(&raw).with_context(|| format!("parsing {path}"))
}

/// Pull `--log-level <LEVEL>` and `--log-json` out of `args`, wherever they
/// appear.
fn split_global_flags(args: Vec<String>) -> (LogConfig, Vec<String>) {
    let mut log = LogConfig::default();
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--log-json" => log.json = true,
            "--log-level" => {
                if let Some(level) = iter.next() {
                    log.level = level;
                }
            }
            _ => rest.push(arg),
        }
    }
    (log, rest)
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}
