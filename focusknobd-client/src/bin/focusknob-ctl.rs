//! FocusKnob control client
//!
//! One-shot requests against a running `focusknobd` (`status`, `reload`,
//! `restart`, `logs`) plus `watch`, which follows the daemon's pushes and
//! answers its prompts from the terminal.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use focusknob_common::protocol::DEFAULT_LOG_LINES;
use focusknob_common::{DaemonStatus, InputRequest, Message, RequestKind};
use focusknobd_client::{IpcClient, DEFAULT_SOCK, INITIAL_BACKOFF, MAX_BACKOFF};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "focusknob-ctl", version)]
#[command(about = "Talk to the FocusKnob daemon")]
struct Cli {
    /// Daemon socket path
    #[arg(long, env = "FOCUSKNOB_SOCKET", default_value = DEFAULT_SOCK)]
    socket: PathBuf,

    /// Seconds to wait for an answer
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show knob connection and enabled integrations
    Status,
    /// Re-read the settings file
    Reload,
    /// Ask the daemon to exit for its service manager to restart it
    Restart,
    /// Print the tail of the daemon log
    Logs {
        #[arg(long, short = 'n', default_value_t = DEFAULT_LOG_LINES)]
        lines: usize,
    },
    /// Follow status changes and answer prompts
    Watch,
}

type StdinLines = Lines<BufReader<Stdin>>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.timeout);

    let kind = match cli.command {
        Command::Status => RequestKind::Status,
        Command::Reload => RequestKind::ReloadConfig,
        Command::Restart => RequestKind::Restart,
        Command::Logs { lines } => RequestKind::Logs { lines },
        Command::Watch => return watch(cli.socket).await,
    };
    let reply = one_shot(&cli.socket, kind, timeout).await?;
    print_reply(reply)
}

async fn one_shot(socket: &Path, kind: RequestKind, timeout: Duration) -> Result<Message> {
    let client = Arc::new(IpcClient::new(socket));
    if !client.connect().await {
        bail!("daemon not running at {}", socket.display());
    }
    let listener = tokio::spawn({
        let client = client.clone();
        async move { client.listen().await }
    });
    let reply = client
        .request(kind, timeout)
        .await
        .context("request failed")?;
    client.close().await;
    listener.abort();
    reply.with_context(|| format!("no answer within {}s", timeout.as_secs()))
}

fn print_reply(reply: Message) -> Result<()> {
    match reply {
        Message::StatusResult { status, .. } => print_status(&status),
        Message::ReloadConfigResult {
            success, message, ..
        } => {
            println!("{message}");
            if !success {
                std::process::exit(1);
            }
        }
        Message::RestartResult { success, .. } => {
            println!("{}", if success { "Restarting" } else { "Restart refused" });
        }
        Message::LogsResult { content, .. } => print!("{content}"),
        Message::Error { message, .. } => bail!("daemon error: {message}"),
        other => bail!("unexpected reply: {}", other.kind()),
    }
    Ok(())
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

fn print_status(status: &DaemonStatus) {
    match (&status.port, status.connected) {
        (Some(port), true) => println!("Knob:     connected on {port}"),
        _ => println!("Knob:     disconnected"),
    }
    println!("Jira:     {}", on_off(status.jira_enabled));
    println!("Notion:   {}", on_off(status.notion_enabled));
    println!("Weather:  {}", on_off(status.weather_enabled));
    println!("Calendar: {}", on_off(status.calendar_enabled));
    println!("Uptime:   {}s", status.uptime_seconds);
}

/// Reconnect forever; every pushed event is printed, prompts are answered
/// from stdin.
async fn watch(socket: PathBuf) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let client = Arc::new(IpcClient::new(&socket));
        client
            .connect_with_backoff(INITIAL_BACKOFF, MAX_BACKOFF)
            .await;
        eprintln!("Watching {}", socket.display());
        let events = tx.clone();
        client.set_event_callback(move |message| {
            let _ = events.send(message);
        });
        let mut listener = tokio::spawn({
            let client = client.clone();
            async move { client.listen().await }
        });

        loop {
            tokio::select! {
                _ = &mut listener => break,
                _ = tokio::signal::ctrl_c() => {
                    client.close().await;
                    return Ok(());
                }
                Some(message) = rx.recv() => {
                    handle_event(&client, message, &mut stdin).await;
                }
            }
        }
        eprintln!("Daemon went away, reconnecting");
    }
}

async fn handle_event(client: &IpcClient, message: Message, stdin: &mut StdinLines) {
    match message {
        Message::StatusUpdate { connected, port } => match (connected, port) {
            (true, Some(port)) => println!("Knob connected on {port}"),
            (true, None) => println!("Knob connected"),
            (false, _) => println!("Knob disconnected"),
        },
        Message::InputRequest(request) => {
            let id = request.id.clone();
            let answer = prompt(request, stdin).await;
            let reply = match answer {
                Some(data) => Message::InputResponse {
                    id,
                    cancelled: false,
                    data,
                },
                None => Message::InputResponse {
                    id,
                    cancelled: true,
                    data: Map::new(),
                },
            };
            if let Err(e) = client.send(&reply).await {
                eprintln!("Could not answer prompt: {e}");
            }
        }
        Message::Error { message, .. } => eprintln!("Daemon error: {message}"),
        other => debug!("Ignoring {} message", other.kind()),
    }
}

/// Ask for every field. `None` means cancel: a lone `-` or end of input.
async fn prompt(request: InputRequest, stdin: &mut StdinLines) -> Option<Map<String, Value>> {
    println!();
    println!("Knob asks ({:?})", request.prompt);
    for (key, value) in &request.context {
        match value {
            Value::String(s) => println!("  {key}: {s}"),
            other => println!("  {key}: {other}"),
        }
    }

    let mut data = Map::new();
    for field in request.fields {
        if field.default.is_empty() {
            println!("{} (- to cancel):", field.label);
        } else {
            println!("{} [{}] (- to cancel):", field.label, field.default);
        }
        let line = stdin.next_line().await.ok().flatten()?;
        let line = line.trim();
        if line == "-" {
            return None;
        }
        let value = if line.is_empty() {
            field.default
        } else {
            line.to_string()
        };
        data.insert(field.name, Value::String(value));
    }
    Some(data)
}
