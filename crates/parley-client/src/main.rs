//! Parley CLI
//!
//! Line-oriented chat client. Plain lines go to the current recipient;
//! `/to`, `/register`, `/login` and `/quit` are commands.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

use parley_client::input::{self, Command};
use parley_client::{Client, Inbound};
use parley_core::config::load_config;
use parley_core::tracing_init::init_tracing;
use parley_crypto::ModulusGroup;

#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(version, about = "Parley chat client", long_about = None)]
struct Cli {
    /// Server address.
    #[arg(long)]
    server: Option<SocketAddr>,

    /// Local bind address (port 0 for ephemeral).
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Path to the modulus group file.
    #[arg(long)]
    group: Option<PathBuf>,

    /// Path to a settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output logs as JSON.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?.client;
    if let Some(server) = cli.server {
        config.server_addr = server;
    }
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(group) = cli.group {
        config.group_path = group;
    }

    // Logs go to stderr so they don't interleave with chat output.
    init_tracing("parley_client=warn", cli.log_json);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting parley");

    let group = Arc::new(ModulusGroup::load(&config.group_path)?);
    let (mut client, events) = Client::connect(&config, group).await?;
    let printer = tokio::spawn(print_events(events));

    print_line(&format!(
        "connected as {} to {}; talking to {}",
        client.local_addr()?,
        config.server_addr,
        client.recipient()
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        let command = match input::parse(&line) {
            Ok(command) => command,
            Err(usage) => {
                print_line(usage);
                continue;
            }
        };

        let result = match command {
            Command::Empty => Ok(()),
            Command::Quit => break,
            Command::To(who) => {
                client.set_recipient(who);
                print_line(&format!("talking to {}", client.recipient()));
                Ok(())
            }
            Command::Register { username, password } => client.register(&username, &password).await,
            Command::Login { username, password } => client.login(&username, &password).await,
            Command::Text(text) => client.send_text(&text).await,
        };
        if let Err(e) = result {
            print_line(&format!("error: {e}"));
        }
    }

    printer.abort();
    info!("Client stopped");
    Ok(())
}

async fn print_events(mut events: mpsc::Receiver<Inbound>) {
    while let Some(event) = events.recv().await {
        match event {
            Inbound::Text { from, text } => print_line(&format!("[{from}] {text}")),
            Inbound::Notice { from, text } => print_line(&format!("[{from}] * {text}")),
            Inbound::Corrupted { from } => {
                print_line(&format!("[{from}] ! message corrupted, dropped"));
            }
        }
    }
}

#[allow(clippy::print_stdout)]
fn print_line(line: &str) {
    println!("{line}");
}
