//! `tether`: run an echo server or talk to one from the terminal.

mod client;
mod server;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let token = CancellationToken::new();
    let hits = Arc::new(AtomicUsize::new(0));
    {
        let token = token.clone();
        let hits = hits.clone();
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_ok() {
                    match hits.fetch_add(1, Ordering::Relaxed) {
                        0 => {
                            eprintln!("Ctrl+C, shutting down gracefully (press again to force)");
                            token.cancel();
                        }
                        _ => {
                            eprintln!("Force exiting.");
                            std::process::exit(130);
                        }
                    }
                }
            }
        });
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let token = token.clone();
        tokio::spawn(async move {
            if let Ok(mut term) = signal(SignalKind::terminate()) {
                term.recv().await;
                eprintln!("SIGTERM, shutting down gracefully");
                token.cancel();
            }
        });
    }

    let args = Arguments::parse();
    match args.command {
        Command::Server(args) => server::run(args, token).await,
        Command::Connect(args) => client::run(args, token).await,
    }
}

#[derive(Debug, Parser)]
#[command(author = "Ink & Switch", version, about = "Text channels over WebSocket with HTTP long-poll fallback")]
struct Arguments {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept connections and echo every message back
    Server(server::ServerArgs),

    /// Connect to a server, send stdin lines and print what comes back
    Connect(client::ConnectArgs),
}

/// `clap` value parser for boolean environment switches such as
/// `TETHER_USE_POLLING=yes`.
fn parse_switch(value: &str) -> Result<bool, std::convert::Infallible> {
    Ok(tether_core::config::is_affirmative(value))
}
