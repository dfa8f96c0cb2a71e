//! Interactive client: stdin lines out, received messages to stdout.

use anyhow::{Result, bail};
use tether::{ChannelOptions, ClientChannel, TransportConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Arguments for the connect command.
#[derive(Debug, clap::Parser)]
pub(crate) struct ConnectArgs {
    /// Server address (ws://, wss://, http:// or https://)
    pub(crate) address: String,

    /// Start with HTTP long-polling instead of a WebSocket
    #[arg(
        long,
        env = "TETHER_USE_POLLING",
        action = clap::ArgAction::Set,
        value_parser = crate::parse_switch,
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true"
    )]
    pub(crate) force_fallback: bool,

    /// Extra request header as `name:value` (repeatable)
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    pub(crate) headers: Vec<(String, String)>,

    /// Largest accepted message, in bytes
    #[arg(long)]
    pub(crate) max_payload: Option<usize>,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected name:value, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("header name is empty".to_string());
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Run the client until stdin ends, the channel ends, or `token` is
/// cancelled.
pub(crate) async fn run(args: ConnectArgs, token: CancellationToken) -> Result<()> {
    let mut config = TransportConfig::default().with_force_fallback(args.force_fallback);
    if let Some(max_payload) = args.max_payload {
        config = config.with_max_payload(max_payload);
    }
    let options = ChannelOptions {
        headers: args.headers,
        config,
    };

    let channel = ClientChannel::new();
    let done = CancellationToken::new();
    let failed = CancellationToken::new();

    channel.on_open(|kind| eprintln!("connected over {kind}"));
    channel.on_message(|text| println!("{text}"));
    {
        let done = done.clone();
        let failed = failed.clone();
        channel.on_error(move |e| {
            eprintln!("error: {e}");
            failed.cancel();
            done.cancel();
        });
    }
    {
        let done = done.clone();
        channel.on_close(move |reason| {
            eprintln!("closed: {reason}");
            done.cancel();
        });
    }

    tracing::info!("Connecting to {}", args.address);
    channel.open(&args.address, options)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            () = done.cancelled() => break,
            () = token.cancelled() => {
                channel.close();
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) => {
                    if channel.send(line).is_err() {
                        break;
                    }
                }
                None => {
                    channel.close();
                    break;
                }
            },
        }
    }

    // A channel still negotiating closes silently, so only wait for an
    // open one to report.
    if channel.phase() == tether::ConnectionPhase::Established {
        tokio::select! {
            () = done.cancelled() => {}
            () = token.cancelled() => {}
        }
    }

    if failed.is_cancelled() {
        bail!("channel failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_split_on_the_first_colon() {
        assert_eq!(
            parse_header("cookie: a=1; b=2:3"),
            Ok(("cookie".to_string(), "a=1; b=2:3".to_string()))
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(":value").is_err());
    }
}
