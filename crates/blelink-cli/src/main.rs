//! Demo CLI driving the blelink transport: scan for Nordic UART Service
//! peripherals, connect to one, and exchange bytes over it.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use blelink_core::{Config, DiscoveryCallback, Transport};

#[derive(Parser)]
#[command(name = "blelink", about = "BLE central-role connection demo", version)]
struct Cli {
    /// Suppress all but warnings.
    #[arg(long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Enable debug-level logging.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan for nearby NUS peripherals and print discoveries as they arrive.
    Scan {
        /// How long to scan before stopping.
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Connect to a device, optionally send one payload, and print inbound
    /// notifications until interrupted or the timeout elapses.
    Connect {
        /// Platform peripheral identifier (CoreBluetooth UUID on macOS, MAC
        /// address on Linux/Windows).
        device: String,
        /// Payload to send once connected. Plain text unless prefixed with
        /// `0x`, in which case it is parsed as hex.
        #[arg(long)]
        send: Option<String>,
        /// How long to listen for notifications before disconnecting.
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    match cli.command {
        Command::Scan { seconds } => run_scan(seconds).await,
        Command::Connect { device, send, seconds } => run_connect(device, send, seconds).await,
    }
}

fn init_logging(cli: &Cli) {
    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_scan(seconds: u64) -> Result<()> {
    let transport = Transport::new(Config::default()).await.context("opening radio")?;
    let sm = transport.state_machine();

    let callback: DiscoveryCallback = Box::new(|id, rssi| {
        println!("{id}  rssi={rssi}");
    });
    sm.start_scanning(callback).await.context("starting scan")?;
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    sm.stop_scanning().await;
    Ok(())
}

async fn run_connect(device: String, send: Option<String>, seconds: u64) -> Result<()> {
    use futures::StreamExt;

    let transport = Transport::new(Config::default()).await.context("opening radio")?;
    transport.set_device_id(device.clone());

    let mut stream = transport.connect().await.context("connecting")?;
    tracing::info!(%device, "connected");

    if let Some(payload) = send {
        let bytes = parse_payload(&payload)?;
        transport.send(bytes).await.context("sending payload")?;
        tracing::info!("sent payload");
    }

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            chunk = stream.next() => {
                match chunk {
                    Some(bytes) => println!("{}", String::from_utf8_lossy(&bytes)),
                    None => break,
                }
            }
        }
    }

    transport.disconnect().await;
    Ok(())
}

/// Parse a CLI payload argument: `0x`-prefixed hex, or plain UTF-8 text
/// otherwise.
fn parse_payload(input: &str) -> Result<Vec<u8>> {
    match input.strip_prefix("0x") {
        Some(hex) => parse_hex(hex),
        None => Ok(input.as_bytes().to_vec()),
    }
}

fn parse_hex(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        bail!("hex payload must have an even number of digits");
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payload_plain_text() {
        assert_eq!(parse_payload("hello").unwrap(), b"hello".to_vec());
    }

    #[test]
    fn test_parse_payload_hex() {
        assert_eq!(parse_payload("0x68656c6c6f").unwrap(), b"hello".to_vec());
    }

    #[test]
    fn test_parse_payload_hex_odd_length_rejected() {
        assert!(parse_payload("0xabc").is_err());
    }

    #[test]
    fn test_parse_payload_hex_invalid_digit_rejected() {
        assert!(parse_payload("0xzz").is_err());
    }

    #[test]
    fn test_parse_payload_empty_hex() {
        assert_eq!(parse_payload("0x").unwrap(), Vec::<u8>::new());
    }
}
