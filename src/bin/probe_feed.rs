//! Probe: live event feed
//!
//! Connects to the live-event relay for a channel and:
//! - Prints the handshake (room id and extra session fields)
//! - Prints the first events verbatim, then a running tally
//! - Summarizes event counts and total gift value at the end
//!
//! Nothing is written to the database.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use url::Url;

use gift_auction_bot::DEFAULT_LIVE_SOURCE_URL;
use gift_auction_bot::config::ENV_LIVE_SOURCE_URL;
use gift_auction_bot::source::{LiveSource, WsLiveSource};
use gift_auction_bot::types::{EventKind, LiveEvent};

#[derive(Parser)]
#[command(name = "probe-feed", about = "Print live events for a channel without recording them")]
struct Args {
    /// Channel to subscribe to
    channel: String,

    /// Relay URL (defaults to LIVE_SOURCE_URL or the local bridge)
    #[arg(long)]
    url: Option<String>,

    /// How long to listen, in seconds
    #[arg(long, default_value_t = 30)]
    seconds: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let url = args
        .url
        .or_else(|| std::env::var(ENV_LIVE_SOURCE_URL).ok())
        .unwrap_or_else(|| DEFAULT_LIVE_SOURCE_URL.to_string());
    let url = Url::parse(&url).with_context(|| format!("invalid relay URL {url}"))?;

    println!("=== Probe: live feed ===");
    println!("Relay:   {url}");
    println!("Channel: @{}", args.channel);
    println!();

    println!("--- Connecting ---");
    let source = WsLiveSource::new(url, Duration::from_secs(20));
    let mut session = source.connect(&args.channel).await?;
    println!("Connected! roomId={}", session.info.room_id);
    if !session.info.extra.is_empty() {
        println!(
            "Handshake fields: {:?}",
            session.info.extra.keys().collect::<Vec<_>>()
        );
    }
    println!();

    println!("--- Listening for {} seconds ---", args.seconds);
    let start = Instant::now();
    let timeout = Duration::from_secs(args.seconds);
    let mut counts: HashMap<EventKind, u64> = HashMap::new();
    let mut msg_count = 0u64;
    let mut gift_value = 0u64;

    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            break;
        }

        let event = match tokio::time::timeout(remaining, session.events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                println!("Event stream ended");
                break;
            }
            Err(_) => break,
        };
        msg_count += 1;
        *counts.entry(event.kind()).or_default() += 1;
        let elapsed = start.elapsed().as_secs_f64();

        if let LiveEvent::Gift(gift) = &event {
            gift_value += gift.total_value();
        }
        if msg_count <= 10 {
            println!("[{elapsed:.1}s] #{msg_count} {event:?}");
        } else if msg_count % 10 == 0 {
            println!("[{elapsed:.1}s] #{msg_count} ({counts:?})");
        }
        if event == LiveEvent::Disconnected {
            println!("[{elapsed:.1}s] Disconnected");
            break;
        }
    }

    println!();
    println!("--- Summary ---");
    println!("Total events: {msg_count}");
    println!("Duration: {:.1}s", start.elapsed().as_secs_f64());
    println!("Event types seen: {counts:?}");
    println!("Total gift value: {gift_value} diamonds");
    println!();
    println!("=== Probe Complete ===");
    Ok(())
}
