use std::sync::atomic::Ordering;

use serde::Serialize;

use crate::dispatch::DispatchStats;
use crate::types::AuctionState;

/// Counters and final state printed when the bot shuts down.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitSummary {
    pub channel: String,
    pub gifts: u64,
    pub chats: u64,
    pub members: u64,
    pub follows: u64,
    pub upstream_errors: u64,
    pub new_leaders: u64,
    pub retryable_failures: u64,
    pub fatal_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auction: Option<AuctionState>,
}

impl ExitSummary {
    pub fn new(channel: &str, stats: &DispatchStats, auction: Option<AuctionState>) -> Self {
        let load = |counter: &std::sync::atomic::AtomicU64| counter.load(Ordering::Relaxed);
        Self {
            channel: channel.to_string(),
            gifts: load(&stats.gifts),
            chats: load(&stats.chats),
            members: load(&stats.members),
            follows: load(&stats.follows),
            upstream_errors: load(&stats.errors),
            new_leaders: load(&stats.new_leaders),
            retryable_failures: load(&stats.retryable_failures),
            fatal_failures: load(&stats.fatal_failures),
            auction,
        }
    }
}

/// Emit the exit summary as pretty-printed JSON to stdout.
pub fn report_exit_summary(summary: &ExitSummary) {
    if let Ok(json) = serde_json::to_string_pretty(summary) {
        println!("{json}");
    }
}
