use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::recorder::{EventRecorder, HandlerOutcome, now_millis};
use crate::store::{Store, StoreError, WriteOutcome};
use crate::types::{AuctionState, GiftEvent, LogKind};

pub const AUCTION_PATH: &str = "auction/current";

/// How the tracker replaces the stored leader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Versioned read + conditional write; concurrent gifts re-evaluate on conflict.
    #[default]
    Conditional,
    /// Plain read-then-overwrite. Two near-simultaneous gifts can race and
    /// leave the smaller one recorded as leader.
    Overwrite,
}

/// What processing one gift did to the auction.
#[derive(Debug, Clone, PartialEq)]
pub enum BidOutcome {
    NewLeader(AuctionState),
    /// Candidate value did not beat the stored highest bid.
    NotHigher { candidate: u64, highest: u64 },
}

/// Compare a gift against the current state.
///
/// Returns the replacement state when the gift's total value is strictly
/// greater than the stored highest bid; ties and lower values return `None`.
pub fn evaluate(current: &AuctionState, gift: &GiftEvent, now: i64) -> Option<AuctionState> {
    let candidate = gift.total_value();
    if candidate <= current.highest_bid {
        return None;
    }
    Some(AuctionState {
        highest_bid: candidate,
        highest_bidder: Some(gift.sender().to_string()),
        last_gift: Some(gift.name().to_string()),
        updated_at: Some(now),
    })
}

fn decode_state(value: Option<Value>) -> Result<AuctionState, StoreError> {
    match value {
        None => Ok(AuctionState::default()),
        Some(v) => Ok(serde_json::from_value(v)?),
    }
}

/// Tracks the single "current leader" record.
#[derive(Clone)]
pub struct BidTracker {
    store: Arc<dyn Store>,
    recorder: EventRecorder,
    mode: WriteMode,
    max_conflicts: u32,
}

impl BidTracker {
    pub fn new(recorder: EventRecorder, mode: WriteMode, max_conflicts: u32) -> Self {
        Self {
            store: recorder.store().clone(),
            recorder,
            mode,
            max_conflicts,
        }
    }

    /// Read the current auction state (default when absent).
    pub async fn current(&self) -> Result<AuctionState, StoreError> {
        decode_state(self.store.get(AUCTION_PATH).await?)
    }

    /// Process one gift. On a new leader, writes the state and appends a
    /// `NEW_HIGHEST_BID` log entry.
    pub async fn process(&self, gift: &GiftEvent) -> (HandlerOutcome, Option<BidOutcome>) {
        let result = match self.mode {
            WriteMode::Conditional => self.process_conditional(gift).await,
            WriteMode::Overwrite => self.process_overwrite(gift).await,
        };

        match result {
            Ok(BidOutcome::NewLeader(state)) => {
                info!(
                    "New highest bid: {} by {} ({})",
                    state.highest_bid,
                    state.highest_bidder.as_deref().unwrap_or_default(),
                    state.last_gift.as_deref().unwrap_or_default(),
                );
                let outcome = self.recorder.log(LogKind::NewHighestBid, &state).await;
                (outcome, Some(BidOutcome::NewLeader(state)))
            }
            Ok(not_higher) => {
                debug!("Gift does not beat current leader: {not_higher:?}");
                (HandlerOutcome::Done, Some(not_higher))
            }
            Err(outcome) => (outcome.report("updating auction"), None),
        }
    }

    async fn process_overwrite(&self, gift: &GiftEvent) -> Result<BidOutcome, HandlerOutcome> {
        let current = decode_state(self.store.get(AUCTION_PATH).await?)?;
        let Some(next) = evaluate(&current, gift, now_millis()) else {
            return Ok(BidOutcome::NotHigher {
                candidate: gift.total_value(),
                highest: current.highest_bid,
            });
        };
        self.store
            .set(AUCTION_PATH, &serde_json::to_value(&next).map_err(StoreError::from)?)
            .await?;
        Ok(BidOutcome::NewLeader(next))
    }

    async fn process_conditional(&self, gift: &GiftEvent) -> Result<BidOutcome, HandlerOutcome> {
        let mut conflicts = 0;
        loop {
            let read = self.store.get_versioned(AUCTION_PATH).await?;
            let current = decode_state(read.value)?;
            let Some(next) = evaluate(&current, gift, now_millis()) else {
                return Ok(BidOutcome::NotHigher {
                    candidate: gift.total_value(),
                    highest: current.highest_bid,
                });
            };

            let value = serde_json::to_value(&next).map_err(StoreError::from)?;
            match self.store.set_if(AUCTION_PATH, &value, &read.version).await? {
                WriteOutcome::Written => return Ok(BidOutcome::NewLeader(next)),
                WriteOutcome::Conflict => {
                    conflicts += 1;
                    if conflicts > self.max_conflicts {
                        return Err(HandlerOutcome::Retryable(format!(
                            "auction record kept changing ({conflicts} conflicting writes)"
                        )));
                    }
                    warn!(
                        "Auction record changed concurrently, re-evaluating (conflict {conflicts})"
                    );
                }
            }
        }
    }
}
