use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::json;
use tracing::info;

use crate::auction::{BidOutcome, BidTracker};
use crate::recorder::{EventRecorder, HandlerOutcome};
use crate::types::{EventKind, LiveEvent, LogKind};

/// Running counters, read by the exit summary.
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub gifts: AtomicU64,
    pub chats: AtomicU64,
    pub members: AtomicU64,
    pub follows: AtomicU64,
    pub errors: AtomicU64,
    pub new_leaders: AtomicU64,
    pub retryable_failures: AtomicU64,
    pub fatal_failures: AtomicU64,
}

impl DispatchStats {
    fn count_event(&self, kind: EventKind) {
        let counter = match kind {
            EventKind::Gift => &self.gifts,
            EventKind::Chat => &self.chats,
            EventKind::Member => &self.members,
            EventKind::Follow => &self.follows,
            EventKind::Error => &self.errors,
            EventKind::Disconnected => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn count_outcome(&self, outcome: &HandlerOutcome) {
        match outcome {
            HandlerOutcome::Done => {}
            HandlerOutcome::Retryable(_) => {
                self.retryable_failures.fetch_add(1, Ordering::Relaxed);
            }
            HandlerOutcome::Fatal(_) => {
                self.fatal_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Routes live events to the recorder and, for gifts, the bid tracker.
#[derive(Clone)]
pub struct EventDispatcher {
    recorder: EventRecorder,
    tracker: Option<BidTracker>,
    stats: Arc<DispatchStats>,
}

impl EventDispatcher {
    pub fn new(recorder: EventRecorder, tracker: Option<BidTracker>) -> Self {
        Self {
            recorder,
            tracker,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    pub fn recorder(&self) -> &EventRecorder {
        &self.recorder
    }

    pub fn tracker(&self) -> Option<&BidTracker> {
        self.tracker.as_ref()
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Handle one event, returning the outcome of every write it attempted.
    ///
    /// Gifts are written in order: gift record, auction update, then the
    /// `GIFT_RECEIVED` log entry. `Disconnected` is a session concern and is
    /// not dispatched.
    pub async fn dispatch(&self, event: &LiveEvent) -> Vec<HandlerOutcome> {
        self.stats.count_event(event.kind());

        let outcomes = match event {
            LiveEvent::Gift(gift) => {
                info!(
                    "{} sent {} x{} ({} diamonds)",
                    gift.sender(),
                    gift.name(),
                    gift.count(),
                    gift.unit_value()
                );
                let mut outcomes = vec![self.recorder.record_gift(gift).await];
                if let Some(tracker) = &self.tracker {
                    let (outcome, result) = tracker.process(gift).await;
                    if matches!(result, Some(BidOutcome::NewLeader(_))) {
                        self.stats.new_leaders.fetch_add(1, Ordering::Relaxed);
                    }
                    outcomes.push(outcome);
                }
                outcomes.push(self.recorder.log(LogKind::GiftReceived, gift).await);
                outcomes
            }
            LiveEvent::Chat(chat) => {
                info!(
                    "{}: {}",
                    chat.unique_id.as_deref().unwrap_or("?"),
                    chat.comment.as_deref().unwrap_or_default()
                );
                vec![self.recorder.log(LogKind::Chat, chat).await]
            }
            LiveEvent::Member(member) => {
                info!("{} joined the room", member.viewer());
                vec![self.recorder.log(LogKind::MemberJoin, member).await]
            }
            LiveEvent::Follow(follow) => {
                info!("{} followed", follow.viewer());
                vec![self.recorder.log(LogKind::Follow, follow).await]
            }
            LiveEvent::Error { message } => {
                tracing::error!("Live source error: {message}");
                vec![self.recorder.log(LogKind::Error, json!({ "error": message })).await]
            }
            LiveEvent::Disconnected => Vec::new(),
        };

        for outcome in &outcomes {
            self.stats.count_outcome(outcome);
        }
        outcomes
    }
}
