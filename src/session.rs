use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::dispatch::EventDispatcher;
use crate::retry::{RetryPolicy, Timer};
use crate::source::{LiveSession, LiveSource, SourceError};
use crate::types::{LiveEvent, LogKind};

/// Connection state, observable through [`SessionManager::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Connected { room_id: String },
    Disconnected,
    ConnectFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The connection attempt itself failed (offline stream, network, rejected).
    ConnectFailed,
    /// An established session dropped.
    Disconnected,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::ConnectFailed => write!(f, "connect failure"),
            RetryReason::Disconnected => write!(f, "disconnect"),
        }
    }
}

/// Result of one `start()` call.
pub enum StartOutcome {
    /// Another attempt was already in flight; nothing was done.
    AlreadyConnecting,
    Connected(LiveSession),
    Failed(SourceError),
}

/// What the supervisor should do after one connection cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Retry {
        reason: RetryReason,
        delay: Duration,
        attempt: u32,
    },
    GiveUp {
        reason: RetryReason,
        attempts: u32,
    },
    /// Another caller is driving the connection.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub channel: String,
    pub offline_retry: RetryPolicy,
    pub reconnect: RetryPolicy,
    /// Give up (instead of retrying) when the very first attempt fails.
    pub exit_on_initial_failure: bool,
    /// How long a finished session waits for its in-flight handlers before
    /// leaving them to complete in the background.
    pub handler_grace: Duration,
}

/// Clears the re-entry flag when the attempt finishes, including on
/// cancellation or panic.
struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the live subscription: connects, pumps events into the dispatcher
/// and schedules reconnects according to the retry policies.
pub struct SessionManager {
    settings: SessionSettings,
    source: Arc<dyn LiveSource>,
    dispatcher: EventDispatcher,
    timer: Arc<dyn Timer>,
    connecting: AtomicBool,
    ever_connected: AtomicBool,
    connect_failures: AtomicU32,
    disconnects: AtomicU32,
    status: watch::Sender<SessionStatus>,
}

impl SessionManager {
    pub fn new(
        settings: SessionSettings,
        source: Arc<dyn LiveSource>,
        dispatcher: EventDispatcher,
        timer: Arc<dyn Timer>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::Idle);
        Self {
            settings,
            source,
            dispatcher,
            timer,
            connecting: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
            connect_failures: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
            status,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    fn set_status(&self, status: SessionStatus) {
        self.status.send_replace(status);
    }

    /// Attempt one connection. Overlapping calls while an attempt is in
    /// flight return [`StartOutcome::AlreadyConnecting`] without connecting.
    pub async fn start(&self) -> StartOutcome {
        if self
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Connection attempt already in flight, skipping start");
            return StartOutcome::AlreadyConnecting;
        }
        let _guard = ConnectingGuard(&self.connecting);
        let channel = self.settings.channel.as_str();
        let recorder = self.dispatcher.recorder();

        self.set_status(SessionStatus::Connecting);
        info!("Bot starting for @{channel}...");
        recorder.log(LogKind::BotStarting, json!({ "user": channel })).await;

        match self.source.connect(channel).await {
            Ok(session) => {
                info!("Connected to @{channel}: roomId={}", session.info.room_id);
                recorder.log(LogKind::Connected, &session.info).await;
                self.set_status(SessionStatus::Connected {
                    room_id: session.info.room_id.clone(),
                });
                StartOutcome::Connected(session)
            }
            Err(e) => {
                error!("Could not connect to @{channel}: {e}");
                recorder
                    .log(LogKind::ConnectFailed, json!({ "error": e.to_string() }))
                    .await;
                self.set_status(SessionStatus::ConnectFailed);
                StartOutcome::Failed(e)
            }
        }
    }

    /// One connection cycle: start, pump events until the session ends,
    /// then decide the next retry.
    pub async fn run_once(&self) -> Step {
        match self.start().await {
            StartOutcome::AlreadyConnecting => Step::Skipped,
            StartOutcome::Failed(_) => {
                let attempt = self.connect_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if self.settings.exit_on_initial_failure
                    && !self.ever_connected.load(Ordering::Acquire)
                {
                    return Step::GiveUp {
                        reason: RetryReason::ConnectFailed,
                        attempts: attempt - 1,
                    };
                }
                schedule(RetryReason::ConnectFailed, &self.settings.offline_retry, attempt)
            }
            StartOutcome::Connected(session) => {
                self.connect_failures.store(0, Ordering::Release);
                self.ever_connected.store(true, Ordering::Release);

                let delivered = self.pump(session).await;
                if delivered > 0 {
                    self.disconnects.store(0, Ordering::Release);
                }

                warn!("Lost connection to @{}, reconnecting...", self.settings.channel);
                self.dispatcher
                    .recorder()
                    .log(LogKind::Disconnected, json!({}))
                    .await;
                self.set_status(SessionStatus::Disconnected);

                let attempt = self.disconnects.fetch_add(1, Ordering::AcqRel) + 1;
                schedule(RetryReason::Disconnected, &self.settings.reconnect, attempt)
            }
        }
    }

    /// Supervise the connection until a retry policy is exhausted.
    ///
    /// Never returns `Ok` while it owns the session; callers stop it by
    /// dropping the future (e.g. on ctrl-c).
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.run_once().await {
                Step::Retry {
                    reason,
                    delay,
                    attempt,
                } => {
                    info!(
                        "Retrying after {reason} in {}s (attempt {attempt})",
                        delay.as_secs_f64()
                    );
                    self.timer.sleep(delay).await;
                }
                Step::GiveUp { reason, attempts } => {
                    bail!("giving up after {reason} ({attempts} retries)");
                }
                Step::Skipped => {
                    debug!("Session already supervised elsewhere");
                    return Ok(());
                }
            }
        }
    }

    /// Dispatch every event of the session concurrently; returns the number of
    /// viewer events delivered.
    ///
    /// Handlers still running after the session ends get `handler_grace` to
    /// finish; stragglers are detached so a stalled write never holds up the
    /// reconnect.
    async fn pump(&self, mut session: LiveSession) -> u64 {
        let mut handlers = JoinSet::new();
        let mut delivered = 0;

        while let Some(event) = session.events.recv().await {
            if event == LiveEvent::Disconnected {
                break;
            }
            if !matches!(event, LiveEvent::Error { .. }) {
                delivered += 1;
            }
            let dispatcher = self.dispatcher.clone();
            handlers.spawn(async move {
                dispatcher.dispatch(&event).await;
            });
            while let Some(res) = handlers.try_join_next() {
                report_join(res);
            }
        }

        self.drain(handlers).await;
        delivered
    }

    async fn drain(&self, mut handlers: JoinSet<()>) {
        let grace = self.settings.handler_grace;
        let finished = tokio::time::timeout(grace, async {
            while let Some(res) = handlers.join_next().await {
                report_join(res);
            }
        })
        .await;
        if finished.is_ok() {
            return;
        }

        warn!(
            "{} event handlers still running after {}s, detaching them",
            handlers.len(),
            grace.as_secs_f64()
        );
        // Dropping a JoinSet aborts its tasks; move it into its own task instead.
        tokio::spawn(async move {
            while let Some(res) = handlers.join_next().await {
                report_join(res);
            }
        });
    }
}

fn schedule(reason: RetryReason, policy: &RetryPolicy, attempt: u32) -> Step {
    match policy.delay_for(attempt) {
        Some(delay) => Step::Retry {
            reason,
            delay,
            attempt,
        },
        None => Step::GiveUp {
            reason,
            attempts: attempt - 1,
        },
    }
}

/// A panicking handler must not take the session down.
fn report_join(res: Result<(), JoinError>) {
    if let Err(e) = res {
        error!("Event handler task failed: {e}");
    }
}
