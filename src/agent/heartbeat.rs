//! The heartbeat scheduler.
//!
//! One task owns the schedule state and drives everything that can change
//! it: start/stop commands, interval changes, the tick timer, and the
//! in-flight request. Callers talk to it through a cloneable
//! [`HeartbeatScheduler`] handle and read state from a watch channel, so
//! they always see a whole snapshot.
//!
//! ```text
//!            start()                 reply
//!   Stopped ────────► Idle ──tick──► Waiting ──────► Idle
//!      ▲               ▲  ▲             │
//!      │ stop()        │  └─ retry ─────┤ failure (attempt < max)
//!      │               │                │
//!      └── any state   └─ start() ── Degraded ◄── failure (attempt == max)
//! ```
//!
//! `stop()` and `start()` bump the generation. Every request is tagged with
//! the generation it was sent under and outcomes from an older generation
//! are discarded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize, Serializer};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::agent::correlator::ResponseCorrelator;
use crate::agent::interval::IntervalController;
use crate::agent::payload::{PayloadSource, TickContext};
use crate::agent::router::ActionRouter;
use crate::error::{CorrelationError, Error, HeartbeatError, TransportError, ValidationError};
use crate::hooks::{HookEvent, HookRegistry};
use crate::transport::{OutboundRequest, Reply, Transport};

/// Consecutive failures tolerated before the loop degrades.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Pause between a failed attempt and its retry.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// How long a tick waits for its reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// Tick outcomes kept in the event history.
pub const DEFAULT_EVENT_HISTORY: usize = 100;

const REPLY_CHANNEL_CAPACITY: usize = 64;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub reply_timeout: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Oldest events are dropped past this many.
    pub event_history: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            event_history: DEFAULT_EVENT_HISTORY,
        }
    }
}

/// Where the scheduler is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Stopped,
    Idle,
    Waiting,
    Degraded,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Degraded => "degraded",
        }
    }
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The request a tick is waiting on.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub id: u64,
    pub sent_at_generation: u64,
    pub timeout_at: DateTime<Utc>,
}

/// How a tick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    Replied,
    Failed,
}

/// One entry of the event history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatEvent {
    pub tick: u64,
    pub request_id: u64,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: Option<u64>,
    pub outcome: TickOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot of the scheduler.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleState {
    #[serde(rename = "intervalSecs", serialize_with = "as_secs")]
    pub interval: Duration,
    pub running: bool,
    pub attempt_count: u32,
    pub next_run_at: Option<DateTime<Utc>>,
    /// Monotonic deadline of the armed timer.
    #[serde(skip)]
    pub next_deadline: Option<Instant>,
    pub status: ScheduleStatus,
    pub generation: u64,
    pub pending_request: Option<PendingRequest>,
    pub tick_count: u64,
    pub response_count: u64,
    pub error_count: u64,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Entries currently held in the event history.
    pub recent_events: usize,
}

impl ScheduleState {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            running: false,
            attempt_count: 0,
            next_run_at: None,
            next_deadline: None,
            status: ScheduleStatus::Stopped,
            generation: 0,
            pending_request: None,
            tick_count: 0,
            response_count: 0,
            error_count: 0,
            last_heartbeat_at: None,
            started_at: None,
            last_error: None,
            recent_events: 0,
        }
    }

    /// Uptime since the last `start()`, while running.
    pub fn uptime(&self) -> Option<Duration> {
        if !self.running {
            return None;
        }
        self.started_at
            .and_then(|at| (Utc::now() - at).to_std().ok())
    }

    /// Fails when the automatic loop has given up.
    pub fn ensure_not_degraded(&self) -> Result<(), HeartbeatError> {
        if self.status == ScheduleStatus::Degraded {
            return Err(HeartbeatError::Degraded {
                attempts: self.attempt_count,
            });
        }
        Ok(())
    }
}

fn as_secs<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_secs())
}

/// Everything the scheduler composes.
pub struct HeartbeatParts {
    pub interval: Arc<IntervalController>,
    pub router: Arc<ActionRouter>,
    pub correlator: ResponseCorrelator,
    pub transport: Arc<dyn Transport>,
    pub payloads: Arc<dyn PayloadSource>,
    pub hooks: Arc<HookRegistry>,
    pub config: HeartbeatConfig,
}

enum Command {
    Start(oneshot::Sender<ScheduleState>),
    Stop(oneshot::Sender<ScheduleState>),
    SetInterval(Duration, oneshot::Sender<Result<ScheduleState, ValidationError>>),
    RecentEvents(usize, oneshot::Sender<Vec<HeartbeatEvent>>),
    Shutdown,
}

/// Handle to a running scheduler task.
#[derive(Clone)]
pub struct HeartbeatScheduler {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ScheduleState>,
    replies: broadcast::Sender<Reply>,
    interval: Arc<IntervalController>,
}

impl HeartbeatScheduler {
    /// Spawn the scheduler task. It starts in `Stopped`.
    pub fn spawn(parts: HeartbeatParts) -> (Self, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ScheduleState::new(parts.interval.get()));
        let (reply_tx, _) = broadcast::channel(REPLY_CHANNEL_CAPACITY);

        let handle = Self {
            commands: command_tx,
            state: state_rx,
            replies: reply_tx.clone(),
            interval: Arc::clone(&parts.interval),
        };

        let task = SchedulerTask::new(parts, command_rx, state_tx, reply_tx);
        let join = tokio::spawn(task.run());

        (handle, join)
    }

    /// Start the loop and fire a tick right away. No-op while already
    /// running; resets the attempt counter when leaving `Degraded`.
    pub async fn start(&self) -> Result<ScheduleState, HeartbeatError> {
        self.request(Command::Start).await
    }

    /// Stop the loop from any state. The in-flight request, if any, is
    /// abandoned and its reply ignored.
    pub async fn stop(&self) -> Result<ScheduleState, HeartbeatError> {
        self.request(Command::Stop).await
    }

    /// End the scheduler task.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Latest state snapshot.
    pub fn status(&self) -> ScheduleState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state change.
    pub fn watch_status(&self) -> watch::Receiver<ScheduleState> {
        self.state.clone()
    }

    /// Replies received by successful ticks.
    pub fn subscribe_replies(&self) -> broadcast::Receiver<Reply> {
        self.replies.subscribe()
    }

    pub fn interval(&self) -> &Arc<IntervalController> {
        &self.interval
    }

    /// Change the tick interval in seconds.
    ///
    /// Resolves once the scheduler has applied the change, so the returned
    /// state and [`HeartbeatScheduler::status`] already carry the new
    /// interval and, when idle, the rescheduled next tick.
    pub async fn set_interval(&self, secs: u64) -> Result<ScheduleState, Error> {
        let interval = Duration::from_secs(secs);
        let state = self
            .request(|ack| Command::SetInterval(interval, ack))
            .await??;
        Ok(state)
    }

    /// The last `count` tick outcomes, oldest first.
    pub async fn recent_events(&self, count: usize) -> Result<Vec<HeartbeatEvent>, HeartbeatError> {
        self.request(|ack| Command::RecentEvents(count, ack)).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, HeartbeatError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(make(ack_tx))
            .map_err(|_| HeartbeatError::Shutdown)?;
        ack_rx.await.map_err(|_| HeartbeatError::Shutdown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Tick,
    Retry,
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    deadline: Instant,
    kind: TimerKind,
}

#[derive(Debug)]
enum AttemptError {
    Transport(TransportError),
    Correlation(CorrelationError),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{}", e),
            Self::Correlation(e) => write!(f, "{}", e),
        }
    }
}

type AttemptOutcome = Result<Reply, AttemptError>;

struct InFlight {
    request: PendingRequest,
    future: BoxFuture<'static, AttemptOutcome>,
}

struct SchedulerTask {
    interval: Arc<IntervalController>,
    router: Arc<ActionRouter>,
    correlator: ResponseCorrelator,
    transport: Arc<dyn Transport>,
    payloads: Arc<dyn PayloadSource>,
    hooks: Arc<HookRegistry>,
    config: HeartbeatConfig,

    commands: mpsc::UnboundedReceiver<Command>,
    interval_rx: watch::Receiver<Duration>,
    state_tx: watch::Sender<ScheduleState>,
    reply_tx: broadcast::Sender<Reply>,

    state: ScheduleState,
    next_request_id: u64,
    timer: Option<Timer>,
    inflight: Option<InFlight>,
    events: VecDeque<HeartbeatEvent>,
}

impl SchedulerTask {
    fn new(
        parts: HeartbeatParts,
        commands: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<ScheduleState>,
        reply_tx: broadcast::Sender<Reply>,
    ) -> Self {
        let interval_rx = parts.interval.subscribe();
        let state = ScheduleState::new(parts.interval.get());
        Self {
            interval: parts.interval,
            router: parts.router,
            correlator: parts.correlator,
            transport: parts.transport,
            payloads: parts.payloads,
            hooks: parts.hooks,
            config: parts.config,
            commands,
            interval_rx,
            state_tx,
            reply_tx,
            state,
            next_request_id: 1,
            timer: None,
            inflight: None,
            events: VecDeque::new(),
        }
    }

    async fn run(mut self) {
        tracing::debug!(transport = self.transport.name(), "Heartbeat scheduler task started");

        loop {
            let deadline = self.timer.map(|t| t.deadline);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Start(ack)) => {
                        self.start();
                        let _ = ack.send(self.state.clone());
                    }
                    Some(Command::Stop(ack)) => {
                        self.stop();
                        let _ = ack.send(self.state.clone());
                    }
                    Some(Command::SetInterval(interval, ack)) => {
                        let _ = ack.send(self.set_interval(interval));
                    }
                    Some(Command::RecentEvents(count, ack)) => {
                        let _ = ack.send(self.recent_events(count));
                    }
                    Some(Command::Shutdown) | None => {
                        self.stop();
                        break;
                    }
                },
                Ok(()) = self.interval_rx.changed() => self.on_interval_changed(),
                () = sleep_until(deadline), if deadline.is_some() => {
                    self.timer = None;
                    self.tick();
                }
                outcome = poll_inflight(&mut self.inflight), if self.inflight.is_some() => {
                    self.on_outcome(outcome);
                }
            }
        }

        self.correlator.cancel_all();
        tracing::debug!("Heartbeat scheduler task exited");
    }

    fn start(&mut self) {
        match self.state.status {
            ScheduleStatus::Idle | ScheduleStatus::Waiting => {
                tracing::debug!(status = %self.state.status, "Heartbeat already running");
                return;
            }
            ScheduleStatus::Stopped | ScheduleStatus::Degraded => {}
        }

        self.state.generation += 1;
        self.state.attempt_count = 0;
        self.state.status = ScheduleStatus::Idle;
        self.state.running = true;
        self.state.started_at = Some(Utc::now());
        self.state.last_error = None;

        tracing::info!(
            generation = self.state.generation,
            interval_secs = self.interval.get().as_secs(),
            "Heartbeat started"
        );
        self.hooks.dispatch(&HookEvent::Started {
            generation: self.state.generation,
        });

        self.tick();
    }

    fn stop(&mut self) {
        self.state.generation += 1;
        self.clear_timer();

        if let Some(inflight) = self.inflight.take() {
            tracing::debug!(
                request_id = inflight.request.id,
                sent_at_generation = inflight.request.sent_at_generation,
                "Abandoning in-flight heartbeat request"
            );
        }

        let was = self.state.status;
        self.state.status = ScheduleStatus::Stopped;
        self.state.running = false;
        self.state.pending_request = None;

        if was != ScheduleStatus::Stopped {
            tracing::info!(generation = self.state.generation, from = %was, "Heartbeat stopped");
        }
        self.hooks.dispatch(&HookEvent::Stopped {
            generation: self.state.generation,
        });
        self.publish();
    }

    fn tick(&mut self) {
        if self.state.status != ScheduleStatus::Idle || self.inflight.is_some() {
            tracing::debug!(status = %self.state.status, "Skipping tick; not idle");
            return;
        }

        let id = self.next_request_id;
        self.next_request_id += 1;
        let generation = self.state.generation;
        self.state.tick_count += 1;

        let ctx = TickContext {
            request_id: id,
            generation,
            tick: self.state.tick_count,
            attempt: self.state.attempt_count,
            interval: self.interval.get(),
        };
        let payload = self.payloads.build(&ctx);
        let endpoint = self.router.resolve(&payload);

        let pending = match self.correlator.register(id) {
            Ok(pending) => pending,
            Err(err) => {
                self.on_failure(id, AttemptError::Correlation(err));
                return;
            }
        };

        let timeout = self.config.reply_timeout;
        let deadline = Instant::now() + timeout;
        let transport = Arc::clone(&self.transport);
        let request = OutboundRequest {
            id,
            generation,
            endpoint: endpoint.clone(),
            payload,
        };

        // The reply timeout bounds the whole attempt, send included.
        let future = async move {
            let timed_out = CorrelationError::Timeout { id, after: timeout };

            tokio::time::timeout_at(deadline, transport.send(&request))
                .await
                .map_err(|_| AttemptError::Correlation(timed_out.clone()))?
                .map_err(AttemptError::Transport)?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            pending.wait(remaining).await.map_err(|err| match err {
                CorrelationError::Timeout { .. } => AttemptError::Correlation(timed_out),
                other => AttemptError::Correlation(other),
            })
        }
        .boxed();

        let request = PendingRequest {
            id,
            sent_at_generation: generation,
            timeout_at: wall_clock_after(timeout),
        };
        self.inflight = Some(InFlight {
            request: request.clone(),
            future,
        });

        self.clear_timer();
        self.state.status = ScheduleStatus::Waiting;
        self.state.pending_request = Some(request);

        tracing::info!(
            request_id = id,
            generation,
            tick = self.state.tick_count,
            endpoint = %endpoint,
            "Heartbeat tick sent"
        );
        self.hooks.dispatch(&HookEvent::TickSent {
            request_id: id,
            generation,
            endpoint,
        });
        self.publish();
    }

    fn on_outcome(&mut self, outcome: AttemptOutcome) {
        let Some(inflight) = self.inflight.take() else {
            return;
        };
        let request = inflight.request;

        if request.sent_at_generation != self.state.generation {
            tracing::debug!(
                request_id = request.id,
                sent_at_generation = request.sent_at_generation,
                generation = self.state.generation,
                "Discarding stale heartbeat outcome"
            );
            return;
        }

        self.state.pending_request = None;

        match outcome {
            Ok(reply) => {
                self.record_event(request.id, TickOutcome::Replied, None);
                self.state.attempt_count = 0;
                self.state.response_count += 1;
                self.state.last_heartbeat_at = Some(Utc::now());
                self.state.last_error = None;
                self.state.status = ScheduleStatus::Idle;

                tracing::info!(
                    request_id = request.id,
                    generation = request.sent_at_generation,
                    "Heartbeat reply received"
                );
                self.hooks.dispatch(&HookEvent::ReplyReceived {
                    request_id: request.id,
                    generation: request.sent_at_generation,
                });
                let _ = self.reply_tx.send(reply);

                self.arm(TimerKind::Tick);
                self.publish();
            }
            Err(err) => self.on_failure(request.id, err),
        }
    }

    fn on_failure(&mut self, request_id: u64, err: AttemptError) {
        self.record_event(request_id, TickOutcome::Failed, Some(err.to_string()));
        self.state.attempt_count += 1;
        self.state.error_count += 1;
        self.state.pending_request = None;
        self.state.last_error = Some(err.to_string());

        let attempt = self.state.attempt_count;
        self.hooks.dispatch(&HookEvent::AttemptFailed {
            request_id,
            generation: self.state.generation,
            attempt,
            reason: err.to_string(),
        });

        if attempt < self.config.max_attempts {
            tracing::warn!(
                request_id,
                attempt,
                max_attempts = self.config.max_attempts,
                error = %err,
                "Heartbeat attempt failed; retrying"
            );
            self.state.status = ScheduleStatus::Idle;
            self.arm(TimerKind::Retry);
        } else {
            tracing::error!(
                request_id,
                attempts = attempt,
                error = %err,
                "Heartbeat degraded; automatic retries stopped until restarted"
            );
            self.clear_timer();
            self.state.status = ScheduleStatus::Degraded;
            self.state.running = false;
            self.hooks.dispatch(&HookEvent::Degraded { attempts: attempt });
        }

        self.publish();
    }

    fn set_interval(&mut self, interval: Duration) -> Result<ScheduleState, ValidationError> {
        self.interval.set(interval)?;
        // Consumes the watch notification, so the change is applied once.
        self.on_interval_changed();
        Ok(self.state.clone())
    }

    fn on_interval_changed(&mut self) {
        let interval = *self.interval_rx.borrow_and_update();
        self.state.interval = interval;
        self.hooks.dispatch(&HookEvent::IntervalChanged {
            interval_secs: interval.as_secs(),
        });

        // A pending tick moves to now + new interval, even if that is
        // sooner than before. Retries keep their short delay.
        if self.state.status == ScheduleStatus::Idle
            && self.timer.is_some_and(|t| t.kind == TimerKind::Tick)
        {
            self.arm(TimerKind::Tick);
            tracing::debug!(interval_secs = interval.as_secs(), "Rescheduled pending tick");
        }

        self.publish();
    }

    fn record_event(&mut self, request_id: u64, outcome: TickOutcome, error: Option<String>) {
        if self.config.event_history == 0 {
            return;
        }
        while self.events.len() >= self.config.event_history {
            self.events.pop_front();
        }
        self.events.push_back(HeartbeatEvent {
            tick: self.state.tick_count,
            request_id,
            timestamp: Utc::now(),
            uptime_secs: self.state.uptime().map(|d| d.as_secs()),
            outcome,
            error,
        });
        self.state.recent_events = self.events.len();
    }

    fn recent_events(&self, count: usize) -> Vec<HeartbeatEvent> {
        let skip = self.events.len().saturating_sub(count);
        self.events.iter().skip(skip).cloned().collect()
    }

    fn arm(&mut self, kind: TimerKind) {
        // Read the interval now, not when the previous tick was scheduled.
        let delay = match kind {
            TimerKind::Tick => self.interval.get(),
            TimerKind::Retry => self.config.retry_delay,
        };
        let deadline = Instant::now() + delay;
        self.timer = Some(Timer { deadline, kind });
        self.state.next_deadline = Some(deadline);
        self.state.next_run_at = Some(wall_clock_after(delay));
    }

    fn clear_timer(&mut self) {
        self.timer = None;
        self.state.next_deadline = None;
        self.state.next_run_at = None;
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn poll_inflight(inflight: &mut Option<InFlight>) -> AttemptOutcome {
    match inflight {
        Some(inflight) => (&mut inflight.future).await,
        None => std::future::pending().await,
    }
}

fn wall_clock_after(delay: Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    Utc::now() + delta
}
