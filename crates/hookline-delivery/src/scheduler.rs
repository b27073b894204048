//! Timed retry scheduling with checkpointing.
//!
//! Pending retries live in a min-heap ordered by fire time and drained by a
//! single background loop ([`RetryScheduler::run`]). At most one retry is
//! pending per event id; arming a new one supersedes the old entry, which
//! stays in the heap but is skipped by generation when it surfaces.
//!
//! Per event id the scheduler moves through
//! `Idle -> Scheduled -> Executing -> (Idle | Scheduled | Exhausted)`.
//!
//! Every pending retry is also written to the store under `retry/<event-id>`
//! so [`RetryScheduler::recover`] can re-arm it after a restart. The
//! checkpoint is written before the entry becomes visible to the loop, so
//! the attempt that consumes it always finds it to clear.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hookline_core::{
    store, Clock, EventContext, EventId, HandlerResult, KeyValueStore, TopicPriority,
};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::Notify,
    task::JoinSet,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::Result,
    monitor::EventMonitor,
    retry::{RetryDecision, RetryPolicy},
};

const CHECKPOINT_PREFIX: &str = "retry/";

fn checkpoint_key(event_id: &EventId) -> String {
    format!("{CHECKPOINT_PREFIX}{event_id}")
}

/// Re-enters processing for a retried event.
///
/// The scheduler depends on this narrow seam instead of the dispatcher type.
#[async_trait]
pub trait Redispatch: Send + Sync {
    /// Runs one processing attempt and returns its outcome.
    async fn redispatch(&self, context: &EventContext) -> HandlerResult;
}

/// Retry lifecycle of one event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// No retry pending or running.
    Idle,
    /// A retry is armed and waiting for its fire time.
    Scheduled,
    /// A retry attempt is running.
    Executing,
    /// Retries were given up.
    Exhausted,
}

/// Result of asking for a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A retry was armed.
    Scheduled {
        /// Time until it fires
        delay: Duration,
    },
    /// The policy's retry budget is spent; nothing was armed.
    Exhausted {
        /// Retry count at which the policy gave up
        attempts: u32,
    },
    /// An attempt for this event is running; nothing was armed.
    InFlight,
}

/// Which failed records [`RetryScheduler::retry_all_failed`] re-arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryScope {
    /// Failed records with no retry pending, running or given up, whose
    /// latest failure is still retryable. Used by the periodic sweep.
    Stranded,
    /// Every failed record without a running attempt, superseding pending
    /// retries and reviving given-up ones.
    All,
}

/// Durable form of a pending retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RetryCheckpoint {
    context: EventContext,
    retry_count: u32,
    policy: RetryPolicy,
    fire_at: DateTime<Utc>,
    generation: u64,
}

#[derive(Debug)]
struct PendingRetry {
    context: EventContext,
    retry_count: u32,
    policy: RetryPolicy,
    generation: u64,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    fire_at: Instant,
    priority: TopicPriority,
    generation: u64,
    event_id: EventId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

#[derive(Debug, Default)]
struct SchedulerState {
    pending: HashMap<EventId, PendingRetry>,
    queue: BinaryHeap<Reverse<QueueEntry>>,
    executing: HashSet<EventId>,
    exhausted: HashSet<EventId>,
    next_generation: u64,
}

impl SchedulerState {
    /// Whether a new retry may be armed. `only_if_idle` also refuses ids
    /// with a retry pending or given up.
    fn can_arm(&self, event_id: &EventId, only_if_idle: bool) -> bool {
        if self.executing.contains(event_id) {
            return false;
        }
        !only_if_idle || !(self.pending.contains_key(event_id) || self.exhausted.contains(event_id))
    }

    fn is_current(&self, entry: &QueueEntry) -> bool {
        self.pending.get(&entry.event_id).is_some_and(|p| p.generation == entry.generation)
    }

    /// Pops every due entry and returns them with the next fire time.
    fn take_due(&mut self, now: Instant) -> (Vec<(EventId, PendingRetry)>, Option<Instant>) {
        let mut due = Vec::new();

        while let Some(Reverse(entry)) = self.queue.peek() {
            if self.is_current(entry) && entry.fire_at > now {
                break;
            }
            let Some(Reverse(entry)) = self.queue.pop() else {
                break;
            };
            if !self.is_current(&entry) {
                continue;
            }
            if let Some(retry) = self.pending.remove(&entry.event_id) {
                self.executing.insert(entry.event_id.clone());
                due.push((entry.event_id, retry));
            }
        }

        (due, self.queue.peek().map(|Reverse(entry)| entry.fire_at))
    }
}

/// Removes the event from the executing set however the attempt ends.
struct ExecutingGuard<'a> {
    state: &'a Mutex<SchedulerState>,
    event_id: EventId,
}

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).executing.remove(&self.event_id);
    }
}

/// Arranges delayed re-dispatch of failed events.
#[derive(Debug)]
pub struct RetryScheduler {
    state: Mutex<SchedulerState>,
    wakeup: Notify,
    monitor: EventMonitor,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    default_policy: RetryPolicy,
}

impl RetryScheduler {
    /// Creates a scheduler using `default_policy` when callers supply none.
    pub fn new(
        monitor: EventMonitor,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        default_policy: RetryPolicy,
    ) -> Self {
        // Generations start from the wall clock so a restarted process does
        // not reuse ones still sitting in old checkpoints.
        let state = SchedulerState {
            next_generation: u64::try_from(clock.now().timestamp_micros()).unwrap_or_default(),
            ..SchedulerState::default()
        };

        Self {
            state: Mutex::new(state),
            wakeup: Notify::new(),
            monitor,
            store,
            clock,
            default_policy,
        }
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Policy applied when a caller passes none.
    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    /// Schedules retry number `retry_count` for an event.
    ///
    /// Gives up once `retry_count` reaches the policy's maximum. Otherwise
    /// arms a timer for `min(initial * multiplier^retry_count, max_delay)`,
    /// superseding any retry already pending for the same id.
    pub async fn schedule_retry(
        &self,
        context: &EventContext,
        retry_count: u32,
        policy: Option<RetryPolicy>,
    ) -> ScheduleOutcome {
        let policy = policy.unwrap_or_else(|| self.default_policy.clone());
        let event_id = context.event_id();

        match policy.decide(retry_count) {
            RetryDecision::GiveUp { reason } => {
                {
                    let mut state = self.state();
                    if state.executing.contains(event_id) {
                        return ScheduleOutcome::InFlight;
                    }
                    state.pending.remove(event_id);
                    state.exhausted.insert(event_id.clone());
                }
                self.delete_checkpoint(event_id).await;
                self.mark_retries_stopped(event_id).await;

                warn!(
                    event_id = %event_id,
                    topic = %context.topic(),
                    shop = %context.shop(),
                    retry_count,
                    reason = %reason,
                    "webhook retries exhausted, giving up"
                );
                ScheduleOutcome::Exhausted { attempts: retry_count }
            },
            RetryDecision::Retry { delay } => {
                if !self.arm(context.clone(), retry_count, policy, delay, false).await {
                    return ScheduleOutcome::InFlight;
                }

                info!(
                    event_id = %event_id,
                    topic = %context.topic(),
                    retry_count,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "scheduled webhook retry"
                );
                ScheduleOutcome::Scheduled { delay }
            },
        }
    }

    /// Arms a pending retry. Returns `false` if an attempt is executing, or
    /// with `only_if_idle` if the id already has a retry pending or given up.
    async fn arm(
        &self,
        context: EventContext,
        retry_count: u32,
        policy: RetryPolicy,
        delay: Duration,
        only_if_idle: bool,
    ) -> bool {
        let event_id = context.event_id().clone();
        let fire_at = Instant::now() + delay;
        let wall_fire_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| self.clock.now().checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let generation = {
            let mut state = self.state();
            if !state.can_arm(&event_id, only_if_idle) {
                return false;
            }
            let generation = state.next_generation;
            state.next_generation += 1;
            generation
        };

        let checkpoint = RetryCheckpoint {
            context: context.clone(),
            retry_count,
            policy: policy.clone(),
            fire_at: wall_fire_at,
            generation,
        };
        self.save_checkpoint(&event_id, checkpoint).await;

        // Another arm for the same id may have landed while the checkpoint
        // was being written; the newer generation wins.
        let placed = {
            let mut state = self.state();
            let newer_pending =
                state.pending.get(&event_id).is_some_and(|pending| pending.generation > generation);

            if newer_pending || !state.can_arm(&event_id, only_if_idle) {
                Err(newer_pending)
            } else {
                state.exhausted.remove(&event_id);
                let superseded = state
                    .pending
                    .insert(
                        event_id.clone(),
                        PendingRetry { context: context.clone(), retry_count, policy, generation },
                    )
                    .is_some();
                if superseded {
                    debug!(event_id = %event_id, "superseded pending retry");
                }

                state.queue.push(Reverse(QueueEntry {
                    fire_at,
                    priority: context.topic().priority(),
                    generation,
                    event_id: event_id.clone(),
                }));
                Ok(())
            }
        };

        if let Err(newer_pending) = placed {
            self.clear_checkpoint(&event_id, generation).await;
            debug!(event_id = %event_id, newer_pending, "dropped retry armed concurrently");
            return newer_pending;
        }

        self.wakeup.notify_one();
        true
    }

    /// Writes a checkpoint unless a newer generation is already stored.
    async fn save_checkpoint(&self, event_id: &EventId, checkpoint: RetryCheckpoint) {
        let result = store::modify(
            self.store.as_ref(),
            &checkpoint_key(event_id),
            move |current: Option<RetryCheckpoint>| match current {
                Some(current) if current.generation > checkpoint.generation => Some(current),
                _ => Some(checkpoint),
            },
        )
        .await;

        if let Err(error) = result {
            error!(event_id = %event_id, error = %error, "failed to checkpoint pending retry");
        }
    }

    async fn mark_retries_stopped(&self, event_id: &EventId) {
        if let Err(error) = self.monitor.mark_retries_stopped(event_id).await {
            warn!(event_id = %event_id, error = %error, "failed to mark retries stopped");
        }
    }

    async fn delete_checkpoint(&self, event_id: &EventId) {
        if let Err(error) = self.store.delete(&checkpoint_key(event_id)).await {
            error!(event_id = %event_id, error = %error, "failed to delete retry checkpoint");
        }
    }

    /// Deletes the checkpoint only if no newer retry has replaced it.
    async fn clear_checkpoint(&self, event_id: &EventId, generation: u64) {
        let result = store::modify(
            self.store.as_ref(),
            &checkpoint_key(event_id),
            move |checkpoint: Option<RetryCheckpoint>| {
                checkpoint.filter(|checkpoint| checkpoint.generation != generation)
            },
        )
        .await;

        if let Err(error) = result {
            error!(event_id = %event_id, error = %error, "failed to clear retry checkpoint");
        }
    }

    /// Re-arms failed delivery records within `scope`.
    ///
    /// Delays are staggered as `stagger * (retry_count + 1)` so a large
    /// backlog does not fire at once. Events with an attempt running are
    /// always skipped. Returns how many retries were armed.
    pub async fn retry_all_failed(&self, stagger: Duration, scope: RetryScope) -> Result<usize> {
        let failed = self.monitor.failed().await?;
        let candidates = failed.len();
        let only_if_idle = scope == RetryScope::Stranded;

        let mut armed = 0;
        for record in failed {
            if only_if_idle && record.retries_stopped {
                continue;
            }
            let delay = stagger.saturating_mul(record.retry_count.saturating_add(1));
            if self
                .arm(record.context, record.retry_count, self.default_policy.clone(), delay, only_if_idle)
                .await
            {
                armed += 1;
            }
        }

        info!(candidates, armed, scope = ?scope, "re-armed failed webhook deliveries");
        Ok(armed)
    }

    /// Re-arms retries checkpointed before a restart.
    ///
    /// Fire times already in the past fire immediately. Unreadable
    /// checkpoints are logged and dropped. Returns how many were re-armed.
    pub async fn recover(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut checkpoints = Vec::new();

        for (key, bytes) in self.store.scan_prefix(CHECKPOINT_PREFIX).await? {
            match serde_json::from_slice::<RetryCheckpoint>(&bytes) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(error) => {
                    warn!(key = %key, error = %error, "dropping unreadable retry checkpoint");
                    self.store.delete(&key).await?;
                },
            }
        }

        if let Some(newest) = checkpoints.iter().map(|checkpoint| checkpoint.generation).max() {
            let mut state = self.state();
            state.next_generation = state.next_generation.max(newest.saturating_add(1));
        }

        let mut recovered = 0;
        for checkpoint in checkpoints {
            let delay = (checkpoint.fire_at - now).to_std().unwrap_or(Duration::ZERO);
            if self
                .arm(checkpoint.context, checkpoint.retry_count, checkpoint.policy, delay, false)
                .await
            {
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!(recovered, "recovered checkpointed webhook retries");
        }
        Ok(recovered)
    }

    /// Drops pending and given-up state for events whose records were purged.
    pub async fn forget(&self, event_ids: &[EventId]) {
        let mut cancelled = Vec::new();
        {
            let mut state = self.state();
            for event_id in event_ids {
                state.exhausted.remove(event_id);
                if state.pending.remove(event_id).is_some() {
                    cancelled.push(event_id.clone());
                }
            }
        }

        for event_id in &cancelled {
            self.delete_checkpoint(event_id).await;
        }
        if !cancelled.is_empty() {
            debug!(cancelled = cancelled.len(), "cancelled retries of purged deliveries");
        }
    }

    /// Current retry state for an event.
    pub fn retry_state(&self, event_id: &EventId) -> RetryState {
        let state = self.state();
        if state.executing.contains(event_id) {
            RetryState::Executing
        } else if state.pending.contains_key(event_id) {
            RetryState::Scheduled
        } else if state.exhausted.contains(event_id) {
            RetryState::Exhausted
        } else {
            RetryState::Idle
        }
    }

    /// Number of armed retries.
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Fires due retries until `token` is cancelled.
    ///
    /// Attempts run concurrently across event ids. On cancellation the loop
    /// stops arming new attempts and waits for running ones to finish.
    pub async fn run(self: Arc<Self>, redispatch: Arc<dyn Redispatch>, token: CancellationToken) {
        info!("retry scheduler started");
        let mut in_flight = JoinSet::new();

        loop {
            let (due, next_fire) = self.state().take_due(Instant::now());

            for (event_id, retry) in due {
                let scheduler = Arc::clone(&self);
                let redispatch = Arc::clone(&redispatch);
                in_flight.spawn(async move {
                    scheduler.execute(event_id, retry, redispatch.as_ref()).await;
                });
            }

            let next_deadline = async {
                match next_fire {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                () = token.cancelled() => break,
                () = self.wakeup.notified() => {},
                () = next_deadline => {},
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(join_error) = joined {
                        error!(error = %join_error, "retry attempt task failed");
                    }
                },
            }
        }

        info!(in_flight = in_flight.len(), "retry scheduler stopping, draining running attempts");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(join_error) = joined {
                error!(error = %join_error, "retry attempt task failed during shutdown");
            }
        }
        info!("retry scheduler stopped");
    }

    async fn execute(&self, event_id: EventId, retry: PendingRetry, redispatch: &dyn Redispatch) {
        let guard = ExecutingGuard { state: &self.state, event_id: event_id.clone() };

        debug!(event_id = %event_id, retry_count = retry.retry_count, "executing webhook retry");
        let result = redispatch.redispatch(&retry.context).await;
        self.clear_checkpoint(&event_id, retry.generation).await;

        if let Err(error) = self
            .monitor
            .record_retry_attempt(&event_id, result.is_success(), result.error_message())
            .await
        {
            error!(event_id = %event_id, error = %error, "failed to record retry attempt");
        }
        drop(guard);

        if result.is_success() {
            info!(event_id = %event_id, retry_count = retry.retry_count, "webhook retry succeeded");
            return;
        }

        if !result.is_retryable() {
            self.state().exhausted.insert(event_id.clone());
            self.mark_retries_stopped(&event_id).await;
            warn!(
                event_id = %event_id,
                error = result.error_message().as_deref().unwrap_or_default(),
                "webhook retry failed permanently"
            );
            return;
        }

        self.schedule_retry(&retry.context, retry.retry_count.saturating_add(1), Some(retry.policy))
            .await;
    }
}
