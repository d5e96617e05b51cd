//! Periodic notices for jobs that keep running past a configured delay.
//!
//! The notifier watches lifecycle events as a [`RunObserver`]. When a job
//! starts it freezes the active [`LongRunNotifyConfig`] into a per-job
//! [`NotificationSchedule`]; later config changes never touch jobs already
//! in flight. Due times live in a min-heap of `(due, queue_id)` pairs.
//! Entries are invalidated lazily: a popped pair only fires if the job's
//! schedule still names exactly that due time.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::notify::sink::{LongRunNotice, ProgressSink};
use crate::queue::{Job, RunObserver};
use crate::settings::LongRunNotifyConfig;

/// Frozen notification plan for one running job.
#[derive(Debug, Clone)]
pub struct NotificationSchedule {
    pub queue_id: Uuid,
    pub run_id: Uuid,
    pub payload: String,
    pub requester_id: String,
    pub started_at: DateTime<Utc>,
    pub next_notify_at: DateTime<Utc>,
    /// Notices delivered so far for this job.
    pub notify_count: u32,
    /// Snapshot of the notifier config taken when the job started.
    pub config: LongRunNotifyConfig,
}

#[derive(Default)]
struct ScheduleState {
    entries: HashMap<Uuid, NotificationSchedule>,
    due: BinaryHeap<Reverse<(DateTime<Utc>, Uuid)>>,
}

/// Tracks running jobs and emits "still running" notices through a
/// [`ProgressSink`] once they outlive the configured initial delay.
pub struct LongRunNotifier {
    sink: Arc<dyn ProgressSink>,
    clock: Arc<dyn Clock>,
    config: RwLock<LongRunNotifyConfig>,
    state: Mutex<ScheduleState>,
    schedule_changed: Notify,
}

impl LongRunNotifier {
    pub fn new(
        sink: Arc<dyn ProgressSink>,
        clock: Arc<dyn Clock>,
        config: LongRunNotifyConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink,
            clock,
            config: RwLock::new(config),
            state: Mutex::new(ScheduleState::default()),
            schedule_changed: Notify::new(),
        })
    }

    /// Swaps the configuration used for jobs that start from now on.
    /// Jobs already tracked keep the settings they started with.
    pub async fn set_config(&self, config: LongRunNotifyConfig) {
        *self.config.write().await = config;
    }

    /// Schedules currently tracked, soonest due first.
    pub async fn tracked(&self) -> Vec<NotificationSchedule> {
        let state = self.state.lock().await;
        let mut schedules: Vec<_> = state.entries.values().cloned().collect();
        schedules.sort_by_key(|schedule| schedule.next_notify_at);
        schedules
    }

    /// Earliest due time across live schedules, discarding stale heap
    /// entries along the way.
    pub async fn next_due(&self) -> Option<DateTime<Utc>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        while let Some(Reverse((due, queue_id))) = state.due.peek().copied() {
            let live = state
                .entries
                .get(&queue_id)
                .is_some_and(|entry| entry.next_notify_at == due);
            if live {
                return Some(due);
            }
            state.due.pop();
        }
        None
    }

    /// Delivers every notice whose due time has passed. Returns how many
    /// notices were delivered.
    ///
    /// Collection happens under the state lock; delivery does not, so a
    /// slow sink never blocks job bookkeeping. A job that fell several
    /// intervals behind catches up one notice per call.
    pub async fn fire_due(&self) -> usize {
        let now = self.clock.now();
        let batch = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let mut batch = Vec::new();
            while let Some(Reverse((due, queue_id))) = state.due.peek().copied() {
                if due > now {
                    break;
                }
                state.due.pop();
                let Some(entry) = state.entries.get(&queue_id) else {
                    continue;
                };
                if entry.next_notify_at != due {
                    continue;
                }
                let elapsed = (now - entry.started_at).to_std().unwrap_or_default();
                batch.push((
                    due,
                    LongRunNotice {
                        queue_id: entry.queue_id,
                        run_id: entry.run_id,
                        payload: entry.payload.clone(),
                        requester_id: entry.requester_id.clone(),
                        started_at: entry.started_at,
                        elapsed,
                        sequence: entry.notify_count + 1,
                    },
                ));
            }
            batch
        };

        let mut delivered = 0;
        for (due, notice) in batch {
            match self.sink.deliver(&notice).await {
                Ok(()) => {
                    delivered += 1;
                    debug!(
                        queue_id = %notice.queue_id,
                        sequence = notice.sequence,
                        "Long-run notice delivered"
                    );
                    self.mark_delivered(notice.queue_id, due).await;
                }
                Err(err) => {
                    warn!(
                        queue_id = %notice.queue_id,
                        sequence = notice.sequence,
                        error = %err,
                        "Long-run notice delivery failed, dropping schedule"
                    );
                }
            }
        }
        delivered
    }

    /// Bumps the delivery count and queues the next notice if the frozen
    /// config still allows one.
    async fn mark_delivered(&self, queue_id: Uuid, fired_at: DateTime<Utc>) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(entry) = state.entries.get_mut(&queue_id) else {
            // Job finished while the notice was in flight.
            return;
        };
        entry.notify_count += 1;
        let quota_left = entry
            .config
            .max_notifications
            .map_or(true, |max| entry.notify_count < max);
        let Some(interval) = entry.config.interval.filter(|_| quota_left) else {
            debug!(
                queue_id = %queue_id,
                notices = entry.notify_count,
                "Long-run notice schedule complete"
            );
            return;
        };
        let Some(next) = due_after(fired_at, interval) else {
            return;
        };
        entry.next_notify_at = next;
        state.due.push(Reverse((next, queue_id)));
        self.schedule_changed.notify_one();
    }
}

#[async_trait]
impl RunObserver for LongRunNotifier {
    async fn job_started(&self, job: &Job) {
        let config = self.config.read().await.clone();
        if !config.enabled {
            return;
        }
        let Some(run_id) = job.run_id else {
            debug!(queue_id = %job.queue_id, "Job started without a run id, not tracking");
            return;
        };
        let started_at = job.started_at.unwrap_or_else(|| self.clock.now());
        let Some(next_notify_at) = due_after(started_at, config.initial_delay) else {
            warn!(queue_id = %job.queue_id, "Initial notification delay out of range, not tracking");
            return;
        };
        let schedule = NotificationSchedule {
            queue_id: job.queue_id,
            run_id,
            payload: job.payload.clone(),
            requester_id: job.requester_id.clone(),
            started_at,
            next_notify_at,
            notify_count: 0,
            config,
        };
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state.entries.insert(job.queue_id, schedule);
            state.due.push(Reverse((next_notify_at, job.queue_id)));
        }
        self.schedule_changed.notify_one();
        debug!(
            queue_id = %job.queue_id,
            due = %next_notify_at,
            "Tracking long-running job"
        );
    }

    async fn job_finished(&self, job: &Job) {
        let removed = {
            let mut state = self.state.lock().await;
            state.entries.remove(&job.queue_id).is_some()
        };
        if removed {
            self.schedule_changed.notify_one();
            debug!(queue_id = %job.queue_id, "Job finished, long-run schedule dropped");
        }
    }
}

/// Spawns the wake-up loop that sleeps until the next notice is due (or
/// the schedule changes) and fires it. Tests and the harness skip this and
/// call [`LongRunNotifier::fire_due`] against a manual clock instead.
pub fn spawn_longrun_driver(notifier: Arc<LongRunNotifier>) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Long-run notifier driver started");
        loop {
            match notifier.next_due().await {
                Some(due) => {
                    let wait = (due - notifier.clock.now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {
                            notifier.fire_due().await;
                        }
                        _ = notifier.schedule_changed.notified() => {}
                    }
                }
                None => notifier.schedule_changed.notified().await,
            }
        }
    })
}

fn due_after(start: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    let delay = chrono::Duration::from_std(delay).ok()?;
    start.checked_add_signed(delay)
}
