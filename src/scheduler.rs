//! # Scheduler
//! Keeps every source in a due queue, dispatches due sources to at most `W`
//! concurrent poll tasks and readmits each source at `now + interval` once
//! its poll has returned.
//!
//! A source is in exactly one place at a time: waiting in the [`DueQueue`]
//! or held by a running poll (marked in [`InFlight`]). Successive polls of
//! one source are therefore strictly sequential.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};

use crate::poll::{PollCompletion, PollContext, PollOutcome, PollReport, PollTask};
use crate::source::{interval_duration, SourceRecord};
use crate::store::StoreResult;

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, u64, i64)>>,
    /// Live entry per source; heap entries with an older generation are stale.
    entries: HashMap<i64, (DateTime<Utc>, u64, SourceRecord)>,
    generation: u64,
}

impl QueueInner {
    fn drop_stale_top(&mut self) {
        while let Some(Reverse((_, generation, id))) = self.heap.peek().copied() {
            match self.entries.get(&id) {
                Some((_, live, _)) if *live == generation => break,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }
}

/// Min-heap of sources keyed by next-due time.
#[derive(Default)]
pub struct DueQueue {
    inner: Mutex<QueueInner>,
}

impl DueQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `record` for `due`, replacing any earlier entry of the same source.
    pub fn schedule(&self, record: SourceRecord, due: DateTime<Utc>) {
        let mut g = self.inner.lock();
        g.generation += 1;
        let generation = g.generation;
        let id = record.id;
        g.entries.insert(id, (due, generation, record));
        g.heap.push(Reverse((due, generation, id)));
    }

    /// Queue `record` only when the source has no entry yet.
    pub fn schedule_if_absent(&self, record: SourceRecord, due: DateTime<Utc>) -> bool {
        let mut g = self.inner.lock();
        if g.entries.contains_key(&record.id) {
            return false;
        }
        g.generation += 1;
        let generation = g.generation;
        let id = record.id;
        g.entries.insert(id, (due, generation, record));
        g.heap.push(Reverse((due, generation, id)));
        true
    }

    /// Remove and return up to `limit` sources due at `now`, earliest first.
    pub fn pop_due(&self, now: DateTime<Utc>, limit: usize) -> Vec<SourceRecord> {
        let mut g = self.inner.lock();
        let mut out = Vec::new();
        while out.len() < limit {
            g.drop_stale_top();
            let Some(Reverse((due, _, id))) = g.heap.peek().copied() else {
                break;
            };
            if due > now {
                break;
            }
            g.heap.pop();
            if let Some((_, _, record)) = g.entries.remove(&id) {
                out.push(record);
            }
        }
        out
    }

    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        let mut g = self.inner.lock();
        g.drop_stale_top();
        g.heap.peek().map(|Reverse((due, _, _))| *due)
    }

    pub fn due_of(&self, id: i64) -> Option<DateTime<Utc>> {
        self.inner.lock().entries.get(&id).map(|(due, _, _)| *due)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ids of sources with a running poll.
#[derive(Default)]
pub struct InFlight {
    ids: Mutex<HashSet<i64>>,
}

impl InFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark `id` as in flight; `None` if it already is.
    pub fn try_claim(self: &Arc<Self>, id: i64) -> Option<InFlightGuard> {
        if self.ids.lock().insert(id) {
            Some(InFlightGuard {
                set: Arc::clone(self),
                id,
            })
        } else {
            None
        }
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ids.lock().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases the claim on drop.
pub struct InFlightGuard {
    set: Arc<InFlight>,
    id: i64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.ids.lock().remove(&self.id);
    }
}

pub struct Scheduler {
    ctx: Arc<PollContext>,
    queue: Arc<DueQueue>,
    in_flight: Arc<InFlight>,
    permits: Arc<Semaphore>,
    workers: usize,
    tick: Duration,
    wake: Arc<Notify>,
    reports: Option<mpsc::UnboundedSender<PollReport>>,
}

impl Scheduler {
    pub fn new(ctx: Arc<PollContext>, workers: usize, tick: Duration) -> Self {
        let workers = workers.max(1);
        Self {
            ctx,
            queue: Arc::new(DueQueue::new()),
            in_flight: InFlight::new(),
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            tick,
            wake: Arc::new(Notify::new()),
            reports: None,
        }
    }

    /// Also deliver every finished poll's report on the returned channel.
    pub fn with_reports(mut self) -> (Self, mpsc::UnboundedReceiver<PollReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.reports = Some(tx);
        (self, rx)
    }

    pub fn queue(&self) -> &DueQueue {
        &self.queue
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Queue a source at its own next-due time.
    ///
    /// Sources already queued or held by a running poll are left alone: the
    /// scheduler's copy is never older than the caller's. Returns whether the
    /// source was queued.
    pub fn admit(&self, record: SourceRecord) -> bool {
        // Held across the insert so a finishing poll cannot slip in between.
        let running = self.in_flight.ids.lock();
        if running.contains(&record.id) {
            return false;
        }
        let due = record.next_due(Utc::now());
        let queued = self.queue.schedule_if_absent(record, due);
        drop(running);
        if queued {
            self.wake.notify_one();
        }
        queued
    }

    /// Queue every source the store knows; returns how many were new to the scheduler.
    pub async fn load_from_store(&self) -> StoreResult<usize> {
        let sources = self.ctx.store.all_sources().await?;
        let total = sources.len();
        let admitted = sources.into_iter().map(|r| self.admit(r)).filter(|q| *q).count();
        tracing::info!(sources = total, admitted, "scheduler loaded sources");
        Ok(admitted)
    }

    /// Start polls for sources due at `now`, up to the free worker slots.
    /// Returns how many polls were started.
    pub fn dispatch_due(&self, now: DateTime<Utc>) -> usize {
        let free = self.permits.available_permits();
        let mut started = 0;
        if free > 0 {
            let mut due = self.queue.pop_due(now, free).into_iter();
            while let Some(record) = due.next() {
                let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                    // Out of slots: put this and the rest back.
                    self.queue.schedule(record, now);
                    for r in due.by_ref() {
                        self.queue.schedule(r, now);
                    }
                    break;
                };
                let Some(guard) = self.in_flight.try_claim(record.id) else {
                    // Its running poll readmits it on completion.
                    tracing::debug!(source_id = record.id, "skip dispatch: already in flight");
                    continue;
                };
                self.spawn_worker(record, permit, guard);
                started += 1;
            }
        }
        crate::metrics::record_occupancy(self.in_flight.len(), self.queue.len());
        started
    }

    fn spawn_worker(&self, record: SourceRecord, permit: OwnedSemaphorePermit, guard: InFlightGuard) {
        let ctx = Arc::clone(&self.ctx);
        let queue = Arc::clone(&self.queue);
        let wake = Arc::clone(&self.wake);
        let reports = self.reports.clone();
        let fallback = record.clone();

        tracing::debug!(source_id = record.id, url = %record.feed_url, "dispatch");
        tokio::spawn(async move {
            // Inner task: a panicking poll must not take the slot bookkeeping with it.
            let completion = match tokio::spawn(PollTask::new(ctx, record).run()).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(source_id = fallback.id, error = %e, "poll task aborted");
                    aborted(fallback, Utc::now())
                }
            };

            // Requeue before releasing the claim: the source is always either
            // queued or in flight.
            let due = Utc::now() + interval_duration(completion.record.update_interval_minutes);
            queue.schedule(completion.record, due);
            drop(guard);
            drop(permit);
            if let Some(tx) = reports {
                let _ = tx.send(completion.report);
            }
            wake.notify_one();
        });
    }

    /// Dispatch loop; returns after `shutdown` flips to true (or its sender
    /// is dropped) and every running poll has finished.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(workers = self.workers, "scheduler started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.dispatch_due(Utc::now());

            let sleep_for = if self.permits.available_permits() == 0 {
                self.tick
            } else {
                self.queue
                    .next_due_at()
                    .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                    .map_or(self.tick, |d| d.min(self.tick))
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
        tracing::info!("scheduler stopping, waiting for running polls");
        self.wait_idle().await;
    }

    /// Wait until no poll is running.
    pub async fn wait_idle(&self) {
        let _all = self.permits.acquire_many(self.workers as u32).await;
    }
}

/// Completion for a poll whose task died: the record is readmitted unchanged.
fn aborted(mut record: SourceRecord, now: DateTime<Utc>) -> PollCompletion {
    record.begin_poll(now);
    let report = PollReport {
        source_id: record.id,
        feed_url: record.feed_url.clone(),
        outcome: PollOutcome::Error,
        freshness: None,
        new_items: 0,
        inserted: 0,
        interval_minutes: record.update_interval_minutes,
        pattern: record.activity_pattern,
        pattern_changed: false,
        execution_warning: false,
        elapsed_ms: 0,
    };
    crate::metrics::record_poll(&report);
    PollCompletion { record, report }
}
