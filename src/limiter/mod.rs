// src/limiter/mod.rs
//! Rate-limited executor shared by every outbound source.
//!
//! One `RateLimiterService` is built at startup and cloned into each wrapper.
//! Per source it owns the request window, circuit breaker, waiting queue and
//! counters behind a single mutex, so every admission decision is atomic.
//! No lock is ever held across an `.await`.

pub mod circuit;
pub mod events;
pub mod queue;
pub mod retry;
pub mod stats;
pub mod window;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{PipelineConfig, SourceConfig, SourceConfigPatch};
use crate::error::{ExtractError, ExtractResult};

use circuit::{Admission, CircuitBreaker, Transition};
use queue::{Admit, QueuedRequest, RequestQueue, QUEUE_TTL};
use retry::{RetryOutcome, RetryPolicy};
use stats::DailySpend;
use window::RequestWindow;

pub use circuit::CircuitState;
pub use events::LimiterEvent;
pub use queue::Priority;
pub use stats::SourceStats;

/// How often request history is pruned and stale waiters are purged.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "extract_source_requests_total",
            "Executed source requests by outcome."
        );
        describe_counter!(
            "extract_source_retries_total",
            "Backoff retries performed per source."
        );
        describe_counter!(
            "extract_circuit_open_total",
            "Times a source circuit opened."
        );
        describe_histogram!(
            "extract_source_latency_ms",
            "Successful request latency in milliseconds."
        );
        describe_gauge!(
            "extract_source_queue_length",
            "Requests waiting per source."
        );
        describe_counter!(
            "extract_source_cost_total",
            "Accumulated estimated spend per source (micro-USD)."
        );
    });
}

#[derive(Debug)]
struct SourceSlot {
    name: String,
    config: SourceConfig,
    stats: SourceStats,
    window: RequestWindow,
    circuit: CircuitBreaker,
    queue: RequestQueue,
    drain_timer_at: Option<Instant>,
}

impl SourceSlot {
    fn new(name: &str, config: SourceConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            stats: SourceStats::default(),
            window: RequestWindow::new(),
            circuit: CircuitBreaker::default(),
            queue: RequestQueue::new(),
            drain_timer_at: None,
        }
    }

    fn snapshot(&self) -> SourceStats {
        let mut s = self.stats.clone();
        s.queue_length = self.queue.len();
        s.circuit_state = self.circuit.state();
        s.consecutive_failures = self.circuit.consecutive_failures();
        s
    }

    fn has_capacity(&self) -> bool {
        self.stats.current_concurrent < self.config.max_concurrent
    }

    fn rate_allows(&mut self, now: Instant) -> bool {
        self.window.can_proceed(
            now,
            self.config.max_requests_per_minute,
            self.config.max_requests_per_hour,
        )
    }

    fn reserve(&mut self, now: Instant) {
        self.window.record(now);
        self.stats.record_dispatch(chrono::Utc::now());
    }
}

type SlotRef = Arc<Mutex<SourceSlot>>;

struct Shared {
    slots: RwLock<HashMap<String, SlotRef>>,
    emergency: AtomicBool,
    spend: Mutex<DailySpend>,
    max_daily_cost: Mutex<f64>,
    events: events::EventBus,
}

/// Process-wide gatekeeper for outbound calls. Cheap to clone.
#[derive(Clone)]
pub struct RateLimiterService {
    shared: Arc<Shared>,
}

enum Entry {
    Run,
    Wait {
        id: Uuid,
        rx: oneshot::Receiver<Admit>,
        deadline: Instant,
    },
}

/// A queued caller's place in line: its queue id and admission channel.
struct Pending {
    id: Uuid,
    rx: oneshot::Receiver<Admit>,
}

/// Holds a queue ticket or a reserved slot and hands either back on drop,
/// then lets the next waiter in. Also covers cancellation of the caller's
/// future, including between admission and its next poll.
struct InFlight<'a> {
    service: &'a RateLimiterService,
    slot: &'a SlotRef,
    pending: Option<Pending>,
    trial: bool,
    admitted: bool,
    undo: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut guard = self.slot.lock();
        let s = &mut *guard;
        if let Some(mut pending) = self.pending.take() {
            s.queue.remove(pending.id);
            pending.rx.close();
            // Admitted but never ran: the reservation made for it goes back.
            if let Ok(Ok(())) = pending.rx.try_recv() {
                s.stats.undo_dispatch();
            }
            s.stats.queue_length = s.queue.len();
        }
        if self.trial {
            s.circuit.abort_trial();
        }
        if self.admitted {
            if self.undo {
                s.stats.undo_dispatch();
            } else {
                s.stats.release();
            }
        }
        self.service.drain_locked(s);
    }
}

impl RateLimiterService {
    pub fn new(config: PipelineConfig) -> Self {
        let slots = config
            .sources
            .iter()
            .map(|(name, cfg)| {
                (
                    name.clone(),
                    Arc::new(Mutex::new(SourceSlot::new(name, cfg.clone()))),
                )
            })
            .collect();
        Self {
            shared: Arc::new(Shared {
                slots: RwLock::new(slots),
                emergency: AtomicBool::new(false),
                spend: Mutex::new(DailySpend::default()),
                max_daily_cost: Mutex::new(config.max_daily_cost),
                events: events::EventBus::default(),
            }),
        }
    }

    /// Add (or replace the limits of) a source at runtime.
    pub fn register_source(&self, name: &str, config: SourceConfig) {
        let mut slots = self.shared.slots.write();
        match slots.get(name) {
            Some(existing) => existing.lock().config = config,
            None => {
                slots.insert(
                    name.to_string(),
                    Arc::new(Mutex::new(SourceSlot::new(name, config))),
                );
            }
        }
    }

    fn slot(&self, source: &str) -> ExtractResult<SlotRef> {
        self.shared
            .slots
            .read()
            .get(source)
            .cloned()
            .ok_or_else(|| ExtractError::UnknownSource(source.to_string()))
    }

    /// Run `op` against `source` under the source's limits.
    ///
    /// Rejects at once on emergency stop, disabled source or open circuit.
    /// Otherwise runs now, or waits in the source queue (up to five minutes)
    /// until a slot frees. `op` is invoked once per attempt; retries, timeout
    /// and backoff follow the source config.
    pub async fn execute<T, F, Fut>(&self, source: &str, priority: Priority, op: F) -> ExtractResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExtractResult<T>>,
    {
        ensure_metrics_described();
        self.check_emergency()?;
        let slot = self.slot(source)?;
        let (entry, trial) = self.enter(source, &slot, priority)?;

        let mut flight = InFlight {
            service: self,
            slot: &slot,
            pending: None,
            trial,
            admitted: false,
            undo: false,
        };

        match entry {
            Entry::Run => flight.admitted = true,
            Entry::Wait { id, rx, deadline } => {
                let pending = flight.pending.insert(Pending { id, rx });
                let verdict = self.wait_admitted(source, &slot, pending, deadline).await;
                flight.pending = None;
                verdict?;
                flight.admitted = true;
                // The stop may have tripped while this request waited.
                if let Err(e) = self.check_emergency() {
                    flight.undo = true;
                    return Err(e);
                }
            }
        }

        let policy = RetryPolicy::from(&slot.lock().config);
        let started = Instant::now();
        let outcome = retry::run_with_retry(source, policy, op).await;
        self.settle(&slot, &outcome, started.elapsed());
        drop(flight);
        outcome.result
    }

    fn check_emergency(&self) -> ExtractResult<()> {
        if self.shared.emergency.load(Ordering::SeqCst) {
            let spent = self.shared.spend.lock().spent();
            return Err(ExtractError::EmergencyStop {
                spent,
                limit: self.max_daily_cost(),
            });
        }
        Ok(())
    }

    /// Admission decision under the source lock. Returns whether this caller
    /// carries the half-open trial.
    fn enter(&self, source: &str, slot: &SlotRef, priority: Priority) -> ExtractResult<(Entry, bool)> {
        let mut guard = slot.lock();
        let s = &mut *guard;

        if !s.config.enabled {
            return Err(ExtractError::SourceDisabled {
                provider: source.to_string(),
            });
        }

        let now = Instant::now();
        let was_open = s.circuit.state() == CircuitState::Open;
        let trial = match s.circuit.admit(now) {
            Admission::Allowed => false,
            Admission::Trial => {
                if was_open {
                    info!(target: "limiter", source, "circuit half-open, letting one trial through");
                    self.shared.events.emit(LimiterEvent::CircuitHalfOpen {
                        source: source.to_string(),
                    });
                }
                true
            }
            Admission::Rejected => {
                counter!("extract_source_requests_total", "source" => source.to_string(), "outcome" => "circuit_open")
                    .increment(1);
                debug!(target: "limiter", source, "circuit open, rejecting");
                return Err(ExtractError::CircuitOpen {
                    provider: source.to_string(),
                });
            }
        };

        // Waiters go first; a fresh caller only skips the line when nobody waits.
        if s.queue.is_empty() && s.has_capacity() && s.rate_allows(now) {
            s.reserve(now);
            return Ok((Entry::Run, trial));
        }

        let (req, rx) = QueuedRequest::new(source, priority, now);
        let id = req.id;
        let deadline = req.deadline;
        s.queue.enqueue(req);
        let queue_length = s.queue.len();
        debug!(target: "limiter", source, ?priority, queue_length, "request queued");
        self.shared.events.emit(LimiterEvent::RequestQueued {
            source: source.to_string(),
            priority,
            queue_length,
        });
        self.drain_locked(s);

        Ok((Entry::Wait { id, rx, deadline }, trial))
    }

    async fn wait_admitted(
        &self,
        source: &str,
        slot: &SlotRef,
        pending: &mut Pending,
        deadline: Instant,
    ) -> ExtractResult<()> {
        match tokio::time::timeout_at(deadline, &mut pending.rx).await {
            Ok(Ok(admit)) => admit,
            Ok(Err(_)) => Err(ExtractError::QueueTimeout {
                provider: source.to_string(),
                waited: QUEUE_TTL,
            }),
            Err(_) => {
                let removed = {
                    let mut guard = slot.lock();
                    let r = guard.queue.remove(pending.id);
                    guard.stats.queue_length = guard.queue.len();
                    r
                };
                match removed {
                    Some(req) => {
                        let waited = Instant::now().saturating_duration_since(req.enqueued_at);
                        self.note_queue_timeout(source);
                        Err(ExtractError::QueueTimeout {
                            provider: source.to_string(),
                            waited,
                        })
                    }
                    // Dequeued concurrently: the verdict is already in the channel.
                    None => pending.rx.try_recv().unwrap_or(Err(ExtractError::QueueTimeout {
                        provider: source.to_string(),
                        waited: QUEUE_TTL,
                    })),
                }
            }
        }
    }

    fn note_queue_timeout(&self, source: &str) {
        warn!(target: "limiter", source, "queued request expired unserved");
        counter!("extract_source_requests_total", "source" => source.to_string(), "outcome" => "queue_timeout")
            .increment(1);
        self.shared.events.emit(LimiterEvent::QueueTimeout {
            source: source.to_string(),
        });
    }

    /// Purge expired waiters, then admit as many as capacity and the window allow.
    /// Returns the number of expired waiters rejected.
    fn drain_locked(&self, s: &mut SourceSlot) -> usize {
        let now = Instant::now();
        let expired = s.queue.purge_expired(now);
        let expired_count = expired.len();
        for req in expired {
            self.note_queue_timeout(&s.name);
            req.reject_expired(now);
        }

        while !s.queue.is_empty() && s.has_capacity() {
            if !s.rate_allows(now) {
                self.arm_drain_timer(s, now);
                break;
            }
            let Some(req) = s.queue.dequeue_next() else {
                break;
            };
            if req.notify.is_closed() {
                continue;
            }
            s.reserve(now);
            if req.notify.send(Ok(())).is_err() {
                s.stats.undo_dispatch();
            }
        }

        s.stats.queue_length = s.queue.len();
        gauge!("extract_source_queue_length", "source" => s.name.clone()).set(s.queue.len() as f64);
        expired_count
    }

    /// Wake the queue when the window frees up, even if nothing is in flight.
    fn arm_drain_timer(&self, s: &mut SourceSlot, now: Instant) {
        let Some(at) = s.window.next_slot(
            now,
            s.config.max_requests_per_minute,
            s.config.max_requests_per_hour,
        ) else {
            return;
        };
        if s.drain_timer_at.is_some_and(|armed| armed <= at) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        s.drain_timer_at = Some(at);
        let service = self.clone();
        let name = s.name.clone();
        handle.spawn(async move {
            tokio::time::sleep_until(at).await;
            service.drain(&name);
        });
    }

    fn drain(&self, source: &str) {
        if let Ok(slot) = self.slot(source) {
            let mut guard = slot.lock();
            guard.drain_timer_at = None;
            self.drain_locked(&mut guard);
        }
    }

    fn settle<T>(&self, slot: &SlotRef, outcome: &RetryOutcome<T>, latency: Duration) {
        let mut cost = 0.0;
        {
            let mut guard = slot.lock();
            let s = &mut *guard;
            match &outcome.result {
                Ok(_) => {
                    cost = s.config.cost_per_request;
                    s.stats.record_success(latency, cost);
                    counter!("extract_source_requests_total", "source" => s.name.clone(), "outcome" => "success")
                        .increment(1);
                    histogram!("extract_source_latency_ms", "source" => s.name.clone())
                        .record(latency.as_secs_f64() * 1_000.0);
                    if cost > 0.0 {
                        counter!("extract_source_cost_total", "source" => s.name.clone())
                            .increment((cost * 1_000_000.0).round() as u64);
                    }
                    if s.circuit.on_success() == Some(Transition::Closed) {
                        info!(target: "limiter", source = %s.name, "circuit closed after successful trial");
                        self.shared.events.emit(LimiterEvent::CircuitClosed {
                            source: s.name.clone(),
                        });
                    }
                }
                Err(e) => {
                    s.stats.record_failure();
                    counter!("extract_source_requests_total", "source" => s.name.clone(), "outcome" => e.kind())
                        .increment(1);
                    if e.counts_as_source_failure() {
                        let threshold = s.config.circuit_breaker_threshold;
                        if s.circuit.on_failure(Instant::now(), threshold) == Some(Transition::Opened) {
                            let failures = s.circuit.consecutive_failures();
                            warn!(
                                target: "limiter",
                                source = %s.name,
                                failures,
                                error = %e,
                                "circuit opened"
                            );
                            counter!("extract_circuit_open_total", "source" => s.name.clone())
                                .increment(1);
                            self.shared.events.emit(LimiterEvent::CircuitOpened {
                                source: s.name.clone(),
                                consecutive_failures: failures,
                            });
                        }
                    }
                }
            }
        }
        if cost > 0.0 {
            self.add_spend(cost);
        }
    }

    fn add_spend(&self, cost: f64) {
        let spent = self.shared.spend.lock().add(cost);
        let limit = self.max_daily_cost();
        if spent > limit && !self.shared.emergency.swap(true, Ordering::SeqCst) {
            warn!(target: "limiter", spent, limit, "daily cost ceiling exceeded, emergency stop engaged");
            self.shared
                .events
                .emit(LimiterEvent::EmergencyStop { spent, limit });
        }
    }

    // ---- admin / observability ----

    pub fn stats(&self, source: &str) -> Option<SourceStats> {
        let slot = self.slot(source).ok()?;
        let snapshot = slot.lock().snapshot();
        Some(snapshot)
    }

    pub fn all_stats(&self) -> BTreeMap<String, SourceStats> {
        self.slots_snapshot()
            .into_iter()
            .map(|(name, slot)| {
                let snap = slot.lock().snapshot();
                (name, snap)
            })
            .collect()
    }

    /// All-time accumulated cost across sources.
    pub fn total_cost(&self) -> f64 {
        self.all_stats().values().map(|s| s.total_cost).sum()
    }

    /// Spend counted against today's ceiling.
    pub fn daily_spend(&self) -> f64 {
        self.shared.spend.lock().spent()
    }

    pub fn max_daily_cost(&self) -> f64 {
        *self.shared.max_daily_cost.lock()
    }

    pub fn set_max_daily_cost(&self, limit: f64) {
        *self.shared.max_daily_cost.lock() = limit;
    }

    pub fn queue_status(&self) -> BTreeMap<String, usize> {
        self.slots_snapshot()
            .into_iter()
            .map(|(name, slot)| {
                let len = slot.lock().queue.len();
                (name, len)
            })
            .collect()
    }

    pub fn is_emergency_active(&self) -> bool {
        self.shared.emergency.load(Ordering::SeqCst)
    }

    pub fn set_emergency_stop(&self, active: bool) {
        let was = self.shared.emergency.swap(active, Ordering::SeqCst);
        if active && !was {
            let spent = self.daily_spend();
            let limit = self.max_daily_cost();
            warn!(target: "limiter", spent, limit, "emergency stop engaged manually");
            self.shared
                .events
                .emit(LimiterEvent::EmergencyStop { spent, limit });
        } else if !active && was {
            info!(target: "limiter", "emergency stop cleared");
        }
    }

    pub fn config(&self, source: &str) -> Option<SourceConfig> {
        let slot = self.slot(source).ok()?;
        let cfg = slot.lock().config.clone();
        Some(cfg)
    }

    /// Apply a partial config update; newly freed capacity is handed to waiters.
    pub fn update_config(&self, source: &str, patch: &SourceConfigPatch) -> ExtractResult<SourceConfig> {
        let slot = self.slot(source)?;
        let mut guard = slot.lock();
        patch.apply(&mut guard.config);
        let updated = guard.config.clone();
        self.drain_locked(&mut guard);
        info!(target: "limiter", source, config = ?updated, "source config updated");
        Ok(updated)
    }

    pub fn sources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.slots.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LimiterEvent> {
        self.shared.events.subscribe()
    }

    fn slots_snapshot(&self) -> Vec<(String, SlotRef)> {
        self.shared
            .slots
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    /// One maintenance pass: prune hour-old history, reject expired waiters.
    /// Returns the number of waiters rejected.
    pub fn run_maintenance(&self) -> usize {
        let now = Instant::now();
        let mut expired = 0;
        for (_, slot) in self.slots_snapshot() {
            let mut guard = slot.lock();
            guard.window.prune(now);
            expired += self.drain_locked(&mut guard);
        }
        expired
    }

    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let expired = service.run_maintenance();
                debug!(target: "limiter", expired, "maintenance pass");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;

    fn service_with(name: &str, cfg: SourceConfig) -> RateLimiterService {
        let mut pc = PipelineConfig::default();
        pc.sources.clear();
        pc.sources.insert(name.to_string(), cfg);
        RateLimiterService::new(pc)
    }

    #[tokio::test]
    async fn unknown_and_disabled_sources_fail_fast() {
        let svc = service_with(
            "off",
            SourceConfig {
                enabled: false,
                ..SourceConfig::default()
            },
        );
        let r: ExtractResult<()> = svc.execute("nope", Priority::Normal, || async { Ok::<_, ExtractError>(()) }).await;
        assert!(matches!(r, Err(ExtractError::UnknownSource(_))));
        let r: ExtractResult<()> = svc.execute("off", Priority::Normal, || async { Ok::<_, ExtractError>(()) }).await;
        assert!(matches!(r, Err(ExtractError::SourceDisabled { .. })));
        assert_eq!(svc.stats("off").unwrap().total_requests, 0);
    }

    #[tokio::test]
    async fn success_updates_stats_and_cost() {
        let svc = service_with(
            "ai",
            SourceConfig {
                cost_per_request: 0.25,
                ..SourceConfig::default()
            },
        );
        let v = svc
            .execute("ai", Priority::High, || async { Ok::<_, ExtractError>(7) })
            .await
            .unwrap();
        assert_eq!(v, 7);
        let st = svc.stats("ai").unwrap();
        assert_eq!(st.total_requests, 1);
        assert_eq!(st.successful_requests, 1);
        assert_eq!(st.current_concurrent, 0);
        assert!(st.last_request_at.is_some());
        assert!((svc.total_cost() - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn update_config_patches_limits() {
        let svc = service_with("crawl", SourceConfig::default());
        let cfg = svc
            .update_config(
                "crawl",
                &SourceConfigPatch {
                    max_concurrent: Some(9),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(cfg.max_concurrent, 9);
        assert_eq!(svc.config("crawl").unwrap().max_concurrent, 9);
        assert!(svc
            .update_config("missing", &SourceConfigPatch::default())
            .is_err());
    }
}
