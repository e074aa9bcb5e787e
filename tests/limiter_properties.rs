// tests/limiter_properties.rs
//
// Behavioural properties of RateLimiterService under simulated time
// (tokio test-util, paused clock).
//
// Covered:
// - concurrency ceiling
// - per-minute ceiling queues excess requests
// - circuit breaker open → half-open → closed
// - queue priority order and expiry
// - retry with non-decreasing backoff; non-retriable errors tried once
// - daily cost ceiling trips the emergency stop for every source
// - cancelled callers give back queue places and reservations
// - hour ceiling holds requests until the window frees up

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use wishlist_extract::limiter::CircuitState;
use wishlist_extract::{
    ExtractError, LimiterEvent, PipelineConfig, Priority, RateLimiterService, SourceConfig,
};

const SRC: &str = "test-source";

fn source(per_minute: u32, max_concurrent: u32) -> SourceConfig {
    SourceConfig {
        max_requests_per_minute: per_minute,
        max_requests_per_hour: 10_000,
        max_concurrent,
        timeout_ms: 600_000,
        max_retries: 1,
        circuit_breaker_threshold: 5,
        cost_per_request: 0.0,
        enabled: true,
    }
}

fn limiter_with(cfg: SourceConfig) -> RateLimiterService {
    let mut pc = PipelineConfig::default();
    pc.sources.clear();
    pc.sources.insert(SRC.to_string(), cfg);
    RateLimiterService::new(pc)
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<LimiterEvent>) -> Vec<LimiterEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn concurrency_never_exceeds_max() {
    let limiter = limiter_with(source(1_000, 2));
    let live = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let l = limiter.clone();
        let live = live.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            l.execute(SRC, Priority::Normal, || {
                let live = live.clone();
                let peak = peak.clone();
                async move {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    live.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, ExtractError>(())
                }
            })
            .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    let st = limiter.stats(SRC).unwrap();
    assert_eq!(st.successful_requests, 8);
    assert_eq!(st.current_concurrent, 0);
    assert_eq!(st.queue_length, 0);
}

#[tokio::test(start_paused = true)]
async fn per_minute_excess_is_queued_not_executed() {
    let limiter = limiter_with(source(3, 10));
    let calls = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let l = limiter.clone();
        let calls = calls.clone();
        handles.push(tokio::spawn(async move {
            l.execute(SRC, Priority::Normal, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ExtractError>(()) }
            })
            .await
        }));
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(limiter.queue_status().get(SRC), Some(&2));

    // The drain timer fires once the first minute's entries age out.
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(limiter.stats(SRC).unwrap().total_requests, 5);
}

#[tokio::test(start_paused = true)]
async fn circuit_opens_at_threshold_then_trial_closes_it() {
    let limiter = limiter_with(SourceConfig {
        circuit_breaker_threshold: 3,
        ..source(100, 2)
    });
    let mut events = limiter.subscribe();
    let calls = AtomicU32::new(0);

    for _ in 0..3 {
        let r: Result<(), _> = limiter
            .execute(SRC, Priority::Normal, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ExtractError::Network("connection reset".into())) }
            })
            .await;
        assert!(matches!(r, Err(ExtractError::Network(_))));
    }
    let st = limiter.stats(SRC).unwrap();
    assert_eq!(st.circuit_state, CircuitState::Open);
    assert_eq!(st.consecutive_failures, 3);

    let r: Result<(), _> = limiter
        .execute(SRC, Priority::High, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ExtractError>(()) }
        })
        .await;
    assert!(matches!(r, Err(ExtractError::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 3, "open circuit must not invoke the op");

    tokio::time::advance(Duration::from_secs(61)).await;

    let r = limiter
        .execute(SRC, Priority::Normal, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ExtractError>("trial") }
        })
        .await;
    assert_eq!(r.unwrap(), "trial");
    let st = limiter.stats(SRC).unwrap();
    assert_eq!(st.circuit_state, CircuitState::Closed);
    assert_eq!(st.consecutive_failures, 0);

    let circuit_events: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                LimiterEvent::CircuitOpened { .. }
                    | LimiterEvent::CircuitHalfOpen { .. }
                    | LimiterEvent::CircuitClosed { .. }
            )
        })
        .collect();
    assert_eq!(
        circuit_events,
        vec![
            LimiterEvent::CircuitOpened {
                source: SRC.into(),
                consecutive_failures: 3
            },
            LimiterEvent::CircuitHalfOpen { source: SRC.into() },
            LimiterEvent::CircuitClosed { source: SRC.into() },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn queued_requests_run_in_priority_order() {
    let limiter = limiter_with(source(100, 1));
    let gate = Arc::new(Notify::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    let blocker = {
        let l = limiter.clone();
        let gate = gate.clone();
        tokio::spawn(async move {
            l.execute(SRC, Priority::Normal, || {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok::<_, ExtractError>(())
                }
            })
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;

    let mut waiters = Vec::new();
    for (label, prio) in [("low", Priority::Low), ("normal", Priority::Normal), ("high", Priority::High)] {
        let l = limiter.clone();
        let order = order.clone();
        waiters.push(tokio::spawn(async move {
            l.execute(SRC, prio, || {
                order.lock().push(label);
                async { Ok::<_, ExtractError>(()) }
            })
            .await
        }));
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(limiter.queue_status().get(SRC), Some(&3));

    gate.notify_one();
    blocker.await.unwrap().unwrap();
    for w in waiters {
        w.await.unwrap().unwrap();
    }
    assert_eq!(*order.lock(), vec!["high", "normal", "low"]);
}

#[tokio::test(start_paused = true)]
async fn unserved_request_expires_without_blocking_later_ones() {
    let limiter = limiter_with(source(100, 1));
    let mut events = limiter.subscribe();

    // Holds the only slot for six minutes.
    let blocker = {
        let l = limiter.clone();
        tokio::spawn(async move {
            l.execute(SRC, Priority::Normal, || async {
                tokio::time::sleep(Duration::from_secs(6 * 60)).await;
                Ok::<_, ExtractError>(())
            })
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;

    let first = {
        let l = limiter.clone();
        tokio::spawn(async move {
            l.execute(SRC, Priority::Normal, || async { Ok::<_, ExtractError>("first") })
                .await
        })
    };
    tokio::time::sleep(Duration::from_secs(4 * 60)).await;
    let second = {
        let l = limiter.clone();
        tokio::spawn(async move {
            l.execute(SRC, Priority::Normal, || async { Ok::<_, ExtractError>("second") })
                .await
        })
    };

    let first = first.await.unwrap();
    assert!(matches!(first, Err(ExtractError::QueueTimeout { .. })));
    assert_eq!(limiter.queue_status().get(SRC), Some(&1));

    blocker.await.unwrap().unwrap();
    assert_eq!(second.await.unwrap().unwrap(), "second");
    assert!(drain_events(&mut events)
        .iter()
        .any(|e| matches!(e, LimiterEvent::QueueTimeout { .. })));
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_with_growing_delays() {
    let limiter = limiter_with(SourceConfig {
        max_retries: 3,
        ..source(100, 1)
    });
    let attempts = Mutex::new(Vec::<Instant>::new());

    let r = limiter
        .execute(SRC, Priority::Normal, || {
            let n = {
                let mut a = attempts.lock();
                a.push(Instant::now());
                a.len()
            };
            async move {
                if n < 3 {
                    Err(ExtractError::Timeout(Duration::from_secs(1)))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
    assert_eq!(r.unwrap(), 42);

    let at = attempts.lock().clone();
    assert_eq!(at.len(), 3);
    let d1 = at[1] - at[0];
    let d2 = at[2] - at[1];
    assert!(d1 >= Duration::from_secs(1), "first backoff {d1:?}");
    assert!(d2 >= d1, "delays must not shrink: {d1:?} then {d2:?}");

    let st = limiter.stats(SRC).unwrap();
    assert_eq!(st.total_requests, 1);
    assert_eq!(st.successful_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn insufficient_credits_is_attempted_exactly_once() {
    let limiter = limiter_with(SourceConfig {
        max_retries: 5,
        ..source(100, 1)
    });
    let calls = AtomicU32::new(0);
    let r: Result<(), _> = limiter
        .execute(SRC, Priority::Normal, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExtractError::InsufficientCredits("0 credits left".into())) }
        })
        .await;
    assert!(matches!(r, Err(ExtractError::InsufficientCredits(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(limiter.stats(SRC).unwrap().failed_requests, 1);
}

#[tokio::test]
async fn daily_cost_ceiling_stops_every_source() {
    let mut pc = PipelineConfig::default();
    pc.sources.clear();
    pc.sources.insert(
        "paid".into(),
        SourceConfig {
            cost_per_request: 0.6,
            ..source(100, 2)
        },
    );
    pc.sources.insert("free".into(), source(100, 2));
    pc.max_daily_cost = 1.0;
    let limiter = RateLimiterService::new(pc);
    let mut events = limiter.subscribe();

    for _ in 0..2 {
        limiter
            .execute("paid", Priority::Normal, || async { Ok::<_, ExtractError>(()) })
            .await
            .unwrap();
    }
    assert!(limiter.is_emergency_active());
    assert!((limiter.total_cost() - 1.2).abs() < 1e-9);

    let calls = AtomicU32::new(0);
    let r: Result<(), _> = limiter
        .execute("free", Priority::High, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ExtractError>(()) }
        })
        .await;
    assert!(matches!(r, Err(ExtractError::EmergencyStop { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(drain_events(&mut events)
        .iter()
        .any(|e| matches!(e, LimiterEvent::EmergencyStop { .. })));

    limiter.set_emergency_stop(false);
    limiter
        .execute("free", Priority::Normal, || async { Ok::<_, ExtractError>(()) })
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn raising_concurrency_at_runtime_admits_waiters() {
    let limiter = limiter_with(source(100, 1));
    let gate = Arc::new(Notify::new());

    let blocker = {
        let l = limiter.clone();
        let gate = gate.clone();
        tokio::spawn(async move {
            l.execute(SRC, Priority::Normal, || {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok::<_, ExtractError>(())
                }
            })
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    let waiter = {
        let l = limiter.clone();
        tokio::spawn(async move {
            l.execute(SRC, Priority::Normal, || async { Ok::<_, ExtractError>(7) })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(limiter.queue_status().get(SRC), Some(&1));

    limiter
        .update_config(
            SRC,
            &wishlist_extract::SourceConfigPatch {
                max_concurrent: Some(2),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(waiter.await.unwrap().unwrap(), 7);

    gate.notify_one();
    blocker.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn cancelled_waiter_hands_back_its_reservation() {
    let limiter = limiter_with(source(1_000, 1));
    let gate = Arc::new(Notify::new());

    let blocker = {
        let l = limiter.clone();
        let gate = gate.clone();
        tokio::spawn(async move {
            l.execute(SRC, Priority::Normal, || {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok::<_, ExtractError>(())
                }
            })
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Polled once so it joins the queue, then never polled again.
    let mut waiter = Box::pin(limiter.execute(SRC, Priority::Normal, || async {
        Ok::<_, ExtractError>(())
    }));
    assert!(tokio::time::timeout(Duration::from_millis(10), &mut waiter)
        .await
        .is_err());
    assert_eq!(limiter.queue_status().get(SRC), Some(&1));

    // Finishing the blocker reserves the slot for the waiter.
    gate.notify_one();
    blocker.await.unwrap().unwrap();
    assert_eq!(limiter.stats(SRC).unwrap().current_concurrent, 1);

    drop(waiter);
    let st = limiter.stats(SRC).unwrap();
    assert_eq!(st.current_concurrent, 0);
    assert_eq!(st.queue_length, 0);
    assert_eq!(st.total_requests, 1);

    let next = tokio::time::timeout(
        Duration::from_secs(1),
        limiter.execute(SRC, Priority::Normal, || async { Ok::<_, ExtractError>(()) }),
    )
    .await;
    assert!(matches!(next, Ok(Ok(()))));
}

#[tokio::test(start_paused = true)]
async fn cancelled_waiter_leaves_the_queue() {
    let limiter = limiter_with(source(1_000, 1));
    let gate = Arc::new(Notify::new());

    let blocker = {
        let l = limiter.clone();
        let gate = gate.clone();
        tokio::spawn(async move {
            l.execute(SRC, Priority::Normal, || {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok::<_, ExtractError>(())
                }
            })
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(10),
        limiter.execute(SRC, Priority::High, || async { Ok::<_, ExtractError>(()) }),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(limiter.queue_status().get(SRC), Some(&0));

    gate.notify_one();
    blocker.await.unwrap().unwrap();
    let st = limiter.stats(SRC).unwrap();
    assert_eq!(st.current_concurrent, 0);
    assert_eq!(st.total_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn hour_ceiling_holds_requests_until_the_oldest_ages_out() {
    let limiter = limiter_with(SourceConfig {
        max_requests_per_hour: 2,
        ..source(100, 5)
    });
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..2 {
        limiter
            .execute(SRC, Priority::Normal, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ExtractError>(()) }
            })
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_secs(3_500)).await;

    let late = {
        let l = limiter.clone();
        let calls = calls.clone();
        tokio::spawn(async move {
            l.execute(SRC, Priority::Normal, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ExtractError>(()) }
            })
            .await
        })
    };

    // Minute window long clear, hour window still full.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(limiter.queue_status().get(SRC), Some(&1));

    // The first two dispatches leave the hour window at t = 3600s.
    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    late.await.unwrap().unwrap();
    assert_eq!(limiter.stats(SRC).unwrap().total_requests, 3);
}

#[tokio::test(start_paused = true)]
async fn retried_trial_reports_half_open_once() {
    let limiter = limiter_with(SourceConfig {
        circuit_breaker_threshold: 3,
        ..source(100, 2)
    });
    let mut events = limiter.subscribe();

    for _ in 0..3 {
        let _ = limiter
            .execute(SRC, Priority::Normal, || async {
                Err::<(), _>(ExtractError::Network("connection reset".into()))
            })
            .await;
    }
    tokio::time::advance(Duration::from_secs(61)).await;

    // The first trial ends without a verdict on the source.
    let r = limiter
        .execute(SRC, Priority::Normal, || async {
            Err::<(), _>(ExtractError::MissingCredentials {
                provider: SRC.into(),
            })
        })
        .await;
    assert!(matches!(r, Err(ExtractError::MissingCredentials { .. })));
    assert_eq!(limiter.stats(SRC).unwrap().circuit_state, CircuitState::HalfOpen);

    limiter
        .execute(SRC, Priority::Normal, || async { Ok::<_, ExtractError>(()) })
        .await
        .unwrap();
    assert_eq!(limiter.stats(SRC).unwrap().circuit_state, CircuitState::Closed);

    let half_open = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, LimiterEvent::CircuitHalfOpen { .. }))
        .count();
    assert_eq!(half_open, 1);
}
