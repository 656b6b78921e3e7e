//! End-to-end shutdown scenarios driven through injected signals.

use async_trait::async_trait;
use futures::future::BoxFuture;
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use warden_server::config::ShutdownConfig;
use warden_server::shutdown::{ChannelSignals, DrainStatus, Signal};
use warden_server::{ManagedApp, ServeLoop, ShutdownCoordinator, ShutdownTrigger};

#[derive(Default)]
struct CountingApp {
    calls: AtomicUsize,
    hang: bool,
}

impl CountingApp {
    fn hanging() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            hang: true,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ManagedApp for CountingApp {
    fn name(&self) -> &str {
        "counting"
    }

    fn cleanup(&self) -> Option<BoxFuture<'_, anyhow::Result<()>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let hang = self.hang;
        Some(Box::pin(async move {
            if hang {
                std::future::pending::<()>().await;
            }
            Ok(())
        }))
    }
}

/// Serves until told to stop accepting, recording whether a drain had
/// already been scheduled at that moment.
struct RecordingServeLoop {
    coordinator: ShutdownCoordinator,
    draining_when_stopped: AtomicBool,
}

#[async_trait]
impl ServeLoop for RecordingServeLoop {
    async fn serve(&self, stop_accepting: CancellationToken) -> anyhow::Result<()> {
        stop_accepting.cancelled().await;
        self.draining_when_stopped
            .store(self.coordinator.is_draining(), Ordering::SeqCst);
        Ok(())
    }
}

/// Panics while building its cleanup future instead of inside it.
struct EagerlyPanickingApp;

impl ManagedApp for EagerlyPanickingApp {
    fn name(&self) -> &str {
        "eager-panic"
    }

    fn cleanup(&self) -> Option<BoxFuture<'_, anyhow::Result<()>>> {
        panic!("cleanup hook could not be built")
    }
}

/// Cleanup that blocks until released, keeping the drain in flight.
#[derive(Default)]
struct GatedApp {
    release: CancellationToken,
    calls: AtomicUsize,
}

impl ManagedApp for GatedApp {
    fn name(&self) -> &str {
        "gated"
    }

    fn cleanup(&self) -> Option<BoxFuture<'_, anyhow::Result<()>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Some(Box::pin(async move {
            self.release.cancelled().await;
            Ok(())
        }))
    }
}

struct FailingServeLoop;

#[async_trait]
impl ServeLoop for FailingServeLoop {
    async fn serve(&self, _stop_accepting: CancellationToken) -> anyhow::Result<()> {
        anyhow::bail!("listener closed unexpectedly")
    }
}

struct PanickingServeLoop;

#[async_trait]
impl ServeLoop for PanickingServeLoop {
    async fn serve(&self, _stop_accepting: CancellationToken) -> anyhow::Result<()> {
        panic!("dispatch bug")
    }
}

struct Harness {
    coordinator: ShutdownCoordinator,
    signals: ChannelSignals,
    app: Arc<CountingApp>,
}

fn harness(config: ShutdownConfig, app: CountingApp, tasks: usize) -> Harness {
    let signals = ChannelSignals::new();
    let app = Arc::new(app);
    let coordinator = ShutdownCoordinator::builder(config)
        .app(app.clone())
        .signals(signals.clone())
        .build();

    for i in 0..tasks {
        coordinator
            .registry()
            .spawn(format!("poller-{i}"), |token| async move {
                token.cancelled().await;
                Ok(())
            })
            .unwrap();
    }

    Harness {
        coordinator,
        signals,
        app,
    }
}

fn send_after(signals: &ChannelSignals, schedule: Vec<(Duration, Signal)>) {
    let sender = signals.sender();
    tokio::spawn(async move {
        for (delay, signal) in schedule {
            tokio::time::sleep(delay).await;
            sender.send(signal);
        }
    });
}

fn recording_loop(coordinator: &ShutdownCoordinator) -> RecordingServeLoop {
    RecordingServeLoop {
        coordinator: coordinator.clone(),
        draining_when_stopped: AtomicBool::new(false),
    }
}

#[tokio::test(start_paused = true)]
async fn test_signal_with_fast_cleanup_drains_all_tasks() {
    let h = harness(ShutdownConfig::default(), CountingApp::default(), 3);
    let serve_loop = recording_loop(&h.coordinator);
    send_after(&h.signals, vec![(Duration::from_millis(50), Signal::Terminate)]);

    let started = Instant::now();
    let report = h.coordinator.run(&serve_loop).await.unwrap();
    let elapsed = started.elapsed();

    let outcome = report.outcome.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(outcome.sweep.acknowledged, 3);
    assert_eq!(h.app.calls(), 1);
    assert!(serve_loop.draining_when_stopped.load(Ordering::SeqCst));
    assert!(elapsed >= Duration::from_millis(550));
    assert!(elapsed < Duration::from_secs(20));
    assert!(h.coordinator.registry().is_empty());
    assert_eq!(h.signals.restore_count(), 1);
    assert!(!h.coordinator.is_draining());
}

#[tokio::test(start_paused = true)]
async fn test_hanging_cleanup_is_abandoned_and_drain_proceeds() {
    let h = harness(ShutdownConfig::default(), CountingApp::hanging(), 3);
    let serve_loop = recording_loop(&h.coordinator);
    send_after(&h.signals, vec![(Duration::ZERO, Signal::Terminate)]);

    let started = Instant::now();
    let report = h.coordinator.run(&serve_loop).await.unwrap();
    let elapsed = started.elapsed();

    let outcome = report.outcome.unwrap();
    assert_eq!(outcome.status, DrainStatus::TimedOut);
    assert_eq!(outcome.sweep.acknowledged, 3);
    assert!(!report.deadline_exceeded);
    assert!(elapsed >= Duration::from_secs(10));
    assert!(elapsed < Duration::from_secs(20));
    assert_eq!(h.signals.restore_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_second_signal_during_drain_is_ignored() {
    let h = harness(ShutdownConfig::default(), CountingApp::default(), 1);
    let serve_loop = recording_loop(&h.coordinator);
    send_after(
        &h.signals,
        vec![
            (Duration::from_millis(10), Signal::Terminate),
            (Duration::from_millis(100), Signal::Interrupt),
        ],
    );

    let report = h.coordinator.run(&serve_loop).await.unwrap();

    assert_eq!(report.drain_cycles, 1);
    assert_eq!(report.trigger, Some(ShutdownTrigger::Signal(Signal::Terminate)));
    assert_eq!(h.app.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disposition_restored_when_deadline_is_exceeded() {
    let config = ShutdownConfig {
        ceiling_secs: 3,
        ..ShutdownConfig::default()
    };
    let h = harness(config, CountingApp::hanging(), 0);
    let serve_loop = recording_loop(&h.coordinator);
    send_after(&h.signals, vec![(Duration::ZERO, Signal::Terminate)]);

    let started = Instant::now();
    let report = h.coordinator.run(&serve_loop).await.unwrap();

    assert!(report.deadline_exceeded);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(h.signals.restore_count(), 1);
    assert!(!h.coordinator.is_draining());
    assert!(!*h.coordinator.drain_in_flight().borrow());
}

#[tokio::test(start_paused = true)]
async fn test_failing_serve_loop_still_drains_and_restores() {
    let h = harness(ShutdownConfig::default(), CountingApp::default(), 2);

    let err = h.coordinator.run(&FailingServeLoop).await.unwrap_err();

    assert!(err.to_string().contains("listener closed"));
    assert_eq!(h.coordinator.drain_cycles(), 1);
    assert_eq!(h.app.calls(), 1);
    assert!(h.coordinator.registry().is_empty());
    assert_eq!(h.signals.restore_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_serve_loop_still_restores() {
    let h = harness(ShutdownConfig::default(), CountingApp::default(), 0);

    let err = h.coordinator.run(&PanickingServeLoop).await.unwrap_err();

    assert!(err.to_string().contains("panicked"));
    assert_eq!(h.coordinator.drain_cycles(), 1);
    assert_eq!(h.signals.restore_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_panicking_before_its_future_still_sweeps_tasks() {
    let signals = ChannelSignals::new();
    let coordinator = ShutdownCoordinator::builder(ShutdownConfig::default())
        .app(Arc::new(EagerlyPanickingApp))
        .signals(signals.clone())
        .build();
    let poller = CancellationToken::new();
    coordinator
        .registry()
        .spawn("poller", {
            let poller = poller.clone();
            move |token| async move {
                token.cancelled().await;
                poller.cancel();
                Ok(())
            }
        })
        .unwrap();
    coordinator.start().unwrap();

    assert!(coordinator.on_signal(Signal::Terminate));
    let report = coordinator.stop().await;

    let outcome = report.outcome.unwrap();
    assert_eq!(outcome.status, DrainStatus::Failed);
    assert!(outcome.message.unwrap().contains("application cleanup panicked"));
    assert_eq!(outcome.sweep.acknowledged, 1);
    assert!(poller.is_cancelled());
    assert!(coordinator.registry().is_empty());
    assert!(!coordinator.is_draining());
    assert_eq!(signals.restore_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_on_multi_thread_runtime_start_one_drain() {
    const CONTENDERS: usize = 8;

    for _ in 0..20 {
        let app = Arc::new(GatedApp::default());
        let config = ShutdownConfig {
            settle_delay_ms: 0,
            ..ShutdownConfig::default()
        };
        let coordinator = ShutdownCoordinator::builder(config)
            .app(app.clone())
            .signals(ChannelSignals::new())
            .build();
        let barrier = Arc::new(tokio::sync::Barrier::new(CONTENDERS));

        let contenders: Vec<_> = (0..CONTENDERS)
            .map(|i| {
                let coordinator = coordinator.clone();
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    let trigger = if i % 2 == 0 {
                        ShutdownTrigger::Signal(Signal::Terminate)
                    } else {
                        ShutdownTrigger::RequestBudget
                    };
                    coordinator.trigger(trigger)
                })
            })
            .collect();

        let mut started = 0;
        for contender in contenders {
            if contender.await.unwrap() {
                started += 1;
            }
        }
        assert_eq!(started, 1);
        assert!(coordinator.is_draining());

        app.release.cancel();
        let report = coordinator.stop().await;

        assert_eq!(report.drain_cycles, 1);
        assert_eq!(app.calls.load(Ordering::SeqCst), 1);
        assert!(report.outcome.unwrap().is_completed());
        assert!(!coordinator.is_draining());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_duplicate_signals_start_one_drain(
        gaps in proptest::collection::vec(0u64..300, 1..12),
        interrupt_first in any::<bool>(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        let (cycles, calls, draining) = runtime.block_on(async move {
            let h = harness(ShutdownConfig::default(), CountingApp::hanging(), 2);
            let serve_loop = recording_loop(&h.coordinator);
            let schedule = gaps
                .iter()
                .enumerate()
                .map(|(i, gap)| {
                    let signal = if (i == 0) == interrupt_first {
                        Signal::Interrupt
                    } else {
                        Signal::Terminate
                    };
                    (Duration::from_millis(*gap), signal)
                })
                .collect();
            send_after(&h.signals, schedule);

            let report = h.coordinator.run(&serve_loop).await.unwrap();
            (report.drain_cycles, h.app.calls(), h.coordinator.is_draining())
        });

        prop_assert_eq!(cycles, 1);
        prop_assert_eq!(calls, 1);
        prop_assert!(!draining);
    }
}
