//! End-to-end tests driving the tick loop on a local scheduler.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::{yield_now, LocalSet};

use crate::prelude::*;

fn ms(millis: u64) -> SimTime {
    SimTime::from_millis(millis)
}

async fn run(universe: &Universe, until: SimTime) -> Result<(), UniverseError> {
    LocalSet::new().run_until(universe.simulate(until)).await
}

fn drain(rx: &mut broadcast::Receiver<UniverseEvent>) -> Vec<UniverseEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// `(activated, bands_visited, time)` of every completed tick.
fn tick_summaries(events: &[UniverseEvent]) -> Vec<(usize, u32, SimTime)> {
    events
        .iter()
        .filter_map(|event| match event {
            UniverseEvent::TickCompleted {
                activated,
                bands_visited,
                time,
                ..
            } => Some((*activated, *bands_visited, *time)),
            _ => None,
        })
        .collect()
}

/// Logs the clock time at activation and reschedules itself `remaining - 1` times.
struct Repeater {
    remaining: u32,
    log: Arc<Mutex<Vec<SimTime>>>,
}

impl Event for Repeater {
    fn label(&self) -> &str {
        "repeater"
    }

    fn activate(self: Box<Self>, universe: Universe) -> EventFuture {
        Box::pin(async move {
            self.log.lock().unwrap().push(universe.time());
            if self.remaining > 1 {
                universe.schedule_for_activation(Repeater {
                    remaining: self.remaining - 1,
                    log: self.log.clone(),
                });
            }
        })
    }
}

#[cfg(test)]
mod scenario_tests {
    use super::*;

    #[tokio::test]
    async fn test_virtual_run_without_events() {
        let universe = Universe::default();
        let mut rx = universe.subscribe();

        run(&universe, ms(3)).await.unwrap();

        assert_eq!(universe.time(), ms(3));
        assert_eq!(universe.ticks(), 3);
        assert_eq!(universe.max_event_priority(), 0);
        assert_eq!(universe.status(), RunStatus::Finished);

        let ticks = tick_summaries(&drain(&mut rx));
        assert_eq!(ticks, vec![(0, 1, ms(1)), (0, 1, ms(2)), (0, 1, ms(3))]);
    }

    #[tokio::test]
    async fn test_single_event_walks_its_priority_bands() {
        let universe = Universe::default();
        let mut rx = universe.subscribe();
        let started = Arc::new(Mutex::new(false));

        let flag = started.clone();
        universe.schedule_for_activation(event_fn(2, move |_| async move {
            *flag.lock().unwrap() = true;
        }));

        run(&universe, ms(1)).await.unwrap();

        assert!(*started.lock().unwrap());
        assert_eq!(universe.ticks(), 1);
        assert_eq!(universe.max_event_priority(), 2);
        assert_eq!(universe.current_event_priority(), 3);

        let ticks = tick_summaries(&drain(&mut rx));
        assert_eq!(ticks, vec![(1, 3, ms(1))]);
    }

    #[tokio::test]
    async fn test_realtime_advances_with_the_time_source() {
        let source = Arc::new(ManualTimeSource::with_auto_advance(Duration::from_millis(25)));
        let universe =
            Universe::with_time_source(UniverseConfig::default(), source.clone()).unwrap();
        universe.enable_realtime();

        run(&universe, ms(500)).await.unwrap();

        // Fixed steps would need 500 ticks to get here.
        assert!(universe.ticks() > 0);
        assert!(universe.ticks() < 500);
        assert!(universe.time() >= ms(500));
        // Every reading of the source is a multiple of 25ms, not of the 1ms step.
        assert_eq!(universe.time().as_nanos() % 25_000_000, 0);
        // The realtime span was folded into virtual time when the run ended.
        assert_eq!(universe.time(), universe.virtual_time());
        assert_eq!(universe.realtime_elapsed(), SimTime::ZERO);
    }

    #[tokio::test]
    async fn test_realtime_time_is_elapsed_since_start() {
        let source = Arc::new(ManualTimeSource::new());
        let universe =
            Universe::with_time_source(UniverseConfig::default(), source.clone()).unwrap();
        universe.enable_realtime();

        let local = LocalSet::new();
        let driver = source.clone();
        local.spawn_local(async move {
            loop {
                driver.advance(Duration::from_millis(100));
                yield_now().await;
            }
        });
        local.run_until(universe.simulate(ms(500))).await.unwrap();

        assert!(universe.ticks() < 500);
        assert!(universe.time() >= ms(500));
        assert_eq!(universe.time(), SimTime::from(source.peek()));
    }

    #[tokio::test]
    async fn test_horizon_already_reached_runs_no_ticks() {
        let source = Arc::new(ManualTimeSource::new());
        source.set(Duration::from_secs(60));
        let universe =
            Universe::with_time_source(UniverseConfig::default(), source.clone()).unwrap();

        run(&universe, SimTime::ZERO).await.unwrap();
        assert_eq!(universe.ticks(), 0);
        assert_eq!(
            universe.simulation_start_time(),
            Some(source.wall_clock())
        );

        run(&universe, ms(4)).await.unwrap();
        run(&universe, ms(2)).await.unwrap();
        assert_eq!(universe.ticks(), 4);
        assert_eq!(universe.time(), ms(4));
        assert!(universe.simulation_start_time().is_some());
        assert!(universe.simulation_end_time().is_some());
    }

    #[tokio::test]
    async fn test_runs_continue_from_previous_time() {
        let universe = Universe::default();
        run(&universe, ms(2)).await.unwrap();
        run(&universe, ms(5)).await.unwrap();

        assert_eq!(universe.time(), ms(5));
        assert_eq!(universe.ticks(), 5);
        assert_eq!(universe.status(), RunStatus::Finished);
        assert!(universe.simulation_end_time() >= universe.simulation_start_time());
    }

    #[test]
    fn test_run_until_blocks_to_completion() {
        let universe = Universe::default();
        universe.run_until(ms(2)).unwrap();
        assert_eq!(universe.time(), ms(2));
        assert_eq!(universe.ticks(), 2);
    }
}

#[cfg(test)]
mod ordering_tests {
    use super::*;

    #[tokio::test]
    async fn test_events_start_in_scheduling_order() {
        let universe = Universe::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["a", "b", "c"] {
            let log = log.clone();
            universe.schedule_for_activation(event_fn(0, move |_| async move {
                log.lock().unwrap().push(name);
            }));
        }

        run(&universe, ms(1)).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_bands_are_serviced_in_increasing_order() {
        let universe = Universe::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        for (name, band) in [("high", 2), ("low", 0), ("mid", 1)] {
            let log = log.clone();
            universe.schedule_for_activation(event_fn(band, move |universe| async move {
                universe.wait_for_band(band).await;
                log.lock()
                    .unwrap()
                    .push((name, universe.current_event_priority()));
            }));
        }

        run(&universe, ms(1)).await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![("low", 0), ("mid", 1), ("high", 2)]
        );
    }

    #[tokio::test]
    async fn test_rescheduled_event_runs_on_following_ticks() {
        let universe = Universe::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        universe.schedule_for_activation(Repeater {
            remaining: 3,
            log: log.clone(),
        });

        run(&universe, ms(5)).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![ms(0), ms(1), ms(2)]);
    }

    #[tokio::test]
    async fn test_pending_events_are_drained_by_activation() {
        let universe = Universe::default();
        let seen_pending = Arc::new(Mutex::new(None));

        universe.schedule_for_activation(event_fn(0, |universe| async move {
            universe.sleep(SimTime::from_secs(10)).await;
        }));
        let seen = seen_pending.clone();
        universe.schedule_for_activation(event_fn(0, move |universe| async move {
            *seen.lock().unwrap() = Some(universe.pending_events());
        }));
        assert_eq!(universe.pending_events(), 2);

        run(&universe, ms(1)).await.unwrap();

        assert_eq!(*seen_pending.lock().unwrap(), Some(0));
        assert_eq!(universe.pending_events(), 0);
    }

    #[tokio::test]
    async fn test_sleep_until_wakes_at_the_target_time() {
        let universe = Universe::default();
        let woke_at = Arc::new(Mutex::new(None));

        let slot = woke_at.clone();
        universe.schedule_for_activation(event_fn(0, move |universe| async move {
            universe.sleep_until(ms(2)).await;
            *slot.lock().unwrap() = Some(universe.time());
        }));

        run(&universe, ms(5)).await.unwrap();
        assert_eq!(*woke_at.lock().unwrap(), Some(ms(2)));
    }

    #[tokio::test]
    async fn test_tick_times_increase_by_one_step() {
        let universe = Universe::default();
        let mut rx = universe.subscribe();
        let until = ms(10);

        run(&universe, until).await.unwrap();

        let times: Vec<SimTime> = tick_summaries(&drain(&mut rx))
            .into_iter()
            .map(|(_, _, time)| time)
            .collect();
        let expected: Vec<SimTime> = (1..=10).map(ms).collect();
        assert_eq!(times, expected);
        assert!(times.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(times.iter().all(|time| *time <= until));
    }
}

#[cfg(test)]
mod control_tests {
    use super::*;

    #[tokio::test]
    async fn test_paused_universe_holds_until_resumed() {
        let config = UniverseConfig {
            start_paused: true,
            ..Default::default()
        };
        let universe = Universe::new(config).unwrap();
        let seen = Rc::new(RefCell::new(None));

        let local = LocalSet::new();
        let observer = universe.clone();
        let slot = seen.clone();
        local.spawn_local(async move {
            for _ in 0..20 {
                yield_now().await;
            }
            *slot.borrow_mut() = Some((observer.ticks(), observer.time(), observer.status()));
            observer.resume();
        });
        local.run_until(universe.simulate(ms(3))).await.unwrap();

        assert_eq!(*seen.borrow(), Some((0, SimTime::ZERO, RunStatus::Paused)));
        assert_eq!(universe.ticks(), 3);
        assert_eq!(universe.time(), ms(3));
    }

    #[tokio::test]
    async fn test_pause_waits_for_the_tick_in_progress() {
        let universe = Universe::default();
        let seen = Rc::new(RefCell::new(None));

        universe.schedule_for_activation(event_fn(0, |universe| async move {
            universe.pause();
        }));

        let local = LocalSet::new();
        let observer = universe.clone();
        let slot = seen.clone();
        local.spawn_local(async move {
            for _ in 0..20 {
                yield_now().await;
            }
            *slot.borrow_mut() = Some((observer.ticks(), observer.time()));
            observer.resume();
        });
        local.run_until(universe.simulate(ms(3))).await.unwrap();

        assert_eq!(*seen.borrow(), Some((1, ms(1))));
        assert_eq!(universe.time(), ms(3));
    }

    #[tokio::test]
    async fn test_concurrent_simulate_is_rejected() {
        let universe = Universe::default();

        LocalSet::new()
            .run_until(async {
                let first = tokio::task::spawn_local({
                    let universe = universe.clone();
                    async move { universe.simulate(ms(20)).await }
                });
                yield_now().await;
                assert!(universe.is_simulating());

                assert!(matches!(
                    universe.simulate(ms(40)).await,
                    Err(UniverseError::AlreadySimulating)
                ));
                assert!(matches!(
                    universe.set_time_resolution(4),
                    Err(UniverseError::ResolutionLocked)
                ));

                first.await.unwrap().unwrap();
            })
            .await;

        assert!(!universe.is_simulating());
        assert_eq!(universe.time(), ms(20));
        assert_eq!(universe.time_resolution(), 3);
    }

    #[tokio::test]
    async fn test_panicking_event_is_isolated_by_default() {
        let universe = Universe::default();
        let mut rx = universe.subscribe();
        universe.schedule_for_activation(event_fn(0, |_| async {
            panic!("event failure");
        }));

        run(&universe, ms(3)).await.unwrap();

        assert_eq!(universe.ticks(), 3);
        let events = drain(&mut rx);
        assert!(events.contains(&UniverseEvent::EventPanicked { tick: 1 }));
    }

    #[tokio::test]
    async fn test_panicking_event_aborts_under_abort_policy() {
        let config = UniverseConfig {
            event_failure_policy: EventFailurePolicy::Abort,
            ..Default::default()
        };
        let universe = Universe::new(config).unwrap();
        universe.schedule_for_activation(event_fn(0, |_| async {
            panic!("event failure");
        }));

        let result = run(&universe, ms(3)).await;

        assert!(matches!(result, Err(UniverseError::EventPanicked { tick: 1 })));
        assert!(!universe.is_simulating());
        assert_eq!(universe.ticks(), 1);
    }

    #[tokio::test]
    async fn test_aborted_realtime_run_is_closed_out() {
        let source = Arc::new(ManualTimeSource::new());
        let config = UniverseConfig {
            realtime: true,
            event_failure_policy: EventFailurePolicy::Abort,
            ..Default::default()
        };
        let universe = Universe::with_time_source(config, source.clone()).unwrap();
        universe.schedule_for_activation(event_fn(0, |_| async {
            panic!("event failure");
        }));

        let result = run(&universe, ms(3)).await;
        assert!(matches!(result, Err(UniverseError::EventPanicked { tick: 1 })));

        assert!(universe.simulation_end_time().is_some());
        assert_eq!(universe.status(), RunStatus::Finished);
        assert_eq!(universe.realtime_elapsed(), SimTime::ZERO);

        // With the span committed, idle wall-clock time does not leak into the clock.
        let reached = universe.time();
        source.advance(Duration::from_secs(10));
        assert_eq!(universe.time(), reached);
    }

    #[tokio::test]
    async fn test_dropped_realtime_run_is_closed_out() {
        let source = Arc::new(ManualTimeSource::new());
        let universe =
            Universe::with_time_source(UniverseConfig::default(), source.clone()).unwrap();
        universe.enable_realtime();

        let local = LocalSet::new();
        local
            .run_until(async {
                tokio::select! {
                    _ = universe.simulate(SimTime::MAX) => {}
                    _ = async {
                        for _ in 0..20 {
                            source.advance(Duration::from_millis(1));
                            yield_now().await;
                        }
                    } => {}
                }
            })
            .await;

        assert!(!universe.is_simulating());
        assert!(universe.simulation_end_time().is_some());
        let reached = universe.time();
        assert_eq!(reached, universe.virtual_time());
        source.advance(Duration::from_secs(10));
        assert_eq!(universe.time(), reached);
    }

    #[tokio::test]
    async fn test_switching_back_to_virtual_time_continues_from_realtime() {
        let source = Arc::new(ManualTimeSource::with_auto_advance(Duration::from_millis(40)));
        let universe =
            Universe::with_time_source(UniverseConfig::default(), source.clone()).unwrap();
        let mut rx = universe.subscribe();

        universe.enable_realtime();
        run(&universe, ms(200)).await.unwrap();
        let reached = universe.time();
        assert!(reached >= ms(200));

        universe.disable_realtime();
        let ticks = universe.ticks();
        run(&universe, reached.saturating_add(ms(3))).await.unwrap();

        assert_eq!(universe.ticks() - ticks, 3);
        assert_eq!(universe.time(), reached.saturating_add(ms(3)));
        assert!(drain(&mut rx).contains(&UniverseEvent::RealtimeChanged { enabled: false }));
    }
}
