//! The clock that drives the whole simulation.

use crate::components::bands::BandCursor;
use crate::components::event::Event;
use crate::components::registry::PendingEvents;
use crate::config::{EventFailurePolicy, UniverseConfig, DEFAULT_TIME_RESOLUTION};
use crate::error::UniverseError;
use crate::events::UniverseEvent;
use crate::time::{step_for_resolution, validate_resolution, SimTime, SystemTimeSource, TimeSource};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{yield_now, JoinSet, LocalSet};
use tracing::{debug, error, info, trace, warn};

/// Where a universe is in its run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// No `simulate` call has started yet.
    Idle,
    Running,
    /// A `simulate` call is in progress but the clock is held.
    Paused,
    /// The last `simulate` call ended, at its horizon or with an error. Time
    /// is retained.
    Finished,
}

/// The simulation clock.
///
/// A `Universe` owns virtual time, the events waiting to be started, and the
/// tasks of events already running. It is a cheap handle: clones share the
/// same clock, so one instance built at startup can be passed to every part
/// of the application that needs it.
///
/// Control calls ([`pause`](Self::pause), [`resume`](Self::resume), the
/// realtime toggles, scheduling) may come from anywhere, including other
/// threads. The tick loop itself, [`simulate`](Self::simulate), runs on a
/// single-threaded scheduler: it must be polled inside a
/// [`tokio::task::LocalSet`], and every activated event runs as a local task
/// on that same set.
#[derive(Clone)]
pub struct Universe {
    inner: Arc<Inner>,
}

struct Inner {
    time_source: Arc<dyn TimeSource>,
    resolution: AtomicU32,
    virtual_time: AtomicU64,
    realtime: AtomicBool,
    paused: AtomicBool,
    simulating: AtomicBool,
    finished: AtomicBool,
    ticks: AtomicU64,
    current_priority: AtomicU32,
    pending: PendingEvents,
    anchor: Mutex<Option<RealtimeAnchor>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    ended_at: Mutex<Option<DateTime<Utc>>>,
    tasks: Mutex<JoinSet<()>>,
    failure_policy: EventFailurePolicy,
    notifications: broadcast::Sender<UniverseEvent>,
}

/// Ties clock time to the time source while running in realtime mode.
#[derive(Debug, Clone, Copy)]
struct RealtimeAnchor {
    monotonic: Duration,
    time: SimTime,
}

/// Holds the simulating flag for one `simulate` call.
///
/// However the call ends (horizon reached, an error returned, or the future
/// dropped mid-tick), the run is closed exactly once before the flag clears:
/// any realtime span is committed and the end timestamp is recorded.
struct RunGuard<'a> {
    universe: &'a Universe,
    closed: Option<DateTime<Utc>>,
}

impl<'a> RunGuard<'a> {
    fn acquire(universe: &'a Universe) -> Result<Self, UniverseError> {
        if universe.inner.simulating.swap(true, Ordering::SeqCst) {
            return Err(UniverseError::AlreadySimulating);
        }
        Ok(Self {
            universe,
            closed: None,
        })
    }

    /// Closes the run, returning the recorded end timestamp.
    fn close(&mut self) -> DateTime<Utc> {
        if let Some(ended_at) = self.closed {
            return ended_at;
        }
        let ended_at = self.universe.close_run();
        self.closed = Some(ended_at);
        ended_at
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.close();
        self.universe
            .inner
            .simulating
            .store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// Construction.
impl Universe {
    /// Creates a universe that reads the operating system clocks.
    pub fn new(config: UniverseConfig) -> Result<Self, UniverseError> {
        Self::with_time_source(config, Arc::new(SystemTimeSource::new()))
    }

    /// Creates a universe that reads wall-clock time from `time_source`.
    pub fn with_time_source(
        config: UniverseConfig,
        time_source: Arc<dyn TimeSource>,
    ) -> Result<Self, UniverseError> {
        config.validate()?;
        let resolution = validate_resolution(config.time_resolution)?;
        Ok(Self::from_validated(&config, resolution, time_source))
    }

    fn from_validated(
        config: &UniverseConfig,
        resolution: u32,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(config.notification_capacity);
        Self {
            inner: Arc::new(Inner {
                time_source,
                resolution: AtomicU32::new(resolution),
                virtual_time: AtomicU64::new(0),
                realtime: AtomicBool::new(config.realtime),
                paused: AtomicBool::new(config.start_paused),
                simulating: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                ticks: AtomicU64::new(0),
                current_priority: AtomicU32::new(0),
                pending: PendingEvents::new(),
                anchor: Mutex::new(None),
                started_at: Mutex::new(None),
                ended_at: Mutex::new(None),
                tasks: Mutex::new(JoinSet::new()),
                failure_policy: config.event_failure_policy,
                notifications,
            }),
        }
    }
}

impl Default for Universe {
    fn default() -> Self {
        Self::from_validated(
            &UniverseConfig::default(),
            DEFAULT_TIME_RESOLUTION as u32,
            Arc::new(SystemTimeSource::new()),
        )
    }
}

// The tick loop.
impl Universe {
    /// Runs the clock until its time reaches `until`.
    ///
    /// Each tick starts every pending event as a local task, then walks the
    /// priority bands `0..=max_event_priority`, yielding once per band so the
    /// event tasks can make progress, and yields once more after the last
    /// band. In virtual mode the tick then advances time by exactly one
    /// [`time_step`](Self::time_step); in realtime mode time is read from the
    /// time source instead. While paused, the loop only yields.
    ///
    /// If `until` is not past the current time, no tick runs. Time carries
    /// over between calls, so a later call with a larger horizon continues
    /// where this one stopped.
    ///
    /// Fails with [`UniverseError::AlreadySimulating`] if another call is in
    /// progress on this universe, and with [`UniverseError::EventPanicked`] if
    /// an event panics under [`EventFailurePolicy::Abort`].
    ///
    /// # Panics
    ///
    /// Panics if polled outside of a [`LocalSet`].
    pub async fn simulate(&self, until: SimTime) -> Result<(), UniverseError> {
        let mut guard = RunGuard::acquire(self)?;
        self.inner.finished.store(false, Ordering::SeqCst);

        let started_at = self.inner.time_source.wall_clock();
        *lock(&self.inner.started_at) = Some(started_at);
        *lock(&self.inner.ended_at) = None;

        let from = self.time();
        info!(%from, %until, realtime = self.realtime(), "Simulation starting");
        self.notify(UniverseEvent::SimulationStarted {
            at: started_at,
            from,
            until,
        });

        let ticks_before = self.ticks();
        while self.time() < until {
            if self.paused() {
                yield_now().await;
                continue;
            }

            let activated = self.activate_pending();
            let bands_visited = if self.realtime() {
                self.anchor_realtime();
                let iteration_start = self.realtime_elapsed();
                let visited = self.walk_bands().await;
                let iteration_end = self.realtime_elapsed();
                trace!(%iteration_start, %iteration_end, "Realtime iteration");
                yield_now().await;
                visited
            } else {
                let visited = self.walk_bands().await;
                self.advance_virtual_time();
                yield_now().await;
                visited
            };

            let tick = self.inner.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            self.reap_tasks(tick)?;
            let time = self.time();
            trace!(tick, %time, activated, bands_visited, "Tick completed");
            self.notify(UniverseEvent::TickCompleted {
                tick,
                time,
                activated,
                bands_visited,
            });
        }
        let ended_at = guard.close();

        let time = self.time();
        let ticks = self.ticks() - ticks_before;
        info!(%time, ticks, "Simulation finished");
        self.notify(UniverseEvent::SimulationFinished {
            at: ended_at,
            time,
            ticks,
        });
        Ok(())
    }

    /// Runs [`simulate`](Self::simulate) to completion on a fresh
    /// current-thread runtime, blocking the calling thread. Event tasks still
    /// running when the horizon is reached are dropped with the runtime.
    ///
    /// # Panics
    ///
    /// Panics if called from within an async runtime.
    pub fn run_until(&self, until: SimTime) -> Result<(), UniverseError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let local = LocalSet::new();
        local.block_on(&runtime, self.simulate(until))
    }

    /// Starts every pending event as a local task, in the order they were scheduled.
    fn activate_pending(&self) -> usize {
        let events = self.inner.pending.drain();
        if events.is_empty() {
            return 0;
        }
        let count = events.len();
        let mut tasks = lock(&self.inner.tasks);
        for event in events {
            trace!(label = event.label(), priority = event.priority(), "Activating event");
            tasks.spawn_local(event.activate(self.clone()));
        }
        count
    }

    async fn walk_bands(&self) -> u32 {
        let mut cursor = BandCursor::start(
            &self.inner.current_priority,
            self.inner.pending.max_priority(),
        );
        while let Some(band) = cursor.next_band() {
            trace!(band, "Servicing priority band");
            yield_now().await;
            cursor.advance();
        }
        cursor.visited()
    }

    fn advance_virtual_time(&self) {
        let step = self.time_step();
        let _ = self
            .inner
            .virtual_time
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |nanos| {
                Some(SimTime::from_nanos(nanos).saturating_add(step).as_nanos())
            });
    }

    /// Collects the outcome of event tasks that finished during the tick.
    fn reap_tasks(&self, tick: u64) -> Result<(), UniverseError> {
        let mut tasks = lock(&self.inner.tasks);
        while let Some(outcome) = tasks.try_join_next() {
            let Err(err) = outcome else { continue };
            if !err.is_panic() {
                continue;
            }
            match self.inner.failure_policy {
                EventFailurePolicy::Isolate => {
                    warn!(tick, "Event panicked; its task was torn down");
                    self.notify(UniverseEvent::EventPanicked { tick });
                }
                EventFailurePolicy::Abort => {
                    error!(tick, "Event panicked; aborting simulation");
                    self.notify(UniverseEvent::EventPanicked { tick });
                    return Err(UniverseError::EventPanicked { tick });
                }
            }
        }
        Ok(())
    }

    /// Commits any realtime span and records the end of the current run.
    fn close_run(&self) -> DateTime<Utc> {
        self.commit_realtime();
        let ended_at = self.inner.time_source.wall_clock();
        *lock(&self.inner.ended_at) = Some(ended_at);
        self.inner.finished.store(true, Ordering::SeqCst);
        ended_at
    }

    fn anchor_realtime(&self) {
        let mut anchor = lock(&self.inner.anchor);
        if anchor.is_none() {
            *anchor = Some(RealtimeAnchor {
                monotonic: self.inner.time_source.monotonic(),
                time: self.virtual_time(),
            });
        }
    }

    /// Folds elapsed wall-clock time into virtual time and drops the anchor.
    fn commit_realtime(&self) {
        let anchor = lock(&self.inner.anchor).take();
        if let Some(anchor) = anchor {
            let projected = self.project(anchor);
            self.inner
                .virtual_time
                .fetch_max(projected.as_nanos(), Ordering::SeqCst);
        }
    }

    fn project(&self, anchor: RealtimeAnchor) -> SimTime {
        let elapsed = self
            .inner
            .time_source
            .monotonic()
            .saturating_sub(anchor.monotonic);
        anchor
            .time
            .saturating_add(SimTime::from(elapsed))
            .floor_to(self.time_resolution())
    }

    fn notify(&self, event: UniverseEvent) {
        self.inner.notifications.send(event).ok();
    }
}

// Public control surface.
impl Universe {
    /// Queues `event` to be started at the top of the next tick.
    pub fn schedule_for_activation(&self, event: impl Event) {
        self.schedule_boxed(Box::new(event));
    }

    pub fn schedule_boxed(&self, event: Box<dyn Event>) {
        trace!(label = event.label(), priority = event.priority(), "Event scheduled");
        self.inner.pending.push(event);
    }

    /// Derives clock time from the time source from the next tick on.
    pub fn enable_realtime(&self) {
        if !self.inner.realtime.swap(true, Ordering::SeqCst) {
            debug!("Realtime mode enabled");
            self.notify(UniverseEvent::RealtimeChanged { enabled: true });
        }
    }

    /// Returns to fixed-step virtual time, keeping the time reached so far.
    pub fn disable_realtime(&self) {
        if self.inner.realtime.swap(false, Ordering::SeqCst) {
            self.commit_realtime();
            debug!(time = %self.virtual_time(), "Realtime mode disabled");
            self.notify(UniverseEvent::RealtimeChanged { enabled: false });
        }
    }

    /// Holds the clock at the next tick boundary. A tick already in
    /// progress runs to completion.
    pub fn pause(&self) {
        if self.inner.paused.swap(true, Ordering::SeqCst) {
            warn!("Universe is already paused; ignoring pause()");
            return;
        }
        debug!(time = %self.time(), "Universe paused");
        self.notify(UniverseEvent::Paused);
    }

    pub fn resume(&self) {
        if !self.inner.paused.swap(false, Ordering::SeqCst) {
            warn!("Universe is not paused; ignoring resume()");
            return;
        }
        debug!(time = %self.time(), "Universe resumed");
        self.notify(UniverseEvent::Resumed);
    }

    /// Changes the number of decimal digits of virtual-time precision.
    ///
    /// The time step follows immediately, and the time reached so far is
    /// rounded onto the new grid. Fails if `resolution` is negative or above
    /// [`MAX_TIME_RESOLUTION`](crate::time::MAX_TIME_RESOLUTION), or if a
    /// simulation is running.
    pub fn set_time_resolution(&self, resolution: i64) -> Result<(), UniverseError> {
        let resolution = validate_resolution(resolution)?;
        if self.is_simulating() {
            return Err(UniverseError::ResolutionLocked);
        }
        self.inner.resolution.store(resolution, Ordering::SeqCst);
        let _ = self
            .inner
            .virtual_time
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |nanos| {
                Some(SimTime::from_nanos(nanos).round_to(resolution).as_nanos())
            });
        let time_step = self.time_step();
        debug!(resolution, %time_step, "Time resolution changed");
        self.notify(UniverseEvent::ResolutionChanged {
            resolution,
            time_step,
        });
        Ok(())
    }

    /// Subscribes to the notification stream.
    pub fn subscribe(&self) -> broadcast::Receiver<UniverseEvent> {
        self.inner.notifications.subscribe()
    }
}

// Helpers for code running inside events.
impl Universe {
    /// Yields until the clock is servicing `band` or a later band.
    pub async fn wait_for_band(&self, band: u32) {
        while self.current_event_priority() < band {
            yield_now().await;
        }
    }

    /// Yields until clock time reaches `at`.
    pub async fn sleep_until(&self, at: SimTime) {
        while self.time() < at {
            yield_now().await;
        }
    }

    pub async fn sleep(&self, delay: SimTime) {
        self.sleep_until(self.time().saturating_add(delay)).await;
    }
}

// Read-only state.
impl Universe {
    /// Current clock time: the projected wall-clock time in realtime mode,
    /// the accumulated virtual time otherwise.
    pub fn time(&self) -> SimTime {
        if self.realtime() {
            let anchor = *lock(&self.inner.anchor);
            if let Some(anchor) = anchor {
                return self.project(anchor);
            }
        }
        self.virtual_time()
    }

    /// The fixed-step time, excluding any realtime span not yet committed.
    pub fn virtual_time(&self) -> SimTime {
        SimTime::from_nanos(self.inner.virtual_time.load(Ordering::SeqCst))
    }

    /// Wall-clock time elapsed in the current realtime span, or zero outside one.
    pub fn realtime_elapsed(&self) -> SimTime {
        let anchor = *lock(&self.inner.anchor);
        match anchor {
            Some(anchor) => SimTime::from(
                self.inner
                    .time_source
                    .monotonic()
                    .saturating_sub(anchor.monotonic),
            ),
            None => SimTime::ZERO,
        }
    }

    pub fn time_resolution(&self) -> u32 {
        self.inner.resolution.load(Ordering::SeqCst)
    }

    /// `10^-time_resolution` seconds; derived, never set directly.
    pub fn time_step(&self) -> SimTime {
        step_for_resolution(self.time_resolution())
    }

    pub fn realtime(&self) -> bool {
        self.inner.realtime.load(Ordering::SeqCst)
    }

    pub fn paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn is_simulating(&self) -> bool {
        self.inner.simulating.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> RunStatus {
        if self.is_simulating() {
            if self.paused() {
                RunStatus::Paused
            } else {
                RunStatus::Running
            }
        } else if self.inner.finished.load(Ordering::SeqCst) {
            RunStatus::Finished
        } else {
            RunStatus::Idle
        }
    }

    /// Ticks completed over the universe's lifetime.
    pub fn ticks(&self) -> u64 {
        self.inner.ticks.load(Ordering::SeqCst)
    }

    /// Number of events waiting for the next tick.
    pub fn pending_events(&self) -> usize {
        self.inner.pending.len()
    }

    /// Priorities of the waiting events, in activation order.
    pub fn pending_priorities(&self) -> Vec<u32> {
        self.inner.pending.priorities()
    }

    /// The band being serviced. Past the last band, this is `max_event_priority + 1`.
    pub fn current_event_priority(&self) -> u32 {
        self.inner.current_priority.load(Ordering::SeqCst)
    }

    /// The highest priority of any event ever scheduled.
    pub fn max_event_priority(&self) -> u32 {
        self.inner.pending.max_priority().load(Ordering::SeqCst)
    }

    pub fn simulation_start_time(&self) -> Option<DateTime<Utc>> {
        *lock(&self.inner.started_at)
    }

    pub fn simulation_end_time(&self) -> Option<DateTime<Utc>> {
        *lock(&self.inner.ended_at)
    }
}

impl fmt::Debug for Universe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Universe")
            .field("time", &self.time())
            .field("time_resolution", &self.time_resolution())
            .field("realtime", &self.realtime())
            .field("status", &self.status())
            .field("ticks", &self.ticks())
            .field("pending_events", &self.pending_events())
            .finish()
    }
}
