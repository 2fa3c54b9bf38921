//! Poll scheduler
//!
//! `PollState` is a pure state machine: it receives events and returns the
//! action to execute, with no I/O. `run` owns the repeating timer and the
//! in-flight fetch and executes those actions, publishing a `PollSnapshot`
//! on a watch channel after every completed fetch.
//!
//! Cadence: the normal interval applies until a fetch reports 5h
//! utilization at or above the threshold, then the elevated one. A failed
//! fetch keeps whatever interval was in effect.

use std::sync::Arc;
use std::time::Duration;

use anthropic_quota::{QuotaInfo, QuotaSource};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metrics;

/// Interval selection policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub normal: Duration,
    pub elevated: Duration,
    pub threshold: f64,
}

impl PollPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            normal: config.normal_interval(),
            elevated: config.elevated_interval(),
            threshold: config.poll.elevated_threshold,
        }
    }

    pub fn interval_for(&self, utilization_5h: f64) -> Duration {
        if utilization_5h >= self.threshold {
            self.elevated
        } else {
            self.normal
        }
    }
}

/// Read-only view handed to consumers after each completed fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PollSnapshot {
    /// Latest successful quota, kept across later failures
    pub quota: Option<QuotaInfo>,
    /// Error from the most recent fetch, cleared by the next success
    pub error: Option<String>,
    pub interval_secs: u64,
    /// When the most recent fetch completed, success or not
    pub updated_at: Option<DateTime<Utc>>,
}

impl PollSnapshot {
    /// A fetch has completed and the last one succeeded.
    pub fn is_healthy(&self) -> bool {
        self.updated_at.is_some() && self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Polling,
}

#[derive(Debug)]
pub enum PollEvent {
    /// Timer fired or a manual refresh was requested
    Tick,
    FetchSucceeded(QuotaInfo),
    FetchFailed(String),
}

/// Actions the caller should execute after a transition
#[derive(Debug, PartialEq)]
pub enum PollAction {
    StartFetch,
    /// A fetch is already outstanding
    SkipTick,
    Publish,
    /// Publish, then restart the timer at `interval`
    Reschedule { interval: Duration },
}

#[derive(Debug)]
pub struct PollState {
    policy: PollPolicy,
    phase: Phase,
    interval: Duration,
    quota: Option<QuotaInfo>,
    error: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    skipped: u64,
}

impl PollState {
    pub fn new(policy: PollPolicy) -> Self {
        Self {
            policy,
            phase: Phase::Idle,
            interval: policy.normal,
            quota: None,
            error: None,
            updated_at: None,
            skipped: 0,
        }
    }

    /// Handle a state transition. Pure apart from reading the wall clock for
    /// `updated_at`.
    pub fn handle(&mut self, event: PollEvent) -> PollAction {
        match (self.phase, event) {
            (Phase::Idle, PollEvent::Tick) => {
                self.phase = Phase::Polling;
                PollAction::StartFetch
            }
            (Phase::Polling, PollEvent::Tick) => {
                self.skipped += 1;
                PollAction::SkipTick
            }
            (_, PollEvent::FetchSucceeded(quota)) => {
                self.phase = Phase::Idle;
                let next = self.policy.interval_for(quota.utilization_5h);
                self.quota = Some(quota);
                self.error = None;
                self.updated_at = Some(Utc::now());
                if next != self.interval {
                    self.interval = next;
                    PollAction::Reschedule { interval: next }
                } else {
                    PollAction::Publish
                }
            }
            (_, PollEvent::FetchFailed(error)) => {
                self.phase = Phase::Idle;
                self.error = Some(error);
                self.updated_at = Some(Utc::now());
                PollAction::Publish
            }
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn snapshot(&self) -> PollSnapshot {
        PollSnapshot {
            quota: self.quota.clone(),
            error: self.error.clone(),
            interval_secs: self.interval.as_secs(),
            updated_at: self.updated_at,
        }
    }
}

/// The one repeating timer driving ticks.
///
/// Rescheduling replaces the underlying `Interval`, so there is never more
/// than one live timer; asking for the current period is a no-op.
pub struct PollTimer {
    interval: Interval,
    period: Duration,
    generation: u64,
}

impl PollTimer {
    /// Start ticking at `period`. The first tick completes immediately.
    pub fn start(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval,
            period,
            generation: 1,
        }
    }

    /// Restart at `period`, first tick one full period from now. Returns
    /// whether anything changed.
    pub fn reschedule(&mut self, period: Duration) -> bool {
        if period == self.period {
            return false;
        }
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = interval;
        self.period = period;
        self.generation += 1;
        true
    }

    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Number of timers created so far, including the current one.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Requests an immediate fetch, subject to the same in-flight guard as
/// timer ticks. Requests made while one is pending collapse into one.
#[derive(Clone, Default)]
pub struct RefreshTrigger(Arc<Notify>);

impl RefreshTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refresh_now(&self) {
        self.0.notify_one();
    }

    /// Resolve once a refresh has been requested.
    pub async fn requested(&self) {
        self.0.notified().await;
    }
}

/// Owner-side handle of a running scheduler.
pub struct SchedulerHandle {
    snapshots: watch::Receiver<PollSnapshot>,
    trigger: RefreshTrigger,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn refresh_now(&self) {
        self.trigger.refresh_now();
    }

    pub fn trigger(&self) -> RefreshTrigger {
        self.trigger.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollSnapshot> {
        self.snapshots.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

/// Spawn the scheduler loop. The first fetch starts immediately.
pub fn spawn(source: Arc<dyn QuotaSource>, policy: PollPolicy) -> SchedulerHandle {
    let state = PollState::new(policy);
    let (tx, rx) = watch::channel(state.snapshot());
    let trigger = RefreshTrigger::new();
    let task = tokio::spawn(run(source, state, tx, trigger.clone()));
    SchedulerHandle {
        snapshots: rx,
        trigger,
        task,
    }
}

type FetchTask = JoinHandle<anthropic_quota::Result<QuotaInfo>>;

async fn run(
    source: Arc<dyn QuotaSource>,
    mut state: PollState,
    tx: watch::Sender<PollSnapshot>,
    manual: RefreshTrigger,
) {
    let mut timer = PollTimer::start(state.interval());
    let mut fetch: Option<FetchTask> = None;
    metrics::set_poll_interval(state.interval());
    info!(
        interval_secs = state.interval().as_secs(),
        "poll scheduler started"
    );

    loop {
        let event = tokio::select! {
            _ = timer.tick() => PollEvent::Tick,
            _ = manual.requested() => {
                debug!("manual refresh requested");
                PollEvent::Tick
            }
            result = join_fetch(&mut fetch) => match result {
                Ok(quota) => PollEvent::FetchSucceeded(quota),
                Err(error) => PollEvent::FetchFailed(error),
            },
        };

        match &event {
            PollEvent::FetchSucceeded(quota) => {
                debug!(utilization_5h = quota.utilization_5h, "quota fetched");
                metrics::record_fetch(Some(quota));
            }
            PollEvent::FetchFailed(error) => {
                warn!(error = %error, "quota fetch failed");
                metrics::record_fetch(None);
            }
            PollEvent::Tick => {}
        }

        match state.handle(event) {
            PollAction::StartFetch => {
                let source = source.clone();
                fetch = Some(tokio::spawn(async move { source.fetch_quota().await }));
            }
            PollAction::SkipTick => {
                debug!(skipped = state.skipped(), "fetch in flight, skipping tick");
                metrics::record_skipped_tick();
            }
            PollAction::Publish => {
                tx.send_replace(state.snapshot());
            }
            PollAction::Reschedule { interval } => {
                timer.reschedule(interval);
                metrics::set_poll_interval(interval);
                info!(interval_secs = interval.as_secs(), "poll interval changed");
                tx.send_replace(state.snapshot());
            }
        }
    }
}

/// Resolve when the outstanding fetch finishes; pending forever if none.
///
/// Clears `fetch` on completion. Dropping this future leaves the task in
/// place for the next call.
async fn join_fetch(fetch: &mut Option<FetchTask>) -> Result<QuotaInfo, String> {
    let Some(handle) = fetch.as_mut() else {
        return std::future::pending().await;
    };
    let result = handle.await;
    *fetch = None;
    match result {
        Ok(Ok(quota)) => Ok(quota),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("fetch task failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anthropic_auth::BoxFuture;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const NORMAL: Duration = Duration::from_secs(120);
    const ELEVATED: Duration = Duration::from_secs(30);

    fn policy() -> PollPolicy {
        PollPolicy {
            normal: NORMAL,
            elevated: ELEVATED,
            threshold: 0.75,
        }
    }

    fn quota(utilization_5h: f64) -> QuotaInfo {
        QuotaInfo {
            utilization_5h,
            utilization_7d: 0.0,
            status: None,
            representative_claim: None,
            fallback_percentage: None,
            reset_at: None,
        }
    }

    /// Scripted source. `None` entries fail with `CredentialNotFound`; the
    /// last entry repeats.
    struct FakeSource {
        script: Mutex<VecDeque<Option<f64>>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl FakeSource {
        fn new(script: &[Option<f64>]) -> Arc<Self> {
            Self::with_delay(script, Duration::ZERO)
        }

        fn with_delay(script: &[Option<f64>], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
                calls: AtomicUsize::new(0),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn next(&self) -> Option<f64> {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                *script.front().unwrap()
            }
        }
    }

    impl QuotaSource for FakeSource {
        fn fetch_quota(&self) -> BoxFuture<'_, anthropic_quota::Result<QuotaInfo>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                match self.next() {
                    Some(u) => Ok(quota(u)),
                    None => Err(anthropic_auth::Error::CredentialNotFound.into()),
                }
            })
        }
    }

    async fn next_snapshot(rx: &mut watch::Receiver<PollSnapshot>) -> PollSnapshot {
        rx.changed().await.unwrap();
        rx.borrow_and_update().clone()
    }

    // --- PollPolicy ---

    #[test]
    fn high_utilization_selects_elevated_interval() {
        assert_eq!(policy().interval_for(0.80), ELEVATED);
        assert_eq!(policy().interval_for(0.75), ELEVATED);
        assert_eq!(policy().interval_for(1.3), ELEVATED);
    }

    #[test]
    fn low_utilization_selects_normal_interval() {
        assert_eq!(policy().interval_for(0.10), NORMAL);
        assert_eq!(policy().interval_for(0.7499), NORMAL);
    }

    // --- PollState ---

    #[test]
    fn tick_while_idle_starts_fetch() {
        let mut state = PollState::new(policy());
        assert_eq!(state.handle(PollEvent::Tick), PollAction::StartFetch);
        assert_eq!(state.phase(), Phase::Polling);
    }

    #[test]
    fn tick_while_polling_is_skipped() {
        let mut state = PollState::new(policy());
        state.handle(PollEvent::Tick);

        assert_eq!(state.handle(PollEvent::Tick), PollAction::SkipTick);
        assert_eq!(state.handle(PollEvent::Tick), PollAction::SkipTick);
        assert_eq!(state.skipped(), 2);
        assert_eq!(state.phase(), Phase::Polling);
    }

    #[test]
    fn success_above_threshold_reschedules_once() {
        let mut state = PollState::new(policy());
        state.handle(PollEvent::Tick);

        let action = state.handle(PollEvent::FetchSucceeded(quota(0.91)));
        assert_eq!(action, PollAction::Reschedule { interval: ELEVATED });

        state.handle(PollEvent::Tick);
        let action = state.handle(PollEvent::FetchSucceeded(quota(0.85)));
        assert_eq!(action, PollAction::Publish, "same interval must not reschedule");
        assert_eq!(state.interval(), ELEVATED);
    }

    #[test]
    fn success_below_threshold_returns_to_normal() {
        let mut state = PollState::new(policy());
        state.handle(PollEvent::Tick);
        state.handle(PollEvent::FetchSucceeded(quota(0.9)));
        state.handle(PollEvent::Tick);

        let action = state.handle(PollEvent::FetchSucceeded(quota(0.10)));

        assert_eq!(action, PollAction::Reschedule { interval: NORMAL });
        assert_eq!(state.snapshot().interval_secs, 120);
    }

    #[test]
    fn failure_keeps_interval_and_last_quota() {
        let mut state = PollState::new(policy());
        state.handle(PollEvent::Tick);
        state.handle(PollEvent::FetchSucceeded(quota(0.9)));
        state.handle(PollEvent::Tick);

        let action = state.handle(PollEvent::FetchFailed("boom".into()));

        assert_eq!(action, PollAction::Publish);
        assert_eq!(state.phase(), Phase::Idle);
        let snapshot = state.snapshot();
        assert_eq!(snapshot.interval_secs, 30);
        assert_eq!(snapshot.error.as_deref(), Some("boom"));
        assert_eq!(snapshot.quota.unwrap().utilization_5h, 0.9);
        assert!(!state.snapshot().is_healthy());
    }

    #[test]
    fn success_clears_previous_error() {
        let mut state = PollState::new(policy());
        state.handle(PollEvent::Tick);
        state.handle(PollEvent::FetchFailed("boom".into()));
        state.handle(PollEvent::Tick);
        state.handle(PollEvent::FetchSucceeded(quota(0.2)));

        let snapshot = state.snapshot();
        assert!(snapshot.error.is_none());
        assert!(snapshot.is_healthy());
    }

    #[test]
    fn initial_snapshot_is_not_healthy() {
        let snapshot = PollState::new(policy()).snapshot();
        assert!(snapshot.quota.is_none());
        assert!(snapshot.updated_at.is_none());
        assert!(!snapshot.is_healthy());
        assert_eq!(snapshot.interval_secs, 120);
    }

    // --- PollTimer ---

    #[tokio::test(start_paused = true)]
    async fn rescheduling_same_period_keeps_single_timer() {
        let mut timer = PollTimer::start(NORMAL);

        assert!(!timer.reschedule(NORMAL));
        assert_eq!(timer.generation(), 1);

        assert!(timer.reschedule(ELEVATED));
        assert!(!timer.reschedule(ELEVATED));
        assert_eq!(timer.generation(), 2);
        assert_eq!(timer.period(), ELEVATED);
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_is_immediate_and_reschedule_waits_full_period() {
        let start = Instant::now();
        let mut timer = PollTimer::start(NORMAL);

        timer.tick().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        timer.reschedule(ELEVATED);
        timer.tick().await;
        assert_eq!(start.elapsed(), ELEVATED);
    }

    // --- Scheduler loop ---

    #[tokio::test(start_paused = true)]
    async fn first_fetch_happens_at_startup() {
        let source = FakeSource::new(&[Some(0.1)]);
        let start = Instant::now();
        let handle = spawn(source.clone(), policy());
        let mut rx = handle.subscribe();

        let snapshot = next_snapshot(&mut rx).await;

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(snapshot.quota.unwrap().utilization_5h, 0.1);
        assert_eq!(source.calls(), 1);
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn high_utilization_polls_at_elevated_cadence() {
        let source = FakeSource::new(&[Some(0.91)]);
        let handle = spawn(source.clone(), policy());
        let mut rx = handle.subscribe();

        let first = next_snapshot(&mut rx).await;
        let t1 = Instant::now();
        assert_eq!(first.interval_secs, 30);

        next_snapshot(&mut rx).await;
        assert_eq!(t1.elapsed(), ELEVATED);
        assert_eq!(source.calls(), 2);
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn low_utilization_polls_at_normal_cadence() {
        let source = FakeSource::new(&[Some(0.10)]);
        let handle = spawn(source.clone(), policy());
        let mut rx = handle.subscribe();

        let first = next_snapshot(&mut rx).await;
        let t1 = Instant::now();
        assert_eq!(first.interval_secs, 120);

        next_snapshot(&mut rx).await;
        assert_eq!(t1.elapsed(), NORMAL);
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_credentials_are_published_and_retried() {
        let source = FakeSource::new(&[None]);
        let handle = spawn(source.clone(), policy());
        let mut rx = handle.subscribe();

        let first = next_snapshot(&mut rx).await;
        assert!(
            first.error.as_deref().unwrap().contains("credentials not found"),
            "got: {:?}",
            first.error
        );
        assert!(first.quota.is_none());
        assert!(handle.is_running());

        let second = next_snapshot(&mut rx).await;
        assert!(second.error.is_some());
        assert_eq!(source.calls(), 2);
        assert!(handle.is_running());
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_success_keeps_cadence_and_quota() {
        let source = FakeSource::new(&[Some(0.91), None]);
        let handle = spawn(source.clone(), policy());
        let mut rx = handle.subscribe();

        next_snapshot(&mut rx).await;
        let t1 = Instant::now();
        let failed = next_snapshot(&mut rx).await;

        assert_eq!(t1.elapsed(), ELEVATED);
        assert_eq!(failed.interval_secs, 30);
        assert!(failed.error.is_some());
        assert_eq!(failed.quota.unwrap().utilization_5h, 0.91);

        let t2 = Instant::now();
        next_snapshot(&mut rx).await;
        assert_eq!(t2.elapsed(), ELEVATED, "error must not change cadence");
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_does_not_overlap() {
        let source = FakeSource::with_delay(&[Some(0.1)], Duration::from_secs(25));
        let fast = PollPolicy {
            normal: Duration::from_secs(10),
            elevated: Duration::from_secs(5),
            threshold: 0.75,
        };
        let handle = spawn(source.clone(), fast);
        let mut rx = handle.subscribe();

        next_snapshot(&mut rx).await;

        assert_eq!(source.calls(), 1, "ticks during the fetch must be skipped");
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn manual_refresh_fetches_immediately() {
        let source = FakeSource::new(&[Some(0.2)]);
        let handle = spawn(source.clone(), policy());
        let mut rx = handle.subscribe();
        next_snapshot(&mut rx).await;
        let t1 = Instant::now();

        handle.refresh_now();
        next_snapshot(&mut rx).await;

        assert!(t1.elapsed() < Duration::from_secs(1));
        assert_eq!(source.calls(), 2);
        handle.stop();
    }
}
