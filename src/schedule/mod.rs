//! Time-bounded activation of the gateway.
//!
//! Two schedule kinds exist: a daily interval (`HH:MM-HH:MM`, possibly
//! crossing midnight) and a one-shot duration in minutes. Only the
//! parameters are persisted; every arm, restart or recovery recomputes the
//! deadlines from the current wall-clock time.
//!
//! Timer deadlines are delivered as events to a single driver task, so
//! schedule transitions never run concurrently with each other or with an
//! operator edit.

mod clock;
mod plan;
mod timer;

pub use clock::{Clock, SystemClock, to_local};
pub use plan::{IntervalPlan, plan_interval};
pub use timer::{TimerId, TimerWheel};

#[cfg(test)]
pub(crate) use clock::tests::FixedClock;

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Local, NaiveTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::state::{ScheduleState, ScheduleStateFile};

/// Period of the countdown published to observers.
const COUNTDOWN_TICK: StdDuration = StdDuration::from_secs(1);

/// Whatever the schedule switches on and off.
///
/// Schedule-driven transitions are not operator actions and are never
/// routed through the security gate.
pub trait Activation: Send + Sync + 'static {
    fn activate(&self) -> impl Future<Output = Result<()>> + Send;
    fn deactivate(&self) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePhase {
    Idle,
    /// Interval waiting for its next start edge.
    IntervalArmed,
    /// Inside an interval window.
    IntervalActive,
    DurationActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleEdge {
    Start,
    Stop,
}

/// Time left until the next schedule edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Countdown {
    pub edge: ScheduleEdge,
    pub at: DateTime<Local>,
    pub remaining: StdDuration,
}

/// Observable schedule state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleStatus {
    pub phase: SchedulePhase,
    pub start_at: Option<DateTime<Local>>,
    pub stop_at: Option<DateTime<Local>>,
}

impl ScheduleStatus {
    const IDLE: Self = Self {
        phase: SchedulePhase::Idle,
        start_at: None,
        stop_at: None,
    };

    fn next_edge(&self) -> Option<(ScheduleEdge, DateTime<Local>)> {
        match (self.start_at, self.stop_at) {
            (Some(start_at), _) => Some((ScheduleEdge::Start, start_at)),
            (None, Some(stop_at)) => Some((ScheduleEdge::Stop, stop_at)),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    IntervalStart,
    IntervalStop { at: DateTime<Local> },
    DurationStop,
}

#[derive(Debug, Clone, Copy)]
struct TimerEvent {
    kind: TimerKind,
    /// Timers from a replaced or cancelled schedule carry an older generation.
    generation: u64,
}

#[derive(Debug, Default)]
struct Inner {
    generation: u64,
    window: Option<(NaiveTime, NaiveTime)>,
}

pub struct ScheduleEngine<A: Activation> {
    activation: Arc<A>,
    clock: Arc<dyn Clock>,
    store: ScheduleStateFile,
    timers: TimerWheel,
    events: mpsc::UnboundedSender<TimerEvent>,
    inner: AsyncMutex<Inner>,
    status: Mutex<ScheduleStatus>,
    countdown: watch::Sender<Option<Countdown>>,
}

impl<A: Activation> ScheduleEngine<A> {
    /// Create an idle engine and spawn its driver task.
    ///
    /// Must be called from within a tokio runtime. The driver exits once the
    /// returned engine is dropped.
    pub fn new(activation: Arc<A>, clock: Arc<dyn Clock>, store: ScheduleStateFile) -> Arc<Self> {
        let (events, receiver) = mpsc::unbounded_channel();
        let (countdown, _) = watch::channel(None);
        let engine = Arc::new(Self {
            activation,
            timers: TimerWheel::new(Arc::clone(&clock)),
            clock,
            store,
            events,
            inner: AsyncMutex::new(Inner::default()),
            status: Mutex::new(ScheduleStatus::IDLE),
            countdown,
        });
        tokio::spawn(drive(Arc::downgrade(&engine), receiver));
        engine
    }

    pub fn status(&self) -> ScheduleStatus {
        *self.status.lock()
    }

    pub fn phase(&self) -> SchedulePhase {
        self.status.lock().phase
    }

    /// When the gateway is next due to be switched off.
    pub fn pending_stop_at(&self) -> Option<DateTime<Local>> {
        self.status.lock().stop_at
    }

    /// Countdown to the next edge, refreshed every second.
    pub fn countdown(&self) -> watch::Receiver<Option<Countdown>> {
        self.countdown.subscribe()
    }

    /// Arm a daily window from `start` to `end`.
    ///
    /// Replacing an armed schedule needs `authorized`. If now is inside the
    /// window the gateway starts immediately, otherwise it is stopped.
    pub async fn arm_interval(&self, start: NaiveTime, end: NaiveTime, authorized: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.require_authorization(authorized)?;

        self.store.save(&ScheduleState::interval(start, end))?;
        self.reset(&mut inner);
        inner.window = Some((start, end));
        info!(
            start = %start.format("%H:%M"),
            end = %end.format("%H:%M"),
            "interval schedule armed"
        );
        self.plan_window(&mut inner, self.clock.now()).await?;
        self.settle_outside_window().await
    }

    /// Run the gateway now for `minutes`, then stop it and forget the
    /// schedule.
    pub async fn arm_duration(&self, minutes: i64, authorized: bool) -> Result<()> {
        if minutes < 1 {
            return Err(Error::InvalidSchedule(format!(
                "duration must be at least one minute, got {minutes}"
            )));
        }
        let mut inner = self.inner.lock().await;
        self.require_authorization(authorized)?;
        self.start_duration(&mut inner, minutes).await
    }

    /// Drop the armed schedule without touching the gateway.
    pub async fn cancel(&self, authorized: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.require_authorization(authorized)?;

        self.reset(&mut inner);
        self.store.clear()?;
        self.publish(ScheduleStatus::IDLE);
        info!("schedule cancelled");
        Ok(())
    }

    /// Re-arm whatever schedule was persisted before the last exit.
    ///
    /// A persisted interval owns the gateway: outside the window it is
    /// stopped even if it was running. An expired duration is cleared and the
    /// gateway left as it is.
    pub async fn recover(&self) -> Result<SchedulePhase> {
        let Some(state) = self.store.load() else {
            return Ok(SchedulePhase::Idle);
        };
        let mut inner = self.inner.lock().await;

        match state {
            ScheduleState::Interval { start, end, .. } => {
                self.reset(&mut inner);
                inner.window = Some((start, end));
                info!(
                    start = %start.format("%H:%M"),
                    end = %end.format("%H:%M"),
                    "recovering interval schedule"
                );
                self.plan_window(&mut inner, self.clock.now()).await?;
                self.settle_outside_window().await?;
            }
            ScheduleState::Duration { end_at, .. } => {
                let remaining = end_at - self.clock.now().with_timezone(&Utc);
                if remaining <= Duration::zero() {
                    info!(%end_at, "persisted duration already expired");
                    self.store.clear()?;
                    return Ok(SchedulePhase::Idle);
                }
                let minutes = remaining.num_minutes().max(1);
                info!(minutes, "recovering duration schedule");
                self.start_duration(&mut inner, minutes).await?;
            }
        }
        Ok(self.phase())
    }

    fn require_authorization(&self, authorized: bool) -> Result<()> {
        if self.phase() != SchedulePhase::Idle && !authorized {
            warn!("schedule edit refused without authorization");
            return Err(Error::AuthorizationDenied);
        }
        Ok(())
    }

    /// Forget every timer of the current schedule.
    fn reset(&self, inner: &mut Inner) {
        self.timers.cancel_all();
        inner.generation += 1;
        inner.window = None;
    }

    async fn start_duration(&self, inner: &mut Inner, minutes: i64) -> Result<()> {
        let end_at = self.clock.now() + Duration::minutes(minutes);
        self.store
            .save(&ScheduleState::duration(end_at.with_timezone(&Utc)))?;
        self.reset(inner);
        self.arm(end_at, TimerKind::DurationStop, inner.generation);
        self.publish(ScheduleStatus {
            phase: SchedulePhase::DurationActive,
            start_at: None,
            stop_at: Some(end_at),
        });
        info!(minutes, %end_at, "duration schedule armed");

        if let Err(err) = self.activation.activate().await {
            error!(error = %err, "failed to start gateway for duration schedule");
            self.reset(inner);
            if let Err(err) = self.store.clear() {
                warn!(error = %err, "failed to clear schedule state");
            }
            self.publish(ScheduleStatus::IDLE);
            return Err(err);
        }
        Ok(())
    }

    /// Arm the next edges of the interval window as seen from `from`.
    async fn plan_window(&self, inner: &mut Inner, from: DateTime<Local>) -> Result<()> {
        let Some((start, end)) = inner.window else {
            return Ok(());
        };
        let plan = plan_interval(from.naive_local(), start, end);
        let stop_at = to_local(plan.stop_at);
        let start_at = plan.start_at.map(to_local);

        if let Some(start_at) = start_at {
            self.arm(start_at, TimerKind::IntervalStart, inner.generation);
        }
        self.arm(stop_at, TimerKind::IntervalStop { at: stop_at }, inner.generation);

        let phase = if plan.is_active() {
            SchedulePhase::IntervalActive
        } else {
            SchedulePhase::IntervalArmed
        };
        self.publish(ScheduleStatus {
            phase,
            start_at,
            stop_at: Some(stop_at),
        });
        debug!(?start_at, %stop_at, "interval edges armed");

        if plan.is_active() {
            self.activation.activate().await?;
        }
        Ok(())
    }

    /// Stop the gateway when an interval was just armed outside its window.
    async fn settle_outside_window(&self) -> Result<()> {
        if self.phase() != SchedulePhase::IntervalArmed {
            return Ok(());
        }
        debug!("outside the interval window, stopping gateway");
        self.activation.deactivate().await
    }

    fn arm(&self, at: DateTime<Local>, kind: TimerKind, generation: u64) -> TimerId {
        let events = self.events.clone();
        self.timers.arm(at, async move {
            // the receiver only goes away with the engine
            let _ = events.send(TimerEvent { kind, generation });
        })
    }

    async fn on_timer(&self, event: TimerEvent) {
        let mut inner = self.inner.lock().await;
        if event.generation != inner.generation {
            debug!(?event, "ignoring timer of a replaced schedule");
            return;
        }

        match event.kind {
            TimerKind::IntervalStart => {
                let stop_at = self.pending_stop_at();
                self.publish(ScheduleStatus {
                    phase: SchedulePhase::IntervalActive,
                    start_at: None,
                    stop_at,
                });
                info!("interval window opened");
                if let Err(err) = self.activation.activate().await {
                    error!(error = %err, "scheduled start failed");
                }
            }
            TimerKind::IntervalStop { at } => {
                info!("interval window closed");
                if let Err(err) = self.activation.deactivate().await {
                    error!(error = %err, "scheduled stop failed");
                }
                // plan from the edge itself so a timer that fires early can
                // never land inside the window it just closed
                let from = self.clock.now().max(at);
                if let Err(err) = self.plan_window(&mut inner, from).await {
                    error!(error = %err, "failed to re-arm interval schedule");
                }
            }
            TimerKind::DurationStop => {
                info!("duration elapsed");
                if let Err(err) = self.activation.deactivate().await {
                    error!(error = %err, "scheduled stop failed");
                }
                self.reset(&mut inner);
                if let Err(err) = self.store.clear() {
                    warn!(error = %err, "failed to clear schedule state");
                }
                self.publish(ScheduleStatus::IDLE);
            }
        }
    }

    fn publish(&self, status: ScheduleStatus) {
        *self.status.lock() = status;
        self.publish_countdown();
    }

    fn publish_countdown(&self) {
        let next = self.status.lock().next_edge();
        let now = self.clock.now();
        self.countdown.send_replace(next.map(|(edge, at)| Countdown {
            edge,
            at,
            remaining: (at - now).to_std().unwrap_or_default(),
        }));
    }
}

async fn drive<A: Activation>(
    engine: Weak<ScheduleEngine<A>>,
    mut events: mpsc::UnboundedReceiver<TimerEvent>,
) {
    let mut ticker = tokio::time::interval(COUNTDOWN_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = events.recv() => {
                let (Some(event), Some(engine)) = (event, engine.upgrade()) else {
                    break;
                };
                engine.on_timer(event).await;
            }
            _ = ticker.tick() => {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.publish_countdown();
            }
        }
    }
    debug!("schedule driver stopped");
}
