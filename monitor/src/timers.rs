//! Per-session timers.
//!
//! Every deadline and interval a monitor uses lives in one [`TimerSet`] owned
//! by the monitor's driver task. Nothing is registered globally, so dropping
//! or clearing the set is enough to guarantee that no timer fires afterwards.

use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior, Sleep};

/// A timer that elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// The push connection did not open in time.
    ConnectDeadline,
    /// The session did not reach a terminal state in time.
    Watchdog,
    /// Time for a fallback status poll.
    StatusPoll,
    /// Time for a job list refresh.
    ListRefresh,
    /// Polling window is over; both intervals have been dropped.
    PollCeiling,
    /// Grace delay after a terminal transition has passed.
    Teardown,
}

/// The outstanding timers of one session.
#[derive(Debug, Default)]
pub struct TimerSet {
    connect_deadline: Option<Pin<Box<Sleep>>>,
    watchdog: Option<Pin<Box<Sleep>>>,
    poll_ceiling: Option<Pin<Box<Sleep>>>,
    teardown: Option<Pin<Box<Sleep>>>,
    status_poll: Option<Interval>,
    list_refresh: Option<Interval>,
}

fn deadline(after: Duration) -> Option<Pin<Box<Sleep>>> {
    Some(Box::pin(time::sleep(after)))
}

fn ticker(period: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

fn poll_once(slot: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    let fired = slot
        .as_mut()
        .is_some_and(|sleep| sleep.as_mut().poll(cx).is_ready());
    if fired {
        *slot = None;
    }
    fired
}

fn poll_tick(slot: &mut Option<Interval>, cx: &mut Context<'_>) -> bool {
    slot.as_mut()
        .is_some_and(|interval| interval.poll_tick(cx).is_ready())
}

impl TimerSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm_connect_deadline(&mut self, after: Duration) {
        self.connect_deadline = deadline(after);
    }

    pub fn arm_watchdog(&mut self, after: Duration) {
        self.watchdog = deadline(after);
    }

    /// Starts both polling intervals and the ceiling that ends them.
    ///
    /// The first tick of each interval comes one full period after arming.
    pub fn arm_polling(&mut self, status_every: Duration, list_every: Duration, ceiling: Duration) {
        self.status_poll = Some(ticker(status_every));
        self.list_refresh = Some(ticker(list_every));
        self.poll_ceiling = deadline(ceiling);
    }

    /// Schedules teardown, replacing any earlier schedule.
    pub fn arm_teardown(&mut self, after: Duration) {
        self.teardown = deadline(after);
    }

    pub fn cancel_connect_deadline(&mut self) {
        self.connect_deadline = None;
    }

    pub fn cancel_watchdog(&mut self) {
        self.watchdog = None;
    }

    pub fn cancel_polling(&mut self) {
        self.status_poll = None;
        self.list_refresh = None;
        self.poll_ceiling = None;
    }

    /// Cancels every timer.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Number of armed timers.
    #[must_use]
    pub fn pending(&self) -> usize {
        [
            self.connect_deadline.is_some(),
            self.watchdog.is_some(),
            self.poll_ceiling.is_some(),
            self.teardown.is_some(),
            self.status_poll.is_some(),
            self.list_refresh.is_some(),
        ]
        .into_iter()
        .filter(|armed| *armed)
        .count()
    }

    /// Polls for the next elapsed timer.
    ///
    /// One-shot timers are disarmed when they fire. Teardown is checked first
    /// so a scheduled close is never starved. With nothing armed this stays
    /// pending forever.
    pub fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<TimerEvent> {
        if poll_once(&mut self.teardown, cx) {
            return Poll::Ready(TimerEvent::Teardown);
        }
        if poll_once(&mut self.connect_deadline, cx) {
            return Poll::Ready(TimerEvent::ConnectDeadline);
        }
        if poll_once(&mut self.watchdog, cx) {
            return Poll::Ready(TimerEvent::Watchdog);
        }
        if poll_once(&mut self.poll_ceiling, cx) {
            self.status_poll = None;
            self.list_refresh = None;
            return Poll::Ready(TimerEvent::PollCeiling);
        }
        if poll_tick(&mut self.status_poll, cx) {
            return Poll::Ready(TimerEvent::StatusPoll);
        }
        if poll_tick(&mut self.list_refresh, cx) {
            return Poll::Ready(TimerEvent::ListRefresh);
        }
        Poll::Pending
    }

    /// Waits for the next elapsed timer.
    pub async fn next(&mut self) -> TimerEvent {
        poll_fn(|cx| self.poll_next(cx)).await
    }
}
