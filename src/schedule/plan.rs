//! Daily interval planning.

use chrono::{Duration, NaiveDateTime, NaiveTime};

/// Next edges of a daily window relative to some instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalPlan {
    /// `None` when the instant already lies inside the window.
    pub start_at: Option<NaiveDateTime>,
    pub stop_at: NaiveDateTime,
}

impl IntervalPlan {
    pub const fn is_active(&self) -> bool {
        self.start_at.is_none()
    }
}

/// Plan the window `[start, end)` around `now`.
///
/// A window whose end is not after its start crosses midnight. A window that
/// opened yesterday and has not closed yet counts as active, so a restart at
/// 01:00 inside a 22:00-07:00 window keeps blocking until 07:00.
pub fn plan_interval(now: NaiveDateTime, start: NaiveTime, end: NaiveTime) -> IntervalPlan {
    let today = now.date();
    let wraps = end <= start;

    if wraps && now.time() < end {
        return IntervalPlan {
            start_at: None,
            stop_at: today.and_time(end),
        };
    }

    let start_at = today.and_time(start);
    let mut stop_at = today.and_time(end);
    if wraps {
        stop_at += Duration::days(1);
    }

    if now < start_at {
        IntervalPlan {
            start_at: Some(start_at),
            stop_at,
        }
    } else if now < stop_at {
        IntervalPlan {
            start_at: None,
            stop_at,
        }
    } else {
        IntervalPlan {
            start_at: Some(start_at + Duration::days(1)),
            stop_at: stop_at + Duration::days(1),
        }
    }
}
