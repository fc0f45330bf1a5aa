#![forbid(unsafe_code)]

//! Deadline bookkeeping for the worker loop.

use slotmap::{SlotMap, new_key_type};
use std::time::{Duration, Instant};

new_key_type! {
    pub struct TimerId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Deadline of the running exec batch.
    ExecTimeout,
    /// Periodic re-drive of the kill list.
    KillList,
}

#[derive(Debug)]
struct Timer {
    kind: TimerKind,
    deadline: Instant,
    period: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct TimerList {
    timers: SlotMap<TimerId, Timer>,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: TimerKind, now: Instant, interval: Duration) -> TimerId {
        self.timers.insert(Timer {
            kind,
            deadline: now + interval,
            period: None,
        })
    }

    /// Timer that re-arms itself every `interval` after firing.
    pub fn add_periodic(&mut self, kind: TimerKind, now: Instant, interval: Duration) -> TimerId {
        self.timers.insert(Timer {
            kind,
            deadline: now + interval,
            period: Some(interval),
        })
    }

    pub fn delete(&mut self, id: TimerId) -> bool {
        self.timers.remove(id).is_some()
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.timers.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Time until the nearest deadline, `None` without timers.
    pub fn time_to_expire(&self, now: Instant) -> Option<Duration> {
        self.timers
            .values()
            .map(|timer| timer.deadline.saturating_duration_since(now))
            .min()
    }

    /// Fire every timer whose deadline has passed, earliest first.
    /// One-shot timers are removed; periodic ones are re-armed.
    pub fn expire(&mut self, now: Instant) -> Vec<(TimerId, TimerKind)> {
        let mut fired: Vec<(Instant, TimerId, TimerKind)> = Vec::new();

        for (id, timer) in &self.timers {
            if timer.deadline <= now {
                fired.push((timer.deadline, id, timer.kind));
            }
        }
        fired.sort_by_key(|(deadline, _, _)| *deadline);

        for (_, id, _) in &fired {
            let rearm = match self.timers.get_mut(*id) {
                Some(timer) => match timer.period {
                    Some(period) => {
                        timer.deadline = now + period;
                        true
                    }
                    None => false,
                },
                None => continue,
            };
            if !rearm {
                self.timers.remove(*id);
            }
        }

        fired.into_iter().map(|(_, id, kind)| (id, kind)).collect()
    }
}
