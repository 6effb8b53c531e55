//! §4.11 Scheduler: the single-threaded cooperative event loop tying
//! everything else together. One `mio::Poll` drives all sockets; a handful
//! of wall-clock ticks drive periodic maintenance the way the reference
//! client's main loop does, just expressed over `mio` instead of glib.

use crate::expect::ExpectationTable;
use crate::rate::GlobalRates;
use mio::{Events, Poll, Token};
use std::time::{Duration, Instant};

const RATE_TICK: Duration = Duration::from_secs(1);
const EXPECT_SWEEP_TICK: Duration = Duration::from_secs(120);
const KEEPALIVE_TICK: Duration = Duration::from_secs(5);
const REFRESH_TICK: Duration = Duration::from_secs(60);
const RECONNECT_TICK: Duration = Duration::from_secs(30);

/// Reserved tokens for the listener sockets; everything above
/// `FIRST_DYNAMIC_TOKEN` is handed out to hub/CC endpoints as they connect.
pub const TCP_LISTENER_TOKEN: Token = Token(0);
pub const UDP_LISTENER_TOKEN: Token = Token(1);
pub const TCP_TLS_LISTENER_TOKEN: Token = Token(2);
pub const FIRST_DYNAMIC_TOKEN: usize = 3;

struct TickTimers {
    rate: Instant,
    expect_sweep: Instant,
    keepalive: Instant,
    refresh: Instant,
    reconnect: Instant,
}

impl TickTimers {
    fn new(now: Instant) -> Self {
        Self { rate: now, expect_sweep: now, keepalive: now, refresh: now, reconnect: now }
    }
}

/// Which periodic maintenance tasks are due on this pass of the loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DueTicks {
    pub rate: bool,
    pub expect_sweep: bool,
    pub keepalive: bool,
    pub refresh: bool,
    pub reconnect: bool,
}

impl DueTicks {
    pub fn any(self) -> bool {
        self.rate || self.expect_sweep || self.keepalive || self.refresh || self.reconnect
    }
}

/// Drives the `mio::Poll` loop and tracks which periodic ticks are due.
/// Owns the cross-cutting state (rates, expectations) that every tick
/// touches; hub sessions, CC sessions and the download queue are driven by
/// the caller from the dispatch loop around `poll_once`.
pub struct Scheduler {
    poll: Poll,
    events: Events,
    timers: TickTimers,
    next_token: usize,
    pub rates: GlobalRates,
    pub expectations: ExpectationTable,
}

impl Scheduler {
    pub fn new() -> std::io::Result<Self> {
        let now = Instant::now();
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            timers: TickTimers::new(now),
            next_token: FIRST_DYNAMIC_TOKEN,
            rates: GlobalRates::new(),
            expectations: ExpectationTable::new(),
        })
    }

    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// Hand out a fresh token for a newly accepted/connected endpoint.
    pub fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Block for up to `timeout` waiting for I/O readiness, then report
    /// which periodic maintenance ticks have come due. Callers iterate
    /// `self.events()` for socket readiness and act on the returned ticks.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> std::io::Result<DueTicks> {
        self.poll.poll(&mut self.events, timeout)?;
        Ok(self.due_ticks(Instant::now()))
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    fn due_ticks(&mut self, now: Instant) -> DueTicks {
        let mut due = DueTicks::default();
        if now.duration_since(self.timers.rate) >= RATE_TICK {
            due.rate = true;
            self.timers.rate = now;
            self.rates.tick();
        }
        if now.duration_since(self.timers.expect_sweep) >= EXPECT_SWEEP_TICK {
            due.expect_sweep = true;
            self.timers.expect_sweep = now;
            self.expectations.sweep();
        }
        if now.duration_since(self.timers.keepalive) >= KEEPALIVE_TICK {
            due.keepalive = true;
            self.timers.keepalive = now;
        }
        if now.duration_since(self.timers.refresh) >= REFRESH_TICK {
            due.refresh = true;
            self.timers.refresh = now;
        }
        if now.duration_since(self.timers.reconnect) >= RECONNECT_TICK {
            due.reconnect = true;
            self.timers.reconnect = now;
        }
        due
    }

    /// The poll timeout to request: the time remaining until the soonest
    /// tick comes due, so we never sleep past a maintenance deadline.
    pub fn next_timeout(&self, now: Instant) -> Duration {
        let deadlines = [
            self.timers.rate + RATE_TICK,
            self.timers.expect_sweep + EXPECT_SWEEP_TICK,
            self.timers.keepalive + KEEPALIVE_TICK,
            self.timers.refresh + REFRESH_TICK,
            self.timers.reconnect + RECONNECT_TICK,
        ];
        deadlines
            .iter()
            .map(|&d| d.saturating_duration_since(now))
            .min()
            .unwrap_or(RATE_TICK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_hand_out_sequentially_past_the_reserved_ones() {
        let mut s = Scheduler::new().unwrap();
        assert_eq!(s.next_token(), Token(FIRST_DYNAMIC_TOKEN));
        assert_eq!(s.next_token(), Token(FIRST_DYNAMIC_TOKEN + 1));
    }

    #[test]
    fn next_timeout_is_never_longer_than_the_shortest_tick() {
        let s = Scheduler::new().unwrap();
        let timeout = s.next_timeout(Instant::now());
        assert!(timeout <= RATE_TICK);
    }
}
