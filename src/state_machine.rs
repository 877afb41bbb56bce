//! Supervisory start/stop state machine
//!
//! The machine is a pure function of its context and the device condition
//! observed this cycle. It never touches channels itself: it returns the
//! commands the device should issue, which keeps every transition testable
//! with a synthetic clock.

use crate::channel::{Options, OptionsEnum};
use crate::config::StateMachineConfig;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Supervisory state of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    #[default]
    Undefined,
    Pending,
    Off,
    Init,
    Running,
    Stopping,
    Error,
    ErrorDelay,
}

impl OptionsEnum for State {
    const OPTIONS: Options = &[
        (-1, "Undefined"),
        (0, "Pending"),
        (1, "Off"),
        (2, "Init"),
        (3, "Running"),
        (4, "Stopping"),
        (5, "Error"),
        (6, "ErrorDelay"),
    ];

    fn value(self) -> i32 {
        match self {
            Self::Undefined => -1,
            Self::Pending => 0,
            Self::Off => 1,
            Self::Init => 2,
            Self::Running => 3,
            Self::Stopping => 4,
            Self::Error => 5,
            Self::ErrorDelay => 6,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Undefined => "Undefined",
            Self::Pending => "Pending",
            Self::Off => "Off",
            Self::Init => "Init",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Error => "Error",
            Self::ErrorDelay => "ErrorDelay",
        }
    }

    fn undefined() -> Self {
        Self::Undefined
    }

    fn all() -> &'static [Self] {
        &[
            Self::Undefined,
            Self::Pending,
            Self::Off,
            Self::Init,
            Self::Running,
            Self::Stopping,
            Self::Error,
            Self::ErrorDelay,
        ]
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything the machine remembers between cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SupervisoryContext {
    pub state: State,
    pub pending_since: Option<Instant>,
    pub start_attempt_at: Option<Instant>,
    pub error_delay_until: Option<Instant>,
    pub unsuccessful_starts: u32,
}

/// Device condition sensed this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Observation {
    pub fault: bool,
    pub stopped: bool,
    pub running: bool,
}

/// Side effect requested by a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    /// Device specific recovery, e.g. clearing a latched error
    Recover,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepOutput {
    pub commands: Vec<Command>,
    pub ready_for_working: bool,
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn exceeded(since: Option<Instant>, limit: Duration, now: Instant) -> bool {
    since.is_none_or(|t| now.saturating_duration_since(t) > limit)
}

/// Advance the machine by one cycle
pub fn step(
    ctx: &SupervisoryContext,
    obs: Observation,
    now: Instant,
    cfg: &StateMachineConfig,
) -> (SupervisoryContext, StepOutput) {
    let mut next = *ctx;
    let mut out = StepOutput::default();

    match ctx.state {
        State::Undefined => {
            next.state = if obs.fault {
                State::Error
            } else if obs.stopped {
                State::Off
            } else if obs.running {
                State::Running
            } else {
                State::Pending
            };
        }
        State::Pending => {
            let since = *next.pending_since.get_or_insert(now);
            let resolved = if obs.fault {
                Some(State::Error)
            } else if obs.stopped {
                Some(State::Off)
            } else if obs.running {
                Some(State::Running)
            } else {
                None
            };
            match resolved {
                Some(state) => {
                    next.state = state;
                    next.pending_since = None;
                }
                None if exceeded(Some(since), secs(cfg.pending_tolerance_seconds), now) => {
                    // condition could not be determined: force a defined stop
                    out.commands.push(Command::Stop);
                    next.state = State::Off;
                    next.pending_since = None;
                }
                None => {}
            }
        }
        State::Off => {
            out.commands.push(Command::Start);
            next.start_attempt_at = Some(now);
            next.state = State::Init;
        }
        State::Init => {
            if obs.running {
                next.state = State::Running;
                next.unsuccessful_starts = 0;
                next.start_attempt_at = None;
            } else if exceeded(ctx.start_attempt_at, secs(cfg.max_start_time_seconds), now) {
                out.commands.push(Command::Stop);
                next.start_attempt_at = None;
                next.unsuccessful_starts += 1;
                next.state = State::Stopping;
                if next.unsuccessful_starts >= cfg.max_start_attempts {
                    next.error_delay_until =
                        Some(now + secs(cfg.start_unsuccessful_delay_seconds));
                    next.state = State::ErrorDelay;
                    next.unsuccessful_starts = 0;
                }
            }
        }
        State::Running => {
            if obs.fault {
                next.state = State::Error;
            } else if !obs.running {
                next.state = State::Undefined;
            } else {
                out.ready_for_working = true;
            }
        }
        State::Stopping => {
            if obs.fault {
                next.state = State::Error;
            } else if obs.stopped {
                next.state = State::Off;
            }
        }
        State::Error => {
            out.commands.push(Command::Recover);
            next.error_delay_until = Some(now + secs(cfg.error_delay_seconds));
            next.state = State::ErrorDelay;
        }
        State::ErrorDelay => {
            if ctx.error_delay_until.is_none_or(|until| now >= until) {
                next.error_delay_until = None;
                next.state = if obs.fault { State::Error } else { State::Off };
            }
        }
    }

    (next, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> StateMachineConfig {
        StateMachineConfig {
            error_delay_seconds: 600,
            max_start_time_seconds: 30,
            max_start_attempts: 3,
            start_unsuccessful_delay_seconds: 3600,
            pending_tolerance_seconds: 15,
        }
    }

    const STOPPED: Observation = Observation {
        fault: false,
        stopped: true,
        running: false,
    };
    const RUNNING: Observation = Observation {
        fault: false,
        stopped: false,
        running: true,
    };
    const AMBIGUOUS: Observation = Observation {
        fault: false,
        stopped: false,
        running: false,
    };
    const FAULT: Observation = Observation {
        fault: true,
        stopped: false,
        running: false,
    };

    fn at(state: State) -> SupervisoryContext {
        SupervisoryContext {
            state,
            ..Default::default()
        }
    }

    #[test]
    fn undefined_resolves_by_priority() {
        let now = Instant::now();
        let c = cfg();
        assert_eq!(step(&at(State::Undefined), FAULT, now, &c).0.state, State::Error);
        assert_eq!(step(&at(State::Undefined), STOPPED, now, &c).0.state, State::Off);
        assert_eq!(step(&at(State::Undefined), RUNNING, now, &c).0.state, State::Running);
        assert_eq!(step(&at(State::Undefined), AMBIGUOUS, now, &c).0.state, State::Pending);
        let both = Observation {
            fault: true,
            stopped: true,
            running: true,
        };
        assert_eq!(step(&at(State::Undefined), both, now, &c).0.state, State::Error);
    }

    #[test]
    fn off_issues_start_once_and_enters_init() {
        let now = Instant::now();
        let (ctx, out) = step(&at(State::Off), STOPPED, now, &cfg());
        assert_eq!(ctx.state, State::Init);
        assert_eq!(out.commands, vec![Command::Start]);
        assert_eq!(ctx.start_attempt_at, Some(now));

        // waiting in INIT does not re-issue anything
        let (ctx2, out) = step(&ctx, STOPPED, now + secs(5), &cfg());
        assert_eq!(ctx2.state, State::Init);
        assert!(out.commands.is_empty());
    }

    #[test]
    fn init_to_running_resets_counter() {
        let now = Instant::now();
        let ctx = SupervisoryContext {
            state: State::Init,
            start_attempt_at: Some(now),
            unsuccessful_starts: 2,
            ..Default::default()
        };
        let (ctx, _) = step(&ctx, RUNNING, now + secs(10), &cfg());
        assert_eq!(ctx.state, State::Running);
        assert_eq!(ctx.unsuccessful_starts, 0);
        assert_eq!(ctx.start_attempt_at, None);
    }

    #[test]
    fn init_timeout_stops_and_counts() {
        let now = Instant::now();
        let ctx = SupervisoryContext {
            state: State::Init,
            start_attempt_at: Some(now),
            ..Default::default()
        };
        let (same, out) = step(&ctx, STOPPED, now + secs(30), &cfg());
        assert_eq!(same.state, State::Init);
        assert!(out.commands.is_empty());

        let (ctx, out) = step(&ctx, STOPPED, now + secs(31), &cfg());
        assert_eq!(ctx.state, State::Stopping);
        assert_eq!(ctx.unsuccessful_starts, 1);
        assert_eq!(out.commands, vec![Command::Stop]);
    }

    #[test]
    fn repeated_start_failures_back_off() {
        let c = cfg();
        let mut now = Instant::now();
        let mut ctx = at(State::Off);
        for attempt in 1..=c.max_start_attempts {
            let (n, _) = step(&ctx, STOPPED, now, &c);
            assert_eq!(n.state, State::Init);
            now += secs(c.max_start_time_seconds + 1);
            let (n, out) = step(&n, STOPPED, now, &c);
            assert_eq!(out.commands, vec![Command::Stop]);
            if attempt < c.max_start_attempts {
                assert_eq!(n.state, State::Stopping);
                assert_eq!(n.unsuccessful_starts, attempt);
                let (n, _) = step(&n, STOPPED, now, &c);
                assert_eq!(n.state, State::Off);
                ctx = n;
            } else {
                assert_eq!(n.state, State::ErrorDelay);
                assert_eq!(n.unsuccessful_starts, 0);
                assert_eq!(
                    n.error_delay_until,
                    Some(now + secs(c.start_unsuccessful_delay_seconds))
                );
                ctx = n;
            }
        }
        assert_eq!(ctx.state, State::ErrorDelay);
    }

    #[test]
    fn running_asserts_ready_only_while_running() {
        let now = Instant::now();
        let (ctx, out) = step(&at(State::Running), RUNNING, now, &cfg());
        assert_eq!(ctx.state, State::Running);
        assert!(out.ready_for_working);

        let (ctx, out) = step(&ctx, AMBIGUOUS, now, &cfg());
        assert_eq!(ctx.state, State::Undefined);
        assert!(!out.ready_for_working);

        let (ctx, out) = step(&at(State::Running), FAULT, now, &cfg());
        assert_eq!(ctx.state, State::Error);
        assert!(!out.ready_for_working);

        for state in State::all() {
            if *state != State::Running {
                assert!(!step(&at(*state), RUNNING, now, &cfg()).1.ready_for_working);
            }
        }
    }

    #[test]
    fn stopping_waits_for_stop_or_fault() {
        let now = Instant::now();
        assert_eq!(step(&at(State::Stopping), AMBIGUOUS, now, &cfg()).0.state, State::Stopping);
        assert_eq!(step(&at(State::Stopping), STOPPED, now, &cfg()).0.state, State::Off);
        assert_eq!(step(&at(State::Stopping), FAULT, now, &cfg()).0.state, State::Error);
    }

    #[test]
    fn pending_times_out_with_exactly_one_stop() {
        let c = cfg();
        let t0 = Instant::now();
        let (mut ctx, _) = step(&at(State::Undefined), AMBIGUOUS, t0, &c);
        assert_eq!(ctx.state, State::Pending);

        let mut stops = 0;
        for s in 0..=c.pending_tolerance_seconds {
            let (n, out) = step(&ctx, AMBIGUOUS, t0 + secs(s), &c);
            stops += out.commands.iter().filter(|c| **c == Command::Stop).count();
            assert_eq!(n.state, State::Pending);
            ctx = n;
        }
        assert_eq!(stops, 0);
        assert_eq!(ctx.pending_since, Some(t0));

        let (ctx, out) = step(&ctx, AMBIGUOUS, t0 + secs(c.pending_tolerance_seconds + 1), &c);
        assert_eq!(out.commands, vec![Command::Stop]);
        assert_eq!(ctx.state, State::Off);
        assert_eq!(ctx.pending_since, None);
    }

    #[test]
    fn pending_resolves_immediately() {
        let t0 = Instant::now();
        let ctx = SupervisoryContext {
            state: State::Pending,
            pending_since: Some(t0),
            ..Default::default()
        };
        let (n, out) = step(&ctx, RUNNING, t0 + secs(1), &cfg());
        assert_eq!(n.state, State::Running);
        assert_eq!(n.pending_since, None);
        assert!(out.commands.is_empty());

        // a resolution observed on the tolerance boundary still wins
        let (n, out) = step(&ctx, STOPPED, t0 + secs(100), &cfg());
        assert_eq!(n.state, State::Off);
        assert!(out.commands.is_empty());
    }

    #[test]
    fn error_recovers_then_waits() {
        let c = cfg();
        let t0 = Instant::now();
        let (ctx, out) = step(&at(State::Error), FAULT, t0, &c);
        assert_eq!(out.commands, vec![Command::Recover]);
        assert_eq!(ctx.state, State::ErrorDelay);

        let (same, out) = step(&ctx, AMBIGUOUS, t0 + secs(10), &c);
        assert_eq!(same.state, State::ErrorDelay);
        assert!(out.commands.is_empty());

        let (again, _) = step(&ctx, FAULT, t0 + secs(c.error_delay_seconds), &c);
        assert_eq!(again.state, State::Error);

        let (off, _) = step(&ctx, AMBIGUOUS, t0 + secs(c.error_delay_seconds), &c);
        assert_eq!(off.state, State::Off);
        assert_eq!(off.error_delay_until, None);
    }

    #[test]
    fn state_options_round_trip() {
        for state in State::all() {
            let v = crate::channel::Value::Integer(state.value());
            assert_eq!(State::from_value(Some(&v)), *state);
        }
        assert_eq!(State::from_value(None), State::Undefined);
    }
}
