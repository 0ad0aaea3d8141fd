//! Non-blocking lock actuator driver
//!
//! The physical latch (a hobby servo on the reference board) needs time to
//! travel, so every movement is modelled as a timed state instead of a
//! blocking delay:
//!
//! ```text
//! Locked --unlock()--> Unlocking --actuation--> Unlocked --hold--> Relocking --actuation--> Locked
//! ```
//!
//! Nothing here owns a timer. [`LockActuator::tick`] must be called at least
//! as often as the shortest configured delay; the polling loop does that.

use log::{info, warn};

use crate::error::Result;

/// Servo travel time in milliseconds
pub const ACT_DELAY_MS: u64 = 500;

/// How long the latch stays open before relocking
pub const HOLD_MS: u64 = 3000;

/// Hardware end of the lock: open or close the latch.
pub trait Actuator {
    fn set_open(&mut self, open: bool) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Locked,
    Unlocking,
    Unlocked,
    Relocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTiming {
    pub actuation_ms: u64,
    pub hold_ms: u64,
}

impl LockTiming {
    /// Nominal unlock-hold-relock duration
    pub fn cycle_ms(&self) -> u64 {
        2 * self.actuation_ms + self.hold_ms
    }
}

impl Default for LockTiming {
    fn default() -> Self {
        Self {
            actuation_ms: ACT_DELAY_MS,
            hold_ms: HOLD_MS,
        }
    }
}

/// Four-state lock machine; resets to `Locked` at construction, never persisted
pub struct LockActuator<A: Actuator> {
    actuator: A,
    timing: LockTiming,
    state: LockState,
    since_ms: u64,
}

impl<A: Actuator> LockActuator<A> {
    /// Take ownership of the actuator and drive it closed
    pub fn new(actuator: A, timing: LockTiming) -> Self {
        let mut lock = Self {
            actuator,
            timing,
            state: LockState::Locked,
            since_ms: 0,
        };
        lock.drive(false);
        lock
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn is_locked(&self) -> bool {
        self.state == LockState::Locked
    }

    pub fn timing(&self) -> LockTiming {
        self.timing
    }

    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    /// Begin the timed unlock-hold-relock cycle.
    ///
    /// Fails, changing nothing, unless the lock is idle in `Locked`.
    pub fn unlock(&mut self, now_ms: u64) -> bool {
        if self.state != LockState::Locked {
            warn!("Unlock ignored, lock busy in {:?}", self.state);
            return false;
        }
        self.drive(true);
        self.enter(LockState::Unlocking, now_ms);
        true
    }

    /// Close immediately from any state, skipping the timed path
    pub fn lock(&mut self, now_ms: u64) {
        self.drive(false);
        if self.state != LockState::Locked {
            self.enter(LockState::Locked, now_ms);
        }
    }

    /// Advance the cycle once the current phase's delay has elapsed
    pub fn tick(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.since_ms);
        match self.state {
            LockState::Locked => {}
            LockState::Unlocking => {
                if elapsed >= self.timing.actuation_ms {
                    self.enter(LockState::Unlocked, now_ms);
                }
            }
            LockState::Unlocked => {
                if elapsed >= self.timing.hold_ms {
                    self.drive(false);
                    self.enter(LockState::Relocking, now_ms);
                }
            }
            LockState::Relocking => {
                if elapsed >= self.timing.actuation_ms {
                    self.enter(LockState::Locked, now_ms);
                }
            }
        }
    }

    fn enter(&mut self, state: LockState, now_ms: u64) {
        info!("Lock {:?} -> {:?}", self.state, state);
        self.state = state;
        self.since_ms = now_ms;
    }

    fn drive(&mut self, open: bool) {
        // A failed command is not retried; the next lock()/unlock() drives it again.
        if let Err(e) = self.actuator.set_open(open) {
            warn!("Actuator command (open={}) failed: {}", open, e);
        }
    }
}
