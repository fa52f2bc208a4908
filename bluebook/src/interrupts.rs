//! Periodic interrupt checks.
//!
//! A countdown decides when the wall clock is consulted at all. Its reset
//! value adapts so that real checks land roughly every
//! `interrupt_target_ms` milliseconds whatever the bytecode mix.

use log::trace;

use crate::{
    Interpreter, VmConfig, VmError,
    special::{THE_INTERRUPT_SEMAPHORE, THE_TIMER_SEMAPHORE},
};

/// Same wrap as the image's millisecond clock primitive.
pub const MILLISECOND_CLOCK_MASK: i64 = 0x1FFF_FFFF;

#[derive(Debug, Clone)]
pub struct InterruptState {
    pub counter: i32,
    pub reset: i32,
    pub last_tick: i64,
    pub next_poll_tick: i64,
    /// Zero when no timer is armed.
    pub next_wakeup_tick: i64,
    floor: i32,
    increment: i32,
    decrement: i32,
    target_ms: i64,
    poll_interval_ms: i64,
}

impl InterruptState {
    pub fn new(config: &VmConfig) -> Self {
        Self {
            counter: 0,
            reset: config.interrupt_reset_floor,
            last_tick: 0,
            next_poll_tick: 0,
            next_wakeup_tick: 0,
            floor: config.interrupt_reset_floor,
            increment: config.interrupt_reset_increment,
            decrement: config.interrupt_reset_decrement,
            target_ms: config.interrupt_target_ms,
            poll_interval_ms: config.poll_interval_ms,
        }
    }

    /// Bookkeeping for a real check at `now`: wrap handling and the feedback
    /// loop. Returns whether input should be polled.
    fn tick(&mut self, now: i64) -> bool {
        if now < self.last_tick {
            self.next_poll_tick = now + (self.next_poll_tick - self.last_tick);
            if self.next_wakeup_tick != 0 {
                self.next_wakeup_tick = now + (self.next_wakeup_tick - self.last_tick);
            }
        }
        if now - self.last_tick < self.target_ms {
            self.reset += self.increment;
        } else if self.reset <= self.floor {
            self.reset = self.floor;
        } else {
            self.reset -= self.decrement;
        }
        self.counter = self.reset;
        self.last_tick = now;

        if now >= self.next_poll_tick {
            self.next_poll_tick = now + self.poll_interval_ms;
            return true;
        }
        false
    }

    /// Disarms the timer if it has expired; returns whether it fired.
    fn take_expired_wakeup(&mut self, now: i64) -> bool {
        if self.next_wakeup_tick != 0 && now >= self.next_wakeup_tick {
            self.next_wakeup_tick = 0;
            return true;
        }
        false
    }
}

impl Interpreter {
    pub fn millisecond_clock(&self) -> i64 {
        self.started.elapsed().as_millis() as i64 & MILLISECOND_CLOCK_MASK
    }

    /// Called on sends and backward jumps.
    pub(crate) fn check_for_interrupts(&mut self) -> Result<(), VmError> {
        let counter = self.timing.counter;
        self.timing.counter -= 1;
        if counter > 0 {
            return Ok(());
        }
        let now = self.millisecond_clock();
        self.check_for_interrupts_at(now)
    }

    pub(crate) fn check_for_interrupts_at(&mut self, now: i64) -> Result<(), VmError> {
        if self.timing.tick(now) {
            self.display.process_events(&self.input);
        }
        if self.input.take_interrupt() {
            trace!("user interrupt");
            self.signal_special_semaphore(THE_INTERRUPT_SEMAPHORE)?;
        }
        if self.timing.take_expired_wakeup(now) {
            self.signal_special_semaphore(THE_TIMER_SEMAPHORE)?;
        }
        Ok(())
    }

    fn signal_special_semaphore(&mut self, index: usize) -> Result<(), VmError> {
        let semaphore = self.special_object(index)?;
        if semaphore != self.state.special.nil {
            self.synchronous_signal(semaphore)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> InterruptState {
        InterruptState::new(&VmConfig::default())
    }

    #[test]
    fn frequent_checks_raise_the_reset() {
        let mut timing = state();
        timing.last_tick = 100;
        timing.next_poll_tick = 10_000;
        timing.tick(101);
        assert_eq!(timing.reset, 1010);
        assert_eq!(timing.counter, 1010);
        timing.tick(102);
        assert_eq!(timing.reset, 1020);
    }

    #[test]
    fn slow_checks_decay_towards_the_floor() {
        let mut timing = state();
        timing.reset = 1030;
        timing.next_poll_tick = 10_000;
        timing.tick(50);
        assert_eq!(timing.reset, 1018);
        timing.tick(100);
        assert_eq!(timing.reset, 1006);
        timing.tick(150);
        assert_eq!(timing.reset, 994);
        timing.tick(200);
        assert_eq!(timing.reset, 1000);
    }

    #[test]
    fn clock_wrap_rebases_deadlines() {
        let mut timing = state();
        timing.last_tick = MILLISECOND_CLOCK_MASK - 10;
        timing.next_poll_tick = MILLISECOND_CLOCK_MASK + 90;
        timing.next_wakeup_tick = MILLISECOND_CLOCK_MASK - 5;
        assert!(!timing.tick(20));
        assert_eq!(timing.next_poll_tick, 120);
        assert_eq!(timing.next_wakeup_tick, 25);
        assert!(!timing.take_expired_wakeup(24));
        assert!(timing.take_expired_wakeup(25));
        assert_eq!(timing.next_wakeup_tick, 0);
    }

    #[test]
    fn polls_on_interval() {
        let mut timing = state();
        assert!(timing.tick(0));
        assert_eq!(timing.next_poll_tick, 500);
        assert!(!timing.tick(499));
        assert!(timing.tick(500));
    }
}
