use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::trace;

use crate::{EventQueue, Time};

#[derive(Debug, Copy, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on the cycles requested from the core in one step
    pub quantum: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig { quantum: 1024 }
    }
}

/// Something that can be asked to run for a bounded number of cycles.
///
/// Returns how many cycles actually elapsed, which may overshoot the budget.
pub trait CycleSource {
    fn run(&mut self, budget: u64) -> Result<u64, anyhow::Error>;
}

impl<F> CycleSource for F where F: FnMut(u64) -> Result<u64, anyhow::Error> {
    fn run(&mut self, budget: u64) -> Result<u64, anyhow::Error> {
        (self)(budget)
    }
}

/// The outer stepping loop: hands the core slices of time and fires events between them.
pub struct Scheduler<E> {
    queue: EventQueue<E>,
    config: SchedulerConfig,
    now: Time,
}

impl<E> Scheduler<E> {
    pub fn new(config: SchedulerConfig) -> Scheduler<E> {
        Scheduler {
            queue: EventQueue::new(),
            config,
            now: Time::ZERO,
        }
    }

    pub fn now(&self) -> Time {
        self.now
    }

    pub fn queue(&mut self) -> &mut EventQueue<E> {
        &mut self.queue
    }

    /// Runs one quantum, never past the next event deadline, and returns the events that fired.
    pub fn step<C>(&mut self, core: &mut C) -> Result<Vec<E>, anyhow::Error>
    where C: CycleSource + ?Sized {
        let budget = match self.queue.next_deadline() {
            Some(deadline) => deadline.clamp(1, self.config.quantum.max(1)),
            None => self.config.quantum.max(1),
        };

        let elapsed = core.run(budget)?;
        anyhow::ensure!(elapsed > 0, "core made no progress with a budget of {} cycles", budget);

        self.now = self.now.add(elapsed);
        let fired = self.queue.advance(elapsed);
        if !fired.is_empty() {
            trace!("{} events fired at cycle {}", fired.len(), self.now.cycles());
        }
        Ok(fired)
    }

    /// Steps until `stop` is raised or `on_event` breaks.
    ///
    /// `stop` is checked once per quantum. Events that fired in the same step as a breaking event
    /// but after it are dropped.
    pub fn run<C, F>(&mut self, core: &mut C, stop: &AtomicBool, mut on_event: F) -> Result<Time, anyhow::Error>
    where
        C: CycleSource + ?Sized,
        F: FnMut(&mut EventQueue<E>, E) -> ControlFlow<()>,
    {
        while !stop.load(Ordering::Acquire) {
            for event in self.step(core)? {
                if on_event(&mut self.queue, event).is_break() {
                    return Ok(self.now);
                }
            }
        }
        Ok(self.now)
    }
}
