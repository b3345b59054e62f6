//! Cycle-driven stepping loop that sits outside the CPU core.
//!
//! The core is asked for a bounded number of cycles at a time and the elapsed count is fed into
//! an [`EventQueue`] that drives timers and interrupts. Event contents are opaque to the core.

mod time;
mod time_queue;
mod scheduler;

pub use time::Time;
pub use time_queue::{EventId, EventQueue};
pub use scheduler::{CycleSource, Scheduler, SchedulerConfig};
