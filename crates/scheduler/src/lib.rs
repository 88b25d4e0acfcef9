//! Bounded-concurrency trial scheduling for the tilescout optimizer.

pub mod scheduler;
pub mod semaphore;
pub mod task;
pub mod trial;

pub use scheduler::{Scheduler, SchedulerOptions};
pub use task::TrialTask;
pub use trial::{TrialOutcome, TrialRunner};
