pub mod processor;
pub mod reconciler;

pub use processor::{Outcome, ProcessError, Processor, RescheduleCounts, RetryPolicy};
pub use reconciler::{Reconciler, TickReport};
