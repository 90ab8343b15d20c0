pub mod cron;
pub mod pending;
pub mod processor;

pub use cron::Scheduler;
pub use pending::PendingSet;
pub use processor::{BatchReport, Health, Processor};
