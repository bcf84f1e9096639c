//! Application wiring
//! Logging, venue selection and the task scheduler

pub mod init;
pub mod scheduler;

pub use init::{init_logging, init_signer, init_venue};
pub use scheduler::{Scheduler, SchedulerConfig};
