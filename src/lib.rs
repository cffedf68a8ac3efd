pub mod config;
pub mod error;
pub mod job;
pub mod keys;
pub mod manager;
pub mod tracing_config;
pub mod watcher;
pub mod worker;

pub use config::Config;
pub use error::Error;
pub use job::{Job, JobError, JobRegistry};
pub use manager::{EnqueueOptions, Manager};
pub use watcher::Watcher;
pub use worker::{StopOptions, Worker};
