//! veil-watch — folder watcher that drives each photo through detection and
//! anonymization exactly once.
//!
//! Files dropped into the input directory end in exactly one terminal
//! placement: the detection and anonymization output directories on success,
//! or the error directory on failure.

pub mod archive;
pub mod config;
pub mod engine;
pub mod job;
pub mod pipeline;
pub mod placement;
pub mod scan;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use config::{Config, ConfigError, Mode};
pub use engine::{spawn_engine, EngineError, EngineHandle};
pub use job::{JobOutcome, JobReport, JobState, PipelineJob, Stage};
pub use pipeline::Pipeline;
pub use watcher::{bootstrap, CycleSummary, RunningWatcher, WatchError, Watcher};
