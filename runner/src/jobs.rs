use crate::comm::GroupChannel;
use once_cell::unsync::OnceCell;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    process::ExitStatus,
};
use thiserror::Error;

pub mod exec;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Failed to launch the job process")]
    Spawn(#[from] std::io::Error),
    #[error("Job ran past the configured timeout")]
    Timeout,
    #[error("Job exited with {status}")]
    Failed { status: ExitStatus },
    #[error("Job command is empty")]
    EmptyCommand,
    #[error("Failed to load the model from {path}")]
    Model {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// one task as handed to a worker group: the task index plus the fully
/// rendered argument list, parameter file included
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Invocation {
    pub task: usize,
    pub args: Vec<String>,
}

/// what a group root reports back once its group finishes a task
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskOutcome {
    pub task: usize,
    pub elapsed_ms: u64,
}

/// the work a worker group performs for one task
///
/// `run` is called on every member of the group with the group channel, so
/// implementations can coordinate collectively; the whole run is aborted when
/// any member returns an error
pub trait Job {
    /// expensive state loaded once per rank and reused across tasks
    type Model;

    fn load_model(&self, path: &Path) -> Result<Self::Model, JobError>;

    fn run(
        &self,
        invocation: &Invocation,
        group: &GroupChannel,
        model: Option<&Self::Model>,
    ) -> Result<(), JobError>;
}

/// the model file referenced by `-m`/`--model`, when present
pub fn model_path(args: &[String]) -> Option<&Path> {
    let position = args.iter().position(|arg| arg == "-m" || arg == "--model")?;

    args.get(position + 1).map(Path::new)
}

/// lazily loaded per-rank model slot; the load runs once and the result is
/// reused for every later task
pub struct JobCache<M> {
    slot: OnceCell<M>,
}

impl<M> JobCache<M> {
    pub fn new() -> Self {
        Self {
            slot: OnceCell::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.get().is_some()
    }

    /// the cached model, loading it on first use
    pub fn fetch<F>(&self, load: F) -> Result<&M, JobError>
    where
        F: FnOnce() -> Result<M, JobError>,
    {
        self.slot.get_or_try_init(load)
    }
}

impl<M> Default for JobCache<M> {
    fn default() -> Self {
        Self::new()
    }
}
