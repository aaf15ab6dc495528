use super::{Invocation, Job, JobError};
use crate::comm::GroupChannel;
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};
use tracing::{debug, instrument};
use wait_timeout::ChildExt;

/// preloaded model bytes; reading the file once up front stands in for the
/// warm-started model object of the underlying fitter
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFile {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

/// runs each task as an external command on the group root
#[derive(Debug, Clone, Default)]
pub struct ExecJob {
    timeout: Option<Duration>,
}

impl ExecJob {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl Job for ExecJob {
    type Model = ModelFile;

    fn load_model(&self, path: &Path) -> Result<ModelFile, JobError> {
        let bytes = fs::read(path).map_err(|source| JobError::Model {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(
            "cached {} byte(s) of model data from {}",
            bytes.len(),
            path.display()
        );

        Ok(ModelFile {
            path: path.to_path_buf(),
            bytes,
        })
    }

    /// the group root runs the command; the other members only lend their
    /// ranks and wait at the group barrier
    #[instrument(level = "debug", skip_all, fields(task = invocation.task))]
    fn run(
        &self,
        invocation: &Invocation,
        group: &GroupChannel,
        _model: Option<&ModelFile>,
    ) -> Result<(), JobError> {
        if !group.is_root() {
            return Ok(());
        }

        let (program, rest) = match invocation.args.split_first() {
            Some(parts) => parts,
            None => return Err(JobError::EmptyCommand),
        };
        debug!("calling {program} with arguments: {rest:?}");

        let mut child = Command::new(program).args(rest).spawn()?;
        let status = match self.timeout {
            Some(timeout) => match child.wait_timeout(timeout)? {
                Some(status) => status,
                None => {
                    child.kill()?;
                    child.wait()?;
                    return Err(JobError::Timeout);
                }
            },
            None => child.wait()?,
        };

        if !status.success() {
            return Err(JobError::Failed { status });
        }

        Ok(())
    }
}
