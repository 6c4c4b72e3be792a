mod sge;
mod slurm;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::remote::RemoteCommandExecutor;
use crate::retry::RetryPolicy;

pub use sge::SgeCommands;
pub use slurm::SlurmCommands;

/// Polling used while waiting for a job to reach a final state.
pub const JOB_POLL_POLICY: RetryPolicy = RetryPolicy::fixed(90, Duration::from_secs(10));

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("remote command failed: `{0}`")]
    Command(#[from] CommandError),

    #[error("unknown scheduler `{0}`")]
    UnknownScheduler(String),

    #[error("`{operation}` is not supported by {scheduler}")]
    Unsupported {
        scheduler: &'static str,
        operation: &'static str,
    },

    #[error("job was not submitted, output: {0}")]
    JobNotSubmitted(String),

    #[error("job {0} has not completed yet")]
    JobNotCompleted(String),

    #[error("job {job_id} did not succeed: {details}")]
    JobFailed { job_id: String, details: String },
}

impl SchedulerError {
    pub(crate) fn is_job_not_completed(&self) -> bool {
        matches!(self, SchedulerError::JobNotCompleted(_))
    }
}

/// Where and how wide a job runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    pub nodes: u32,
    pub slots: Option<u32>,
    pub host: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            nodes: 1,
            slots: None,
            host: None,
        }
    }
}

impl JobOptions {
    pub fn on_host(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            ..Default::default()
        }
    }
}

/// Scheduler specific commands run on the master node.
pub trait SchedulerCommands {
    /// Hostnames of the compute nodes currently in the cluster.
    fn get_compute_nodes(&self) -> Result<Vec<String>, SchedulerError>;

    /// Node name to scheduler state, e.g. `idle` or `idle~`.
    fn get_nodes_status(&self) -> Result<BTreeMap<String, String>, SchedulerError>;

    fn submit_command(
        &self,
        command: &str,
        options: &JobOptions,
    ) -> Result<CommandOutput, SchedulerError>;

    /// Copies `script` to the master node and submits it.
    fn submit_script(&self, script: &Path, host: Option<&str>)
        -> Result<CommandOutput, SchedulerError>;

    /// Extracts the job id from the submission output.
    fn assert_job_submitted(&self, submission_output: &str) -> Result<String, SchedulerError>;

    fn wait_job_completed(&self, job_id: &str) -> Result<(), SchedulerError>;

    fn assert_job_succeeded(&self, job_id: &str) -> Result<(), SchedulerError>;

    /// Submits `command`, waits for it and checks that it succeeded.
    fn run_job(&self, command: &str, options: &JobOptions) -> Result<String, SchedulerError> {
        let output = self.submit_command(command, options)?;
        let job_id = self.assert_job_submitted(&output.stdout)?;
        self.wait_job_completed(&job_id)?;
        self.assert_job_succeeded(&job_id)?;
        Ok(job_id)
    }
}

/// Returns the commands of the given scheduler.
pub fn scheduler_commands<'a, R: CommandRunner>(
    scheduler: &str,
    executor: &'a RemoteCommandExecutor<R>,
) -> Result<Box<dyn SchedulerCommands + 'a>, SchedulerError> {
    match scheduler {
        "slurm" => Ok(Box::new(SlurmCommands::new(executor))),
        "sge" => Ok(Box::new(SgeCommands::new(executor))),
        other => Err(SchedulerError::UnknownScheduler(other.to_string())),
    }
}
