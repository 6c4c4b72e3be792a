use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use super::{JobOptions, SchedulerCommands, SchedulerError, JOB_POLL_POLICY};
use crate::command::{CommandOutput, CommandRunner};
use crate::remote::{remote_file_name, shell_quote, RemoteCommandExecutor};
use crate::retry::RetryPolicy;

const NOT_COMPLETED_MARKERS: [&str; 5] = [
    "EndTime=Unknown",
    "JobState=RUNNING",
    "JobState=PENDING",
    "JobState=COMPLETING",
    "JobState=CONFIGURING",
];

fn job_submitted_re() -> &'static Regex {
    static RE_ONCE: OnceLock<Regex> = OnceLock::new();
    RE_ONCE.get_or_init(|| Regex::new(r"Submitted batch job ([0-9]+)").unwrap())
}

fn exit_code_re() -> &'static Regex {
    static RE_ONCE: OnceLock<Regex> = OnceLock::new();
    RE_ONCE.get_or_init(|| Regex::new(r"ExitCode=(\S+)").unwrap())
}

pub struct SlurmCommands<'a, R> {
    executor: &'a RemoteCommandExecutor<R>,
    poll_policy: RetryPolicy,
}

impl<'a, R: CommandRunner> SlurmCommands<'a, R> {
    pub fn new(executor: &'a RemoteCommandExecutor<R>) -> Self {
        Self {
            executor,
            poll_policy: JOB_POLL_POLICY,
        }
    }

    pub fn with_poll_policy(self, poll_policy: RetryPolicy) -> Self {
        Self {
            poll_policy,
            ..self
        }
    }

    fn show_job(&self, job_id: &str) -> Result<String, SchedulerError> {
        let output = self
            .executor
            .run_remote_command(&format!("scontrol show jobs -o {job_id}"))?;
        Ok(output.stdout)
    }
}

impl<R: CommandRunner> SchedulerCommands for SlurmCommands<'_, R> {
    fn get_compute_nodes(&self) -> Result<Vec<String>, SchedulerError> {
        let output = self
            .executor
            .run_remote_command("sinfo --Node --noheader --responding --format='%N'")?;
        let mut nodes: Vec<String> = Vec::new();
        for node in output.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            // nodes in more than one partition are listed once per partition
            if !nodes.iter().any(|n| n == node) {
                nodes.push(node.to_string());
            }
        }
        Ok(nodes)
    }

    fn get_nodes_status(&self) -> Result<BTreeMap<String, String>, SchedulerError> {
        let output = self
            .executor
            .run_remote_command("sinfo --Node --noheader --format='%N %t'")?;
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.split_once(char::is_whitespace))
            .map(|(node, state)| (node.trim().to_string(), state.trim().to_string()))
            .collect())
    }

    fn submit_command(
        &self,
        command: &str,
        options: &JobOptions,
    ) -> Result<CommandOutput, SchedulerError> {
        let mut submission = format!("sbatch --wrap={}", shell_quote(command));
        if options.nodes > 0 {
            submission.push_str(&format!(" -N {}", options.nodes));
        }
        if let Some(slots) = options.slots {
            submission.push_str(&format!(" -n {slots}"));
        }
        if let Some(host) = &options.host {
            submission.push_str(&format!(" --nodelist={host}"));
        }
        Ok(self.executor.run_remote_command(&submission)?)
    }

    fn submit_script(
        &self,
        script: &Path,
        host: Option<&str>,
    ) -> Result<CommandOutput, SchedulerError> {
        let script_name = remote_file_name(script);
        self.executor.copy_to_remote(script, &script_name)?;
        let submission = match host {
            Some(host) => format!("sbatch --nodelist={host} {script_name}"),
            None => format!("sbatch {script_name}"),
        };
        Ok(self.executor.run_remote_command(&submission)?)
    }

    fn assert_job_submitted(&self, submission_output: &str) -> Result<String, SchedulerError> {
        job_submitted_re()
            .captures(submission_output)
            .map(|caps| caps[1].to_string())
            .ok_or_else(|| SchedulerError::JobNotSubmitted(submission_output.to_string()))
    }

    fn wait_job_completed(&self, job_id: &str) -> Result<(), SchedulerError> {
        self.poll_policy.run(
            &format!("wait for slurm job {job_id}"),
            SchedulerError::is_job_not_completed,
            || {
                let job = self.show_job(job_id)?;
                if !job.contains("JobState")
                    || NOT_COMPLETED_MARKERS.iter().any(|m| job.contains(m))
                {
                    return Err(SchedulerError::JobNotCompleted(job_id.to_string()));
                }
                debug!(job_id, "slurm job completed");
                Ok(())
            },
        )
    }

    fn assert_job_succeeded(&self, job_id: &str) -> Result<(), SchedulerError> {
        let job = self.show_job(job_id)?;
        let exit_code = exit_code_re()
            .captures(&job)
            .map(|caps| caps[1].to_string());
        if job.contains("JobState=COMPLETED") && exit_code.as_deref() == Some("0:0") {
            return Ok(());
        }
        Err(SchedulerError::JobFailed {
            job_id: job_id.to_string(),
            details: job.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandError;
    use crate::scheduler::tests::executor;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const COMPLETED_JOB: &str = "JobId=12 JobName=wrap JobState=COMPLETED Reason=None ExitCode=0:0 EndTime=2020-06-01T10:00:00";
    const RUNNING_JOB: &str =
        "JobId=12 JobName=wrap JobState=RUNNING Reason=None ExitCode=0:0 EndTime=Unknown";
    const FAILED_JOB: &str =
        "JobId=12 JobName=wrap JobState=FAILED Reason=NonZeroExitCode ExitCode=1:0 EndTime=2020-06-01T10:00:00";

    fn ok(stdout: &str) -> Result<CommandOutput, CommandError> {
        Ok(CommandOutput::from_stdout(stdout))
    }

    #[test]
    fn nodes_status_parsed_from_sinfo() {
        let executor = executor(|command| {
            assert!(command.contains("sinfo --Node --noheader --format='\\''%N %t'\\''"));
            ok("queue1-dy-c5xlarge-1 idle~\nqueue1-st-c5xlarge-1 idle\nqueue2-dy-t2micro-1 alloc\n")
        });
        let slurm = SlurmCommands::new(&executor);
        let status = slurm.get_nodes_status().unwrap();
        assert_eq!(status.len(), 3);
        assert_eq!(status["queue1-dy-c5xlarge-1"], "idle~");
        assert_eq!(status["queue1-st-c5xlarge-1"], "idle");
    }

    #[test]
    fn compute_nodes_are_deduplicated() {
        let executor = executor(|_| ok("queue1-st-c5xlarge-1\nqueue1-st-c5xlarge-1\nqueue2-st-t2micro-1\n"));
        let slurm = SlurmCommands::new(&executor);
        assert_eq!(
            slurm.get_compute_nodes().unwrap(),
            vec!["queue1-st-c5xlarge-1", "queue2-st-t2micro-1"]
        );
    }

    #[test]
    fn submit_command_flags() {
        let executor = executor(|command| {
            assert!(command.contains("sbatch --wrap="));
            assert!(command.contains(" -N 2 -n 4 --nodelist=queue1-st-c5xlarge-1"));
            ok("Submitted batch job 12")
        });
        let slurm = SlurmCommands::new(&executor);
        let options = JobOptions {
            nodes: 2,
            slots: Some(4),
            host: Some("queue1-st-c5xlarge-1".to_string()),
        };
        let output = slurm.submit_command("sleep 1", &options).unwrap();
        assert_eq!(slurm.assert_job_submitted(&output.stdout).unwrap(), "12");
    }

    #[test]
    fn job_not_submitted() {
        let executor = executor(|_| ok(""));
        let slurm = SlurmCommands::new(&executor);
        assert_matches!(
            slurm.assert_job_submitted("sbatch: error: Batch job submission failed"),
            Err(SchedulerError::JobNotSubmitted(_))
        );
    }

    #[test]
    fn wait_until_job_leaves_running_state() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let executor = executor(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                ok(RUNNING_JOB)
            } else {
                ok(COMPLETED_JOB)
            }
        });
        let slurm = SlurmCommands::new(&executor)
            .with_poll_policy(RetryPolicy::fixed(5, Duration::ZERO));

        slurm.wait_job_completed("12").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        slurm.assert_job_succeeded("12").unwrap();
    }

    #[test]
    fn wait_gives_up_after_max_attempts() {
        let executor = executor(|_| ok(RUNNING_JOB));
        let slurm = SlurmCommands::new(&executor)
            .with_poll_policy(RetryPolicy::fixed(3, Duration::ZERO));
        assert_matches!(
            slurm.wait_job_completed("12"),
            Err(SchedulerError::JobNotCompleted(id)) => assert_eq!(id, "12")
        );
    }

    #[test]
    fn failed_job() {
        let executor = executor(|_| ok(FAILED_JOB));
        let slurm = SlurmCommands::new(&executor);
        assert_matches!(
            slurm.assert_job_succeeded("12"),
            Err(SchedulerError::JobFailed { .. })
        );
    }
}
