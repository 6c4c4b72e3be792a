use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use super::{JobOptions, SchedulerCommands, SchedulerError, JOB_POLL_POLICY};
use crate::command::{CommandOutput, CommandRunner};
use crate::remote::{remote_file_name, shell_quote, RemoteCommandExecutor};
use crate::retry::RetryPolicy;

fn job_submitted_re() -> &'static Regex {
    static RE_ONCE: OnceLock<Regex> = OnceLock::new();
    RE_ONCE.get_or_init(|| Regex::new(r"Your job ([0-9]+) \(.+\) has been submitted").unwrap())
}

fn exit_status_re() -> &'static Regex {
    static RE_ONCE: OnceLock<Regex> = OnceLock::new();
    RE_ONCE.get_or_init(|| Regex::new(r"(?m)^exit_status\s+([0-9]+)").unwrap())
}

pub struct SgeCommands<'a, R> {
    executor: &'a RemoteCommandExecutor<R>,
    poll_policy: RetryPolicy,
}

impl<'a, R: CommandRunner> SgeCommands<'a, R> {
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

    fn accounting(&self, job_id: &str) -> Result<String, SchedulerError> {
        let output = self
            .executor
            .run_remote_command(&format!("qacct -j {job_id}"))?;
        Ok(output.stdout)
    }
}

/// `qsub` flags for the requested resources, SGE counts slots across nodes.
fn submission_flags(options: &JobOptions) -> String {
    let mut flags = String::new();
    let slots = match options.slots {
        Some(slots) if options.nodes > 1 => Some(slots.saturating_mul(options.nodes)),
        slots => slots,
    };
    if let Some(slots) = slots {
        flags.push_str(&format!(" -pe mpi {slots}"));
    }
    if let Some(host) = &options.host {
        flags.push_str(&format!(" -l hostname={host}"));
    }
    flags
}

impl<R: CommandRunner> SchedulerCommands for SgeCommands<'_, R> {
    fn get_compute_nodes(&self) -> Result<Vec<String>, SchedulerError> {
        let output = self.executor.run_remote_command("qhost")?;
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .filter(|host| host.starts_with("ip-"))
            .map(str::to_string)
            .collect())
    }

    fn get_nodes_status(&self) -> Result<BTreeMap<String, String>, SchedulerError> {
        Err(SchedulerError::Unsupported {
            scheduler: "sge",
            operation: "get_nodes_status",
        })
    }

    fn submit_command(
        &self,
        command: &str,
        options: &JobOptions,
    ) -> Result<CommandOutput, SchedulerError> {
        let submission = format!(
            "echo {} | qsub{}",
            shell_quote(command),
            submission_flags(options)
        );
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
            Some(host) => format!("qsub -l hostname={host} {script_name}"),
            None => format!("qsub {script_name}"),
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
        // accounting data is only available once the job has finished
        self.poll_policy.run(
            &format!("wait for sge job {job_id}"),
            SchedulerError::is_job_not_completed,
            || match self.accounting(job_id) {
                Ok(_) => {
                    debug!(job_id, "sge job completed");
                    Ok(())
                }
                Err(SchedulerError::Command(_)) => {
                    Err(SchedulerError::JobNotCompleted(job_id.to_string()))
                }
                Err(err) => Err(err),
            },
        )
    }

    fn assert_job_succeeded(&self, job_id: &str) -> Result<(), SchedulerError> {
        let accounting = self.accounting(job_id)?;
        let exit_status = exit_status_re()
            .captures(&accounting)
            .map(|caps| caps[1].to_string());
        if exit_status.as_deref() == Some("0") {
            return Ok(());
        }
        Err(SchedulerError::JobFailed {
            job_id: job_id.to_string(),
            details: accounting.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandError;
    use crate::scheduler::tests::executor;
    use assert_matches::assert_matches;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const QHOST: &str = "HOSTNAME                ARCH         NCPU NSOC NCOR NTHR  LOAD  MEMTOT  MEMUSE  SWAPTO  SWAPUS
----------------------------------------------------------------------------------------------
global                  -               -    -    -    -     -       -       -       -       -
ip-10-0-127-234         lx-amd64        4    1    2    4  0.01    7.5G  298.1M     0.0       0.0
ip-10-0-138-15          lx-amd64        4    1    2    4  0.01    7.5G  297.7M     0.0       0.0
";

    #[rstest]
    #[case::defaults(JobOptions::default(), "")]
    #[case::slots_on_single_node(JobOptions { nodes: 1, slots: Some(4), host: None }, " -pe mpi 4")]
    #[case::slots_across_nodes(JobOptions { nodes: 3, slots: Some(4), host: None }, " -pe mpi 12")]
    #[case::slots_saturate(JobOptions { nodes: 2, slots: Some(u32::MAX), host: None }, " -pe mpi 4294967295")]
    #[case::host(JobOptions::on_host("ip-10-0-0-1"), " -l hostname=ip-10-0-0-1")]
    fn flags(#[case] options: JobOptions, #[case] expected: &str) {
        assert_eq!(submission_flags(&options), expected);
    }

    #[test]
    fn compute_nodes_from_qhost() {
        let executor = executor(|_| Ok(CommandOutput::from_stdout(QHOST)));
        let sge = SgeCommands::new(&executor);
        assert_eq!(
            sge.get_compute_nodes().unwrap(),
            vec!["ip-10-0-127-234", "ip-10-0-138-15"]
        );
    }

    #[test]
    fn nodes_status_is_unsupported() {
        let executor = executor(|_| Ok(CommandOutput::default()));
        assert_matches!(
            SgeCommands::new(&executor).get_nodes_status(),
            Err(SchedulerError::Unsupported { scheduler: "sge", .. })
        );
    }

    #[test]
    fn job_id_from_qsub_output() {
        let executor = executor(|_| Ok(CommandOutput::default()));
        let sge = SgeCommands::new(&executor);
        assert_eq!(
            sge.assert_job_submitted(r#"Your job 7 ("STDIN") has been submitted"#)
                .unwrap(),
            "7"
        );
    }

    #[test]
    fn wait_until_accounting_is_available() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let executor = executor(move |command| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(CommandError::ExitStatus {
                    command: command.to_string(),
                    code: Some(1),
                    stdout: String::new(),
                    stderr: "error: job id 7 not found".to_string(),
                });
            }
            Ok(CommandOutput::from_stdout("jobnumber    7\nfailed       0\nexit_status  0\n"))
        });
        let sge = SgeCommands::new(&executor).with_poll_policy(RetryPolicy::fixed(3, Duration::ZERO));

        sge.wait_job_completed("7").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        sge.assert_job_succeeded("7").unwrap();
    }

    #[test]
    fn non_zero_exit_status_fails() {
        let executor = executor(|_| {
            Ok(CommandOutput::from_stdout("jobnumber    7\nfailed       0\nexit_status  2\n"))
        });
        assert_matches!(
            SgeCommands::new(&executor).assert_job_succeeded("7"),
            Err(SchedulerError::JobFailed { job_id, .. }) => assert_eq!(job_id, "7")
        );
    }
}
