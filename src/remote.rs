use std::path::{Path, PathBuf};

use tracing::debug;

use crate::cloud::CloudProvider;
use crate::cluster::{Cluster, ClusterError};
use crate::command::{CommandError, CommandLine, CommandOutput, CommandRunner};

const SSH_OPTIONS: [&str; 8] = [
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "BatchMode=yes",
    "-o",
    "LogLevel=ERROR",
];

/// Runs commands on the cluster master node over ssh.
pub struct RemoteCommandExecutor<R> {
    runner: R,
    user_at_host: String,
    ssh_key: PathBuf,
}

impl<R: CommandRunner> RemoteCommandExecutor<R> {
    /// Connects to the master node of `cluster` as the default user of its os.
    pub fn for_cluster<C>(runner: R, cluster: &Cluster, cloud: &C) -> Result<Self, ClusterError>
    where
        C: CloudProvider + ?Sized,
    {
        let user = cluster.username()?;
        let host = cluster.master_ip(cloud)?;
        Ok(Self::new(runner, user, &host, cluster.ssh_key()))
    }

    pub fn new(runner: R, user: &str, host: &str, ssh_key: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            user_at_host: format!("{user}@{host}"),
            ssh_key: ssh_key.into(),
        }
    }

    /// Runs `command` in a login shell on the remote host.
    pub fn run_remote_command(&self, command: &str) -> Result<CommandOutput, CommandError> {
        debug!(host = %self.user_at_host, command, "running remote command");
        let ssh = CommandLine::new("ssh")
            .arg("-i")
            .arg(self.ssh_key.to_string_lossy())
            .args(SSH_OPTIONS)
            .arg(&self.user_at_host)
            .arg(format!("bash --login -c {}", shell_quote(command)));
        self.runner.run(&ssh)
    }

    /// Copies a local file to `remote_path`, relative paths land in the user home.
    pub fn copy_to_remote(&self, local_path: &Path, remote_path: &str) -> Result<(), CommandError> {
        debug!(host = %self.user_at_host, local = %local_path.display(), remote_path, "copying file");
        let scp = CommandLine::new("scp")
            .arg("-i")
            .arg(self.ssh_key.to_string_lossy())
            .args(SSH_OPTIONS)
            .arg(local_path.to_string_lossy())
            .arg(format!("{}:{remote_path}", self.user_at_host));
        self.runner.run(&scp)?;
        Ok(())
    }
}

/// File name a local file gets once copied to the remote home directory.
pub(crate) fn remote_file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

/// Quotes `value` as a single shell word.
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{MockCloudProvider, StackOutputs};
    use crate::cluster::tests::cluster_with;
    use crate::command::MockCommandRunner;
    use crate::config::ClusterConfig;
    use mockall::predicate;

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("mkdir -p /shared"), "'mkdir -p /shared'");
        assert_eq!(shell_quote("echo 'a'"), r"'echo '\''a'\'''");
    }

    #[test]
    fn remote_command_goes_through_ssh() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .once()
            .with(predicate::function(|c: &CommandLine| {
                c.program == "ssh"
                    && c.args[..2] == ["-i".to_string(), "/tmp/key.pem".to_string()]
                    && c.args.contains(&"centos@54.1.2.3".to_string())
                    && c.args.last().map(String::as_str)
                        == Some("bash --login -c 'cat /shared/file'")
            }))
            .returning(|_| Ok(CommandOutput::from_stdout("content")));

        let executor = RemoteCommandExecutor::new(runner, "centos", "54.1.2.3", "/tmp/key.pem");
        let output = executor.run_remote_command("cat /shared/file").unwrap();
        assert_eq!(output.stdout, "content");
    }

    #[test]
    fn executor_for_cluster_resolves_user_and_host() {
        let mut cloud = MockCloudProvider::new();
        cloud.expect_stack_outputs().once().returning(|_, _| {
            Ok(StackOutputs::from([(
                "MasterPublicIP".to_string(),
                "54.1.2.3".to_string(),
            )]))
        });
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .once()
            .with(predicate::function(|c: &CommandLine| {
                c.args.contains(&"ubuntu@54.1.2.3".to_string())
            }))
            .returning(|_| Ok(CommandOutput::default()));

        let cluster = cluster_with(ClusterConfig::from_sections([(
            "cluster default",
            &[("base_os", "ubuntu1804")],
        )]));
        let executor = RemoteCommandExecutor::for_cluster(runner, &cluster, &cloud).unwrap();
        executor.run_remote_command("hostname").unwrap();
    }
}
