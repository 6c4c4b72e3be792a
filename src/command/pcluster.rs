use std::path::Path;

use super::{CommandError, CommandLine, CommandOutput, CommandRunner};

pub const PCLUSTER_BINARY: &str = "pcluster";

pub const CREATE_COMPLETE: &str = "CREATE_COMPLETE";
pub const DELETE_FAILED: &str = "DELETE_FAILED";
pub const UPDATE_COMPLETE: &str = "UPDATE_COMPLETE";

/// Thin wrapper over the `pcluster` command line tool.
///
/// Only process-level failures are reported as errors. Whether the operation
/// itself succeeded is decided by the caller from the captured stdout.
pub struct Pcluster<R> {
    runner: R,
    binary: String,
}

impl<R: CommandRunner> Pcluster<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            binary: PCLUSTER_BINARY.to_string(),
        }
    }

    /// Uses a different binary than the one found in `PATH`.
    pub fn with_binary(self, binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            ..self
        }
    }

    pub fn create(&self, config_file: &Path, name: &str) -> Result<CommandOutput, CommandError> {
        self.run_with_config("create", config_file, &[], name)
    }

    pub fn delete(&self, config_file: &Path, name: &str) -> Result<CommandOutput, CommandError> {
        self.run_with_config("delete", config_file, &[], name)
    }

    pub fn update(
        &self,
        config_file: &Path,
        name: &str,
        force: bool,
    ) -> Result<CommandOutput, CommandError> {
        let flags: &[&str] = if force {
            &["--yes", "--force"]
        } else {
            &["--yes"]
        };
        self.run_with_config("update", config_file, flags, name)
    }

    pub fn start(&self, config_file: &Path, name: &str) -> Result<CommandOutput, CommandError> {
        self.run_with_config("start", config_file, &[], name)
    }

    pub fn stop(&self, config_file: &Path, name: &str) -> Result<CommandOutput, CommandError> {
        self.run_with_config("stop", config_file, &[], name)
    }

    fn run_with_config(
        &self,
        action: &str,
        config_file: &Path,
        flags: &[&str],
        name: &str,
    ) -> Result<CommandOutput, CommandError> {
        let command = CommandLine::new(&self.binary)
            .arg(action)
            .arg("--config")
            .arg(config_file.to_string_lossy())
            .args(flags.iter().copied())
            .arg(name);
        self.runner.run(&command)
    }
}
