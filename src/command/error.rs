use thiserror::Error;

/// Process-level failures: the command could not be run or exited non-zero.
///
/// A command that exits successfully but prints a failure marker is not a
/// `CommandError`, callers inspect the captured output for that.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("command `{command}` could not be started: `{source}`")]
    NotStarted {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command `{command}` exited with `{code:?}`\nStdout: {stdout}\nStderr: {stderr}")]
    ExitStatus {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}
