//! Running external tools (`wg`, `ip`, `ping`).

use std::{fmt, io, process};

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("`{0}` is not installed")]
    NotFound(String),
    #[error("failed to run `{command}`")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` exited with {}: {}", output.status, output.stderr.trim())]
    NonZero { command: String, output: Output },
}

impl Error {
    pub fn kind(&self) -> crate::ErrorKind {
        match self {
            Error::NotFound(_) => crate::ErrorKind::Resource,
            Error::Io { .. } | Error::NonZero { .. } => crate::ErrorKind::TransientExternal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Output {
    pub status: process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl From<process::Output> for Output {
    fn from(value: process::Output) -> Self {
        Self {
            status: value.status,
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A program and its arguments. Displays as the shell line it stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    program: String,
    args: Vec<String>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: ToString,
    {
        self.args.extend(args.into_iter().map(|a| a.to_string()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    /// Runs `cmd` to completion. A non-zero exit status is an error.
    async fn run(&self, cmd: &Command) -> Result<Output>;
}

/// Runs commands as child processes of this one.
#[derive(Debug, Default, Clone, Copy)]
pub struct Runner;

#[async_trait]
impl CommandRunner for Runner {
    async fn run(&self, cmd: &Command) -> Result<Output> {
        let mut child = tokio::process::Command::new(&cmd.program);
        child
            .args(&cmd.args)
            .stdin(process::Stdio::null())
            .stdout(process::Stdio::piped())
            .stderr(process::Stdio::piped())
            // Callers bound commands with timeouts; the child must not outlive them.
            .kill_on_drop(true);

        tracing::debug!(%cmd, "running command");

        let output: Output = match child.output().await {
            Ok(output) => output.into(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(cmd.program.clone()))
            }
            Err(source) => {
                return Err(Error::Io {
                    command: cmd.to_string(),
                    source,
                })
            }
        };

        if !output.status.success() {
            tracing::debug!(?output.stderr, ?output.status, %cmd, "command returned non-zero status");
            return Err(Error::NonZero {
                command: cmd.to_string(),
                output,
            });
        }

        Ok(output)
    }
}
