use crate::error::PipelineError;
use anyhow::{Context, Result};
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub status: ExitStatus,
    pub output: String,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// One invocation of an external tool, built as an argument vector.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: OsString,
    args: Vec<OsString>,
    stdin: Option<PathBuf>,
    stdout: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            stdin: None,
            stdout: None,
        }
    }

    /// First element is the program, the rest are leading arguments.
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| PipelineError::Config("empty command line".into()))?;
        Ok(Self::new(program).args(args))
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn stdin_from(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn program(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    pub fn display(&self) -> String {
        let mut line = std::iter::once(&self.program)
            .chain(&self.args)
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        if let Some(stdin) = &self.stdin {
            line.push_str(&format!(" < {}", stdin.display()));
        }
        if let Some(stdout) = &self.stdout {
            line.push_str(&format!(" > {}", stdout.display()));
        }
        line
    }

    /// Runs the command and reports its status. A non-zero exit is logged, not
    /// returned as an error; only a failure to start the process is.
    pub fn run(&self) -> Result<CommandOutcome> {
        info!("Subprocess: \"{}\"", self.display());

        let mut command = Command::new(&self.program);
        command.args(&self.args).stderr(Stdio::piped());
        match &self.stdin {
            Some(path) => {
                command.stdin(open(path)?);
            }
            None => {
                command.stdin(Stdio::null());
            }
        }
        match &self.stdout {
            Some(path) => {
                let file = File::create(path)
                    .with_context(|| format!("cannot create {}", path.display()))?;
                command.stdout(file);
            }
            None => {
                command.stdout(Stdio::piped());
            }
        }

        let output = command.output().map_err(|source| PipelineError::ToolSpawn {
            program: self.program(),
            source,
        })?;
        let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
        captured.push_str(&String::from_utf8_lossy(&output.stderr));
        let captured = captured.trim_end().to_string();

        if output.status.success() {
            if !captured.is_empty() {
                info!("{}", captured);
            }
            info!("Subprocess finished");
        } else {
            error!("Subprocess \"{}\" failed ({})", self.display(), output.status);
            if !captured.is_empty() {
                error!("{}", captured);
            }
        }

        Ok(CommandOutcome {
            status: output.status,
            output: captured,
        })
    }

    /// Like [`run`](Self::run) but a non-zero exit becomes an error.
    pub fn run_checked(&self) -> Result<CommandOutcome> {
        let outcome = self.run()?;
        if !outcome.success() {
            return Err(PipelineError::CommandFailed {
                program: self.program(),
                status: outcome.status.to_string(),
                output: outcome.output,
            }
            .into());
        }
        Ok(outcome)
    }
}

fn open(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("cannot open {}", path.display()))
}
