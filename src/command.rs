//! Instrumenter backed by an external command
//!
//! The command receives the JavaScript source on stdin and writes the
//! instrumented source to stdout. Options travel as canonical JSON in the
//! `INSTRUMENT_OPTIONS` environment variable and `INSTRUMENT_MODE` selects
//! between `instrument` and `prefix`.

use crate::error::{InstrumentError, Result};
use crate::gateway::Instrumenter;
use crate::options::TransformOptions;
use std::io::Write;
use std::process::{Command, ExitStatus, Stdio};
use std::string::FromUtf8Error;
use std::thread;
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

/// Environment variable carrying the canonical options JSON
pub const OPTIONS_ENV: &str = "INSTRUMENT_OPTIONS";

/// Environment variable selecting the operation
pub const MODE_ENV: &str = "INSTRUMENT_MODE";

/// Operation requested from the command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    /// Instrument the source on stdin
    Instrument,
    /// Print the bootstrap code for HTML pages
    Prefix,
}

impl CommandMode {
    /// Value passed in `INSTRUMENT_MODE`
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandMode::Instrument => "instrument",
            CommandMode::Prefix => "prefix",
        }
    }
}

/// Why a single command run failed
#[derive(Error, Debug)]
pub enum CommandFailure {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        source: std::io::Error,
    },

    #[error("stdin writer for {program} panicked")]
    WriterPanicked { program: String },

    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("{program} produced invalid UTF-8: {source}")]
    InvalidOutput {
        program: String,
        source: FromUtf8Error,
    },
}

/// Runs a configured program once per instrumenter call
#[derive(Debug, Clone)]
pub struct CommandInstrumenter {
    program: String,
    args: Vec<String>,
}

impl CommandInstrumenter {
    /// Create an instrumenter running `program` with `args`
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        CommandInstrumenter {
            program: program.into(),
            args,
        }
    }

    /// Build from a `[program, args...]` list as found in the config
    pub fn from_command_line(command: &[String]) -> Result<Self> {
        match command.split_first() {
            Some((program, args)) if !program.trim().is_empty() => {
                Ok(Self::new(program.clone(), args.to_vec()))
            }
            _ => Err(InstrumentError::ConfigError(
                "instrumenter_command must start with a program name".to_string(),
            )),
        }
    }

    /// The program being run
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the command, returning its stdout
    ///
    /// On a multi-threaded tokio runtime the worker hands its other tasks
    /// off while the child runs.
    fn run(
        &self,
        mode: CommandMode,
        input: &str,
        options_json: String,
    ) -> std::result::Result<String, CommandFailure> {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.run_child(mode, input, options_json))
            }
            _ => self.run_child(mode, input, options_json),
        }
    }

    fn run_child(
        &self,
        mode: CommandMode,
        input: &str,
        options_json: String,
    ) -> std::result::Result<String, CommandFailure> {
        debug!(
            "Running instrumenter command {} (mode={}, {} bytes)",
            self.program,
            mode.as_str(),
            input.len()
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(OPTIONS_ENV, options_json)
            .env(MODE_ENV, mode.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CommandFailure::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Feed stdin from a separate thread so a full stdout pipe cannot block us
        let writer = child.stdin.take().map(|mut stdin| {
            let input = input.to_owned();
            thread::spawn(move || stdin.write_all(input.as_bytes()))
        });

        let output = child.wait_with_output().map_err(|source| CommandFailure::Wait {
            program: self.program.clone(),
            source,
        })?;

        if let Some(writer) = writer {
            match writer.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Instrumenter {} closed stdin early: {}", self.program, e),
                Err(_) => {
                    return Err(CommandFailure::WriterPanicked {
                        program: self.program.clone(),
                    })
                }
            }
        }

        if !output.status.success() {
            return Err(CommandFailure::Exit {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        String::from_utf8(output.stdout).map_err(|source| CommandFailure::InvalidOutput {
            program: self.program.clone(),
            source,
        })
    }
}

impl Instrumenter for CommandInstrumenter {
    fn instrument(&self, source: &str, options: &TransformOptions) -> Result<String> {
        let options_json = options.canonical_json()?;
        self.run(CommandMode::Instrument, source, options_json)
            .map_err(|e| InstrumentError::transform(options.path_or_default(), e.to_string()))
    }

    fn instrumentation_prefix(&self, options: &TransformOptions) -> Result<String> {
        let options_json = options.canonical_json()?;
        self.run(CommandMode::Prefix, "", options_json)
            .map_err(|e| InstrumentError::PrefixError(e.to_string()))
    }
}
