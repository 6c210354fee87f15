use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration: {0}")]
    Config(String),

    #[error("cannot impose a plain F0 and an interpolated F0 in the same run")]
    ConflictingF0Imposition,

    #[error("acoustic generator `{0}` unknown")]
    UnknownGenerator(String),

    #[error("renderer `{0}` unknown")]
    UnknownRenderer(String),

    #[error("missing label file {}", .0.display())]
    MissingLabelFile(PathBuf),

    #[error("stream `{kind}` needs the delta and the acceleration windows, got {count} window file(s)")]
    MissingWindows { kind: String, count: usize },

    #[error("cannot spawn `{program}`: {source}")]
    ToolSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` failed ({status}): {output}")]
    CommandFailed {
        program: String,
        status: String,
        output: String,
    },

    #[error("{}:{line}: malformed duration line `{content}`", path.display())]
    MalformedDuration {
        path: PathBuf,
        line: usize,
        content: String,
    },

    #[error("{}: {reason}", path.display())]
    MalformedStream { path: PathBuf, reason: String },

    #[error("{stage} failed for `{base}` ({status})")]
    StageFailed {
        stage: String,
        base: String,
        status: String,
    },

    #[error("run cancelled")]
    Cancelled,
}
