use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The pipeline stage an external process belongs to, used when reporting
/// exit statuses observed at reap time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decode,
    Encode,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Decode => f.write_str("decode"),
            Stage::Encode => f.write_str("encode"),
        }
    }
}

/// Every way a pipeline run can fail. All variants abort the run; partial
/// output already written to disk is left in place for inspection.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("probe of '{path}' failed: {reason}")]
    Probe { path: PathBuf, reason: String },

    #[error("failed to launch {tool}")]
    Launch {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("decode stream truncated mid-frame: expected {expected} bytes, got {got}")]
    TruncatedFrame { expected: usize, got: usize },

    #[error("failed to read from decode stream")]
    FrameRead {
        #[source]
        source: io::Error,
    },

    #[error("transform failed on frame {frame}: {reason}")]
    Transform { frame: u64, reason: String },

    #[error("encoder input pipe closed early (encoder process died)")]
    BrokenPipe {
        #[source]
        source: io::Error,
    },

    #[error("failed to write to encode stream")]
    FrameWrite {
        #[source]
        source: io::Error,
    },

    #[error("{stage} process exited with status {code}")]
    ExternalProcess { stage: Stage, code: i32 },

    #[error("failed to create output directory '{path}'")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to reap {stage} process")]
    Reap {
        stage: Stage,
        #[source]
        source: io::Error,
    },
}

impl PipelineError {
    pub(crate) fn from_write_error(source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::BrokenPipe {
            PipelineError::BrokenPipe { source }
        } else {
            PipelineError::FrameWrite { source }
        }
    }
}
