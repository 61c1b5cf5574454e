use std::io::{Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::frame::Frame;

/// Per-frame transformation, applied in-process between the decode and
/// encode streams. A tagged choice selected by configuration at startup;
/// every variant maps a frame to a frame of identical byte length.
pub enum Transform {
    /// Passes frames through untouched.
    Identity,
    /// Multiplies every channel by a constant factor in `0.0..=1.0`.
    Darken(f32),
    /// Pipes each frame through an external inference process.
    External(ExternalTransform),
}

impl Transform {
    pub fn darken(factor: f32) -> Self {
        Transform::Darken(factor.clamp(0.0, 1.0))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transform::Identity => "identity",
            Transform::Darken(_) => "darken",
            Transform::External(_) => "external",
        }
    }

    /// Transforms one frame. `frame_index` identifies the frame in error
    /// reports. Any failure is fatal for the run; there is no per-frame
    /// skip or retry.
    pub fn apply(&mut self, frame_index: u64, frame: Frame) -> Result<Frame, PipelineError> {
        match self {
            Transform::Identity => Ok(frame),
            Transform::Darken(factor) => {
                let factor = *factor;
                let mut frame = frame;
                for byte in frame.bytes_mut() {
                    *byte = (f32::from(*byte) * factor) as u8;
                }
                Ok(frame)
            }
            Transform::External(external) => external.apply(frame_index, frame),
        }
    }

    /// Releases any resources held by the transform. Reaps the external
    /// inference process when present.
    pub fn finish(&mut self) {
        if let Transform::External(external) = self {
            external.finish();
        }
    }
}

/// A long-lived external process that consumes raw frames on stdin and
/// produces same-sized raw frames on stdout, one out per one in.
pub struct ExternalTransform {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    command: String,
}

impl ExternalTransform {
    /// Launches the inference command through `sh -c`. The process lives
    /// for the whole run and is reaped by [`Transform::finish`].
    pub fn spawn(command: &str) -> Result<Self, PipelineError> {
        info!(command, "Starting external transform process");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|source| PipelineError::Launch {
                tool: format!("sh -c '{command}'"),
                source,
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();

        Ok(Self {
            child,
            stdin,
            stdout,
            command: command.to_string(),
        })
    }

    /// Streams one frame through the child. The write runs on a helper
    /// thread: once a frame outgrows the pipe buffers the child cannot
    /// accept more input until its output is drained, so writing and then
    /// reading sequentially would deadlock.
    fn apply(&mut self, frame_index: u64, frame: Frame) -> Result<Frame, PipelineError> {
        let transform_err = |reason: String| PipelineError::Transform {
            frame: frame_index,
            reason,
        };

        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| transform_err("transform process output already closed".into()))?;
        let mut stdin = self
            .stdin
            .take()
            .ok_or_else(|| transform_err("transform process input already closed".into()))?;

        let geometry = frame.geometry();
        let bytes = frame.into_bytes();
        let mut buffer = vec![0u8; bytes.len()];

        let writer = std::thread::spawn(move || {
            let result = stdin.write_all(&bytes).and_then(|_| stdin.flush());
            (stdin, result)
        });
        let read_result = stdout.read_exact(&mut buffer);

        let (stdin, write_result) = writer
            .join()
            .map_err(|_| transform_err("transform writer thread panicked".into()))?;
        self.stdin = Some(stdin);

        write_result
            .map_err(|err| transform_err(format!("write to transform process failed: {err}")))?;
        read_result
            .map_err(|err| transform_err(format!("read from transform process failed: {err}")))?;

        Ok(Frame::new(geometry, buffer))
    }

    fn finish(&mut self) {
        self.stdin.take();
        self.stdout.take();
        match self.child.wait() {
            Ok(status) if status.success() => {
                debug!(command = self.command.as_str(), "Transform process reaped");
            }
            Ok(status) => {
                warn!(
                    command = self.command.as_str(),
                    %status,
                    "Transform process exited abnormally"
                );
            }
            Err(err) => {
                warn!(
                    command = self.command.as_str(),
                    error = %err,
                    "Failed to reap transform process"
                );
            }
        }
    }
}
