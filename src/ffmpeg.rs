use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PipelineError, Stage};
use crate::frame::MediaGeometry;

/// Segmented-output settings for the encoder.
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    pub segment_seconds: u32,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self { segment_seconds: 5 }
    }
}

/// Builds the decoder invocation: any container/codec in, an unbounded
/// headerless packed-RGB byte stream out on stdout.
pub fn decode_command(program: &str, input: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(["-hide_banner", "-loglevel", "error", "-i"])
        .arg(input)
        .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"]);
    cmd
}

/// Builds the encoder invocation: packed RGB of the given geometry on
/// stdin, an HLS manifest plus fixed-duration segments at `playlist` out.
/// Existing output at the playlist path is overwritten.
pub fn encode_command(
    program: &str,
    geometry: MediaGeometry,
    options: &EncodeOptions,
    playlist: &Path,
) -> Command {
    let segment_pattern = segment_pattern_for(playlist);
    let mut cmd = Command::new(program);
    cmd.args(["-hide_banner", "-loglevel", "error", "-y"])
        .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-s"])
        .arg(format!("{}x{}", geometry.width, geometry.height))
        .args(["-i", "pipe:0"])
        .args(["-f", "hls", "-start_number", "0"])
        .args(["-hls_time", &options.segment_seconds.to_string()])
        .args(["-hls_list_size", "0"])
        .arg("-hls_segment_filename")
        .arg(segment_pattern)
        .arg(playlist);
    cmd
}

/// Manifest path for a new run: unique per run so concurrent pipelines
/// writing into the same directory never collide.
pub fn unique_playlist_path(output_dir: &Path) -> PathBuf {
    output_dir.join(format!("playlist-{}.m3u8", Uuid::new_v4()))
}

fn segment_pattern_for(playlist: &Path) -> PathBuf {
    let stem = playlist
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "playlist".to_string());
    playlist.with_file_name(format!("{stem}-%05d.ts"))
}

/// Forwards a child's stderr to the log line by line on a detached
/// thread. The child must never be left with an unread stderr pipe, or a
/// chatty tool would fill the pipe buffer and stall.
fn drain_stderr(stderr: ChildStderr, tool: String) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            match line {
                Ok(line) if !line.trim().is_empty() => {
                    debug!(tool = tool.as_str(), "{line}");
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    })
}

/// An owned external decoder emitting raw frames on stdout. Must always be
/// reaped via [`DecodeProcess::wait`] before being dropped.
pub struct DecodeProcess {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr_drain: Option<JoinHandle<()>>,
    tool: String,
}

impl DecodeProcess {
    /// Spawns the given command with stdout captured and stderr drained
    /// asynchronously.
    pub fn spawn(mut cmd: Command) -> Result<Self, PipelineError> {
        let tool = cmd.get_program().to_string_lossy().to_string();
        info!(tool = tool.as_str(), "Starting decode process");

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| PipelineError::Launch {
                tool: tool.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr_drain = child.stderr.take().map(|err| drain_stderr(err, tool.clone()));

        Ok(Self {
            child,
            stdout,
            stderr_drain,
            tool,
        })
    }

    /// Hands the raw output stream to the frame reader. Yields once.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Terminates the process. Used on abort paths where nobody will read
    /// the rest of the stream; a decoder blocked on a full pipe would
    /// otherwise never exit.
    pub fn kill(&mut self) {
        let _ = self.child.kill();
    }

    /// Reaps the process, blocking until it exits.
    pub fn wait(&mut self) -> Result<ExitStatus, PipelineError> {
        // Drop our copy of the pipe so the child sees a closed reader.
        self.stdout.take();
        let status = self.child.wait().map_err(|source| PipelineError::Reap {
            stage: Stage::Decode,
            source,
        })?;
        if let Some(drain) = self.stderr_drain.take() {
            let _ = drain.join();
        }
        debug!(tool = self.tool.as_str(), %status, "Decode process reaped");
        Ok(status)
    }
}

/// An owned external encoder consuming raw frames on stdin and writing the
/// segmented output to disk. Closing stdin signals end-of-input; the
/// encoder then finalizes the manifest and remaining segments.
pub struct EncodeProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_drain: Option<JoinHandle<()>>,
    playlist: PathBuf,
    tool: String,
}

impl EncodeProcess {
    pub fn spawn(mut cmd: Command, playlist: PathBuf) -> Result<Self, PipelineError> {
        let tool = cmd.get_program().to_string_lossy().to_string();
        info!(
            tool = tool.as_str(),
            playlist = %playlist.display(),
            "Starting encode process"
        );

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| PipelineError::Launch {
                tool: tool.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let stderr_drain = child.stderr.take().map(|err| drain_stderr(err, tool.clone()));

        Ok(Self {
            child,
            stdin,
            stderr_drain,
            playlist,
            tool,
        })
    }

    /// Hands the raw input stream to the frame writer. Yields once; once
    /// the returned handle is dropped the encoder sees end-of-input.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Closes the input side if this process still owns it.
    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }

    pub fn playlist(&self) -> &Path {
        &self.playlist
    }

    /// Reaps the process, blocking until it exits. The input side must
    /// have been closed first or the encoder will wait for more frames.
    pub fn wait(&mut self) -> Result<ExitStatus, PipelineError> {
        self.close_stdin();
        let status = self.child.wait().map_err(|source| PipelineError::Reap {
            stage: Stage::Encode,
            source,
        })?;
        if let Some(drain) = self.stderr_drain.take() {
            let _ = drain.join();
        }
        debug!(tool = self.tool.as_str(), %status, "Encode process reaped");
        Ok(status)
    }
}
