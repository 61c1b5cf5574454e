use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{PipelineError, Stage};
use crate::ffmpeg::{
    DecodeProcess, EncodeOptions, EncodeProcess, decode_command, encode_command,
    unique_playlist_path,
};
use crate::frame::{FrameReader, FrameWriter, MediaGeometry};
use crate::observability::MetricsCollector;
use crate::probe::probe_geometry;
use crate::transform::Transform;

/// Everything the driver needs to know up front. Passed in explicitly;
/// the pipeline keeps no ambient global state.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub encode: EncodeOptions,
    pub ffmpeg_program: String,
    pub ffprobe_program: String,
}

impl PipelineConfig {
    pub fn new(input: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output_dir: output_dir.into(),
            encode: EncodeOptions::default(),
            ffmpeg_program: "ffmpeg".to_string(),
            ffprobe_program: "ffprobe".to_string(),
        }
    }
}

/// Requests a graceful stop. Checked by the driver between frames; a run
/// cannot be interrupted mid-frame.
#[derive(Debug, Default, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a completed run.
#[derive(Debug)]
pub struct PipelineReport {
    pub frames: u64,
    pub playlist: PathBuf,
    pub cancelled: bool,
    pub elapsed: Duration,
}

enum LoopExit {
    EndOfStream,
    Cancelled,
    Failed(PipelineError),
}

/// Owns the read -> transform -> write loop and the lifecycle of both
/// external processes.
pub struct Pipeline {
    config: PipelineConfig,
    transform: Transform,
    cancel: CancelToken,
    metrics: MetricsCollector,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, transform: Transform) -> Self {
        Self {
            config,
            transform,
            cancel: CancelToken::new(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    /// Runs the whole pipeline: probe, spawn decoder then encoder, stream
    /// every frame, shut both processes down, and check their exit codes.
    pub fn run(&mut self) -> Result<PipelineReport, PipelineError> {
        match self.setup() {
            Ok((geometry, decoder, encoder)) => self.execute(geometry, decoder, encoder),
            Err(err) => {
                // An external transform may already be running; it must be
                // reaped even when nothing else was spawned.
                self.transform.finish();
                Err(err)
            }
        }
    }

    /// Probes the input and spawns both external processes. Leaks nothing
    /// on failure: the decoder is torn down when the encoder cannot start.
    fn setup(&self) -> Result<(MediaGeometry, DecodeProcess, EncodeProcess), PipelineError> {
        let geometry = probe_geometry(&self.config.ffprobe_program, &self.config.input)?;

        fs::create_dir_all(&self.config.output_dir).map_err(|source| {
            PipelineError::OutputDir {
                path: self.config.output_dir.clone(),
                source,
            }
        })?;
        let playlist = unique_playlist_path(&self.config.output_dir);

        let mut decoder = DecodeProcess::spawn(decode_command(
            &self.config.ffmpeg_program,
            &self.config.input,
        ))?;

        let encoder = match EncodeProcess::spawn(
            encode_command(
                &self.config.ffmpeg_program,
                geometry,
                &self.config.encode,
                &playlist,
            ),
            playlist,
        ) {
            Ok(encoder) => encoder,
            Err(err) => {
                // The decoder is already running and must not be leaked.
                decoder.kill();
                let _ = decoder.wait();
                return Err(err);
            }
        };

        Ok((geometry, decoder, encoder))
    }

    /// Drives the frame loop against already-spawned processes and then
    /// performs the shutdown sequence on every exit path: reap the
    /// decoder first, close the encoder's input exactly once, reap the
    /// encoder. Nonzero exits are surfaced even when the loop itself
    /// finished cleanly.
    pub fn execute(
        &mut self,
        geometry: MediaGeometry,
        mut decoder: DecodeProcess,
        mut encoder: EncodeProcess,
    ) -> Result<PipelineReport, PipelineError> {
        self.metrics.reset();
        let started = Instant::now();
        let playlist = encoder.playlist().to_path_buf();

        let stdout = decoder.take_stdout();
        let stdin = encoder.take_stdin();
        let (stdout, stdin) = match (stdout, stdin) {
            (Some(out), Some(inp)) => (out, inp),
            _ => {
                decoder.kill();
                let _ = decoder.wait();
                let _ = encoder.wait();
                return Err(PipelineError::FrameRead {
                    source: io::Error::other("process stdio was not captured"),
                });
            }
        };

        let mut reader = FrameReader::new(stdout, geometry);
        let mut writer = FrameWriter::new(stdin);
        let mut frames = 0u64;

        info!(
            width = geometry.width,
            height = geometry.height,
            transform = self.transform.name(),
            "Pipeline running"
        );

        let exit = loop {
            if self.cancel.is_cancelled() {
                break LoopExit::Cancelled;
            }

            let frame = {
                let _timer = self.metrics.start_stage("read");
                match reader.read_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break LoopExit::EndOfStream,
                    Err(err) => break LoopExit::Failed(err),
                }
            };

            let frame = {
                let _timer = self.metrics.start_stage("transform");
                match self.transform.apply(frames, frame) {
                    Ok(frame) => frame,
                    Err(err) => break LoopExit::Failed(err),
                }
            };

            {
                let _timer = self.metrics.start_stage("write");
                if let Err(err) = writer.write_frame(&frame) {
                    break LoopExit::Failed(err);
                }
            }

            frames += 1;
            self.metrics.record_frame();
        };

        let end_of_stream = matches!(exit, LoopExit::EndOfStream);
        let cancelled = matches!(exit, LoopExit::Cancelled);

        self.transform.finish();

        // Shutdown sequence, executed on every exit path. The decoder is
        // reaped first; when the loop did not drain its stream it is
        // killed, since a producer blocked on a full pipe never exits.
        drop(reader);
        if !end_of_stream {
            decoder.kill();
        }
        let decode_status = decoder.wait();

        // Closing the writer closes the encoder's stdin, the one and only
        // end-of-input signal. Only then can the encoder be reaped.
        drop(writer);
        let encode_status = encoder.wait();

        if let LoopExit::Failed(err) = exit {
            warn!(error = %err, frames, "Pipeline aborted");
            return Err(err);
        }

        let decode_status = decode_status?;
        let encode_status = encode_status?;
        if !cancelled {
            check_exit(Stage::Decode, decode_status)?;
        }
        check_exit(Stage::Encode, encode_status)?;

        let elapsed = started.elapsed();
        self.metrics.record_total_duration(elapsed);
        info!(
            frames,
            cancelled,
            playlist = %playlist.display(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Pipeline finished"
        );

        Ok(PipelineReport {
            frames,
            playlist,
            cancelled,
            elapsed,
        })
    }
}

fn check_exit(stage: Stage, status: ExitStatus) -> Result<(), PipelineError> {
    if status.success() {
        Ok(())
    } else {
        Err(PipelineError::ExternalProcess {
            stage,
            code: status.code().unwrap_or(-1),
        })
    }
}
