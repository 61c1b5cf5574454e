use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use framecast::ffmpeg::EncodeOptions;
use framecast::observability::log_snapshot;
use framecast::pipeline::{Pipeline, PipelineConfig};
use framecast::probe::probe_geometry;
use framecast::server::StreamServer;
use framecast::transform::{ExternalTransform, Transform};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing()?;

    match cli.command {
        Commands::Run {
            input,
            output_dir,
            transform,
            darken_factor,
            transform_cmd,
            segment_seconds,
            serve,
            print_metrics,
            ffmpeg,
            ffprobe,
        } => run_pipeline(RunArgs {
            input,
            output_dir,
            transform,
            darken_factor,
            transform_cmd,
            segment_seconds,
            serve,
            print_metrics,
            ffmpeg,
            ffprobe,
        }),
        Commands::Serve { dir, listen } => serve_streams(dir, listen),
        Commands::Probe { input, ffprobe } => probe_input(input, ffprobe),
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

struct RunArgs {
    input: PathBuf,
    output_dir: PathBuf,
    transform: TransformKind,
    darken_factor: f32,
    transform_cmd: Option<String>,
    segment_seconds: u32,
    serve: Option<String>,
    print_metrics: bool,
    ffmpeg: String,
    ffprobe: String,
}

fn run_pipeline(args: RunArgs) -> Result<()> {
    let transform = if let Some(command) = &args.transform_cmd {
        Transform::External(ExternalTransform::spawn(command)?)
    } else {
        match args.transform {
            TransformKind::Identity => Transform::Identity,
            TransformKind::Darken => Transform::darken(args.darken_factor),
        }
    };

    let mut config = PipelineConfig::new(args.input, args.output_dir.clone());
    config.encode = EncodeOptions {
        segment_seconds: args.segment_seconds,
    };
    config.ffmpeg_program = args.ffmpeg;
    config.ffprobe_program = args.ffprobe;

    let mut pipeline = Pipeline::new(config, transform);

    let cancel = pipeline.cancel_token();
    ctrlc::set_handler(move || {
        warn!("Interrupt received; stopping after the current frame");
        cancel.cancel();
    })
    .context("Failed to install interrupt handler")?;

    let server = match &args.serve {
        Some(addr_str) => {
            let addr: SocketAddr = addr_str
                .parse()
                .with_context(|| format!("Invalid serve address: {addr_str}"))?;
            Some(StreamServer::start(
                addr,
                args.output_dir.clone(),
                Some(pipeline.metrics()),
            )?)
        }
        None => None,
    };

    let metrics = pipeline.metrics();
    let report = pipeline.run()?;

    if args.print_metrics {
        log_snapshot(&metrics.snapshot());
    }

    info!(
        frames = report.frames,
        playlist = %report.playlist.display(),
        "Run complete"
    );
    println!("{}", report.playlist.display());

    if let Some(mut server) = server {
        server.stop();
    }

    Ok(())
}

fn serve_streams(dir: PathBuf, listen: String) -> Result<()> {
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("Invalid listen address: {listen}"))?;
    let mut server = StreamServer::start(addr, dir, None)?;

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("Failed to install interrupt handler")?;

    info!(address = %server.address(), "Serving; press Ctrl-C to stop");
    let _ = stop_rx.recv();
    server.stop();
    Ok(())
}

fn probe_input(input: PathBuf, ffprobe: String) -> Result<()> {
    let geometry = probe_geometry(&ffprobe, &input)?;
    println!("{}", serde_json::to_string_pretty(&geometry)?);
    Ok(())
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransformKind {
    Identity,
    Darken,
}

#[derive(Parser)]
#[command(
    name = "framecast",
    version,
    about = "Streams a video through a per-frame transform into segmented HLS output"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transcode one input file into a transformed HLS stream.
    Run {
        input: PathBuf,
        #[arg(long, default_value = "videos")]
        output_dir: PathBuf,
        #[arg(long, value_enum, default_value_t = TransformKind::Darken)]
        transform: TransformKind,
        #[arg(long, default_value_t = 0.5)]
        darken_factor: f32,
        /// Pipe each raw frame through this shell command instead of the
        /// built-in transforms.
        #[arg(long)]
        transform_cmd: Option<String>,
        #[arg(long, default_value_t = 5)]
        segment_seconds: u32,
        /// Serve the output directory over HTTP while the run progresses.
        #[arg(long)]
        serve: Option<String>,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long, default_value = "ffmpeg")]
        ffmpeg: String,
        #[arg(long, default_value = "ffprobe")]
        ffprobe: String,
    },
    /// Serve previously produced streams and the playback page.
    Serve {
        #[arg(long, default_value = "videos")]
        dir: PathBuf,
        #[arg(long, default_value = "0.0.0.0:3000")]
        listen: String,
    },
    /// Print the probed geometry of an input file as JSON.
    Probe {
        input: PathBuf,
        #[arg(long, default_value = "ffprobe")]
        ffprobe: String,
    },
}
