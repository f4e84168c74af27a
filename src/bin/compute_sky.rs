//! Compute the sky model for one frame of one exposure.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use specreduce::fiberflat::apply_fiberflat;
use specreduce::io::{
    read_fiberflat, read_fibermap, read_frame, read_qa_exposure, write_qa_exposure, write_sky,
};
use specreduce::qa::{plots::frame_skyres, qa_skysub, QaExposure};
use specreduce::sky::{compute_sky, sky_fiber_rows};
use specreduce::Error;

/// Exit code when the fibermap designates no sky fiber in the frame's range
const EXIT_NO_SKY_FIBERS: u8 = 12;

#[derive(Parser, Debug)]
#[command(
    name = "compute_sky",
    about = "Compute the sky model of a frame after fiberflat correction"
)]
struct Args {
    /// Input frame FITS file
    #[arg(long)]
    infile: PathBuf,

    /// Fibermap FITS file naming the sky fibers
    #[arg(long)]
    fibermap: PathBuf,

    /// Fiberflat FITS file to apply before sky estimation
    #[arg(long)]
    fiberflat: PathBuf,

    /// Output sky model FITS file
    #[arg(long)]
    outfile: PathBuf,

    /// QA YAML file, updated in place when it already exists
    #[arg(long)]
    qafile: Option<PathBuf>,

    /// Sky-residual QA figure (PNG)
    #[arg(long)]
    qafig: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            match err.downcast_ref::<Error>() {
                Some(Error::NoSkyFibers { .. }) => ExitCode::from(EXIT_NO_SKY_FIBERS),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let mut frame = read_frame(&args.infile)
        .with_context(|| format!("reading frame {}", args.infile.display()))?;
    let fibermap = read_fibermap(&args.fibermap)
        .with_context(|| format!("reading fibermap {}", args.fibermap.display()))?;

    // fail before the heavy work when no sky fiber is in range
    let rows = sky_fiber_rows(&frame, &fibermap)?;
    info!(nsky = rows.len(), "sky fibers located");

    let flat = read_fiberflat(&args.fiberflat)
        .with_context(|| format!("reading fiberflat {}", args.fiberflat.display()))?;
    apply_fiberflat(&mut frame, &flat).context("applying fiberflat")?;

    let sky = compute_sky(&frame, &fibermap).context("computing sky model")?;

    if let Some(qafile) = &args.qafile {
        let mut qa = if qafile.exists() {
            read_qa_exposure(qafile)
                .with_context(|| format!("reading QA file {}", qafile.display()))?
        } else {
            QaExposure::new("science")
        };
        let camera = frame
            .meta
            .get_str("CAMERA")
            .unwrap_or("unknown")
            .to_string();
        let qaframe = qa.frame_mut(&camera);
        qaframe.init_skysub();
        qa_skysub(qaframe, &frame, &fibermap, &sky).context("evaluating sky QA")?;
        if let Some(qafig) = &args.qafig {
            frame_skyres(qafig, &frame, &fibermap, &sky, &qa.frames[&camera])
                .with_context(|| format!("rendering QA figure {}", qafig.display()))?;
        }
        write_qa_exposure(qafile, &qa)
            .with_context(|| format!("writing QA file {}", qafile.display()))?;
    }

    write_sky(&args.outfile, &sky)
        .with_context(|| format!("writing sky model {}", args.outfile.display()))?;
    info!(outfile = %args.outfile.display(), "sky model written");
    Ok(())
}
