//! # specreduce
//!
//! Data reduction for a multi-fiber spectrograph: read exposure products
//! from FITS, apply per-fiber flat-field corrections, estimate and subtract
//! the sky background from designated sky fibers, and record QA metrics and
//! figures along the way.
//!
//! ## Layout
//!
//! - [`frame`], [`fiberflat`], [`sky`], [`fluxcalib`], [`image`],
//!   [`fibermap`]: the data products and the numeric operations on them
//! - [`io`]: FITS container plus typed read/write for every product, the
//!   brick coadd file, and the production path layout
//! - [`qa`]: QA records, metric evaluation and PNG figures
//! - [`stats`]: the small statistical toolbox the above share
//!
//! ## Example
//!
//! ```no_run
//! use specreduce::fiberflat::apply_fiberflat;
//! use specreduce::io::{read_fiberflat, read_fibermap, read_frame, write_sky};
//! use specreduce::sky::compute_sky;
//!
//! # fn main() -> specreduce::Result<()> {
//! let mut frame = read_frame("frame-b0-00000012.fits")?;
//! let fibermap = read_fibermap("fibermap-00000012.fits")?;
//! let flat = read_fiberflat("fiberflat-b0-00000012.fits")?;
//! apply_fiberflat(&mut frame, &flat)?;
//! let sky = compute_sky(&frame, &fibermap)?;
//! write_sky("sky-b0-00000012.fits", &sky)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_precision_loss)]

pub mod error;
pub mod fiberflat;
pub mod fibermap;
pub mod fluxcalib;
pub mod frame;
pub mod image;
pub mod io;
pub mod qa;
pub mod sky;
pub mod stats;

pub use error::{Error, Result};
pub use fiberflat::FiberFlat;
pub use fibermap::Fibermap;
pub use fluxcalib::FluxCalib;
pub use frame::Frame;
pub use image::Image;
pub use sky::SkyModel;
