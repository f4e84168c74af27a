//! Reading and writing pipeline data products.
//!
//! Products live in FITS files with named extensions. Arrays are stored at
//! 32-bit float precision and promoted to f64 on read; masks are u32 in
//! memory and BITPIX 32 on disk, an exact round trip for flag values below
//! 2^31. Free-form metadata rides on the primary header.

pub mod brick;
pub mod fits;

use ndarray::{Array1, Array2, Array3};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::fiberflat::FiberFlat;
use crate::fibermap::Fibermap;
use crate::fluxcalib::FluxCalib;
use crate::frame::Frame;
use crate::image::Image;
use crate::qa::{QaExposure, QaFrame};
use crate::sky::SkyModel;
use crate::{Error, Result};
use fits::{ColumnValues, Data, Fits, Hdu, Table};

/// String column width for OBJTYPE and similar short labels
const OBJTYPE_WIDTH: usize = 10;

// ---------------------------------------------------------------------------
// Array conversions: f64 in memory, f32 on disk
// ---------------------------------------------------------------------------

#[allow(clippy::cast_possible_truncation)]
fn to_f32(values: impl Iterator<Item = f64>) -> Vec<f32> {
    values.map(|v| v as f32).collect()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn mask_to_i32(mask: &Array2<u32>) -> Vec<i32> {
    mask.iter().map(|&m| m as i32).collect()
}

fn shape2(shape: &[usize], name: &str) -> Result<(usize, usize)> {
    match shape {
        [a, b] => Ok((*a, *b)),
        other => Err(Error::ShapeMismatch(format!(
            "extension {name} has {} axes, expected 2",
            other.len()
        ))),
    }
}

/// Pull a 1-d f64 array out of a named image extension
fn read_array1(fits: &Fits, name: &str) -> Result<Array1<f64>> {
    let hdu = fits.require(name)?;
    let values = match &hdu.data {
        Data::F32 { shape, values } if shape.len() == 1 => {
            values.iter().map(|&v| f64::from(v)).collect()
        }
        Data::F64 { shape, values } if shape.len() == 1 => values.clone(),
        _ => {
            return Err(Error::FitsFormat(format!(
                "extension {name} is not a 1-d float image"
            )))
        }
    };
    Ok(Array1::from_vec(values))
}

/// Pull a 2-d f64 array out of a named image extension
fn read_array2(fits: &Fits, name: &str) -> Result<Array2<f64>> {
    let hdu = fits.require(name)?;
    let (dim, values) = match &hdu.data {
        Data::F32 { shape, values } => (
            shape2(shape, name)?,
            values.iter().map(|&v| f64::from(v)).collect(),
        ),
        Data::F64 { shape, values } => (shape2(shape, name)?, values.clone()),
        _ => {
            return Err(Error::FitsFormat(format!(
                "extension {name} is not a 2-d float image"
            )))
        }
    };
    Array2::from_shape_vec(dim, values)
        .map_err(|e| Error::ShapeMismatch(format!("extension {name}: {e}")))
}

#[allow(clippy::cast_sign_loss)]
fn read_mask(fits: &Fits, name: &str) -> Result<Array2<u32>> {
    let hdu = fits.require(name)?;
    let Data::I32 { shape, values } = &hdu.data else {
        return Err(Error::FitsFormat(format!(
            "extension {name} is not an integer image"
        )));
    };
    let dim = shape2(shape, name)?;
    let values: Vec<u32> = values.iter().map(|&v| v as u32).collect();
    Array2::from_shape_vec(dim, values)
        .map_err(|e| Error::ShapeMismatch(format!("extension {name}: {e}")))
}

fn push_2d(fits: &mut Fits, name: &str, array: &Array2<f64>) {
    let (a, b) = array.dim();
    fits.push(Hdu::image_f32(name, &[a, b], to_f32(array.iter().copied())));
}

fn push_wave(fits: &mut Fits, wave: &Array1<f64>) {
    fits.push(Hdu::image_f32(
        "WAVELENGTH",
        &[wave.len()],
        to_f32(wave.iter().copied()),
    ));
}

fn push_mask(fits: &mut Fits, name: &str, mask: &Array2<u32>) {
    let (a, b) = mask.dim();
    fits.push(Hdu::image_i32(name, &[a, b], mask_to_i32(mask)));
}

// ---------------------------------------------------------------------------
// Fibermap <-> binary table
// ---------------------------------------------------------------------------

pub(crate) fn fibermap_to_table(fibermap: &Fibermap) -> Result<Table> {
    fibermap.validate()?;
    let mut table = Table::new();
    table.push_column("FIBER", ColumnValues::I32(fibermap.fiber.clone()))?;
    table.push_column("POSITIONER", ColumnValues::I32(fibermap.positioner.clone()))?;
    table.push_column("SPECTROID", ColumnValues::I32(fibermap.spectroid.clone()))?;
    table.push_column("TARGETID", ColumnValues::I64(fibermap.targetid.clone()))?;
    table.push_column(
        "OBJTYPE",
        ColumnValues::Str {
            width: OBJTYPE_WIDTH,
            values: fibermap.objtype.clone(),
        },
    )?;
    table.push_column("TARGET_RA", ColumnValues::F64(fibermap.target_ra.clone()))?;
    table.push_column("TARGET_DEC", ColumnValues::F64(fibermap.target_dec.clone()))?;
    table.push_column("X_TARGET", ColumnValues::F64(fibermap.x_target.clone()))?;
    table.push_column("Y_TARGET", ColumnValues::F64(fibermap.y_target.clone()))?;
    Ok(table)
}

fn table_i32(table: &Table, name: &str) -> Result<Vec<i32>> {
    match table.column(name) {
        Some(ColumnValues::I32(v)) => Ok(v.clone()),
        Some(_) => Err(Error::FitsFormat(format!("column {name} is not 32-bit integer"))),
        None => Err(Error::MissingExtension(format!("fibermap column {name}"))),
    }
}

fn table_i64(table: &Table, name: &str) -> Result<Vec<i64>> {
    match table.column(name) {
        Some(ColumnValues::I64(v)) => Ok(v.clone()),
        Some(ColumnValues::I32(v)) => Ok(v.iter().map(|&x| i64::from(x)).collect()),
        Some(_) => Err(Error::FitsFormat(format!("column {name} is not integer"))),
        None => Err(Error::MissingExtension(format!("fibermap column {name}"))),
    }
}

fn table_f64(table: &Table, name: &str) -> Result<Vec<f64>> {
    match table.column(name) {
        Some(ColumnValues::F64(v)) => Ok(v.clone()),
        Some(ColumnValues::F32(v)) => Ok(v.iter().map(|&x| f64::from(x)).collect()),
        Some(_) => Err(Error::FitsFormat(format!("column {name} is not float"))),
        None => Err(Error::MissingExtension(format!("fibermap column {name}"))),
    }
}

fn table_str(table: &Table, name: &str) -> Result<Vec<String>> {
    match table.column(name) {
        Some(ColumnValues::Str { values, .. }) => Ok(values.clone()),
        Some(_) => Err(Error::FitsFormat(format!("column {name} is not a string column"))),
        None => Err(Error::MissingExtension(format!("fibermap column {name}"))),
    }
}

pub(crate) fn table_to_fibermap(table: &Table) -> Result<Fibermap> {
    let fibermap = Fibermap {
        fiber: table_i32(table, "FIBER")?,
        positioner: table_i32(table, "POSITIONER")?,
        spectroid: table_i32(table, "SPECTROID")?,
        targetid: table_i64(table, "TARGETID")?,
        objtype: table_str(table, "OBJTYPE")?,
        target_ra: table_f64(table, "TARGET_RA")?,
        target_dec: table_f64(table, "TARGET_DEC")?,
        x_target: table_f64(table, "X_TARGET")?,
        y_target: table_f64(table, "Y_TARGET")?,
    };
    fibermap.validate()?;
    Ok(fibermap)
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// Write a frame: FLUX / IVAR / MASK / WAVELENGTH / FIBERS extensions plus
/// RESOLUTION and FIBERMAP when present.
///
/// `units`, when given, is recorded as BUNIT and wins over any BUNIT
/// already in the frame metadata.
///
/// # Errors
/// Returns I/O and validation errors.
pub fn write_frame<P: AsRef<Path>>(path: P, frame: &Frame, units: Option<&str>) -> Result<()> {
    let mut meta = frame.meta.clone();
    if let Some(u) = units {
        meta.set_with_comment("BUNIT", u, Some("flux units"));
    }
    let mut out = Fits::with_primary_header(meta);
    push_2d(&mut out, "FLUX", frame.flux());
    push_2d(&mut out, "IVAR", frame.ivar());
    push_mask(&mut out, "MASK", frame.mask());
    push_wave(&mut out, frame.wave());
    out.push(Hdu::image_i32(
        "FIBERS",
        &[frame.fibers().len()],
        frame.fibers().to_vec(),
    ));
    if let Some(res) = frame.resolution() {
        let (a, b, c) = res.dim();
        out.push(Hdu::image_f32(
            "RESOLUTION",
            &[a, b, c],
            to_f32(res.iter().copied()),
        ));
    }
    if let Some(fm) = &frame.fibermap {
        out.push(Hdu::table("FIBERMAP", fibermap_to_table(fm)?));
    }
    debug!(path = %path.as_ref().display(), "writing frame");
    out.save(path)
}

/// Read a frame written by [`write_frame`]
///
/// # Errors
/// Returns I/O, format and validation errors.
pub fn read_frame<P: AsRef<Path>>(path: P) -> Result<Frame> {
    let fits = Fits::open(path)?;
    let wave = read_array1(&fits, "WAVELENGTH")?;
    let flux = read_array2(&fits, "FLUX")?;
    let ivar = read_array2(&fits, "IVAR")?;
    let mask = read_mask(&fits, "MASK")?;

    let resolution = match fits.hdu("RESOLUTION") {
        Some(hdu) => match &hdu.data {
            Data::F32 { shape, values } if shape.len() == 3 => Some(
                Array3::from_shape_vec(
                    (shape[0], shape[1], shape[2]),
                    values.iter().map(|&v| f64::from(v)).collect(),
                )
                .map_err(|e| Error::ShapeMismatch(format!("extension RESOLUTION: {e}")))?,
            ),
            _ => {
                return Err(Error::FitsFormat(
                    "extension RESOLUTION is not a 3-d float image".to_string(),
                ))
            }
        },
        None => None,
    };

    let mut frame = Frame::new(wave, flux, ivar, Some(mask), resolution)?;
    if let Some(hdu) = fits.hdu("FIBERS") {
        let Data::I32 { values, .. } = &hdu.data else {
            return Err(Error::FitsFormat(
                "extension FIBERS is not an integer image".to_string(),
            ));
        };
        frame.set_fibers(values.clone())?;
    }
    if let Some(hdu) = fits.hdu("FIBERMAP") {
        let Data::Table(table) = &hdu.data else {
            return Err(Error::FitsFormat(
                "extension FIBERMAP is not a binary table".to_string(),
            ));
        };
        frame.fibermap = Some(table_to_fibermap(table)?);
    }
    frame.meta = fits.primary().header.clone();
    Ok(frame)
}

// ---------------------------------------------------------------------------
// FiberFlat
// ---------------------------------------------------------------------------

/// Write a fiber flat: FIBERFLAT / IVAR / MASK / MEANSPEC / WAVELENGTH
///
/// # Errors
/// Returns I/O errors.
pub fn write_fiberflat<P: AsRef<Path>>(path: P, flat: &FiberFlat) -> Result<()> {
    let mut out = Fits::with_primary_header(flat.meta.clone());
    push_2d(&mut out, "FIBERFLAT", flat.fiberflat());
    push_2d(&mut out, "IVAR", flat.ivar());
    push_mask(&mut out, "MASK", flat.mask());
    out.push(Hdu::image_f32(
        "MEANSPEC",
        &[flat.meanspec().len()],
        to_f32(flat.meanspec().iter().copied()),
    ));
    push_wave(&mut out, flat.wave());
    debug!(path = %path.as_ref().display(), "writing fiberflat");
    out.save(path)
}

/// Read a fiber flat written by [`write_fiberflat`]
///
/// # Errors
/// Returns I/O, format and validation errors.
pub fn read_fiberflat<P: AsRef<Path>>(path: P) -> Result<FiberFlat> {
    let fits = Fits::open(path)?;
    let mut flat = FiberFlat::new(
        read_array1(&fits, "WAVELENGTH")?,
        read_array2(&fits, "FIBERFLAT")?,
        read_array2(&fits, "IVAR")?,
        read_mask(&fits, "MASK")?,
        read_array1(&fits, "MEANSPEC")?,
    )?;
    flat.meta = fits.primary().header.clone();
    Ok(flat)
}

// ---------------------------------------------------------------------------
// Sky model
// ---------------------------------------------------------------------------

/// Write a sky model: SKY / IVAR / MASK / WAVELENGTH
///
/// # Errors
/// Returns I/O errors.
pub fn write_sky<P: AsRef<Path>>(path: P, sky: &SkyModel) -> Result<()> {
    let mut out = Fits::with_primary_header(sky.meta.clone());
    push_2d(&mut out, "SKY", sky.flux());
    push_2d(&mut out, "IVAR", sky.ivar());
    push_mask(&mut out, "MASK", sky.mask());
    push_wave(&mut out, sky.wave());
    debug!(path = %path.as_ref().display(), "writing sky model");
    out.save(path)
}

/// Read a sky model written by [`write_sky`]
///
/// # Errors
/// Returns I/O, format and validation errors.
pub fn read_sky<P: AsRef<Path>>(path: P) -> Result<SkyModel> {
    let fits = Fits::open(path)?;
    let mut sky = SkyModel::new(
        read_array1(&fits, "WAVELENGTH")?,
        read_array2(&fits, "SKY")?,
        read_array2(&fits, "IVAR")?,
        read_mask(&fits, "MASK")?,
    )?;
    sky.meta = fits.primary().header.clone();
    Ok(sky)
}

// ---------------------------------------------------------------------------
// Flux calibration
// ---------------------------------------------------------------------------

/// Write a flux calibration: CALIB / IVAR / MASK / WAVELENGTH
///
/// # Errors
/// Returns I/O errors.
pub fn write_flux_calibration<P: AsRef<Path>>(path: P, calib: &FluxCalib) -> Result<()> {
    let mut out = Fits::with_primary_header(calib.meta.clone());
    push_2d(&mut out, "CALIB", calib.calib());
    push_2d(&mut out, "IVAR", calib.ivar());
    push_mask(&mut out, "MASK", calib.mask());
    push_wave(&mut out, calib.wave());
    debug!(path = %path.as_ref().display(), "writing flux calibration");
    out.save(path)
}

/// Read a flux calibration written by [`write_flux_calibration`]
///
/// # Errors
/// Returns I/O, format and validation errors.
pub fn read_flux_calibration<P: AsRef<Path>>(path: P) -> Result<FluxCalib> {
    let fits = Fits::open(path)?;
    let mut calib = FluxCalib::new(
        read_array1(&fits, "WAVELENGTH")?,
        read_array2(&fits, "CALIB")?,
        read_array2(&fits, "IVAR")?,
        read_mask(&fits, "MASK")?,
    )?;
    calib.meta = fits.primary().header.clone();
    Ok(calib)
}

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

/// Write a preprocessed image: PIX / IVAR / MASK with CAMERA and RDNOISE
/// on the primary header
///
/// # Errors
/// Returns I/O errors.
pub fn write_image<P: AsRef<Path>>(path: P, image: &Image) -> Result<()> {
    let mut meta = image.meta.clone();
    meta.set_with_comment("CAMERA", image.camera(), Some("spectrograph camera"));
    meta.set_with_comment("RDNOISE", image.readnoise(), Some("read noise [electrons]"));
    let mut out = Fits::with_primary_header(meta);
    push_2d(&mut out, "PIX", image.pix());
    push_2d(&mut out, "IVAR", image.ivar());
    push_mask(&mut out, "MASK", image.mask());
    debug!(path = %path.as_ref().display(), "writing image");
    out.save(path)
}

/// Read an image written by [`write_image`]
///
/// # Errors
/// Returns `MissingKeyword` when CAMERA or RDNOISE is absent, plus I/O and
/// format errors.
pub fn read_image<P: AsRef<Path>>(path: P) -> Result<Image> {
    let fits = Fits::open(path)?;
    let meta = &fits.primary().header;
    let camera = meta
        .get_str("CAMERA")
        .ok_or_else(|| Error::MissingKeyword("CAMERA".to_string()))?
        .to_string();
    let readnoise = meta
        .get_f64("RDNOISE")
        .ok_or_else(|| Error::MissingKeyword("RDNOISE".to_string()))?;
    let mut image = Image::new(
        read_array2(&fits, "PIX")?,
        read_array2(&fits, "IVAR")?,
        read_mask(&fits, "MASK")?,
        readnoise,
        &camera,
    )?;
    image.meta = meta.clone();
    Ok(image)
}

// ---------------------------------------------------------------------------
// Fibermap
// ---------------------------------------------------------------------------

/// Write a standalone fibermap file
///
/// # Errors
/// Returns I/O and validation errors.
pub fn write_fibermap<P: AsRef<Path>>(path: P, fibermap: &Fibermap) -> Result<()> {
    let mut out = Fits::new();
    out.push(Hdu::table("FIBERMAP", fibermap_to_table(fibermap)?));
    debug!(path = %path.as_ref().display(), rows = fibermap.len(), "writing fibermap");
    out.save(path)
}

/// Read a fibermap written by [`write_fibermap`]
///
/// # Errors
/// Returns I/O, format and validation errors.
pub fn read_fibermap<P: AsRef<Path>>(path: P) -> Result<Fibermap> {
    let fits = Fits::open(path)?;
    let hdu = fits.require("FIBERMAP")?;
    let Data::Table(table) = &hdu.data else {
        return Err(Error::FitsFormat(
            "extension FIBERMAP is not a binary table".to_string(),
        ));
    };
    table_to_fibermap(table)
}

// ---------------------------------------------------------------------------
// QA records (YAML)
// ---------------------------------------------------------------------------

/// Write an exposure QA record as YAML
///
/// # Errors
/// Returns I/O and serialization errors.
pub fn write_qa_exposure<P: AsRef<Path>>(path: P, qa: &QaExposure) -> Result<()> {
    let text = serde_yaml::to_string(qa)?;
    std::fs::write(path, text)?;
    Ok(())
}

/// Read an exposure QA record
///
/// # Errors
/// Returns I/O and deserialization errors.
pub fn read_qa_exposure<P: AsRef<Path>>(path: P) -> Result<QaExposure> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&text)?)
}

/// Write a single-camera QA record as YAML
///
/// # Errors
/// Returns I/O and serialization errors.
pub fn write_qa_frame<P: AsRef<Path>>(path: P, qa: &QaFrame) -> Result<()> {
    let text = serde_yaml::to_string(qa)?;
    std::fs::write(path, text)?;
    Ok(())
}

/// Read a single-camera QA record
///
/// # Errors
/// Returns I/O and deserialization errors.
pub fn read_qa_frame<P: AsRef<Path>>(path: P) -> Result<QaFrame> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&text)?)
}

// ---------------------------------------------------------------------------
// Production path layout
// ---------------------------------------------------------------------------

/// Product kinds [`ProdLayout::findfile`] can resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductKind {
    /// Extracted spectra
    Frame,
    /// Fiber flat field
    Fiberflat,
    /// Sky model
    Sky,
    /// Flux calibration
    Calib,
    /// Per-exposure fibermap
    Fibermap,
    /// Per-brick coadd file
    Brick,
}

impl ProductKind {
    const fn name(self) -> &'static str {
        match self {
            Self::Frame => "frame",
            Self::Fiberflat => "fiberflat",
            Self::Sky => "sky",
            Self::Calib => "calib",
            Self::Fibermap => "fibermap",
            Self::Brick => "brick",
        }
    }
}

/// Inputs a [`ProdLayout::findfile`] call may need, depending on the kind
#[derive(Debug, Clone, Default)]
pub struct FileInputs<'a> {
    /// Observation night, `YYYYMMDD`
    pub night: Option<&'a str>,
    /// Exposure number
    pub expid: Option<i64>,
    /// Camera, e.g. `b0`
    pub camera: Option<&'a str>,
    /// Brick name for coadd products
    pub brickname: Option<&'a str>,
}

/// Root of a production: canonical on-disk layout of its products
#[derive(Debug, Clone)]
pub struct ProdLayout {
    /// Reduction root directory
    pub redux_dir: PathBuf,
    /// Production name under the root
    pub specprod: String,
}

impl ProdLayout {
    /// New layout under `redux_dir/specprod`
    #[must_use]
    pub fn new<P: AsRef<Path>>(redux_dir: P, specprod: &str) -> Self {
        Self {
            redux_dir: redux_dir.as_ref().to_path_buf(),
            specprod: specprod.to_string(),
        }
    }

    fn prod_root(&self) -> PathBuf {
        self.redux_dir.join(&self.specprod)
    }

    /// Canonical path of a product.
    ///
    /// Exposure products live under
    /// `<redux>/<specprod>/exposures/<night>/<expid>/`; brick products under
    /// `<redux>/<specprod>/bricks/<brickname>/`.
    ///
    /// # Errors
    /// Returns `MissingPathInput` naming the first missing required input.
    pub fn findfile(&self, kind: ProductKind, inputs: &FileInputs) -> Result<PathBuf> {
        let missing = |input: &'static str| Error::MissingPathInput {
            input,
            filetype: kind.name(),
        };
        match kind {
            ProductKind::Brick => {
                let brickname = inputs.brickname.ok_or_else(|| missing("brickname"))?;
                Ok(self
                    .prod_root()
                    .join("bricks")
                    .join(brickname)
                    .join(format!("brick-{brickname}.fits")))
            }
            ProductKind::Fibermap => {
                let night = inputs.night.ok_or_else(|| missing("night"))?;
                let expid = inputs.expid.ok_or_else(|| missing("expid"))?;
                Ok(self
                    .exposure_dir(night, expid)
                    .join(format!("fibermap-{expid:08}.fits")))
            }
            _ => {
                let night = inputs.night.ok_or_else(|| missing("night"))?;
                let expid = inputs.expid.ok_or_else(|| missing("expid"))?;
                let camera = inputs.camera.ok_or_else(|| missing("camera"))?;
                Ok(self
                    .exposure_dir(night, expid)
                    .join(format!("{}-{camera}-{expid:08}.fits", kind.name())))
            }
        }
    }

    fn exposure_dir(&self, night: &str, expid: i64) -> PathBuf {
        self.prod_root()
            .join("exposures")
            .join(night)
            .join(format!("{expid:08}"))
    }
}
