//! Brick files: per-target spectra accumulated across exposures.
//!
//! A brick groups every observation of the targets in one patch of sky.
//! Exposures append their spectra together with the matching fibermap rows,
//! annotated with the night and exposure they came from, and downstream
//! coaddition queries the file per target.

use ndarray::{Array1, Array2, Array3};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::fibermap::Fibermap;
use crate::io::fits::{ColumnValues, Data, Fits, Hdu, Header};
use crate::io::{fibermap_to_table, table_i32, table_str, table_to_fibermap, to_f32};
use crate::{Error, Result};

const NIGHT_WIDTH: usize = 8;
const WAVE_TOL: f64 = 1e-3;

/// All spectra of one target in a brick
#[derive(Debug, Clone)]
pub struct TargetSpectra {
    /// Flux rows, `[nobs][nwave]`
    pub flux: Array2<f64>,
    /// Inverse variance rows
    pub ivar: Array2<f64>,
    /// Resolution data, `[nobs][ndiag][nwave]`
    pub resolution: Array3<f64>,
    /// Row indices within the brick
    pub rows: Vec<usize>,
}

/// An open brick file, accumulating spectra in memory until closed
#[derive(Debug, Clone)]
pub struct Brick {
    path: PathBuf,
    wave: Option<Array1<f64>>,
    ndiag: Option<usize>,
    flux: Vec<f64>,
    ivar: Vec<f64>,
    resolution: Vec<f64>,
    nspec: usize,
    fibermap: Fibermap,
    night: Vec<String>,
    expid: Vec<i32>,
    /// Free-form metadata written to the primary header
    pub meta: Header,
}

impl Brick {
    /// Open a brick file for appending; a missing file starts empty
    ///
    /// # Errors
    /// Returns I/O and format errors when an existing file is unreadable.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Ok(Self {
                path,
                wave: None,
                ndiag: None,
                flux: Vec::new(),
                ivar: Vec::new(),
                resolution: Vec::new(),
                nspec: 0,
                fibermap: Fibermap::default(),
                night: Vec::new(),
                expid: Vec::new(),
                meta: Header::new(),
            });
        }
        Self::load(path)
    }

    fn load(path: PathBuf) -> Result<Self> {
        let fits = Fits::open(&path)?;
        let wave = super::read_array1(&fits, "WAVELENGTH")?;
        let flux = super::read_array2(&fits, "FLUX")?;
        let ivar = super::read_array2(&fits, "IVAR")?;
        let (nspec, _) = flux.dim();

        let res_hdu = fits.require("RESOLUTION")?;
        let (ndiag, resolution) = match &res_hdu.data {
            Data::F32 { shape, values } if shape.len() == 3 && shape[0] == nspec => {
                (shape[1], values.iter().map(|&v| f64::from(v)).collect())
            }
            _ => {
                return Err(Error::FitsFormat(
                    "extension RESOLUTION is not a 3-d float image".to_string(),
                ))
            }
        };

        let fm_hdu = fits.require("FIBERMAP")?;
        let Data::Table(table) = &fm_hdu.data else {
            return Err(Error::FitsFormat(
                "extension FIBERMAP is not a binary table".to_string(),
            ));
        };
        let fibermap = table_to_fibermap(table)?;
        let night = table_str(table, "NIGHT")?;
        let expid = table_i32(table, "EXPID")?;

        Ok(Self {
            path,
            wave: Some(wave),
            ndiag: Some(ndiag),
            flux: flux.into_raw_vec_and_offset().0,
            ivar: ivar.into_raw_vec_and_offset().0,
            resolution,
            nspec,
            fibermap,
            night,
            expid,
            meta: fits.primary().header.clone(),
        })
    }

    /// Append one exposure's spectra of this brick's targets.
    ///
    /// The wavelength grid must match what the brick already holds; the
    /// fibermap rows gain NIGHT and EXPID annotations.
    ///
    /// # Errors
    /// Returns shape and grid mismatch errors.
    #[allow(clippy::too_many_arguments)]
    pub fn add_objects(
        &mut self,
        flux: &Array2<f64>,
        ivar: &Array2<f64>,
        wave: &Array1<f64>,
        resolution: &Array3<f64>,
        fibermap: &Fibermap,
        night: &str,
        expid: i32,
    ) -> Result<()> {
        let (nspec, nwave) = flux.dim();
        if ivar.dim() != (nspec, nwave) {
            return Err(Error::ShapeMismatch(format!(
                "ivar shape {:?} != flux shape {:?}",
                ivar.dim(),
                flux.dim()
            )));
        }
        let (rspec, ndiag, rwave) = resolution.dim();
        if rspec != nspec || rwave != nwave {
            return Err(Error::ShapeMismatch(format!(
                "resolution shape {:?} incompatible with flux shape {:?}",
                resolution.dim(),
                flux.dim()
            )));
        }
        if fibermap.len() != nspec {
            return Err(Error::ShapeMismatch(format!(
                "fibermap has {} rows for {nspec} spectra",
                fibermap.len()
            )));
        }
        fibermap.validate()?;

        match &self.wave {
            None => self.wave = Some(wave.clone()),
            Some(existing) => {
                if existing.len() != nwave {
                    return Err(Error::WavelengthMismatch(format!(
                        "brick has {} bins, exposure has {nwave}",
                        existing.len()
                    )));
                }
                let max_diff = existing
                    .iter()
                    .zip(wave)
                    .map(|(a, b)| (a - b).abs())
                    .fold(0.0_f64, f64::max);
                if max_diff > WAVE_TOL {
                    return Err(Error::WavelengthMismatch(format!(
                        "brick and exposure grids differ by up to {max_diff} Angstrom"
                    )));
                }
            }
        }
        match self.ndiag {
            None => self.ndiag = Some(ndiag),
            Some(existing) if existing != ndiag => {
                return Err(Error::ShapeMismatch(format!(
                    "brick resolution has {existing} diagonals, exposure has {ndiag}"
                )));
            }
            Some(_) => {}
        }

        self.flux.extend(flux.iter().copied());
        self.ivar.extend(ivar.iter().copied());
        self.resolution.extend(resolution.iter().copied());
        self.nspec += nspec;

        self.fibermap.fiber.extend_from_slice(&fibermap.fiber);
        self.fibermap
            .positioner
            .extend_from_slice(&fibermap.positioner);
        self.fibermap
            .spectroid
            .extend_from_slice(&fibermap.spectroid);
        self.fibermap.targetid.extend_from_slice(&fibermap.targetid);
        self.fibermap
            .objtype
            .extend_from_slice(&fibermap.objtype);
        self.fibermap
            .target_ra
            .extend_from_slice(&fibermap.target_ra);
        self.fibermap
            .target_dec
            .extend_from_slice(&fibermap.target_dec);
        self.fibermap.x_target.extend_from_slice(&fibermap.x_target);
        self.fibermap.y_target.extend_from_slice(&fibermap.y_target);
        self.night.extend(vec![night.to_string(); nspec]);
        self.expid.extend(vec![expid; nspec]);
        debug!(nspec, night, expid, "appended spectra to brick");
        Ok(())
    }

    /// Total number of spectra in the brick
    #[must_use]
    pub fn num_spectra(&self) -> usize {
        self.nspec
    }

    /// Unique target ids, in first-appearance order
    #[must_use]
    pub fn target_ids(&self) -> Vec<i64> {
        let mut seen = Vec::new();
        for &t in &self.fibermap.targetid {
            if !seen.contains(&t) {
                seen.push(t);
            }
        }
        seen
    }

    /// Number of unique targets
    #[must_use]
    pub fn num_targets(&self) -> usize {
        self.target_ids().len()
    }

    /// Night annotation of each spectrum
    #[must_use]
    pub fn nights(&self) -> &[String] {
        &self.night
    }

    /// Exposure annotation of each spectrum
    #[must_use]
    pub fn expids(&self) -> &[i32] {
        &self.expid
    }

    /// Fibermap rows of every spectrum
    #[must_use]
    pub fn fibermap(&self) -> &Fibermap {
        &self.fibermap
    }

    /// All spectra of one target
    ///
    /// # Errors
    /// Returns an error when the target is not in the brick.
    pub fn get_target(&self, targetid: i64) -> Result<TargetSpectra> {
        let rows: Vec<usize> = self
            .fibermap
            .targetid
            .iter()
            .enumerate()
            .filter(|(_, &t)| t == targetid)
            .map(|(i, _)| i)
            .collect();
        if rows.is_empty() {
            return Err(Error::ShapeMismatch(format!(
                "target {targetid} is not in this brick"
            )));
        }
        let nwave = self.wave.as_ref().map_or(0, Array1::len);
        let ndiag = self.ndiag.unwrap_or(0);
        let mut flux = Array2::<f64>::zeros((rows.len(), nwave));
        let mut ivar = Array2::<f64>::zeros((rows.len(), nwave));
        let mut resolution = Array3::<f64>::zeros((rows.len(), ndiag, nwave));
        for (k, &r) in rows.iter().enumerate() {
            for j in 0..nwave {
                flux[[k, j]] = self.flux[r * nwave + j];
                ivar[[k, j]] = self.ivar[r * nwave + j];
            }
            for d in 0..ndiag {
                for j in 0..nwave {
                    resolution[[k, d, j]] = self.resolution[(r * ndiag + d) * nwave + j];
                }
            }
        }
        Ok(TargetSpectra {
            flux,
            ivar,
            resolution,
            rows,
        })
    }

    /// Write the accumulated spectra back to the brick file
    ///
    /// # Errors
    /// Returns I/O and validation errors.
    pub fn close(self) -> Result<()> {
        let wave = self
            .wave
            .ok_or_else(|| Error::ShapeMismatch("brick holds no spectra".to_string()))?;
        let nwave = wave.len();
        let ndiag = self.ndiag.unwrap_or(0);

        let mut out = Fits::with_primary_header(self.meta.clone());
        out.push(Hdu::image_f32(
            "FLUX",
            &[self.nspec, nwave],
            to_f32(self.flux.iter().copied()),
        ));
        out.push(Hdu::image_f32(
            "IVAR",
            &[self.nspec, nwave],
            to_f32(self.ivar.iter().copied()),
        ));
        out.push(Hdu::image_f32(
            "WAVELENGTH",
            &[nwave],
            to_f32(wave.iter().copied()),
        ));
        out.push(Hdu::image_f32(
            "RESOLUTION",
            &[self.nspec, ndiag, nwave],
            to_f32(self.resolution.iter().copied()),
        ));

        let mut table = fibermap_to_table(&self.fibermap)?;
        table.push_column(
            "NIGHT",
            ColumnValues::Str {
                width: NIGHT_WIDTH,
                values: self.night,
            },
        )?;
        table.push_column("EXPID", ColumnValues::I32(self.expid))?;
        out.push(Hdu::table("FIBERMAP", table));

        debug!(path = %self.path.display(), nspec = self.nspec, "closing brick");
        out.save(&self.path)
    }
}
