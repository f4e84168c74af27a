//! Sky background model: estimation from sky fibers and subtraction.

use ndarray::{Array1, Array2};
use tracing::{debug, info};

use crate::fibermap::Fibermap;
use crate::frame::{Frame, MASK_BAD};
use crate::io::fits::Header;
use crate::stats::weighted_mean;
use crate::{Error, Result};

/// Sigma threshold for clipping discrepant sky-fiber measurements
const CLIP_NSIG: f64 = 4.0;
/// Upper bound on clipping iterations per wavelength bin
const MAX_CLIP_ITER: usize = 20;
/// Wavelength grid agreement tolerance (f32 on-disk representation)
const WAVE_TOL: f64 = 1e-3;

/// Sky spectrum model broadcast to every fiber of a frame
#[derive(Debug, Clone, PartialEq)]
pub struct SkyModel {
    wave: Array1<f64>,
    flux: Array2<f64>,
    ivar: Array2<f64>,
    mask: Array2<u32>,
    /// Free-form metadata carried to and from disk
    pub meta: Header,
}

impl SkyModel {
    /// Build a sky model, validating shape agreement
    ///
    /// # Errors
    /// Returns `ShapeMismatch` when the parallel arrays disagree.
    pub fn new(
        wave: Array1<f64>,
        flux: Array2<f64>,
        ivar: Array2<f64>,
        mask: Array2<u32>,
    ) -> Result<Self> {
        let (nspec, nwave) = flux.dim();
        if wave.len() != nwave {
            return Err(Error::ShapeMismatch(format!(
                "wave has {} bins, sky flux has {nwave}",
                wave.len()
            )));
        }
        if ivar.dim() != (nspec, nwave) || mask.dim() != (nspec, nwave) {
            return Err(Error::ShapeMismatch(format!(
                "ivar {:?} / mask {:?} do not match sky flux {:?}",
                ivar.dim(),
                mask.dim(),
                flux.dim()
            )));
        }
        Ok(Self {
            wave,
            flux,
            ivar,
            mask,
            meta: Header::new(),
        })
    }

    /// Number of fibers the model covers
    #[must_use]
    pub fn nspec(&self) -> usize {
        self.flux.nrows()
    }

    /// Number of wavelength bins
    #[must_use]
    pub fn nwave(&self) -> usize {
        self.wave.len()
    }

    /// Wavelength grid
    #[must_use]
    pub fn wave(&self) -> &Array1<f64> {
        &self.wave
    }

    /// Sky flux per fiber, `[nspec][nwave]`
    #[must_use]
    pub fn flux(&self) -> &Array2<f64> {
        &self.flux
    }

    /// Inverse variance of the sky flux
    #[must_use]
    pub fn ivar(&self) -> &Array2<f64> {
        &self.ivar
    }

    /// Sky mask bits
    #[must_use]
    pub fn mask(&self) -> &Array2<u32> {
        &self.mask
    }
}

/// Frame row indices of the sky fibers listed in the fibermap.
///
/// # Errors
/// Returns `NoSkyFibers` when no fiber qualifies.
pub fn sky_fiber_rows(frame: &Frame, fibermap: &Fibermap) -> Result<Vec<usize>> {
    let (fibermin, fibermax) = frame.fiber_range()?;
    let sky = fibermap.sky_fibers(fibermin, fibermax);
    let rows: Vec<usize> = sky
        .iter()
        .filter_map(|f| frame.fibers().iter().position(|g| g == f))
        .collect();
    if rows.is_empty() {
        return Err(Error::NoSkyFibers { fibermin, fibermax });
    }
    Ok(rows)
}

/// Estimate the sky spectrum of a (fiberflat-corrected) frame.
///
/// At each wavelength, the sky fibers are combined with an
/// inverse-variance-weighted mean; the worst measurement beyond 4 sigma is
/// dropped and the mean refit, bounded at 20 iterations. The fitted spectrum
/// is broadcast to every fiber of the frame; wavelengths where no sky fiber
/// contributed get zero ivar and a mask bit.
///
/// # Errors
/// Returns `NoSkyFibers` when the fibermap designates none in range.
pub fn compute_sky(frame: &Frame, fibermap: &Fibermap) -> Result<SkyModel> {
    let rows = sky_fiber_rows(frame, fibermap)?;
    info!(nsky = rows.len(), "estimating sky spectrum");

    let nspec = frame.nspec();
    let nwave = frame.nwave();
    let mut sky_flux = Array1::<f64>::zeros(nwave);
    let mut sky_wivar = Array1::<f64>::zeros(nwave);
    let mut nclipped = 0usize;

    let mut values = Vec::with_capacity(rows.len());
    let mut weights = Vec::with_capacity(rows.len());
    for j in 0..nwave {
        values.clear();
        weights.clear();
        for &r in &rows {
            values.push(frame.flux()[[r, j]]);
            let w = if frame.mask()[[r, j]] == 0 {
                frame.ivar()[[r, j]]
            } else {
                0.0
            };
            weights.push(w);
        }

        let (mut mean, mut wsum) = weighted_mean(&values, &weights);
        for _ in 0..MAX_CLIP_ITER {
            if wsum <= 0.0 {
                break;
            }
            // worst deviate beyond the clip threshold, if any
            let worst = values
                .iter()
                .zip(weights.iter())
                .enumerate()
                .filter(|(_, (_, &w))| w > 0.0)
                .map(|(k, (&v, &w))| (k, (v - mean).abs() * w.sqrt()))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            match worst {
                Some((k, chi)) if chi > CLIP_NSIG => {
                    weights[k] = 0.0;
                    nclipped += 1;
                    let refit = weighted_mean(&values, &weights);
                    mean = refit.0;
                    wsum = refit.1;
                }
                _ => break,
            }
        }
        sky_flux[j] = mean;
        sky_wivar[j] = wsum;
    }
    if nclipped > 0 {
        debug!(nclipped, "clipped discrepant sky measurements");
    }

    let mut flux = Array2::<f64>::zeros((nspec, nwave));
    let mut ivar = Array2::<f64>::zeros((nspec, nwave));
    let mut mask = Array2::<u32>::zeros((nspec, nwave));
    for i in 0..nspec {
        for j in 0..nwave {
            flux[[i, j]] = sky_flux[j];
            ivar[[i, j]] = sky_wivar[j];
            if sky_wivar[j] <= 0.0 {
                mask[[i, j]] = MASK_BAD;
            }
        }
    }

    let mut model = SkyModel::new(frame.wave().clone(), flux, ivar, mask)?;
    model.meta.extend_missing(&frame.meta);
    Ok(model)
}

/// Combine two inverse variances for a difference of independent values.
///
/// Zero whenever either input is non-positive.
#[must_use]
pub fn combine_ivar(a: f64, b: f64) -> f64 {
    if a > 0.0 && b > 0.0 {
        1.0 / (1.0 / a + 1.0 / b)
    } else {
        0.0
    }
}

/// Subtract a sky model from a frame in place, combining inverse variances
/// and OR-ing sky mask bits into the frame mask.
///
/// # Errors
/// Returns `WavelengthMismatch` / `ShapeMismatch` when the model does not
/// match the frame.
pub fn subtract_sky(frame: &mut Frame, sky: &SkyModel) -> Result<()> {
    if frame.nspec() != sky.nspec() {
        return Err(Error::ShapeMismatch(format!(
            "frame has {} spectra, sky model has {}",
            frame.nspec(),
            sky.nspec()
        )));
    }
    if frame.nwave() != sky.nwave() {
        return Err(Error::WavelengthMismatch(format!(
            "frame has {} bins, sky model has {}",
            frame.nwave(),
            sky.nwave()
        )));
    }
    let max_diff = frame
        .wave()
        .iter()
        .zip(sky.wave())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0_f64, f64::max);
    if max_diff > WAVE_TOL {
        return Err(Error::WavelengthMismatch(format!(
            "frame and sky grids differ by up to {max_diff} Angstrom"
        )));
    }

    for i in 0..frame.nspec() {
        for j in 0..frame.nwave() {
            frame.flux_mut()[[i, j]] -= sky.flux[[i, j]];
            let combined = combine_ivar(frame.ivar()[[i, j]], sky.ivar[[i, j]]);
            frame.ivar_mut()[[i, j]] = combined;
            frame.mask_mut()[[i, j]] |= sky.mask[[i, j]];
        }
    }
    Ok(())
}
