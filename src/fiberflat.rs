//! Fiber flat field and its application to a frame.

use ndarray::{Array1, Array2};

use crate::frame::{Frame, MASK_BAD};
use crate::io::fits::Header;
use crate::{Error, Result};

/// Wavelength grids must agree to this tolerance, which absorbs the f32
/// on-disk representation of the grid
const WAVE_TOL: f64 = 1e-3;

/// Relative throughput of each fiber versus wavelength, normalized so the
/// fiber-averaged spectrum `meanspec` has flat response 1.
#[derive(Debug, Clone, PartialEq)]
pub struct FiberFlat {
    wave: Array1<f64>,
    fiberflat: Array2<f64>,
    ivar: Array2<f64>,
    mask: Array2<u32>,
    meanspec: Array1<f64>,
    /// Free-form metadata carried to and from disk
    pub meta: Header,
}

impl FiberFlat {
    /// Build a fiber flat, validating shape agreement
    ///
    /// # Errors
    /// Returns `ShapeMismatch` when the parallel arrays disagree.
    pub fn new(
        wave: Array1<f64>,
        fiberflat: Array2<f64>,
        ivar: Array2<f64>,
        mask: Array2<u32>,
        meanspec: Array1<f64>,
    ) -> Result<Self> {
        let (nspec, nwave) = fiberflat.dim();
        if wave.len() != nwave {
            return Err(Error::ShapeMismatch(format!(
                "wave has {} bins, fiberflat has {nwave}",
                wave.len()
            )));
        }
        if ivar.dim() != (nspec, nwave) || mask.dim() != (nspec, nwave) {
            return Err(Error::ShapeMismatch(format!(
                "ivar {:?} / mask {:?} do not match fiberflat {:?}",
                ivar.dim(),
                mask.dim(),
                fiberflat.dim()
            )));
        }
        if meanspec.len() != nwave {
            return Err(Error::ShapeMismatch(format!(
                "meanspec has {} bins, fiberflat has {nwave}",
                meanspec.len()
            )));
        }
        Ok(Self {
            wave,
            fiberflat,
            ivar,
            mask,
            meanspec,
            meta: Header::new(),
        })
    }

    /// Number of fibers
    #[must_use]
    pub fn nspec(&self) -> usize {
        self.fiberflat.nrows()
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

    /// Flat-field values, `[nspec][nwave]`
    #[must_use]
    pub fn fiberflat(&self) -> &Array2<f64> {
        &self.fiberflat
    }

    /// Inverse variance of the flat
    #[must_use]
    pub fn ivar(&self) -> &Array2<f64> {
        &self.ivar
    }

    /// Flat mask bits
    #[must_use]
    pub fn mask(&self) -> &Array2<u32> {
        &self.mask
    }

    /// Fiber-averaged spectrum the flat is normalized to
    #[must_use]
    pub fn meanspec(&self) -> &Array1<f64> {
        &self.meanspec
    }
}

/// Divide a frame's flux by the fiber flat in place, propagating the flat's
/// variance into the frame's inverse variance.
///
/// Pixels where the flat is zero, masked, or has zero ivar get flux 0,
/// ivar 0 and a mask bit; flat mask bits are OR-ed into the frame mask.
///
/// # Errors
/// Returns `WavelengthMismatch` when the grids differ and `ShapeMismatch`
/// when the fiber counts differ.
pub fn apply_fiberflat(frame: &mut Frame, flat: &FiberFlat) -> Result<()> {
    check_compatible(frame, flat)?;
    let nspec = frame.nspec();
    let nwave = frame.nwave();

    for i in 0..nspec {
        for j in 0..nwave {
            let f = flat.fiberflat[[i, j]];
            let f_ivar = flat.ivar[[i, j]];
            let f_mask = flat.mask[[i, j]];
            let ivar = frame.ivar()[[i, j]];
            if f > 0.0 && f_ivar > 0.0 && f_mask == 0 && ivar > 0.0 {
                let calibrated = frame.flux()[[i, j]] / f;
                // var(flux/f) = var(flux)/f^2 + flux^2 var(f)/f^4
                let var = 1.0 / (ivar * f * f) + calibrated * calibrated / (f_ivar * f * f);
                frame.flux_mut()[[i, j]] = calibrated;
                frame.ivar_mut()[[i, j]] = 1.0 / var;
                frame.mask_mut()[[i, j]] |= f_mask;
            } else {
                frame.flux_mut()[[i, j]] = 0.0;
                frame.ivar_mut()[[i, j]] = 0.0;
                frame.mask_mut()[[i, j]] |= f_mask | MASK_BAD;
            }
        }
    }
    Ok(())
}

fn check_compatible(frame: &Frame, flat: &FiberFlat) -> Result<()> {
    if frame.nspec() != flat.nspec() {
        return Err(Error::ShapeMismatch(format!(
            "frame has {} spectra, fiberflat has {}",
            frame.nspec(),
            flat.nspec()
        )));
    }
    if frame.nwave() != flat.nwave() {
        return Err(Error::WavelengthMismatch(format!(
            "frame has {} bins, fiberflat has {}",
            frame.nwave(),
            flat.nwave()
        )));
    }
    let max_diff = frame
        .wave()
        .iter()
        .zip(flat.wave())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0_f64, f64::max);
    if max_diff > WAVE_TOL {
        return Err(Error::WavelengthMismatch(format!(
            "frame and fiberflat grids differ by up to {max_diff} Angstrom"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn uniform_flat(nspec: usize, nwave: usize, value: f64) -> FiberFlat {
        let wave = Array::linspace(5000.0, 6000.0, nwave);
        FiberFlat::new(
            wave,
            Array2::from_elem((nspec, nwave), value),
            Array2::from_elem((nspec, nwave), 1e8),
            Array2::zeros((nspec, nwave)),
            Array1::ones(nwave),
        )
        .unwrap()
    }

    fn uniform_frame(nspec: usize, nwave: usize, flux: f64) -> Frame {
        let wave = Array::linspace(5000.0, 6000.0, nwave);
        Frame::new(
            wave,
            Array2::from_elem((nspec, nwave), flux),
            Array2::from_elem((nspec, nwave), 4.0),
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_apply_scales_flux() {
        let mut frame = uniform_frame(3, 20, 10.0);
        let flat = uniform_flat(3, 20, 2.0);
        apply_fiberflat(&mut frame, &flat).unwrap();
        assert!(frame.flux().iter().all(|&f| (f - 5.0).abs() < 1e-12));
        // flat ivar is huge, so ivar scales by flat^2
        assert!(frame.ivar().iter().all(|&v| (v - 16.0).abs() < 1e-4));
    }

    #[test]
    fn test_dead_flat_pixel_is_masked() {
        let mut frame = uniform_frame(2, 10, 10.0);
        let mut flat = uniform_flat(2, 10, 1.0);
        flat.fiberflat[[1, 3]] = 0.0;
        apply_fiberflat(&mut frame, &flat).unwrap();
        assert_eq!(frame.flux()[[1, 3]], 0.0);
        assert_eq!(frame.ivar()[[1, 3]], 0.0);
        assert_ne!(frame.mask()[[1, 3]] & MASK_BAD, 0);
        assert_eq!(frame.mask()[[0, 3]], 0);
    }

    #[test]
    fn test_flat_variance_propagates() {
        let mut frame = uniform_frame(1, 5, 8.0);
        let mut flat = uniform_flat(1, 5, 2.0);
        flat.ivar.fill(1.0);
        apply_fiberflat(&mut frame, &flat).unwrap();
        // var = 1/(4*4) + 16/(1*4) = 0.0625 + 4.0
        let expected = 1.0 / (0.0625 + 4.0);
        assert!(frame.ivar().iter().all(|&v| (v - expected).abs() < 1e-12));
    }

    #[test]
    fn test_wavelength_mismatch_rejected() {
        let mut frame = uniform_frame(2, 10, 1.0);
        let mut flat = uniform_flat(2, 10, 1.0);
        flat.wave[0] += 1.0;
        assert!(matches!(
            apply_fiberflat(&mut frame, &flat),
            Err(Error::WavelengthMismatch(_))
        ));
    }

    #[test]
    fn test_fiber_count_mismatch_rejected() {
        let mut frame = uniform_frame(2, 10, 1.0);
        let flat = uniform_flat(3, 10, 1.0);
        assert!(matches!(
            apply_fiberflat(&mut frame, &flat),
            Err(Error::ShapeMismatch(_))
        ));
    }
}
