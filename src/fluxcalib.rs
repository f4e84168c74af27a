//! Flux calibration vectors and the zero-point summary used by QA.

use ndarray::{Array1, Array2};

use crate::io::fits::Header;
use crate::stats::median;
use crate::{Error, Result};

/// Per-fiber conversion between counts and physical flux units
#[derive(Debug, Clone, PartialEq)]
pub struct FluxCalib {
    wave: Array1<f64>,
    calib: Array2<f64>,
    ivar: Array2<f64>,
    mask: Array2<u32>,
    /// Free-form metadata carried to and from disk
    pub meta: Header,
}

impl FluxCalib {
    /// Build a flux calibration, validating shape agreement
    ///
    /// # Errors
    /// Returns `ShapeMismatch` when the parallel arrays disagree.
    pub fn new(
        wave: Array1<f64>,
        calib: Array2<f64>,
        ivar: Array2<f64>,
        mask: Array2<u32>,
    ) -> Result<Self> {
        let (nspec, nwave) = calib.dim();
        if wave.len() != nwave {
            return Err(Error::ShapeMismatch(format!(
                "wave has {} bins, calib has {nwave}",
                wave.len()
            )));
        }
        if ivar.dim() != (nspec, nwave) || mask.dim() != (nspec, nwave) {
            return Err(Error::ShapeMismatch(format!(
                "ivar {:?} / mask {:?} do not match calib {:?}",
                ivar.dim(),
                mask.dim(),
                calib.dim()
            )));
        }
        Ok(Self {
            wave,
            calib,
            ivar,
            mask,
            meta: Header::new(),
        })
    }

    /// Number of fibers
    #[must_use]
    pub fn nspec(&self) -> usize {
        self.calib.nrows()
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

    /// Calibration vectors, `[nspec][nwave]`
    #[must_use]
    pub fn calib(&self) -> &Array2<f64> {
        &self.calib
    }

    /// Inverse variance of the calibration
    #[must_use]
    pub fn ivar(&self) -> &Array2<f64> {
        &self.ivar
    }

    /// Calibration mask bits
    #[must_use]
    pub fn mask(&self) -> &Array2<u32> {
        &self.mask
    }

    /// Fiber-median calibration versus wavelength, the "zero point" curve
    /// shown in QA figures. NaN where every fiber is masked.
    #[must_use]
    pub fn zero_point(&self) -> Array1<f64> {
        let nwave = self.nwave();
        let mut zp = Array1::<f64>::zeros(nwave);
        let mut column = Vec::with_capacity(self.nspec());
        for j in 0..nwave {
            column.clear();
            for i in 0..self.nspec() {
                if self.ivar[[i, j]] > 0.0 && self.mask[[i, j]] == 0 {
                    column.push(self.calib[[i, j]]);
                }
            }
            zp[j] = median(&column).unwrap_or(f64::NAN);
        }
        zp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn test_zero_point_is_fiber_median() {
        let wave = Array::linspace(5000.0, 6000.0, 4);
        let calib = Array2::from_shape_fn((3, 4), |(i, _)| (i + 1) as f64);
        let ivar = Array2::ones((3, 4));
        let mask = Array2::zeros((3, 4));
        let fc = FluxCalib::new(wave, calib, ivar, mask).unwrap();
        let zp = fc.zero_point();
        assert!(zp.iter().all(|&v| (v - 2.0).abs() < 1e-12));
    }

    #[test]
    fn test_zero_point_skips_masked_fibers() {
        let wave = Array::linspace(5000.0, 6000.0, 2);
        let calib = Array2::from_shape_fn((3, 2), |(i, _)| (i + 1) as f64);
        let ivar = Array2::ones((3, 2));
        let mut mask = Array2::zeros((3, 2));
        mask[[2, 0]] = 1;
        let fc = FluxCalib::new(wave, calib, ivar, mask).unwrap();
        let zp = fc.zero_point();
        assert!((zp[0] - 1.5).abs() < 1e-12);
        assert!((zp[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_shape_validation() {
        let wave = Array::linspace(5000.0, 6000.0, 3);
        let calib = Array2::ones((2, 4));
        let ivar = Array2::ones((2, 4));
        let mask = Array2::zeros((2, 4));
        assert!(FluxCalib::new(wave, calib, ivar, mask).is_err());
    }
}
