//! Extracted spectra for one camera of one exposure.

use ndarray::{Array1, Array2, Array3};

use crate::fibermap::{Fibermap, FIBERS_PER_SPECTROGRAPH};
use crate::io::fits::Header;
use crate::{Error, Result};

/// Mask bit set on pixels where sky estimation or flat fielding failed
pub const MASK_BAD: u32 = 1;

/// Extracted spectra: per-fiber flux, inverse variance, mask and an optional
/// resolution matrix, all on a common wavelength grid.
///
/// Arrays are f64 in memory; the on-disk representation is f32.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    wave: Array1<f64>,
    flux: Array2<f64>,
    ivar: Array2<f64>,
    mask: Array2<u32>,
    resolution: Option<Array3<f64>>,
    fibers: Vec<i32>,
    /// Attached per-fiber target table, if any
    pub fibermap: Option<Fibermap>,
    /// Free-form metadata carried to and from disk
    pub meta: Header,
}

impl Frame {
    /// Build a frame, validating shape agreement.
    ///
    /// `mask` defaults to all-clear; `fibers` defaults to
    /// `spectrograph * 500 + (0..nspec)`.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` when the parallel arrays disagree.
    pub fn new(
        wave: Array1<f64>,
        flux: Array2<f64>,
        ivar: Array2<f64>,
        mask: Option<Array2<u32>>,
        resolution: Option<Array3<f64>>,
    ) -> Result<Self> {
        let (nspec, nwave) = flux.dim();
        if wave.len() != nwave {
            return Err(Error::ShapeMismatch(format!(
                "wave has {} bins, flux has {nwave}",
                wave.len()
            )));
        }
        if ivar.dim() != (nspec, nwave) {
            return Err(Error::ShapeMismatch(format!(
                "ivar shape {:?} != flux shape {:?}",
                ivar.dim(),
                flux.dim()
            )));
        }
        let mask = mask.unwrap_or_else(|| Array2::zeros((nspec, nwave)));
        if mask.dim() != (nspec, nwave) {
            return Err(Error::ShapeMismatch(format!(
                "mask shape {:?} != flux shape {:?}",
                mask.dim(),
                flux.dim()
            )));
        }
        if let Some(res) = &resolution {
            let (rspec, _, rwave) = res.dim();
            if rspec != nspec || rwave != nwave {
                return Err(Error::ShapeMismatch(format!(
                    "resolution shape {:?} incompatible with flux shape {:?}",
                    res.dim(),
                    flux.dim()
                )));
            }
        }
        let fibers: Vec<i32> = (0..nspec as i32).collect();
        Ok(Self {
            wave,
            flux,
            ivar,
            mask,
            resolution,
            fibers,
            fibermap: None,
            meta: Header::new(),
        })
    }

    /// Replace the default fiber numbering with explicit fiber numbers
    ///
    /// # Errors
    /// Returns `ShapeMismatch` when the count disagrees with nspec.
    pub fn set_fibers(&mut self, fibers: Vec<i32>) -> Result<()> {
        if fibers.len() != self.nspec() {
            return Err(Error::ShapeMismatch(format!(
                "{} fiber numbers for {} spectra",
                fibers.len(),
                self.nspec()
            )));
        }
        self.fibers = fibers;
        Ok(())
    }

    /// Number the fibers for a given spectrograph: `spectrograph*500 + i`
    pub fn set_spectrograph(&mut self, spectrograph: i32) {
        let base = spectrograph * FIBERS_PER_SPECTROGRAPH;
        self.fibers = (0..self.nspec() as i32).map(|i| base + i).collect();
    }

    /// Number of spectra
    #[must_use]
    pub fn nspec(&self) -> usize {
        self.flux.nrows()
    }

    /// Number of wavelength bins
    #[must_use]
    pub fn nwave(&self) -> usize {
        self.wave.len()
    }

    /// Wavelength grid, Angstroms
    #[must_use]
    pub fn wave(&self) -> &Array1<f64> {
        &self.wave
    }

    /// Flux array, `[nspec][nwave]`
    #[must_use]
    pub fn flux(&self) -> &Array2<f64> {
        &self.flux
    }

    /// Mutable flux array
    pub fn flux_mut(&mut self) -> &mut Array2<f64> {
        &mut self.flux
    }

    /// Inverse variance array
    #[must_use]
    pub fn ivar(&self) -> &Array2<f64> {
        &self.ivar
    }

    /// Mutable inverse variance array
    pub fn ivar_mut(&mut self) -> &mut Array2<f64> {
        &mut self.ivar
    }

    /// Mask array, u32 bit flags
    #[must_use]
    pub fn mask(&self) -> &Array2<u32> {
        &self.mask
    }

    /// Mutable mask array
    pub fn mask_mut(&mut self) -> &mut Array2<u32> {
        &mut self.mask
    }

    /// Per-fiber resolution data, `[nspec][ndiag][nwave]`, if present
    #[must_use]
    pub fn resolution(&self) -> Option<&Array3<f64>> {
        self.resolution.as_ref()
    }

    /// Absolute fiber numbers, one per spectrum
    #[must_use]
    pub fn fibers(&self) -> &[i32] {
        &self.fibers
    }

    /// Lowest and highest fiber number in the frame
    ///
    /// # Errors
    /// Returns `ShapeMismatch` for an empty frame.
    pub fn fiber_range(&self) -> Result<(i32, i32)> {
        let min = self.fibers.iter().min();
        let max = self.fibers.iter().max();
        match (min, max) {
            (Some(&lo), Some(&hi)) => Ok((lo, hi)),
            _ => Err(Error::ShapeMismatch("frame has no spectra".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn arrays(nspec: usize, nwave: usize) -> (Array1<f64>, Array2<f64>, Array2<f64>) {
        let wave = Array::linspace(5000.0, 6000.0, nwave);
        let flux = Array2::ones((nspec, nwave));
        let ivar = Array2::ones((nspec, nwave));
        (wave, flux, ivar)
    }

    #[test]
    fn test_default_fibers_and_spectrograph() {
        let (wave, flux, ivar) = arrays(4, 10);
        let mut frame = Frame::new(wave, flux, ivar, None, None).unwrap();
        assert_eq!(frame.fibers(), &[0, 1, 2, 3]);
        frame.set_spectrograph(2);
        assert_eq!(frame.fibers(), &[1000, 1001, 1002, 1003]);
        assert_eq!(frame.fiber_range().unwrap(), (1000, 1003));
    }

    #[test]
    fn test_shape_validation() {
        let (wave, flux, ivar) = arrays(4, 10);
        let bad_ivar = Array2::ones((4, 9));
        assert!(Frame::new(wave.clone(), flux.clone(), bad_ivar, None, None).is_err());
        let bad_mask = Array2::zeros((3, 10));
        assert!(Frame::new(wave.clone(), flux.clone(), ivar.clone(), Some(bad_mask), None).is_err());
        let bad_res = Array3::zeros((4, 3, 9));
        assert!(Frame::new(wave, flux, ivar, None, Some(bad_res)).is_err());
    }

    #[test]
    fn test_set_fibers_length_check() {
        let (wave, flux, ivar) = arrays(4, 10);
        let mut frame = Frame::new(wave, flux, ivar, None, None).unwrap();
        assert!(frame.set_fibers(vec![7, 8, 9]).is_err());
        frame.set_fibers(vec![7, 8, 9, 10]).unwrap();
        assert_eq!(frame.fibers(), &[7, 8, 9, 10]);
    }

    #[test]
    fn test_default_mask_is_clear() {
        let (wave, flux, ivar) = arrays(2, 5);
        let frame = Frame::new(wave, flux, ivar, None, None).unwrap();
        assert!(frame.mask().iter().all(|&m| m == 0));
    }
}
