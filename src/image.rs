//! Preprocessed CCD image for one camera.

use ndarray::Array2;

use crate::io::fits::Header;
use crate::{Error, Result};

/// Bias-subtracted, flat-fielded CCD pixel data with its noise model
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pix: Array2<f64>,
    ivar: Array2<f64>,
    mask: Array2<u32>,
    readnoise: f64,
    camera: String,
    /// Free-form metadata carried to and from disk
    pub meta: Header,
}

impl Image {
    /// Build an image, validating shape agreement.
    ///
    /// Camera names follow the `{band}{spectrograph}` convention, e.g. `b0`.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` when the parallel arrays disagree.
    pub fn new(
        pix: Array2<f64>,
        ivar: Array2<f64>,
        mask: Array2<u32>,
        readnoise: f64,
        camera: &str,
    ) -> Result<Self> {
        if ivar.dim() != pix.dim() || mask.dim() != pix.dim() {
            return Err(Error::ShapeMismatch(format!(
                "ivar {:?} / mask {:?} do not match pix {:?}",
                ivar.dim(),
                mask.dim(),
                pix.dim()
            )));
        }
        Ok(Self {
            pix,
            ivar,
            mask,
            readnoise,
            camera: camera.to_string(),
            meta: Header::new(),
        })
    }

    /// Pixel values, `[ny][nx]`
    #[must_use]
    pub fn pix(&self) -> &Array2<f64> {
        &self.pix
    }

    /// Pixel inverse variance
    #[must_use]
    pub fn ivar(&self) -> &Array2<f64> {
        &self.ivar
    }

    /// Pixel mask bits
    #[must_use]
    pub fn mask(&self) -> &Array2<u32> {
        &self.mask
    }

    /// Read noise in electrons
    #[must_use]
    pub fn readnoise(&self) -> f64 {
        self.readnoise
    }

    /// Camera name, e.g. `b0`
    #[must_use]
    pub fn camera(&self) -> &str {
        &self.camera
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_and_accessors() {
        let pix = Array2::from_elem((5, 10), 1.5);
        let ivar = Array2::ones((5, 10));
        let mask = Array2::zeros((5, 10));
        let img = Image::new(pix, ivar, mask, 2.3, "r1").unwrap();
        assert_eq!(img.pix().dim(), (5, 10));
        assert!((img.readnoise() - 2.3).abs() < f64::EPSILON);
        assert_eq!(img.camera(), "r1");
    }

    #[test]
    fn test_shape_validation() {
        let pix = Array2::from_elem((5, 10), 1.5);
        let ivar = Array2::ones((5, 9));
        let mask = Array2::zeros((5, 10));
        assert!(Image::new(pix, ivar, mask, 1.0, "b0").is_err());
    }
}
