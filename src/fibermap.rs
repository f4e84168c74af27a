//! Per-fiber target metadata table.
//!
//! The fibermap records, for every fiber of an exposure, which positioner it
//! sits on, which target it observed and where that target is on the sky and
//! on the focal plane. Sky-fiber selection for sky modeling starts here.

use crate::{Error, Result};

/// Fibers per spectrograph; fiber `f` belongs to spectrograph `f / 500`
pub const FIBERS_PER_SPECTROGRAPH: i32 = 500;

/// Object type string marking a sky fiber
pub const OBJTYPE_SKY: &str = "SKY";

/// Columnar per-fiber metadata for one exposure
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fibermap {
    /// Absolute fiber number
    pub fiber: Vec<i32>,
    /// Positioner the fiber is mounted on
    pub positioner: Vec<i32>,
    /// Spectrograph index, `fiber / 500`
    pub spectroid: Vec<i32>,
    /// Unique target identifier
    pub targetid: Vec<i64>,
    /// Target class: `SKY`, `STD`, `ELG`, `LRG`, `QSO`, ...
    pub objtype: Vec<String>,
    /// Target right ascension, degrees
    pub target_ra: Vec<f64>,
    /// Target declination, degrees
    pub target_dec: Vec<f64>,
    /// Focal-plane x position, mm
    pub x_target: Vec<f64>,
    /// Focal-plane y position, mm
    pub y_target: Vec<f64>,
}

impl Fibermap {
    /// Blank fibermap for `nspec` fibers starting at `specmin`.
    ///
    /// FIBER counts up from `specmin`; SPECTROID follows from the fiber
    /// number; everything else is zeroed or empty.
    #[must_use]
    pub fn empty(nspec: usize, specmin: i32) -> Self {
        let fiber: Vec<i32> = (0..nspec as i32).map(|i| specmin + i).collect();
        let spectroid = fiber.iter().map(|f| f / FIBERS_PER_SPECTROGRAPH).collect();
        Self {
            fiber,
            positioner: vec![0; nspec],
            spectroid,
            targetid: vec![-1; nspec],
            objtype: vec![String::new(); nspec],
            target_ra: vec![0.0; nspec],
            target_dec: vec![0.0; nspec],
            x_target: vec![0.0; nspec],
            y_target: vec![0.0; nspec],
        }
    }

    /// Number of rows
    #[must_use]
    pub fn len(&self) -> usize {
        self.fiber.len()
    }

    /// True when the table has no rows
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fiber.is_empty()
    }

    /// Check that every column has the same number of rows
    ///
    /// # Errors
    /// Returns `ShapeMismatch` naming the offending column.
    pub fn validate(&self) -> Result<()> {
        let n = self.fiber.len();
        let columns: [(&str, usize); 8] = [
            ("POSITIONER", self.positioner.len()),
            ("SPECTROID", self.spectroid.len()),
            ("TARGETID", self.targetid.len()),
            ("OBJTYPE", self.objtype.len()),
            ("TARGET_RA", self.target_ra.len()),
            ("TARGET_DEC", self.target_dec.len()),
            ("X_TARGET", self.x_target.len()),
            ("Y_TARGET", self.y_target.len()),
        ];
        for (name, len) in columns {
            if len != n {
                return Err(Error::ShapeMismatch(format!(
                    "fibermap column {name} has {len} rows, FIBER has {n}"
                )));
            }
        }
        Ok(())
    }

    /// Row index of an absolute fiber number
    #[must_use]
    pub fn index_of(&self, fiber: i32) -> Option<usize> {
        self.fiber.iter().position(|&f| f == fiber)
    }

    /// Fiber numbers of sky fibers within `[fibermin, fibermax]`
    #[must_use]
    pub fn sky_fibers(&self, fibermin: i32, fibermax: i32) -> Vec<i32> {
        self.fiber
            .iter()
            .zip(&self.objtype)
            .filter(|(&f, t)| *t == OBJTYPE_SKY && f >= fibermin && f <= fibermax)
            .map(|(&f, _)| f)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_fiber_numbering() {
        let fm = Fibermap::empty(300, 500);
        assert_eq!(fm.len(), 300);
        assert_eq!(fm.fiber[0], 500);
        assert_eq!(fm.fiber[299], 799);
        // all fibers 500..800 sit on spectrograph 1
        assert!(fm.spectroid.iter().all(|&s| s == 1));
    }

    #[test]
    fn test_empty_spans_spectrographs() {
        let fm = Fibermap::empty(600, 200);
        assert_eq!(fm.spectroid[0], 0);
        assert_eq!(fm.spectroid[299], 0);
        assert_eq!(fm.spectroid[300], 1);
        assert_eq!(fm.spectroid[599], 1);
    }

    #[test]
    fn test_sky_fiber_selection() {
        let mut fm = Fibermap::empty(10, 0);
        fm.objtype[2] = OBJTYPE_SKY.to_string();
        fm.objtype[5] = OBJTYPE_SKY.to_string();
        fm.objtype[7] = "ELG".to_string();
        fm.objtype[9] = OBJTYPE_SKY.to_string();
        assert_eq!(fm.sky_fibers(0, 9), vec![2, 5, 9]);
        // range cuts apply
        assert_eq!(fm.sky_fibers(3, 8), vec![5]);
        assert!(fm.sky_fibers(10, 20).is_empty());
    }

    #[test]
    fn test_validate_catches_ragged_columns() {
        let mut fm = Fibermap::empty(5, 0);
        fm.objtype.pop();
        let err = fm.validate().unwrap_err();
        assert!(err.to_string().contains("OBJTYPE"));
    }

    #[test]
    fn test_index_of() {
        let fm = Fibermap::empty(10, 100);
        assert_eq!(fm.index_of(103), Some(3));
        assert_eq!(fm.index_of(99), None);
    }
}
