//! Quality-assurance records and metric evaluation.
//!
//! QA state is a tree: an exposure record holds per-camera frame records,
//! each frame record holds per-stage parameter and metric dictionaries.
//! Records serialize to YAML so they diff cleanly between pipeline runs.

pub mod plots;

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use crate::fibermap::Fibermap;
use crate::frame::Frame;
use crate::sky::{combine_ivar, sky_fiber_rows, SkyModel};
use crate::stats::{chi2_sf, median, percentile};
use crate::{Error, Result};

/// Sky-subtraction stage name
pub const STAGE_SKYSUB: &str = "SKYSUB";
/// Fiber-flat stage name
pub const STAGE_FIBERFLAT: &str = "FIBERFLAT";
/// Flux-calibration stage name
pub const STAGE_FLUXCALIB: &str = "FLUXCALIB";

/// Chi-square p-value below which a sky fiber counts as badly subtracted
pub const DEFAULT_PCHI_RESID: f64 = 0.05;
/// Percentile band width for the residual spread metric
pub const DEFAULT_PER_RESID: f64 = 95.0;

/// A scalar or small-vector QA quantity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// Counts
    Int(i64),
    /// Measurements
    Float(f64),
    /// Small fixed-meaning vectors, e.g. a percentile band
    List(Vec<f64>),
}

impl MetricValue {
    /// Integer view
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Floating-point view, converting counts
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            #[allow(clippy::cast_precision_loss)]
            Self::Int(i) => Some(*i as f64),
            Self::List(_) => None,
        }
    }

    /// Vector view
    #[must_use]
    pub fn as_list(&self) -> Option<&[f64]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }
}

/// Parameters and resulting metrics of one QA stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QaStage {
    /// Thresholds the stage was evaluated with
    pub params: BTreeMap<String, f64>,
    /// Evaluated metrics
    pub metrics: BTreeMap<String, MetricValue>,
}

/// QA record for one camera of one exposure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaFrame {
    /// Camera name, e.g. `b0`
    pub camera: String,
    /// Exposure flavor: `science`, `arc`, `flat`
    pub flavor: String,
    /// When the record was created
    pub created: DateTime<Utc>,
    /// Stage records keyed by stage name
    pub stages: BTreeMap<String, QaStage>,
}

impl QaFrame {
    /// New record for a camera
    #[must_use]
    pub fn new(camera: &str, flavor: &str) -> Self {
        Self {
            camera: camera.to_string(),
            flavor: flavor.to_string(),
            created: Utc::now(),
            stages: BTreeMap::new(),
        }
    }

    /// Create the SKYSUB stage with default thresholds; keeps existing
    /// params when the stage is already present
    pub fn init_skysub(&mut self) {
        let stage = self.stages.entry(STAGE_SKYSUB.to_string()).or_default();
        stage
            .params
            .entry("PCHI_RESID".to_string())
            .or_insert(DEFAULT_PCHI_RESID);
        stage
            .params
            .entry("PER_RESID".to_string())
            .or_insert(DEFAULT_PER_RESID);
    }

    /// Stage record, if evaluated
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&QaStage> {
        self.stages.get(name)
    }
}

/// QA record for a whole exposure: per-camera frame records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaExposure {
    /// Exposure flavor: `science`, `arc`, `flat`
    pub flavor: String,
    /// Exposure number, if known
    pub expid: Option<i64>,
    /// Observation night `YYYYMMDD`, if known
    pub night: Option<String>,
    /// Frame records keyed by camera
    pub frames: BTreeMap<String, QaFrame>,
}

impl QaExposure {
    /// New exposure record
    #[must_use]
    pub fn new(flavor: &str) -> Self {
        Self {
            flavor: flavor.to_string(),
            expid: None,
            night: None,
            frames: BTreeMap::new(),
        }
    }

    /// Frame record for a camera, created on first access
    pub fn frame_mut(&mut self, camera: &str) -> &mut QaFrame {
        let flavor = self.flavor.clone();
        self.frames
            .entry(camera.to_string())
            .or_insert_with(|| QaFrame::new(camera, &flavor))
    }
}

/// Sky-subtraction residuals of the sky fibers themselves
#[derive(Debug, Clone)]
pub struct SkyResiduals {
    /// Wavelength grid
    pub wave: Array1<f64>,
    /// `flux - sky` per sky fiber, `[nsky][nwave]`
    pub resid: Array2<f64>,
    /// Combined (frame + model) inverse variance of each residual
    pub ivar: Array2<f64>,
    /// Frame row index of each sky fiber
    pub rows: Vec<usize>,
}

/// Residuals of the sky model against the sky fibers it was fit from.
///
/// # Errors
/// Returns `NoSkyFibers` when the fibermap designates none in range and
/// shape errors when the model does not match the frame.
pub fn sky_residuals(
    frame: &Frame,
    fibermap: &Fibermap,
    sky: &SkyModel,
) -> Result<SkyResiduals> {
    if frame.nwave() != sky.nwave() || frame.nspec() != sky.nspec() {
        return Err(Error::ShapeMismatch(format!(
            "sky model {}x{} does not match frame {}x{}",
            sky.nspec(),
            sky.nwave(),
            frame.nspec(),
            frame.nwave()
        )));
    }
    let rows = sky_fiber_rows(frame, fibermap)?;
    let nwave = frame.nwave();
    let mut resid = Array2::<f64>::zeros((rows.len(), nwave));
    let mut ivar = Array2::<f64>::zeros((rows.len(), nwave));
    for (k, &r) in rows.iter().enumerate() {
        for j in 0..nwave {
            resid[[k, j]] = frame.flux()[[r, j]] - sky.flux()[[r, j]];
            ivar[[k, j]] = combine_ivar(frame.ivar()[[r, j]], sky.ivar()[[r, j]]);
        }
    }
    Ok(SkyResiduals {
        wave: frame.wave().clone(),
        resid,
        ivar,
        rows,
    })
}

/// Evaluate SKYSUB metrics on a frame's sky fibers and store them on the
/// QA record: sky-fiber count, count of fibers with a bad residual
/// chi-square, median residual, and the central residual percentile band.
///
/// # Errors
/// Returns `Qa` when the SKYSUB stage was not initialized, plus the errors
/// of [`sky_residuals`].
pub fn qa_skysub(
    qaframe: &mut QaFrame,
    frame: &Frame,
    fibermap: &Fibermap,
    sky: &SkyModel,
) -> Result<()> {
    let residuals = sky_residuals(frame, fibermap, sky)?;
    let stage = qaframe
        .stages
        .get_mut(STAGE_SKYSUB)
        .ok_or_else(|| Error::Qa("SKYSUB stage not initialized".to_string()))?;
    let pchi = stage.params.get("PCHI_RESID").copied().unwrap_or(DEFAULT_PCHI_RESID);
    let per = stage.params.get("PER_RESID").copied().unwrap_or(DEFAULT_PER_RESID);

    let nsky = residuals.rows.len();

    // per-fiber residual chi-square against the model
    let mut nbad_pchi = 0i64;
    for k in 0..nsky {
        let mut chi2 = 0.0;
        let mut dof = 0usize;
        for j in 0..residuals.wave.len() {
            let w = residuals.ivar[[k, j]];
            if w > 0.0 {
                chi2 += w * residuals.resid[[k, j]] * residuals.resid[[k, j]];
                dof += 1;
            }
        }
        if dof > 0 && chi2_sf(chi2, dof) < pchi {
            nbad_pchi += 1;
        }
    }

    let flat: Vec<f64> = residuals
        .resid
        .iter()
        .zip(residuals.ivar.iter())
        .filter(|(_, &w)| w > 0.0)
        .map(|(&r, _)| r)
        .collect();
    let med_resid = median(&flat).unwrap_or(f64::NAN);
    let half_tail = (100.0 - per) / 2.0;
    let resid_per = vec![
        percentile(&flat, half_tail).unwrap_or(f64::NAN),
        percentile(&flat, 100.0 - half_tail).unwrap_or(f64::NAN),
    ];

    info!(
        camera = %qaframe.camera,
        nsky,
        nbad_pchi,
        med_resid,
        "sky subtraction QA"
    );

    stage
        .metrics
        .insert("NSKY_FIB".to_string(), MetricValue::Int(nsky as i64));
    stage
        .metrics
        .insert("NBAD_PCHI".to_string(), MetricValue::Int(nbad_pchi));
    stage
        .metrics
        .insert("MED_RESID".to_string(), MetricValue::Float(med_resid));
    stage
        .metrics
        .insert("RESID_PER".to_string(), MetricValue::List(resid_per));
    Ok(())
}
