//! QA figures rendered to PNG.

use ndarray::Array2;
use plotters::prelude::*;

use crate::fibermap::Fibermap;
use crate::fluxcalib::FluxCalib;
use crate::frame::Frame;
use crate::qa::{sky_residuals, QaFrame, STAGE_SKYSUB};
use crate::sky::SkyModel;
use crate::stats::{mean_std, median, normal_cdf};
use crate::{Error, Result};
use crate::fiberflat::FiberFlat;

const FIG_WIDTH: u32 = 1000;
const FIG_HEIGHT: u32 = 800;
const HIST_NBINS: usize = 50;
const HIST_RANGE: f64 = 6.0;

fn plot_err<E: std::fmt::Display>(e: E) -> Error {
    Error::Plot(e.to_string())
}

/// Sky-residual QA figure: median residual versus wavelength, the
/// distribution of residual deviates against the unit Gaussian, and the
/// SKYSUB metrics panel.
///
/// # Errors
/// Returns `Plot` on rendering failure plus the errors of
/// [`sky_residuals`].
pub fn frame_skyres(
    path: &std::path::Path,
    frame: &Frame,
    fibermap: &Fibermap,
    sky: &SkyModel,
    qaframe: &QaFrame,
) -> Result<()> {
    let residuals = sky_residuals(frame, fibermap, sky)?;
    let nwave = residuals.wave.len();

    // median residual per wavelength over the sky fibers
    let mut med_resid = Vec::with_capacity(nwave);
    let mut column = Vec::new();
    for j in 0..nwave {
        column.clear();
        for k in 0..residuals.rows.len() {
            if residuals.ivar[[k, j]] > 0.0 {
                column.push(residuals.resid[[k, j]]);
            }
        }
        med_resid.push(median(&column).unwrap_or(0.0));
    }

    // residual deviates, clipped into the histogram window
    let deviates: Vec<f64> = residuals
        .resid
        .iter()
        .zip(residuals.ivar.iter())
        .filter(|(_, &w)| w > 0.0)
        .map(|(&r, &w)| r * w.sqrt())
        .filter(|d| d.abs() <= HIST_RANGE)
        .collect();

    let root = BitMapBackend::new(path, (FIG_WIDTH, FIG_HEIGHT)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;
    let (top, bottom) = root.split_vertically((FIG_HEIGHT / 2) as i32);

    draw_median_residual(&top, &residuals.wave.to_vec(), &med_resid, qaframe)?;

    let panels = bottom.split_evenly((1, 2));
    draw_deviate_histogram(&panels[0], &deviates)?;
    draw_metrics_panel(&panels[1], qaframe)?;

    root.present().map_err(plot_err)?;
    Ok(())
}

fn draw_median_residual<DB: DrawingBackend>(
    area: &DrawingArea<DB, plotters::coord::Shift>,
    wave: &[f64],
    med_resid: &[f64],
    qaframe: &QaFrame,
) -> Result<()> {
    let (wmin, wmax) = match (wave.first(), wave.last()) {
        (Some(&a), Some(&b)) => (a, b),
        _ => return Err(Error::Plot("empty wavelength grid".to_string())),
    };
    let ymax = med_resid
        .iter()
        .fold(1.0_f64, |m, v| m.max(v.abs()))
        * 1.1;

    let mut chart = ChartBuilder::on(area)
        .caption(
            format!("Sky residuals, camera {}", qaframe.camera),
            ("sans-serif", 24),
        )
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(wmin..wmax, -ymax..ymax)
        .map_err(plot_err)?;
    chart
        .configure_mesh()
        .x_desc("Wavelength (Angstrom)")
        .y_desc("Median residual")
        .draw()
        .map_err(plot_err)?;
    chart
        .draw_series(LineSeries::new(
            wave.iter().copied().zip(med_resid.iter().copied()),
            &BLUE,
        ))
        .map_err(plot_err)?;
    chart
        .draw_series(LineSeries::new(
            [(wmin, 0.0), (wmax, 0.0)],
            &BLACK.mix(0.5),
        ))
        .map_err(plot_err)?;
    Ok(())
}

fn draw_deviate_histogram<DB: DrawingBackend>(
    area: &DrawingArea<DB, plotters::coord::Shift>,
    deviates: &[f64],
) -> Result<()> {
    let bin_width = 2.0 * HIST_RANGE / HIST_NBINS as f64;
    let mut counts = vec![0usize; HIST_NBINS];
    for &d in deviates {
        let bin = ((d + HIST_RANGE) / bin_width) as usize;
        counts[bin.min(HIST_NBINS - 1)] += 1;
    }
    let ymax = counts.iter().copied().max().unwrap_or(1).max(1) as f64 * 1.2;

    let (mean, std) = mean_std(deviates);
    let label = if deviates.is_empty() {
        "no usable residuals".to_string()
    } else {
        format!("mean {mean:.2}, rms {std:.2}")
    };

    let mut chart = ChartBuilder::on(area)
        .caption("Residual deviates", ("sans-serif", 20))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(-HIST_RANGE..HIST_RANGE, 0.0..ymax)
        .map_err(plot_err)?;
    chart
        .configure_mesh()
        .x_desc("(flux - sky) * sqrt(ivar)")
        .y_desc("Count")
        .draw()
        .map_err(plot_err)?;

    chart
        .draw_series(counts.iter().enumerate().map(|(i, &c)| {
            let x0 = -HIST_RANGE + i as f64 * bin_width;
            Rectangle::new([(x0, 0.0), (x0 + bin_width, c as f64)], BLUE.mix(0.4).filled())
        }))
        .map_err(plot_err)?;

    // unit Gaussian expectation, scaled to the sample size
    let n = deviates.len() as f64;
    chart
        .draw_series(LineSeries::new(
            (0..=200).map(|i| {
                let x = -HIST_RANGE + i as f64 * (2.0 * HIST_RANGE / 200.0);
                let half = bin_width / 2.0;
                let expected = n * (normal_cdf(x + half) - normal_cdf(x - half));
                (x, expected)
            }),
            RED.stroke_width(2),
        ))
        .map_err(plot_err)?
        .label(label)
        .legend(|(x, y)| PathElement::new([(x, y), (x + 16, y)], RED));
    chart
        .configure_series_labels()
        .border_style(BLACK)
        .background_style(WHITE.mix(0.8))
        .draw()
        .map_err(plot_err)?;
    Ok(())
}

fn draw_metrics_panel<DB: DrawingBackend>(
    area: &DrawingArea<DB, plotters::coord::Shift>,
    qaframe: &QaFrame,
) -> Result<()> {
    let style = TextStyle::from(("sans-serif", 18)).color(&BLACK);
    let mut y = 40;
    area.draw_text(&format!("flavor: {}", qaframe.flavor), &style, (30, y))
        .map_err(plot_err)?;
    y += 28;
    if let Some(stage) = qaframe.stage(STAGE_SKYSUB) {
        for (name, value) in &stage.params {
            area.draw_text(&format!("{name}: {value}"), &style, (30, y))
                .map_err(plot_err)?;
            y += 28;
        }
        for (name, value) in &stage.metrics {
            let text = match value {
                crate::qa::MetricValue::Int(i) => format!("{name}: {i}"),
                crate::qa::MetricValue::Float(f) => format!("{name}: {f:.4}"),
                crate::qa::MetricValue::List(v) => {
                    let items: Vec<String> = v.iter().map(|x| format!("{x:.3}")).collect();
                    format!("{name}: [{}]", items.join(", "))
                }
            };
            area.draw_text(&text, &style, (30, y)).map_err(plot_err)?;
            y += 28;
        }
    }
    Ok(())
}

/// Fiber-flat QA figure: per-fiber mean flat and flat RMS mapped over the
/// focal plane at the fibermap's target positions.
///
/// # Errors
/// Returns `ShapeMismatch` when the fibermap and flat disagree on fiber
/// count and `Plot` on rendering failure.
pub fn frame_fiberflat(
    path: &std::path::Path,
    fibermap: &Fibermap,
    flat: &FiberFlat,
) -> Result<()> {
    if fibermap.len() != flat.nspec() {
        return Err(Error::ShapeMismatch(format!(
            "fibermap has {} rows, fiberflat has {} fibers",
            fibermap.len(),
            flat.nspec()
        )));
    }
    let mean: Vec<f64> = per_fiber_mean(flat.fiberflat());
    let rms: Vec<f64> = per_fiber_rms(flat.fiberflat(), &mean);

    let root = BitMapBackend::new(path, (FIG_WIDTH, FIG_HEIGHT / 2)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;
    let panels = root.split_evenly((1, 2));
    draw_focal_plane(&panels[0], "Mean fiberflat", fibermap, &mean)?;
    draw_focal_plane(&panels[1], "Fiberflat RMS", fibermap, &rms)?;
    root.present().map_err(plot_err)?;
    Ok(())
}

fn per_fiber_mean(values: &Array2<f64>) -> Vec<f64> {
    let nwave = values.ncols().max(1) as f64;
    values
        .rows()
        .into_iter()
        .map(|row| row.sum() / nwave)
        .collect()
}

fn per_fiber_rms(values: &Array2<f64>, mean: &[f64]) -> Vec<f64> {
    let nwave = values.ncols().max(1) as f64;
    values
        .rows()
        .into_iter()
        .zip(mean)
        .map(|(row, &m)| (row.iter().map(|v| (v - m).powi(2)).sum::<f64>() / nwave).sqrt())
        .collect()
}

fn draw_focal_plane<DB: DrawingBackend>(
    area: &DrawingArea<DB, plotters::coord::Shift>,
    title: &str,
    fibermap: &Fibermap,
    values: &[f64],
) -> Result<()> {
    let vmin = values.iter().copied().fold(f64::INFINITY, f64::min);
    let vmax = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = if (vmax - vmin).abs() < f64::EPSILON {
        1.0
    } else {
        vmax - vmin
    };

    let xr = axis_range(&fibermap.x_target);
    let yr = axis_range(&fibermap.y_target);
    let mut chart = ChartBuilder::on(area)
        .caption(
            format!("{title} [{vmin:.3}, {vmax:.3}]"),
            ("sans-serif", 20),
        )
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(xr, yr)
        .map_err(plot_err)?;
    chart
        .configure_mesh()
        .x_desc("x (mm)")
        .y_desc("y (mm)")
        .draw()
        .map_err(plot_err)?;
    chart
        .draw_series(
            fibermap
                .x_target
                .iter()
                .zip(&fibermap.y_target)
                .zip(values)
                .map(|((&x, &y), &v)| {
                    let t = (v - vmin) / span;
                    Circle::new((x, y), 4, heat_color(t).filled())
                }),
        )
        .map_err(plot_err)?;
    Ok(())
}

fn axis_range(values: &[f64]) -> std::ops::Range<f64> {
    let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if lo.is_finite() && hi.is_finite() && hi > lo {
        let pad = (hi - lo) * 0.05;
        lo - pad..hi + pad
    } else {
        -1.0..1.0
    }
}

/// Blue-to-red ramp for scalar focal-plane maps
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn heat_color(t: f64) -> RGBColor {
    let t = t.clamp(0.0, 1.0);
    let r = (255.0 * t) as u8;
    let g = (64.0 * (1.0 - (2.0 * t - 1.0).abs())) as u8;
    let b = (255.0 * (1.0 - t)) as u8;
    RGBColor(r, g, b)
}

/// Flux-calibration QA figure: the fiber-median zero point versus
/// wavelength.
///
/// # Errors
/// Returns `Plot` on rendering failure.
pub fn frame_fluxcalib(path: &std::path::Path, fluxcalib: &FluxCalib) -> Result<()> {
    let zp = fluxcalib.zero_point();
    let points: Vec<(f64, f64)> = fluxcalib
        .wave()
        .iter()
        .zip(zp.iter())
        .filter(|(_, v)| v.is_finite())
        .map(|(&w, &v)| (w, v))
        .collect();
    if points.is_empty() {
        return Err(Error::Plot("no unmasked calibration data".to_string()));
    }
    let wmin = points[0].0;
    let wmax = points[points.len() - 1].0;
    let vmin = points.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
    let vmax = points.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);
    let pad = ((vmax - vmin) * 0.1).max(1e-12);

    let root = BitMapBackend::new(path, (FIG_WIDTH, FIG_HEIGHT / 2)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;
    let mut chart = ChartBuilder::on(&root)
        .caption("Flux calibration zero point", ("sans-serif", 24))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(wmin..wmax, vmin - pad..vmax + pad)
        .map_err(plot_err)?;
    chart
        .configure_mesh()
        .x_desc("Wavelength (Angstrom)")
        .y_desc("Zero point")
        .draw()
        .map_err(plot_err)?;
    chart
        .draw_series(LineSeries::new(points, &BLUE))
        .map_err(plot_err)?;
    root.present().map_err(plot_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fibermap::OBJTYPE_SKY;
    use crate::qa::qa_skysub;
    use crate::sky::compute_sky;
    use ndarray::{Array, Array1};

    // Rendering needs host fonts for axis labels; a missing-font failure
    // shows up as Error::Plot and is tolerated here.
    fn accept(result: Result<()>, path: &std::path::Path) {
        match result {
            Ok(()) => assert!(path.exists()),
            Err(Error::Plot(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_frame_skyres_smoke() {
        let nwave = 40;
        let wave = Array::linspace(5000.0, 6000.0, nwave);
        let flux = Array2::from_elem((8, nwave), 120.0);
        let ivar = Array2::from_elem((8, nwave), 1.0);
        let frame = Frame::new(wave, flux, ivar, None, None).unwrap();
        let mut fm = Fibermap::empty(8, 0);
        for i in 0..3 {
            fm.objtype[i] = OBJTYPE_SKY.to_string();
        }
        let sky = compute_sky(&frame, &fm).unwrap();
        let mut qa = QaFrame::new("b0", "science");
        qa.init_skysub();
        qa_skysub(&mut qa, &frame, &fm, &sky).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skyres.png");
        accept(frame_skyres(&path, &frame, &fm, &sky, &qa), &path);
    }

    #[test]
    fn test_frame_fiberflat_smoke() {
        let nwave = 20;
        let wave = Array::linspace(5000.0, 6000.0, nwave);
        let mut fm = Fibermap::empty(6, 0);
        for i in 0..6 {
            fm.x_target[i] = i as f64 * 10.0;
            fm.y_target[i] = (i % 3) as f64 * 5.0;
        }
        let flat = FiberFlat::new(
            wave,
            Array2::from_shape_fn((6, nwave), |(i, j)| 1.0 + 0.01 * (i + j) as f64),
            Array2::ones((6, nwave)),
            Array2::zeros((6, nwave)),
            Array1::ones(nwave),
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fiberflat.png");
        accept(frame_fiberflat(&path, &fm, &flat), &path);
    }

    #[test]
    fn test_frame_fiberflat_count_mismatch() {
        let nwave = 10;
        let wave = Array::linspace(5000.0, 6000.0, nwave);
        let fm = Fibermap::empty(4, 0);
        let flat = FiberFlat::new(
            wave,
            Array2::ones((6, nwave)),
            Array2::ones((6, nwave)),
            Array2::zeros((6, nwave)),
            Array1::ones(nwave),
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fiberflat.png");
        assert!(matches!(
            frame_fiberflat(&path, &fm, &flat),
            Err(Error::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_frame_fluxcalib_smoke() {
        let nwave = 30;
        let wave = Array::linspace(3600.0, 5800.0, nwave);
        let fc = FluxCalib::new(
            wave,
            Array2::from_shape_fn((5, nwave), |(_, j)| 20.0 + (j as f64 / 10.0).sin()),
            Array2::ones((5, nwave)),
            Array2::zeros((5, nwave)),
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fluxcalib.png");
        accept(frame_fluxcalib(&path, &fc), &path);
    }
}
