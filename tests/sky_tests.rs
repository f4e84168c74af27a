//! Sky estimation and subtraction on synthetic exposures, including the
//! full file-to-file sequence the compute_sky binary runs.

use ndarray::{Array, Array1, Array2};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tempfile::TempDir;

use specreduce::fiberflat::apply_fiberflat;
use specreduce::fibermap::{Fibermap, OBJTYPE_SKY};
use specreduce::io::{
    read_fiberflat, read_fibermap, read_frame, read_sky, write_fiberflat, write_fibermap,
    write_frame, write_sky,
};
use specreduce::sky::{compute_sky, sky_fiber_rows, subtract_sky};
use specreduce::{Error, FiberFlat, Frame};

const NSPEC: usize = 20;
const NWAVE: usize = 100;
const NSKY: usize = 6;
const SIGMA: f64 = 0.5;

/// Standard normal deviate via Box-Muller
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

fn sky_spectrum(wave: &Array1<f64>) -> Array1<f64> {
    // smooth continuum plus one emission line
    wave.mapv(|w| 40.0 + 0.01 * (w - 5000.0) + 80.0 * (-((w - 5577.0) / 3.0).powi(2)).exp())
}

/// Frame of pure sky plus Gaussian noise, with the first NSKY fibers
/// designated as sky fibers
fn noisy_sky_exposure(seed: u64) -> (Frame, Fibermap) {
    let mut rng = StdRng::seed_from_u64(seed);
    let wave = Array::linspace(5500.0, 5650.0, NWAVE);
    let truth = sky_spectrum(&wave);
    let flux = Array2::from_shape_fn((NSPEC, NWAVE), |(_, j)| truth[j] + SIGMA * gaussian(&mut rng));
    let ivar = Array2::from_elem((NSPEC, NWAVE), 1.0 / (SIGMA * SIGMA));
    let frame = Frame::new(wave, flux, ivar, None, None).unwrap();
    let mut fm = Fibermap::empty(NSPEC, 0);
    for i in 0..NSKY {
        fm.objtype[i] = OBJTYPE_SKY.to_string();
    }
    (frame, fm)
}

#[test]
fn test_compute_sky_recovers_truth_within_noise() {
    let (frame, fm) = noisy_sky_exposure(7);
    let truth = sky_spectrum(frame.wave());
    let sky = compute_sky(&frame, &fm).unwrap();

    // the weighted mean of NSKY fibers has sigma/sqrt(NSKY) scatter;
    // allow 5 sigma per bin
    let tol = 5.0 * SIGMA / (NSKY as f64).sqrt();
    for j in 0..NWAVE {
        let diff = (sky.flux()[[0, j]] - truth[j]).abs();
        assert!(diff < tol, "bin {j}: |{diff}| >= {tol}");
    }
    // model ivar is the summed fiber weights; sigma clipping may drop at
    // most the odd sample
    let w = 1.0 / (SIGMA * SIGMA);
    for j in 0..NWAVE {
        let ivar = sky.ivar()[[0, j]];
        assert!(ivar <= NSKY as f64 * w + 1e-9);
        assert!(ivar >= (NSKY - 1) as f64 * w - 1e-9);
    }
}

#[test]
fn test_subtracted_sky_fibers_are_noise() {
    let (mut frame, fm) = noisy_sky_exposure(11);
    let sky = compute_sky(&frame, &fm).unwrap();
    subtract_sky(&mut frame, &sky).unwrap();

    let rows = sky_fiber_rows(&frame, &fm).unwrap();
    let mut chi2 = 0.0;
    let mut n = 0usize;
    for &r in &rows {
        for j in 0..NWAVE {
            let w = frame.ivar()[[r, j]];
            if w > 0.0 {
                chi2 += w * frame.flux()[[r, j]].powi(2);
                n += 1;
            }
        }
    }
    // residual chi2/dof of the fit fibers is below 1 because the model was
    // fit from them; it must certainly not be far above 1
    let reduced = chi2 / n as f64;
    assert!(reduced < 1.5, "reduced chi2 = {reduced}");
}

#[test]
fn test_outlier_fiber_does_not_bias_model() {
    let (mut frame, fm) = noisy_sky_exposure(13);
    let truth = sky_spectrum(frame.wave());
    // a cosmic-ray-like streak through one sky fiber
    for j in 40..60 {
        frame.flux_mut()[[1, j]] += 500.0;
    }
    let sky = compute_sky(&frame, &fm).unwrap();
    // 5 standard errors of a mean over 4 fibers, in case clipping drops an
    // honest sample along with the streak
    let tol = 5.0 * SIGMA / 2.0;
    for j in 40..60 {
        let diff = (sky.flux()[[0, j]] - truth[j]).abs();
        assert!(diff < tol, "bin {j}: outlier leaked, |{diff}| >= {tol}");
    }
}

#[test]
fn test_pipeline_sequence_through_files() {
    let dir = TempDir::new().unwrap();
    let frame_path = dir.path().join("frame.fits");
    let fm_path = dir.path().join("fibermap.fits");
    let flat_path = dir.path().join("fiberflat.fits");
    let sky_path = dir.path().join("sky.fits");

    let (mut frame, fm) = noisy_sky_exposure(17);
    frame.meta.set("CAMERA", "b0");
    // throughput varies per fiber; the flat removes it
    let mut rng = StdRng::seed_from_u64(99);
    let mut flat_values = Array2::<f64>::zeros((NSPEC, NWAVE));
    for i in 0..NSPEC {
        let t = rng.gen_range(0.8..1.2);
        for j in 0..NWAVE {
            flat_values[[i, j]] = t;
            frame.flux_mut()[[i, j]] *= t;
            frame.ivar_mut()[[i, j]] /= t * t;
        }
    }
    let flat = FiberFlat::new(
        frame.wave().clone(),
        flat_values,
        Array2::from_elem((NSPEC, NWAVE), 1e10),
        Array2::zeros((NSPEC, NWAVE)),
        Array1::ones(NWAVE),
    )
    .unwrap();

    write_frame(&frame_path, &frame, None).unwrap();
    write_fibermap(&fm_path, &fm).unwrap();
    write_fiberflat(&flat_path, &flat).unwrap();

    // the sequence the binary runs
    let mut frame = read_frame(&frame_path).unwrap();
    let fibermap = read_fibermap(&fm_path).unwrap();
    let rows = sky_fiber_rows(&frame, &fibermap).unwrap();
    assert_eq!(rows.len(), NSKY);
    let flat = read_fiberflat(&flat_path).unwrap();
    apply_fiberflat(&mut frame, &flat).unwrap();
    let sky = compute_sky(&frame, &fibermap).unwrap();
    write_sky(&sky_path, &sky).unwrap();

    let back = read_sky(&sky_path).unwrap();
    assert_eq!(back.nspec(), NSPEC);
    // frame metadata rode along into the sky model
    assert_eq!(back.meta.get_str("CAMERA"), Some("b0"));

    // the flat-corrected sky matches the truth despite per-fiber throughput
    let truth = sky_spectrum(frame.wave());
    let tol = 6.0 * SIGMA / (NSKY as f64).sqrt();
    for j in 0..NWAVE {
        // f32 storage costs ~1e-5 relative precision, well under tol
        let diff = (back.flux()[[0, j]] - truth[j]).abs();
        assert!(diff < tol, "bin {j}: |{diff}| >= {tol}");
    }
}

#[test]
fn test_no_sky_fibers_maps_to_error() {
    let (frame, mut fm) = noisy_sky_exposure(23);
    for t in &mut fm.objtype {
        *t = "ELG".to_string();
    }
    match compute_sky(&frame, &fm) {
        Err(Error::NoSkyFibers { fibermin, fibermax }) => {
            assert_eq!(fibermin, 0);
            assert_eq!(fibermax, NSPEC as i32 - 1);
        }
        other => panic!("expected NoSkyFibers, got {other:?}"),
    }
}
