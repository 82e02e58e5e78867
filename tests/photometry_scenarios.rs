//! End-to-end photometric scenario: per-visit flux scales and per-star
//! fluxes recovered jointly.

mod common;

use common::*;
use jointfit::fitters::PhotometryFit;
use jointfit::geometry::Frame;
use jointfit::models::{PhotometryModel, SimplePhotometryModel};
use jointfit::Associations;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

const SCALE: f64 = 1.5e-5;
const CENTER: f64 = 1000.0;
const SIGMA_REL: f64 = 1e-4;

/// Three visits whose zero points differ by (0.0, 0.1, -0.05) mag.
/// `PhotometryFit` recovers the per-visit factors and the per-star
/// fluxes.
#[test]
fn photometric_scaling_recovery() {
    let zero_points = [0.0_f64, 0.1, -0.05];
    let factors: Vec<f64> = zero_points.iter().map(|zp| 10.0_f64.powf(-0.4 * zp)).collect();

    let mut rng = StdRng::seed_from_u64(4242);
    let noise = Normal::new(0.0, SIGMA_REL).unwrap();
    let mut assoc = Associations::new();
    assoc.set_common_tangent_point(TANGENT.0, TANGENT.1);
    let wcs = wcs_from_linear(pixel_to_tp(SCALE, CENTER));
    let frame = Frame::new(0.0, 0.0, 2000.0, 2000.0);

    let pixels = pixel_grid(10, 100.0, 190.0);
    let true_fluxes: Vec<f64> = (0..pixels.len()).map(|s| 1000.0 * (1.0 + 0.01 * s as f64)).collect();

    for (visit, (&zp, &g)) in zero_points.iter().zip(&factors).enumerate() {
        let catalog: Vec<_> = pixels
            .iter()
            .zip(&true_fluxes)
            .map(|(p, &flux)| {
                let observed = flux * g * (1.0 + noise.sample(&mut rng));
                source(p.x, p.y, 0.01, observed, flux * g * SIGMA_REL)
            })
            .collect();
        assoc
            .add_image(&catalog, &wcs, exposure(visit as i64 + 1, 0, 27.0 + zp), frame, None)
            .unwrap();
    }
    assoc.associate_catalogs(1.0, false, true);
    assert_eq!(assoc.fitted_stars().len(), 100);
    assert!(assoc.fitted_stars().iter().all(|f| f.measurement_count == 3));

    let mut model = SimplePhotometryModel::new(assoc.ccd_images());
    let params = quick_params();
    let chi2 = {
        let mut fit = PhotometryFit::new(&mut assoc, &mut model);
        fit.fit("Model Fluxes", &params).unwrap()
    };
    assert!(
        chi2.reduced() > 0.3 && chi2.reduced() < 1.7,
        "chi2/ndof = {}",
        chi2.reduced()
    );

    // the first visit anchors the scale, so the recovered factors are
    // absolute
    for (image, &g) in assoc.ccd_images().iter().zip(&factors) {
        let recovered = model.factor_of(image).unwrap();
        assert!(
            (recovered - g).abs() < 1e-4,
            "visit {}: factor {recovered} vs {g}",
            image.visit()
        );
    }
    // star fluxes land within measurement noise of the truth
    for (fs, &flux) in assoc.fitted_stars().iter().zip(&true_fluxes) {
        assert!(
            ((fs.flux - flux) / flux).abs() < 1e-3,
            "flux {} vs {flux}",
            fs.flux
        );
    }
    // validation passes on the converged model
    assert!(model.validate(assoc.ccd_images(), chi2.ndof));
}

/// A grossly miscalibrated measurement is clipped by the photometric
/// outlier pass.
#[test]
fn photometric_outlier_is_clipped() {
    use rand::Rng;

    let mut rng = StdRng::seed_from_u64(7);
    let mut assoc = Associations::new();
    assoc.set_common_tangent_point(TANGENT.0, TANGENT.1);
    let wcs = wcs_from_linear(pixel_to_tp(SCALE, CENTER));
    let frame = Frame::new(0.0, 0.0, 2000.0, 2000.0);
    let pixels = pixel_grid(5, 200.0, 350.0);

    // bounded (uniform) noise with relative sigma 1e-3
    let half_width = 1e-3 * 3.0_f64.sqrt();
    for visit in 1..=8_i64 {
        let catalog: Vec<_> = pixels
            .iter()
            .enumerate()
            .map(|(star, p)| {
                let flux = 500.0 + 20.0 * star as f64;
                let mut observed = flux * (1.0 + rng.random_range(-half_width..half_width));
                if visit == 4 && star == 6 {
                    observed *= 1.05; // 50 sigma high
                }
                source(p.x, p.y, 0.01, observed, flux * 1e-3)
            })
            .collect();
        assoc
            .add_image(&catalog, &wcs, exposure(visit, 0, 27.0), frame, None)
            .unwrap();
    }
    assoc.associate_catalogs(1.0, false, true);

    let mut model = SimplePhotometryModel::new(assoc.ccd_images());
    let mut fit = PhotometryFit::new(&mut assoc, &mut model);
    assert!(fit.minimize("Fluxes").unwrap());
    let outliers = fit.find_outliers(5.0);
    assert_eq!(outliers.len(), 1);
    assert_eq!(outliers[0].image, 3);
    assert_eq!(outliers[0].star, 6);
    fit.remove_outliers(&outliers).unwrap();
    assert!(fit.minimize("Fluxes").unwrap());
    assert!(fit.find_outliers(5.0).is_empty());
}
