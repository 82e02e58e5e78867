//! Outlier rejection scenarios: sigma clipping with the
//! one-outlier-per-parameter rule on a synthetic repeated-exposure set.

mod common;

use common::*;
use jointfit::fitters::AstrometryFit;
use jointfit::geometry::{Frame, Point};
use jointfit::models::SimplePolyModel;
use jointfit::Associations;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SCALE: f64 = 4.85e-6; // ~1 arcsec per pixel on the tangent plane
const CENTER: f64 = 1000.0;
const SIGMA_PX: f64 = 0.1;

/// Twenty exposures of a ten-star field with bounded (uniform) noise.
/// `corrupted` lists (exposure index, star index, x offset in sigmas).
fn build_field(corrupted: &[(usize, usize, f64)]) -> Associations {
    let mut rng = StdRng::seed_from_u64(42);
    let mut assoc = Associations::new();
    assoc.set_common_tangent_point(TANGENT.0, TANGENT.1);
    let lin = pixel_to_tp(SCALE, CENTER);
    let wcs = wcs_from_linear(lin);
    let frame = Frame::new(0.0, 0.0, 2000.0, 2000.0);
    let stars: Vec<Point> = (0..10)
        .map(|k| Point::new(150.0 + 180.0 * k as f64, 300.0 + 150.0 * ((k * 7) % 9) as f64))
        .collect();

    // uniform noise in ±sqrt(3)·sigma has variance sigma²
    let half_width = SIGMA_PX * 3.0_f64.sqrt();
    for image in 0..20 {
        let catalog: Vec<_> = stars
            .iter()
            .enumerate()
            .map(|(star, p)| {
                let mut x = p.x + rng.random_range(-half_width..half_width);
                let y = p.y + rng.random_range(-half_width..half_width);
                for &(bad_image, bad_star, offset_sigmas) in corrupted {
                    if bad_image == image && bad_star == star {
                        x += offset_sigmas * SIGMA_PX;
                    }
                }
                source(x, y, SIGMA_PX * SIGMA_PX, 1000.0, 10.0)
            })
            .collect();
        assoc
            .add_image(&catalog, &wcs, exposure(image as i64 + 1, 0, 27.0), frame, None)
            .unwrap();
    }
    assoc.associate_catalogs(5.0, false, true);
    assert_eq!(assoc.fitted_stars().len(), 10);
    assert!(assoc.fitted_stars().iter().all(|f| f.measurement_count == 20));
    assoc
}

/// A single 10-sigma measurement is the one and only outlier found; its
/// fitted star loses one measurement, and a second pass finds nothing.
#[test]
fn single_outlier_is_found_and_removed() {
    let mut assoc = build_field(&[(7, 3, 10.0)]);
    let mut model = SimplePolyModel::new(assoc.ccd_images(), &projector(), 1).unwrap();
    let mut fit = AstrometryFit::new(&mut assoc, &mut model);
    assert!(fit.minimize("Positions").unwrap());

    let outliers = fit.find_outliers(5.0);
    assert_eq!(outliers.len(), 1);
    assert_eq!(outliers[0].image, 7);
    assert_eq!(outliers[0].star, 3);

    fit.remove_outliers(&outliers).unwrap();

    // refit the positions without the outlier and look again
    assert!(fit.minimize("Positions").unwrap());
    assert!(fit.find_outliers(5.0).is_empty());
}

#[test]
fn outlier_bookkeeping_updates_the_graph() {
    let mut assoc = build_field(&[(7, 3, 10.0)]);
    let mut model = SimplePolyModel::new(assoc.ccd_images(), &projector(), 1).unwrap();
    {
        let mut fit = AstrometryFit::new(&mut assoc, &mut model);
        assert!(fit.minimize("Positions").unwrap());
        let outliers = fit.find_outliers(5.0);
        fit.remove_outliers(&outliers).unwrap();
    }
    let fs_index = assoc.ccd_images()[7].star(3).fitted_star.unwrap();
    assert_eq!(assoc.fitted_stars()[fs_index].measurement_count, 19);
    assert!(!assoc.ccd_images()[7].star(3).valid);
    // the other stars kept all their measurements
    let untouched = assoc
        .fitted_stars()
        .iter()
        .filter(|f| f.measurement_count == 20)
        .count();
    assert_eq!(untouched, 9);
}

/// Two gross outliers on the same star constrain the same position
/// parameters: the Betoule rule admits only the stronger one per pass.
#[test]
fn no_two_outliers_share_a_parameter() {
    let mut assoc = build_field(&[(5, 3, 14.0), (11, 3, 12.0)]);
    let mut model = SimplePolyModel::new(assoc.ccd_images(), &projector(), 1).unwrap();
    let mut fit = AstrometryFit::new(&mut assoc, &mut model);
    assert!(fit.minimize("Positions").unwrap());

    let first_pass = fit.find_outliers(5.0);
    assert_eq!(first_pass.len(), 1, "only one outlier per constrained parameter");
    assert_eq!(first_pass[0].image, 5);
    fit.remove_outliers(&first_pass).unwrap();

    assert!(fit.minimize("Positions").unwrap());
    let second_pass = fit.find_outliers(5.0);
    assert_eq!(second_pass.len(), 1);
    assert_eq!(second_pass[0].image, 11);
    fit.remove_outliers(&second_pass).unwrap();

    assert!(fit.minimize("Positions").unwrap());
    assert!(fit.find_outliers(5.0).is_empty());
}
