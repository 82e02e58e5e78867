//! Candidate pairs across two catalogs, and the iterative outlier-rejecting
//! transform fit over them.
//!
//! A [`StarMatchList`] carries pairs of positions assumed to be the same
//! object seen in two frames, fits a polynomial transform of a configured
//! order from side 1 to side 2, and [`refine_transform`](StarMatchList::refine_transform)
//! alternates fitting with sigma clipping on the residuals until the pair
//! count stabilizes. [`remove_ambiguities`](StarMatchList::remove_ambiguities)
//! enforces one-to-one matching, keeping the closest pair for every
//! duplicated star.

use tracing::debug;

use crate::geometry::{FatPoint, PolyTransform, Transform};
use crate::jointfit_errors::JointfitError;

const MAX_REFINE_ITERATIONS: usize = 20;

/// A pair of positions, usually from different images, with generic ids
/// that let the caller trace back its own records.
#[derive(Debug, Clone)]
pub struct StarMatch {
    pub point1: FatPoint,
    pub point2: FatPoint,
    pub id1: usize,
    pub id2: usize,
    pub distance: f64,
    pub chi2: f64,
}

impl StarMatch {
    pub fn new(point1: FatPoint, point2: FatPoint, id1: usize, id2: usize) -> Self {
        StarMatch {
            point1,
            point2,
            id1,
            id2,
            distance: 0.0,
            chi2: 0.0,
        }
    }

    /// Distance from `transform(point1)` to `point2`.
    pub fn compute_distance(&self, transform: &Transform) -> f64 {
        transform.apply(&self.point1.point()).distance(&self.point2.point())
    }

    fn weight(&self) -> f64 {
        let v = 0.5 * (self.point2.vx + self.point2.vy);
        if v > 0.0 {
            1.0 / v
        } else {
            1.0
        }
    }

    fn swap_sides(&mut self) {
        std::mem::swap(&mut self.point1, &mut self.point2);
        std::mem::swap(&mut self.id1, &mut self.id2);
    }
}

/// Which side of the match list duplicates are resolved on.
pub mod ambiguity {
    /// Resolve duplicates of the first element of each pair.
    pub const SIDE_1: u8 = 1;
    /// Resolve duplicates of the second element of each pair.
    pub const SIDE_2: u8 = 2;
    /// Resolve both sides.
    pub const BOTH: u8 = 3;
}

#[derive(Debug, Default)]
pub struct StarMatchList {
    matches: Vec<StarMatch>,
    order: usize,
    transform: Transform,
    chi2: f64,
    dist2: f64,
}

impl StarMatchList {
    /// `order` is the degree of the polynomial transform fitted between the
    /// two sides.
    pub fn new(order: usize) -> Self {
        StarMatchList {
            matches: Vec::new(),
            order,
            transform: Transform::Identity,
            chi2: 0.0,
            dist2: 0.0,
        }
    }

    pub fn push(&mut self, m: StarMatch) {
        self.matches.push(m);
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn matches(&self) -> &[StarMatch] {
        &self.matches
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    pub fn transform_order(&self) -> usize {
        self.order
    }

    /// Chi2 of the last fit.
    pub fn chi2(&self) -> f64 {
        self.chi2
    }

    /// Sum of squared residuals of the last fit.
    pub fn dist2(&self) -> f64 {
        self.dist2
    }

    /// Average 1-D residual of the last fit.
    pub fn compute_residual(&self) -> f64 {
        if self.matches.is_empty() {
            0.0
        } else {
            (self.dist2 / (2.0 * self.matches.len() as f64)).sqrt()
        }
    }

    /// Seed the transform without fitting.
    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
    }

    /// Set the `distance` field of every pair, as seen through `transform`.
    /// Mandatory before sorting or resolving ambiguities on distances.
    pub fn set_distances(&mut self, transform: &Transform) {
        for m in &mut self.matches {
            m.distance = m.compute_distance(transform);
        }
    }

    /// Weighted fit of the polynomial transform of the configured order,
    /// without any outlier rejection.
    pub fn fit_transform(&mut self) -> Result<(), JointfitError> {
        let pairs: Vec<_> = self
            .matches
            .iter()
            .map(|m| (m.point1.point(), m.point2.point(), m.weight()))
            .collect();
        let poly = PolyTransform::fit(&pairs, self.order)?;
        self.transform = Transform::Poly(poly);
        self.update_statistics();
        Ok(())
    }

    fn update_statistics(&mut self) {
        self.chi2 = 0.0;
        self.dist2 = 0.0;
        for m in &mut self.matches {
            m.distance = m.compute_distance(&self.transform);
            m.chi2 = m.distance * m.distance * m.weight();
            self.chi2 += m.chi2;
            self.dist2 += m.distance * m.distance;
        }
    }

    /// Iterative robust fit: fit the transform, compute the residual RMS,
    /// drop pairs with residual beyond `n_sigmas * RMS`, and repeat until
    /// the pair count stabilizes or the iteration bound is reached.
    pub fn refine_transform(&mut self, n_sigmas: f64) -> Result<(), JointfitError> {
        for _ in 0..MAX_REFINE_ITERATIONS {
            self.fit_transform()?;
            let n = self.matches.len();
            let rms = (self.dist2 / n as f64).sqrt();
            if rms == 0.0 {
                break;
            }
            let cut = n_sigmas * rms;
            self.matches.retain(|m| m.distance <= cut);
            debug!(kept = self.matches.len(), dropped = n - self.matches.len(), rms, "refine_transform pass");
            if self.matches.len() == n {
                break;
            }
        }
        // statistics of the survivors under the final transform
        if !self.matches.is_empty() {
            self.fit_transform()?;
        }
        Ok(())
    }

    /// Enforce one-to-one matching: for duplicates on side 1 and/or side 2
    /// (selected by `mode`, see [`ambiguity`]), keep the pair with the
    /// smallest current `distance`. Returns the number of pairs removed.
    ///
    /// Distances must have been set beforehand.
    pub fn remove_ambiguities(&mut self, mode: u8) -> usize {
        let before = self.matches.len();
        if mode & ambiguity::SIDE_1 != 0 {
            self.keep_best(|m| m.id1);
        }
        if mode & ambiguity::SIDE_2 != 0 {
            self.keep_best(|m| m.id2);
        }
        before - self.matches.len()
    }

    fn keep_best(&mut self, key: impl Fn(&StarMatch) -> usize) {
        self.matches.sort_by(|a, b| {
            key(a)
                .cmp(&key(b))
                .then(a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal))
        });
        self.matches.dedup_by(|next, kept| key(kept) == key(next));
    }

    /// Swap the two sides of every pair.
    pub fn swap_sides(&mut self) {
        for m in &mut self.matches {
            m.swap_sides();
        }
    }

    /// Fit the side2 → side1 transform: swap sides, refine, swap back.
    pub fn inverse_transform(&mut self, n_sigmas: f64) -> Result<Transform, JointfitError> {
        self.swap_sides();
        let result = self.refine_transform(n_sigmas);
        let inverse = self.transform.clone();
        self.swap_sides();
        result?;
        Ok(inverse)
    }

    /// Keep only the `n_keep` first pairs.
    pub fn cut_tail(&mut self, n_keep: usize) {
        self.matches.truncate(n_keep);
    }
}
