//! Uniform-grid neighbor lookup.
//!
//! Catalog association repeatedly asks "which stored star is nearest to
//! this position, within a cut?". A flat bucket grid sized to the cut
//! radius answers that without the n² scan.

use smallvec::SmallVec;

use crate::geometry::{Frame, Point};

pub struct NeighborGrid {
    cell: f64,
    origin: Point,
    nx: usize,
    ny: usize,
    buckets: Vec<SmallVec<[u32; 4]>>,
    points: Vec<Point>,
}

impl NeighborGrid {
    /// Build a grid over `points` with cells of size `cell` (same units as
    /// the coordinates). The slice may be empty.
    pub fn new(points: &[Point], cell: f64) -> Self {
        let frame = Frame::from_points(points.iter());
        let cell = if cell > 0.0 { cell } else { 1.0 };
        let nx = ((frame.width() / cell).ceil() as usize + 1).min(4096).max(1);
        let ny = ((frame.height() / cell).ceil() as usize + 1).min(4096).max(1);
        let mut grid = NeighborGrid {
            cell,
            origin: Point::new(frame.x_min, frame.y_min),
            nx,
            ny,
            buckets: vec![SmallVec::new(); nx * ny],
            points: points.to_vec(),
        };
        for (idx, p) in points.iter().enumerate() {
            let (ix, iy) = grid.cell_of(p);
            grid.buckets[iy * grid.nx + ix].push(idx as u32);
        }
        grid
    }

    fn cell_of(&self, p: &Point) -> (usize, usize) {
        let ix = ((p.x - self.origin.x) / self.cell).floor();
        let iy = ((p.y - self.origin.y) / self.cell).floor();
        (
            (ix.max(0.0) as usize).min(self.nx - 1),
            (iy.max(0.0) as usize).min(self.ny - 1),
        )
    }

    /// Index and distance of the stored point nearest to `p` within
    /// `radius`. Ties resolve to the smallest index (insertion order).
    pub fn nearest_within(&self, p: &Point, radius: f64) -> Option<(usize, f64)> {
        if self.points.is_empty() {
            return None;
        }
        let (cx, cy) = self.cell_of(p);
        let span = (radius / self.cell).ceil() as isize + 1;
        let mut best: Option<(usize, f64)> = None;
        for iy in (cy as isize - span)..=(cy as isize + span) {
            if iy < 0 || iy as usize >= self.ny {
                continue;
            }
            for ix in (cx as isize - span)..=(cx as isize + span) {
                if ix < 0 || ix as usize >= self.nx {
                    continue;
                }
                for &idx in &self.buckets[iy as usize * self.nx + ix as usize] {
                    let idx = idx as usize;
                    let d = p.distance(&self.points[idx]);
                    if d > radius {
                        continue;
                    }
                    let better = match best {
                        None => true,
                        Some((best_idx, best_d)) => d < best_d || (d == best_d && idx < best_idx),
                    };
                    if better {
                        best = Some((idx, d));
                    }
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod test_finder {
    use super::*;

    #[test]
    fn test_nearest_within_finds_the_closest() {
        let points = vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(0.4, 0.1),
            Point::new(5.0, 5.0),
        ];
        let grid = NeighborGrid::new(&points, 0.5);
        let (idx, d) = grid.nearest_within(&Point::new(0.45, 0.05), 0.5).unwrap();
        assert_eq!(idx, 2);
        assert!(d < 0.1);
        assert!(grid.nearest_within(&Point::new(10.0, 10.0), 0.5).is_none());
    }

    #[test]
    fn test_ties_prefer_insertion_order() {
        let points = vec![Point::new(-1.0, 0.0), Point::new(1.0, 0.0)];
        let grid = NeighborGrid::new(&points, 1.0);
        let (idx, _) = grid.nearest_within(&Point::new(0.0, 0.0), 2.0).unwrap();
        assert_eq!(idx, 0);
    }

    #[test]
    fn test_empty_grid() {
        let grid = NeighborGrid::new(&[], 1.0);
        assert!(grid.nearest_within(&Point::new(0.0, 0.0), 1.0).is_none());
    }
}
