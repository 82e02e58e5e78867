use std::fmt;
use std::ops::{Add, Sub};

/// A point in a plane.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Point { x, y }
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &Point) -> f64 {
        self.dist2(other).sqrt()
    }

    /// Squared distance to `other`.
    pub fn dist2(&self, other: &Point) -> f64 {
        (self.x - other.x) * (self.x - other.x) + (self.y - other.y) * (self.y - other.y)
    }
}

impl Add for Point {
    type Output = Point;

    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Point;

    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x: {} y: {}", self.x, self.y)
    }
}

/// A [`Point`] together with the symmetric error ellipse of its position.
///
/// `vx` and `vy` are the coordinate variances, `vxy` the covariance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FatPoint {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub vxy: f64,
}

impl FatPoint {
    pub fn new(x: f64, y: f64, vx: f64, vy: f64, vxy: f64) -> Self {
        FatPoint { x, y, vx, vy, vxy }
    }

    /// A point with unit, uncorrelated errors.
    pub fn from_point(point: Point) -> Self {
        FatPoint {
            x: point.x,
            y: point.y,
            vx: 1.0,
            vy: 1.0,
            vxy: 0.0,
        }
    }

    pub fn point(&self) -> Point {
        Point::new(self.x, self.y)
    }

    /// Determinant of the covariance matrix.
    pub fn cov_determinant(&self) -> f64 {
        self.vx * self.vy - self.vxy * self.vxy
    }
}

impl Default for FatPoint {
    fn default() -> Self {
        FatPoint::from_point(Point::default())
    }
}

impl From<Point> for FatPoint {
    fn from(point: Point) -> Self {
        FatPoint::from_point(point)
    }
}
