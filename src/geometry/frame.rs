use std::fmt;

use super::point::Point;

/// An axis-aligned rectangle, used both for pixel bounding boxes and for
/// the domains polynomial transforms are fitted over.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Frame {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl Frame {
    pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Self {
        Frame {
            x_min: x_min.min(x_max),
            y_min: y_min.min(y_max),
            x_max: x_min.max(x_max),
            y_max: y_min.max(y_max),
        }
    }

    /// Smallest frame containing all `points`. Empty input gives the
    /// default (empty) frame.
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point>) -> Self {
        let mut iter = points.into_iter();
        let Some(first) = iter.next() else {
            return Frame::default();
        };
        let mut frame = Frame::new(first.x, first.y, first.x, first.y);
        for p in iter {
            frame.x_min = frame.x_min.min(p.x);
            frame.y_min = frame.y_min.min(p.y);
            frame.x_max = frame.x_max.max(p.x);
            frame.y_max = frame.y_max.max(p.y);
        }
        frame
    }

    pub fn center(&self) -> Point {
        Point::new(0.5 * (self.x_min + self.x_max), 0.5 * (self.y_min + self.y_max))
    }

    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }

    pub fn area(&self) -> f64 {
        (self.width() * self.height()).max(0.0)
    }

    pub fn contains(&self, point: &Point) -> bool {
        point.x >= self.x_min && point.x <= self.x_max && point.y >= self.y_min && point.y <= self.y_max
    }

    /// Intersection with `other`; an empty intersection has zero area.
    pub fn intersection(&self, other: &Frame) -> Frame {
        let x_min = self.x_min.max(other.x_min);
        let y_min = self.y_min.max(other.y_min);
        let x_max = self.x_max.min(other.x_max);
        let y_max = self.y_max.min(other.y_max);
        if x_min > x_max || y_min > y_max {
            Frame::default()
        } else {
            Frame {
                x_min,
                y_min,
                x_max,
                y_max,
            }
        }
    }

    /// Smallest frame containing `self` and `other`.
    pub fn union(&self, other: &Frame) -> Frame {
        Frame {
            x_min: self.x_min.min(other.x_min),
            y_min: self.y_min.min(other.y_min),
            x_max: self.x_max.max(other.x_max),
            y_max: self.y_max.max(other.y_max),
        }
    }

    /// Scale the frame about its center by `factor`.
    pub fn rescale(&self, factor: f64) -> Frame {
        let half_w = 0.5 * factor * self.width();
        let half_h = 0.5 * factor * self.height();
        let c = self.center();
        Frame {
            x_min: c.x - half_w,
            y_min: c.y - half_h,
            x_max: c.x + half_w,
            y_max: c.y + half_h,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}] x [{}, {}]",
            self.x_min, self.x_max, self.y_min, self.y_max
        )
    }
}

#[cfg(test)]
mod test_frame {
    use super::*;

    #[test]
    fn test_set_operations() {
        let a = Frame::new(0.0, 0.0, 4.0, 2.0);
        let b = Frame::new(2.0, 1.0, 6.0, 3.0);

        let inter = a.intersection(&b);
        assert_eq!(inter, Frame::new(2.0, 1.0, 4.0, 2.0));
        assert_eq!(inter.area(), 2.0);

        let union = a.union(&b);
        assert_eq!(union, Frame::new(0.0, 0.0, 6.0, 3.0));

        let apart = Frame::new(10.0, 10.0, 11.0, 11.0);
        assert_eq!(a.intersection(&apart).area(), 0.0);
    }

    #[test]
    fn test_contains_and_rescale() {
        let frame = Frame::new(0.0, 0.0, 2.0, 2.0);
        assert!(frame.contains(&Point::new(1.0, 1.0)));
        assert!(!frame.contains(&Point::new(3.0, 1.0)));

        let doubled = frame.rescale(2.0);
        assert_eq!(doubled, Frame::new(-1.0, -1.0, 3.0, 3.0));
        assert_eq!(doubled.center(), frame.center());
    }

    #[test]
    fn test_from_points() {
        let points = [Point::new(1.0, 5.0), Point::new(-2.0, 0.5), Point::new(0.0, 7.0)];
        let frame = Frame::from_points(points.iter());
        assert_eq!(frame, Frame::new(-2.0, 0.5, 1.0, 7.0));
    }
}
