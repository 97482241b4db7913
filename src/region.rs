//! Geometric primitives for the multi-version R*-tree.
//!
//! A `Region` is a d-dimensional interval box. A `TimeRegion` pairs a region
//! with a half-open temporal validity interval `[start, end)`; `end ==
//! f64::INFINITY` is the "alive" sentinel for versions that are still
//! current.

use serde::{Deserialize, Serialize};

/// A point in d-dimensional space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub coords: Vec<f64>,
}

impl Point {
    pub fn new(coords: Vec<f64>) -> Self {
        Self { coords }
    }

    pub fn dimension(&self) -> usize {
        self.coords.len()
    }

    pub fn distance(&self, other: &Point) -> f64 {
        self.coords
            .iter()
            .zip(&other.coords)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt()
    }
}

/// A d-dimensional bounding box given by its lower and upper corners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub low: Vec<f64>,
    pub high: Vec<f64>,
}

impl Region {
    pub fn new(low: Vec<f64>, high: Vec<f64>) -> Self {
        Self { low, high }
    }

    /// A degenerate region covering a single point.
    pub fn from_point(p: &Point) -> Self {
        Self {
            low: p.coords.clone(),
            high: p.coords.clone(),
        }
    }

    /// The inverted region that is the identity of `combine`.
    pub fn empty(dimension: usize) -> Self {
        Self {
            low: vec![f64::INFINITY; dimension],
            high: vec![f64::NEG_INFINITY; dimension],
        }
    }

    pub fn dimension(&self) -> usize {
        self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.low.iter().zip(&self.high).any(|(l, h)| l > h)
    }

    pub fn area(&self) -> f64 {
        self.low
            .iter()
            .zip(&self.high)
            .map(|(l, h)| h - l)
            .product()
    }

    /// Sum of the box's edge lengths (the R*-tree "margin").
    pub fn margin(&self) -> f64 {
        self.low.iter().zip(&self.high).map(|(l, h)| h - l).sum()
    }

    pub fn intersects(&self, other: &Region) -> bool {
        self.low
            .iter()
            .zip(&self.high)
            .zip(other.low.iter().zip(&other.high))
            .all(|((l, h), (ol, oh))| l <= oh && ol <= h)
    }

    pub fn contains(&self, other: &Region) -> bool {
        self.low
            .iter()
            .zip(&self.high)
            .zip(other.low.iter().zip(&other.high))
            .all(|((l, h), (ol, oh))| l <= ol && oh <= h)
    }

    pub fn contains_point(&self, p: &Point) -> bool {
        self.low
            .iter()
            .zip(&self.high)
            .zip(&p.coords)
            .all(|((l, h), c)| l <= c && c <= h)
    }

    /// Area of the intersection with `other`, zero when disjoint.
    pub fn intersecting_area(&self, other: &Region) -> f64 {
        let mut area = 1.0;
        for i in 0..self.low.len() {
            let l = self.low[i].max(other.low[i]);
            let h = self.high[i].min(other.high[i]);
            if l >= h {
                return 0.0;
            }
            area *= h - l;
        }
        area
    }

    /// Grow this region to cover `other`.
    pub fn combine(&mut self, other: &Region) {
        for i in 0..self.low.len() {
            self.low[i] = self.low[i].min(other.low[i]);
            self.high[i] = self.high[i].max(other.high[i]);
        }
    }

    pub fn combined(&self, other: &Region) -> Region {
        let mut r = self.clone();
        r.combine(other);
        r
    }

    /// Area increase needed to cover `other`.
    pub fn enlargement(&self, other: &Region) -> f64 {
        self.combined(other).area() - self.area()
    }

    /// Overwrite this region with the coordinates of `other`, reusing the
    /// existing buffers. Used with the region pool on the insertion path.
    pub fn assign(&mut self, other: &Region) {
        self.low.clear();
        self.low.extend_from_slice(&other.low);
        self.high.clear();
        self.high.extend_from_slice(&other.high);
    }

    /// Write the box's center into `out`, reusing its buffer.
    pub fn center(&self, out: &mut Point) {
        out.coords.clear();
        out.coords
            .extend(self.low.iter().zip(&self.high).map(|(l, h)| (l + h) / 2.0));
    }

    /// Minimum Euclidean distance from `p` to this box; zero inside.
    pub fn minimum_distance(&self, p: &Point) -> f64 {
        let mut sum = 0.0;
        for i in 0..self.low.len() {
            let c = p.coords[i].clamp(self.low[i], self.high[i]);
            let d = p.coords[i] - c;
            sum += d * d;
        }
        sum.sqrt()
    }
}

/// A half-open temporal interval `[start, end)`.
///
/// `end == f64::INFINITY` means the interval is still open (alive). Closing
/// an interval is a one-way transition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeInterval {
    pub start: f64,
    pub end: f64,
}

impl TimeInterval {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// The degenerate query interval for a single instant.
    pub fn at(t: f64) -> Self {
        Self { start: t, end: t }
    }

    /// An open interval beginning at `t`.
    pub fn after(t: f64) -> Self {
        Self {
            start: t,
            end: f64::INFINITY,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.end == f64::INFINITY
    }

    /// Whether the instant `t` falls inside `[start, end)`.
    pub fn contains_time(&self, t: f64) -> bool {
        self.start <= t && t < self.end
    }

    pub fn contains_interval(&self, other: &TimeInterval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Interval intersection. Degenerate intervals (`start == end`) are
    /// treated as instants and test membership instead of open overlap.
    pub fn intersects(&self, other: &TimeInterval) -> bool {
        if self.start == self.end {
            return other.contains_time(self.start)
                || (other.start == other.end && other.start == self.start);
        }
        if other.start == other.end {
            return self.contains_time(other.start);
        }
        self.start < other.end && other.start < self.end
    }

    /// Close the interval at `t`. Closing is one-way; an already closed
    /// interval is left untouched.
    pub fn close(&mut self, t: f64) {
        if self.is_alive() {
            self.end = t;
        }
    }
}

/// A spatial bounding box paired with a temporal validity interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRegion {
    pub region: Region,
    pub interval: TimeInterval,
}

impl TimeRegion {
    pub fn new(region: Region, interval: TimeInterval) -> Self {
        Self { region, interval }
    }

    /// A region that becomes valid at `t` and is still alive.
    pub fn alive(region: Region, t: f64) -> Self {
        Self {
            region,
            interval: TimeInterval::after(t),
        }
    }

    pub fn dimension(&self) -> usize {
        self.region.dimension()
    }

    pub fn is_alive(&self) -> bool {
        self.interval.is_alive()
    }

    /// Space and time both intersect.
    pub fn intersects(&self, other: &TimeRegion) -> bool {
        self.interval.intersects(&other.interval) && self.region.intersects(&other.region)
    }

    /// Space and time both contained.
    pub fn contains(&self, other: &TimeRegion) -> bool {
        self.interval.contains_interval(&other.interval) && self.region.contains(&other.region)
    }
}
