//! Axis-aligned hyperrectangles over `f64` coordinates.
//!
//! Every dimension is a half-open interval `[low, high)`. Infinite bounds are
//! allowed so the full key space of a distribution group can be described as
//! `(-inf, inf)` in every dimension.
//!
//! # Text form
//!
//! Boxes are persisted in the coordination store and in partitioner configs
//! using a compact text form:
//!
//! ```text
//! [[0.0,5.0]:[-inf,10.0]]
//! ```
//!
//! The empty literal `[]` is the zero-dimensional box, which is treated as
//! covering the whole space.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Error returned when a box or interval literal cannot be parsed or built.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("Malformed box literal '{0}'")]
    Malformed(String),

    #[error("Invalid coordinate '{0}'")]
    InvalidCoordinate(String),

    #[error("Interval low {low} is greater than high {high}")]
    InvertedInterval { low: f64, high: f64 },

    #[error("Dimension {dimension} out of range for {dimensions}-dimensional box")]
    DimensionOutOfRange { dimension: usize, dimensions: usize },

    #[error("Split position {position} is not strictly inside [{low}, {high})")]
    SplitOutside { position: f64, low: f64, high: f64 },
}

/// A half-open interval `[low, high)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DoubleInterval {
    low: f64,
    high: f64,
}

impl DoubleInterval {
    /// The unbounded interval `(-inf, inf)`.
    pub const UNBOUNDED: Self = Self {
        low: f64::NEG_INFINITY,
        high: f64::INFINITY,
    };

    pub fn new(low: f64, high: f64) -> Result<Self, GeometryError> {
        if low.is_nan() {
            return Err(GeometryError::InvalidCoordinate(format!("{low:?}")));
        }
        if high.is_nan() {
            return Err(GeometryError::InvalidCoordinate(format!("{high:?}")));
        }
        if low > high {
            return Err(GeometryError::InvertedInterval { low, high });
        }
        Ok(Self { low, high })
    }

    #[inline]
    pub fn low(&self) -> f64 {
        self.low
    }

    #[inline]
    pub fn high(&self) -> f64 {
        self.high
    }

    /// A point interval (`low == high`) is treated as the closed interval `[p, p]`.
    #[inline]
    pub fn is_point(&self) -> bool {
        self.low == self.high
    }

    #[inline]
    pub fn is_bounded(&self) -> bool {
        self.low.is_finite() && self.high.is_finite()
    }

    /// Whether `value` lies in `[low, high)`.
    #[inline]
    pub fn covers(&self, value: f64) -> bool {
        self.low <= value && value < self.high
    }

    /// Whether `value` lies strictly between `low` and `high`.
    #[inline]
    pub fn strictly_contains(&self, value: f64) -> bool {
        self.low < value && value < self.high
    }

    pub fn overlaps(&self, other: &DoubleInterval) -> bool {
        match (self.is_point(), other.is_point()) {
            (true, true) => self.low == other.low,
            (true, false) => other.covers(self.low),
            (false, true) => self.covers(other.low),
            (false, false) => self.low < other.high && other.low < self.high,
        }
    }

    pub fn contains_interval(&self, other: &DoubleInterval) -> bool {
        self.low <= other.low && other.high <= self.high
    }

    /// Midpoint of a bounded interval, `None` when either side is infinite.
    pub fn midpoint(&self) -> Option<f64> {
        if !self.is_bounded() {
            return None;
        }
        Some(self.low + (self.high - self.low) / 2.0)
    }

    pub fn length(&self) -> f64 {
        self.high - self.low
    }

    /// Split into `[low, position)` and `[position, high)`.
    pub fn split_at(&self, position: f64) -> Result<(Self, Self), GeometryError> {
        if !self.strictly_contains(position) {
            return Err(GeometryError::SplitOutside {
                position,
                low: self.low,
                high: self.high,
            });
        }
        Ok((
            Self {
                low: self.low,
                high: position,
            },
            Self {
                low: position,
                high: self.high,
            },
        ))
    }

    fn span(&self, other: &DoubleInterval) -> Self {
        Self {
            low: self.low.min(other.low),
            high: self.high.max(other.high),
        }
    }
}

impl fmt::Display for DoubleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?},{:?}]", self.low, self.high)
    }
}

/// An axis-aligned box made of one [`DoubleInterval`] per dimension.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Hyperrectangle {
    intervals: Vec<DoubleInterval>,
}

impl Hyperrectangle {
    pub fn new(intervals: Vec<DoubleInterval>) -> Self {
        Self { intervals }
    }

    /// Build from `low, high` pairs: `from_pairs(&[(0.0, 5.0), (1.0, 2.0)])`.
    pub fn from_pairs(pairs: &[(f64, f64)]) -> Result<Self, GeometryError> {
        let intervals = pairs
            .iter()
            .map(|(low, high)| DoubleInterval::new(*low, *high))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { intervals })
    }

    /// The box covering the full space in `dimensions` dimensions.
    pub fn full_space(dimensions: usize) -> Self {
        Self {
            intervals: vec![DoubleInterval::UNBOUNDED; dimensions],
        }
    }

    #[inline]
    pub fn dimensions(&self) -> usize {
        self.intervals.len()
    }

    pub fn intervals(&self) -> &[DoubleInterval] {
        &self.intervals
    }

    pub fn interval(&self, dimension: usize) -> Result<&DoubleInterval, GeometryError> {
        self.intervals
            .get(dimension)
            .ok_or(GeometryError::DimensionOutOfRange {
                dimension,
                dimensions: self.intervals.len(),
            })
    }

    pub fn low(&self, dimension: usize) -> Result<f64, GeometryError> {
        self.interval(dimension).map(DoubleInterval::low)
    }

    pub fn high(&self, dimension: usize) -> Result<f64, GeometryError> {
        self.interval(dimension).map(DoubleInterval::high)
    }

    /// Whether the two boxes share at least one point.
    ///
    /// A zero-dimensional box covers everything. Boxes with a different,
    /// non-zero number of dimensions never intersect.
    pub fn intersects(&self, other: &Hyperrectangle) -> bool {
        if self.intervals.is_empty() || other.intervals.is_empty() {
            return true;
        }
        if self.intervals.len() != other.intervals.len() {
            return false;
        }
        self.intervals
            .iter()
            .zip(&other.intervals)
            .all(|(a, b)| a.overlaps(b))
    }

    pub fn contains_box(&self, other: &Hyperrectangle) -> bool {
        if self.intervals.is_empty() {
            return true;
        }
        self.intervals.len() == other.intervals.len()
            && self
                .intervals
                .iter()
                .zip(&other.intervals)
                .all(|(a, b)| a.contains_interval(b))
    }

    pub fn covers_point(&self, point: &[f64]) -> bool {
        self.intervals.len() == point.len()
            && self
                .intervals
                .iter()
                .zip(point)
                .all(|(interval, value)| interval.covers(*value))
    }

    pub fn covers_point_in_dimension(&self, value: f64, dimension: usize) -> bool {
        self.intervals
            .get(dimension)
            .is_some_and(|interval| interval.covers(value))
    }

    /// Split along `dimension` at `position`, returning `(left, right)`.
    ///
    /// The left box is `[low, position)` and the right box `[position, high)`
    /// in the split dimension; all other dimensions are copied.
    pub fn split_at(
        &self,
        dimension: usize,
        position: f64,
    ) -> Result<(Hyperrectangle, Hyperrectangle), GeometryError> {
        let (left_interval, right_interval) = self.interval(dimension)?.split_at(position)?;

        let mut left = self.clone();
        let mut right = self.clone();
        left.intervals[dimension] = left_interval;
        right.intervals[dimension] = right_interval;
        Ok((left, right))
    }

    /// Smallest box covering every box in `boxes`.
    ///
    /// Returns the zero-dimensional box for an empty input.
    pub fn covering_box<'a, I>(boxes: I) -> Hyperrectangle
    where
        I: IntoIterator<Item = &'a Hyperrectangle>,
    {
        let mut iter = boxes.into_iter();
        let Some(first) = iter.next() else {
            return Hyperrectangle::default();
        };

        let mut intervals = first.intervals.clone();
        for bbox in iter {
            for (acc, interval) in intervals.iter_mut().zip(&bbox.intervals) {
                *acc = acc.span(interval);
            }
        }
        Hyperrectangle { intervals }
    }

    /// Volume of the box; infinite when any side is unbounded.
    pub fn volume(&self) -> f64 {
        self.intervals.iter().map(DoubleInterval::length).product()
    }

    /// Order boxes by their low coordinates, dimension by dimension.
    pub fn cmp_by_low(&self, other: &Hyperrectangle) -> Ordering {
        for (a, b) in self.intervals.iter().zip(&other.intervals) {
            match a.low.total_cmp(&b.low) {
                Ordering::Equal => continue,
                ordering => return ordering,
            }
        }
        self.intervals.len().cmp(&other.intervals.len())
    }
}

impl fmt::Display for Hyperrectangle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, interval) in self.intervals.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{interval}")?;
        }
        f.write_str("]")
    }
}

impl FromStr for Hyperrectangle {
    type Err = GeometryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let inner = trimmed
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| GeometryError::Malformed(trimmed.to_string()))?
            .trim();

        if inner.is_empty() {
            return Ok(Hyperrectangle::default());
        }

        let intervals = inner
            .split(':')
            .map(|part| parse_interval(part, trimmed))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Hyperrectangle { intervals })
    }
}

fn parse_interval(part: &str, literal: &str) -> Result<DoubleInterval, GeometryError> {
    let body = part
        .trim()
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| GeometryError::Malformed(literal.to_string()))?;

    let (low, high) = body
        .split_once(',')
        .ok_or_else(|| GeometryError::Malformed(literal.to_string()))?;

    DoubleInterval::new(parse_coordinate(low)?, parse_coordinate(high)?)
}

fn parse_coordinate(raw: &str) -> Result<f64, GeometryError> {
    let raw = raw.trim();
    let value: f64 = raw
        .parse()
        .map_err(|_| GeometryError::InvalidCoordinate(raw.to_string()))?;
    if value.is_nan() {
        return Err(GeometryError::InvalidCoordinate(raw.to_string()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(pairs: &[(f64, f64)]) -> Hyperrectangle {
        Hyperrectangle::from_pairs(pairs).unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let bbox: Hyperrectangle = "[[0.0,5.0]:[0.0,5.0]]".parse().unwrap();
        assert_eq!(bbox.dimensions(), 2);
        assert_eq!(bbox.to_string(), "[[0.0,5.0]:[0.0,5.0]]");

        let full = Hyperrectangle::full_space(2);
        assert_eq!(full.to_string(), "[[-inf,inf]:[-inf,inf]]");
        assert_eq!(full.to_string().parse::<Hyperrectangle>().unwrap(), full);
    }

    #[test]
    fn test_parse_integer_coordinates() {
        let bbox: Hyperrectangle = "[[0,5]:[0,5]]".parse().unwrap();
        assert_eq!(bbox, rect(&[(0.0, 5.0), (0.0, 5.0)]));
    }

    #[test]
    fn test_parse_empty_literal() {
        let bbox: Hyperrectangle = "[]".parse().unwrap();
        assert_eq!(bbox.dimensions(), 0);
        assert!(bbox.intersects(&rect(&[(1.0, 2.0)])));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("0.0,5.0".parse::<Hyperrectangle>().is_err());
        assert!("[[0.0;5.0]]".parse::<Hyperrectangle>().is_err());
        assert!("[[a,5.0]]".parse::<Hyperrectangle>().is_err());
        assert!("[[5.0,1.0]]".parse::<Hyperrectangle>().is_err());
        assert!("[[NaN,1.0]]".parse::<Hyperrectangle>().is_err());
    }

    #[test]
    fn test_half_open_intersection() {
        let left = rect(&[(0.0, 10.0)]);
        let right = rect(&[(10.0, 20.0)]);
        assert!(!left.intersects(&right));

        let point = rect(&[(10.0, 10.0)]);
        assert!(!left.intersects(&point));
        assert!(right.intersects(&point));
    }

    #[test]
    fn test_intersection_dimension_mismatch() {
        assert!(!rect(&[(0.0, 1.0)]).intersects(&rect(&[(0.0, 1.0), (0.0, 1.0)])));
    }

    #[test]
    fn test_split_partitions_box() {
        let bbox = Hyperrectangle::full_space(2);
        let (left, right) = bbox.split_at(0, 10.0).unwrap();

        assert_eq!(left.interval(0).unwrap().high(), 10.0);
        assert_eq!(right.interval(0).unwrap().low(), 10.0);
        assert_eq!(left.interval(1).unwrap(), bbox.interval(1).unwrap());
        assert!(!left.intersects(&right));
        assert_eq!(Hyperrectangle::covering_box([&left, &right]), bbox);
    }

    #[test]
    fn test_split_outside_fails() {
        let bbox = rect(&[(0.0, 5.0)]);
        assert!(bbox.split_at(0, 0.0).is_err());
        assert!(bbox.split_at(0, 5.0).is_err());
        assert!(bbox.split_at(1, 2.0).is_err());
    }

    #[test]
    fn test_covering_box_and_volume() {
        let a = rect(&[(0.0, 1.0), (0.0, 1.0)]);
        let b = rect(&[(2.0, 3.0), (-1.0, 0.5)]);
        let covering = Hyperrectangle::covering_box([&a, &b]);
        assert_eq!(covering, rect(&[(0.0, 3.0), (-1.0, 1.0)]));
        assert_eq!(covering.volume(), 6.0);
        assert_eq!(Hyperrectangle::covering_box(std::iter::empty::<&Hyperrectangle>()).dimensions(), 0);
    }

    #[test]
    fn test_cmp_by_low() {
        let a = rect(&[(0.0, 1.0), (5.0, 6.0)]);
        let b = rect(&[(0.0, 1.0), (7.0, 8.0)]);
        let c = rect(&[(-1.0, 1.0), (9.0, 10.0)]);
        assert_eq!(a.cmp_by_low(&b), Ordering::Less);
        assert_eq!(c.cmp_by_low(&a), Ordering::Less);
        assert_eq!(a.cmp_by_low(&a), Ordering::Equal);
    }

    #[test]
    fn test_midpoint() {
        assert_eq!(DoubleInterval::new(0.0, 10.0).unwrap().midpoint(), Some(5.0));
        assert_eq!(DoubleInterval::UNBOUNDED.midpoint(), None);
    }
}
