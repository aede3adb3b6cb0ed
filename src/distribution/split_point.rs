//! Split point selection.
//!
//! A [`SplitPointStrategy`] picks the coordinate at which a region is cut in a
//! given dimension. The returned point always lies strictly inside the
//! region's interval so both halves are non-empty.

use std::sync::Arc;

use async_trait::async_trait;

use crate::hyperrectangle::Hyperrectangle;

use super::error::{RegionError, RegionResult};
use super::region::Region;

pub trait SplitPointStrategy: Send + Sync {
    fn split_point(&self, dimension: usize, covering_box: &Hyperrectangle) -> RegionResult<f64>;
}

/// Cuts the covering box in the middle.
///
/// An interval unbounded on both sides is cut at `0.0`. An interval unbounded
/// on one side has no midpoint and is rejected; use sampling for those.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleSplitStrategy;

impl SplitPointStrategy for SimpleSplitStrategy {
    fn split_point(&self, dimension: usize, covering_box: &Hyperrectangle) -> RegionResult<f64> {
        let interval = covering_box.interval(dimension)?;

        if let Some(midpoint) = interval.midpoint() {
            if interval.strictly_contains(midpoint) {
                return Ok(midpoint);
            }
            return Err(RegionError::SplitPoint(format!(
                "interval {interval} is too small to split"
            )));
        }

        if !interval.low().is_finite() && !interval.high().is_finite() {
            return Ok(0.0);
        }

        Err(RegionError::SplitPoint(format!(
            "interval {interval} is unbounded on one side"
        )))
    }
}

/// Uses the median of sampled coordinates.
///
/// Both the low and high coordinates of every sample are candidates; only
/// those strictly inside the covering box are considered.
#[derive(Debug, Clone, Default)]
pub struct SamplingBasedSplitStrategy {
    samples: Vec<Hyperrectangle>,
}

impl SamplingBasedSplitStrategy {
    pub fn new(samples: Vec<Hyperrectangle>) -> Self {
        Self { samples }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

impl SplitPointStrategy for SamplingBasedSplitStrategy {
    fn split_point(&self, dimension: usize, covering_box: &Hyperrectangle) -> RegionResult<f64> {
        let interval = covering_box.interval(dimension)?;

        let mut candidates: Vec<f64> = self
            .samples
            .iter()
            .filter_map(|sample| sample.interval(dimension).ok())
            .flat_map(|sample| [sample.low(), sample.high()])
            .filter(|coordinate| interval.strictly_contains(*coordinate))
            .collect();

        if candidates.is_empty() {
            return Err(RegionError::SplitPoint(format!(
                "none of {} samples has a coordinate inside {interval} in dimension {dimension}",
                self.samples.len()
            )));
        }

        candidates.sort_by(f64::total_cmp);
        Ok(candidates[candidates.len() / 2])
    }
}

/// Produces samples of the data stored in a region.
#[async_trait]
pub trait SampleSource: Send + Sync {
    async fn sample(&self, region: &Region) -> RegionResult<Vec<Hyperrectangle>>;
}

/// A fixed set of samples, independent of the region.
#[derive(Debug, Clone, Default)]
pub struct StaticSamples(pub Vec<Hyperrectangle>);

#[async_trait]
impl SampleSource for StaticSamples {
    async fn sample(&self, _region: &Region) -> RegionResult<Vec<Hyperrectangle>> {
        Ok(self.0.clone())
    }
}

#[async_trait]
impl<T: SampleSource + ?Sized> SampleSource for Arc<T> {
    async fn sample(&self, region: &Region) -> RegionResult<Vec<Hyperrectangle>> {
        (**self).sample(region).await
    }
}

/// Pick the strategy for a split: sampling when samples are available,
/// otherwise the midpoint.
pub fn strategy_for_samples(samples: Vec<Hyperrectangle>) -> Box<dyn SplitPointStrategy> {
    if samples.is_empty() {
        Box::new(SimpleSplitStrategy)
    } else {
        Box::new(SamplingBasedSplitStrategy::new(samples))
    }
}
