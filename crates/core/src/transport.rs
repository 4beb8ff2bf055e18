//! Contract with the fetch/decode layer
//!
//! The streaming loader never talks to the network or a codec itself. It
//! hands each frame request to a [`FrameTransport`] together with a target
//! describing where the decoded samples belong.

use voxstream_cache::ScalarType;
use voxstream_scheduler::{CancellationToken, FrameRequest};

use crate::error::LoadResult;

/// Linear rescale applied by the decoder: `stored * slope + intercept`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingParameters {
    pub slope: f64,
    pub intercept: f64,
}

impl Default for ScalingParameters {
    fn default() -> Self {
        Self {
            slope: 1.0,
            intercept: 0.0,
        }
    }
}

impl ScalingParameters {
    pub fn new(slope: f64, intercept: f64) -> Self {
        Self { slope, intercept }
    }

    pub fn is_identity(&self) -> bool {
        self.slope == 1.0 && self.intercept == 0.0
    }
}

/// Destination of one decoded frame.
///
/// `bytes` is exactly one frame long; `byte_offset` is where that frame
/// starts inside the volume's backing buffer.
#[derive(Debug)]
pub struct FrameTarget<'a> {
    pub bytes: &'a mut [u8],
    pub byte_offset: usize,
    pub element_type: ScalarType,
}

impl FrameTarget<'_> {
    pub fn byte_length(&self) -> usize {
        self.bytes.len()
    }

    /// Number of samples the target holds.
    pub fn sample_count(&self) -> usize {
        self.bytes.len() / self.element_type.byte_size()
    }
}

/// Fetches and decodes single frames.
///
/// Implementations run on worker threads. They should poll `token` between
/// expensive steps and return [`crate::LoadError::Cancelled`] once it is set.
pub trait FrameTransport: Send + Sync {
    fn decode_frame(
        &self,
        request: &FrameRequest,
        target: FrameTarget<'_>,
        scaling: &ScalingParameters,
        token: &CancellationToken,
    ) -> LoadResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaling_identity() {
        assert!(ScalingParameters::default().is_identity());
        assert!(!ScalingParameters::new(1.0, -1024.0).is_identity());
    }

    #[test]
    fn test_target_sample_count() {
        let mut bytes = vec![0u8; 32];
        let target = FrameTarget {
            bytes: &mut bytes,
            byte_offset: 64,
            element_type: ScalarType::I16,
        };
        assert_eq!(target.byte_length(), 32);
        assert_eq!(target.sample_count(), 16);
    }
}
