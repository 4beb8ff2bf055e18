//! Memory pressure classification for the byte budget.

/// How close the cache is to its byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    /// Below half the budget
    Low,
    /// 50% to 75%
    Moderate,
    /// 75% to 90%
    High,
    /// 90% and above; further volumes are unlikely to fit
    Critical,
}

impl MemoryPressure {
    /// Classify a utilization ratio in `0.0..=1.0`.
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.5 {
            MemoryPressure::Low
        } else if utilization < 0.75 {
            MemoryPressure::Moderate
        } else if utilization < 0.90 {
            MemoryPressure::High
        } else {
            MemoryPressure::Critical
        }
    }

    /// Classify `used` bytes against `limit`. A zero budget is always critical.
    pub fn from_usage(used: usize, limit: usize) -> Self {
        if limit == 0 {
            return MemoryPressure::Critical;
        }
        Self::from_utilization(used as f64 / limit as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pressure_levels() {
        assert_eq!(MemoryPressure::from_utilization(0.1), MemoryPressure::Low);
        assert_eq!(MemoryPressure::from_utilization(0.6), MemoryPressure::Moderate);
        assert_eq!(MemoryPressure::from_utilization(0.8), MemoryPressure::High);
        assert_eq!(MemoryPressure::from_utilization(0.95), MemoryPressure::Critical);
    }

    #[test]
    fn test_pressure_from_usage() {
        assert_eq!(MemoryPressure::from_usage(0, 100), MemoryPressure::Low);
        assert_eq!(MemoryPressure::from_usage(100, 100), MemoryPressure::Critical);
        assert_eq!(MemoryPressure::from_usage(0, 0), MemoryPressure::Critical);
    }

    #[test]
    fn test_ordering() {
        assert!(MemoryPressure::Low < MemoryPressure::Critical);
        assert!(MemoryPressure::High > MemoryPressure::Moderate);
    }
}
