//! Minimum model quality per complexity class.

use crate::core::Complexity;
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};

fn default_simple() -> f64 {
    0.3
}

fn default_medium() -> f64 {
    0.55
}

fn default_complex() -> f64 {
    0.7
}

/// Quality floor for each complexity class.
///
/// Must satisfy `simple <= medium <= complex`; checked once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// Floor for simple tasks.
    #[serde(default = "default_simple")]
    pub simple: f64,
    /// Floor for medium tasks.
    #[serde(default = "default_medium")]
    pub medium: f64,
    /// Floor for complex tasks.
    #[serde(default = "default_complex")]
    pub complex: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            simple: default_simple(),
            medium: default_medium(),
            complex: default_complex(),
        }
    }
}

impl QualityThresholds {
    /// Creates thresholds without validating them.
    #[must_use]
    pub fn new(simple: f64, medium: f64, complex: f64) -> Self {
        Self {
            simple,
            medium,
            complex,
        }
    }

    /// Returns the floor for a complexity class.
    #[must_use]
    pub fn for_complexity(&self, complexity: Complexity) -> f64 {
        match complexity {
            Complexity::Simple => self.simple,
            Complexity::Medium => self.medium,
            Complexity::Complex => self.complex,
        }
    }

    /// Checks range and ordering.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("quality_thresholds.simple", self.simple),
            ("quality_thresholds.medium", self.medium),
            ("quality_thresholds.complex", self.complex),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::invalid(field, format!("{value} is outside [0, 1]")));
            }
        }

        if self.simple > self.medium || self.medium > self.complex {
            return Err(ConfigError::NonMonotonicThresholds {
                simple: self.simple,
                medium: self.medium,
                complex: self.complex,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let thresholds = QualityThresholds::default();
        assert!(thresholds.validate().is_ok());
        assert!((thresholds.for_complexity(Complexity::Complex) - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn test_non_monotonic_rejected() {
        let err = QualityThresholds::new(0.6, 0.5, 0.7).validate().unwrap_err();
        assert!(matches!(err, ConfigError::NonMonotonicThresholds { .. }));
    }

    #[test]
    fn test_equal_thresholds_allowed() {
        assert!(QualityThresholds::new(0.5, 0.5, 0.5).validate().is_ok());
    }

    #[test]
    fn test_out_of_range_rejected() {
        let err = QualityThresholds::new(0.3, 0.5, 1.5).validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let thresholds: QualityThresholds = serde_json::from_str(r#"{"complex": 0.8}"#).unwrap();
        assert!((thresholds.simple - 0.3).abs() < f64::EPSILON);
        assert!((thresholds.complex - 0.8).abs() < f64::EPSILON);
    }
}
