use serde::{Deserialize, Serialize};

use telesurg_core::{TeleopError, TeleopResult};

/// Safety filter limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLimits {
    /// mm/s
    pub max_velocity: f32,
    /// Absolute per-axis bound, mm
    pub workspace_bound: f32,
    /// Soft zone width inside the bound, mm
    pub soft_zone: f32,
    /// Surface separation below which motion stops, mm
    pub minimum_distance: f32,
    /// Damping band above the minimum distance, mm
    pub damping_distance: f32,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        SafetyLimits {
            max_velocity: 200.0,
            workspace_bound: 150.0,
            soft_zone: 30.0,
            minimum_distance: 15.0,
            damping_distance: 25.0,
        }
    }
}

impl SafetyLimits {
    /// Defaults with a different workspace bound
    pub fn symmetric(workspace_bound: f32) -> Self {
        SafetyLimits {
            workspace_bound,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> TeleopResult<()> {
        let positive = [
            ("max_velocity", self.max_velocity),
            ("workspace_bound", self.workspace_bound),
            ("soft_zone", self.soft_zone),
            ("damping_distance", self.damping_distance),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(TeleopError::InvalidConfig(format!("{} must be positive, got {}", name, value)));
            }
        }
        if !(self.minimum_distance.is_finite() && self.minimum_distance >= 0.0) {
            return Err(TeleopError::InvalidConfig("minimum_distance must be non-negative".into()));
        }
        if self.soft_zone > self.workspace_bound {
            return Err(TeleopError::InvalidConfig(format!(
                "soft zone {} wider than workspace bound {}",
                self.soft_zone, self.workspace_bound
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        assert!(SafetyLimits::default().validate().is_ok());
        assert_eq!(SafetyLimits::symmetric(100.0).workspace_bound, 100.0);
    }

    #[test]
    fn test_rejects_bad_limits() {
        let limits = SafetyLimits {
            soft_zone: 200.0,
            ..Default::default()
        };
        assert!(limits.validate().is_err());

        let limits = SafetyLimits {
            max_velocity: 0.0,
            ..Default::default()
        };
        assert!(limits.validate().is_err());
    }
}
