//! Session configuration
//!
//! Everything a session needs at construction, loadable from JSON. Omitted
//! sections keep their defaults. Settings that several components must agree
//! on (tick period, workspace bound) live in one place and are derived from
//! there.

use std::path::Path;

use serde::{Deserialize, Serialize};

use telesurg_core::{RobotConfiguration, StreamingParameters, TeleopError, TeleopResult};
use telesurg_instrument::{ControllerSettings, TissueThresholds};
use telesurg_predict::PredictionConfig;
use telesurg_safety::SafetyLimits;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub robot: RobotConfiguration,
    pub streaming: StreamingParameters,
    pub safety: SafetyLimits,
    pub tissue: TissueThresholds,
    /// Overrides the predictor derived from `streaming`
    pub prediction: Option<PredictionConfig>,
}

impl SessionConfig {
    /// Three arms over a long-haul link
    pub fn long_distance() -> Self {
        SessionConfig {
            robot: RobotConfiguration::three_arm(),
            streaming: StreamingParameters::long_distance(),
            ..Default::default()
        }
    }

    /// Parse and validate
    pub fn from_json_str(json: &str) -> TeleopResult<Self> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> TeleopResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| TeleopError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn to_json_pretty(&self) -> TeleopResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> TeleopResult<()> {
        self.robot.validate()?;
        self.streaming.validate()?;
        self.safety.validate()?;

        for inst in &self.robot.instruments {
            if inst.home_position.max_abs() > self.safety.workspace_bound {
                return Err(TeleopError::InvalidConfig(format!(
                    "{} home position {:?} outside the {} mm workspace",
                    inst.id, inst.home_position, self.safety.workspace_bound
                )));
            }
        }
        if let Some(prediction) = &self.prediction {
            if prediction.lead_time_ms < 0.0 || prediction.polynomial_degree > 3 {
                return Err(TeleopError::InvalidConfig(
                    "prediction lead time must be >= 0 and degree <= 3".into(),
                ));
            }
        }
        Ok(())
    }

    /// Controller settings sharing the tick period and workspace bound
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            workspace_bound_mm: self.safety.workspace_bound,
            tick_period: self.robot.tick_period(),
            tissue: self.tissue,
        }
    }

    pub fn prediction_config(&self) -> PredictionConfig {
        let mut config = self
            .prediction
            .unwrap_or_else(|| PredictionConfig::from_streaming(&self.streaming));
        config.validator.workspace_bound_mm = self.safety.workspace_bound;
        config
    }
}
