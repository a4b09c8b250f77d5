//! PID position controller
//!
//! Output is a velocity request for the actuator; position error in, rate out.

use serde::{Deserialize, Serialize};

/// Controller gains
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    /// Anti-windup clamp on the integral term (in error·s)
    pub integral_limit: f32,
}

impl Default for PidGains {
    fn default() -> Self {
        PidGains {
            kp: 40.0,
            ki: 2.0,
            kd: 0.05,
            integral_limit: 10.0,
        }
    }
}

impl PidGains {
    /// Stiff gains for the jaw, which sees large set-point jumps
    pub fn jaw() -> Self {
        PidGains {
            kp: 60.0,
            ki: 0.0,
            kd: 0.0,
            integral_limit: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PidController {
    gains: PidGains,
    integral: f32,
    prev_error: Option<f32>,
}

impl PidController {
    pub fn new(gains: PidGains) -> Self {
        PidController {
            gains,
            integral: 0.0,
            prev_error: None,
        }
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    /// One control step
    pub fn step(&mut self, target: f32, measured: f32, dt: f32) -> f32 {
        let error = target - measured;
        if dt <= 0.0 || !error.is_finite() {
            return 0.0;
        }

        let limit = self.gains.integral_limit;
        self.integral = (self.integral + error * dt).clamp(-limit, limit);

        // No derivative kick on the first step
        let derivative = match self.prev_error {
            Some(prev) => (error - prev) / dt,
            None => 0.0,
        };
        self.prev_error = Some(error);

        self.gains.kp * error + self.gains.ki * self.integral + self.gains.kd * derivative
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = None;
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }
}
