//! Velocity safety supervisor

use telesurg_core::{
    AlertLevel, InstrumentConfig, InstrumentId, InstrumentState, ProximityAlert, ProximityAlerts,
    Vec3, MAX_INSTRUMENTS,
};

use crate::SafetyLimits;

/// Radius used for instruments the supervisor was not told about, mm
pub const DEFAULT_BOUNDING_RADIUS: f32 = 5.0;

/// Collision assessment for one instrument
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CollisionAssessment {
    /// 0.0 clear, 1.0 at or below minimum separation
    pub risk: f32,
    pub alerts: ProximityAlerts,
}

/// Pure velocity filter over a frozen snapshot of every instrument
#[derive(Debug, Clone)]
pub struct SafetySupervisor {
    limits: SafetyLimits,
    radii: [(InstrumentId, f32); MAX_INSTRUMENTS],
    radius_count: usize,
}

impl SafetySupervisor {
    pub fn new(limits: SafetyLimits) -> Self {
        SafetySupervisor {
            limits,
            radii: [(InstrumentId::ZERO, DEFAULT_BOUNDING_RADIUS); MAX_INSTRUMENTS],
            radius_count: 0,
        }
    }

    /// Supervisor using each instrument's configured bounding radius
    pub fn for_instruments(limits: SafetyLimits, instruments: &[InstrumentConfig]) -> Self {
        let mut supervisor = Self::new(limits);
        for config in instruments.iter().take(MAX_INSTRUMENTS) {
            supervisor.radii[supervisor.radius_count] = (config.id, config.bounding_radius_mm);
            supervisor.radius_count += 1;
        }
        supervisor
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    pub fn bounding_radius(&self, id: InstrumentId) -> f32 {
        self.radii[..self.radius_count]
            .iter()
            .find(|(rid, _)| *rid == id)
            .map_or(DEFAULT_BOUNDING_RADIUS, |(_, r)| *r)
    }

    /// Safe velocity for `instrument` given everybody's state
    ///
    /// An instrument missing from `states` gets zero velocity.
    pub fn filter_velocity(
        &self,
        states: &[InstrumentState],
        instrument: InstrumentId,
        proposed: Vec3,
        dt: f32,
    ) -> Vec3 {
        let Some(current) = states.iter().find(|s| s.instrument_id == instrument) else {
            return Vec3::ZERO;
        };

        let v = self.clamp_speed(proposed);
        let v = self.apply_workspace(current.tip_position, v, dt);
        self.apply_collision_damping(states, current, v)
    }

    /// Stage 1: scale down to the max speed, direction preserved
    pub fn clamp_speed(&self, v: Vec3) -> Vec3 {
        if !v.is_finite() {
            return Vec3::ZERO;
        }
        let speed = v.norm();
        if speed > self.limits.max_velocity {
            v * (self.limits.max_velocity / speed)
        } else {
            v
        }
    }

    /// Stage 2: per-axis hard stop at the bound, quadratic damping in the soft zone
    ///
    /// Motion back toward the center is never damped.
    pub fn apply_workspace(&self, position: Vec3, v: Vec3, dt: f32) -> Vec3 {
        let bound = self.limits.workspace_bound;
        let zone = self.limits.soft_zone;
        let mut out = v;

        for axis in 0..3 {
            let p = position.axis(axis);
            let vi = v.axis(axis);
            let outward = vi * p > 0.0;
            if !outward {
                continue;
            }

            let projected = p + vi * dt;
            if projected.abs() > bound {
                out.set_axis(axis, 0.0);
                continue;
            }

            let penetration = p.abs() - (bound - zone);
            if penetration > 0.0 {
                let factor = (1.0 - penetration / zone).clamp(0.0, 1.0);
                out.set_axis(axis, vi * factor * factor);
            }
        }
        out
    }

    /// Stage 3: stop below the minimum separation, damp linearly in the band
    /// while closing
    pub fn apply_collision_damping(&self, states: &[InstrumentState], current: &InstrumentState, v: Vec3) -> Vec3 {
        let min = self.limits.minimum_distance;
        let band = self.limits.damping_distance;
        let own_radius = self.bounding_radius(current.instrument_id);
        let mut out = v;

        for other in states.iter().filter(|s| s.instrument_id != current.instrument_id) {
            let offset = other.tip_position - current.tip_position;
            let separation = offset.norm() - own_radius - self.bounding_radius(other.instrument_id);

            if separation < min {
                return Vec3::ZERO;
            }
            if separation < min + band {
                let closing = out.dot(offset.normalized());
                if closing > 0.0 {
                    out = out * ((separation - min) / band).clamp(0.0, 1.0);
                }
            }
        }
        out
    }

    /// Collision risk and proximity alerts for `instrument`
    pub fn assess(&self, states: &[InstrumentState], instrument: InstrumentId) -> CollisionAssessment {
        let mut assessment = CollisionAssessment::default();
        let Some(current) = states.iter().find(|s| s.instrument_id == instrument) else {
            return assessment;
        };

        let min = self.limits.minimum_distance;
        let band = self.limits.damping_distance;
        let own_radius = self.bounding_radius(instrument);

        for other in states.iter().filter(|s| s.instrument_id != instrument) {
            let separation = current.tip_position.distance(other.tip_position)
                - own_radius
                - self.bounding_radius(other.instrument_id);

            let (risk, level) = if separation < min {
                (1.0, Some(AlertLevel::Critical))
            } else if separation < min + band {
                (1.0 - (separation - min) / band, Some(AlertLevel::Caution))
            } else {
                (0.0, None)
            };

            assessment.risk = assessment.risk.max(risk);
            if let Some(level) = level {
                assessment.alerts.push(ProximityAlert {
                    other: other.instrument_id,
                    separation_mm: separation,
                    level,
                });
            }
        }
        assessment
    }

    pub fn in_workspace(&self, position: Vec3) -> bool {
        position.max_abs() <= self.limits.workspace_bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use telesurg_core::Timestamp;

    const DT: f32 = 0.001;

    fn at(id: u32, x: f32, y: f32, z: f32) -> InstrumentState {
        InstrumentState::at_rest(InstrumentId::new(id), Vec3::new(x, y, z), Timestamp::ZERO)
    }

    fn supervisor() -> SafetySupervisor {
        SafetySupervisor::new(SafetyLimits::default())
    }

    #[test]
    fn test_speed_clamp() {
        let s = supervisor();
        let states = [at(0, 0.0, 0.0, 0.0)];
        let out = s.filter_velocity(&states, InstrumentId::new(0), Vec3::new(300.0, 400.0, 0.0), DT);
        assert!((out.norm() - 200.0).abs() < 1e-3);
        assert!((out.x - 120.0).abs() < 1e-3);
        assert!((out.y - 160.0).abs() < 1e-3);
    }

    #[test]
    fn test_soft_zone_damping() {
        let s = SafetySupervisor::new(SafetyLimits::symmetric(100.0));
        let states = [at(0, 85.0, 0.0, 0.0)];
        let out = s.filter_velocity(&states, InstrumentId::new(0), Vec3::new(50.0, 0.0, 0.0), DT);
        // (1 - 15/30)² = 0.25
        assert!((out.x - 12.5).abs() < 1e-4, "got {}", out.x);
    }

    #[test]
    fn test_soft_zone_ignores_inward_motion() {
        let s = SafetySupervisor::new(SafetyLimits::symmetric(100.0));
        let states = [at(0, 85.0, -90.0, 0.0)];
        let out = s.filter_velocity(&states, InstrumentId::new(0), Vec3::new(-50.0, 20.0, 0.0), DT);
        assert_eq!(out, Vec3::new(-50.0, 20.0, 0.0));
    }

    #[test]
    fn test_hard_stop_at_bound() {
        let s = SafetySupervisor::new(SafetyLimits::symmetric(100.0));
        let states = [at(0, 99.95, 0.0, 0.0)];
        let out = s.filter_velocity(&states, InstrumentId::new(0), Vec3::new(100.0, 0.0, 5.0), DT);
        assert_eq!(out.x, 0.0);
        assert_eq!(out.z, 5.0);
    }

    #[test]
    fn test_collision_stop_below_minimum() {
        let s = supervisor();
        // centers 20 mm apart, radii 5 + 5: separation 10 < 15
        let states = [at(0, 0.0, 0.0, 0.0), at(1, 20.0, 0.0, 0.0)];
        let out = s.filter_velocity(&states, InstrumentId::new(0), Vec3::new(0.0, 10.0, 0.0), DT);
        assert_eq!(out, Vec3::ZERO);
    }

    #[test]
    fn test_collision_band_damps_only_when_closing() {
        let s = supervisor();
        // separation 40 - 10 = 30: 15 into the 25 mm band
        let states = [at(0, 0.0, 0.0, 0.0), at(1, 40.0, 0.0, 0.0)];
        let id = InstrumentId::new(0);

        let closing = s.filter_velocity(&states, id, Vec3::new(10.0, 0.0, 0.0), DT);
        assert!((closing.x - 6.0).abs() < 1e-4, "got {}", closing.x);

        let retreating = s.filter_velocity(&states, id, Vec3::new(-10.0, 0.0, 0.0), DT);
        assert_eq!(retreating, Vec3::new(-10.0, 0.0, 0.0));
    }

    #[test]
    fn test_assessment() {
        let s = supervisor();
        let states = [at(0, 0.0, 0.0, 0.0), at(1, 40.0, 0.0, 0.0), at(2, 0.0, 20.0, 0.0)];
        let a = s.assess(&states, InstrumentId::new(0));
        assert_eq!(a.risk, 1.0);
        assert_eq!(a.alerts.len(), 2);
        assert_eq!(a.alerts.most_severe(), Some(AlertLevel::Critical));

        let clear = s.assess(&[at(0, 0.0, 0.0, 0.0), at(1, 100.0, 0.0, 0.0)], InstrumentId::new(0));
        assert_eq!(clear.risk, 0.0);
        assert!(clear.alerts.is_empty());
    }

    #[test]
    fn test_configured_radii() {
        let mut a = InstrumentConfig::default();
        a.id = InstrumentId::new(0);
        a.bounding_radius_mm = 12.0;
        let s = SafetySupervisor::for_instruments(SafetyLimits::default(), &[a]);
        assert_eq!(s.bounding_radius(InstrumentId::new(0)), 12.0);
        assert_eq!(s.bounding_radius(InstrumentId::new(7)), DEFAULT_BOUNDING_RADIUS);
    }

    #[test]
    fn test_unknown_instrument_gets_zero() {
        let s = supervisor();
        let out = s.filter_velocity(&[], InstrumentId::new(0), Vec3::new(1.0, 0.0, 0.0), DT);
        assert_eq!(out, Vec3::ZERO);
    }

    fn coord() -> impl Strategy<Value = f32> {
        -160.0f32..160.0
    }

    fn velocity() -> impl Strategy<Value = Vec3> {
        (-1000.0f32..1000.0, -1000.0f32..1000.0, -1000.0f32..1000.0).prop_map(|(x, y, z)| Vec3::new(x, y, z))
    }

    proptest! {
        #[test]
        fn prop_never_increases_speed(
            a in (coord(), coord(), coord()),
            b in (coord(), coord(), coord()),
            v in velocity(),
        ) {
            let s = supervisor();
            let states = [at(0, a.0, a.1, a.2), at(1, b.0, b.1, b.2)];
            let out = s.filter_velocity(&states, InstrumentId::new(0), v, DT);
            prop_assert!(out.norm() <= v.norm() + 1e-3);
        }

        #[test]
        fn prop_speed_clamp_preserves_direction(v in velocity()) {
            prop_assume!(v.norm() > 200.0);
            let s = supervisor();
            let states = [at(0, 0.0, 0.0, 0.0)];
            let out = s.filter_velocity(&states, InstrumentId::new(0), v, DT);
            prop_assert!((out.norm() - 200.0).abs() < 1e-2);
            prop_assert!(out.normalized().dot(v.normalized()) > 0.9999);
        }

        #[test]
        fn prop_retreat_never_damped_by_collision(
            gap in 25.0f32..60.0,
            v in velocity(),
        ) {
            let s = supervisor();
            let states = [at(0, 0.0, 0.0, 0.0), at(1, gap, 0.0, 0.0)];
            prop_assume!(v.x <= 0.0);
            let out = s.filter_velocity(&states, InstrumentId::new(0), v, DT);
            prop_assert_eq!(out, s.clamp_speed(v));
        }
    }
}
