//! Coarse tissue classification from contact force

use serde::{Deserialize, Serialize};

use telesurg_core::TissueType;

/// Upper force bound of each class, N
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TissueThresholds {
    /// Below this there is no contact
    pub contact: f32,
    pub soft_tissue: f32,
    pub vessel: f32,
    pub tumor: f32,
}

impl Default for TissueThresholds {
    fn default() -> Self {
        TissueThresholds {
            contact: 0.1,
            soft_tissue: 2.0,
            vessel: 5.0,
            tumor: 8.0,
        }
    }
}

impl TissueThresholds {
    pub fn classify(&self, force_n: f32) -> Option<TissueType> {
        let f = force_n.abs();
        if !f.is_finite() || f < self.contact {
            None
        } else if f < self.soft_tissue {
            Some(TissueType::SoftTissue)
        } else if f < self.vessel {
            Some(TissueType::Vessel)
        } else if f < self.tumor {
            Some(TissueType::Tumor)
        } else {
            Some(TissueType::Bone)
        }
    }
}
